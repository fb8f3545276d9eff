#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{error, trace, warn};

/// This is an abstraction for sending a datagram on a UDP socket, introduced to facilitate mocking
///  the I/O part away for testing.
///
/// Sending is synchronous and non-blocking: it is called from inside the ARQ engine's output
///  path, which cannot await. A datagram that cannot be sent right away is dropped - the ARQ
///  engine retransmits whatever it still needs.
#[cfg_attr(test, automock)]
pub trait DatagramSocket: Send + Sync + 'static {
    fn send_datagram(&self, to: SocketAddr, buf: &[u8]);

    fn local_addr(&self) -> SocketAddr;
}

impl DatagramSocket for Arc<UdpSocket> {
    fn send_datagram(&self, to: SocketAddr, buf: &[u8]) {
        trace!("UDP socket: sending {} bytes to {:?}", buf.len(), to);

        match self.try_send_to(buf, to) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                warn!("UDP send buffer full, dropping datagram to {:?}", to);
            }
            Err(e) => {
                error!("error sending UDP packet to {:?}: {}", to, e);
            }
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.as_ref().local_addr()
            .expect("UdpSocket should have an initialized local addr")
    }
}
