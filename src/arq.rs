//! The contract between a channel and the ARQ engine that provides reliable, ordered delivery
//!  for it, plus an implementation based on KCP.
//!
//! The engine is a pure state machine: it never touches a socket or a clock by itself. Inbound
//!  datagrams are fed in with `input`, time advances through `update`, and everything the engine
//!  wants to put on the wire (fresh segments, retransmissions, acks) goes through the
//!  [DatagramOutput] it was created with.

use std::fmt::{Debug, Formatter};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use anyhow::anyhow;
use kcp::Kcp;
#[cfg(test)] use mockall::automock;
use crate::send_socket::DatagramSocket;

/// Retransmission tuning of an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoDelayProfile {
    pub no_delay: bool,
    /// internal update interval in ms
    pub interval: i32,
    /// number of duplicate acks that trigger a fast retransmit, 0 for none
    pub fast_resend: i32,
    pub no_congestion_control: bool,
}

impl NoDelayProfile {
    pub const LOW_LATENCY: NoDelayProfile = NoDelayProfile {
        no_delay: true,
        interval: 10,
        fast_resend: 2,
        no_congestion_control: true,
    };
}

#[cfg_attr(test, automock)]
pub trait ArqEngine: Send {
    /// feeds a single raw datagram received from the network
    fn input(&mut self, datagram: &[u8]) -> anyhow::Result<()>;

    /// enqueues a segment for reliable delivery
    fn send(&mut self, data: &[u8]) -> anyhow::Result<()>;

    /// reads the next fully reassembled segment into `buf`, which must be at least
    ///  [ArqEngine::peek_size] bytes long, and returns the number of bytes read
    fn recv(&mut self, buf: &mut [u8]) -> anyhow::Result<usize>;

    /// the size of the next fully reassembled segment, or `None` if there is none
    fn peek_size(&self) -> Option<usize>;

    /// advances internal timers, triggering due (re)transmissions
    fn update(&mut self, now: u32) -> anyhow::Result<()>;

    /// the timestamp at which [ArqEngine::update] should be called next
    fn check(&self, now: u32) -> u32;

    fn set_mtu(&mut self, mtu: usize) -> anyhow::Result<()>;

    fn set_no_delay(&mut self, profile: NoDelayProfile);
}

#[cfg_attr(test, automock)]
pub trait ArqEngineFactory: Send + Sync + 'static {
    fn create(&self, conv: u32, output: DatagramOutput) -> anyhow::Result<Box<dyn ArqEngine>>;

    /// The largest segment an engine with the given MTU accepts in a single [ArqEngine::send].
    ///  Channels check against this before handing anything to the engine, so a packet is
    ///  either sent completely or not at all.
    fn max_message_len(&self, mtu: usize) -> usize;
}

/// The engine's only path to the network: every write is sent as one datagram to the channel's
///  remote address
pub struct DatagramOutput {
    socket: Arc<dyn DatagramSocket>,
    remote_addr: SocketAddr,
}

impl DatagramOutput {
    pub fn new(socket: Arc<dyn DatagramSocket>, remote_addr: SocketAddr) -> DatagramOutput {
        DatagramOutput { socket, remote_addr }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}

impl Debug for DatagramOutput {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "DatagramOutput({:?})", self.remote_addr)
    }
}

impl io::Write for DatagramOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.socket.send_datagram(self.remote_addr, buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// size of KCP's segment header
pub const KCP_OVERHEAD: usize = 24;

/// KCP rejects messages that need more fragments than this
pub const KCP_MAX_FRAGMENTS: usize = 127;

fn kcp_error<E: Debug>(e: E) -> anyhow::Error {
    anyhow!("kcp: {:?}", e)
}

pub struct KcpEngine {
    kcp: Kcp<DatagramOutput>,
}

impl KcpEngine {
    pub fn new(conv: u32, output: DatagramOutput, window_size: u16) -> KcpEngine {
        let mut kcp = Kcp::new(conv, output);
        kcp.set_wndsize(window_size, window_size);
        KcpEngine { kcp }
    }
}

impl ArqEngine for KcpEngine {
    fn input(&mut self, datagram: &[u8]) -> anyhow::Result<()> {
        self.kcp.input(datagram)
            .map(|_| ())
            .map_err(kcp_error)
    }

    fn send(&mut self, data: &[u8]) -> anyhow::Result<()> {
        self.kcp.send(data)
            .map(|_| ())
            .map_err(kcp_error)
    }

    fn recv(&mut self, buf: &mut [u8]) -> anyhow::Result<usize> {
        self.kcp.recv(buf)
            .map_err(kcp_error)
    }

    fn peek_size(&self) -> Option<usize> {
        // the error cases are 'queue empty' and 'message not fully reassembled yet'
        self.kcp.peeksize().ok()
    }

    fn update(&mut self, now: u32) -> anyhow::Result<()> {
        self.kcp.update(now)
            .map_err(kcp_error)
    }

    fn check(&self, now: u32) -> u32 {
        // kcp returns the delay, not the timestamp
        now.wrapping_add(self.kcp.check(now))
    }

    fn set_mtu(&mut self, mtu: usize) -> anyhow::Result<()> {
        self.kcp.set_mtu(mtu)
            .map_err(kcp_error)
    }

    fn set_no_delay(&mut self, profile: NoDelayProfile) {
        self.kcp.set_nodelay(profile.no_delay, profile.interval, profile.fast_resend, profile.no_congestion_control);
    }
}

pub struct KcpEngineFactory {
    window_size: u16,
}

impl KcpEngineFactory {
    pub fn new(window_size: u16) -> KcpEngineFactory {
        KcpEngineFactory { window_size }
    }
}

impl ArqEngineFactory for KcpEngineFactory {
    fn create(&self, conv: u32, output: DatagramOutput) -> anyhow::Result<Box<dyn ArqEngine>> {
        Ok(Box::new(KcpEngine::new(conv, output, self.window_size)))
    }

    fn max_message_len(&self, mtu: usize) -> usize {
        mtu.saturating_sub(KCP_OVERHEAD) * KCP_MAX_FRAGMENTS
    }
}
