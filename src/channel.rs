use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};
use crate::arq::{ArqEngine, ArqEngineFactory, DatagramOutput, NoDelayProfile};
use crate::config::EffectiveChannelConfig;
use crate::error::ChannelError;
use crate::packet_parser::PacketParser;
use crate::safe_converter::PrecheckedCast;
use crate::scheduler::UpdateScheduler;
use crate::send_socket::DatagramSocket;
use crate::wire::{HandshakePacket, MAX_FRAME_LEN};

pub type ReceiveResult = Result<Bytes, ChannelError>;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    /// terminal - set when the channel is disposed
    Disconnected,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChannelRole {
    Initiator,
    Acceptor,
}

/// A channel is one virtual connection to a peer: it performs the handshake, owns the ARQ engine
///  once the handshake is through, detects inactivity, and turns the engine's reliable byte stream
///  into discrete packets.
///
/// All methods are called from the owning service's turn. Everything that needs to happen later
///  is requested through the [UpdateScheduler] that is passed in.
pub struct Channel {
    id: u32,
    role: ChannelRole,
    local_conn_id: u32,
    remote_conn_id: u32,
    remote_addr: SocketAddr,
    state: ConnectionState,
    config: Arc<EffectiveChannelConfig>,
    socket: Arc<dyn DatagramSocket>,
    engine: Option<Box<dyn ArqEngine>>,
    engine_factory: Arc<dyn ArqEngineFactory>,
    /// engine segments that were sent before the handshake completed
    pending_outbound: VecDeque<Bytes>,
    last_activity: u64,
    parser: PacketParser,
    pending_receive: Option<oneshot::Sender<ReceiveResult>>,
    recv_buf: Vec<u8>,
}

impl Channel {
    /// Creates the initiating side of a connection and starts the handshake
    #[allow(clippy::too_many_arguments)]
    pub fn connect(
        id: u32,
        local_conn_id: u32,
        remote_addr: SocketAddr,
        config: Arc<EffectiveChannelConfig>,
        socket: Arc<dyn DatagramSocket>,
        engine_factory: Arc<dyn ArqEngineFactory>,
        scheduler: &mut dyn UpdateScheduler,
    ) -> Channel {
        let now = scheduler.time_now();
        let channel = Channel {
            id,
            role: ChannelRole::Initiator,
            local_conn_id,
            remote_conn_id: 0,
            remote_addr,
            state: ConnectionState::Connecting,
            config,
            socket,
            engine: None,
            engine_factory,
            pending_outbound: VecDeque::new(),
            last_activity: now,
            parser: PacketParser::new(),
            pending_receive: None,
            recv_buf: Vec::new(),
        };

        info!("channel {}: connecting to {:?} with conn id {}", id, remote_addr, local_conn_id);
        channel.send_syn();
        scheduler.add_to_next_time_update(now + channel.config.handshake_retry_millis, id);
        channel
    }

    /// Creates the accepting side of a connection after a SYN was received. The channel is
    ///  connected right away; the ACK is sent by [Channel::on_handshake] for the SYN.
    #[allow(clippy::too_many_arguments)]
    pub fn accept(
        id: u32,
        local_conn_id: u32,
        remote_conn_id: u32,
        remote_addr: SocketAddr,
        config: Arc<EffectiveChannelConfig>,
        socket: Arc<dyn DatagramSocket>,
        engine_factory: Arc<dyn ArqEngineFactory>,
        scheduler: &mut dyn UpdateScheduler,
    ) -> Result<Channel, ChannelError> {
        let mut channel = Channel {
            id,
            role: ChannelRole::Acceptor,
            local_conn_id,
            remote_conn_id,
            remote_addr,
            state: ConnectionState::Connected,
            config,
            socket,
            engine: None,
            engine_factory,
            pending_outbound: VecDeque::new(),
            last_activity: scheduler.time_now(),
            parser: PacketParser::new(),
            pending_receive: None,
            recv_buf: Vec::new(),
        };
        channel.engine = Some(channel.create_engine()?);

        info!("channel {}: accepted connection {} from {:?}", id, remote_conn_id, remote_addr);
        scheduler.add_to_update(id);
        Ok(channel)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn role(&self) -> ChannelRole {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn local_conn_id(&self) -> u32 {
        self.local_conn_id
    }

    pub fn remote_conn_id(&self) -> u32 {
        self.remote_conn_id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn last_activity(&self) -> u64 {
        self.last_activity
    }

    pub fn pending_outbound_len(&self) -> usize {
        self.pending_outbound.len()
    }

    pub fn is_disposed(&self) -> bool {
        self.state == ConnectionState::Disconnected
    }

    /// The conversation id of the ARQ engine. Both sides use the acceptor's conn id, which
    ///  is what the initiator learns from the ACK.
    pub fn conv(&self) -> u32 {
        match self.role {
            ChannelRole::Initiator => self.remote_conn_id,
            ChannelRole::Acceptor => self.local_conn_id,
        }
    }

    fn create_engine(&self) -> Result<Box<dyn ArqEngine>, ChannelError> {
        let output = DatagramOutput::new(self.socket.clone(), self.remote_addr);
        let mut engine = self.engine_factory.create(self.conv(), output)
            .map_err(ChannelError::Arq)?;
        engine.set_mtu(self.config.mtu)
            .map_err(ChannelError::Arq)?;
        engine.set_no_delay(NoDelayProfile::LOW_LATENCY);
        Ok(engine)
    }

    fn send_syn(&self) {
        trace!("channel {}: sending SYN to {:?}", self.id, self.remote_addr);
        let syn = HandshakePacket::Syn { local_conn_id: self.local_conn_id }.to_bytes();
        self.socket.send_datagram(self.remote_addr, &syn);
    }

    fn send_ack(&self) {
        trace!("channel {}: sending ACK to {:?}", self.id, self.remote_addr);
        let ack = HandshakePacket::Ack {
            request_conn_id: self.remote_conn_id,
            acceptor_conn_id: self.local_conn_id,
        }.to_bytes();
        self.socket.send_datagram(self.remote_addr, &ack);
    }

    fn ensure_live(&self) -> Result<(), ChannelError> {
        if self.is_disposed() {
            return Err(ChannelError::Disposed);
        }
        Ok(())
    }

    /// Handles a handshake packet from this channel's peer. SYNs are (re-)acknowledged by the
    ///  acceptor, a matching ACK completes the initiator's handshake. Everything else is
    ///  stale or spoofed and ignored.
    pub fn on_handshake(&mut self, packet: HandshakePacket, scheduler: &mut dyn UpdateScheduler) -> Result<(), ChannelError> {
        self.ensure_live()?;

        match (self.role, packet) {
            (ChannelRole::Acceptor, HandshakePacket::Syn { local_conn_id }) if local_conn_id == self.remote_conn_id => {
                self.send_ack();
            }
            (ChannelRole::Initiator, HandshakePacket::Ack { request_conn_id, acceptor_conn_id })
                if request_conn_id == self.local_conn_id && self.state == ConnectionState::Connecting =>
            {
                self.on_connected(acceptor_conn_id, scheduler)?;
            }
            _ => {
                debug!("channel {}: ignoring handshake packet {:?} in state {:?}", self.id, packet, self.state);
            }
        }
        Ok(())
    }

    fn on_connected(&mut self, remote_conn_id: u32, scheduler: &mut dyn UpdateScheduler) -> Result<(), ChannelError> {
        self.remote_conn_id = remote_conn_id;
        let mut engine = self.create_engine()?;

        debug!("channel {}: connected, flushing {} buffered segments", self.id, self.pending_outbound.len());
        for segment in self.pending_outbound.drain(..) {
            engine.send(&segment)
                .map_err(ChannelError::Arq)?;
        }

        self.engine = Some(engine);
        self.state = ConnectionState::Connected;
        self.last_activity = scheduler.time_now();
        info!("channel {}: connected to {:?}, remote conn id {}", self.id, self.remote_addr, remote_conn_id);

        scheduler.add_to_update(self.id);
        Ok(())
    }

    /// Called by the scheduler whenever this channel's wake time has come. An error is terminal,
    ///  and the channel should be disposed.
    pub fn update(&mut self, scheduler: &mut dyn UpdateScheduler) -> Result<(), ChannelError> {
        self.ensure_live()?;
        let now = scheduler.time_now();

        if self.state == ConnectionState::Connecting {
            self.send_syn();
            scheduler.add_to_next_time_update(now + self.config.handshake_retry_millis, self.id);
            return Ok(());
        }

        let idle_millis = now.saturating_sub(self.last_activity);
        if idle_millis > self.config.inactivity_timeout_millis {
            warn!("channel {}: no datagram from {:?} for {} ms - timing out", self.id, self.remote_addr, idle_millis);
            return Err(ChannelError::Timeout { idle_millis });
        }

        let Some(engine) = self.engine.as_mut() else {
            return Err(ChannelError::Disposed);
        };

        // the engine runs on a wrapping 32 bit clock
        let now_u32 = now as u32;
        engine.update(now_u32)
            .map_err(ChannelError::Arq)?;
        let next_u32 = engine.check(now_u32);
        let delay = next_u32.wrapping_sub(now_u32);
        let delay = if delay > u32::MAX / 2 { 0 } else { delay as u64 };

        scheduler.add_to_next_time_update(now + delay, self.id);
        Ok(())
    }

    fn check_segment_len(&self, len: usize) -> Result<(), ChannelError> {
        let max = self.engine_factory.max_message_len(self.config.mtu);
        if len > max {
            return Err(ChannelError::PacketTooLarge { len, max });
        }
        Ok(())
    }

    /// Sends bytes that already are stream-framed, without adding a length prefix
    pub fn send_raw(&mut self, packet: Bytes, scheduler: &mut dyn UpdateScheduler) -> Result<(), ChannelError> {
        self.ensure_live()?;
        self.check_segment_len(packet.len())?;
        self.send_segment(packet, scheduler)
    }

    /// Sends a single packet made up of several fragments. A two byte little-endian length
    ///  prefix with the total length is sent as a fragment of its own ahead of them.
    ///
    /// Sizes are checked before anything is handed to the engine. If the engine still fails
    ///  after part of the packet went in, the stream is out of sync and the returned
    ///  [ChannelError::Arq] is fatal.
    pub fn send_fragments(&mut self, fragments: &[&[u8]], scheduler: &mut dyn UpdateScheduler) -> Result<(), ChannelError> {
        self.ensure_live()?;

        let total_len: usize = fragments.iter()
            .map(|f| f.len())
            .sum();
        if total_len > MAX_FRAME_LEN {
            return Err(ChannelError::PacketTooLarge { len: total_len, max: MAX_FRAME_LEN });
        }
        for fragment in fragments {
            self.check_segment_len(fragment.len())?;
        }

        let prefix: u16 = total_len.prechecked_cast();
        let prefix = prefix.to_le_bytes();
        self.send_segment(Bytes::copy_from_slice(&prefix), scheduler)?;
        for fragment in fragments {
            if !fragment.is_empty() {
                self.send_segment(Bytes::copy_from_slice(fragment), scheduler)?;
            }
        }
        Ok(())
    }

    fn send_segment(&mut self, segment: Bytes, scheduler: &mut dyn UpdateScheduler) -> Result<(), ChannelError> {
        match (self.state, self.engine.as_mut()) {
            (ConnectionState::Connected, Some(engine)) => {
                engine.send(&segment)
                    .map_err(ChannelError::Arq)?;
                scheduler.add_to_update(self.id);
                Ok(())
            }
            (ConnectionState::Connecting, _) => {
                trace!("channel {}: not connected yet, buffering {} bytes", self.id, segment.len());
                self.pending_outbound.push_back(segment);
                Ok(())
            }
            _ => Err(ChannelError::Disposed),
        }
    }

    /// Handles an ARQ segment datagram from the peer. An error is terminal, and the channel
    ///  should be disposed.
    pub fn handle_recv(&mut self, datagram: &[u8], scheduler: &mut dyn UpdateScheduler) -> Result<(), ChannelError> {
        self.ensure_live()?;

        let Some(engine) = self.engine.as_mut() else {
            debug!("channel {}: received segment before the handshake completed - dropping", self.id);
            return Ok(());
        };

        if let Err(e) = engine.input(datagram) {
            debug!("channel {}: ARQ engine rejected datagram from {:?}, dropping: {}", self.id, self.remote_addr, e);
            return Ok(());
        }

        self.last_activity = scheduler.time_now();
        scheduler.add_to_update(self.id);

        while let Some(size) = engine.peek_size() {
            if size == 0 {
                warn!("channel {}: ARQ engine announced an empty segment - resetting", self.id);
                return Err(ChannelError::Reset);
            }

            self.recv_buf.resize(size, 0);
            match engine.recv(&mut self.recv_buf) {
                Ok(num_read) if num_read == size => {
                    trace!("channel {}: received segment of {} bytes", self.id, num_read);
                    self.parser.append(&self.recv_buf[..num_read]);
                }
                Ok(num_read) => {
                    warn!("channel {}: ARQ engine returned {} bytes for a segment of {} - resetting", self.id, num_read, size);
                    return Err(ChannelError::Reset);
                }
                Err(e) => {
                    warn!("channel {}: ARQ engine failed to return an announced segment - resetting: {}", self.id, e);
                    return Err(ChannelError::Reset);
                }
            }
        }

        self.resolve_pending_receive();
        Ok(())
    }

    /// Requests the next packet. If a packet is buffered already, the returned receiver is
    ///  resolved right away, otherwise when the next packet is complete. There can be only one
    ///  pending receive per channel.
    pub fn recv(&mut self) -> Result<oneshot::Receiver<ReceiveResult>, ChannelError> {
        self.ensure_live()?;

        if let Some(pending) = &self.pending_receive {
            if !pending.is_closed() {
                return Err(ChannelError::ReceiveAlreadyPending);
            }
            // the previous receiver was dropped, so the slot is free again
            self.pending_receive = None;
        }

        let (tx, rx) = oneshot::channel();
        self.pending_receive = Some(tx);
        self.resolve_pending_receive();
        Ok(rx)
    }

    fn resolve_pending_receive(&mut self) {
        let Some(tx) = self.pending_receive.take() else {
            return;
        };
        if tx.is_closed() {
            // nobody is waiting anymore: leave the packet in the parser for the next receive
            return;
        }

        match self.parser.get_packet() {
            Some(packet) => {
                let _ = tx.send(Ok(packet));
            }
            None => {
                self.pending_receive = Some(tx);
            }
        }
    }

    /// Releases the ARQ engine and fails a pending receive. Disposing a disposed channel does
    ///  nothing.
    pub fn dispose(&mut self) {
        if self.is_disposed() {
            return;
        }

        info!("channel {}: disposing connection to {:?}", self.id, self.remote_addr);
        self.state = ConnectionState::Disconnected;
        self.engine = None;
        self.pending_outbound.clear();
        if let Some(tx) = self.pending_receive.take() {
            let _ = tx.send(Err(ChannelError::Disposed));
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.dispose();
    }
}
