use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::Arc;
use anyhow::bail;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};
use crate::arq::{ArqEngineFactory, KcpEngineFactory};
use crate::channel::{Channel, ConnectionState};
use crate::compression::Compressor;
use crate::config::{EffectiveChannelConfig, RpcConfig};
use crate::error::{RpcError, SessionError};
use crate::message::{MessageDispatcher, Protocol};
use crate::rpc::{CancelSignal, PendingCall, RpcResponse, RpcResult};
use crate::scheduler::UpdateQueue;
use crate::send_socket::DatagramSocket;
use crate::session::Session;
use crate::wire::{classify_datagram, DatagramKind, HandshakePacket};

const MAX_DATAGRAM_LEN: usize = 65536;

/// Requests from application code to the service task
pub enum ServiceCommand<M> {
    Connect { addr: SocketAddr, reply: oneshot::Sender<anyhow::Result<u32>> },
    Send { session_id: u32, message: M },
    Call { session_id: u32, request: M, reply: oneshot::Sender<RpcResult<M>>, cancel: Option<CancelSignal> },
    Close { session_id: u32 },
    Shutdown,
}

/// A cloneable handle for talking to a [NetworkService] from other tasks
pub struct ServiceHandle<M> {
    commands: mpsc::UnboundedSender<ServiceCommand<M>>,
}

impl<M> Clone for ServiceHandle<M> {
    fn clone(&self) -> Self {
        ServiceHandle { commands: self.commands.clone() }
    }
}

impl<M: Send + 'static> ServiceHandle<M> {
    fn command(&self, command: ServiceCommand<M>) -> anyhow::Result<()> {
        if self.commands.send(command).is_err() {
            bail!("network service is shut down");
        }
        Ok(())
    }

    /// starts a connection, returning the new session's id
    pub async fn connect(&self, addr: SocketAddr) -> anyhow::Result<u32> {
        let (reply, rx) = oneshot::channel();
        self.command(ServiceCommand::Connect { addr, reply })?;
        rx.await?
    }

    /// Queues a message for sending. Failures after queueing are logged by the service.
    pub fn send(&self, session_id: u32, message: M) -> anyhow::Result<()> {
        self.command(ServiceCommand::Send { session_id, message })
    }

    pub fn call<R>(&self, session_id: u32, request: M) -> RpcResponse<M, R> {
        self.call_inner(session_id, request, None)
    }

    pub fn call_cancellable<R>(&self, session_id: u32, request: M, cancel: CancelSignal) -> RpcResponse<M, R> {
        self.call_inner(session_id, request, Some(cancel))
    }

    fn call_inner<R>(&self, session_id: u32, request: M, cancel: Option<CancelSignal>) -> RpcResponse<M, R> {
        let (reply, rx) = oneshot::channel();
        let response = match &cancel {
            Some(cancel) => RpcResponse::cancellable(0, rx, cancel.clone()),
            None => RpcResponse::new(0, rx),
        };
        // if the service is gone, `reply` is dropped and the response resolves as disposed
        let _ = self.command(ServiceCommand::Call { session_id, request, reply, cancel });
        response
    }

    pub fn close(&self, session_id: u32) -> anyhow::Result<()> {
        self.command(ServiceCommand::Close { session_id })
    }

    pub fn shutdown(&self) -> anyhow::Result<()> {
        self.command(ServiceCommand::Shutdown)
    }
}

/// NetworkService is where everything comes together: it owns the socket side of all sessions,
///  routes incoming datagrams to them, drives their channels' updates, and passes incoming
///  requests and events to the application's dispatcher.
///
/// All session state lives inside the service and is only touched from its own turn, either
///  by calling its methods directly (with an explicit clock, which is what tests do) or from
///  [NetworkService::run].
pub struct NetworkService<P: Protocol> {
    config: Arc<RpcConfig>,
    channel_config: Arc<EffectiveChannelConfig>,
    socket: Arc<dyn DatagramSocket>,
    engine_factory: Arc<dyn ArqEngineFactory>,
    protocol: Arc<P>,
    compressor: Arc<dyn Compressor>,
    dispatcher: Arc<dyn MessageDispatcher<P::Message>>,
    sessions: FxHashMap<u32, Session<P>>,
    /// (peer, conversation id) of established channels
    routes: FxHashMap<(SocketAddr, u32), u32>,
    /// (peer, local conn id) of channels we initiated, for matching ACKs
    initiated: FxHashMap<(SocketAddr, u32), u32>,
    /// (peer, initiator's conn id) of channels we accepted, for re-ACKing SYNs
    accepted: FxHashMap<(SocketAddr, u32), u32>,
    queue: UpdateQueue,
    next_session_id: u32,
    handle: ServiceHandle<P::Message>,
    commands: Option<mpsc::UnboundedReceiver<ServiceCommand<P::Message>>>,
    start: Instant,
}

impl<P: Protocol> NetworkService<P> {
    pub fn new(
        config: Arc<RpcConfig>,
        socket: Arc<dyn DatagramSocket>,
        engine_factory: Arc<dyn ArqEngineFactory>,
        protocol: Arc<P>,
        compressor: Arc<dyn Compressor>,
        dispatcher: Arc<dyn MessageDispatcher<P::Message>>,
    ) -> anyhow::Result<NetworkService<P>> {
        config.validate()?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        Ok(NetworkService {
            channel_config: Arc::new(config.effective_channel_config()),
            config,
            socket,
            engine_factory,
            protocol,
            compressor,
            dispatcher,
            sessions: FxHashMap::default(),
            routes: FxHashMap::default(),
            initiated: FxHashMap::default(),
            accepted: FxHashMap::default(),
            queue: UpdateQueue::new(0),
            next_session_id: 1,
            handle: ServiceHandle { commands: commands_tx },
            commands: Some(commands_rx),
            start: Instant::now(),
        })
    }

    /// Binds a UDP socket and creates a service on top of it with the KCP engine
    pub async fn bind(
        config: Arc<RpcConfig>,
        protocol: Arc<P>,
        compressor: Arc<dyn Compressor>,
        dispatcher: Arc<dyn MessageDispatcher<P::Message>>,
    ) -> anyhow::Result<(NetworkService<P>, Arc<UdpSocket>)> {
        config.validate()?;

        let socket = Arc::new(UdpSocket::bind(config.self_addr).await?);
        info!("bound socket to {:?}", socket.as_ref().local_addr()?);

        let engine_factory = Arc::new(KcpEngineFactory::new(config.kcp_window_size));
        let service = NetworkService::new(config, Arc::new(socket.clone()), engine_factory, protocol, compressor, dispatcher)?;
        Ok((service, socket))
    }

    pub fn handle(&self) -> ServiceHandle<P::Message> {
        self.handle.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    pub fn session(&self, session_id: u32) -> Option<&Session<P>> {
        self.sessions.get(&session_id)
    }

    pub fn num_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// the service's clock, in millis since it was created
    pub fn elapsed_millis(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Handles a datagram from the socket. Requests and events that become available are
    ///  dispatched before this returns.
    pub async fn on_datagram(&mut self, from: SocketAddr, buf: &[u8], now: u64) {
        self.queue.set_now(now);

        match classify_datagram(buf) {
            DatagramKind::Handshake(HandshakePacket::Syn { local_conn_id }) => self.on_syn(from, local_conn_id),
            DatagramKind::Handshake(ack @ HandshakePacket::Ack { request_conn_id, .. }) => self.on_ack(from, request_conn_id, ack),
            DatagramKind::Segment { conv } => self.on_segment(from, conv, buf).await,
            DatagramKind::Invalid => {
                debug!("received {} byte datagram from {:?} that is neither handshake nor segment - dropping", buf.len(), from);
            }
        }

        self.process_commands();
        self.run_due_updates();
    }

    /// Periodic sweep: drops abandoned calls, and updates all channels that are due
    pub fn on_tick(&mut self, now: u64) {
        self.queue.set_now(now);

        for session in self.sessions.values_mut() {
            session.purge_abandoned_calls();
        }
        self.process_commands();
        self.run_due_updates();
    }

    fn on_syn(&mut self, from: SocketAddr, initiator_conn_id: u32) {
        let packet = HandshakePacket::Syn { local_conn_id: initiator_conn_id };

        if let Some(&session_id) = self.accepted.get(&(from, initiator_conn_id)) {
            trace!("repeated SYN from {:?} for session {}", from, session_id);
            self.handshake_for_session(session_id, packet);
            return;
        }

        if self.sessions.len() >= self.config.max_sessions {
            warn!("SYN from {:?}: maximum of {} sessions reached - dropping", from, self.config.max_sessions);
            return;
        }

        let session_id = self.new_session_id();
        let local_conn_id = self.new_conn_id(from);
        let channel = match Channel::accept(
            session_id,
            local_conn_id,
            initiator_conn_id,
            from,
            self.channel_config.clone(),
            self.socket.clone(),
            self.engine_factory.clone(),
            &mut self.queue,
        ) {
            Ok(channel) => channel,
            Err(e) => {
                error!("could not accept connection from {:?}: {}", from, e);
                return;
            }
        };

        info!("accepted session {} from {:?}", session_id, from);
        self.sessions.insert(session_id, Session::new(channel, self.protocol.clone(), self.compressor.clone(), &self.config));
        self.accepted.insert((from, initiator_conn_id), session_id);
        self.routes.insert((from, local_conn_id), session_id);

        self.handshake_for_session(session_id, packet);
    }

    fn on_ack(&mut self, from: SocketAddr, request_conn_id: u32, packet: HandshakePacket) {
        let Some(&session_id) = self.initiated.get(&(from, request_conn_id)) else {
            debug!("ACK from {:?} for unknown conn id {} - dropping", from, request_conn_id);
            return;
        };

        self.handshake_for_session(session_id, packet);

        let Some(session) = self.sessions.get(&session_id) else {
            return;
        };
        if session.channel().state() != ConnectionState::Connected {
            return;
        }

        let key = (from, session.channel().conv());
        match self.routes.get(&key) {
            Some(&existing) if existing != session_id => {
                warn!("session {}: conversation {} with {:?} is already used by session {} - closing", session_id, key.1, from, existing);
                self.dispose_session(session_id, "conversation id collision");
            }
            _ => {
                self.routes.insert(key, session_id);
            }
        }
    }

    fn handshake_for_session(&mut self, session_id: u32, packet: HandshakePacket) {
        let Some(session) = self.sessions.get_mut(&session_id) else {
            return;
        };
        if let Err(e) = session.on_handshake(packet, &mut self.queue) {
            self.dispose_session(session_id, e);
        }
    }

    async fn on_segment(&mut self, from: SocketAddr, conv: u32, buf: &[u8]) {
        let Some(&session_id) = self.routes.get(&(from, conv)) else {
            debug!("segment from {:?} for unknown conversation {} - dropping", from, conv);
            return;
        };
        let Some(session) = self.sessions.get_mut(&session_id) else {
            return;
        };

        let inbound = match session.handle_recv(buf, &mut self.queue) {
            Ok(inbound) => inbound,
            Err(e) => {
                self.dispose_session(session_id, e);
                return;
            }
        };

        let dispatcher = self.dispatcher.clone();
        let handle = self.handle.clone();
        for message in inbound {
            dispatcher.on_message(message, &handle).await;
        }
    }

    fn run_due_updates(&mut self) {
        for session_id in self.queue.take_due() {
            let Some(session) = self.sessions.get_mut(&session_id) else {
                continue;
            };
            if let Err(e) = session.update(&mut self.queue) {
                self.dispose_session(session_id, e);
            }
        }
    }

    /// commands that were queued through the service's handle, when not running inside [NetworkService::run]
    fn process_commands(&mut self) {
        while let Some(command) = self.commands.as_mut().and_then(|rx| rx.try_recv().ok()) {
            if matches!(command, ServiceCommand::Shutdown) {
                debug!("shutdown requested outside the run loop - ignoring");
                continue;
            }
            self.handle_command(command);
        }
    }

    fn handle_command(&mut self, command: ServiceCommand<P::Message>) {
        match command {
            ServiceCommand::Connect { addr, reply } => {
                let _ = reply.send(self.connect(addr));
            }
            ServiceCommand::Send { session_id, message } => {
                if let Err(e) = self.send(session_id, &message) {
                    warn!("session {}: sending failed: {}", session_id, e);
                }
            }
            ServiceCommand::Call { session_id, request, reply, cancel } => {
                let pending = match cancel {
                    Some(cancel) => PendingCall::Cancellable { tx: reply, cancel },
                    None => PendingCall::Future(reply),
                };
                if let Err(e) = self.start_call(session_id, request, pending) {
                    debug!("session {}: call failed: {}", session_id, e);
                }
            }
            ServiceCommand::Close { session_id } => {
                self.close(session_id);
            }
            ServiceCommand::Shutdown => {}
        }
    }

    fn new_session_id(&mut self) -> u32 {
        loop {
            let id = self.next_session_id;
            self.next_session_id = self.next_session_id.wrapping_add(1);
            if id != 0 && !self.sessions.contains_key(&id) {
                return id;
            }
        }
    }

    fn new_conn_id(&self, peer: SocketAddr) -> u32 {
        loop {
            let id: u32 = rand::random();
            if id != 0 && !self.routes.contains_key(&(peer, id)) && !self.initiated.contains_key(&(peer, id)) {
                return id;
            }
        }
    }

    /// Starts connecting to a peer. The session can be used right away: messages sent before
    ///  the handshake completes are buffered.
    pub fn connect(&mut self, addr: SocketAddr) -> anyhow::Result<u32> {
        if self.sessions.len() >= self.config.max_sessions {
            bail!("maximum of {} sessions reached", self.config.max_sessions);
        }

        let session_id = self.new_session_id();
        let local_conn_id = self.new_conn_id(addr);
        let channel = Channel::connect(
            session_id,
            local_conn_id,
            addr,
            self.channel_config.clone(),
            self.socket.clone(),
            self.engine_factory.clone(),
            &mut self.queue,
        );

        self.sessions.insert(session_id, Session::new(channel, self.protocol.clone(), self.compressor.clone(), &self.config));
        self.initiated.insert((addr, local_conn_id), session_id);
        Ok(session_id)
    }

    fn session_mut(&mut self, session_id: u32) -> Result<&mut Session<P>, SessionError> {
        self.sessions.get_mut(&session_id)
            .ok_or(SessionError::Disposed)
    }

    /// Sends a message on a session. A packet that is too large is rejected without affecting
    ///  the session, while a failure of the underlying channel closes it.
    pub fn send(&mut self, session_id: u32, message: &P::Message) -> Result<(), SessionError> {
        let session = self.sessions.get_mut(&session_id)
            .ok_or(SessionError::Disposed)?;
        let result = session.send(message, &mut self.queue);
        self.after_send(session_id, result)
    }

    fn start_call(&mut self, session_id: u32, request: P::Message, pending: PendingCall<P::Message>) -> Result<u32, SessionError> {
        let Some(session) = self.sessions.get_mut(&session_id) else {
            pending.resolve(Err(RpcError::Disposed));
            return Err(SessionError::Disposed);
        };
        let result = session.start_call(request, pending, &mut self.queue);
        self.after_send(session_id, result)
    }

    fn after_send<T>(&mut self, session_id: u32, result: Result<T, SessionError>) -> Result<T, SessionError> {
        match &result {
            Ok(_) => self.run_due_updates(),
            Err(SessionError::Channel(e)) if e.is_fatal() => self.dispose_session(session_id, e),
            Err(_) => {}
        }
        result
    }

    pub fn call<R>(&mut self, session_id: u32, request: P::Message) -> Result<RpcResponse<P::Message, R>, SessionError> {
        let (tx, rx) = oneshot::channel();
        let rpc_id = self.start_call(session_id, request, PendingCall::Future(tx))?;
        Ok(RpcResponse::new(rpc_id, rx))
    }

    pub fn call_cancellable<R>(&mut self, session_id: u32, request: P::Message, cancel: CancelSignal) -> Result<RpcResponse<P::Message, R>, SessionError> {
        let (tx, rx) = oneshot::channel();
        let rpc_id = self.start_call(session_id, request, PendingCall::Cancellable { tx, cancel: cancel.clone() })?;
        Ok(RpcResponse::cancellable(rpc_id, rx, cancel))
    }

    pub fn call_with_callback<R, F>(&mut self, session_id: u32, request: P::Message, callback: F) -> Result<u32, SessionError>
    where
        R: TryFrom<P::Message>,
        F: FnOnce(Result<R, RpcError>) + Send + 'static,
    {
        self.start_call(session_id, request, PendingCall::callback(callback))
    }

    pub fn cancel_call(&mut self, session_id: u32, rpc_id: u32) -> bool {
        self.session_mut(session_id)
            .map(|session| session.cancel_call(rpc_id))
            .unwrap_or(false)
    }

    /// Closes a session locally. The peer is not notified and finds out through its
    ///  inactivity timeout.
    pub fn close(&mut self, session_id: u32) -> bool {
        if !self.sessions.contains_key(&session_id) {
            return false;
        }
        self.dispose_session(session_id, "closed locally");
        true
    }

    fn dispose_session(&mut self, session_id: u32, reason: impl Display) {
        let Some(mut session) = self.sessions.remove(&session_id) else {
            return;
        };
        info!("session {}: removing - {}", session_id, reason);

        session.dispose();
        self.routes.retain(|_, id| *id != session_id);
        self.initiated.retain(|_, id| *id != session_id);
        self.accepted.retain(|_, id| *id != session_id);
        self.queue.remove(session_id);
    }

    /// Runs the service on its socket until [ServiceHandle::shutdown] is called: receives
    ///  datagrams, ticks the update sweep and executes commands from [ServiceHandle]s.
    pub async fn run(mut self, receive_socket: Arc<UdpSocket>) -> anyhow::Result<()> {
        let Some(mut commands) = self.commands.take() else {
            bail!("the service's command receiver is gone - was it run before?");
        };

        info!("starting receive loop on {:?}", self.local_addr());

        let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                received = receive_socket.recv_from(&mut buf) => {
                    match received {
                        Ok((num_read, from)) => {
                            let span = span!(Level::TRACE, "datagram_received", ?from, num_read);
                            let now = self.elapsed_millis();
                            self.on_datagram(from, &buf[..num_read], now)
                                .instrument(span)
                                .await;
                        }
                        Err(e) => {
                            error!("socket error: {}", e);
                        }
                    }
                }
                _ = ticker.tick() => {
                    let now = self.elapsed_millis();
                    self.on_tick(now);
                }
                command = commands.recv() => {
                    match command {
                        Some(ServiceCommand::Shutdown) | None => break,
                        Some(command) => {
                            let now = self.elapsed_millis();
                            self.queue.set_now(now);
                            self.handle_command(command);
                            self.run_due_updates();
                        }
                    }
                }
            }
        }

        info!("shutting down, closing {} sessions", self.sessions.len());
        let session_ids: Vec<u32> = self.sessions.keys().copied().collect();
        for session_id in session_ids {
            self.dispose_session(session_id, "service shutdown");
        }
        Ok(())
    }
}
