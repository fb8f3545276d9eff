use std::sync::Arc;
use bytes::{Buf, Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use tracing::{debug, info, trace, warn};
use crate::channel::{Channel, ReceiveResult};
use crate::compression::Compressor;
use crate::config::RpcConfig;
use crate::error::{RpcError, SessionError};
use crate::message::{InboundMessage, Protocol, RpcKind};
use crate::rpc::{next_rpc_id, CancelSignal, PendingCall, RpcResponse};
use crate::scheduler::UpdateScheduler;
use crate::wire::{split_opcode, COMPRESSED_FLAG, OPCODE_MASK};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Lifecycle {
    Live,
    Disposed,
}

/// The RPC layer on top of a [Channel]: encodes and decodes application messages, correlates
///  responses with the calls that are waiting for them, and hands everything else to the
///  caller for dispatch.
pub struct Session<P: Protocol> {
    id: u32,
    lifecycle: Lifecycle,
    channel: Channel,
    protocol: Arc<P>,
    compressor: Arc<dyn Compressor>,
    compression_threshold: usize,
    rpc_error_threshold: u32,
    pending_calls: FxHashMap<u32, PendingCall<P::Message>>,
    pending_receive: Option<oneshot::Receiver<ReceiveResult>>,
}

impl<P: Protocol> Session<P> {
    pub fn new(channel: Channel, protocol: Arc<P>, compressor: Arc<dyn Compressor>, config: &RpcConfig) -> Session<P> {
        Session {
            id: channel.id(),
            lifecycle: Lifecycle::Live,
            channel,
            protocol,
            compressor,
            compression_threshold: config.compression_threshold,
            rpc_error_threshold: config.rpc_error_threshold,
            pending_calls: FxHashMap::default(),
            pending_receive: None,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn num_pending_calls(&self) -> usize {
        self.pending_calls.len()
    }

    fn ensure_live(&self) -> Result<(), SessionError> {
        if self.lifecycle == Lifecycle::Disposed {
            return Err(SessionError::Disposed);
        }
        Ok(())
    }

    /// Serializes a message to `(wire opcode, payload)`, compressing the payload if that pays off
    pub fn encode(&self, message: &P::Message) -> Result<(u16, Bytes), SessionError> {
        let opcode = self.protocol.opcode_of(message)
            .map_err(SessionError::Encode)?;
        if opcode & !OPCODE_MASK != 0 {
            return Err(SessionError::Encode(anyhow::anyhow!("opcode {} does not fit into 15 bits", opcode)));
        }

        let mut buf = BytesMut::new();
        self.protocol.serialize(message, &mut buf)
            .map_err(SessionError::Encode)?;

        if buf.len() > self.compression_threshold {
            match self.compressor.compress(&buf) {
                Ok(compressed) if compressed.len() < buf.len() => {
                    trace!("session {}: compressed payload from {} to {} bytes", self.id, buf.len(), compressed.len());
                    return Ok((opcode | COMPRESSED_FLAG, Bytes::from(compressed)));
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("session {}: compression failed, sending uncompressed: {}", self.id, e);
                }
            }
        }
        Ok((opcode, buf.freeze()))
    }

    pub fn send(&mut self, message: &P::Message, scheduler: &mut dyn UpdateScheduler) -> Result<(), SessionError> {
        self.ensure_live()?;

        let (opcode, payload) = self.encode(message)?;
        trace!("session {}: sending {:?} as opcode {:#06x}", self.id, message, opcode);
        self.channel.send_fragments(&[&opcode.to_le_bytes()[..], &payload[..]], scheduler)?;
        Ok(())
    }

    /// Sends a request and registers its continuation. If the request can not be sent, the
    ///  continuation is resolved with [RpcError::SendFailed] right away.
    pub fn start_call(&mut self, mut request: P::Message, pending: PendingCall<P::Message>, scheduler: &mut dyn UpdateScheduler) -> Result<u32, SessionError> {
        if let Err(e) = self.ensure_live() {
            pending.resolve(Err(RpcError::Disposed));
            return Err(e);
        }

        let rpc_id = next_rpc_id();
        self.protocol.set_rpc_id(&mut request, rpc_id);

        if let Err(e) = self.send(&request, scheduler) {
            pending.resolve(Err(RpcError::SendFailed(e.to_string())));
            return Err(e);
        }

        trace!("session {}: registered call {}", self.id, rpc_id);
        self.pending_calls.insert(rpc_id, pending);
        Ok(rpc_id)
    }

    /// fire a request, passing the typed response (or failure) to a callback
    pub fn call_with_callback<R, F>(&mut self, request: P::Message, callback: F, scheduler: &mut dyn UpdateScheduler) -> Result<u32, SessionError>
    where
        R: TryFrom<P::Message>,
        F: FnOnce(Result<R, RpcError>) + Send + 'static,
    {
        self.start_call(request, PendingCall::callback(callback), scheduler)
    }

    pub fn call<R>(&mut self, request: P::Message, scheduler: &mut dyn UpdateScheduler) -> Result<RpcResponse<P::Message, R>, SessionError> {
        let (tx, rx) = oneshot::channel();
        let rpc_id = self.start_call(request, PendingCall::Future(tx), scheduler)?;
        Ok(RpcResponse::new(rpc_id, rx))
    }

    /// Like [Session::call], but the call is abandoned when `cancel` is triggered: the future
    ///  resolves with [RpcError::Cancelled] right away, and a response that arrives later is
    ///  ignored. The pending entry is removed on the session's next update.
    pub fn call_cancellable<R>(&mut self, request: P::Message, cancel: CancelSignal, scheduler: &mut dyn UpdateScheduler) -> Result<RpcResponse<P::Message, R>, SessionError> {
        let (tx, rx) = oneshot::channel();
        let rpc_id = self.start_call(request, PendingCall::Cancellable { tx, cancel: cancel.clone() }, scheduler)?;
        Ok(RpcResponse::cancellable(rpc_id, rx, cancel))
    }

    /// Removes a pending call, resolving it with [RpcError::Cancelled]. Returns `false` if there
    ///  is no such call (anymore).
    pub fn cancel_call(&mut self, rpc_id: u32) -> bool {
        match self.pending_calls.remove(&rpc_id) {
            Some(pending) => {
                debug!("session {}: cancelling call {}", self.id, rpc_id);
                pending.resolve(Err(RpcError::Cancelled));
                true
            }
            None => false,
        }
    }

    /// Drops calls that were cancelled or whose caller is no longer interested
    pub fn purge_abandoned_calls(&mut self) {
        let abandoned: Vec<u32> = self.pending_calls.iter()
            .filter(|(_, pending)| pending.is_abandoned())
            .map(|(rpc_id, _)| *rpc_id)
            .collect();

        for rpc_id in abandoned {
            self.cancel_call(rpc_id);
        }
    }

    /// Returns the next packet that the channel has ready, if any
    fn next_packet(&mut self) -> Result<Option<Bytes>, SessionError> {
        if self.pending_receive.is_none() {
            self.pending_receive = Some(self.channel.recv()?);
        }
        let Some(rx) = self.pending_receive.as_mut() else {
            return Ok(None);
        };

        match rx.try_recv() {
            Ok(Ok(packet)) => {
                self.pending_receive = None;
                Ok(Some(packet))
            }
            Ok(Err(e)) => {
                self.pending_receive = None;
                Err(e.into())
            }
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Closed) => {
                self.pending_receive = None;
                Err(SessionError::Disposed)
            }
        }
    }

    /// Processes one packet from the channel. Responses are correlated with their calls,
    ///  requests and events are returned for dispatch. An error is fatal for the session.
    pub fn run(&mut self, packet: Bytes) -> Result<Option<InboundMessage<P::Message>>, SessionError> {
        self.ensure_live()?;

        if packet.len() < 3 {
            warn!("session {}: malformed packet of {} bytes", self.id, packet.len());
            return Err(SessionError::Malformed { len: packet.len() });
        }

        let mut buf = packet;
        let (opcode, compressed) = split_opcode(buf.get_u16_le());
        let payload = if compressed {
            let decompressed = self.compressor.decompress(&buf)
                .map_err(|source| SessionError::Decode { opcode, source })?;
            Bytes::from(decompressed)
        }
        else {
            buf
        };

        let message = self.protocol.deserialize(opcode, &payload)
            .map_err(|source| SessionError::Decode { opcode, source })?;
        trace!("session {}: received {:?}", self.id, message);

        match self.protocol.rpc_kind(&message) {
            RpcKind::Response { rpc_id, error, error_message } => {
                match self.pending_calls.remove(&rpc_id) {
                    Some(pending) => {
                        if error > self.rpc_error_threshold {
                            debug!("session {}: call {} failed remotely with error {}", self.id, rpc_id, error);
                            pending.resolve(Err(RpcError::Remote { code: error, message: error_message }));
                        }
                        else {
                            pending.resolve(Ok(message));
                        }
                    }
                    None => {
                        debug!("session {}: response for unknown call {} - dropping", self.id, rpc_id);
                    }
                }
                Ok(None)
            }
            RpcKind::Request | RpcKind::Event => Ok(Some(InboundMessage {
                session_id: self.id,
                opcode,
                message,
                raw: payload,
            })),
        }
    }

    /// Feeds a datagram into the channel and returns the requests and events that became
    ///  available, in order. An error is fatal for the session.
    pub fn handle_recv(&mut self, datagram: &[u8], scheduler: &mut dyn UpdateScheduler) -> Result<Vec<InboundMessage<P::Message>>, SessionError> {
        self.ensure_live()?;
        self.channel.handle_recv(datagram, scheduler)?;

        let mut result = Vec::new();
        while let Some(packet) = self.next_packet()? {
            if let Some(inbound) = self.run(packet)? {
                result.push(inbound);
            }
        }
        Ok(result)
    }

    /// Handshake packet for this session's channel
    pub fn on_handshake(&mut self, packet: crate::wire::HandshakePacket, scheduler: &mut dyn UpdateScheduler) -> Result<(), SessionError> {
        self.ensure_live()?;
        self.channel.on_handshake(packet, scheduler)?;
        Ok(())
    }

    pub fn update(&mut self, scheduler: &mut dyn UpdateScheduler) -> Result<(), SessionError> {
        self.ensure_live()?;
        self.purge_abandoned_calls();
        self.channel.update(scheduler)?;
        Ok(())
    }

    /// Disposes the channel and fails all pending calls. Disposing a disposed session does
    ///  nothing.
    pub fn dispose(&mut self) {
        if self.lifecycle == Lifecycle::Disposed {
            return;
        }

        info!("session {}: disposing with {} pending calls", self.id, self.pending_calls.len());
        self.lifecycle = Lifecycle::Disposed;
        self.pending_receive = None;
        self.channel.dispose();
        for (_, pending) in self.pending_calls.drain() {
            pending.resolve(Err(RpcError::Disposed));
        }
    }
}

impl<P: Protocol> Drop for Session<P> {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use crate::arq::ArqEngineFactory;
    use crate::channel::Channel;
    use crate::compression::{MockCompressor, NoCompression, ZstdCompressor};
    use crate::config::EffectiveChannelConfig;
    use crate::scheduler::UpdateQueue;
    use crate::test_util::{test_addr_from_number, FakeEngineFactory, Pong, RecordingSocket, TestMessage, TestProtocol};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rstest::rstest;

    struct Fixture {
        session: Session<TestProtocol>,
        factory: Arc<FakeEngineFactory>,
        queue: UpdateQueue,
    }

    impl Fixture {
        fn new(compressor: Arc<dyn Compressor>) -> Fixture {
            let socket = RecordingSocket::new(test_addr_from_number(1));
            let factory = FakeEngineFactory::new();
            let engine_factory: Arc<dyn ArqEngineFactory> = factory.clone();
            let mut queue = UpdateQueue::new(0);
            let channel = Channel::accept(5, 42, 7, test_addr_from_number(2), Arc::new(EffectiveChannelConfig::default()), socket, engine_factory, &mut queue)
                .unwrap();
            let session = Session::new(channel, Arc::new(TestProtocol), compressor, &RpcConfig::default_ipv4());
            Fixture { session, factory, queue }
        }

        /// the frames the session handed to the engine, without the channel's length prefixes
        fn sent_frames(&self) -> Vec<Vec<u8>> {
            let sent = self.factory.engine(0).lock().unwrap().sent.clone();
            sent.chunks(3)
                .map(|c| [c[1].clone(), c[2].clone()].concat())
                .collect()
        }

        /// loops everything that was sent back into the session, as if the peer echoed it
        fn echo(&mut self) -> Vec<InboundMessage<TestMessage>> {
            let sent = self.factory.engine(0).lock().unwrap().sent.clone();
            self.session.handle_recv(&sent.concat(), &mut self.queue).unwrap()
        }

        fn receive(&mut self, message: &TestMessage) -> Result<Vec<InboundMessage<TestMessage>>, SessionError> {
            let (opcode, payload) = self.session.encode(message).unwrap();
            self.receive_frame(&[&opcode.to_le_bytes()[..], &payload].concat())
        }

        fn receive_frame(&mut self, frame: &[u8]) -> Result<Vec<InboundMessage<TestMessage>>, SessionError> {
            let mut datagram = (frame.len() as u16).to_le_bytes().to_vec();
            datagram.extend_from_slice(frame);
            self.session.handle_recv(&datagram, &mut self.queue)
        }
    }

    fn random_bytes(len: usize) -> Vec<u8> {
        let mut rng = StdRng::seed_from_u64(4711);
        let mut result = vec![0u8; len];
        rng.fill(&mut result[..]);
        result
    }

    fn pong(rpc_id: u32, error: u32) -> TestMessage {
        TestMessage::Pong { rpc_id, error, error_message: "oops".to_string(), payload: vec![1, 2] }
    }

    #[test]
    fn test_send_frames_opcode_and_payload() {
        let mut f = Fixture::new(Arc::new(NoCompression));
        f.session.send(&TestMessage::Note { text: "hi".to_string() }, &mut f.queue).unwrap();

        let sent = f.factory.engine(0).lock().unwrap().sent.clone();
        assert_eq!(sent, vec![vec![6, 0], vec![3, 0], vec![2, 0, b'h', b'i']]);
    }

    #[rstest]
    #[case::small(vec![0u8; 50], false)]
    #[case::at_threshold(vec![0u8; 96], false)]
    #[case::above_threshold(vec![0u8; 97], true)]
    #[case::incompressible(random_bytes(300), false)]
    fn test_compression_round_trip(#[case] payload: Vec<u8>, #[case] expect_compressed: bool) {
        let mut f = Fixture::new(Arc::new(ZstdCompressor::default()));
        let note = TestMessage::Ping { rpc_id: 77, payload };
        f.session.send(&note, &mut f.queue).unwrap();

        let frame = f.sent_frames().remove(0);
        let raw_opcode = u16::from_le_bytes([frame[0], frame[1]]);
        assert_eq!(raw_opcode & COMPRESSED_FLAG != 0, expect_compressed);
        assert_eq!(raw_opcode & OPCODE_MASK, 1);

        let inbound = f.echo();
        assert_eq!(inbound.len(), 1);
        assert_eq!(inbound[0].opcode, 1);
        assert_eq!(inbound[0].message, note);
        assert_eq!(inbound[0].session_id, 5);
    }

    #[test]
    fn test_compression_kept_only_if_smaller() {
        let mut compressor = MockCompressor::new();
        compressor.expect_compress()
            .times(1)
            .returning(|data| Ok(vec![0u8; data.len()]));
        let mut f = Fixture::new(Arc::new(compressor));

        f.session.send(&TestMessage::Ping { rpc_id: 1, payload: vec![5u8; 200] }, &mut f.queue).unwrap();
        let frame = f.sent_frames().remove(0);
        assert_eq!(&frame[..2], &[1, 0]);
        assert_eq!(frame.len(), 2 + 4 + 200);
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::opcode_only(vec![3, 0])]
    fn test_malformed_packet_is_fatal(#[case] frame: Vec<u8>) {
        let mut f = Fixture::new(Arc::new(NoCompression));
        assert!(matches!(f.receive_frame(&frame), Err(SessionError::Malformed { .. })));
    }

    #[rstest]
    #[case::unknown_opcode(vec![99, 0, 1, 2, 3])]
    #[case::truncated_ping(vec![1, 0, 1])]
    #[case::bad_compressed_payload(vec![1, 0x80, 1, 2, 3])]
    fn test_undecodable_packet_is_fatal(#[case] frame: Vec<u8>) {
        let mut f = Fixture::new(Arc::new(ZstdCompressor::default()));
        assert!(matches!(f.receive_frame(&frame), Err(SessionError::Decode { .. })));
    }

    #[tokio::test]
    async fn test_call_resolves_with_response() {
        let mut f = Fixture::new(Arc::new(NoCompression));
        let response = f.session.call::<Pong>(TestMessage::Ping { rpc_id: 0, payload: vec![9] }, &mut f.queue).unwrap();
        let rpc_id = response.rpc_id();
        assert_eq!(f.session.num_pending_calls(), 1);

        let inbound = f.receive(&pong(rpc_id, 0)).unwrap();
        assert!(inbound.is_empty());
        assert_eq!(f.session.num_pending_calls(), 0);
        assert_eq!(response.await, Ok(Pong { payload: vec![1, 2] }));
    }

    #[tokio::test]
    async fn test_request_carries_rpc_id() {
        let mut f = Fixture::new(Arc::new(NoCompression));
        let response = f.session.call::<Pong>(TestMessage::Ping { rpc_id: 0, payload: vec![9] }, &mut f.queue).unwrap();

        let inbound = f.echo();
        assert_eq!(inbound[0].message, TestMessage::Ping { rpc_id: response.rpc_id(), payload: vec![9] });
    }

    #[rstest]
    #[case::success_at_threshold(100, None)]
    #[case::failure_above_threshold(101, Some(101))]
    #[case::failure_far_above(5000, Some(5000))]
    #[tokio::test]
    async fn test_remote_error_threshold(#[case] error: u32, #[case] expected_code: Option<u32>) {
        let mut f = Fixture::new(Arc::new(NoCompression));
        let response = f.session.call::<Pong>(TestMessage::Ping { rpc_id: 0, payload: vec![] }, &mut f.queue).unwrap();
        let rpc_id = response.rpc_id();
        f.receive(&pong(rpc_id, error)).unwrap();

        match (response.await, expected_code) {
            (Ok(pong), None) => assert_eq!(pong, Pong { payload: vec![1, 2] }),
            (Err(e), Some(code)) => {
                assert_eq!(e.code(), Some(code));
                assert_eq!(e, RpcError::Remote { code, message: "oops".to_string() });
            }
            (other, _) => panic!("unexpected result {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unmatched_response_is_dropped() {
        let mut f = Fixture::new(Arc::new(NoCompression));
        let first = f.session.call::<Pong>(TestMessage::Ping { rpc_id: 0, payload: vec![] }, &mut f.queue).unwrap();
        let second = f.session.call::<Pong>(TestMessage::Ping { rpc_id: 0, payload: vec![] }, &mut f.queue).unwrap();
        let first_id = first.rpc_id();

        f.receive(&pong(first_id, 0)).unwrap();
        // duplicate, and one for an id that never existed
        f.receive(&pong(first_id, 0)).unwrap();
        f.receive(&pong(u32::MAX, 0)).unwrap();

        assert_eq!(f.session.num_pending_calls(), 1);
        assert!(first.await.is_ok());

        f.receive(&pong(second.rpc_id(), 0)).unwrap();
        assert!(second.await.is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_call_ignores_late_response() {
        let mut f = Fixture::new(Arc::new(NoCompression));
        let cancel = CancelSignal::new();
        let response = f.session.call_cancellable::<Pong>(TestMessage::Ping { rpc_id: 0, payload: vec![] }, cancel.clone(), &mut f.queue).unwrap();
        let rpc_id = response.rpc_id();

        cancel.cancel();
        f.session.update(&mut f.queue).unwrap();
        assert_eq!(f.session.num_pending_calls(), 0);

        f.receive(&pong(rpc_id, 0)).unwrap();
        assert_eq!(response.await, Err(RpcError::Cancelled));
    }

    #[tokio::test]
    async fn test_cancelled_call_resolves_before_sweep() {
        let mut f = Fixture::new(Arc::new(NoCompression));
        let cancel = CancelSignal::new();
        let response = f.session.call_cancellable::<Pong>(TestMessage::Ping { rpc_id: 0, payload: vec![] }, cancel.clone(), &mut f.queue).unwrap();
        let rpc_id = response.rpc_id();

        cancel.cancel();
        assert_eq!(response.await, Err(RpcError::Cancelled));
        assert_eq!(f.session.num_pending_calls(), 1);

        f.session.update(&mut f.queue).unwrap();
        assert_eq!(f.session.num_pending_calls(), 0);
        f.receive(&pong(rpc_id, 0)).unwrap();
    }

    #[tokio::test]
    async fn test_cancel_call_explicitly() {
        let mut f = Fixture::new(Arc::new(NoCompression));
        let response = f.session.call::<Pong>(TestMessage::Ping { rpc_id: 0, payload: vec![] }, &mut f.queue).unwrap();
        let rpc_id = response.rpc_id();

        assert!(f.session.cancel_call(rpc_id));
        assert!(!f.session.cancel_call(rpc_id));
        f.receive(&pong(rpc_id, 0)).unwrap();
        assert_eq!(response.await, Err(RpcError::Cancelled));
    }

    #[tokio::test]
    async fn test_unexpected_response_type() {
        let mut f = Fixture::new(Arc::new(NoCompression));
        let response = f.session.call::<Pong>(TestMessage::Ping { rpc_id: 0, payload: vec![] }, &mut f.queue).unwrap();
        let rpc_id = response.rpc_id();

        f.receive(&TestMessage::Count { rpc_id, value: 3 }).unwrap();
        assert!(matches!(response.await, Err(RpcError::UnexpectedResponse(_))));
    }

    #[test]
    fn test_callback_call() {
        let mut f = Fixture::new(Arc::new(NoCompression));
        let received = Arc::new(Mutex::new(Vec::new()));
        let received2 = received.clone();
        let rpc_id = f.session.call_with_callback(
            TestMessage::Ping { rpc_id: 0, payload: vec![] },
            move |result: Result<Pong, RpcError>| received2.lock().unwrap().push(result),
            &mut f.queue,
        ).unwrap();

        f.receive(&pong(rpc_id, 0)).unwrap();
        f.receive(&pong(rpc_id, 0)).unwrap();
        assert_eq!(*received.lock().unwrap(), vec![Ok(Pong { payload: vec![1, 2] })]);
    }

    #[test]
    fn test_events_are_returned_in_order() {
        let mut f = Fixture::new(Arc::new(NoCompression));
        for text in ["a", "b", "c"] {
            f.session.send(&TestMessage::Note { text: text.to_string() }, &mut f.queue).unwrap();
        }

        let texts: Vec<TestMessage> = f.echo().into_iter()
            .map(|inbound| inbound.message)
            .collect();
        assert_eq!(texts, vec![
            TestMessage::Note { text: "a".to_string() },
            TestMessage::Note { text: "b".to_string() },
            TestMessage::Note { text: "c".to_string() },
        ]);
    }

    #[tokio::test]
    async fn test_dispose() {
        let mut f = Fixture::new(Arc::new(NoCompression));
        let response = f.session.call::<Pong>(TestMessage::Ping { rpc_id: 0, payload: vec![] }, &mut f.queue).unwrap();

        f.session.dispose();
        f.session.dispose();
        assert_eq!(f.session.lifecycle(), Lifecycle::Disposed);
        assert!(f.session.channel().is_disposed());
        assert_eq!(response.await, Err(RpcError::Disposed));

        assert!(matches!(f.session.send(&TestMessage::Note { text: "x".to_string() }, &mut f.queue), Err(SessionError::Disposed)));
        assert!(matches!(f.session.update(&mut f.queue), Err(SessionError::Disposed)));

        let late = f.session.call::<Pong>(TestMessage::Ping { rpc_id: 0, payload: vec![] }, &mut f.queue);
        assert!(matches!(late, Err(SessionError::Disposed)));
    }

    #[test]
    fn test_channel_reset_is_fatal() {
        let mut f = Fixture::new(Arc::new(NoCompression));
        f.factory.engine(0).lock().unwrap().fake_peek_size = Some(0);
        let result = f.receive(&TestMessage::Note { text: "x".to_string() });
        assert!(matches!(result, Err(SessionError::Channel(crate::error::ChannelError::Reset))));
    }
}
