use std::fmt::Debug;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
#[cfg(test)] use mockall::automock;
use crate::service::ServiceHandle;

/// How a message takes part in RPC correlation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcKind {
    /// a call that expects a response; its rpc id is assigned by the session when it is sent
    Request,
    /// a one-way message
    Event,
    /// the answer to the request with the same rpc id. An `error` above the session's threshold
    ///  (100 by default) marks a failure reported by the remote side.
    Response { rpc_id: u32, error: u32, error_message: String },
}

/// An application protocol: the registry of message types with their opcodes, and the
///  serializer for their payloads.
///
/// Opcodes must fit into 15 bits, the top bit of the wire opcode is reserved for the
///  compression flag.
pub trait Protocol: Send + Sync + 'static {
    type Message: Debug + Send + Sync + 'static;

    fn opcode_of(&self, message: &Self::Message) -> anyhow::Result<u16>;

    fn serialize(&self, message: &Self::Message, buf: &mut BytesMut) -> anyhow::Result<()>;

    /// `buf` is the (decompressed) payload, i.e. starts after the opcode
    fn deserialize(&self, opcode: u16, buf: &[u8]) -> anyhow::Result<Self::Message>;

    fn rpc_kind(&self, message: &Self::Message) -> RpcKind;

    /// stores the rpc id in a request before it is sent
    fn set_rpc_id(&self, message: &mut Self::Message, rpc_id: u32);
}

/// A request or event that arrived on a session, with the opcode it had on the wire (without
///  the compression flag) and its decompressed payload
#[derive(Debug)]
pub struct InboundMessage<M> {
    pub session_id: u32,
    pub opcode: u16,
    pub message: M,
    pub raw: Bytes,
}

/// Application callback for requests and events. Messages are passed in the order they were
///  received, and the next one is only dispatched after `on_message` returns.
///
/// Responses can be sent through the handle. Waiting for the service to do something (e.g.
///  awaiting [ServiceHandle::connect]) from inside `on_message` blocks the service and must
///  not be done.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageDispatcher<M: Send + Sync + 'static>: Send + Sync + 'static {
    async fn on_message(&self, inbound: InboundMessage<M>, handle: &ServiceHandle<M>);
}
