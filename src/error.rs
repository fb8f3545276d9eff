use thiserror::Error;

/// Failures at the channel level. `Timeout` and `Reset` are terminal: the channel reports them
///  and the owner is expected to dispose it.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("no datagram received for {idle_millis} ms")]
    Timeout { idle_millis: u64 },
    #[error("ARQ engine returned an invalid read - connection reset")]
    Reset,
    #[error("channel is disposed")]
    Disposed,
    #[error("a receive is already pending on this channel")]
    ReceiveAlreadyPending,
    #[error("packet of {len} bytes exceeds the maximum frame length of {max}")]
    PacketTooLarge { len: usize, max: usize },
    #[error("ARQ engine error: {0}")]
    Arq(#[source] anyhow::Error),
}

/// Failures that terminate a session
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("malformed packet of {len} bytes")]
    Malformed { len: usize },
    #[error("undecodable message with opcode {opcode}: {source}")]
    Decode { opcode: u16, #[source] source: anyhow::Error },
    #[error("message could not be encoded: {0}")]
    Encode(#[source] anyhow::Error),
    #[error("session is disposed")]
    Disposed,
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// The outcome of a single RPC call that did not produce a response. None of these affect other
///  calls or the session.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    #[error("remote error {code}: {message}")]
    Remote { code: u32, message: String },
    #[error("unexpected response type: {0}")]
    UnexpectedResponse(String),
    #[error("call was cancelled")]
    Cancelled,
    #[error("session was disposed before a response arrived")]
    Disposed,
    #[error("request could not be sent: {0}")]
    SendFailed(String),
}

impl RpcError {
    /// the remote error code, if this is a remote failure
    pub fn code(&self) -> Option<u32> {
        match self {
            RpcError::Remote { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl ChannelError {
    /// Errors that mean the connection is gone for good, as opposed to an operation that was
    ///  rejected
    pub fn is_fatal(&self) -> bool {
        matches!(self, ChannelError::Timeout { .. } | ChannelError::Reset | ChannelError::Disposed | ChannelError::Arq(_))
    }
}
