//! Request / response correlation
//!
//! Every outbound request gets an rpc id that is unique in the process, and the caller's
//!  continuation is kept in the session's table of pending calls under that id until the
//!  response arrives, or the call is cancelled or the session goes away.

use std::fmt::Debug;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{oneshot, watch};
use crate::error::RpcError;

pub type RpcResult<M> = Result<M, RpcError>;

static NEXT_RPC_ID: AtomicU32 = AtomicU32::new(1);

/// Rpc ids are shared by all sessions of the process. They wrap around after 2^32 calls.
pub fn next_rpc_id() -> u32 {
    NEXT_RPC_ID.fetch_add(1, Ordering::Relaxed)
}

/// A cancellation trigger for a single call, shared between the caller and the session. Cancelling
///  is local only: the remote peer still processes the request, and its response is dropped.
#[derive(Clone, Debug)]
pub struct CancelSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelSignal {
    fn default() -> Self {
        CancelSignal::new()
    }
}

impl CancelSignal {
    pub fn new() -> CancelSignal {
        let (tx, _) = watch::channel(false);
        CancelSignal { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// completes once [CancelSignal::cancel] was called, immediately if it was called already
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // the sender is kept alive by `self`, so this can not fail
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// The continuation of a call that is waiting for its response
pub enum PendingCall<M> {
    Callback(Box<dyn FnOnce(RpcResult<M>) + Send>),
    Future(oneshot::Sender<RpcResult<M>>),
    Cancellable {
        tx: oneshot::Sender<RpcResult<M>>,
        cancel: CancelSignal,
    },
}

impl<M> Debug for PendingCall<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PendingCall::Callback(_) => write!(f, "Callback"),
            PendingCall::Future(_) => write!(f, "Future"),
            PendingCall::Cancellable { cancel, .. } => write!(f, "Cancellable(cancelled={})", cancel.is_cancelled()),
        }
    }
}

impl<M: Send + 'static> PendingCall<M> {
    /// Wraps a callback that expects a typed response
    pub fn callback<R, F>(callback: F) -> PendingCall<M>
    where
        M: Debug,
        R: TryFrom<M>,
        F: FnOnce(Result<R, RpcError>) + Send + 'static,
    {
        PendingCall::Callback(Box::new(move |result| callback(convert_response(result))))
    }

    /// Nobody can observe the result anymore: the call was cancelled, or the caller dropped
    ///  the response future
    pub fn is_abandoned(&self) -> bool {
        match self {
            PendingCall::Callback(_) => false,
            PendingCall::Future(tx) => tx.is_closed(),
            PendingCall::Cancellable { tx, cancel } => cancel.is_cancelled() || tx.is_closed(),
        }
    }

    pub fn resolve(self, result: RpcResult<M>) {
        match self {
            PendingCall::Callback(callback) => callback(result),
            PendingCall::Future(tx) => {
                let _ = tx.send(result);
            }
            PendingCall::Cancellable { tx, cancel } => {
                if cancel.is_cancelled() {
                    let _ = tx.send(Err(RpcError::Cancelled));
                }
                else {
                    let _ = tx.send(result);
                }
            }
        }
    }
}

/// Turns a raw response into the type the caller expects
pub fn convert_response<M: Debug, R: TryFrom<M>>(result: RpcResult<M>) -> Result<R, RpcError> {
    let message = result?;
    let description = format!("{:?}", message);
    R::try_from(message)
        .map_err(|_| RpcError::UnexpectedResponse(format!("expected {}, got {}", std::any::type_name::<R>(), description)))
}

/// The typed result of a call. It resolves to [RpcError::Disposed] if the session goes away
///  before a response arrives.
pub struct RpcResponse<M, R> {
    rpc_id: u32,
    rx: oneshot::Receiver<RpcResult<M>>,
    cancelled: Option<Pin<Box<dyn Future<Output = ()> + Send>>>,
    _response: PhantomData<fn() -> R>,
}

impl<M, R> RpcResponse<M, R> {
    pub fn new(rpc_id: u32, rx: oneshot::Receiver<RpcResult<M>>) -> RpcResponse<M, R> {
        RpcResponse {
            rpc_id,
            rx,
            cancelled: None,
            _response: PhantomData,
        }
    }

    /// A response that resolves to [RpcError::Cancelled] as soon as `cancel` is triggered.
    ///  The session drops the pending call itself on its next sweep.
    pub fn cancellable(rpc_id: u32, rx: oneshot::Receiver<RpcResult<M>>, cancel: CancelSignal) -> RpcResponse<M, R> {
        RpcResponse {
            rpc_id,
            rx,
            cancelled: Some(Box::pin(async move { cancel.cancelled().await })),
            _response: PhantomData,
        }
    }

    /// 0 if the id is not known on the caller's side, which is the case for calls made through
    ///  a [crate::service::ServiceHandle]
    pub fn rpc_id(&self) -> u32 {
        self.rpc_id
    }
}

impl<M: Debug, R: TryFrom<M>> Future for RpcResponse<M, R> {
    type Output = Result<R, RpcError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(result)) => return Poll::Ready(convert_response(result)),
            Poll::Ready(Err(_)) => return Poll::Ready(Err(RpcError::Disposed)),
            Poll::Pending => {}
        }

        match this.cancelled.as_mut().map(|cancelled| cancelled.as_mut().poll(cx)) {
            Some(Poll::Ready(())) => Poll::Ready(Err(RpcError::Cancelled)),
            _ => Poll::Pending,
        }
    }
}
