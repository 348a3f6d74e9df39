use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use http::Response;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::{body::PreviewedBody, error::CallError};

/// Result of a retried call: the settled response, or a terminal error.
pub type CallResult = Result<Response<PreviewedBody>, CallError>;

/// Handle to an in-flight retried call.
///
/// The handle resolves once the retry loop settles, either with the response
/// the loop decided to deliver or with a terminal error. Dropping the handle
/// does *not* stop the call: the driver keeps attempting in the background
/// until it reaches a stop condition of its own. Only [`abort`] halts the loop
/// early.
///
/// [`abort`]: Self::abort
pub struct ResponseHandle {
    receiver: oneshot::Receiver<CallResult>,
    abort: CancellationToken,
}

impl ResponseHandle {
    pub(crate) fn new(receiver: oneshot::Receiver<CallResult>, abort: CancellationToken) -> Self {
        Self { receiver, abort }
    }

    /// Requests that the call stop as soon as possible.
    ///
    /// Any attempt still in flight is dropped, no further attempt is started,
    /// and the handle resolves with [`CallError::Aborted`]. Aborting a call
    /// that has already settled has no effect, and repeated aborts are
    /// harmless.
    pub fn abort(&self) {
        self.abort.cancel();
    }

    /// Returns a handle that can abort the call without owning the response.
    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle { abort: self.abort.clone() }
    }
}

impl Future for ResponseHandle {
    type Output = CallResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().receiver).poll(cx).map(|result| match result {
            Ok(verdict) => verdict,
            // The driver task went away without delivering a verdict.
            Err(_) => Err(CallError::ExecutorClosed),
        })
    }
}

/// Clonable handle that can abort a call from anywhere.
///
/// Obtained from [`ResponseHandle::abort_handle`]. Dropping it does nothing.
#[derive(Clone, Debug)]
pub struct AbortHandle {
    abort: CancellationToken,
}

impl AbortHandle {
    /// Requests that the associated call stop as soon as possible.
    pub fn abort(&self) {
        self.abort.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_executor_closed_when_the_driver_disappears() {
        let (tx, rx) = oneshot::channel();
        let handle = ResponseHandle::new(rx, CancellationToken::new());
        drop(tx);

        assert!(matches!(handle.await, Err(CallError::ExecutorClosed)));
    }

    #[tokio::test]
    async fn abort_is_idempotent() {
        let (_tx, rx) = oneshot::channel();
        let token = CancellationToken::new();
        let handle = ResponseHandle::new(rx, token.clone());

        let remote = handle.abort_handle();
        handle.abort();
        handle.abort();
        remote.abort();
        assert!(token.is_cancelled());
    }
}
