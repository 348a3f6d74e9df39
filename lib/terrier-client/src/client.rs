use std::{
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use anyhow::anyhow;
use http::{Request, Response};
use http_body::Body;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tower::{util::BoxCloneService, BoxError, Service, ServiceExt as _};

use crate::{
    body::{PreviewedBody, ReplayBody},
    driver::{self, RetrySettings},
    error::CallError,
    handle::{CallResult, ResponseHandle},
    strategy::{OnServerErrors, RetryStrategy},
    telemetry::RetryTelemetry,
};

/// An HTTP client wrapper that retries failed calls.
///
/// Wraps any `tower::Service` speaking `http` request/response types. Each
/// submitted call runs on its own driver task: the caller gets a
/// [`ResponseHandle`] back immediately and the retry loop makes progress
/// whether or not the handle is ever awaited. Request bodies are captured on
/// first read so that every attempt sends byte-identical content, including
/// bodies that stream from a source that can only be consumed once.
pub struct RetryingClient<B = (), RB = ()> {
    inner: BoxCloneService<Request<ReplayBody<B>>, Response<RB>, BoxError>,
    strategy: Arc<dyn RetryStrategy>,
    settings: RetrySettings,
    telemetry: RetryTelemetry,
}

impl RetryingClient {
    /// Creates a new builder for configuring a retrying client.
    pub fn builder() -> RetryingClientBuilder {
        RetryingClientBuilder::default()
    }
}

impl<B, RB> Clone for RetryingClient<B, RB> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            strategy: Arc::clone(&self.strategy),
            settings: self.settings.clone(),
            telemetry: self.telemetry.clone(),
        }
    }
}

impl<B, RB> RetryingClient<B, RB>
where
    B: Body + Send + Unpin + 'static,
    B::Data: Send,
    B::Error: Into<BoxError>,
    RB: Body + Send + 'static,
    RB::Data: Send,
    RB::Error: Into<BoxError>,
{
    /// Starts a retried call and returns a handle to its eventual outcome.
    ///
    /// Returns immediately. The retry loop runs on a spawned task until it
    /// reaches a terminal outcome, and keeps running even if the returned
    /// handle is dropped. Use [`ResponseHandle::abort`] (or a detached
    /// [`AbortHandle`]) to stop the call early.
    ///
    /// [`AbortHandle`]: crate::AbortHandle
    pub fn submit(&self, request: Request<B>) -> ResponseHandle {
        let (tx, rx) = oneshot::channel();
        let abort = CancellationToken::new();

        let request = request.map(ReplayBody::new);
        let service = self.inner.clone();
        let strategy = Arc::clone(&self.strategy);
        let settings = self.settings.clone();
        let telemetry = self.telemetry.clone();
        let driver_abort = abort.clone();

        tokio::spawn(async move {
            let verdict = driver::run_attempts(service, strategy, settings, telemetry, request, driver_abort).await;

            // The consumer may be long gone, which does not invalidate the
            // work the loop already did.
            let _ = tx.send(verdict);
        });

        ResponseHandle::new(rx, abort)
    }

    /// Sends a request and waits for the retry loop to settle.
    ///
    /// # Errors
    ///
    /// If every attempt failed, or the call was aborted, an error is
    /// returned. Responses the strategy chose not to retry are delivered as
    /// `Ok` regardless of their status code.
    pub async fn execute(&self, request: Request<B>) -> CallResult {
        self.submit(request).await
    }
}

impl<B, RB> Service<Request<B>> for RetryingClient<B, RB>
where
    B: Body + Send + Unpin + 'static,
    B::Data: Send,
    B::Error: Into<BoxError>,
    RB: Body + Send + 'static,
    RB::Data: Send,
    RB::Error: Into<BoxError>,
{
    type Response = Response<PreviewedBody>;
    type Error = CallError;
    type Future = ResponseHandle;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Backpressure belongs to the inner service and is applied per attempt.
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request<B>) -> Self::Future {
        self.submit(request)
    }
}

/// A retrying client builder.
///
/// # Defaults
///
/// - retries server errors (5xx) and transport failures, paced by jittered
///   exponential backoff ([`OnServerErrors`])
/// - at most 10 attempts per call
/// - no total timeout, and attempts inherit whatever budget remains
/// - `Retry-After` response headers are ignored
/// - content previewing disabled (strategies see an empty preview)
#[derive(Clone)]
pub struct RetryingClientBuilder<T = OnServerErrors> {
    strategy: T,
    pub(crate) max_total_attempts: u32,
    pub(crate) total_timeout: Option<Duration>,
    pub(crate) attempt_timeout: Option<Duration>,
    pub(crate) use_retry_after: bool,
    pub(crate) content_preview_length: usize,
}

impl<T> RetryingClientBuilder<T> {
    /// Sets the retry strategy consulted after every attempt.
    ///
    /// Defaults to [`OnServerErrors`].
    pub fn with_strategy<T2>(self, strategy: T2) -> RetryingClientBuilder<T2> {
        RetryingClientBuilder {
            strategy,
            max_total_attempts: self.max_total_attempts,
            total_timeout: self.total_timeout,
            attempt_timeout: self.attempt_timeout,
            use_retry_after: self.use_retry_after,
            content_preview_length: self.content_preview_length,
        }
    }

    /// Sets the maximum number of attempts for a single call.
    ///
    /// Defaults to 10.
    pub fn with_max_total_attempts(mut self, max: u32) -> Self {
        self.max_total_attempts = max;
        self
    }

    /// Allows a call to make an unlimited number of attempts.
    ///
    /// Combined with [`without_total_timeout`], the only remaining stop
    /// conditions are the strategy saying stop and an explicit abort, so
    /// whether the loop terminates is entirely in the strategy's hands.
    ///
    /// [`without_total_timeout`]: Self::without_total_timeout
    pub fn without_attempt_limit(mut self) -> Self {
        self.max_total_attempts = 0;
        self
    }

    /// Sets the wall-clock budget for a whole call, retries included.
    ///
    /// Once the budget no longer fits another attempt, nothing further is
    /// scheduled and whatever outcome the last attempt produced is delivered
    /// as-is.
    ///
    /// Defaults to unlimited.
    pub fn with_total_timeout(mut self, timeout: Duration) -> Self {
        self.total_timeout = Some(timeout);
        self
    }

    /// Allows a call to run for as long as it takes.
    pub fn without_total_timeout(mut self) -> Self {
        self.total_timeout = None;
        self
    }

    /// Sets the per-attempt timeout.
    ///
    /// An attempt that exceeds it is cut off and surfaces to the strategy as
    /// a timeout error, retryable like any other attempt error. The effective
    /// timeout is never longer than what remains of the total budget.
    ///
    /// Defaults to inheriting whatever remains of the total budget.
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    /// Lets each attempt inherit the remaining total budget.
    pub fn without_attempt_timeout(mut self) -> Self {
        self.attempt_timeout = None;
        self
    }

    /// Honors `Retry-After` response headers when pacing retries.
    ///
    /// When enabled and a retried response carries a `Retry-After` header
    /// (delay seconds or an HTTP-date), the server's value replaces the
    /// backoff policy's delay for that retry. The hint is still subject to
    /// the attempt limit and the total budget.
    ///
    /// Defaults to disabled.
    pub fn with_retry_after_hints(mut self) -> Self {
        self.use_retry_after = true;
        self
    }

    /// Sets how many response body bytes are buffered for the strategy.
    ///
    /// Strategies can inspect up to this many bytes of a response body before
    /// deciding. The buffered prefix is stitched back onto the body the
    /// caller receives, so the full body arrives either way.
    ///
    /// Defaults to 0, which disables previewing.
    pub fn with_content_preview_length(mut self, limit: usize) -> Self {
        self.content_preview_length = limit;
        self
    }

    /// Builds the `RetryingClient` around `service`.
    ///
    /// # Errors
    ///
    /// If a configured timeout is zero, an error is returned.
    pub fn build<S, B, RB>(self, service: S) -> Result<RetryingClient<B, RB>, anyhow::Error>
    where
        S: Service<Request<ReplayBody<B>>, Response = Response<RB>> + Clone + Send + 'static,
        S::Error: Into<BoxError>,
        S::Future: Send + 'static,
        T: RetryStrategy + 'static,
        B: 'static,
        RB: 'static,
    {
        if self.total_timeout.map_or(false, |timeout| timeout.is_zero()) {
            return Err(anyhow!("total timeout must be non-zero when set"));
        }
        if self.attempt_timeout.map_or(false, |timeout| timeout.is_zero()) {
            return Err(anyhow!("attempt timeout must be non-zero when set"));
        }

        let inner: BoxCloneService<Request<ReplayBody<B>>, Response<RB>, BoxError> =
            service.map_err(Into::into).boxed_clone();

        Ok(RetryingClient {
            inner,
            strategy: Arc::new(self.strategy),
            settings: RetrySettings {
                max_total_attempts: self.max_total_attempts,
                total_timeout: self.total_timeout,
                attempt_timeout: self.attempt_timeout,
                use_retry_after: self.use_retry_after,
                content_preview_length: self.content_preview_length,
            },
            telemetry: RetryTelemetry::new(),
        })
    }
}

impl Default for RetryingClientBuilder {
    fn default() -> Self {
        Self {
            strategy: OnServerErrors::new(),
            max_total_attempts: 10,
            total_timeout: None,
            attempt_timeout: None,
            use_retry_after: false,
            content_preview_length: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http_body_util::Full;
    use tower::service_fn;

    use super::*;

    #[test]
    fn defaults_are_sane() {
        let builder = RetryingClient::builder();

        assert_eq!(builder.max_total_attempts, 10);
        assert!(builder.total_timeout.is_none());
        assert!(builder.attempt_timeout.is_none());
        assert!(!builder.use_retry_after);
        assert_eq!(builder.content_preview_length, 0);
    }

    #[test]
    fn build_rejects_zero_timeouts() {
        let service = service_fn(|_request: Request<ReplayBody<Full<Bytes>>>| async {
            Ok::<_, BoxError>(Response::new(Full::new(Bytes::new())))
        });

        let result = RetryingClient::builder()
            .with_total_timeout(Duration::ZERO)
            .build::<_, Full<Bytes>, Full<Bytes>>(service.clone());
        assert!(result.is_err());

        let result = RetryingClient::builder()
            .with_attempt_timeout(Duration::ZERO)
            .build::<_, Full<Bytes>, Full<Bytes>>(service);
        assert!(result.is_err());
    }
}
