use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use http::{request, response, HeaderMap, StatusCode};
use terrier_retry::{Backoff, BackoffExt as _, ExponentialBackoff};
use tower::BoxError;

use crate::{body::ContentPreview, error::AttemptError};

/// Decides whether a finished attempt should be retried.
///
/// Invoked after every attempt with the original request head and a view of
/// what the attempt produced. Returning `Ok(Some(policy))` schedules another
/// attempt paced by `policy`, while `Ok(None)` stops the loop and delivers the
/// outcome as-is. A strategy may hand back a different policy on every
/// invocation, which allows pacing keyed on status codes or error classes.
///
/// An `Err` from the strategy never fails the call: the driver logs it and
/// behaves as if the strategy had said stop.
#[async_trait]
pub trait RetryStrategy: Send + Sync {
    /// Decides the fate of the attempt described by `attempt`.
    async fn should_retry(
        &self, request: &request::Parts, attempt: AttemptView<'_>,
    ) -> Result<Option<Arc<dyn Backoff>>, BoxError>;
}

/// A single attempt's result, as seen by the retry strategy.
pub enum AttemptView<'a> {
    /// The service produced a response. Any status code counts as a response.
    Response(ResponseView<'a>),
    /// The attempt failed before response headers arrived.
    Error(&'a AttemptError),
}

impl AttemptView<'_> {
    /// Status code of the response, if this attempt produced one.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Response(response) => Some(response.status()),
            Self::Error(_) => None,
        }
    }

    /// The attempt error, if this attempt failed without a response.
    pub fn error(&self) -> Option<&AttemptError> {
        match self {
            Self::Response(_) => None,
            Self::Error(e) => Some(e),
        }
    }
}

/// Read-only view of an attempt's response.
pub struct ResponseView<'a> {
    parts: &'a response::Parts,
    preview: &'a mut ContentPreview,
}

impl<'a> ResponseView<'a> {
    pub(crate) fn new(parts: &'a response::Parts, preview: &'a mut ContentPreview) -> Self {
        Self { parts, preview }
    }

    /// Response status code.
    pub fn status(&self) -> StatusCode {
        self.parts.status
    }

    /// Response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.parts.headers
    }

    /// Buffered prefix of the response body.
    ///
    /// Bounded by the client's configured content preview length. With
    /// previewing disabled this returns an empty buffer without polling the
    /// body, and the full body still reaches the caller either way.
    pub async fn content_preview(&mut self) -> Result<Bytes, BoxError> {
        self.preview.bytes().await
    }
}

/// Retries server errors (5xx) and every transport-level failure.
///
/// All retries are paced by one backoff policy. The default policy is
/// exponential, starting at 200 milliseconds and capped at 10 seconds, with
/// jitter applied so that concurrent callers spread out.
#[derive(Clone)]
pub struct OnServerErrors {
    backoff: Arc<dyn Backoff>,
}

impl OnServerErrors {
    /// Creates the strategy with the default backoff policy.
    pub fn new() -> Self {
        Self {
            backoff: Arc::new(
                ExponentialBackoff::new(Duration::from_millis(200), Duration::from_secs(10))
                    .with_jitter(2.0),
            ),
        }
    }

    /// Creates the strategy with a custom backoff policy.
    pub fn with_backoff<B>(backoff: B) -> Self
    where
        B: Backoff + 'static,
    {
        Self { backoff: Arc::new(backoff) }
    }
}

impl Default for OnServerErrors {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RetryStrategy for OnServerErrors {
    async fn should_retry(
        &self, _request: &request::Parts, attempt: AttemptView<'_>,
    ) -> Result<Option<Arc<dyn Backoff>>, BoxError> {
        let retry = match &attempt {
            AttemptView::Response(response) => response.status().is_server_error(),
            AttemptView::Error(_) => true,
        };

        Ok(retry.then(|| Arc::clone(&self.backoff)))
    }
}

/// Retry strategy built from a plain condition function.
///
/// The function receives the response status (`None` when the attempt failed
/// outright) and the attempt error (`None` when a response arrived), and
/// returns the pacing policy for that condition, or `None` to stop.
#[derive(Clone)]
pub struct OnStatus<F> {
    decide: F,
}

impl<F> OnStatus<F>
where
    F: Fn(Option<StatusCode>, Option<&AttemptError>) -> Option<Arc<dyn Backoff>> + Send + Sync,
{
    /// Wraps `decide` as a retry strategy.
    pub fn new(decide: F) -> Self {
        Self { decide }
    }
}

#[async_trait]
impl<F> RetryStrategy for OnStatus<F>
where
    F: Fn(Option<StatusCode>, Option<&AttemptError>) -> Option<Arc<dyn Backoff>> + Send + Sync,
{
    async fn should_retry(
        &self, _request: &request::Parts, attempt: AttemptView<'_>,
    ) -> Result<Option<Arc<dyn Backoff>>, BoxError> {
        Ok((self.decide)(attempt.status(), attempt.error()))
    }
}
