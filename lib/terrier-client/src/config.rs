use std::time::Duration;

use serde::Deserialize;

use crate::client::RetryingClientBuilder;

const fn default_max_total_attempts() -> u32 {
    10
}

const fn default_total_timeout_secs() -> f64 {
    0.0
}

const fn default_attempt_timeout_secs() -> f64 {
    0.0
}

const fn default_use_retry_after() -> bool {
    false
}

const fn default_content_preview_length() -> usize {
    0
}

/// Retry behavior configuration, in a form suitable for deserializing from an
/// application's settings.
///
/// Timeout values are expressed in seconds, with `0` meaning unlimited (total
/// timeout) or inherit-the-remaining-budget (attempt timeout), so a `0` in a
/// config file is equivalent to leaving the field out entirely.
#[derive(Deserialize)]
pub struct RetryConfiguration {
    /// Maximum number of attempts for a single call.
    ///
    /// `0` means unlimited. Defaults to 10.
    #[serde(default = "default_max_total_attempts", rename = "retry_max_total_attempts")]
    max_total_attempts: u32,

    /// Wall-clock budget for a whole call, in seconds.
    ///
    /// `0` means unlimited. Defaults to 0.
    #[serde(default = "default_total_timeout_secs", rename = "retry_total_timeout_secs")]
    total_timeout_secs: f64,

    /// Budget for each individual attempt, in seconds.
    ///
    /// `0` means each attempt inherits whatever remains of the total budget.
    /// Defaults to 0.
    #[serde(default = "default_attempt_timeout_secs", rename = "retry_attempt_timeout_secs")]
    attempt_timeout_secs: f64,

    /// Whether `Retry-After` response headers override the backoff policy.
    ///
    /// Defaults to `false`.
    #[serde(default = "default_use_retry_after", rename = "retry_use_retry_after")]
    use_retry_after: bool,

    /// Response body bytes buffered for the retry strategy to inspect.
    ///
    /// `0` disables previewing. Defaults to 0.
    #[serde(default = "default_content_preview_length", rename = "retry_content_preview_length")]
    content_preview_length: usize,
}

impl RetryConfiguration {
    /// Creates a client builder configured from these settings.
    ///
    /// The builder starts from the default retry strategy; callers that want
    /// a custom one can swap it afterwards with
    /// [`with_strategy`](RetryingClientBuilder::with_strategy).
    pub fn into_client_builder(&self) -> RetryingClientBuilder {
        let mut builder = RetryingClientBuilder::default()
            .with_max_total_attempts(self.max_total_attempts)
            .with_content_preview_length(self.content_preview_length);

        if self.total_timeout_secs.is_finite() && self.total_timeout_secs > 0.0 {
            builder = builder.with_total_timeout(Duration::from_secs_f64(self.total_timeout_secs));
        }
        if self.attempt_timeout_secs.is_finite() && self.attempt_timeout_secs > 0.0 {
            builder = builder.with_attempt_timeout(Duration::from_secs_f64(self.attempt_timeout_secs));
        }
        if self.use_retry_after {
            builder = builder.with_retry_after_hints();
        }

        builder
    }
}

impl Default for RetryConfiguration {
    fn default() -> Self {
        Self {
            max_total_attempts: default_max_total_attempts(),
            total_timeout_secs: default_total_timeout_secs(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
            use_retry_after: default_use_retry_after(),
            content_preview_length: default_content_preview_length(),
        }
    }
}
