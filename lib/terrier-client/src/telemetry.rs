use metrics::{counter, Counter};

/// Retry-loop telemetry.
///
/// Counters are registered once per client and shared by every call that
/// client drives, so cloning is cheap.
#[derive(Clone)]
pub struct RetryTelemetry {
    attempts: Counter,
    retries_scheduled: Counter,
    server_hints_honored: Counter,
    calls_aborted: Counter,
    calls_failed: Counter,
    calls_exhausted: Counter,
    calls_deadline_exceeded: Counter,
}

impl RetryTelemetry {
    /// Creates telemetry registered under the standard metric names.
    pub fn new() -> Self {
        Self {
            attempts: counter!("http_retry_attempts_total"),
            retries_scheduled: counter!("http_retry_retries_scheduled_total"),
            server_hints_honored: counter!("http_retry_server_hints_honored_total"),
            calls_aborted: counter!("http_retry_calls_ended_total", "reason" => "aborted"),
            calls_failed: counter!("http_retry_calls_ended_total", "reason" => "failed"),
            calls_exhausted: counter!("http_retry_calls_ended_total", "reason" => "attempts_exhausted"),
            calls_deadline_exceeded: counter!("http_retry_calls_ended_total", "reason" => "deadline_exceeded"),
        }
    }

    pub(crate) fn attempts(&self) -> &Counter {
        &self.attempts
    }

    pub(crate) fn retries_scheduled(&self) -> &Counter {
        &self.retries_scheduled
    }

    pub(crate) fn server_hints_honored(&self) -> &Counter {
        &self.server_hints_honored
    }

    pub(crate) fn calls_aborted(&self) -> &Counter {
        &self.calls_aborted
    }

    pub(crate) fn calls_failed(&self) -> &Counter {
        &self.calls_failed
    }

    pub(crate) fn calls_exhausted(&self) -> &Counter {
        &self.calls_exhausted
    }

    pub(crate) fn calls_deadline_exceeded(&self) -> &Counter {
        &self.calls_deadline_exceeded
    }
}

impl Default for RetryTelemetry {
    fn default() -> Self {
        Self::new()
    }
}
