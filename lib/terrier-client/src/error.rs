use std::time::Duration;

use snafu::Snafu;
use tower::BoxError;

/// An error raised by a single attempt.
///
/// Attempt errors are fed back into the retry strategy, which decides whether
/// the call keeps going. Only the error from the final attempt surfaces to the
/// caller, wrapped in [`CallError::Failed`].
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum AttemptError {
    /// The attempt outlived its time allowance before producing response headers.
    #[snafu(display("attempt timed out after {elapsed:?}"))]
    TimedOut {
        /// How long the attempt was allowed to run.
        elapsed: Duration,
    },

    /// The underlying service failed to produce a response.
    #[snafu(display("transport error: {source}"))]
    Transport { source: BoxError },
}

impl AttemptError {
    /// Whether this attempt failed by exceeding its time allowance.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }
}

/// Terminal error for a retried call.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum CallError {
    /// The caller explicitly aborted the call before it completed.
    #[snafu(display("call aborted after {attempts_started} attempt(s) started"))]
    Aborted {
        /// Attempts already dispatched when the abort was observed.
        attempts_started: u32,
    },

    /// The task driving the call went away before the call completed.
    #[snafu(display("executor closed before the call completed"))]
    ExecutorClosed,

    /// Every attempt failed and no further attempt was permitted.
    #[snafu(display("call failed after {attempts} attempt(s): {source}"))]
    Failed {
        /// Number of attempts dispatched over the lifetime of the call.
        attempts: u32,
        source: AttemptError,
    },
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[test]
    fn display_includes_attempt_counts() {
        let err = CallError::Failed {
            attempts: 3,
            source: AttemptError::TimedOut { elapsed: Duration::from_secs(5) },
        };

        let rendered = err.to_string();
        assert!(rendered.contains("3 attempt(s)"));
        assert!(rendered.contains("timed out"));
        assert!(err.source().is_some());
    }

    #[test]
    fn transport_error_preserves_message() {
        let err = AttemptError::Transport { source: "connection reset".into() };
        assert_eq!(err.to_string(), "transport error: connection reset");
        assert!(!err.is_timeout());
    }
}
