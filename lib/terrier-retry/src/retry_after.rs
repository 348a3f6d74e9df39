use std::time::{Duration, SystemTime};

use chrono::DateTime;
use http::{header, HeaderMap};

/// A parsed `Retry-After` hint.
///
/// Servers express the hint either as a non-negative number of whole seconds or as an
/// absolute HTTP-date. Both forms reduce to a delay via
/// [`delay_from_now`](Self::delay_from_now).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RetryAfter {
    /// A relative delay, in whole seconds.
    Seconds(u64),

    /// An absolute point in time.
    At(SystemTime),
}

impl RetryAfter {
    /// Parses a `Retry-After` value.
    ///
    /// Returns `None` for values that are neither a non-negative integer second count
    /// nor an HTTP-date, leaving it to the caller to fall back to its own pacing.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if let Ok(seconds) = value.parse::<u64>() {
            return Some(Self::Seconds(seconds));
        }

        DateTime::parse_from_rfc2822(value)
            .ok()
            .map(|date| Self::At(SystemTime::from(date)))
    }

    /// Extracts and parses the `Retry-After` hint from a set of response headers.
    ///
    /// Returns `None` when the header is absent or unparseable.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let value = headers.get(header::RETRY_AFTER)?;
        Self::parse(value.to_str().ok()?)
    }

    /// The delay this hint asks for, measured from now.
    ///
    /// Absolute hints that are already in the past yield a zero delay.
    pub fn delay_from_now(&self) -> Duration {
        match self {
            Self::Seconds(seconds) => Duration::from_secs(*seconds),
            Self::At(when) => when
                .duration_since(SystemTime::now())
                .unwrap_or(Duration::ZERO),
        }
    }
}
