//! Retry pacing primitives.
//!
//! `terrier-retry` holds the pure arithmetic behind retrying a request: backoff policies
//! that map an attempt number to a delay (`Backoff` and its combinators), time budget
//! tracking for an overall call and its individual attempts (`Deadline`), and
//! interpretation of server-supplied `Retry-After` hints (`RetryAfter`). Nothing in this
//! crate performs I/O or drives a retry loop itself.
#![deny(warnings)]
#![deny(missing_docs)]

mod backoff;
pub use self::backoff::{
    Backoff, BackoffExt, BackoffRng, ExponentialBackoff, FixedBackoff, JitteredBackoff, LimitedBackoff,
    SequentialBackoff,
};

mod deadline;
pub use self::deadline::Deadline;

mod retry_after;
pub use self::retry_after::RetryAfter;
