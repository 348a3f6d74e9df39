//! An asynchronous HTTP client wrapper that retries failed calls.
//!
//! `terrier-client` wraps any `tower::Service` speaking `http` request and
//! response types in a retry loop driven by a pluggable decision strategy:
//! after every attempt the strategy inspects the outcome (status, headers, an
//! optional bounded preview of the response body, or the attempt error) and
//! either stops, delivering that outcome as-is, or picks a backoff policy to
//! pace the next attempt. Request bodies are captured on first read so that
//! every attempt sends byte-identical content, attempt and wall-clock limits
//! are enforced without ever discarding a real response, and in-flight calls
//! can be aborted from anywhere.
//!
//! Each call runs on its own spawned driver task. The caller holds a
//! [`ResponseHandle`] that resolves once the loop settles; dropping the
//! handle leaves the loop running, and only an explicit abort stops it early.
#![deny(warnings)]

mod body;
mod client;
mod config;
mod driver;
mod error;
mod handle;
mod strategy;
mod telemetry;

pub use self::body::{ContentPreview, PreviewedBody, ReplayBody};
pub use self::client::{RetryingClient, RetryingClientBuilder};
pub use self::config::RetryConfiguration;
pub use self::error::{AttemptError, CallError};
pub use self::handle::{AbortHandle, CallResult, ResponseHandle};
pub use self::strategy::{AttemptView, OnServerErrors, OnStatus, ResponseView, RetryStrategy};
