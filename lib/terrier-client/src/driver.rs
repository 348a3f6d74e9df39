//! The retry loop itself: one spawned task per logical call.

use std::{
    fmt::{self, Write as _},
    sync::Arc,
    time::Duration,
};

use bytes::{Buf, Bytes};
use http::{Request, Response, StatusCode};
use http_body::Body;
use http_body_util::{combinators::UnsyncBoxBody, BodyExt as _};
use terrier_retry::{Deadline, RetryAfter};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower::{BoxError, Service, ServiceExt as _};
use tracing::{debug, warn};

use crate::{
    body::{ContentPreview, ReplayBody},
    error::{AttemptError, CallError},
    handle::CallResult,
    strategy::{AttemptView, ResponseView, RetryStrategy},
    telemetry::RetryTelemetry,
};

/// Limits and knobs the driver applies to a single call.
#[derive(Clone, Debug)]
pub(crate) struct RetrySettings {
    /// Maximum number of attempts across the whole call, zero = unlimited.
    pub max_total_attempts: u32,
    /// Wall-clock budget for the whole call, `None` = unlimited.
    pub total_timeout: Option<Duration>,
    /// Budget for a single attempt, `None` = inherit what remains of the total.
    pub attempt_timeout: Option<Duration>,
    /// Whether `Retry-After` response headers override the backoff policy.
    pub use_retry_after: bool,
    /// Response body bytes buffered for the strategy to inspect, zero = off.
    pub content_preview_length: usize,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum CompletionReason {
    Success,
    Failed,
    AttemptsExhausted,
    DeadlineExceeded,
    Aborted,
}

impl fmt::Display for CompletionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("success"),
            Self::Failed => f.write_str("failed"),
            Self::AttemptsExhausted => f.write_str("attempts_exhausted"),
            Self::DeadlineExceeded => f.write_str("deadline_exceeded"),
            Self::Aborted => f.write_str("aborted"),
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum Disposition {
    Status(StatusCode),
    TransportError,
    TimedOut,
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status(status) => write!(f, "status={}", status.as_u16()),
            Self::TransportError => f.write_str("transport_error"),
            Self::TimedOut => f.write_str("timed_out"),
        }
    }
}

struct AttemptRecord {
    index: u32,
    started_at: Instant,
    ended_at: Instant,
    disposition: Disposition,
}

enum NextStep {
    Schedule(Duration),
    GiveUp(CompletionReason),
}

/// Drives attempts for one call until a terminal outcome is reached.
///
/// Exactly one attempt is in flight at a time. The loop only ends through one
/// of the stop conditions: the strategy saying stop, the attempt limit, the
/// total deadline, or an explicit abort. The consumer dropping its handle is
/// deliberately not a stop condition.
pub(crate) async fn run_attempts<S, B, RB>(
    mut service: S, strategy: Arc<dyn RetryStrategy>, settings: RetrySettings, telemetry: RetryTelemetry,
    request: Request<ReplayBody<B>>, abort: CancellationToken,
) -> CallResult
where
    S: Service<Request<ReplayBody<B>>, Response = Response<RB>>,
    S::Error: Into<BoxError>,
    B: Body + Unpin,
    B::Error: Into<BoxError>,
    RB: Body + Send + 'static,
    RB::Error: Into<BoxError>,
{
    let deadline = Deadline::new(settings.total_timeout, settings.attempt_timeout);
    let (parts, body) = request.into_parts();

    let mut history = Vec::new();
    let mut attempt_no: u32 = 0;

    loop {
        // An abort observed before dispatch means this attempt never starts.
        if abort.is_cancelled() {
            return finish_aborted(attempt_no, &history, &deadline, &telemetry);
        }

        attempt_no += 1;
        telemetry.attempts().increment(1);
        debug!(attempt = attempt_no, "Starting attempt.");

        let attempt_request = Request::from_parts(parts.clone(), body.clone());
        let started_at = Instant::now();
        let timeout = deadline.attempt_timeout();

        let outcome = tokio::select! {
            // Abort wins over a completing attempt; the dropped send future
            // cancels whatever the transport had in flight.
            biased;

            _ = abort.cancelled() => {
                return finish_aborted(attempt_no, &history, &deadline, &telemetry);
            }
            outcome = send_attempt(&mut service, attempt_request, timeout) => outcome,
        };

        match outcome {
            Ok(response) => {
                let (response_parts, response_body) = response.into_parts();
                history.push(AttemptRecord {
                    index: attempt_no,
                    started_at,
                    ended_at: Instant::now(),
                    disposition: Disposition::Status(response_parts.status),
                });

                let erased: UnsyncBoxBody<Bytes, BoxError> = response_body
                    .map_frame(|frame| frame.map_data(|mut data| data.copy_to_bytes(data.remaining())))
                    .map_err(Into::into)
                    .boxed_unsync();
                let mut preview = ContentPreview::new(erased, settings.content_preview_length);

                let view = AttemptView::Response(ResponseView::new(&response_parts, &mut preview));
                let consulted = tokio::select! {
                    // A consult can sit in a preview read of the response body;
                    // abort wins there too, and dropping the consult future
                    // abandons the read.
                    biased;

                    _ = abort.cancelled() => {
                        return finish_aborted(attempt_no, &history, &deadline, &telemetry);
                    }
                    decision = strategy.should_retry(&parts, view) => decision,
                };
                let decision = match consulted {
                    Ok(decision) => decision,
                    Err(error) => {
                        warn!(attempt = attempt_no, %error, "Retry strategy failed; delivering current response.");
                        None
                    }
                };

                let policy = match decision {
                    Some(policy) => policy,
                    None => {
                        let reason = CompletionReason::Success;
                        bump_completion(&telemetry, reason);
                        log_completion(reason, attempt_no, &history, &deadline);
                        return Ok(Response::from_parts(response_parts, preview.into_body()));
                    }
                };

                // A server pacing hint wins over the policy when enabled.
                let hint = settings
                    .use_retry_after
                    .then(|| RetryAfter::from_headers(&response_parts.headers))
                    .flatten();
                let delay = match &hint {
                    Some(hint) => Some(hint.delay_from_now()),
                    None => policy.next_delay(attempt_no),
                };

                match schedule_next(attempt_no, delay, &deadline, settings.max_total_attempts) {
                    NextStep::Schedule(delay) => {
                        if hint.is_some() {
                            telemetry.server_hints_honored().increment(1);
                        }
                        telemetry.retries_scheduled().increment(1);
                        debug!(
                            attempt = attempt_no,
                            status = response_parts.status.as_u16(),
                            delay_ms = delay.as_millis() as u64,
                            hinted = hint.is_some(),
                            "Scheduling retry."
                        );

                        tokio::select! {
                            biased;

                            _ = abort.cancelled() => {
                                return finish_aborted(attempt_no, &history, &deadline, &telemetry);
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    NextStep::GiveUp(reason) => {
                        // Give-up with a real response in hand delivers that
                        // response, never an error of our own making.
                        bump_completion(&telemetry, reason);
                        log_completion(reason, attempt_no, &history, &deadline);
                        return Ok(Response::from_parts(response_parts, preview.into_body()));
                    }
                }
            }
            Err(error) => {
                let disposition = if error.is_timeout() {
                    Disposition::TimedOut
                } else {
                    Disposition::TransportError
                };
                history.push(AttemptRecord {
                    index: attempt_no,
                    started_at,
                    ended_at: Instant::now(),
                    disposition,
                });
                warn!(attempt = attempt_no, %error, "Attempt failed.");

                let consulted = tokio::select! {
                    biased;

                    _ = abort.cancelled() => {
                        return finish_aborted(attempt_no, &history, &deadline, &telemetry);
                    }
                    decision = strategy.should_retry(&parts, AttemptView::Error(&error)) => decision,
                };
                let decision = match consulted {
                    Ok(decision) => decision,
                    Err(strategy_error) => {
                        warn!(
                            attempt = attempt_no,
                            error = %strategy_error,
                            "Retry strategy failed; propagating attempt error."
                        );
                        None
                    }
                };

                let step = match decision {
                    Some(policy) => {
                        schedule_next(attempt_no, policy.next_delay(attempt_no), &deadline, settings.max_total_attempts)
                    }
                    None => NextStep::GiveUp(CompletionReason::Failed),
                };

                match step {
                    NextStep::Schedule(delay) => {
                        telemetry.retries_scheduled().increment(1);
                        debug!(
                            attempt = attempt_no,
                            delay_ms = delay.as_millis() as u64,
                            "Scheduling retry after failed attempt."
                        );

                        tokio::select! {
                            biased;

                            _ = abort.cancelled() => {
                                return finish_aborted(attempt_no, &history, &deadline, &telemetry);
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    NextStep::GiveUp(reason) => {
                        bump_completion(&telemetry, reason);
                        log_completion(reason, attempt_no, &history, &deadline);
                        return Err(CallError::Failed { attempts: attempt_no, source: error });
                    }
                }
            }
        }
    }
}

async fn send_attempt<S, Req, RB>(
    service: &mut S, request: Req, timeout: Option<Duration>,
) -> Result<Response<RB>, AttemptError>
where
    S: Service<Req, Response = Response<RB>>,
    S::Error: Into<BoxError>,
{
    let send = async {
        let ready = service.ready().await?;
        ready.call(request).await
    };

    match timeout {
        Some(limit) => match tokio::time::timeout(limit, send).await {
            Ok(result) => result.map_err(|e| AttemptError::Transport { source: e.into() }),
            Err(_) => Err(AttemptError::TimedOut { elapsed: limit }),
        },
        None => send.await.map_err(|e| AttemptError::Transport { source: e.into() }),
    }
}

/// Decides whether attempt `attempt_no + 1` may be scheduled `delay` from now.
fn schedule_next(attempt_no: u32, delay: Option<Duration>, deadline: &Deadline, max_total_attempts: u32) -> NextStep {
    if max_total_attempts != 0 && attempt_no >= max_total_attempts {
        return NextStep::GiveUp(CompletionReason::AttemptsExhausted);
    }

    // The policy having nothing to offer for this attempt index counts as
    // exhaustion too.
    let Some(delay) = delay else {
        return NextStep::GiveUp(CompletionReason::AttemptsExhausted);
    };

    if !deadline.allows_delay(delay) {
        return NextStep::GiveUp(CompletionReason::DeadlineExceeded);
    }

    NextStep::Schedule(delay)
}

fn finish_aborted(
    attempts_started: u32, history: &[AttemptRecord], deadline: &Deadline, telemetry: &RetryTelemetry,
) -> CallResult {
    bump_completion(telemetry, CompletionReason::Aborted);
    log_completion(CompletionReason::Aborted, attempts_started, history, deadline);
    Err(CallError::Aborted { attempts_started })
}

fn bump_completion(telemetry: &RetryTelemetry, reason: CompletionReason) {
    match reason {
        CompletionReason::Success => {}
        CompletionReason::Failed => telemetry.calls_failed().increment(1),
        CompletionReason::AttemptsExhausted => telemetry.calls_exhausted().increment(1),
        CompletionReason::DeadlineExceeded => telemetry.calls_deadline_exceeded().increment(1),
        CompletionReason::Aborted => telemetry.calls_aborted().increment(1),
    }
}

fn log_completion(reason: CompletionReason, attempts: u32, history: &[AttemptRecord], deadline: &Deadline) {
    debug!(
        reason = %reason,
        attempts,
        elapsed_ms = deadline.elapsed().as_millis() as u64,
        history = %render_history(history),
        "Call settled."
    );
}

fn render_history(history: &[AttemptRecord]) -> String {
    let mut rendered = String::new();
    for record in history {
        if !rendered.is_empty() {
            rendered.push(' ');
        }
        let elapsed = record.ended_at.duration_since(record.started_at);
        let _ = write!(rendered, "{}:{}({}ms)", record.index, record.disposition, elapsed.as_millis());
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn gives_up_when_attempts_are_exhausted() {
        let deadline = Deadline::new(None, None);

        assert!(matches!(
            schedule_next(3, Some(Duration::from_millis(10)), &deadline, 3),
            NextStep::GiveUp(CompletionReason::AttemptsExhausted)
        ));
        assert!(matches!(
            schedule_next(2, Some(Duration::from_millis(10)), &deadline, 3),
            NextStep::Schedule(_)
        ));

        // Zero means unlimited.
        assert!(matches!(
            schedule_next(10_000, Some(Duration::from_millis(10)), &deadline, 0),
            NextStep::Schedule(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_when_the_policy_is_exhausted() {
        let deadline = Deadline::new(None, None);

        assert!(matches!(
            schedule_next(1, None, &deadline, 0),
            NextStep::GiveUp(CompletionReason::AttemptsExhausted)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_when_the_delay_overruns_the_deadline() {
        let deadline = Deadline::new(Some(Duration::from_secs(5)), None);

        assert!(matches!(
            schedule_next(1, Some(Duration::from_secs(10)), &deadline, 0),
            NextStep::GiveUp(CompletionReason::DeadlineExceeded)
        ));
        assert!(matches!(
            schedule_next(1, Some(Duration::from_secs(1)), &deadline, 0),
            NextStep::Schedule(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn renders_attempt_history() {
        let at = Instant::now();
        let history = vec![
            AttemptRecord {
                index: 1,
                started_at: at,
                ended_at: at,
                disposition: Disposition::Status(StatusCode::SERVICE_UNAVAILABLE),
            },
            AttemptRecord { index: 2, started_at: at, ended_at: at, disposition: Disposition::TimedOut },
        ];

        assert_eq!(render_history(&history), "1:status=503(0ms) 2:timed_out(0ms)");
    }
}
