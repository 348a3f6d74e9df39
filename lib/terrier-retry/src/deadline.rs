use std::time::Duration;

use tokio::time::Instant;

/// The time budget of a retrying call.
///
/// Tracks two independent limits: a total budget covering the whole call from first
/// attempt to final verdict, and a per-attempt budget applied to each individual
/// attempt. Either limit can be absent: an absent total budget never expires, and an
/// absent per-attempt budget lets each attempt run for whatever remains of the total.
///
/// Timing is based on [`tokio::time::Instant`], so tests driving the Tokio clock
/// observe the budget advancing with it.
#[derive(Clone, Debug)]
pub struct Deadline {
    started: Instant,
    total: Option<Duration>,
    per_attempt: Option<Duration>,
}

impl Deadline {
    /// Creates a new `Deadline` starting now.
    pub fn new(total: Option<Duration>, per_attempt: Option<Duration>) -> Self {
        Self {
            started: Instant::now(),
            total,
            per_attempt,
        }
    }

    /// Time elapsed since the deadline started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Remaining total budget, or `None` when the total budget is unlimited.
    pub fn remaining(&self) -> Option<Duration> {
        self.total.map(|total| total.saturating_sub(self.started.elapsed()))
    }

    /// The time limit for the next attempt: the smaller of the per-attempt budget and
    /// whatever remains of the total budget.
    ///
    /// Returns `None` when both budgets are unlimited.
    pub fn attempt_timeout(&self) -> Option<Duration> {
        match (self.per_attempt, self.remaining()) {
            (Some(per_attempt), Some(remaining)) => Some(per_attempt.min(remaining)),
            (Some(per_attempt), None) => Some(per_attempt),
            (None, remaining) => remaining,
        }
    }

    /// Whether an attempt started `delay` from now would begin strictly before the
    /// total budget runs out.
    ///
    /// Always true when the total budget is unlimited. False once the budget has
    /// fully elapsed, even for a zero delay.
    pub fn allows_delay(&self, delay: Duration) -> bool {
        match self.remaining() {
            Some(remaining) => delay < remaining,
            None => true,
        }
    }
}
