use std::{
    fmt,
    sync::{Arc, Mutex},
    time::Duration,
};

use rand::{thread_rng, Rng as _, RngCore};

/// A retry pacing policy.
///
/// A backoff maps the number of attempts made so far to the delay that should pass
/// before the next attempt, or reports that no further attempt should be made at all.
/// Implementations are pure: calling [`next_delay`](Self::next_delay) must not change
/// the answer for a given attempt number, which allows a single policy to be shared
/// between many in-flight calls.
pub trait Backoff: Send + Sync {
    /// Returns the delay to wait before the next attempt, given that `attempt_no`
    /// attempts have already completed.
    ///
    /// Attempt numbering starts at 1: the value passed after the first attempt is 1,
    /// after the second attempt 2, and so on.
    ///
    /// Returns `None` when the policy is exhausted and no further attempt should be
    /// made. A zero-length delay is a valid answer and means "retry immediately",
    /// which is distinct from exhaustion.
    fn next_delay(&self, attempt_no: u32) -> Option<Duration>;
}

impl<B> Backoff for Arc<B>
where
    B: Backoff + ?Sized,
{
    fn next_delay(&self, attempt_no: u32) -> Option<Duration> {
        (**self).next_delay(attempt_no)
    }
}

impl<B> Backoff for Box<B>
where
    B: Backoff + ?Sized,
{
    fn next_delay(&self, attempt_no: u32) -> Option<Duration> {
        (**self).next_delay(attempt_no)
    }
}

/// A source of randomness for jittered backoff durations.
#[derive(Clone)]
pub enum BackoffRng {
    /// A lazily-initialized, thread-local CSPRNG seeded by the operating system.
    ///
    /// Provided by [`rand::ThreadRng`][rand_threadrng].
    ///
    /// [rand_threadrng]: https://docs.rs/rand/latest/rand/rngs/struct.ThreadRng.html
    SecureDefault,

    /// A shared random number generator.
    Shared(Arc<Mutex<Box<dyn RngCore + Send + Sync>>>),
}

impl fmt::Debug for BackoffRng {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackoffRng::SecureDefault => f.debug_tuple("SecureDefault").finish(),
            BackoffRng::Shared(_) => f.debug_tuple("Shared").finish(),
        }
    }
}

impl RngCore for BackoffRng {
    fn next_u32(&mut self) -> u32 {
        match self {
            BackoffRng::SecureDefault => thread_rng().next_u32(),
            BackoffRng::Shared(rng) => rng.lock().unwrap().next_u32(),
        }
    }

    fn next_u64(&mut self) -> u64 {
        match self {
            BackoffRng::SecureDefault => thread_rng().next_u64(),
            BackoffRng::Shared(rng) => rng.lock().unwrap().next_u64(),
        }
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        match self {
            BackoffRng::SecureDefault => thread_rng().fill_bytes(dest),
            BackoffRng::Shared(rng) => rng.lock().unwrap().fill_bytes(dest),
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        match self {
            BackoffRng::SecureDefault => thread_rng().try_fill_bytes(dest),
            BackoffRng::Shared(rng) => rng.lock().unwrap().try_fill_bytes(dest),
        }
    }
}

/// A backoff that waits the same amount of time after every attempt.
///
/// Never exhausts. A zero-length delay yields immediate retries, and is typically
/// paired with an attempt limit via [`BackoffExt::with_max_attempts`].
#[derive(Clone, Debug)]
pub struct FixedBackoff {
    delay: Duration,
}

impl FixedBackoff {
    /// Creates a new `FixedBackoff` with the given delay.
    pub const fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Backoff for FixedBackoff {
    fn next_delay(&self, _attempt_no: u32) -> Option<Duration> {
        Some(self.delay)
    }
}

/// A backoff whose delay grows geometrically with the attempt number.
///
/// The delay after attempt `n` is `initial_delay * growth_factor^(n - 1)`, capped at
/// the configured ceiling. Never exhausts.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    growth_factor: f64,
}

impl ExponentialBackoff {
    /// Creates a new `ExponentialBackoff` with the given initial delay and ceiling,
    /// doubling the delay after each attempt.
    ///
    /// A ceiling smaller than the initial delay is raised to the initial delay.
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self::with_growth_factor(initial_delay, max_delay, 2.0)
    }

    /// Creates a new `ExponentialBackoff` with the given initial delay, ceiling, and
    /// growth factor.
    ///
    /// Growth factors below 1.0 are raised to 1.0, which degenerates into a fixed
    /// delay. A ceiling smaller than the initial delay is raised to the initial delay.
    pub fn with_growth_factor(initial_delay: Duration, max_delay: Duration, growth_factor: f64) -> Self {
        Self {
            initial_delay,
            max_delay: max_delay.max(initial_delay),
            growth_factor: growth_factor.max(1.0),
        }
    }
}

impl Backoff for ExponentialBackoff {
    fn next_delay(&self, attempt_no: u32) -> Option<Duration> {
        let exponent = attempt_no.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled = self.initial_delay.as_secs_f64() * self.growth_factor.powi(exponent);

        // Anything that overflows the ceiling, including the non-finite results of
        // very large exponents, saturates at the ceiling.
        let delay = if scaled.is_finite() && scaled < self.max_delay.as_secs_f64() {
            Duration::from_secs_f64(scaled)
        } else {
            self.max_delay
        };

        Some(delay.clamp(self.initial_delay, self.max_delay))
    }
}

/// A backoff that limits how many attempts another backoff may pace.
///
/// Exhausts once the attempt number reaches the configured maximum, so a limit of
/// `n` allows at most `n` total attempts. A limit of zero is exhausted from the start.
#[derive(Clone, Debug)]
pub struct LimitedBackoff<B> {
    inner: B,
    max_attempts: u32,
}

impl<B> LimitedBackoff<B>
where
    B: Backoff,
{
    /// Creates a new `LimitedBackoff` around the given backoff.
    pub const fn new(inner: B, max_attempts: u32) -> Self {
        Self { inner, max_attempts }
    }
}

impl<B> Backoff for LimitedBackoff<B>
where
    B: Backoff,
{
    fn next_delay(&self, attempt_no: u32) -> Option<Duration> {
        if attempt_no >= self.max_attempts {
            return None;
        }

        self.inner.next_delay(attempt_no)
    }
}

/// A backoff that delegates to a first backoff until it exhausts, and to a second one
/// from then on.
///
/// The second backoff observes the overall attempt number, not a number rebased to
/// the point where the first backoff ran out.
#[derive(Clone, Debug)]
pub struct SequentialBackoff<A, B> {
    first: A,
    second: B,
}

impl<A, B> SequentialBackoff<A, B>
where
    A: Backoff,
    B: Backoff,
{
    /// Creates a new `SequentialBackoff` from the given pair of backoffs.
    pub const fn new(first: A, second: B) -> Self {
        Self { first, second }
    }
}

impl<A, B> Backoff for SequentialBackoff<A, B>
where
    A: Backoff,
    B: Backoff,
{
    fn next_delay(&self, attempt_no: u32) -> Option<Duration> {
        self.first
            .next_delay(attempt_no)
            .or_else(|| self.second.next_delay(attempt_no))
    }
}

/// A backoff that applies random jitter to the delays of another backoff.
///
/// For a computed delay `d` and a minimum delay factor `f`, the jittered delay is
/// drawn uniformly from `d/f ..= d`, which spreads out callers that would otherwise
/// retry in lockstep. A factor of 1.0 or less disables jitter.
#[derive(Clone, Debug)]
pub struct JitteredBackoff<B> {
    inner: B,
    min_delay_factor: f64,
    rng: BackoffRng,
}

impl<B> JitteredBackoff<B>
where
    B: Backoff,
{
    /// Creates a new `JitteredBackoff` around the given backoff.
    ///
    /// Minimum delay factors below 1.0 are raised to 1.0, disabling jitter.
    pub fn new(inner: B, min_delay_factor: f64) -> Self {
        Self {
            inner,
            min_delay_factor: min_delay_factor.max(1.0),
            rng: BackoffRng::SecureDefault,
        }
    }

    /// Sets the random number generator used for sampling jittered delays.
    ///
    /// Useful for testing purposes, where the RNG must be overridden to add determinism. The RNG is shared atomically
    /// behind a mutex, allowing it to be cloned, so care should be taken to never use this outside of tests.
    ///
    /// Defaults to a lazily-initialized, thread-local CSPRNG seeded by the operating system.
    pub fn with_rng<R>(self, rng: R) -> Self
    where
        R: RngCore + Send + Sync + 'static,
    {
        Self {
            inner: self.inner,
            min_delay_factor: self.min_delay_factor,
            rng: BackoffRng::Shared(Arc::new(Mutex::new(Box::new(rng)))),
        }
    }
}

impl<B> Backoff for JitteredBackoff<B>
where
    B: Backoff,
{
    fn next_delay(&self, attempt_no: u32) -> Option<Duration> {
        let delay = self.inner.next_delay(attempt_no)?;
        if self.min_delay_factor <= 1.0 || delay.is_zero() {
            return Some(delay);
        }

        // Cloning the RNG handle is cheap: the default variant is a unit, and the
        // shared variant clones an `Arc` pointing at the same underlying generator.
        let mut rng = self.rng.clone();
        let lower = delay.div_f64(self.min_delay_factor);
        Some(rng.gen_range(lower..=delay))
    }
}

/// Extension methods for composing backoffs.
pub trait BackoffExt: Backoff + Sized {
    /// Limits this backoff to at most `max_attempts` total attempts.
    fn with_max_attempts(self, max_attempts: u32) -> LimitedBackoff<Self> {
        LimitedBackoff::new(self, max_attempts)
    }

    /// Applies random jitter to the delays of this backoff.
    ///
    /// See [`JitteredBackoff`] for the sampling behavior.
    fn with_jitter(self, min_delay_factor: f64) -> JitteredBackoff<Self> {
        JitteredBackoff::new(self, min_delay_factor)
    }

    /// Chains this backoff with another, switching to `next` once this one exhausts.
    fn then<B>(self, next: B) -> SequentialBackoff<Self, B>
    where
        B: Backoff,
    {
        SequentialBackoff::new(self, next)
    }
}

impl<B> BackoffExt for B where B: Backoff {}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use proptest::prelude::*;
    use rand::{rngs::StdRng, SeedableRng as _};

    use super::*;

    #[test]
    fn fixed_backoff_is_constant() {
        let backoff = FixedBackoff::new(Duration::from_millis(250));

        assert_eq!(backoff.next_delay(1), Some(Duration::from_millis(250)));
        assert_eq!(backoff.next_delay(2), Some(Duration::from_millis(250)));
        assert_eq!(backoff.next_delay(100), Some(Duration::from_millis(250)));
    }

    #[test]
    fn exponential_backoff_doubles_until_ceiling() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(1));

        assert_eq!(backoff.next_delay(1), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next_delay(2), Some(Duration::from_millis(200)));
        assert_eq!(backoff.next_delay(3), Some(Duration::from_millis(400)));
        assert_eq!(backoff.next_delay(4), Some(Duration::from_millis(800)));
        assert_eq!(backoff.next_delay(5), Some(Duration::from_secs(1)));
        assert_eq!(backoff.next_delay(50), Some(Duration::from_secs(1)));
        assert_eq!(backoff.next_delay(u32::MAX), Some(Duration::from_secs(1)));
    }

    #[test]
    fn exponential_backoff_custom_growth_factor() {
        let backoff =
            ExponentialBackoff::with_growth_factor(Duration::from_millis(100), Duration::from_secs(10), 3.0);

        assert_eq!(backoff.next_delay(1), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next_delay(2), Some(Duration::from_millis(300)));
        assert_eq!(backoff.next_delay(3), Some(Duration::from_millis(900)));
    }

    #[test]
    fn exponential_backoff_ceiling_below_initial_is_raised() {
        let backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_millis(100));

        assert_eq!(backoff.next_delay(1), Some(Duration::from_secs(1)));
        assert_eq!(backoff.next_delay(10), Some(Duration::from_secs(1)));
    }

    #[test]
    fn limited_backoff_exhausts_at_max_attempts() {
        let backoff = FixedBackoff::new(Duration::from_millis(10)).with_max_attempts(3);

        assert_eq!(backoff.next_delay(1), Some(Duration::from_millis(10)));
        assert_eq!(backoff.next_delay(2), Some(Duration::from_millis(10)));
        assert_eq!(backoff.next_delay(3), None);
        assert_eq!(backoff.next_delay(4), None);
    }

    #[test]
    fn limited_backoff_zero_limit_starts_exhausted() {
        let backoff = FixedBackoff::new(Duration::from_millis(10)).with_max_attempts(0);

        assert_eq!(backoff.next_delay(1), None);
    }

    #[test]
    fn sequential_backoff_switches_when_first_exhausts() {
        let backoff = FixedBackoff::new(Duration::from_millis(10))
            .with_max_attempts(2)
            .then(FixedBackoff::new(Duration::from_secs(1)));

        assert_eq!(backoff.next_delay(1), Some(Duration::from_millis(10)));
        assert_eq!(backoff.next_delay(2), Some(Duration::from_secs(1)));
        assert_eq!(backoff.next_delay(3), Some(Duration::from_secs(1)));
    }

    #[test]
    fn jittered_backoff_factor_at_most_one_is_identity() {
        let backoff = FixedBackoff::new(Duration::from_millis(500)).with_jitter(1.0);

        assert_eq!(backoff.next_delay(1), Some(Duration::from_millis(500)));
        assert_eq!(backoff.next_delay(7), Some(Duration::from_millis(500)));
    }

    #[test]
    fn jittered_backoff_stays_within_band() {
        let backoff = FixedBackoff::new(Duration::from_millis(1000)).with_jitter(2.0);

        for attempt_no in 1..100 {
            let delay = backoff.next_delay(attempt_no).unwrap();
            assert!(delay >= Duration::from_millis(500));
            assert!(delay <= Duration::from_millis(1000));
        }
    }

    #[test]
    fn jittered_backoff_seeded_rng_is_deterministic() {
        let first = FixedBackoff::new(Duration::from_secs(10))
            .with_jitter(2.0)
            .with_rng(StdRng::seed_from_u64(42));
        let second = FixedBackoff::new(Duration::from_secs(10))
            .with_jitter(2.0)
            .with_rng(StdRng::seed_from_u64(42));

        for attempt_no in 1..20 {
            assert_eq!(first.next_delay(attempt_no), second.next_delay(attempt_no));
        }
    }

    fn arb_exponential_backoff() -> impl Strategy<Value = ExponentialBackoff> {
        (1u64..=u64::MAX / 2, 1u64..u64::MAX / 2).prop_map(|(initial, extra)| {
            let max = initial.saturating_add(extra);
            ExponentialBackoff::new(Duration::from_nanos(initial), Duration::from_nanos(max))
        })
    }

    proptest! {
        #[test]
        fn property_test_exponential_backoff_monotonic(
            backoff in arb_exponential_backoff(),
            attempt_no in 1..u32::MAX,
            attempt_no_increase in 1..5u32
        ) {
            // The goal of this test is to show that for some arbitrary attempt number, the
            // calculated delay is always less than or equal to the delay calculated for a
            // _larger_ attempt number, and that both stay within the configured bounds.
            let first = backoff.next_delay(attempt_no).unwrap();
            let second = backoff.next_delay(attempt_no.saturating_add(attempt_no_increase)).unwrap();

            assert!(first <= second);
            assert!(first >= backoff.initial_delay);
            assert!(first <= backoff.max_delay);
            assert!(second >= backoff.initial_delay);
            assert!(second <= backoff.max_delay);
        }

        #[test]
        fn property_test_jittered_backoff_stays_in_band(
            (base, jittered) in arb_exponential_backoff()
                .prop_map(|base| (base.clone(), base.with_jitter(2.0)))
                .prop_perturb(|(base, jittered), rng| (base, jittered.with_rng(rng))),
            attempt_no in 1..u32::MAX
        ) {
            let unjittered = base.next_delay(attempt_no).unwrap();
            let sampled = jittered.next_delay(attempt_no).unwrap();

            assert!(sampled <= unjittered);
            assert!(sampled >= unjittered.div_f64(2.0));
        }
    }
}
