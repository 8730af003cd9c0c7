//! Backoff policies consulted by the retry middleware between attempts.
//!
//! A [`BackoffPolicy`] is shared configuration; every call gets a fresh
//! [`Backoff`] from it, so concurrent calls never share retry state.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

/// A possibly exhaustible sequence of wait durations.
pub trait Backoff: Send {
    /// The delay before the next attempt, or `None` when retries are exhausted.
    fn next_backoff(&mut self) -> Option<Duration>;
}

/// Builds a fresh [`Backoff`] for each call.
pub trait BackoffPolicy: Send + Sync + 'static {
    type Backoff: Backoff + 'static;

    fn backoff(&self) -> Self::Backoff;
}

// ---------------------------------------------------------------------------
// ExponentialBackoff
// ---------------------------------------------------------------------------

/// Randomized exponential backoff.
///
/// Each delay is the current interval randomized by `randomization_factor`
/// (`interval * (1 ± factor)`); the interval then grows by `multiplier` up to
/// `max_interval`. The sequence ends once `max_elapsed` has passed since the
/// first delay was requested, or after `max_retries` delays.
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialBackoff {
    pub initial_interval: Duration,
    pub randomization_factor: f64,
    pub multiplier: f64,
    pub max_interval: Duration,
    /// `None` means no time bound.
    pub max_elapsed: Option<Duration>,
    /// `None` means no count bound.
    pub max_retries: Option<u32>,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            randomization_factor: 0.5,
            multiplier: 1.5,
            max_interval: Duration::from_secs(60),
            max_elapsed: Some(Duration::from_secs(15 * 60)),
            max_retries: None,
        }
    }
}

impl ExponentialBackoff {
    #[must_use]
    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    #[must_use]
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    #[must_use]
    pub fn with_randomization_factor(mut self, factor: f64) -> Self {
        self.randomization_factor = factor.clamp(0.0, 1.0);
        self
    }

    #[must_use]
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    #[must_use]
    pub fn with_max_elapsed(mut self, elapsed: Option<Duration>) -> Self {
        self.max_elapsed = elapsed;
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }
}

impl BackoffPolicy for ExponentialBackoff {
    type Backoff = ExponentialSequence;

    fn backoff(&self) -> ExponentialSequence {
        ExponentialSequence {
            policy: self.clone(),
            current: self.initial_interval,
            started: None,
            issued: 0,
        }
    }
}

/// Per-call state of an [`ExponentialBackoff`].
#[derive(Debug, Clone)]
pub struct ExponentialSequence {
    policy: ExponentialBackoff,
    current: Duration,
    started: Option<Instant>,
    issued: u32,
}

impl Backoff for ExponentialSequence {
    fn next_backoff(&mut self) -> Option<Duration> {
        if self
            .policy
            .max_retries
            .is_some_and(|max| self.issued >= max)
        {
            return None;
        }

        let started = *self.started.get_or_insert_with(Instant::now);
        if let Some(max_elapsed) = self.policy.max_elapsed {
            if started.elapsed() > max_elapsed {
                return None;
            }
        }

        let delay = randomize(self.current, self.policy.randomization_factor);
        let max_interval = self.policy.max_interval;
        // NaN and anything below 1 keep the interval flat; overflow saturates at the cap.
        let grown = self.current.as_secs_f64() * self.policy.multiplier.max(1.0);
        self.current = Duration::try_from_secs_f64(grown)
            .unwrap_or(max_interval)
            .min(max_interval);
        self.issued += 1;
        Some(delay)
    }
}

/// `interval * (1 ± factor)`, with the factor clamped to `[0, 1]` and NaN treated as 0.
fn randomize(interval: Duration, factor: f64) -> Duration {
    let factor = if factor.is_nan() {
        0.0
    } else {
        factor.clamp(0.0, 1.0)
    };
    if factor <= 0.0 || interval.is_zero() {
        return interval;
    }
    let secs = interval.as_secs_f64();
    let delta = secs * factor;
    let jittered = rand::rng().random_range((secs - delta)..=(secs + delta));
    Duration::try_from_secs_f64(jittered).unwrap_or(interval)
}

// ---------------------------------------------------------------------------
// FixedBackoff
// ---------------------------------------------------------------------------

/// An explicit, finite list of delays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedBackoff {
    delays: Arc<[Duration]>,
}

impl FixedBackoff {
    pub fn new(delays: impl IntoIterator<Item = Duration>) -> Self {
        Self {
            delays: delays.into_iter().collect(),
        }
    }

    /// `retries` identical delays.
    #[must_use]
    pub fn constant(delay: Duration, retries: usize) -> Self {
        Self::new(std::iter::repeat_n(delay, retries))
    }

    /// `retries` retries with no delay in between.
    #[must_use]
    pub fn immediate(retries: usize) -> Self {
        Self::constant(Duration::ZERO, retries)
    }

    /// The number of retries this policy allows.
    #[must_use]
    pub fn retries(&self) -> usize {
        self.delays.len()
    }
}

impl BackoffPolicy for FixedBackoff {
    type Backoff = FixedSequence;

    fn backoff(&self) -> FixedSequence {
        FixedSequence {
            delays: Arc::clone(&self.delays),
            next: 0,
        }
    }
}

/// Per-call state of a [`FixedBackoff`].
#[derive(Debug, Clone)]
pub struct FixedSequence {
    delays: Arc<[Duration]>,
    next: usize,
}

impl Backoff for FixedSequence {
    fn next_backoff(&mut self) -> Option<Duration> {
        let delay = self.delays.get(self.next).copied()?;
        self.next += 1;
        Some(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_backoff_yields_each_delay_once() {
        let policy = FixedBackoff::new([Duration::from_millis(10), Duration::from_millis(20)]);
        let mut backoff = policy.backoff();
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(10)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(20)));
        assert_eq!(backoff.next_backoff(), None);
        assert_eq!(backoff.next_backoff(), None);
    }

    #[test]
    fn each_call_gets_fresh_state() {
        let policy = FixedBackoff::immediate(1);
        let mut first = policy.backoff();
        assert_eq!(first.next_backoff(), Some(Duration::ZERO));
        assert_eq!(first.next_backoff(), None);

        let mut second = policy.backoff();
        assert_eq!(second.next_backoff(), Some(Duration::ZERO));
        assert_eq!(policy.retries(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exponential_without_jitter_grows_and_caps() {
        let policy = ExponentialBackoff::default()
            .with_initial_interval(Duration::from_millis(100))
            .with_multiplier(2.0)
            .with_randomization_factor(0.0)
            .with_max_interval(Duration::from_millis(500))
            .with_max_retries(5);

        let mut backoff = policy.backoff();
        let delays: Vec<_> = std::iter::from_fn(|| backoff.next_backoff()).collect();
        assert_eq!(
            delays,
            [100, 200, 400, 500, 500].map(Duration::from_millis).to_vec()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn exponential_jitter_stays_in_range() {
        let policy = ExponentialBackoff::default()
            .with_initial_interval(Duration::from_millis(1000))
            .with_randomization_factor(0.5)
            .with_max_retries(1);

        let delay = policy.backoff().next_backoff().unwrap();
        assert!(delay >= Duration::from_millis(500), "{delay:?}");
        assert!(delay <= Duration::from_millis(1500), "{delay:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn exponential_stops_after_max_elapsed() {
        let policy = ExponentialBackoff::default()
            .with_randomization_factor(0.0)
            .with_max_elapsed(Some(Duration::from_secs(1)));

        let mut backoff = policy.backoff();
        assert!(backoff.next_backoff().is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(backoff.next_backoff(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_range_jitter_is_clamped() {
        let policy = ExponentialBackoff {
            initial_interval: Duration::from_millis(100),
            randomization_factor: 2.0,
            multiplier: 1.0,
            max_retries: Some(50),
            ..ExponentialBackoff::default()
        };

        let mut backoff = policy.backoff();
        let delays: Vec<_> = std::iter::from_fn(|| backoff.next_backoff()).collect();
        assert_eq!(delays.len(), 50);
        assert!(delays.iter().all(|d| *d <= Duration::from_millis(200)), "{delays:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn nan_jitter_disables_randomization() {
        let policy = ExponentialBackoff {
            initial_interval: Duration::from_millis(100),
            randomization_factor: f64::NAN,
            multiplier: 1.0,
            max_retries: Some(3),
            ..ExponentialBackoff::default()
        };

        let mut backoff = policy.backoff();
        let delays: Vec<_> = std::iter::from_fn(|| backoff.next_backoff()).collect();
        assert_eq!(delays, vec![Duration::from_millis(100); 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn huge_multiplier_saturates_at_max_interval() {
        let policy = ExponentialBackoff {
            initial_interval: Duration::from_secs(1),
            randomization_factor: 0.0,
            multiplier: f64::MAX,
            max_interval: Duration::from_secs(30),
            max_retries: Some(3),
            ..ExponentialBackoff::default()
        };

        let mut backoff = policy.backoff();
        let delays: Vec<_> = std::iter::from_fn(|| backoff.next_backoff()).collect();
        assert_eq!(delays, [1, 30, 30].map(Duration::from_secs).to_vec());
    }
}
