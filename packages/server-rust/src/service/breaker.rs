//! Circuit breaker state machine.
//!
//! States:
//!
//! - **Closed**: calls pass through; consecutive failures are counted.
//! - **Open**: calls are rejected until `open_timeout` has elapsed.
//! - **HalfOpen**: up to `half_open_max_calls` probe calls are admitted; the
//!   first failure re-opens the circuit, and that many successes close it.
//!
//! Every transition starts a new generation. Outcomes reported with a
//! ticket from an older generation are ignored, so a slow call admitted
//! while closed cannot re-open a circuit that has since recovered.

use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;
use parking_lot::Mutex;
use tokio::time::Instant;
use trellis_core::Classify;

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// The result of an admitted call, as seen by the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    /// The call succeeded, or failed for a reason that must not trip the breaker.
    Success,
    /// The call failed in a way that counts toward tripping.
    Failure,
    /// The call was dropped before it completed.
    Abandoned,
}

/// Proof of admission, returned to the breaker with the call's outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    generation: u64,
}

impl Ticket {
    #[must_use]
    pub fn new(generation: u64) -> Self {
        Self { generation }
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Why a breaker refused a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BreakerRejection {
    #[error("circuit breaker is open")]
    Open,
    #[error("too many requests while circuit breaker is half-open")]
    TooManyRequests,
}

impl Classify for BreakerRejection {
    fn retryable(&self) -> Option<bool> {
        Some(true)
    }

    fn status_code(&self) -> Option<StatusCode> {
        Some(StatusCode::SERVICE_UNAVAILABLE)
    }
}

/// Admission control for calls to a possibly failing dependency.
pub trait CircuitBreaker: Send + Sync + 'static {
    /// Asks for permission to make one call.
    ///
    /// # Errors
    ///
    /// Returns a [`BreakerRejection`] while the circuit is open or the
    /// half-open probe budget is used up.
    fn try_acquire(&self) -> Result<Ticket, BreakerRejection>;

    /// Reports the outcome of a call admitted with `ticket`.
    fn record(&self, ticket: Ticket, outcome: CallOutcome);
}

// ---------------------------------------------------------------------------
// Permit
// ---------------------------------------------------------------------------

/// RAII admission. Dropping it without [`Permit::record`] reports
/// [`CallOutcome::Abandoned`], so a cancelled call never leaks a half-open slot.
pub struct Permit {
    breaker: Arc<dyn CircuitBreaker>,
    ticket: Option<Ticket>,
}

impl Permit {
    /// Acquires a permit from `breaker`.
    ///
    /// # Errors
    ///
    /// Returns the breaker's rejection.
    pub fn acquire(breaker: &Arc<dyn CircuitBreaker>) -> Result<Self, BreakerRejection> {
        let ticket = breaker.try_acquire()?;
        Ok(Self {
            breaker: Arc::clone(breaker),
            ticket: Some(ticket),
        })
    }

    /// Reports the call outcome and consumes the permit.
    pub fn record(mut self, outcome: CallOutcome) {
        if let Some(ticket) = self.ticket.take() {
            self.breaker.record(ticket, outcome);
        }
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            self.breaker.record(ticket, CallOutcome::Abandoned);
        }
    }
}

// ---------------------------------------------------------------------------
// Breaker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half-open",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive failures that trip a closed circuit. Values below 1 act as 1.
    pub failure_threshold: u32,
    /// How long an open circuit rejects calls before probing.
    pub open_timeout: Duration,
    /// Probe calls admitted while half-open, and successes needed to close.
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(60),
            half_open_max_calls: 1,
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    generation: u64,
    consecutive_failures: u32,
    half_open_requests: u32,
    half_open_successes: u32,
    opened_at: Instant,
}

/// A consecutive-failure circuit breaker.
#[derive(Debug)]
pub struct Breaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl Breaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                generation: 0,
                consecutive_failures: 0,
                half_open_requests: 0,
                half_open_successes: 0,
                opened_at: Instant::now(),
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The current state, accounting for an expired open timeout.
    #[must_use]
    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock();
        self.expire_open(&mut inner);
        inner.state
    }

    fn expire_open(&self, inner: &mut Inner) {
        if inner.state == BreakerState::Open
            && inner.opened_at.elapsed() >= self.config.open_timeout
        {
            self.transition(inner, BreakerState::HalfOpen);
        }
    }

    fn transition(&self, inner: &mut Inner, to: BreakerState) {
        let from = inner.state;
        inner.state = to;
        inner.generation += 1;
        inner.consecutive_failures = 0;
        inner.half_open_requests = 0;
        inner.half_open_successes = 0;
        if to == BreakerState::Open {
            inner.opened_at = Instant::now();
        }
        tracing::info!(
            breaker = %self.name,
            from = from.as_str(),
            to = to.as_str(),
            "circuit breaker state changed"
        );
    }
}

impl CircuitBreaker for Breaker {
    fn try_acquire(&self) -> Result<Ticket, BreakerRejection> {
        let mut inner = self.inner.lock();
        self.expire_open(&mut inner);

        match inner.state {
            BreakerState::Closed => {}
            BreakerState::Open => return Err(BreakerRejection::Open),
            BreakerState::HalfOpen => {
                if inner.half_open_requests >= self.config.half_open_max_calls.max(1) {
                    return Err(BreakerRejection::TooManyRequests);
                }
                inner.half_open_requests += 1;
            }
        }
        Ok(Ticket::new(inner.generation))
    }

    fn record(&self, ticket: Ticket, outcome: CallOutcome) {
        let mut inner = self.inner.lock();
        self.expire_open(&mut inner);
        if ticket.generation != inner.generation {
            return;
        }

        match (inner.state, outcome) {
            (BreakerState::Closed, CallOutcome::Success) => inner.consecutive_failures = 0,
            (BreakerState::Closed, CallOutcome::Failure) => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold.max(1) {
                    self.transition(&mut inner, BreakerState::Open);
                }
            }
            (BreakerState::HalfOpen, CallOutcome::Success) => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.half_open_max_calls.max(1) {
                    self.transition(&mut inner, BreakerState::Closed);
                }
            }
            (BreakerState::HalfOpen, CallOutcome::Failure) => {
                self.transition(&mut inner, BreakerState::Open);
            }
            (BreakerState::HalfOpen, CallOutcome::Abandoned) => {
                inner.half_open_requests = inner.half_open_requests.saturating_sub(1);
            }
            (BreakerState::Closed | BreakerState::Open, CallOutcome::Abandoned)
            | (BreakerState::Open, _) => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn breaker(threshold: u32, half_open_max_calls: u32) -> Breaker {
        Breaker::new(
            "test",
            BreakerConfig {
                failure_threshold: threshold,
                open_timeout: Duration::from_secs(10),
                half_open_max_calls,
            },
        )
    }

    fn fail(breaker: &Breaker) {
        let ticket = breaker.try_acquire().unwrap();
        breaker.record(ticket, CallOutcome::Failure);
    }

    #[test]
    fn trips_after_consecutive_failures() {
        let breaker = breaker(3, 1);
        fail(&breaker);
        fail(&breaker);
        assert_eq!(breaker.state(), BreakerState::Closed);

        fail(&breaker);
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(breaker.try_acquire(), Err(BreakerRejection::Open));
    }

    #[test]
    fn success_resets_failure_count() {
        let breaker = breaker(2, 1);
        fail(&breaker);
        let ticket = breaker.try_acquire().unwrap();
        breaker.record(ticket, CallOutcome::Success);
        fail(&breaker);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_limited_probes_then_closes() {
        let breaker = breaker(1, 2);
        fail(&breaker);
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        let first = breaker.try_acquire().unwrap();
        let second = breaker.try_acquire().unwrap();
        assert_eq!(
            breaker.try_acquire(),
            Err(BreakerRejection::TooManyRequests)
        );

        breaker.record(first, CallOutcome::Success);
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.record(second, CallOutcome::Success);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens() {
        let breaker = breaker(1, 1);
        fail(&breaker);
        tokio::time::advance(Duration::from_secs(10)).await;

        fail(&breaker);
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_outcomes_are_ignored() {
        let breaker = breaker(1, 1);
        let slow = breaker.try_acquire().unwrap();
        fail(&breaker);
        tokio::time::advance(Duration::from_secs(10)).await;
        let probe = breaker.try_acquire().unwrap();
        breaker.record(probe, CallOutcome::Success);
        assert_eq!(breaker.state(), BreakerState::Closed);

        breaker.record(slow, CallOutcome::Failure);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_permit_frees_half_open_slot() {
        let breaker: Arc<dyn CircuitBreaker> = Arc::new(breaker(1, 1));
        let ticket = breaker.try_acquire().unwrap();
        breaker.record(ticket, CallOutcome::Failure);
        tokio::time::advance(Duration::from_secs(10)).await;

        let permit = Permit::acquire(&breaker).unwrap();
        assert!(matches!(
            Permit::acquire(&breaker),
            Err(BreakerRejection::TooManyRequests)
        ));
        drop(permit);

        let permit = Permit::acquire(&breaker).unwrap();
        permit.record(CallOutcome::Success);
        assert!(Permit::acquire(&breaker).is_ok());
    }

    #[test]
    fn rejection_is_retryable_503() {
        let err = trellis_core::Error::from(BreakerRejection::Open);
        assert!(err.is_retryable());
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    proptest! {
        #[test]
        fn opens_exactly_on_a_run_of_threshold_failures(
            threshold in 1u32..6,
            successes in proptest::collection::vec(any::<bool>(), 0..40),
        ) {
            let breaker = Breaker::new(
                "sequence",
                BreakerConfig {
                    failure_threshold: threshold,
                    open_timeout: Duration::from_secs(3600),
                    half_open_max_calls: 1,
                },
            );
            let mut run = 0;
            for success in successes {
                let ticket = breaker.try_acquire().unwrap();
                if success {
                    breaker.record(ticket, CallOutcome::Success);
                    run = 0;
                } else {
                    breaker.record(ticket, CallOutcome::Failure);
                    run += 1;
                }

                let open = breaker.state() == BreakerState::Open;
                prop_assert_eq!(open, run == threshold);
                if open {
                    prop_assert_eq!(breaker.try_acquire(), Err(BreakerRejection::Open));
                    break;
                }
            }
        }
    }
}
