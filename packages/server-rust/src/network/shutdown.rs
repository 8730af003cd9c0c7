//! Transport health state and in-flight request tracking.
//!
//! Uses `ArcSwap` for lock-free health state transitions and an atomic
//! counter with RAII guards for in-flight tracking. Draining waits on a
//! `Notify` raised by the guard that brings the count to zero.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Transport health state.
///
/// State machine: Starting -> Ready -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Endpoints registered, listener not yet serving.
    Starting,
    /// Serving requests.
    Ready,
    /// No longer accepting connections; waiting for in-flight requests.
    Draining,
    /// Every in-flight request has completed.
    Stopped,
}

impl HealthState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            HealthState::Starting => "starting",
            HealthState::Ready => "ready",
            HealthState::Draining => "draining",
            HealthState::Stopped => "stopped",
        }
    }
}

#[derive(Debug)]
struct InFlight {
    count: AtomicU64,
    drained: Notify,
}

/// Health state plus in-flight tracking for one transport.
///
/// 1. Readiness probes check `health_state()`
/// 2. Every request holds an [`InFlightGuard`] while it runs
/// 3. `begin_drain()` moves to Draining
/// 4. `wait_for_drain()` completes once the in-flight count reaches zero
#[derive(Debug)]
pub struct ShutdownController {
    in_flight: Arc<InFlight>,
    health_state: Arc<ArcSwap<HealthState>>,
    started_at: Instant,
}

impl ShutdownController {
    /// Creates a controller in the `Starting` state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            in_flight: Arc::new(InFlight {
                count: AtomicU64::new(0),
                drained: Notify::new(),
            }),
            health_state: Arc::new(ArcSwap::from_pointee(HealthState::Starting)),
            started_at: Instant::now(),
        }
    }

    pub fn set_ready(&self) {
        self.health_state.store(Arc::new(HealthState::Ready));
    }

    /// Moves to `Draining`. Readiness probes fail from here on.
    pub fn begin_drain(&self) {
        self.health_state.store(Arc::new(HealthState::Draining));
    }

    #[must_use]
    pub fn health_state(&self) -> HealthState {
        **self.health_state.load()
    }

    /// Time since the controller was created.
    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Tracks one in-flight request until the guard is dropped.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.count.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.count.load(Ordering::Acquire)
    }

    /// Waits for every in-flight request to complete, or for `deadline` to fire.
    ///
    /// Returns `true` and transitions to `Stopped` once drained. Returns
    /// `false` if the deadline fired first; the state stays `Draining`.
    pub async fn wait_for_drain(&self, deadline: &CancellationToken) -> bool {
        loop {
            let drained = self.in_flight.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();

            if self.in_flight_count() == 0 {
                self.health_state.store(Arc::new(HealthState::Stopped));
                return true;
            }

            tokio::select! {
                () = drained => {}
                () = deadline.cancelled() => return false,
            }
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard that decrements the in-flight counter when dropped.
///
/// Drop also runs during unwinding, so a panicking handler is still accounted for.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<InFlight>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.in_flight.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.in_flight.drained.notify_waiters();
        }
    }
}
