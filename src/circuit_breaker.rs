//! Per-service circuit breaking.
//!
//! Three states:
//! - **Closed**: requests flow; consecutive failures are counted
//! - **Open**: requests are rejected until `open_duration` has elapsed
//! - **HalfOpen**: one trial request at a time flows; enough successes close
//!   the circuit, any failure reopens it
//!
//! Every transition into Open is reported to the caller so the mesh can
//! count breaker trips.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    Closed,
    Open,
    HalfOpen,
}

/// Thresholds for one breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u64,
    /// Successes in HalfOpen that close it again.
    pub success_threshold: u64,
    /// How long the circuit stays open before trial requests.
    pub open_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_duration: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: State,
    failure_count: u64,
    success_count: u64,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Circuit breaker guarding calls to one service.
#[derive(Debug)]
pub struct CircuitBreaker {
    service: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    trips: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            service: service.into(),
            config,
            inner: Mutex::new(Inner {
                state: State::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
            trips: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Returns `true` if a request may proceed.
    ///
    /// An open circuit whose timeout has elapsed moves to HalfOpen and admits
    /// the request as its trial. HalfOpen admits nothing else until that
    /// trial reports back.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            State::Closed => true,
            State::HalfOpen => !std::mem::replace(&mut inner.trial_in_flight, true),
            State::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed() >= self.config.open_duration)
                    .unwrap_or(true);
                if elapsed {
                    inner.state = State::HalfOpen;
                    inner.success_count = 0;
                    inner.trial_in_flight = true;
                    info!(service = %self.service, "circuit half-open");
                }
                elapsed
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.trial_in_flight = false;
        match inner.state {
            State::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    inner.state = State::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.opened_at = None;
                    info!(service = %self.service, "circuit closed");
                }
            }
            State::Closed => inner.failure_count = 0,
            State::Open => {}
        }
    }

    /// Records a failed request. Returns `true` if this failure opened the
    /// circuit.
    pub fn record_failure(&self) -> bool {
        let mut inner = self.inner.lock();
        inner.trial_in_flight = false;
        let tripped = match inner.state {
            State::Closed => {
                inner.failure_count += 1;
                inner.failure_count >= self.config.failure_threshold
            }
            State::HalfOpen => true,
            State::Open => {
                inner.opened_at = Some(Instant::now());
                false
            }
        };

        if tripped {
            inner.state = State::Open;
            inner.opened_at = Some(Instant::now());
            inner.failure_count = 0;
            inner.success_count = 0;
            self.trips.fetch_add(1, Ordering::Relaxed);
            warn!(service = %self.service, "circuit opened");
        }
        tripped
    }

    /// Ends an admitted request whose outcome says nothing about the
    /// upstream's health, freeing the HalfOpen trial slot.
    pub fn release(&self) {
        self.inner.lock().trial_in_flight = false;
    }

    pub fn state(&self) -> State {
        self.inner.lock().state
    }

    /// Number of times the circuit has opened.
    pub fn trips(&self) -> u64 {
        self.trips.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    fn force_elapsed(&self) {
        let mut inner = self.inner.lock();
        inner.opened_at = Some(Instant::now() - self.config.open_duration);
    }
}
