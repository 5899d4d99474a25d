//! Circuit breaker guarding the sink session.
//!
//! Closed → Open on `failure_threshold` consecutive failures; Open →
//! HalfOpen after `cooldown`; HalfOpen permits exactly one probe, whose
//! outcome decides Closed or Open again. While open, calls fast-fail with
//! `SinkError::CircuitOpen` and the sink is never invoked. The breaker
//! wraps only sink calls — protocol clients have their own supervisors.

use crate::error::SinkError;
use crate::time::{RuntimeTime, TimeSource};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Observable breaker state, serialized as `closed` / `open` / `half_open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct CircuitBreaker {
    state: AtomicU8,
    failures: AtomicU32,
    opened_at_ms: AtomicU64,
    probe_in_flight: AtomicBool,
    trips: AtomicU64,
    failure_threshold: u32,
    cooldown: Duration,
    time: Arc<dyn TimeSource>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("state", &self.state())
            .field("failures", &self.failures.load(Ordering::Acquire))
            .field("threshold", &self.failure_threshold)
            .field("cooldown", &self.cooldown)
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: AtomicU8::new(STATE_CLOSED),
            failures: AtomicU32::new(0),
            opened_at_ms: AtomicU64::new(0),
            probe_in_flight: AtomicBool::new(false),
            trips: AtomicU64::new(0),
            failure_threshold: failure_threshold.max(1),
            cooldown,
            time: Arc::new(RuntimeTime::default()),
        }
    }

    /// Override the time source for deterministic tests.
    pub fn with_time<T: TimeSource + 'static>(mut self, time: T) -> Self {
        self.time = Arc::new(time);
        self
    }

    pub fn state(&self) -> BreakerState {
        match self.state.load(Ordering::Acquire) {
            STATE_OPEN => BreakerState::Open,
            STATE_HALF_OPEN => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }

    /// Distinct closed→open transitions since construction.
    pub fn trips(&self) -> u64 {
        self.trips.load(Ordering::Relaxed)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }

    /// Run `operation` under the breaker's gate.
    pub async fn execute<T, Fut, Op>(&self, operation: Op) -> Result<T, SinkError>
    where
        Op: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, SinkError>>,
    {
        let mut probing = false;
        loop {
            match self.state.load(Ordering::Acquire) {
                STATE_OPEN => {
                    let opened_at = self.opened_at_ms.load(Ordering::Acquire);
                    let elapsed = self.time.now_millis().saturating_sub(opened_at);
                    if elapsed < self.cooldown.as_millis() as u64 {
                        return Err(SinkError::CircuitOpen {
                            failure_count: self.failures.load(Ordering::Acquire),
                            open_for: Duration::from_millis(elapsed),
                        });
                    }
                    match self.state.compare_exchange(
                        STATE_OPEN,
                        STATE_HALF_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            tracing::info!("circuit breaker -> half_open");
                            self.probe_in_flight.store(true, Ordering::Release);
                            probing = true;
                            break;
                        }
                        // Someone else moved the state; re-evaluate.
                        Err(_) => continue,
                    }
                }
                STATE_HALF_OPEN => {
                    // A single probe is permitted at a time.
                    if self.probe_in_flight.swap(true, Ordering::AcqRel) {
                        return Err(SinkError::CircuitOpen {
                            failure_count: self.failures.load(Ordering::Acquire),
                            open_for: Duration::from_millis(0),
                        });
                    }
                    probing = true;
                    break;
                }
                _ => break,
            }
        }

        let result = operation().await;
        if probing {
            self.probe_in_flight.store(false, Ordering::Release);
        }
        match &result {
            Ok(_) => self.on_success(),
            Err(e) if e.is_circuit_open() => {}
            Err(_) => self.on_failure(),
        }
        result
    }

    fn on_success(&self) {
        match self.state.load(Ordering::Acquire) {
            STATE_HALF_OPEN => {
                if self
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_CLOSED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.failures.store(0, Ordering::Release);
                    self.opened_at_ms.store(0, Ordering::Release);
                    tracing::info!("circuit breaker -> closed");
                }
            }
            STATE_CLOSED => {
                self.failures.store(0, Ordering::Release);
            }
            _ => {}
        }
    }

    fn on_failure(&self) {
        let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
        match self.state.load(Ordering::Acquire) {
            STATE_HALF_OPEN => {
                if self
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.opened_at_ms.store(self.time.now_millis(), Ordering::Release);
                    tracing::warn!(failures, "circuit breaker probe failed -> open");
                }
            }
            STATE_CLOSED if failures >= self.failure_threshold => {
                if self
                    .state
                    .compare_exchange(
                        STATE_CLOSED,
                        STATE_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.opened_at_ms.store(self.time.now_millis(), Ordering::Release);
                    self.trips.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        failures,
                        threshold = self.failure_threshold,
                        "circuit breaker -> open"
                    );
                }
            }
            _ => {}
        }
    }
}
