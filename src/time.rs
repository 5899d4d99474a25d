//! The pipeline's time seam.
//!
//! Exactly two components consume time deliberately: the circuit breaker
//! stamps failures on a monotonic scale, and the supervisor measures how
//! long a run survived and then spends a backoff delay. Both reach time
//! through one [`TimeSource`] so tests crank the clock by hand and observe
//! every delay without real sleeping.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Monotonic milliseconds plus the ability to spend a delay.
///
/// The millisecond scale is private to each source; only differences are
/// meaningful. Never goes backwards.
#[async_trait]
pub trait TimeSource: Send + Sync + std::fmt::Debug {
    fn now_millis(&self) -> u64;

    /// Spend a backoff or cooldown delay.
    async fn sleep(&self, duration: Duration);
}

/// Production source: `Instant` arithmetic and the tokio timer.
#[derive(Debug, Clone)]
pub struct RuntimeTime {
    epoch: Instant,
}

impl Default for RuntimeTime {
    fn default() -> Self {
        Self { epoch: Instant::now() }
    }
}

#[async_trait]
impl TimeSource for RuntimeTime {
    fn now_millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await
    }
}

/// Hand-cranked source for deterministic tests.
///
/// `sleep` never blocks: it records the requested delay and advances the
/// clock by it, so simulated time passes exactly where the pipeline would
/// have waited. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct SimulatedTime {
    now: Arc<AtomicU64>,
    slept: Arc<Mutex<Vec<Duration>>>,
}

impl SimulatedTime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the clock forward, e.g. to model a long-lived connection or an
    /// elapsed breaker cooldown.
    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }

    /// Every delay spent through this source, in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.slept.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait]
impl TimeSource for SimulatedTime {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    async fn sleep(&self, duration: Duration) {
        self.slept
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(duration);
        self.advance(duration.as_millis() as u64);
    }
}

/// Wall-clock microseconds since the Unix epoch.
///
/// The canonical timestamp unit across the pipeline. Anything in
/// milliseconds must be converted before it reaches a record.
pub fn unix_micros_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as i64
}
