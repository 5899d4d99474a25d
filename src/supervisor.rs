//! Per-source lifecycle supervisor.
//!
//! One task per source: connect, run, clean up, back off, repeat. Clients
//! never reconnect themselves — any failure lands here, where exponential
//! backoff with jitter paces the retries and a stable run resets the ramp.

use crate::backoff::ReconnectBackoff;
use crate::metrics::PipelineMetrics;
use crate::protocol::{wait_for_stop, Ingress, ProtocolClient};
use crate::time::{RuntimeTime, TimeSource};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Bound on client cleanup after a stop or failure.
const CLEANUP_GRACE: Duration = Duration::from_secs(5);

/// Observable lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SupervisorState {
    Idle,
    Connecting,
    Running,
    Backoff,
    Stopped,
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Running => "running",
            Self::Backoff => "backoff",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Handle owned by the bridge for one running supervisor.
pub struct SupervisorHandle {
    name: String,
    stop_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<SupervisorState>,
    task: JoinHandle<()>,
}

impl SupervisorHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SupervisorState {
        *self.state_rx.borrow()
    }

    /// Signal stop, wait for cleanup within the grace period, then abort.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let mut task = self.task;
        if tokio::time::timeout(CLEANUP_GRACE * 2, &mut task).await.is_err() {
            tracing::warn!(source = %self.name, "supervisor did not stop in time; aborting");
            task.abort();
        }
    }
}

/// Everything a supervisor needs besides its client.
pub struct Supervisor {
    pub name: String,
    pub client: Box<dyn ProtocolClient>,
    pub ingress: Ingress,
    pub backoff: ReconnectBackoff,
    pub time: Arc<dyn TimeSource>,
    pub metrics: Arc<PipelineMetrics>,
}

impl Supervisor {
    pub fn new(
        name: String,
        client: Box<dyn ProtocolClient>,
        ingress: Ingress,
        backoff: ReconnectBackoff,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            name,
            client,
            ingress,
            backoff,
            time: Arc::new(RuntimeTime::default()),
            metrics,
        }
    }

    /// Swap the time source; tests use `SimulatedTime`.
    pub fn with_time(mut self, time: Arc<dyn TimeSource>) -> Self {
        self.time = time;
        self
    }

    /// Launch the lifecycle task.
    pub fn spawn(self) -> SupervisorHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(SupervisorState::Idle);
        let name = self.name.clone();
        let task = tokio::spawn(self.run(stop_rx, state_tx));
        SupervisorHandle { name, stop_tx, state_rx, task }
    }

    async fn run(
        mut self,
        mut stop: watch::Receiver<bool>,
        state_tx: watch::Sender<SupervisorState>,
    ) {
        loop {
            if *stop.borrow() {
                break;
            }

            let _ = state_tx.send(SupervisorState::Connecting);
            match self.client.connect().await {
                Ok(()) => {
                    let _ = state_tx.send(SupervisorState::Running);
                    let started_ms = self.time.now_millis();
                    let result = self.client.run(self.ingress.clone(), stop.clone()).await;
                    let run_duration =
                        Duration::from_millis(self.time.now_millis().saturating_sub(started_ms));

                    if tokio::time::timeout(CLEANUP_GRACE, self.client.disconnect())
                        .await
                        .is_err()
                    {
                        tracing::warn!(source = %self.name, "client cleanup exceeded grace period");
                    }
                    self.backoff.note_run(run_duration);

                    match result {
                        Ok(()) => break,
                        Err(e) if e.is_stopped() => break,
                        Err(e) => {
                            tracing::warn!(source = %self.name, error = %e, "source failed");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(source = %self.name, error = %e, "connect failed");
                    let _ = tokio::time::timeout(CLEANUP_GRACE, self.client.disconnect()).await;
                }
            }

            if *stop.borrow() {
                break;
            }

            let _ = state_tx.send(SupervisorState::Backoff);
            let delay = self.backoff.next_delay();
            let jittered = self.backoff.jittered(delay);
            PipelineMetrics::incr(&self.metrics.reconnections);
            tracing::info!(
                source = %self.name,
                delay_ms = jittered.as_millis() as u64,
                "reconnecting after backoff"
            );
            tokio::select! {
                _ = self.time.sleep(jittered) => {}
                _ = wait_for_stop(&mut stop) => break,
            }
        }
        let _ = state_tx.send(SupervisorState::Stopped);
        tracing::info!(source = %self.name, "supervisor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::ReconnectPolicy;
    use crate::error::ProtocolError;
    use crate::protocol::TestReport;
    use crate::record::ProtocolKind;
    use crate::time::SimulatedTime;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Client that fails to connect N times, then runs until stopped.
    struct FlakyClient {
        connects: Arc<AtomicUsize>,
        failures_before_accept: usize,
        time: SimulatedTime,
        run_advance_ms: u64,
    }

    #[async_trait]
    impl ProtocolClient for FlakyClient {
        fn kind(&self) -> ProtocolKind {
            ProtocolKind::Mqtt
        }

        fn endpoint(&self) -> &str {
            "mqtt://flaky:1883"
        }

        async fn connect(&mut self) -> Result<(), ProtocolError> {
            let n = self.connects.fetch_add(1, Ordering::SeqCst);
            if n < self.failures_before_accept {
                Err(ProtocolError::Connect {
                    endpoint: "mqtt://flaky:1883".into(),
                    reason: "refused".into(),
                })
            } else {
                Ok(())
            }
        }

        async fn run(
            &mut self,
            _ingress: Ingress,
            mut stop: watch::Receiver<bool>,
        ) -> Result<(), ProtocolError> {
            // Simulate a run of `run_advance_ms` before the subscription drops.
            self.time.advance(self.run_advance_ms);
            if *stop.borrow() {
                return Ok(());
            }
            tokio::task::yield_now().await;
            Err(ProtocolError::SubscriptionLost("server went away".into()))
        }

        async fn disconnect(&mut self) {}

        async fn test_connection(&mut self) -> TestReport {
            unimplemented!("not exercised")
        }
    }

    fn policy_ms(initial: u64) -> ReconnectPolicy {
        ReconnectPolicy::new(Duration::from_millis(initial), Duration::from_secs(300))
    }

    #[tokio::test]
    async fn backoff_delays_double_with_bounded_jitter() {
        let connects = Arc::new(AtomicUsize::new(0));
        let time = SimulatedTime::new();
        let client = FlakyClient {
            connects: connects.clone(),
            failures_before_accept: 4,
            time: time.clone(),
            run_advance_ms: 0,
        };
        let (ingress, _rx) = Ingress::channel();
        let metrics = Arc::new(PipelineMetrics::default());

        let supervisor = Supervisor::new(
            "flaky".into(),
            Box::new(client),
            ingress,
            ReconnectBackoff::new(policy_ms(1000)),
            metrics.clone(),
        )
        .with_time(Arc::new(time.clone()));
        let handle = supervisor.spawn();

        // Wait until the client has connected successfully once.
        for _ in 0..200 {
            if connects.load(Ordering::SeqCst) >= 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(connects.load(Ordering::SeqCst) >= 5, "client never recovered");

        // Four failed connects: delays d, 2d, 4d, 8d within ±10%.
        let sleeps = time.sleeps();
        for (i, nominal_ms) in [1000u64, 2000, 4000, 8000].iter().enumerate() {
            let observed = sleeps[i];
            let lo = Duration::from_millis(nominal_ms * 9 / 10);
            let hi = Duration::from_millis(nominal_ms * 11 / 10);
            assert!(
                observed >= lo && observed <= hi,
                "delay {i}: {observed:?} outside [{lo:?}, {hi:?}]"
            );
        }

        handle.stop().await;
        assert!(metrics.snapshot().reconnections >= 4);
    }

    #[tokio::test]
    async fn stable_run_resets_the_backoff_ramp() {
        let connects = Arc::new(AtomicUsize::new(0));
        let time = SimulatedTime::new();
        // Connect always succeeds; each run "lasts" 10 s (> 2 × initial).
        let client = FlakyClient {
            connects: connects.clone(),
            failures_before_accept: 0,
            time: time.clone(),
            run_advance_ms: 10_000,
        };
        let (ingress, _rx) = Ingress::channel();

        let supervisor = Supervisor::new(
            "resetting".into(),
            Box::new(client),
            ingress,
            ReconnectBackoff::new(policy_ms(1000)),
            Arc::new(PipelineMetrics::default()),
        )
        .with_time(Arc::new(time.clone()));
        let handle = supervisor.spawn();

        for _ in 0..200 {
            if time.sleeps().len() >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.stop().await;

        // Every recorded delay stays near the initial value: the ramp reset
        // after each long run.
        let sleeps = time.sleeps();
        assert!(sleeps.len() >= 3);
        for (i, observed) in sleeps.iter().take(3).enumerate() {
            assert!(
                *observed <= Duration::from_millis(1100),
                "delay {i} should be ~initial, got {observed:?}"
            );
        }
    }

    #[tokio::test]
    async fn stop_signal_ends_the_loop_promptly() {
        let connects = Arc::new(AtomicUsize::new(0));
        let client = FlakyClient {
            connects: connects.clone(),
            failures_before_accept: usize::MAX,
            time: SimulatedTime::new(),
            run_advance_ms: 0,
        };
        let (ingress, _rx) = Ingress::channel();

        let supervisor = Supervisor::new(
            "stopping".into(),
            Box::new(client),
            ingress,
            ReconnectBackoff::new(policy_ms(10)),
            Arc::new(PipelineMetrics::default()),
        );
        let handle = supervisor.spawn();
        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.stop().await;
    }
}
