//! Batch egress worker: drains the buffer, forms batches by size-or-time,
//! submits through the circuit breaker and stream session.
//!
//! The failure contract is deliberate: a failed flush drops the current
//! batch, cools down and resumes — the buffer has already released those
//! records, and re-enqueueing would reorder per-source streams.

use crate::breaker::CircuitBreaker;
use crate::buffer::BackpressureBuffer;
use crate::config::ZerobusConfig;
use crate::metrics::PipelineMetrics;
use crate::protocol::wait_for_stop;
use crate::record::{to_wire, WireRecord};
use crate::sink::StreamSession;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Pause after a failed flush before the loop resumes.
const FAILURE_COOLDOWN: Duration = Duration::from_secs(5);
/// Sleep quantum while the rate gate is out of tokens.
const GATE_SLEEP: Duration = Duration::from_millis(10);
/// How long shutdown keeps draining before the final flush.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct EgressConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub failure_cooldown: Duration,
    pub max_send_rps: Option<f64>,
    pub drain_grace: Duration,
}

impl EgressConfig {
    pub fn from_zerobus(cfg: &ZerobusConfig) -> Self {
        Self {
            batch_size: cfg.batch.max_records.max(1),
            flush_interval: cfg.batch.flush_interval(),
            failure_cooldown: FAILURE_COOLDOWN,
            max_send_rps: cfg.max_send_rps,
            drain_grace: DRAIN_GRACE,
        }
    }
}

/// Token bucket pacing records toward the sink.
struct RateGate {
    rate: f64,
    capacity: f64,
    tokens: f64,
    last: Instant,
}

impl RateGate {
    fn new(rate: f64) -> Self {
        let rate = rate.max(0.001);
        Self { rate, capacity: rate.max(1.0), tokens: rate.max(1.0), last: Instant::now() }
    }

    async fn acquire(&mut self) {
        loop {
            let now = Instant::now();
            let elapsed = now.duration_since(self.last).as_secs_f64();
            self.last = now;
            self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
            if self.tokens >= 1.0 {
                self.tokens -= 1.0;
                return;
            }
            tokio::time::sleep(GATE_SLEEP).await;
        }
    }
}

pub struct EgressWorker {
    buffer: Arc<BackpressureBuffer>,
    session: Arc<StreamSession>,
    breaker: Arc<CircuitBreaker>,
    cfg: EgressConfig,
    metrics: Arc<PipelineMetrics>,
}

impl EgressWorker {
    pub fn new(
        buffer: Arc<BackpressureBuffer>,
        session: Arc<StreamSession>,
        breaker: Arc<CircuitBreaker>,
        cfg: EgressConfig,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self { buffer, session, breaker, cfg, metrics }
    }

    pub fn spawn(self, stop: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(stop))
    }

    async fn run(self, mut stop: watch::Receiver<bool>) {
        tracing::info!(
            batch_size = self.cfg.batch_size,
            flush_interval_ms = self.cfg.flush_interval.as_millis() as u64,
            "egress worker started"
        );
        let mut batch: Vec<WireRecord> = Vec::new();
        let mut gate = self.cfg.max_send_rps.map(RateGate::new);
        let mut last_flush = Instant::now();

        loop {
            if *stop.borrow() {
                break;
            }

            let wait = if batch.is_empty() {
                self.cfg.flush_interval
            } else {
                self.cfg
                    .flush_interval
                    .saturating_sub(last_flush.elapsed())
            };
            tokio::select! {
                _ = wait_for_stop(&mut stop) => break,
                dequeued = self.buffer.dequeue_wait(wait) => {
                    if let Some(entry) = dequeued {
                        if let Some(gate) = gate.as_mut() {
                            gate.acquire().await;
                        }
                        match to_wire(&entry.record) {
                            Ok(wire) => batch.push(wire),
                            Err(e) => {
                                self.buffer
                                    .send_to_dlq(&entry.record, "misscaled_timestamp", &e.to_string())
                                    .await;
                            }
                        }
                    }
                }
            }

            let should_flush = batch.len() >= self.cfg.batch_size
                || (!batch.is_empty() && last_flush.elapsed() >= self.cfg.flush_interval);
            if !should_flush {
                continue;
            }

            match self.flush_batch(&batch).await {
                Ok(()) => {
                    PipelineMetrics::incr(&self.metrics.batches_sent);
                    PipelineMetrics::add(&self.metrics.records_sent, batch.len() as u64);
                    tracing::debug!(records = batch.len(), "batch flushed");
                    batch.clear();
                    last_flush = Instant::now();
                }
                Err(e) => {
                    PipelineMetrics::incr(&self.metrics.batches_failed);
                    PipelineMetrics::add(&self.metrics.records_dropped, batch.len() as u64);
                    if e.is_circuit_open() {
                        tracing::debug!(error = %e, dropped = batch.len(), "egress fast-failed");
                    } else {
                        tracing::warn!(error = %e, dropped = batch.len(), "batch flush failed; dropping batch");
                    }
                    batch.clear();
                    last_flush = Instant::now();
                    tokio::select! {
                        _ = tokio::time::sleep(self.cfg.failure_cooldown) => {}
                        _ = wait_for_stop(&mut stop) => break,
                    }
                }
            }
        }

        // Shutdown: bounded drain, then one best-effort flush straight at
        // the session (the breaker may be open; this is a last chance, not
        // a retry path).
        let deadline = Instant::now() + self.cfg.drain_grace;
        while Instant::now() < deadline && batch.len() < self.cfg.batch_size {
            match self.buffer.dequeue().await {
                Some(entry) => {
                    if let Ok(wire) = to_wire(&entry.record) {
                        batch.push(wire);
                    }
                }
                None => break,
            }
        }
        if !batch.is_empty() {
            tracing::info!(records = batch.len(), "final flush on shutdown");
            let result = async {
                for record in &batch {
                    self.session.ingest(record).await?;
                }
                self.session.flush().await
            }
            .await;
            match result {
                Ok(()) => {
                    PipelineMetrics::incr(&self.metrics.batches_sent);
                    PipelineMetrics::add(&self.metrics.records_sent, batch.len() as u64);
                }
                Err(e) => {
                    tracing::warn!(error = %e, dropped = batch.len(), "final flush failed");
                }
            }
        }
        tracing::info!("egress worker stopped");
    }

    async fn flush_batch(&self, batch: &[WireRecord]) -> Result<(), crate::error::SinkError> {
        self.breaker
            .execute(|| async {
                for record in batch {
                    self.session.ingest(record).await?;
                }
                self.session.flush().await
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn rate_gate_paces_to_roughly_the_configured_rate() {
        let mut gate = RateGate::new(100.0);
        // Drain the initial burst allowance.
        for _ in 0..100 {
            gate.acquire().await;
        }
        let start = std::time::Instant::now();
        for _ in 0..20 {
            gate.acquire().await;
        }
        let elapsed = start.elapsed();
        // 20 records at 100 rps ≈ 200 ms; allow generous slack for CI.
        assert!(elapsed >= Duration::from_millis(120), "{elapsed:?}");
        assert!(elapsed <= Duration::from_millis(1500), "{elapsed:?}");
    }

    #[tokio::test]
    async fn rate_gate_allows_initial_burst() {
        let mut gate = RateGate::new(5.0);
        let start = std::time::Instant::now();
        for _ in 0..5 {
            gate.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(100));
    }
}
