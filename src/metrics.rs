//! Pipeline counters and the status/metrics snapshot contract.
//!
//! Counters are plain atomics bumped on the hot path; the admin plane and
//! web module read them through serializable snapshots. No exposition
//! format is assumed here.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters owned by the bridge and shared with its workers.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    pub records_received: AtomicU64,
    pub records_enqueued: AtomicU64,
    pub records_dropped: AtomicU64,
    pub records_sent: AtomicU64,
    pub batches_sent: AtomicU64,
    pub batches_failed: AtomicU64,
    pub reconnections: AtomicU64,
}

impl PipelineMetrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PipelineMetricsSnapshot {
        PipelineMetricsSnapshot {
            records_received: self.records_received.load(Ordering::Relaxed),
            records_enqueued: self.records_enqueued.load(Ordering::Relaxed),
            records_dropped: self.records_dropped.load(Ordering::Relaxed),
            records_sent: self.records_sent.load(Ordering::Relaxed),
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            reconnections: self.reconnections.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineMetricsSnapshot {
    pub records_received: u64,
    pub records_enqueued: u64,
    pub records_dropped: u64,
    pub records_sent: u64,
    pub batches_sent: u64,
    pub batches_failed: u64,
    pub reconnections: u64,
}

/// Backpressure tier depths and counters, as reported by the buffer.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BackpressureSnapshot {
    pub mem_depth: usize,
    pub mem_capacity: usize,
    pub spool_bytes: u64,
    pub spool_cap_bytes: u64,
    pub dlq_count: u64,
    pub records_enqueued: u64,
    pub records_dequeued: u64,
    pub records_spooled: u64,
    pub records_dropped: u64,
}

/// Sink-side counters, as reported by session and breaker.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SinkSnapshot {
    pub session_rebuilds: u64,
    pub breaker_trips: u64,
    pub auth_refreshes: u64,
}

/// Everything `metrics()` exposes.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub pipeline: PipelineMetricsSnapshot,
    pub backpressure: BackpressureSnapshot,
    pub sink: SinkSnapshot,
}

/// The `status()` contract consumed by the external web module.
#[derive(Debug, Clone, Serialize)]
pub struct BridgeStatus {
    pub active_sources: usize,
    pub zerobus_connected: bool,
    /// `closed`, `half_open` or `open`.
    pub circuit_breaker_state: String,
    pub backpressure: BackpressureSnapshot,
    pub metrics: MetricsSnapshot,
    /// Subsystems currently marked unhealthy (e.g. an unwritable spool).
    pub unhealthy: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reads_back_counter_values() {
        let m = PipelineMetrics::default();
        PipelineMetrics::incr(&m.records_received);
        PipelineMetrics::add(&m.records_sent, 41);
        PipelineMetrics::incr(&m.records_sent);
        let snap = m.snapshot();
        assert_eq!(snap.records_received, 1);
        assert_eq!(snap.records_sent, 42);
        assert_eq!(snap.batches_failed, 0);
    }

    #[test]
    fn status_serializes_for_the_admin_plane() {
        let status = BridgeStatus {
            active_sources: 2,
            zerobus_connected: true,
            circuit_breaker_state: "closed".to_string(),
            backpressure: BackpressureSnapshot::default(),
            metrics: MetricsSnapshot::default(),
            unhealthy: vec![],
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["active_sources"], 2);
        assert_eq!(json["circuit_breaker_state"], "closed");
        assert_eq!(json["backpressure"]["mem_depth"], 0);
    }
}
