//! Tiered backpressure buffer: bounded memory queue, encrypted disk spool,
//! dead-letter quarantine.
//!
//! Many producers, one consumer. Enqueue never blocks on the consumer;
//! overflow spills to the spool, and only when both tiers are saturated
//! does the configured drop policy apply. Delivery order is FIFO per tier,
//! memory before spool — which matches ingress time order because records
//! only reach the spool while memory is saturated. Global FIFO across the
//! full history is intentionally not guaranteed.

mod crypto;
mod dlq;
mod spool;

pub use crypto::{CryptoError, SpoolCipher, KEY_LEN, NONCE_LEN};
pub use dlq::DeadLetterQueue;
pub use spool::{DiskSpool, StoreOutcome};

use crate::config::{BackpressureConfig, DropPolicy};
use crate::error::BufferError;
use crate::metrics::BackpressureSnapshot;
use crate::record::CanonicalRecord;
use crate::time::unix_micros_now;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

/// A canonical record plus its ingress sequence number.
///
/// Sequence numbers are per-process and order spool playback; they are not
/// durable identifiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferEntry {
    pub seq: u64,
    pub record: CanonicalRecord,
}

/// Where an accepted record ended up (or didn't).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    /// In the memory tier.
    Accepted,
    /// In the disk spool.
    Spooled,
    /// Discarded under the drop policy.
    Dropped,
    /// Could not be serialized/encrypted for the spool; quarantined.
    Dlq,
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    spooled: AtomicU64,
    dropped: AtomicU64,
}

struct Inner {
    queue: VecDeque<BufferEntry>,
    next_seq: u64,
    spool: Option<DiskSpool>,
}

/// The buffer between protocol ingress and batch egress.
pub struct BackpressureBuffer {
    cfg: BackpressureConfig,
    inner: Mutex<Inner>,
    notify: Notify,
    dlq: DeadLetterQueue,
    counters: Counters,
    spool_healthy: AtomicBool,
}

impl BackpressureBuffer {
    /// Open the buffer, creating spool/DLQ directories and the encryption
    /// key as needed, and recovering any spooled records from a previous
    /// process.
    pub async fn open(cfg: BackpressureConfig) -> Result<Self, BufferError> {
        let (spool, dlq, next_seq) = if cfg.disk_spool.enabled {
            let spool_dir = cfg.disk_spool.path.clone();
            let key_path = key_path_for(&spool_dir);
            let cipher = SpoolCipher::load_or_generate(&key_path)?;
            if !cfg.disk_spool.encryption {
                tracing::warn!("disk_spool.encryption=false is ignored; the spool always encrypts");
            }
            let (spool, max_seq) =
                DiskSpool::open(spool_dir.clone(), cfg.disk_spool.max_bytes(), cipher).await?;
            let dlq = DeadLetterQueue::open(spool_dir.join("dlq")).await?;
            (Some(spool), dlq, max_seq + 1)
        } else {
            (None, DeadLetterQueue::counting_only(), 1)
        };

        tracing::info!(
            queue_size = cfg.memory_queue.max_size,
            spool_enabled = cfg.disk_spool.enabled,
            spool_cap_mb = cfg.disk_spool.max_size_mb,
            drop_policy = ?cfg.memory_queue.drop_policy,
            "backpressure buffer ready"
        );

        Ok(Self {
            cfg,
            inner: Mutex::new(Inner { queue: VecDeque::new(), next_seq, spool }),
            notify: Notify::new(),
            dlq,
            counters: Counters::default(),
            spool_healthy: AtomicBool::new(true),
        })
    }

    /// Accept one record. Never blocks on the consumer; file I/O for the
    /// spool tier is the only await point.
    pub async fn enqueue(&self, mut record: CanonicalRecord) -> Result<Enqueue, BufferError> {
        let mut inner = self.inner.lock().await;
        record.ingest_time_us = unix_micros_now();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let entry = BufferEntry { seq, record };

        if inner.queue.len() < self.cfg.memory_queue.max_size {
            inner.queue.push_back(entry);
            self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
            self.notify.notify_one();
            return Ok(Enqueue::Accepted);
        }

        if let Some(spool) = inner.spool.as_mut() {
            match spool.store(&entry).await {
                Ok(StoreOutcome::Stored) => {
                    self.counters.spooled.fetch_add(1, Ordering::Relaxed);
                    self.notify.notify_one();
                    return Ok(Enqueue::Spooled);
                }
                Ok(StoreOutcome::Full) => {
                    tracing::warn!(
                        spool_bytes = spool.bytes(),
                        cap = spool.max_bytes(),
                        "spool full; applying drop policy"
                    );
                }
                Err(BufferError::Encode(reason)) => {
                    self.dlq
                        .quarantine_record(&entry.record, "spool_encode", &reason)
                        .await?;
                    return Ok(Enqueue::Dlq);
                }
                Err(e) => {
                    // Unwritable spool: mark unhealthy, fall through to the
                    // drop policy so ingest keeps running.
                    self.spool_healthy.store(false, Ordering::Relaxed);
                    tracing::error!(error = %e, "spool write failed; subsystem marked unhealthy");
                }
            }
        }

        self.apply_drop_policy(&mut inner, entry)
    }

    fn apply_drop_policy(
        &self,
        inner: &mut Inner,
        entry: BufferEntry,
    ) -> Result<Enqueue, BufferError> {
        match self.cfg.memory_queue.drop_policy {
            DropPolicy::Newest => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(source = %entry.record.source_name, "dropping newest record (buffer saturated)");
                Ok(Enqueue::Dropped)
            }
            DropPolicy::Oldest => {
                if let Some(evicted) = inner.queue.pop_front() {
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        source = %evicted.record.source_name,
                        seq = evicted.seq,
                        "dropping oldest record (buffer saturated)"
                    );
                }
                inner.queue.push_back(entry);
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                self.notify.notify_one();
                Ok(Enqueue::Accepted)
            }
            DropPolicy::Reject => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                Err(BufferError::Saturated)
            }
        }
    }

    /// Pull the next record: memory head first, then the oldest spool file.
    /// Returns `None` when both tiers are empty, or after quarantining a
    /// corrupt spool file (the caller simply retries).
    pub async fn dequeue(&self) -> Option<BufferEntry> {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.queue.pop_front() {
            self.counters.dequeued.fetch_add(1, Ordering::Relaxed);
            return Some(entry);
        }

        let spool = inner.spool.as_mut()?;
        match spool.load_next().await {
            Ok(Some(entry)) => {
                self.counters.dequeued.fetch_add(1, Ordering::Relaxed);
                Some(entry)
            }
            Ok(None) => None,
            Err(BufferError::SpoolCorrupt { file, reason }) => {
                drop(inner);
                self.dlq.quarantine_file(PathBuf::from(file).as_path(), &reason).await;
                None
            }
            Err(e) => {
                self.spool_healthy.store(false, Ordering::Relaxed);
                tracing::error!(error = %e, "spool read failed; subsystem marked unhealthy");
                None
            }
        }
    }

    /// Like [`dequeue`](Self::dequeue) but waits up to `timeout` for a
    /// record to arrive.
    pub async fn dequeue_wait(&self, timeout: Duration) -> Option<BufferEntry> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(entry) = self.dequeue().await {
                return Some(entry);
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep_until(deadline) => return self.dequeue().await,
            }
        }
    }

    /// Explicit quarantine from the consumer side (non-retriable sink
    /// rejections, mis-scaled timestamps).
    pub async fn send_to_dlq(&self, record: &CanonicalRecord, kind: &str, reason: &str) {
        if let Err(e) = self.dlq.quarantine_record(record, kind, reason).await {
            tracing::error!(error = %e, "failed to persist DLQ entry");
        }
    }

    /// Current depths and counters.
    pub async fn metrics(&self) -> BackpressureSnapshot {
        let inner = self.inner.lock().await;
        let (spool_bytes, spool_cap_bytes) = inner
            .spool
            .as_ref()
            .map(|s| (s.bytes(), s.max_bytes()))
            .unwrap_or((0, 0));
        BackpressureSnapshot {
            mem_depth: inner.queue.len(),
            mem_capacity: self.cfg.memory_queue.max_size,
            spool_bytes,
            spool_cap_bytes,
            dlq_count: self.dlq.count(),
            records_enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            records_dequeued: self.counters.dequeued.load(Ordering::Relaxed),
            records_spooled: self.counters.spooled.load(Ordering::Relaxed),
            records_dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }

    /// False once a spool read or write has failed at runtime.
    pub fn spool_healthy(&self) -> bool {
        self.spool_healthy.load(Ordering::Relaxed)
    }

    /// Drop everything in memory and on disk. Maintenance only.
    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.queue.clear();
        if let Some(spool) = inner.spool.as_mut() {
            spool.clear().await;
        }
        tracing::info!("backpressure buffer cleared");
    }
}

fn key_path_for(spool_dir: &std::path::Path) -> PathBuf {
    let base = spool_dir.parent().unwrap_or(spool_dir);
    base.join("certs").join("spool_encryption.key")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DiskSpoolConfig, MemoryQueueConfig};
    use crate::record::{ProtocolKind, Value};

    fn record(n: i64) -> CanonicalRecord {
        CanonicalRecord::new(
            "s1",
            "mqtt://broker:1883",
            ProtocolKind::Mqtt,
            format!("t/{n}"),
            1_700_000_000_000_000 + n,
            Value::Int(n),
        )
    }

    fn mem_only(max_size: usize, drop_policy: DropPolicy) -> BackpressureConfig {
        BackpressureConfig {
            memory_queue: MemoryQueueConfig { max_size, drop_policy },
            disk_spool: DiskSpoolConfig { enabled: false, ..DiskSpoolConfig::default() },
        }
    }

    #[tokio::test]
    async fn fifo_through_the_memory_tier() {
        let buffer = BackpressureBuffer::open(mem_only(10, DropPolicy::Newest)).await.unwrap();
        for n in 0..3 {
            assert_eq!(buffer.enqueue(record(n)).await.unwrap(), Enqueue::Accepted);
        }
        for n in 0..3 {
            let got = buffer.dequeue().await.unwrap();
            assert_eq!(got.record.topic_or_path, format!("t/{n}"));
            assert_eq!(got.seq, n as u64 + 1);
        }
        assert!(buffer.dequeue().await.is_none());
    }

    #[tokio::test]
    async fn enqueue_stamps_ingest_time() {
        let buffer = BackpressureBuffer::open(mem_only(4, DropPolicy::Newest)).await.unwrap();
        buffer.enqueue(record(0)).await.unwrap();
        let got = buffer.dequeue().await.unwrap();
        assert!(got.record.ingest_time_us > crate::record::MIN_PLAUSIBLE_EVENT_TIME_US);
    }

    #[tokio::test]
    async fn drop_newest_rejects_incoming_and_keeps_state() {
        let buffer = BackpressureBuffer::open(mem_only(2, DropPolicy::Newest)).await.unwrap();
        buffer.enqueue(record(0)).await.unwrap();
        buffer.enqueue(record(1)).await.unwrap();
        assert_eq!(buffer.enqueue(record(2)).await.unwrap(), Enqueue::Dropped);

        let snap = buffer.metrics().await;
        assert_eq!(snap.records_dropped, 1);
        assert_eq!(snap.mem_depth, 2);
        assert_eq!(buffer.dequeue().await.unwrap().record.topic_or_path, "t/0");
        assert_eq!(buffer.dequeue().await.unwrap().record.topic_or_path, "t/1");
    }

    #[tokio::test]
    async fn drop_oldest_evicts_exactly_one() {
        let buffer = BackpressureBuffer::open(mem_only(2, DropPolicy::Oldest)).await.unwrap();
        buffer.enqueue(record(0)).await.unwrap();
        buffer.enqueue(record(1)).await.unwrap();
        assert_eq!(buffer.enqueue(record(2)).await.unwrap(), Enqueue::Accepted);

        let snap = buffer.metrics().await;
        assert_eq!(snap.records_dropped, 1);
        assert_eq!(snap.mem_depth, 2);
        assert_eq!(buffer.dequeue().await.unwrap().record.topic_or_path, "t/1");
        assert_eq!(buffer.dequeue().await.unwrap().record.topic_or_path, "t/2");
    }

    #[tokio::test]
    async fn reject_policy_surfaces_a_hard_error() {
        let buffer = BackpressureBuffer::open(mem_only(1, DropPolicy::Reject)).await.unwrap();
        buffer.enqueue(record(0)).await.unwrap();
        let err = buffer.enqueue(record(1)).await.unwrap_err();
        assert!(err.is_saturated());
    }

    #[tokio::test]
    async fn overflow_spills_to_spool_and_drains_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = BackpressureConfig {
            memory_queue: MemoryQueueConfig { max_size: 2, drop_policy: DropPolicy::Newest },
            disk_spool: DiskSpoolConfig {
                enabled: true,
                path: dir.path().join("spool"),
                max_size_mb: 1,
                encryption: true,
            },
        };
        let buffer = BackpressureBuffer::open(cfg).await.unwrap();
        for n in 0..5 {
            let out = buffer.enqueue(record(n)).await.unwrap();
            if n < 2 {
                assert_eq!(out, Enqueue::Accepted);
            } else {
                assert_eq!(out, Enqueue::Spooled);
            }
        }
        let snap = buffer.metrics().await;
        assert_eq!(snap.mem_depth, 2);
        assert_eq!(snap.records_spooled, 3);
        assert!(snap.spool_bytes > 0);

        let mut seqs = Vec::new();
        for n in 0..5 {
            let got = buffer.dequeue().await.unwrap();
            assert_eq!(got.record.topic_or_path, format!("t/{n}"));
            seqs.push(got.seq);
        }
        assert!(seqs.windows(2).all(|w| w[0] < w[1]), "seq order: {seqs:?}");
        assert!(buffer.dequeue().await.is_none());
    }

    #[tokio::test]
    async fn dequeue_wait_wakes_on_enqueue() {
        let buffer = std::sync::Arc::new(
            BackpressureBuffer::open(mem_only(4, DropPolicy::Newest)).await.unwrap(),
        );
        let waiter = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.dequeue_wait(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        buffer.enqueue(record(7)).await.unwrap();
        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got.record.topic_or_path, "t/7");
    }

    #[tokio::test]
    async fn dequeue_wait_times_out_empty() {
        let buffer = BackpressureBuffer::open(mem_only(4, DropPolicy::Newest)).await.unwrap();
        let got = buffer.dequeue_wait(Duration::from_millis(30)).await;
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn clear_empties_both_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = BackpressureConfig {
            memory_queue: MemoryQueueConfig { max_size: 1, drop_policy: DropPolicy::Newest },
            disk_spool: DiskSpoolConfig {
                enabled: true,
                path: dir.path().join("spool"),
                max_size_mb: 1,
                encryption: true,
            },
        };
        let buffer = BackpressureBuffer::open(cfg).await.unwrap();
        buffer.enqueue(record(0)).await.unwrap();
        buffer.enqueue(record(1)).await.unwrap();
        buffer.clear().await;
        assert!(buffer.dequeue().await.is_none());
        let snap = buffer.metrics().await;
        assert_eq!(snap.mem_depth, 0);
        assert_eq!(snap.spool_bytes, 0);
    }
}
