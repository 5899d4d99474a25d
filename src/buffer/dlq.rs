//! Dead Letter Queue: quarantine for records that cannot be re-read or
//! cannot be delivered.
//!
//! Entries are plain JSON, one file per record, so operators can inspect
//! and replay them by hand. Corrupt spool files are moved here wholesale
//! with an `.error` sidecar describing why.

use crate::error::BufferError;
use crate::record::CanonicalRecord;
use crate::time::unix_micros_now;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Serialize)]
struct DlqEntry<'a> {
    record: &'a CanonicalRecord,
    error_kind: &'a str,
    error_message: &'a str,
    quarantined_at: i64,
}

/// File-backed quarantine. Without a directory (spool disabled) entries
/// are counted and logged but not persisted.
#[derive(Debug)]
pub struct DeadLetterQueue {
    dir: Option<PathBuf>,
    count: AtomicU64,
}

impl DeadLetterQueue {
    /// Open (and create) the DLQ directory, counting surviving entries.
    pub async fn open(dir: PathBuf) -> Result<Self, BufferError> {
        tokio::fs::create_dir_all(&dir).await?;
        let mut count = 0u64;
        let mut reader = tokio::fs::read_dir(&dir).await?;
        while let Some(item) = reader.next_entry().await? {
            if item
                .file_name()
                .to_str()
                .is_some_and(|n| n.starts_with("dlq_") && n.ends_with(".json"))
            {
                count += 1;
            }
        }
        Ok(Self { dir: Some(dir), count: AtomicU64::new(count) })
    }

    /// A DLQ that only counts; used when the disk spool is disabled.
    pub fn counting_only() -> Self {
        Self { dir: None, count: AtomicU64::new(0) }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Quarantine one record with a reason.
    pub async fn quarantine_record(
        &self,
        record: &CanonicalRecord,
        error_kind: &str,
        error_message: &str,
    ) -> Result<(), BufferError> {
        let n = self.count.fetch_add(1, Ordering::Relaxed);
        tracing::error!(kind = error_kind, reason = error_message, "record sent to DLQ");
        let Some(dir) = &self.dir else { return Ok(()) };

        let entry = DlqEntry {
            record,
            error_kind,
            error_message,
            quarantined_at: unix_micros_now(),
        };
        let body = serde_json::to_vec_pretty(&entry)
            .map_err(|e| BufferError::Encode(e.to_string()))?;
        let path = dir.join(format!("dlq_{}_{n}.json", record.ingest_time_us.max(0)));
        tokio::fs::write(&path, body).await?;
        Ok(())
    }

    /// Move a corrupt spool file into the quarantine, best effort.
    pub async fn quarantine_file(&self, src: &Path, reason: &str) {
        self.count.fetch_add(1, Ordering::Relaxed);
        tracing::error!(file = %src.display(), reason, "corrupt spool file sent to DLQ");
        let Some(dir) = &self.dir else { return };

        let name = src
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown.bin");
        let dest = dir.join(format!("dlq_spool_{name}"));
        if let Err(e) = tokio::fs::rename(src, &dest).await {
            tracing::warn!(file = %src.display(), error = %e, "failed to move corrupt spool file");
            return;
        }
        let sidecar = dest.with_extension("error");
        let body = format!("error: {reason}\nquarantined_at: {}\n", unix_micros_now());
        if let Err(e) = tokio::fs::write(&sidecar, body).await {
            tracing::warn!(file = %sidecar.display(), error = %e, "failed to write DLQ sidecar");
        }
    }
}
