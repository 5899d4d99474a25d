//! Encrypted disk spool: the overflow tier of the backpressure buffer.
//!
//! One record per file, named `spool_<ingress_us>_<seq>.bin` so playback
//! order survives restarts. No fsync — records in flight to disk may be
//! lost across power failure, which is the documented trade-off against
//! enqueue latency.

use super::crypto::SpoolCipher;
use super::BufferEntry;
use crate::error::BufferError;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

/// Index entry for one on-disk record.
#[derive(Debug, Clone)]
struct SpoolFileMeta {
    path: PathBuf,
    ingress_us: i64,
    seq: u64,
    bytes: u64,
}

/// Outcome of a store attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored,
    /// The byte cap is reached; caller applies the drop policy.
    Full,
}

#[derive(Debug)]
pub struct DiskSpool {
    dir: PathBuf,
    max_bytes: u64,
    cipher: SpoolCipher,
    index: VecDeque<SpoolFileMeta>,
    bytes: u64,
}

impl DiskSpool {
    /// Open the spool directory, re-indexing any files a previous process
    /// left behind. Returns the spool and the highest sequence number seen,
    /// so the buffer can continue numbering monotonically.
    pub async fn open(
        dir: PathBuf,
        max_bytes: u64,
        cipher: SpoolCipher,
    ) -> Result<(Self, u64), BufferError> {
        tokio::fs::create_dir_all(&dir).await?;
        restrict_dir(&dir)?;

        let mut entries = Vec::new();
        let mut reader = tokio::fs::read_dir(&dir).await?;
        while let Some(item) = reader.next_entry().await? {
            let name = item.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some((ingress_us, seq)) = parse_name(name) else { continue };
            let bytes = item.metadata().await.map(|m| m.len()).unwrap_or(0);
            entries.push(SpoolFileMeta { path: item.path(), ingress_us, seq, bytes });
        }
        entries.sort_by_key(|m| (m.ingress_us, m.seq));

        let max_seq = entries.iter().map(|m| m.seq).max().unwrap_or(0);
        let bytes = entries.iter().map(|m| m.bytes).sum();
        let recovered = entries.len();
        if recovered > 0 {
            tracing::info!(files = recovered, bytes, dir = %dir.display(), "recovered spooled records");
        }

        Ok((
            Self { dir, max_bytes, cipher, index: entries.into(), bytes },
            max_seq,
        ))
    }

    /// Serialize, encrypt and persist one record.
    pub async fn store(&mut self, entry: &BufferEntry) -> Result<StoreOutcome, BufferError> {
        if self.bytes >= self.max_bytes {
            return Ok(StoreOutcome::Full);
        }

        let plain = serde_json::to_vec(entry).map_err(|e| BufferError::Encode(e.to_string()))?;
        let sealed = self
            .cipher
            .seal(&plain)
            .map_err(|e| BufferError::Encode(e.to_string()))?;

        let name = format!("spool_{}_{}.bin", entry.record.ingest_time_us, entry.seq);
        let path = self.dir.join(&name);
        tokio::fs::write(&path, &sealed).await?;

        let bytes = sealed.len() as u64;
        self.bytes += bytes;
        self.index.push_back(SpoolFileMeta {
            path,
            ingress_us: entry.record.ingest_time_us,
            seq: entry.seq,
            bytes,
        });
        tracing::debug!(file = %name, "spooled record");
        Ok(StoreOutcome::Stored)
    }

    /// Read, decrypt and remove the oldest spooled record.
    ///
    /// A decode failure pops the index and reports the file path so the
    /// caller can quarantine it; the spool itself keeps going.
    pub async fn load_next(&mut self) -> Result<Option<BufferEntry>, BufferError> {
        let Some(meta) = self.index.pop_front() else {
            return Ok(None);
        };
        self.bytes = self.bytes.saturating_sub(meta.bytes);

        let sealed = match tokio::fs::read(&meta.path).await {
            Ok(data) => data,
            Err(e) => {
                return Err(BufferError::SpoolCorrupt {
                    file: meta.path.display().to_string(),
                    reason: format!("read failed: {e}"),
                })
            }
        };

        let entry = self
            .cipher
            .open(&sealed)
            .map_err(|e| e.to_string())
            .and_then(|plain| serde_json::from_slice(&plain).map_err(|e| e.to_string()));

        match entry {
            Ok(entry) => {
                let _ = tokio::fs::remove_file(&meta.path).await;
                Ok(Some(entry))
            }
            Err(reason) => Err(BufferError::SpoolCorrupt {
                file: meta.path.display().to_string(),
                reason,
            }),
        }
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Delete everything on disk. Maintenance only.
    pub async fn clear(&mut self) {
        while let Some(meta) = self.index.pop_front() {
            let _ = tokio::fs::remove_file(&meta.path).await;
        }
        self.bytes = 0;
    }
}

fn parse_name(name: &str) -> Option<(i64, u64)> {
    let stem = name.strip_prefix("spool_")?.strip_suffix(".bin")?;
    let (ingress, seq) = stem.rsplit_once('_')?;
    Some((ingress.parse().ok()?, seq.parse().ok()?))
}

#[cfg(unix)]
fn restrict_dir(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
}

#[cfg(not(unix))]
fn restrict_dir(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
