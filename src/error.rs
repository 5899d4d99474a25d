//! Error taxonomy for the bridge pipeline.
//!
//! One enum per subsystem boundary. Recoverable kinds are handled at the
//! supervisor, egress-worker and session boundaries; anything that escapes
//! a component constructor aborts startup.

use std::time::Duration;
use thiserror::Error;

/// Truncation applied to remote error bodies kept inside error messages.
pub const MAX_REMOTE_BODY: usize = 500;

/// Configuration loading / validation failures. Startup aborts on these.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("unresolved placeholder `{placeholder}`: {reason}")]
    Unresolved { placeholder: String, reason: String },
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// A required secret could not be resolved. Startup aborts unless the
/// component needing it is disabled.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential `{0}` not found")]
    Missing(String),
}

/// Backpressure buffer failures.
#[derive(Debug, Error)]
pub enum BufferError {
    /// Memory and spool are both saturated and the drop policy is `reject`.
    #[error("memory queue and spool are saturated")]
    Saturated,
    #[error("spool I/O failed: {0}")]
    SpoolIo(#[from] std::io::Error),
    #[error("record could not be encoded for spooling: {0}")]
    Encode(String),
    #[error("spool file {file} failed to decode: {reason}")]
    SpoolCorrupt { file: String, reason: String },
}

impl BufferError {
    pub fn is_saturated(&self) -> bool {
        matches!(self, Self::Saturated)
    }
}

/// Protocol client failures. Everything here is `transient_source` from the
/// supervisor's point of view except `Stopped`, which is a clean cancel.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("connect to {endpoint} failed: {reason}")]
    Connect { endpoint: String, reason: String },
    #[error("subscription lost: {0}")]
    SubscriptionLost(String),
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("protocol failure: {0}")]
    Fatal(String),
    /// The stop signal fired; not an error for accounting purposes.
    #[error("stopped")]
    Stopped,
}

impl ProtocolError {
    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped)
    }
}

/// Sink-side failures, classified the way the egress worker and circuit
/// breaker need to tell them apart.
#[derive(Debug, Error)]
pub enum SinkError {
    /// Fast-fail while the breaker is open; the sink was not called.
    #[error("circuit breaker open ({failure_count} consecutive failures, open for {open_for:?})")]
    CircuitOpen { failure_count: u32, open_for: Duration },
    /// 401/403 or a failed token refresh.
    #[error("sink authentication failed: {0}")]
    Auth(String),
    /// The known "stream broken" state; the session self-heals on these.
    #[error("sink stream entered fatal state: {0}")]
    FatalState(String),
    /// Network errors, timeouts, ack delays, non-auth HTTP failures.
    #[error("sink transport error: {0}")]
    Transient(String),
    #[error("sink session is closed")]
    Closed,
}

impl SinkError {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}

/// Failures surfaced by the bridge's admin-plane operations.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error("source `{0}` already exists")]
    DuplicateSource(String),
    #[error("source `{0}` not found")]
    UnknownSource(String),
    #[error("bridge is not running")]
    NotRunning,
}

/// Truncate a remote error body for inclusion in an error message.
pub fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_REMOTE_BODY {
        body.to_string()
    } else {
        let mut end = MAX_REMOTE_BODY;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &body[..end])
    }
}
