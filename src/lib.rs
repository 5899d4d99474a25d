#![forbid(unsafe_code)]

//! # zerobridge
//!
//! Edge (DMZ) gateway that collects industrial telemetry from OT protocols
//! — OPC-UA subscriptions, MQTT topics, Modbus register polls — and
//! streams it, batched and durably, to a Databricks Zerobus table over an
//! authenticated streaming RPC.
//!
//! The pipeline keeps running through failures on either side:
//!
//! - **Supervisors** reconnect flapping sources with exponential backoff
//!   and jitter.
//! - The **backpressure buffer** absorbs bursts in a bounded memory queue,
//!   spills to an AES-GCM-encrypted disk spool, and quarantines what it
//!   cannot re-read in a dead-letter queue.
//! - The **egress worker** batches by size-or-time and submits through a
//!   **circuit breaker** into a **stream session** that self-heals the
//!   known "stream broken" failure states.
//! - The **token manager** keeps the stream authorized with single-flight
//!   OAuth2 refreshes.
//!
//! Delivery is at-least-once from a successful enqueue to the sink's
//! flush-ack; records only in memory at crash time (and spooled records at
//! power loss, absent fsync) are the documented exceptions.
//!
//! ```no_run
//! use std::sync::Arc;
//! use zerobridge::{Bridge, EnvCredentialStore};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let creds = Arc::new(EnvCredentialStore);
//!     let cfg = zerobridge::config::load_file("bridge.yaml".as_ref(), &*creds)?;
//!     let bridge = Bridge::new(cfg, creds).await?;
//!     bridge.start().await?;
//!     tokio::signal::ctrl_c().await?;
//!     bridge.stop().await;
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod breaker;
pub mod bridge;
pub mod buffer;
pub mod config;
pub mod credentials;
pub mod egress;
pub mod error;
pub mod metrics;
pub mod normalize;
pub mod protocol;
pub mod record;
pub mod sink;
pub mod supervisor;
pub mod time;

// Re-exports
pub use backoff::{ReconnectBackoff, ReconnectPolicy, MAX_RECONNECT_DELAY};
pub use breaker::{BreakerState, CircuitBreaker};
pub use bridge::Bridge;
pub use buffer::{BackpressureBuffer, BufferEntry, Enqueue, SpoolCipher};
pub use config::BridgeConfig;
pub use credentials::{secret_preview, CredentialStore, EnvCredentialStore};
pub use error::{BridgeError, BufferError, ConfigError, CredentialError, ProtocolError, SinkError};
pub use metrics::{BridgeStatus, MetricsSnapshot, PipelineMetrics};
pub use normalize::{IdentityNormalizer, Normalizer, NormalizerFn, NormalizerSet};
pub use protocol::{build_client, Ingress, ProtocolClient, TestReport};
pub use record::{to_wire, CanonicalRecord, ProtocolKind, Quality, Value, WireRecord};
pub use sink::{StreamSession, Token, TokenManager};
pub use supervisor::{Supervisor, SupervisorHandle, SupervisorState};
pub use time::{RuntimeTime, SimulatedTime, TimeSource};
