//! The stream session: one logical connection to the sink, self-healing.
//!
//! The underlying stream is not safe for concurrent use, so `ingest` and
//! `flush` serialize through a single I/O mutex. A recognized fatal-state
//! error tears the transport down, rebuilds it from scratch and retries
//! the failed call exactly once; a 401/403 forces a token refresh and
//! retries once. Everything else propagates unchanged.

use super::transport::{SinkTransport, TransportFactory};
use crate::error::SinkError;
use crate::record::WireRecord;
use crate::sink::token::TokenManager;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Error texts the sink SDK emits once a stream is unusable. Matching is
/// case-insensitive and substring-based because the texts vary slightly
/// between failure paths.
const FATAL_STATE_MARKERS: [&str; 4] = [
    "stream is closed",
    "before it's opened",
    "invalid state",
    "error happened in receiving records",
];

/// Does this error mean the stream is poisoned and must be rebuilt?
pub fn is_fatal_state_error(err: &SinkError) -> bool {
    match err {
        SinkError::FatalState(_) => true,
        SinkError::Transient(msg) => fatal_state_text(msg),
        _ => false,
    }
}

fn fatal_state_text(msg: &str) -> bool {
    let msg = msg.to_lowercase();
    FATAL_STATE_MARKERS.iter().any(|marker| msg.contains(marker))
}

/// The two serialized stream operations.
#[derive(Clone, Copy)]
enum Op<'a> {
    Ingest(&'a WireRecord),
    Flush,
}

/// One logical streaming connection to the sink table.
pub struct StreamSession {
    factory: Arc<dyn TransportFactory>,
    tokens: Arc<TokenManager>,
    /// Serializes ingest/flush and owns the live transport.
    io: Mutex<Option<Box<dyn SinkTransport>>>,
    /// Exclusive during transport rebuild so in-flight opens wait.
    rebuild: Mutex<()>,
    rebuilds: AtomicU64,
    connected: AtomicBool,
}

impl StreamSession {
    pub fn new(factory: Arc<dyn TransportFactory>, tokens: Arc<TokenManager>) -> Self {
        Self {
            factory,
            tokens,
            io: Mutex::new(None),
            rebuild: Mutex::new(()),
            rebuilds: AtomicU64::new(0),
            connected: AtomicBool::new(false),
        }
    }

    /// Establish the transport eagerly. Lazy establishment on first ingest
    /// also works; this exists so startup surfaces auth problems early.
    pub async fn open(&self) -> Result<(), SinkError> {
        let mut slot = self.io.lock().await;
        self.ensure_transport(&mut slot).await?;
        Ok(())
    }

    /// Submit one row and await its acceptance into the stream.
    pub async fn ingest(&self, record: &WireRecord) -> Result<(), SinkError> {
        let mut slot = self.io.lock().await;
        self.call(&mut slot, Op::Ingest(record)).await
    }

    /// Await durable acknowledgement of all outstanding submissions.
    pub async fn flush(&self) -> Result<(), SinkError> {
        let mut slot = self.io.lock().await;
        if slot.is_none() {
            // Nothing was ever submitted.
            return Ok(());
        }
        self.call(&mut slot, Op::Flush).await
    }

    /// Graceful drain and shutdown.
    pub async fn close(&self) -> Result<(), SinkError> {
        let mut slot = self.io.lock().await;
        self.connected.store(false, Ordering::Relaxed);
        if let Some(mut transport) = slot.take() {
            transport.close().await?;
        }
        Ok(())
    }

    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// How many times the session tore down and rebuilt its transport.
    pub fn session_rebuilds(&self) -> u64 {
        self.rebuilds.load(Ordering::Relaxed)
    }

    async fn call(
        &self,
        slot: &mut Option<Box<dyn SinkTransport>>,
        op: Op<'_>,
    ) -> Result<(), SinkError> {
        let mut healed = false;
        let mut auth_retried = false;
        loop {
            self.ensure_transport(slot).await?;
            let transport = slot.as_mut().expect("transport present after ensure");
            let result = match op {
                Op::Ingest(record) => transport.ingest(record).await,
                Op::Flush => transport.flush().await,
            };
            match result {
                Ok(()) => return Ok(()),
                Err(err) if is_fatal_state_error(&err) => {
                    if healed {
                        // Healing already ran once; degrade to transient.
                        return Err(SinkError::Transient(err.to_string()));
                    }
                    healed = true;
                    tracing::warn!(error = %err, "sink stream poisoned; rebuilding transport");
                    self.heal(slot).await?;
                }
                Err(SinkError::Auth(msg)) => {
                    if auth_retried {
                        return Err(SinkError::Transient(format!("auth retry failed: {msg}")));
                    }
                    auth_retried = true;
                    tracing::warn!(error = %msg, "sink rejected credentials; forcing token refresh");
                    self.tokens.invalidate();
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn ensure_transport(
        &self,
        slot: &mut Option<Box<dyn SinkTransport>>,
    ) -> Result<(), SinkError> {
        if slot.is_some() {
            return Ok(());
        }
        let _guard = self.rebuild.lock().await;
        match self.factory.connect().await {
            Ok(transport) => {
                *slot = Some(transport);
                self.connected.store(true, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.connected.store(false, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    async fn heal(&self, slot: &mut Option<Box<dyn SinkTransport>>) -> Result<(), SinkError> {
        let _guard = self.rebuild.lock().await;
        if let Some(mut old) = slot.take() {
            // The old transport is poisoned; its close is best effort.
            let _ = old.close().await;
        }
        match self.factory.connect().await {
            Ok(transport) => {
                *slot = Some(transport);
                self.rebuilds.fetch_add(1, Ordering::Relaxed);
                self.connected.store(true, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.connected.store(false, Ordering::Relaxed);
                Err(SinkError::Transient(format!("session rebuild failed: {e}")))
            }
        }
    }
}
