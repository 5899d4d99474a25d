//! Shared fakes for the integration suites.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use zerobridge::error::SinkError;
use zerobridge::record::WireRecord;
use zerobridge::sink::{SinkTransport, Token, TokenFetcher, TokenManager, TransportFactory};

/// Token fetcher that always succeeds with a long-lived token.
pub struct StaticTokens;

#[async_trait]
impl TokenFetcher for StaticTokens {
    async fn fetch(&self) -> Result<Token, SinkError> {
        Ok(Token {
            access_token: "integration-token".into(),
            obtained_at: SystemTime::now(),
            expires_at: Some(SystemTime::now() + Duration::from_secs(3600)),
            endpoint_used: "static".into(),
        })
    }
}

pub fn token_manager() -> Arc<TokenManager> {
    Arc::new(TokenManager::new(Arc::new(StaticTokens)))
}

/// Shared state observed by the tests.
#[derive(Default)]
pub struct SinkLog {
    pub records: Mutex<Vec<WireRecord>>,
    pub flushes: AtomicUsize,
    pub connects: AtomicUsize,
    /// Errors handed out, one per ingest call, until exhausted.
    pub ingest_errors: Mutex<Vec<SinkError>>,
}

impl SinkLog {
    pub fn records(&self) -> Vec<WireRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    pub fn push_error(&self, err: SinkError) {
        self.ingest_errors.lock().unwrap().push(err);
    }
}

pub struct CapturingTransport {
    log: Arc<SinkLog>,
}

#[async_trait]
impl SinkTransport for CapturingTransport {
    async fn ingest(&mut self, record: &WireRecord) -> Result<(), SinkError> {
        let scripted = self.log.ingest_errors.lock().unwrap().pop();
        if let Some(err) = scripted {
            return Err(err);
        }
        self.log.records.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        self.log.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Factory handing out transports bound to one shared [`SinkLog`].
pub struct CapturingFactory {
    pub log: Arc<SinkLog>,
}

impl CapturingFactory {
    pub fn new() -> (Arc<Self>, Arc<SinkLog>) {
        let log = Arc::new(SinkLog::default());
        (Arc::new(Self { log: log.clone() }), log)
    }
}

#[async_trait]
impl TransportFactory for CapturingFactory {
    async fn connect(&self) -> Result<Box<dyn SinkTransport>, SinkError> {
        self.log.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(CapturingTransport { log: self.log.clone() }))
    }
}
