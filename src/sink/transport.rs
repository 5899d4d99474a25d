//! Transport seam to the sink's streaming RPC.
//!
//! The session talks to a [`SinkTransport`]; production uses
//! [`HttpTransport`], which batches submitted rows and posts them as
//! newline-delimited JSON with the two required headers. Tests plug in
//! their own transports through [`TransportFactory`].

use super::{SinkTarget, TABLE_HEADER};
use crate::error::{truncate_body, SinkError};
use crate::record::WireRecord;
use crate::sink::token::TokenManager;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// One logical stream connection. Not safe for concurrent use; the session
/// serializes access.
#[async_trait]
pub trait SinkTransport: Send {
    /// Submit one row. The row is accepted into the in-flight window;
    /// durability comes from [`flush`](Self::flush).
    async fn ingest(&mut self, record: &WireRecord) -> Result<(), SinkError>;

    /// Await durable acknowledgement of everything submitted so far.
    async fn flush(&mut self) -> Result<(), SinkError>;

    /// Graceful drain and shutdown.
    async fn close(&mut self) -> Result<(), SinkError>;
}

/// Builds transports; the session reconnects through this when it heals.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn SinkTransport>, SinkError>;
}

/// Streaming-over-HTTP transport posting NDJSON batches.
pub struct HttpTransport {
    http: reqwest::Client,
    ingest_url: String,
    table_header: String,
    tokens: Arc<TokenManager>,
    pending: Vec<WireRecord>,
    max_inflight: usize,
    flush_timeout: Duration,
}

impl HttpTransport {
    async fn post_pending(&mut self) -> Result<(), SinkError> {
        if self.pending.is_empty() {
            return Ok(());
        }

        // Invariant: the token is fresh at the moment the header attaches.
        let token = self.tokens.bearer().await?;

        let mut body = String::new();
        for record in &self.pending {
            let line = serde_json::to_string(record)
                .map_err(|e| SinkError::Transient(format!("row serialization failed: {e}")))?;
            body.push_str(&line);
            body.push('\n');
        }

        let response = self
            .http
            .post(&self.ingest_url)
            .header("authorization", token.bearer_header())
            .header(TABLE_HEADER, &self.table_header)
            .header("content-type", "application/x-ndjson")
            .timeout(self.flush_timeout)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SinkError::Transient(format!("sink ack timed out: {e}"))
                } else {
                    SinkError::Transient(e.to_string())
                }
            })?;

        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            let text = response.text().await.unwrap_or_default();
            return Err(SinkError::Auth(format!("HTTP {status}: {}", truncate_body(&text))));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(SinkError::Transient(format!(
                "HTTP {status}: {}",
                truncate_body(&text)
            )));
        }

        self.pending.clear();
        Ok(())
    }
}

#[async_trait]
impl SinkTransport for HttpTransport {
    async fn ingest(&mut self, record: &WireRecord) -> Result<(), SinkError> {
        self.pending.push(record.clone());
        if self.pending.len() >= self.max_inflight {
            // In-flight window is full; drain before accepting more.
            self.post_pending().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        self.post_pending().await
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        self.post_pending().await
    }
}

/// Factory for [`HttpTransport`] bound to one sink target.
pub struct HttpTransportFactory {
    http: reqwest::Client,
    ingest_url: String,
    table_header: String,
    tokens: Arc<TokenManager>,
    max_inflight: usize,
    flush_timeout: Duration,
}

impl HttpTransportFactory {
    pub fn new(target: &SinkTarget, tokens: Arc<TokenManager>) -> Self {
        Self {
            http: reqwest::Client::new(),
            ingest_url: ingest_url(&target.zerobus_endpoint),
            table_header: target.table_name(),
            tokens,
            max_inflight: target.stream.max_inflight_records.max(1),
            flush_timeout: Duration::from_millis(target.stream.flush_timeout_ms.max(1)),
        }
    }
}

#[async_trait]
impl TransportFactory for HttpTransportFactory {
    async fn connect(&self) -> Result<Box<dyn SinkTransport>, SinkError> {
        // Establishing the stream is where authorization is first exercised.
        let _ = self.tokens.bearer().await?;
        Ok(Box::new(HttpTransport {
            http: self.http.clone(),
            ingest_url: self.ingest_url.clone(),
            table_header: self.table_header.clone(),
            tokens: self.tokens.clone(),
            pending: Vec::new(),
            max_inflight: self.max_inflight,
            flush_timeout: self.flush_timeout,
        }))
    }
}

fn ingest_url(endpoint: &str) -> String {
    let endpoint = endpoint.trim_end_matches('/');
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        format!("{endpoint}/api/2.0/zerobus/ingest")
    } else {
        format!("https://{endpoint}/api/2.0/zerobus/ingest")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ingest_url_defaults_to_https() {
        assert_eq!(
            ingest_url("123.zerobus.us-east-1.cloud.databricks.com"),
            "https://123.zerobus.us-east-1.cloud.databricks.com/api/2.0/zerobus/ingest"
        );
        assert_eq!(
            ingest_url("http://localhost:9999/"),
            "http://localhost:9999/api/2.0/zerobus/ingest"
        );
    }
}
