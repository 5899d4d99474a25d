//! The bridge: top-level composition of the pipeline.
//!
//! Owns the buffer, the per-source supervisors, the sink session + breaker
//! + token manager, and the egress worker. The admin plane drives it with
//! start/stop, dynamic source add/remove, and sink enable/disable; the web
//! module reads `status()` and `metrics()` snapshots.

use crate::backoff::ReconnectBackoff;
use crate::breaker::CircuitBreaker;
use crate::buffer::{BackpressureBuffer, Enqueue};
use crate::config::{BridgeConfig, SourceConfig, ZerobusConfig};
use crate::credentials::CredentialStore;
use crate::egress::{EgressConfig, EgressWorker};
use crate::error::{BridgeError, ConfigError};
use crate::metrics::{BridgeStatus, MetricsSnapshot, PipelineMetrics, SinkSnapshot};
use crate::normalize::NormalizerSet;
use crate::protocol::{build_client, wait_for_stop, Ingress, TestReport};
use crate::sink::{
    HttpTransportFactory, OAuthClientCredentials, SinkTarget, StreamSession, TokenManager,
    TransportFactory, ZerobusScope,
};
use crate::supervisor::{Supervisor, SupervisorHandle};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

/// The sink-side trio built when egress is enabled.
struct SinkHandles {
    session: Arc<StreamSession>,
    breaker: Arc<CircuitBreaker>,
    tokens: Arc<TokenManager>,
    egress_stop: watch::Sender<bool>,
    egress_task: JoinHandle<()>,
}

struct Inner {
    cfg: BridgeConfig,
    running: bool,
    supervisors: HashMap<String, SupervisorHandle>,
    sink: Option<SinkHandles>,
    pump: Option<(watch::Sender<bool>, JoinHandle<()>)>,
    ingress: Ingress,
    ingress_rx: Option<tokio::sync::mpsc::Receiver<crate::record::CanonicalRecord>>,
}

/// The process's primary long-lived object.
pub struct Bridge {
    buffer: Arc<BackpressureBuffer>,
    metrics: Arc<PipelineMetrics>,
    creds: Arc<dyn CredentialStore>,
    /// Where `enable_sink` re-reads configuration from, when set.
    config_path: Option<PathBuf>,
    /// Test seam: replaces the HTTP transport when present.
    transport_override: Option<Arc<dyn TransportFactory>>,
    /// External tag-normalization mappers, applied at ingress.
    normalizers: NormalizerSet,
    inner: Mutex<Inner>,
}

impl Bridge {
    pub async fn new(
        cfg: BridgeConfig,
        creds: Arc<dyn CredentialStore>,
    ) -> Result<Self, BridgeError> {
        cfg.validate()?;
        let buffer = Arc::new(BackpressureBuffer::open(cfg.backpressure.clone()).await?);
        let (ingress, ingress_rx) = Ingress::channel();
        Ok(Self {
            buffer,
            metrics: Arc::new(PipelineMetrics::default()),
            creds,
            config_path: None,
            transport_override: None,
            normalizers: NormalizerSet::default(),
            inner: Mutex::new(Inner {
                cfg,
                running: false,
                supervisors: HashMap::new(),
                sink: None,
                pump: None,
                ingress,
                ingress_rx: Some(ingress_rx),
            }),
        })
    }

    /// Remember the config file so `enable_sink` can reload it.
    pub fn with_config_path(mut self, path: PathBuf) -> Self {
        self.config_path = Some(path);
        self
    }

    /// Replace the sink transport; used by tests and local soak rigs.
    pub fn with_transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.transport_override = Some(factory);
        self
    }

    /// Install the externally-supplied tag-normalization mappers.
    pub fn with_normalizers(mut self, normalizers: NormalizerSet) -> Self {
        self.normalizers = normalizers;
        self
    }

    /// Producer handle onto the ingress channel (also used by admin-side
    /// record injectors).
    pub async fn ingress_handle(&self) -> Ingress {
        self.inner.lock().await.ingress.clone()
    }

    /// Open the buffer consumer, the sink path (when enabled) and one
    /// supervisor per enabled source.
    pub async fn start(&self) -> Result<(), BridgeError> {
        let mut inner = self.inner.lock().await;
        if inner.running {
            return Ok(());
        }
        tracing::info!(sources = inner.cfg.sources.len(), "starting bridge");

        self.start_pump(&mut inner);

        if inner.cfg.zerobus.enabled {
            let handles = self.build_sink(&inner.cfg.zerobus).await?;
            inner.sink = Some(handles);
        }

        let sources: Vec<SourceConfig> = inner
            .cfg
            .sources
            .iter()
            .filter(|s| s.enabled)
            .cloned()
            .collect();
        for source in sources {
            self.spawn_supervisor(&mut inner, &source);
        }

        inner.running = true;
        tracing::info!(
            active_sources = inner.supervisors.len(),
            sink_enabled = inner.sink.is_some(),
            "bridge started"
        );
        Ok(())
    }

    /// Cancel supervisors and egress, flush what's possible, close the
    /// session.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        if !inner.running {
            return;
        }
        tracing::info!("stopping bridge");

        let handles: Vec<SupervisorHandle> =
            inner.supervisors.drain().map(|(_, handle)| handle).collect();
        futures::future::join_all(handles.into_iter().map(SupervisorHandle::stop)).await;

        if let Some(sink) = inner.sink.take() {
            let _ = sink.egress_stop.send(true);
            let _ = sink.egress_task.await;
            if let Err(e) = sink.session.close().await {
                tracing::warn!(error = %e, "session close failed");
            }
        }

        if let Some((pump_stop, pump_task)) = inner.pump.take() {
            let _ = pump_stop.send(true);
            let _ = pump_task.await;
        }
        // Fresh channel for a future start().
        let (ingress, ingress_rx) = Ingress::channel();
        inner.ingress = ingress;
        inner.ingress_rx = Some(ingress_rx);

        inner.running = false;
        tracing::info!("bridge stopped");
    }

    /// Register a new source; starts its supervisor immediately when the
    /// bridge is running.
    pub async fn add_source(&self, source: SourceConfig) -> Result<(), BridgeError> {
        source.validate()?;
        let mut inner = self.inner.lock().await;
        if inner.cfg.sources.iter().any(|s| s.name == source.name) {
            return Err(BridgeError::DuplicateSource(source.name));
        }
        tracing::info!(source = %source.name, protocol = %source.kind(), "adding source");
        if inner.running && source.enabled {
            self.spawn_supervisor(&mut inner, &source);
        }
        inner.cfg.sources.push(source);
        Ok(())
    }

    /// Cancel and remove one source.
    pub async fn remove_source(&self, name: &str) -> Result<(), BridgeError> {
        let mut inner = self.inner.lock().await;
        let position = inner
            .cfg
            .sources
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| BridgeError::UnknownSource(name.to_string()))?;
        inner.cfg.sources.remove(position);
        if let Some(handle) = inner.supervisors.remove(name) {
            handle.stop().await;
        }
        tracing::info!(source = name, "source removed");
        Ok(())
    }

    /// Probe a configured source without touching its supervisor.
    pub async fn test_source(&self, name: &str) -> Result<TestReport, BridgeError> {
        let source = {
            let inner = self.inner.lock().await;
            inner
                .cfg
                .sources
                .iter()
                .find(|s| s.name == name)
                .cloned()
                .ok_or_else(|| BridgeError::UnknownSource(name.to_string()))?
        };
        let mut client = build_client(&source);
        Ok(client.test_connection().await)
    }

    /// (Re)build the sink path and start egress. Reloads the sink section
    /// from disk when a config path is known. Idempotent.
    pub async fn enable_sink(&self) -> Result<(), BridgeError> {
        let mut inner = self.inner.lock().await;

        if let Some(path) = &self.config_path {
            let fresh = crate::config::load_file(path, self.creds.as_ref())?;
            inner.cfg.zerobus = fresh.zerobus;
        }
        inner.cfg.zerobus.enabled = true;
        // Re-validate with the sink on.
        inner.cfg.validate()?;

        if !inner.running {
            return Ok(());
        }
        if let Some(old) = inner.sink.take() {
            let _ = old.egress_stop.send(true);
            let _ = old.egress_task.await;
            let _ = old.session.close().await;
        }
        let handles = self.build_sink(&inner.cfg.zerobus).await?;
        inner.sink = Some(handles);
        tracing::info!("sink egress enabled");
        Ok(())
    }

    /// Stop egress and close the session. Idempotent.
    pub async fn disable_sink(&self) {
        let mut inner = self.inner.lock().await;
        inner.cfg.zerobus.enabled = false;
        if let Some(sink) = inner.sink.take() {
            let _ = sink.egress_stop.send(true);
            let _ = sink.egress_task.await;
            if let Err(e) = sink.session.close().await {
                tracing::warn!(error = %e, "session close failed");
            }
            tracing::info!("sink egress disabled");
        }
    }

    pub async fn metrics(&self) -> MetricsSnapshot {
        let inner = self.inner.lock().await;
        let sink = match &inner.sink {
            Some(s) => SinkSnapshot {
                session_rebuilds: s.session.session_rebuilds(),
                breaker_trips: s.breaker.trips(),
                auth_refreshes: s.tokens.refresh_count(),
            },
            None => SinkSnapshot::default(),
        };
        MetricsSnapshot {
            pipeline: self.metrics.snapshot(),
            backpressure: self.buffer.metrics().await,
            sink,
        }
    }

    pub async fn status(&self) -> BridgeStatus {
        let metrics = self.metrics().await;
        let inner = self.inner.lock().await;
        let mut unhealthy = Vec::new();
        if !self.buffer.spool_healthy() {
            unhealthy.push("disk_spool".to_string());
        }
        BridgeStatus {
            active_sources: inner.supervisors.len(),
            zerobus_connected: inner
                .sink
                .as_ref()
                .map(|s| s.session.connected())
                .unwrap_or(false),
            circuit_breaker_state: inner
                .sink
                .as_ref()
                .map(|s| s.breaker.state().as_str())
                .unwrap_or("closed")
                .to_string(),
            backpressure: metrics.backpressure.clone(),
            metrics,
            unhealthy,
        }
    }

    fn start_pump(&self, inner: &mut Inner) {
        let Some(mut rx) = inner.ingress_rx.take() else { return };
        let buffer = self.buffer.clone();
        let metrics = self.metrics.clone();
        let normalizers = self.normalizers.clone();
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = wait_for_stop(&mut stop_rx) => break,
                    received = rx.recv() => match received {
                        Some(record) => {
                            PipelineMetrics::incr(&metrics.records_received);
                            let record = normalizers.apply(record);
                            match buffer.enqueue(record).await {
                                Ok(Enqueue::Accepted | Enqueue::Spooled) => {
                                    PipelineMetrics::incr(&metrics.records_enqueued);
                                }
                                Ok(Enqueue::Dropped | Enqueue::Dlq) => {
                                    PipelineMetrics::incr(&metrics.records_dropped);
                                }
                                Err(e) => {
                                    PipelineMetrics::incr(&metrics.records_dropped);
                                    tracing::warn!(error = %e, "ingress enqueue rejected");
                                }
                            }
                        }
                        None => break,
                    }
                }
            }
        });
        inner.pump = Some((stop_tx, task));
    }

    fn spawn_supervisor(&self, inner: &mut Inner, source: &SourceConfig) {
        let client = build_client(source);
        let supervisor = Supervisor::new(
            source.name.clone(),
            client,
            inner.ingress.clone(),
            ReconnectBackoff::new(inner.cfg.reconnect.policy()),
            self.metrics.clone(),
        );
        inner
            .supervisors
            .insert(source.name.clone(), supervisor.spawn());
    }

    async fn build_sink(&self, cfg: &ZerobusConfig) -> Result<SinkHandles, BridgeError> {
        let target_cfg = cfg
            .target
            .clone()
            .ok_or_else(|| ConfigError::Invalid("zerobus.target is required".into()))?;
        let target = SinkTarget {
            workspace_host: cfg.workspace_host.clone(),
            zerobus_endpoint: cfg.zerobus_endpoint.clone(),
            table: target_cfg.clone(),
            stream: cfg.stream.clone(),
        };

        let client_id = cfg.auth.resolve_client_id()?;
        let client_secret = cfg.auth.resolve_client_secret()?;
        let scope = cfg.workspace_id().map(|workspace_id| ZerobusScope {
            workspace_id,
            catalog: target_cfg.catalog.clone(),
            schema: target_cfg.schema.clone(),
            table: target_cfg.table.clone(),
        });
        let fetcher = OAuthClientCredentials::new(
            reqwest::Client::new(),
            cfg.workspace_host.clone(),
            client_id,
            client_secret,
            cfg.auth.scope.clone(),
            scope,
        );
        let tokens = Arc::new(TokenManager::new(Arc::new(fetcher)));

        let factory: Arc<dyn TransportFactory> = match &self.transport_override {
            Some(factory) => factory.clone(),
            None => Arc::new(HttpTransportFactory::new(&target, tokens.clone())),
        };
        let session = Arc::new(StreamSession::new(factory, tokens.clone()));
        if let Err(e) = session.open().await {
            // Sink may be down at startup; egress + breaker will keep
            // retrying, so this is not fatal.
            tracing::warn!(error = %e, "sink session not yet reachable");
        }

        let breaker = Arc::new(CircuitBreaker::new(
            cfg.circuit_breaker.failure_threshold,
            cfg.circuit_breaker.cooldown(),
        ));

        let (egress_stop, egress_stop_rx) = watch::channel(false);
        let worker = EgressWorker::new(
            self.buffer.clone(),
            session.clone(),
            breaker.clone(),
            EgressConfig::from_zerobus(cfg),
            self.metrics.clone(),
        );
        let egress_task = worker.spawn(egress_stop_rx);

        Ok(SinkHandles { session, breaker, tokens, egress_stop, egress_task })
    }
}
