//! Protocol clients: the polymorphic seam between OT sources and the
//! pipeline.
//!
//! One client per configured source. Clients connect, subscribe or poll,
//! and emit canonical records through an [`Ingress`] handle; on a fatal
//! error they return a typed error and let their supervisor handle
//! reconnection. Construction goes through [`build_client`], keyed by the
//! protocol tag.

pub mod modbus;
pub mod mqtt;
pub mod opcua;

use crate::config::{ProtocolConfig, SourceConfig};
use crate::error::ProtocolError;
use crate::record::{CanonicalRecord, ProtocolKind};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::{mpsc, watch};

/// Capacity of the bridge ingress channel each client writes into.
pub const INGRESS_CHANNEL_CAPACITY: usize = 1024;

/// Producer handle onto the bridge-owned ingress channel.
///
/// Records already carry their `source_name`, so the bridge needs no
/// back-reference into clients — this is the whole seam.
#[derive(Debug, Clone)]
pub struct Ingress {
    tx: mpsc::Sender<CanonicalRecord>,
}

impl Ingress {
    pub fn channel() -> (Self, mpsc::Receiver<CanonicalRecord>) {
        let (tx, rx) = mpsc::channel(INGRESS_CHANNEL_CAPACITY);
        (Self { tx }, rx)
    }

    /// Hand one record to the pipeline. Suspends while the bridge drains a
    /// burst; returns `false` once the bridge is gone.
    pub async fn emit(&self, record: CanonicalRecord) -> bool {
        self.tx.send(record).await.is_ok()
    }
}

/// Result of a connectivity probe, consumed by the admin plane.
#[derive(Debug, Clone, Serialize)]
pub struct TestReport {
    pub ok: bool,
    pub endpoint: String,
    pub protocol: ProtocolKind,
    pub duration_ms: u64,
    pub server_info: BTreeMap<String, String>,
    pub error: Option<String>,
}

/// The capability set every protocol variant implements.
///
/// Contract: `run` suspends cooperatively, watches `stop`, and returns
/// `Ok(())` only on a clean stop. It never reconnects by itself.
#[async_trait]
pub trait ProtocolClient: Send {
    fn kind(&self) -> ProtocolKind;

    fn endpoint(&self) -> &str;

    async fn connect(&mut self) -> Result<(), ProtocolError>;

    /// Subscribe or poll until `stop` fires or the connection fails.
    async fn run(
        &mut self,
        ingress: Ingress,
        stop: watch::Receiver<bool>,
    ) -> Result<(), ProtocolError>;

    /// Release the connection. Idempotent, never fails loudly.
    async fn disconnect(&mut self);

    /// Connect, read enough to identify the peer, disconnect.
    async fn test_connection(&mut self) -> TestReport;
}

/// Factory keyed by the source's protocol tag.
pub fn build_client(source: &SourceConfig) -> Box<dyn ProtocolClient> {
    match &source.protocol {
        ProtocolConfig::Opcua(opts) => Box::new(opcua::OpcuaClient::new(
            source.name.clone(),
            source.endpoint.clone(),
            opts.clone(),
        )),
        ProtocolConfig::Mqtt(opts) => Box::new(mqtt::MqttClient::new(
            source.name.clone(),
            source.endpoint.clone(),
            opts.clone(),
        )),
        ProtocolConfig::Modbus(opts) => Box::new(modbus::ModbusClient::new(
            source.name.clone(),
            source.endpoint.clone(),
            opts.clone(),
        )),
    }
}

/// Resolve once the stop signal reads true (or its sender is gone).
pub(crate) async fn wait_for_stop(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow() {
            return;
        }
        if stop.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MqttSourceOptions;
    use crate::record::Value;

    #[tokio::test]
    async fn ingress_delivers_records_in_order() {
        let (ingress, mut rx) = Ingress::channel();
        for n in 0..3 {
            let rec = CanonicalRecord::new(
                "s1",
                "mqtt://b:1883",
                ProtocolKind::Mqtt,
                format!("t/{n}"),
                1_700_000_000_000_000 + n,
                Value::Int(n),
            );
            assert!(ingress.emit(rec).await);
        }
        for n in 0..3 {
            assert_eq!(rx.recv().await.unwrap().topic_or_path, format!("t/{n}"));
        }
    }

    #[tokio::test]
    async fn emit_reports_a_closed_bridge() {
        let (ingress, rx) = Ingress::channel();
        drop(rx);
        let rec = CanonicalRecord::new(
            "s1",
            "mqtt://b:1883",
            ProtocolKind::Mqtt,
            "t",
            1_700_000_000_000_000,
            Value::Null,
        );
        assert!(!ingress.emit(rec).await);
    }

    #[test]
    fn factory_honors_the_protocol_tag() {
        let source = SourceConfig {
            name: "s1".into(),
            endpoint: "mqtt://b:1883".into(),
            enabled: true,
            protocol: ProtocolConfig::Mqtt(MqttSourceOptions::default()),
        };
        let client = build_client(&source);
        assert_eq!(client.kind(), ProtocolKind::Mqtt);
        assert_eq!(client.endpoint(), "mqtt://b:1883");
    }
}
