//! MQTT client: subscribes to topic filters and normalizes payloads.
//!
//! Payloads are interpreted per the configured format. A decode failure in
//! strict `json` mode never crashes the client — it emits a metadata-only
//! record with status `bad` and the reason attached.

use super::{wait_for_stop, Ingress, ProtocolClient, TestReport};
use crate::config::{MqttSourceOptions, PayloadFormat};
use crate::error::ProtocolError;
use crate::record::{CanonicalRecord, ProtocolKind, Quality, Value};
use crate::time::unix_micros_now;
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Packet, Publish, QoS, TlsConfiguration, Transport,
};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio::sync::watch;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const CHANNEL_CAPACITY: usize = 128;

pub struct MqttClient {
    source_name: String,
    endpoint: String,
    opts: MqttSourceOptions,
    host: String,
    port: u16,
    use_tls: bool,
    conn: Option<(AsyncClient, EventLoop)>,
}

impl MqttClient {
    pub fn new(source_name: String, endpoint: String, opts: MqttSourceOptions) -> Self {
        let (host, port, use_tls) = parse_endpoint(&endpoint);
        Self { source_name, endpoint, opts, host, port, use_tls, conn: None }
    }

    fn qos(&self) -> QoS {
        match self.opts.qos {
            0 => QoS::AtMostOnce,
            2 => QoS::ExactlyOnce,
            _ => QoS::AtLeastOnce,
        }
    }

    async fn build_options(&mut self) -> Result<MqttOptions, ProtocolError> {
        let client_id = self
            .opts
            .client_id
            .clone()
            .unwrap_or_else(|| format!("zerobridge-{}", self.source_name));
        let mut options = MqttOptions::new(client_id, self.host.clone(), self.port);
        options.set_keep_alive(Duration::from_secs(self.opts.keepalive_secs.max(5)));
        options.set_clean_session(self.opts.clean_session);
        if let (Some(user), Some(pass)) = (&self.opts.username, &self.opts.password) {
            options.set_credentials(user.clone(), pass.clone());
        }

        if self.use_tls {
            let tls = self.opts.tls.as_ref().ok_or_else(|| ProtocolError::Connect {
                endpoint: self.endpoint.clone(),
                reason: "mqtts endpoint requires a tls section with ca_file".to_string(),
            })?;
            let ca_file = tls.ca_file.clone();
            let cert_file = tls.cert_file.clone();
            let key_file = tls.key_file.clone();
            let endpoint = self.endpoint.clone();
            let read = move |path: std::path::PathBuf| {
                let endpoint = endpoint.clone();
                async move {
                    tokio::fs::read(&path).await.map_err(|e| ProtocolError::Connect {
                        endpoint,
                        reason: format!("failed to read {}: {e}", path.display()),
                    })
                }
            };
            let ca = read(ca_file).await?;
            let client_auth = match (cert_file, key_file) {
                (Some(cert), Some(key)) => Some((read(cert).await?, read(key).await?)),
                _ => None,
            };
            options.set_transport(Transport::Tls(TlsConfiguration::Simple {
                ca,
                alpn: None,
                client_auth,
            }));
        }

        Ok(options)
    }

    fn parse_message(&self, publish: &Publish) -> CanonicalRecord {
        let topic = publish.topic.clone();
        let payload = publish.payload.as_ref();
        let mut record = match interpret_payload(payload, self.opts.payload_format, &self.opts.value_field)
        {
            Ok((value, value_type, extra)) => {
                let mut record = CanonicalRecord::new(
                    self.source_name.clone(),
                    self.endpoint.clone(),
                    ProtocolKind::Mqtt,
                    topic,
                    unix_micros_now(),
                    value,
                )
                .with_value_type(value_type);
                if let Some((key, meta)) = extra {
                    record = record.with_meta(key, meta);
                }
                record
            }
            Err(reason) => CanonicalRecord::new(
                self.source_name.clone(),
                self.endpoint.clone(),
                ProtocolKind::Mqtt,
                topic,
                unix_micros_now(),
                Value::Null,
            )
            .with_value_type("Json")
            .with_status(Quality::Bad, 0)
            .with_meta("reason", reason),
        };
        record = record
            .with_meta("qos", publish.qos as i64)
            .with_meta("retain", publish.retain);
        record
    }
}

/// Interpret a payload per the configured format. The error branch is the
/// strict-JSON decode failure; everything else degrades gracefully.
fn interpret_payload(
    payload: &[u8],
    format: PayloadFormat,
    value_field: &str,
) -> Result<(Value, String, Option<(String, String)>), String> {
    match format {
        PayloadFormat::Bytes => Ok((Value::Bytes(payload.to_vec()), "Bytes".to_string(), None)),
        PayloadFormat::String => Ok((
            Value::Text(String::from_utf8_lossy(payload).into_owned()),
            "String".to_string(),
            None,
        )),
        PayloadFormat::Json => match serde_json::from_slice::<serde_json::Value>(payload) {
            Ok(parsed) => Ok(json_to_value(parsed, value_field)),
            Err(e) => Err(format!("json decode failed: {e}")),
        },
        PayloadFormat::Auto => {
            if let Ok(parsed) = serde_json::from_slice::<serde_json::Value>(payload) {
                return Ok(json_to_value(parsed, value_field));
            }
            match std::str::from_utf8(payload) {
                Ok(text) => Ok((Value::Text(text.to_string()), "String".to_string(), None)),
                Err(_) => Ok((Value::Bytes(payload.to_vec()), "Bytes".to_string(), None)),
            }
        }
    }
}

fn json_to_value(
    parsed: serde_json::Value,
    value_field: &str,
) -> (Value, String, Option<(String, String)>) {
    match parsed {
        serde_json::Value::Object(map) => {
            let full = serde_json::Value::Object(map);
            let extracted = full.get(value_field).cloned();
            let payload_meta = Some(("payload".to_string(), full.to_string()));
            match extracted {
                Some(inner) => {
                    let (value, value_type, _) = json_scalar(inner);
                    (value, value_type, payload_meta)
                }
                // No value field: carry the whole document.
                None => (Value::Text(full.to_string()), "Json".to_string(), payload_meta),
            }
        }
        other => json_scalar(other),
    }
}

fn json_scalar(v: serde_json::Value) -> (Value, String, Option<(String, String)>) {
    match v {
        serde_json::Value::Bool(b) => (Value::Bool(b), "Bool".to_string(), None),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                (Value::Int(i), "Int64".to_string(), None)
            } else {
                (Value::Float(n.as_f64().unwrap_or(f64::NAN)), "Float64".to_string(), None)
            }
        }
        serde_json::Value::String(s) => (Value::Text(s), "String".to_string(), None),
        serde_json::Value::Null => (Value::Null, "Null".to_string(), None),
        nested => (Value::Text(nested.to_string()), "Json".to_string(), None),
    }
}

fn parse_endpoint(endpoint: &str) -> (String, u16, bool) {
    let endpoint = endpoint.trim();
    let (use_tls, rest) = if let Some(rest) = endpoint.strip_prefix("mqtts://") {
        (true, rest)
    } else if let Some(rest) = endpoint.strip_prefix("mqtt://") {
        (false, rest)
    } else {
        (false, endpoint)
    };
    let default_port = if use_tls { 8883 } else { 1883 };
    match rest.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (host.to_string(), port, use_tls),
            Err(_) => (rest.to_string(), default_port, use_tls),
        },
        None => (rest.to_string(), default_port, use_tls),
    }
}

#[async_trait]
impl ProtocolClient for MqttClient {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Mqtt
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn connect(&mut self) -> Result<(), ProtocolError> {
        if self.conn.is_some() {
            return Ok(());
        }
        let options = self.build_options().await?;
        let (client, mut eventloop) = AsyncClient::new(options, CHANNEL_CAPACITY);

        // Drive the event loop until the broker acknowledges the session.
        let deadline = tokio::time::Instant::now() + CONNECT_TIMEOUT;
        loop {
            let event = tokio::time::timeout_at(deadline, eventloop.poll())
                .await
                .map_err(|_| ProtocolError::Timeout(CONNECT_TIMEOUT))?;
            match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => break,
                Ok(_) => {}
                Err(e) => {
                    return Err(ProtocolError::Connect {
                        endpoint: self.endpoint.clone(),
                        reason: e.to_string(),
                    })
                }
            }
        }

        tracing::info!(source = %self.source_name, host = %self.host, port = self.port, tls = self.use_tls, "mqtt connected");
        self.conn = Some((client, eventloop));
        Ok(())
    }

    async fn run(
        &mut self,
        ingress: Ingress,
        mut stop: watch::Receiver<bool>,
    ) -> Result<(), ProtocolError> {
        let qos = self.qos();
        let topics = self.opts.topics.clone();
        let Some((client, _)) = self.conn.as_ref() else {
            return Err(ProtocolError::Fatal("run() before connect()".into()));
        };
        for topic in &topics {
            client
                .subscribe(topic.clone(), qos)
                .await
                .map_err(|e| ProtocolError::SubscriptionLost(e.to_string()))?;
        }
        tracing::info!(source = %self.source_name, topics = topics.len(), "mqtt subscribed");

        let mut received: u64 = 0;
        loop {
            // Scope the event-loop borrow so record parsing can use &self.
            let event = {
                let (_, eventloop) = self.conn.as_mut().expect("connection present");
                tokio::select! {
                    _ = wait_for_stop(&mut stop) => return Ok(()),
                    event = eventloop.poll() => event,
                }
            };
            match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let record = self.parse_message(&publish);
                    if !ingress.emit(record).await {
                        return Ok(());
                    }
                    received += 1;
                    if received % 100 == 0 {
                        tracing::debug!(source = %self.source_name, received, "mqtt receiving");
                    }
                }
                Ok(_) => {}
                Err(e) => return Err(ProtocolError::SubscriptionLost(e.to_string())),
            }
        }
    }

    async fn disconnect(&mut self) {
        if let Some((client, _)) = self.conn.take() {
            let _ = client.disconnect().await;
        }
    }

    async fn test_connection(&mut self) -> TestReport {
        let started = Instant::now();
        let result = self.connect().await;
        let mut server_info = BTreeMap::new();
        server_info.insert("host".to_string(), self.host.clone());
        server_info.insert("port".to_string(), self.port.to_string());
        server_info.insert("tls".to_string(), self.use_tls.to_string());
        self.disconnect().await;
        TestReport {
            ok: result.is_ok(),
            endpoint: self.endpoint.clone(),
            protocol: ProtocolKind::Mqtt,
            duration_ms: started.elapsed().as_millis() as u64,
            server_info,
            error: result.err().map(|e| e.to_string()),
        }
    }
}
