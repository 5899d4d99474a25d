//! OPC-UA client: browses for Variable nodes, subscribes, and forwards
//! data-change notifications as canonical records.
//!
//! The `opcua` session API is blocking and runs its own I/O thread, so
//! every service call goes through `spawn_blocking` and notifications
//! cross into the async world over an unbounded channel.

use super::{wait_for_stop, Ingress, ProtocolClient, TestReport};
use crate::config::OpcuaSourceOptions;
use crate::error::ProtocolError;
use crate::record::{CanonicalRecord, ProtocolKind, Quality, Value as RecordValue};
use crate::time::unix_micros_now;
use async_trait::async_trait;
use opcua::client::prelude::*;
use opcua::sync::RwLock;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

/// How often the run loop verifies the session is still alive.
const LIVENESS_INTERVAL: Duration = Duration::from_secs(2);

type SharedSession = Arc<RwLock<Session>>;

pub struct OpcuaClient {
    source_name: String,
    endpoint: String,
    opts: OpcuaSourceOptions,
    client: Option<Client>,
    session: Option<SharedSession>,
}

impl OpcuaClient {
    pub fn new(source_name: String, endpoint: String, opts: OpcuaSourceOptions) -> Self {
        Self { source_name, endpoint, opts, client: None, session: None }
    }

    fn record_from(&self, path: &str, node_id: &NodeId, data_value: &DataValue) -> CanonicalRecord {
        let (value, value_type) = match &data_value.value {
            Some(variant) => variant_to_value(variant),
            None => (RecordValue::Null, "Null".to_string()),
        };

        let event_time_us = data_value
            .source_timestamp
            .as_ref()
            .map(|ts| ts.as_chrono().timestamp_micros())
            .unwrap_or_else(unix_micros_now);

        let status_code = data_value.status.map(|s| s.bits()).unwrap_or(0);
        let status = match data_value.status {
            // Absent status means Good per the OPC-UA data model.
            None => Quality::Good,
            Some(s) if s.is_good() => Quality::Good,
            Some(s) if s.is_uncertain() => Quality::Uncertain,
            Some(_) => Quality::Bad,
        };

        CanonicalRecord::new(
            self.source_name.clone(),
            self.endpoint.clone(),
            ProtocolKind::Opcua,
            path.to_string(),
            event_time_us,
            value,
        )
        .with_value_type(value_type)
        .with_status(status, status_code)
        .with_meta("namespace", node_id.namespace as i64)
        .with_meta("node_id", node_id.to_string())
    }
}

fn variant_to_value(variant: &Variant) -> (RecordValue, String) {
    match variant {
        Variant::Boolean(b) => (RecordValue::Bool(*b), "Boolean".to_string()),
        Variant::SByte(v) => (RecordValue::Int(*v as i64), "SByte".to_string()),
        Variant::Byte(v) => (RecordValue::Int(*v as i64), "Byte".to_string()),
        Variant::Int16(v) => (RecordValue::Int(*v as i64), "Int16".to_string()),
        Variant::UInt16(v) => (RecordValue::Int(*v as i64), "UInt16".to_string()),
        Variant::Int32(v) => (RecordValue::Int(*v as i64), "Int32".to_string()),
        Variant::UInt32(v) => (RecordValue::Int(*v as i64), "UInt32".to_string()),
        Variant::Int64(v) => (RecordValue::Int(*v), "Int64".to_string()),
        Variant::UInt64(v) => (RecordValue::Int(*v as i64), "UInt64".to_string()),
        Variant::Float(v) => (RecordValue::Float(*v as f64), "Float".to_string()),
        Variant::Double(v) => (RecordValue::Float(*v), "Double".to_string()),
        Variant::String(s) => (RecordValue::Text(s.to_string()), "String".to_string()),
        Variant::ByteString(b) => (
            RecordValue::Bytes(b.value.clone().unwrap_or_default()),
            "ByteString".to_string(),
        ),
        Variant::Empty => (RecordValue::Null, "Null".to_string()),
        other => (RecordValue::Text(format!("{other:?}")), "Variant".to_string()),
    }
}

/// Breadth-first browse below the Objects folder collecting Variable nodes.
fn browse_variables(
    session: &SharedSession,
    max_nodes: usize,
    max_depth: usize,
) -> Result<Vec<(NodeId, String)>, String> {
    let session = session.read();
    let mut variables: Vec<(NodeId, String)> = Vec::new();
    let mut frontier: VecDeque<(NodeId, usize, String)> = VecDeque::new();
    frontier.push_back((ObjectId::ObjectsFolder.into(), 0, String::new()));

    while let Some((node, depth, path)) = frontier.pop_front() {
        if variables.len() >= max_nodes {
            break;
        }
        let description = BrowseDescription {
            node_id: node,
            browse_direction: BrowseDirection::Forward,
            reference_type_id: ReferenceTypeId::HierarchicalReferences.into(),
            include_subtypes: true,
            node_class_mask: 0,
            result_mask: 0x3f,
        };
        let results = session
            .browse(&[description])
            .map_err(|s| format!("browse failed: {s:?}"))?;
        let Some(results) = results else { continue };
        for result in results {
            let Some(references) = result.references else { continue };
            for reference in references {
                if variables.len() >= max_nodes {
                    break;
                }
                let child = reference.node_id.node_id.clone();
                let name = reference.display_name.text.to_string();
                let child_path = if path.is_empty() {
                    name.clone()
                } else {
                    format!("{path}/{name}")
                };
                match reference.node_class {
                    NodeClass::Variable => variables.push((child, child_path)),
                    NodeClass::Object if depth + 1 <= max_depth => {
                        frontier.push_back((child, depth + 1, child_path));
                    }
                    _ => {}
                }
            }
        }
    }
    Ok(variables)
}

#[async_trait]
impl ProtocolClient for OpcuaClient {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Opcua
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn connect(&mut self) -> Result<(), ProtocolError> {
        if self.session.is_some() {
            return Ok(());
        }
        let endpoint_url = self.endpoint.clone();
        let session_timeout = self.opts.session_timeout_ms as u32;

        let connected = tokio::task::spawn_blocking(move || -> Result<(Client, SharedSession), String> {
            let mut client = ClientBuilder::new()
                .application_name("zerobridge")
                .application_uri("urn:zerobridge")
                .product_uri("urn:zerobridge")
                .trust_server_certs(true)
                .create_sample_keypair(true)
                .session_retry_limit(0)
                .session_timeout(session_timeout)
                .client()
                .ok_or_else(|| "invalid opcua client configuration".to_string())?;

            let endpoint: EndpointDescription = (
                endpoint_url.as_str(),
                "None",
                MessageSecurityMode::None,
                UserTokenPolicy::anonymous(),
            )
                .into();
            let session = client
                .connect_to_endpoint(endpoint, IdentityToken::Anonymous)
                .map_err(|status| format!("{status:?}"))?;
            Ok((client, session))
        })
        .await
        .map_err(|e| ProtocolError::Fatal(format!("connect task panicked: {e}")))?
        .map_err(|reason| ProtocolError::Connect { endpoint: self.endpoint.clone(), reason })?;

        tracing::info!(source = %self.source_name, endpoint = %self.endpoint, "opcua connected");
        self.client = Some(connected.0);
        self.session = Some(connected.1);
        Ok(())
    }

    async fn run(
        &mut self,
        ingress: Ingress,
        mut stop: watch::Receiver<bool>,
    ) -> Result<(), ProtocolError> {
        let session = self
            .session
            .clone()
            .ok_or_else(|| ProtocolError::Fatal("run() before connect()".into()))?;

        // Browse for variables up to the configured cap.
        let (max_nodes, max_depth) = (self.opts.max_nodes, self.opts.max_browse_depth);
        let browse_session = session.clone();
        let variables =
            tokio::task::spawn_blocking(move || browse_variables(&browse_session, max_nodes, max_depth))
                .await
                .map_err(|e| ProtocolError::Fatal(format!("browse task panicked: {e}")))?
                .map_err(ProtocolError::SubscriptionLost)?;

        if variables.is_empty() {
            return Err(ProtocolError::SubscriptionLost(
                "no variable nodes found below the Objects folder".to_string(),
            ));
        }
        tracing::info!(source = %self.source_name, nodes = variables.len(), "opcua monitoring variables");

        let paths: HashMap<NodeId, String> = variables.iter().cloned().collect();
        let node_ids: Vec<NodeId> = variables.into_iter().map(|(node, _)| node).collect();

        // Subscription callbacks fire on the session thread; ship them out.
        let (tx, mut rx) = mpsc::unbounded_channel::<(NodeId, DataValue)>();
        let publishing_interval = self.opts.publishing_interval_ms.max(50) as f64;
        let subscribe_session = session.clone();
        tokio::task::spawn_blocking(move || -> Result<u32, String> {
            let s = subscribe_session.read();
            let subscription_id = s
                .create_subscription(
                    publishing_interval,
                    100,
                    30,
                    0,
                    0,
                    true,
                    DataChangeCallback::new(move |items| {
                        for item in items.iter() {
                            let node_id = item.item_to_monitor().node_id.clone();
                            let value = item.last_value().clone();
                            let _ = tx.send((node_id, value));
                        }
                    }),
                )
                .map_err(|s| format!("create_subscription failed: {s:?}"))?;
            let requests: Vec<MonitoredItemCreateRequest> =
                node_ids.into_iter().map(|node| node.into()).collect();
            s.create_monitored_items(subscription_id, TimestampsToReturn::Both, &requests)
                .map_err(|s| format!("create_monitored_items failed: {s:?}"))?;
            Ok(subscription_id)
        })
        .await
        .map_err(|e| ProtocolError::Fatal(format!("subscribe task panicked: {e}")))?
        .map_err(ProtocolError::SubscriptionLost)?;

        // Drive the publish loop on its own thread until stop or loss.
        let run_session = session.clone();
        let stop_tx = tokio::task::spawn_blocking(move || Session::run_async(run_session))
            .await
            .map_err(|e| ProtocolError::Fatal(format!("session runner panicked: {e}")))?;

        let mut liveness = tokio::time::interval(LIVENESS_INTERVAL);
        let outcome = loop {
            tokio::select! {
                _ = wait_for_stop(&mut stop) => break Ok(()),
                notification = rx.recv() => match notification {
                    Some((node_id, data_value)) => {
                        let path = paths
                            .get(&node_id)
                            .cloned()
                            .unwrap_or_else(|| node_id.to_string());
                        let record = self.record_from(&path, &node_id, &data_value);
                        if !ingress.emit(record).await {
                            break Ok(());
                        }
                    }
                    None => break Err(ProtocolError::SubscriptionLost(
                        "notification channel closed".to_string(),
                    )),
                },
                _ = liveness.tick() => {
                    if !session.read().is_connected() {
                        break Err(ProtocolError::SubscriptionLost(
                            "server connection lost".to_string(),
                        ));
                    }
                }
            }
        };

        let _ = stop_tx.send(SessionCommand::Stop);
        outcome
    }

    async fn disconnect(&mut self) {
        self.client = None;
        if let Some(session) = self.session.take() {
            let _ = tokio::task::spawn_blocking(move || {
                session.write().disconnect();
            })
            .await;
        }
    }

    async fn test_connection(&mut self) -> TestReport {
        let started = Instant::now();
        let mut server_info = BTreeMap::new();

        let result = async {
            self.connect().await?;
            let session = self
                .session
                .clone()
                .ok_or_else(|| ProtocolError::Fatal("no session after connect".into()))?;

            let reads = tokio::task::spawn_blocking(move || -> Result<Vec<DataValue>, String> {
                let s = session.read();
                let nodes = vec![
                    ReadValueId::from(NodeId::from(&VariableId::Server_NamespaceArray)),
                    ReadValueId::from(NodeId::from(&VariableId::Server_ServerStatus_State)),
                ];
                s.read(&nodes, TimestampsToReturn::Neither, 0.0)
                    .map_err(|status| format!("{status:?}"))
            })
            .await
            .map_err(|e| ProtocolError::Fatal(format!("read task panicked: {e}")))?
            .map_err(ProtocolError::SubscriptionLost)?;

            // Best-effort identity: whatever the server let us read.
            if let Some(namespaces) = reads.first().and_then(|dv| dv.value.as_ref()) {
                server_info.insert("namespace_array".to_string(), format!("{namespaces:?}"));
            }
            if let Some(state) = reads.get(1).and_then(|dv| dv.value.as_ref()) {
                server_info.insert("server_state".to_string(), format!("{state:?}"));
            }
            Ok::<(), ProtocolError>(())
        }
        .await;

        self.disconnect().await;
        TestReport {
            ok: result.is_ok(),
            endpoint: self.endpoint.clone(),
            protocol: ProtocolKind::Opcua,
            duration_ms: started.elapsed().as_millis() as u64,
            server_info,
            error: result.err().map(|e| e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_variants_map_onto_the_value_union() {
        let (value, value_type) = variant_to_value(&Variant::Double(25.3));
        assert_eq!(value, RecordValue::Float(25.3));
        assert_eq!(value_type, "Double");

        let (value, value_type) = variant_to_value(&Variant::Int32(-7));
        assert_eq!(value, RecordValue::Int(-7));
        assert_eq!(value_type, "Int32");

        let (value, value_type) = variant_to_value(&Variant::Boolean(true));
        assert_eq!(value, RecordValue::Bool(true));
        assert_eq!(value_type, "Boolean");

        let (value, value_type) = variant_to_value(&Variant::Empty);
        assert_eq!(value, RecordValue::Null);
        assert_eq!(value_type, "Null");
    }

    #[test]
    fn data_change_maps_to_a_good_record() {
        let client = OpcuaClient::new(
            "plc1".into(),
            "opc.tcp://plc:4840".into(),
            OpcuaSourceOptions::default(),
        );
        let node_id = NodeId::new(2, "T");
        let data_value = DataValue {
            value: Some(Variant::Double(25.3)),
            status: Some(StatusCode::Good),
            ..DataValue::default()
        };
        let record = client.record_from("Objects/T", &node_id, &data_value);

        assert_eq!(record.protocol, ProtocolKind::Opcua);
        assert_eq!(record.value, RecordValue::Float(25.3));
        assert_eq!(record.value_type, "Double");
        assert_eq!(record.value_num, Some(25.3));
        assert_eq!(record.status, Quality::Good);
        assert_eq!(record.status_code, 0);
        assert_eq!(record.metadata.get("namespace").unwrap().as_i64(), Some(2));
        assert_eq!(
            record.metadata.get("node_id").unwrap().as_str(),
            Some("ns=2;s=T")
        );
        // No source timestamp on the wire: ingress wall clock stands in.
        assert!(record.event_time_us > crate::record::MIN_PLAUSIBLE_EVENT_TIME_US);
    }

    #[test]
    fn bad_status_is_normalized() {
        let client = OpcuaClient::new(
            "plc1".into(),
            "opc.tcp://plc:4840".into(),
            OpcuaSourceOptions::default(),
        );
        let node_id = NodeId::new(2, "T");
        let data_value = DataValue {
            value: Some(Variant::Double(0.0)),
            status: Some(StatusCode::BadNodeIdUnknown),
            ..DataValue::default()
        };
        let record = client.record_from("Objects/T", &node_id, &data_value);
        assert_eq!(record.status, Quality::Bad);
        assert_ne!(record.status_code, 0);
    }
}
