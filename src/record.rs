//! The canonical telemetry record and its mapping to the sink wire format.
//!
//! Every protocol client normalizes its native datum into a
//! [`CanonicalRecord`] at ingress; the egress worker maps it into a
//! [`WireRecord`] just before submission. Timestamps are microseconds since
//! the Unix epoch end-to-end — the sink interprets lesser units as dates in
//! 1970, so the wire mapping rejects anything that looks mis-scaled.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Oldest event time the wire mapping accepts, in µs (roughly year 2001).
/// Anything below this is almost certainly milliseconds fed as microseconds.
pub const MIN_PLAUSIBLE_EVENT_TIME_US: i64 = 1_000_000_000_000_000;

/// Which protocol produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    Opcua,
    Mqtt,
    Modbus,
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Opcua => "opcua",
            Self::Mqtt => "mqtt",
            Self::Modbus => "modbus",
        };
        f.write_str(s)
    }
}

/// Normalized quality of a datum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Good,
    Bad,
    Uncertain,
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Good => "good",
            Self::Bad => "bad",
            Self::Uncertain => "uncertain",
        };
        f.write_str(s)
    }
}

/// The tagged value union carried by a record.
///
/// Adjacently tagged so spool round-trips are exact (an untagged `25.0`
/// would come back as an integer).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "lowercase")]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Null,
}

impl Value {
    /// Default variant name, used when the protocol supplies no richer type.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Bool(_) => "Bool",
            Self::Int(_) => "Int64",
            Self::Float(_) => "Float64",
            Self::Text(_) => "String",
            Self::Bytes(_) => "Bytes",
            Self::Null => "Null",
        }
    }

    /// Numeric projection, when one is well-defined.
    pub fn as_num(&self) -> Option<f64> {
        match self {
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            Self::Text(s) => s.trim().parse::<f64>().ok(),
            Self::Bytes(_) | Self::Null => None,
        }
    }

    /// String rendering used by the wire format's `value` column.
    pub fn render(&self) -> String {
        match self {
            Self::Bool(b) => b.to_string(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Text(s) => s.clone(),
            Self::Bytes(b) => b.iter().map(|x| format!("{x:02x}")).collect(),
            Self::Null => String::new(),
        }
    }
}

/// Scalar metadata attached by protocol clients (qos, register type, …).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl MetaValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl From<&str> for MetaValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<i64> for MetaValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<f64> for MetaValue {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<bool> for MetaValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

/// One telemetry datum, normalized, as it flows through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    /// Source-attributed event time in µs, or ingress wall clock.
    pub event_time_us: i64,
    /// Wall clock at buffer entry, in µs. Stamped by the buffer.
    pub ingest_time_us: i64,
    pub source_name: String,
    pub endpoint: String,
    pub protocol: ProtocolKind,
    /// Browse path, topic or register address, protocol-specific.
    pub topic_or_path: String,
    pub value: Value,
    /// Name of the value variant actually present, protocol-flavored
    /// (e.g. the OPC-UA variant name "Double").
    pub value_type: String,
    pub value_num: Option<f64>,
    /// Protocol-native quality code.
    pub status_code: u32,
    pub status: Quality,
    #[serde(default)]
    pub metadata: BTreeMap<String, MetaValue>,
}

impl CanonicalRecord {
    /// Start a record with the fields every protocol client knows up front.
    /// `ingest_time_us` stays zero until the buffer stamps it.
    pub fn new(
        source_name: impl Into<String>,
        endpoint: impl Into<String>,
        protocol: ProtocolKind,
        topic_or_path: impl Into<String>,
        event_time_us: i64,
        value: Value,
    ) -> Self {
        let value_type = value.kind().to_string();
        let value_num = value.as_num();
        Self {
            event_time_us,
            ingest_time_us: 0,
            source_name: source_name.into(),
            endpoint: endpoint.into(),
            protocol,
            topic_or_path: topic_or_path.into(),
            value,
            value_type,
            value_num,
            status_code: 0,
            status: Quality::Good,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_status(mut self, status: Quality, status_code: u32) -> Self {
        self.status = status;
        self.status_code = status_code;
        self
    }

    pub fn with_value_type(mut self, value_type: impl Into<String>) -> Self {
        self.value_type = value_type.into();
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<MetaValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// A wire-mapping rejection. These records go to the DLQ, not the sink.
#[derive(Debug, Error)]
pub enum MapError {
    #[error("event_time {0} µs predates 2001; likely milliseconds fed as microseconds")]
    MisscaledTimestamp(i64),
}

/// The JSON row shape the sink table expects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireRecord {
    pub event_time: i64,
    pub ingest_time: i64,
    pub source_name: String,
    pub endpoint: String,
    pub namespace: i32,
    pub node_id: String,
    pub browse_path: String,
    pub status_code: u32,
    pub status: String,
    pub value_type: String,
    pub value: String,
    pub value_num: Option<f64>,
    pub raw: Option<Vec<u8>>,
    pub plc_name: String,
    pub plc_vendor: String,
    pub plc_model: String,
}

/// Map a canonical record to the sink row.
///
/// `namespace` / `node_id` come from OPC-UA metadata when present; other
/// protocols leave them at their zero values. `plc_*` columns are filled
/// from metadata when a normalizer provided them.
pub fn to_wire(rec: &CanonicalRecord) -> Result<WireRecord, MapError> {
    if rec.event_time_us < MIN_PLAUSIBLE_EVENT_TIME_US {
        return Err(MapError::MisscaledTimestamp(rec.event_time_us));
    }

    let meta_str = |key: &str| -> String {
        rec.metadata
            .get(key)
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default()
    };

    let namespace = rec
        .metadata
        .get("namespace")
        .and_then(MetaValue::as_i64)
        .unwrap_or(0) as i32;

    let raw = match &rec.value {
        Value::Bytes(b) => Some(b.clone()),
        _ => None,
    };

    Ok(WireRecord {
        event_time: rec.event_time_us,
        ingest_time: rec.ingest_time_us,
        source_name: rec.source_name.clone(),
        endpoint: rec.endpoint.clone(),
        namespace,
        node_id: meta_str("node_id"),
        browse_path: rec.topic_or_path.clone(),
        status_code: rec.status_code,
        status: rec.status.to_string(),
        value_type: rec.value_type.clone(),
        value: rec.value.render(),
        value_num: rec.value_num,
        raw,
        plc_name: meta_str("plc_name"),
        plc_vendor: meta_str("plc_vendor"),
        plc_model: meta_str("plc_model"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(event_time_us: i64) -> CanonicalRecord {
        CanonicalRecord::new(
            "line1",
            "opc.tcp://plc:4840",
            ProtocolKind::Opcua,
            "ns=2;s=Temp",
            event_time_us,
            Value::Float(25.3),
        )
        .with_value_type("Double")
        .with_meta("namespace", 2i64)
        .with_meta("node_id", "ns=2;s=Temp")
    }

    #[test]
    fn wire_mapping_carries_the_core_columns() {
        let rec = sample(1_700_000_000_000_000);
        let wire = to_wire(&rec).unwrap();
        assert_eq!(wire.event_time, 1_700_000_000_000_000);
        assert_eq!(wire.browse_path, "ns=2;s=Temp");
        assert_eq!(wire.namespace, 2);
        assert_eq!(wire.node_id, "ns=2;s=Temp");
        assert_eq!(wire.value, "25.3");
        assert_eq!(wire.value_num, Some(25.3));
        assert_eq!(wire.value_type, "Double");
        assert_eq!(wire.status, "good");
        assert!(wire.raw.is_none());
    }

    #[test]
    fn wire_mapping_rejects_millisecond_scaled_times() {
        // A current timestamp in ms reads as 1970 in µs.
        let rec = sample(1_700_000_000_000);
        let err = to_wire(&rec).unwrap_err();
        assert!(matches!(err, MapError::MisscaledTimestamp(_)));
    }

    #[test]
    fn bytes_value_lands_in_raw() {
        let mut rec = sample(1_700_000_000_000_000);
        rec.value = Value::Bytes(vec![0xde, 0xad]);
        rec.value_num = None;
        let wire = to_wire(&rec).unwrap();
        assert_eq!(wire.raw, Some(vec![0xde, 0xad]));
        assert_eq!(wire.value, "dead");
    }

    #[test]
    fn value_round_trips_through_json_exactly() {
        for v in [
            Value::Bool(true),
            Value::Int(25),
            Value::Float(25.0),
            Value::Text("25".into()),
            Value::Bytes(vec![1, 2, 3]),
            Value::Null,
        ] {
            let json = serde_json::to_string(&v).unwrap();
            let back: Value = serde_json::from_str(&json).unwrap();
            assert_eq!(back, v, "round-trip of {json}");
        }
    }

    #[test]
    fn numeric_projection() {
        assert_eq!(Value::Bool(true).as_num(), Some(1.0));
        assert_eq!(Value::Int(-3).as_num(), Some(-3.0));
        assert_eq!(Value::Float(2.5).as_num(), Some(2.5));
        assert_eq!(Value::Text(" 7.25 ".into()).as_num(), Some(7.25));
        assert_eq!(Value::Text("n/a".into()).as_num(), None);
        assert_eq!(Value::Bytes(vec![1]).as_num(), None);
        assert_eq!(Value::Null.as_num(), None);
    }

    #[test]
    fn record_round_trips_through_json() {
        let rec = sample(1_700_000_000_000_000)
            .with_status(Quality::Uncertain, 0x40000000)
            .with_meta("qos", 1i64);
        let json = serde_json::to_string(&rec).unwrap();
        let back: CanonicalRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rec);
    }

    #[test]
    fn protocol_kind_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&ProtocolKind::Opcua).unwrap(), "\"opcua\"");
        assert_eq!(ProtocolKind::Modbus.to_string(), "modbus");
    }
}
