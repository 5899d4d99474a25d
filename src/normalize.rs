//! Tag-normalization seam.
//!
//! Normalizers are pure functions over canonical records — site-specific
//! tag renames, unit conversions, PLC identity stamping — supplied by an
//! external module. The bridge applies the registered normalizer for a
//! record's protocol at ingress, before the record enters the buffer.

use crate::record::{CanonicalRecord, ProtocolKind};
use std::collections::HashMap;
use std::sync::Arc;

/// A pure mapping from one canonical record to another.
pub trait Normalizer: Send + Sync {
    fn normalize(&self, record: CanonicalRecord) -> CanonicalRecord;
}

/// Pass-through; the default for every protocol.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityNormalizer;

impl Normalizer for IdentityNormalizer {
    fn normalize(&self, record: CanonicalRecord) -> CanonicalRecord {
        record
    }
}

/// Adapter turning a plain function into a [`Normalizer`].
pub struct NormalizerFn<F>(pub F);

impl<F> Normalizer for NormalizerFn<F>
where
    F: Fn(CanonicalRecord) -> CanonicalRecord + Send + Sync,
{
    fn normalize(&self, record: CanonicalRecord) -> CanonicalRecord {
        (self.0)(record)
    }
}

/// Per-protocol normalizer registry held by the bridge.
#[derive(Clone, Default)]
pub struct NormalizerSet {
    by_protocol: HashMap<ProtocolKind, Arc<dyn Normalizer>>,
}

impl std::fmt::Debug for NormalizerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NormalizerSet")
            .field("registered", &self.by_protocol.len())
            .finish()
    }
}

impl NormalizerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, protocol: ProtocolKind, normalizer: Arc<dyn Normalizer>) -> Self {
        self.by_protocol.insert(protocol, normalizer);
        self
    }

    /// Apply the normalizer registered for the record's protocol, if any.
    pub fn apply(&self, record: CanonicalRecord) -> CanonicalRecord {
        match self.by_protocol.get(&record.protocol) {
            Some(normalizer) => normalizer.normalize(record),
            None => record,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.by_protocol.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Value;

    fn record(protocol: ProtocolKind) -> CanonicalRecord {
        CanonicalRecord::new(
            "s1",
            "mqtt://b:1883",
            protocol,
            "raw/topic",
            1_700_000_000_000_000,
            Value::Float(1.0),
        )
    }

    #[test]
    fn identity_changes_nothing() {
        let rec = record(ProtocolKind::Mqtt);
        assert_eq!(IdentityNormalizer.normalize(rec.clone()), rec);
    }

    #[test]
    fn registered_normalizer_applies_only_to_its_protocol() {
        let set = NormalizerSet::new().register(
            ProtocolKind::Mqtt,
            Arc::new(NormalizerFn(|mut rec: CanonicalRecord| {
                rec.topic_or_path = format!("plant-a/{}", rec.topic_or_path);
                rec.metadata.insert("plc_name".into(), "press-7".into());
                rec
            })),
        );

        let mqtt = set.apply(record(ProtocolKind::Mqtt));
        assert_eq!(mqtt.topic_or_path, "plant-a/raw/topic");
        assert_eq!(mqtt.metadata.get("plc_name").unwrap().as_str(), Some("press-7"));

        let modbus = set.apply(record(ProtocolKind::Modbus));
        assert_eq!(modbus.topic_or_path, "raw/topic");
    }

    #[test]
    fn empty_set_is_pass_through() {
        let set = NormalizerSet::new();
        assert!(set.is_empty());
        let rec = record(ProtocolKind::Opcua);
        assert_eq!(set.apply(rec.clone()), rec);
    }
}
