//! Property tests: serialize → encrypt → decrypt → deserialize is the
//! identity on records, for all value shapes.

use proptest::prelude::*;
use zerobridge::buffer::{BufferEntry, SpoolCipher};
use zerobridge::record::{CanonicalRecord, ProtocolKind, Quality, Value};

fn value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Int),
        // Finite floats only: NaN breaks equality, and the pipeline never
        // produces non-finite samples.
        any::<f64>()
            .prop_filter("finite", |f| f.is_finite())
            .prop_map(Value::Float),
        ".{0,64}".prop_map(Value::Text),
        proptest::collection::vec(any::<u8>(), 0..64).prop_map(Value::Bytes),
        Just(Value::Null),
    ]
}

fn quality_strategy() -> impl Strategy<Value = Quality> {
    prop_oneof![Just(Quality::Good), Just(Quality::Bad), Just(Quality::Uncertain)]
}

fn record_strategy() -> impl Strategy<Value = CanonicalRecord> {
    (
        value_strategy(),
        quality_strategy(),
        any::<u32>(),
        1_000_000_000_000_000i64..2_000_000_000_000_000i64,
        "[a-z0-9/_.-]{1,32}",
    )
        .prop_map(|(value, status, status_code, event_time_us, topic)| {
            let mut record = CanonicalRecord::new(
                "prop-source",
                "mqtt://broker:1883",
                ProtocolKind::Mqtt,
                topic,
                event_time_us,
                value,
            )
            .with_status(status, status_code)
            .with_meta("qos", 1i64)
            .with_meta("retain", false);
            record.ingest_time_us = event_time_us + 5;
            record
        })
}

proptest! {
    #[test]
    fn seal_open_is_identity_on_entries(record in record_strategy(), seq in any::<u64>()) {
        let cipher = SpoolCipher::from_key(&[0x42; 32]);
        let entry = BufferEntry { seq, record };

        let plain = serde_json::to_vec(&entry).unwrap();
        let sealed = cipher.seal(&plain).unwrap();
        let opened = cipher.open(&sealed).unwrap();
        let back: BufferEntry = serde_json::from_slice(&opened).unwrap();

        prop_assert_eq!(back, entry);
    }

    #[test]
    fn ciphertext_never_leaks_the_topic(record in record_strategy()) {
        let cipher = SpoolCipher::from_key(&[0x42; 32]);
        let topic = record.topic_or_path.clone();
        prop_assume!(topic.len() >= 8);
        let entry = BufferEntry { seq: 1, record };

        let plain = serde_json::to_vec(&entry).unwrap();
        let sealed = cipher.seal(&plain).unwrap();
        let haystack = &sealed[..];
        let needle = topic.as_bytes();
        let leaked = haystack.windows(needle.len()).any(|w| w == needle);
        prop_assert!(!leaked, "plaintext topic visible in ciphertext");
    }
}
