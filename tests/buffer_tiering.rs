//! Tiering behavior of the backpressure buffer: memory first, spool
//! overflow, FIFO playback, restart recovery.

use zerobridge::buffer::{BackpressureBuffer, Enqueue};
use zerobridge::config::{
    BackpressureConfig, DiskSpoolConfig, DropPolicy, MemoryQueueConfig,
};
use zerobridge::record::{CanonicalRecord, ProtocolKind, Quality, Value};

fn record(n: i64) -> CanonicalRecord {
    CanonicalRecord::new(
        "press-7",
        "mqtt://broker:1883",
        ProtocolKind::Mqtt,
        format!("plant/press7/r{n}"),
        1_700_000_000_000_000 + n,
        Value::Float(n as f64 + 0.5),
    )
}

fn tiered(dir: &std::path::Path, mem: usize, spool_mb: u64) -> BackpressureConfig {
    BackpressureConfig {
        memory_queue: MemoryQueueConfig { max_size: mem, drop_policy: DropPolicy::Newest },
        disk_spool: DiskSpoolConfig {
            enabled: true,
            path: dir.join("spool"),
            max_size_mb: spool_mb,
            encryption: true,
        },
    }
}

#[tokio::test]
async fn overflow_spools_and_plays_back_in_ingress_order() {
    let dir = tempfile::tempdir().unwrap();
    let buffer = BackpressureBuffer::open(tiered(dir.path(), 2, 1)).await.unwrap();

    // R1..R5: two in memory, three spooled.
    let mut outcomes = Vec::new();
    for n in 1..=5 {
        outcomes.push(buffer.enqueue(record(n)).await.unwrap());
    }
    assert_eq!(
        outcomes,
        vec![
            Enqueue::Accepted,
            Enqueue::Accepted,
            Enqueue::Spooled,
            Enqueue::Spooled,
            Enqueue::Spooled
        ]
    );

    let snapshot = buffer.metrics().await;
    assert_eq!(snapshot.mem_depth, 2);
    assert_eq!(snapshot.records_spooled, 3);
    assert!(snapshot.spool_bytes > 0);
    assert!(snapshot.spool_bytes <= snapshot.spool_cap_bytes);

    // Five dequeues return R1..R5 with strictly increasing sequence.
    let mut last_seq = 0;
    for n in 1..=5 {
        let entry = buffer.dequeue().await.expect("record available");
        assert_eq!(entry.record.topic_or_path, format!("plant/press7/r{n}"));
        assert_eq!(entry.record.value, Value::Float(n as f64 + 0.5));
        assert!(entry.seq > last_seq, "seq must increase: {} then {}", last_seq, entry.seq);
        last_seq = entry.seq;
    }
    assert!(buffer.dequeue().await.is_none());
    assert_eq!(buffer.metrics().await.spool_bytes, 0);
}

#[tokio::test]
async fn memory_bound_is_never_exceeded() {
    let dir = tempfile::tempdir().unwrap();
    let buffer = BackpressureBuffer::open(tiered(dir.path(), 3, 1)).await.unwrap();
    for n in 0..50 {
        let _ = buffer.enqueue(record(n)).await.unwrap();
        let snapshot = buffer.metrics().await;
        assert!(snapshot.mem_depth <= 3, "depth {} at n={n}", snapshot.mem_depth);
    }
}

#[tokio::test]
async fn spooled_records_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let buffer = BackpressureBuffer::open(tiered(dir.path(), 1, 1)).await.unwrap();
        for n in 1..=3 {
            buffer.enqueue(record(n)).await.unwrap();
        }
        // r1 is in memory and lost with the process; r2, r3 are on disk.
    }

    let buffer = BackpressureBuffer::open(tiered(dir.path(), 1, 1)).await.unwrap();
    let first = buffer.dequeue().await.expect("recovered record");
    assert_eq!(first.record.topic_or_path, "plant/press7/r2");
    let second = buffer.dequeue().await.expect("recovered record");
    assert_eq!(second.record.topic_or_path, "plant/press7/r3");
    assert!(buffer.dequeue().await.is_none());
}

#[tokio::test]
async fn restart_recovery_preserves_record_contents() {
    let dir = tempfile::tempdir().unwrap();
    let original = record(9)
        .with_status(Quality::Uncertain, 0x40940000)
        .with_meta("qos", 1i64);
    {
        let buffer = BackpressureBuffer::open(tiered(dir.path(), 1, 1)).await.unwrap();
        buffer.enqueue(record(1)).await.unwrap();
        buffer.enqueue(original.clone()).await.unwrap();
    }
    let buffer = BackpressureBuffer::open(tiered(dir.path(), 1, 1)).await.unwrap();
    let recovered = buffer.dequeue().await.unwrap().record;
    assert_eq!(recovered.topic_or_path, original.topic_or_path);
    assert_eq!(recovered.value, original.value);
    assert_eq!(recovered.status, Quality::Uncertain);
    assert_eq!(recovered.status_code, 0x40940000);
    assert_eq!(recovered.metadata, original.metadata);
}

#[tokio::test]
async fn tampered_spool_file_is_quarantined_not_returned() {
    let dir = tempfile::tempdir().unwrap();
    let buffer = BackpressureBuffer::open(tiered(dir.path(), 1, 1)).await.unwrap();
    buffer.enqueue(record(1)).await.unwrap();
    buffer.enqueue(record(2)).await.unwrap();

    // Corrupt the single spool file on disk.
    let spool_dir = dir.path().join("spool");
    let file = std::fs::read_dir(&spool_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .find(|e| e.file_name().to_string_lossy().starts_with("spool_"))
        .expect("spool file present");
    std::fs::write(file.path(), b"corrupted beyond recognition").unwrap();

    // Memory record drains fine; the corrupt one is quarantined.
    assert_eq!(buffer.dequeue().await.unwrap().record.topic_or_path, "plant/press7/r1");
    assert!(buffer.dequeue().await.is_none());

    let snapshot = buffer.metrics().await;
    assert_eq!(snapshot.dlq_count, 1);
    let dlq_entries: Vec<_> = std::fs::read_dir(spool_dir.join("dlq"))
        .unwrap()
        .filter_map(|e| e.ok())
        .collect();
    assert!(!dlq_entries.is_empty());
}
