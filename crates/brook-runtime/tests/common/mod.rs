//! Shared helpers for the integration tests. Everything runs against the
//! in-memory broker.

#![allow(dead_code)]

use brook_core::{Value, MSG_ID_FIELD};
use brook_runtime::broker::{Broker, StreamRecord};
use brook_runtime::consumer::ConsumerOptions;
use brook_runtime::encoding::{decode_value, encode_value};
use brook_runtime::generator::GeneratorOptions;
use brook_runtime::worker::EngineConfig;
use std::time::Duration;

/// Append an input record (field values JSON-encoded) to a stream.
pub async fn post_input(broker: &dyn Broker, stream: &str, fields: &[(&str, Value)]) {
    let encoded: Vec<(String, String)> = fields
        .iter()
        .map(|(name, value)| (name.to_string(), encode_value(value)))
        .collect();
    broker.append(stream, &encoded).await.expect("append input");
}

/// Poll a stream until it holds at least `count` entries.
pub async fn wait_for_count(
    broker: &dyn Broker,
    stream: &str,
    count: usize,
) -> Vec<StreamRecord> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let records = broker.range(stream).await.expect("range");
        if records.len() >= count {
            return records;
        }
        if tokio::time::Instant::now() > deadline {
            panic!(
                "timed out waiting for {count} entries on '{stream}', have {}",
                records.len()
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Sleep long enough for in-flight processing to settle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(300)).await;
}

/// Decoded value of a named field of a record.
pub fn record_value(record: &StreamRecord, field: &str) -> Value {
    let raw = record
        .fields
        .iter()
        .find(|(k, _)| k == field)
        .unwrap_or_else(|| panic!("record has no '{field}' field"))
        .1
        .as_str();
    decode_value(field, raw).expect("valid JSON value")
}

/// Decoded message id string of a record.
pub fn record_msg(record: &StreamRecord) -> String {
    match record_value(record, MSG_ID_FIELD) {
        Value::Str(s) => s,
        other => panic!("_msg is not a string: {other:?}"),
    }
}

/// Consumer options tightened for fast tests.
pub fn test_consumer_options() -> ConsumerOptions {
    ConsumerOptions {
        read_batch: 50,
        block: Duration::from_millis(50),
        claim_min_idle: Duration::from_millis(500),
        claim_every: 4,
    }
}

pub fn test_generator_options() -> GeneratorOptions {
    GeneratorOptions {
        max_inflight: 8,
        pending_ttl: Duration::from_secs(60),
        history_wait_attempts: 40,
        history_wait_delay: Duration::from_millis(10),
    }
}

/// Engine config tightened for fast tests.
pub fn test_engine_config() -> EngineConfig {
    EngineConfig {
        default_workers: 2,
        consumer: test_consumer_options(),
        generator: test_generator_options(),
        ..Default::default()
    }
}
