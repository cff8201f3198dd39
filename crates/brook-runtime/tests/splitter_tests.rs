//! Splitter integration tests: sequence assignment, per-field fan-out,
//! idempotent redelivery, and dead-lettering of malformed inputs.

mod common;

use brook_core::{FieldType, Value};
use brook_runtime::broker::{Broker, MemoryBroker, StreamRecord};
use brook_runtime::consumer::{run_consumer, StreamConsumer};
use brook_runtime::dlq;
use brook_runtime::model::{DerivedField, InputReport, Model, SplitterSpec};
use brook_runtime::splitter::Splitter;
use common::{post_input, record_msg, record_value, test_consumer_options, wait_for_count};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

fn vehicle_spec() -> SplitterSpec {
    let mut model = Model::new();
    let input = model
        .input(
            InputReport::new("vehicle-report", "vehicle_number")
                .field("vehicle_number", FieldType::Integer)
                .field("lat", FieldType::Float)
                .field("lon", FieldType::Float),
        )
        .unwrap();
    // A history consumer makes lat an observed field.
    let lat = input.field("lat").unwrap();
    model
        .derived(
            DerivedField::new("echo", FieldType::Float)
                .current("lat", lat.clone())
                .history("lat_history", lat, 2),
            |ctx| async move { ctx.value("lat").cloned() },
        )
        .unwrap();
    model.compile().unwrap().splitters.remove(0)
}

fn splitter(broker: Arc<MemoryBroker>) -> Splitter {
    Splitter::new(vehicle_spec(), broker, ':', Duration::from_secs(60))
}

async fn run_split_workers(broker: Arc<MemoryBroker>, shutdown: watch::Receiver<bool>) {
    let consumer: Arc<dyn StreamConsumer> = Arc::new(splitter(broker.clone()));
    for _ in 0..2 {
        tokio::spawn(run_consumer(
            broker.clone(),
            consumer.clone(),
            test_consumer_options(),
            shutdown.clone(),
        ));
    }
}

#[tokio::test]
async fn test_fan_out_assigns_gapless_per_source_sequences() {
    let broker = Arc::new(MemoryBroker::new());
    let (tx, rx) = watch::channel(false);
    run_split_workers(broker.clone(), rx).await;

    for i in 0..3 {
        post_input(
            broker.as_ref(),
            "vehicle-report",
            &[
                ("vehicle_number", Value::Int(1)),
                ("lat", Value::Float(f64::from(i))),
                ("lon", Value::Float(0.0)),
            ],
        )
        .await;
    }
    post_input(
        broker.as_ref(),
        "vehicle-report",
        &[
            ("vehicle_number", Value::Int(2)),
            ("lat", Value::Float(9.0)),
            ("lon", Value::Float(9.0)),
        ],
    )
    .await;

    let lat_records = wait_for_count(broker.as_ref(), "vehicle-report:lat", 4).await;
    wait_for_count(broker.as_ref(), "vehicle-report:lon", 4).await;
    wait_for_count(broker.as_ref(), "vehicle-report:_id", 4).await;

    // Per-source sequences are a gap-free prefix of the positive integers.
    let mut v1_seqs: Vec<u64> = lat_records
        .iter()
        .map(|r| record_msg(r))
        .filter(|m| m.starts_with("1:"))
        .map(|m| m.rsplit(':').next().unwrap().parse().unwrap())
        .collect();
    v1_seqs.sort();
    assert_eq!(v1_seqs, vec![1, 2, 3]);

    let v2_msgs: Vec<String> = lat_records
        .iter()
        .map(record_msg)
        .filter(|m| m.starts_with("2:"))
        .collect();
    assert_eq!(v2_msgs, vec!["2:1".to_string()]);

    tx.send(true).unwrap();
}

#[tokio::test]
async fn test_redelivery_keeps_message_id_and_counter() {
    let broker = Arc::new(MemoryBroker::new());
    let splitter = splitter(broker.clone());

    let record = StreamRecord {
        stream: "vehicle-report".to_string(),
        id: "7-0".to_string(),
        fields: vec![
            ("vehicle_number".to_string(), "5".to_string()),
            ("lat".to_string(), "1.5".to_string()),
            ("lon".to_string(), "2.5".to_string()),
        ],
    };
    splitter.handle(&record).await.unwrap();
    // Crash-between-fanout-and-ack: the same entry is delivered again.
    splitter.handle(&record).await.unwrap();

    let lat_records = broker.range("vehicle-report:lat").await.unwrap();
    assert_eq!(lat_records.len(), 2, "fan-out repeats on redelivery");
    assert_eq!(record_msg(&lat_records[0]), "5:1");
    assert_eq!(record_msg(&lat_records[1]), "5:1", "same message id");

    // The counter advanced exactly once.
    assert_eq!(
        broker.kv_get("counter:5:vehicle-report").await.unwrap(),
        Some("1".to_string())
    );

    // The observed field's history was pushed exactly once.
    let hist = broker.list_range("hist:5:vehicle-report:lat").await.unwrap();
    assert_eq!(hist.len(), 1);
}

#[tokio::test]
async fn test_history_pushed_for_observed_fields_only() {
    let broker = Arc::new(MemoryBroker::new());
    let splitter = splitter(broker.clone());

    let record = StreamRecord {
        stream: "vehicle-report".to_string(),
        id: "1-0".to_string(),
        fields: vec![
            ("vehicle_number".to_string(), "3".to_string()),
            ("lat".to_string(), "1.0".to_string()),
            ("lon".to_string(), "2.0".to_string()),
        ],
    };
    splitter.handle(&record).await.unwrap();

    assert_eq!(
        broker
            .list_range("hist:3:vehicle-report:lat")
            .await
            .unwrap()
            .len(),
        1
    );
    // lon has no history consumer: no ring buffer.
    assert!(broker
        .list_range("hist:3:vehicle-report:lon")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_malformed_input_goes_to_dlq() {
    let broker = Arc::new(MemoryBroker::new());
    let splitter = splitter(broker.clone());

    // Missing lon entirely, and lat is not valid JSON.
    let record = StreamRecord {
        stream: "vehicle-report".to_string(),
        id: "1-0".to_string(),
        fields: vec![
            ("vehicle_number".to_string(), "5".to_string()),
            ("lat".to_string(), "not json".to_string()),
        ],
    };
    splitter.handle(&record).await.unwrap();

    assert_eq!(dlq::len(broker.as_ref(), "vehicle-report").await.unwrap(), 1);
    assert!(broker.range("vehicle-report:lat").await.unwrap().is_empty());

    // A source id containing the separator is rejected too.
    let record = StreamRecord {
        stream: "vehicle-report".to_string(),
        id: "2-0".to_string(),
        fields: vec![
            ("vehicle_number".to_string(), "\"a:b\"".to_string()),
            ("lat".to_string(), "1.0".to_string()),
            ("lon".to_string(), "2.0".to_string()),
        ],
    };
    splitter.handle(&record).await.unwrap();
    assert_eq!(dlq::len(broker.as_ref(), "vehicle-report").await.unwrap(), 2);
}

#[tokio::test]
async fn test_identity_stream_carries_source_and_seq() {
    let broker = Arc::new(MemoryBroker::new());
    let splitter = splitter(broker.clone());

    let record = StreamRecord {
        stream: "vehicle-report".to_string(),
        id: "1-0".to_string(),
        fields: vec![
            ("vehicle_number".to_string(), "8".to_string()),
            ("lat".to_string(), "0.0".to_string()),
            ("lon".to_string(), "0.0".to_string()),
        ],
    };
    splitter.handle(&record).await.unwrap();

    let ids = broker.range("vehicle-report:_id").await.unwrap();
    assert_eq!(ids.len(), 1);
    assert_eq!(record_msg(&ids[0]), "8:1");
    assert_eq!(record_value(&ids[0], "_id"), Value::Str("8".to_string()));
    assert_eq!(record_value(&ids[0], "seq"), Value::Int(1));
}
