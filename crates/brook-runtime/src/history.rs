//! History ring buffers
//!
//! Bounded per-(source, field) windows of recent values, stored as capped
//! broker lists under `hist:<source>:<field-stream>`. Entries are tagged
//! with the sequence number that produced them, newest first. Each ring has
//! a single writer: the splitter for source fields, the owning generator
//! for artificial fields.
//!
//! A window read for message seq N returns the k most recent values with
//! seq strictly below N, left-padded with nulls. Tagging entries with seqs
//! is what keeps redelivered pushes idempotent and lets readers exclude
//! their own message's value.

use crate::broker::{Broker, BrokerError};
use brook_core::Value;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// One ring buffer entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(rename = "s")]
    pub seq: u64,
    #[serde(rename = "v")]
    pub value: Value,
}

/// Key of the ring buffer for `field_stream` values of `source`.
pub fn history_key(source: &str, field_stream: &str) -> String {
    format!("hist:{source}:{field_stream}")
}

/// How long a push waits for its predecessor before going ahead anyway.
const PUSH_ORDER_ATTEMPTS: u32 = 50;
const PUSH_ORDER_DELAY: Duration = Duration::from_millis(10);

/// Append `value` for message seq `seq`, unless an entry with that seq (or
/// a later one) is already present: redelivery must not double-push.
/// Returns whether a push happened.
///
/// Pushes for one ring are linearized in seq order: when workers race, a
/// push briefly waits for its predecessor so the ring never ends up with a
/// hole that a later guard check would make permanent. An empty ring
/// accepts any seq (the ring may postdate the source's first messages).
/// If the predecessor never lands (its producer died mid-flight), the
/// push proceeds after a bounded wait rather than stalling the pipeline.
pub async fn push(
    broker: &dyn Broker,
    key: &str,
    seq: u64,
    value: &Value,
    cap: usize,
) -> Result<bool, BrokerError> {
    for attempt in 0..PUSH_ORDER_ATTEMPTS {
        match tail_seq(broker, key).await? {
            Some(tail) if tail >= seq => return Ok(false),
            Some(tail) if tail + 1 < seq && attempt + 1 < PUSH_ORDER_ATTEMPTS => {
                tokio::time::sleep(PUSH_ORDER_DELAY).await;
            }
            _ => break,
        }
    }
    let entry = HistoryEntry {
        seq,
        value: value.clone(),
    };
    let encoded = serde_json::to_string(&entry)
        .map_err(|e| BrokerError::Command(format!("history entry encode: {e}")))?;
    broker.list_push_trim(key, &encoded, cap).await?;
    Ok(true)
}

/// Highest sequence number present in the ring, if any.
async fn tail_seq(broker: &dyn Broker, key: &str) -> Result<Option<u64>, BrokerError> {
    Ok(read_entries(broker, key)
        .await?
        .iter()
        .map(|e| e.seq)
        .max())
}

/// All entries of the ring, newest first. Malformed entries are skipped.
pub async fn read_entries(
    broker: &dyn Broker,
    key: &str,
) -> Result<Vec<HistoryEntry>, BrokerError> {
    let raw = broker.list_range(key).await?;
    let mut entries = Vec::with_capacity(raw.len());
    for item in &raw {
        match serde_json::from_str::<HistoryEntry>(item) {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!("skipping malformed history entry in '{}': {}", key, e),
        }
    }
    Ok(entries)
}

/// Select the window of the `k` most recent values strictly preceding
/// message seq `before_seq`, oldest first, left-padded with nulls.
/// Tolerates unsorted rings and duplicate seqs (both possible under
/// racing redeliveries).
pub fn select_window(entries: &[HistoryEntry], before_seq: u64, k: usize) -> Vec<Value> {
    let mut prior: Vec<&HistoryEntry> =
        entries.iter().filter(|e| e.seq < before_seq).collect();
    prior.sort_by(|a, b| b.seq.cmp(&a.seq));
    prior.dedup_by_key(|e| e.seq);
    prior.truncate(k);
    let mut window = vec![Value::Null; k - prior.len()];
    window.extend(prior.iter().rev().map(|e| e.value.clone()));
    window
}

/// Read the window for message seq `before_seq`, first waiting for the
/// predecessor's push to land (ring tail must reach `before_seq - 1`).
///
/// The wait is bounded: when the predecessor never arrives (its producer
/// crashed mid-flight or dead-lettered), `None` is returned and the caller
/// leaves the message pending for a later re-drive.
pub async fn wait_for_window(
    broker: &dyn Broker,
    key: &str,
    before_seq: u64,
    k: usize,
    attempts: u32,
    retry_delay: Duration,
) -> Result<Option<Vec<Value>>, BrokerError> {
    let expected_prev = before_seq.saturating_sub(1);
    for attempt in 0..attempts.max(1) {
        let entries = read_entries(broker, key).await?;
        let ready = expected_prev == 0
            || entries.iter().map(|e| e.seq).max().unwrap_or(0) >= expected_prev;
        if ready {
            return Ok(Some(select_window(&entries, before_seq, k)));
        }
        if attempt + 1 < attempts {
            tokio::time::sleep(retry_delay).await;
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;

    fn entry(seq: u64, v: f64) -> HistoryEntry {
        HistoryEntry {
            seq,
            value: Value::Float(v),
        }
    }

    #[test]
    fn test_select_window_excludes_own_seq() {
        // Newest first: seqs 3, 2, 1.
        let entries = vec![entry(3, 30.0), entry(2, 20.0), entry(1, 10.0)];
        let window = select_window(&entries, 3, 2);
        assert_eq!(window, vec![Value::Float(10.0), Value::Float(20.0)]);
    }

    #[test]
    fn test_select_window_left_pads_nulls() {
        let entries = vec![entry(1, 10.0)];
        let window = select_window(&entries, 2, 3);
        assert_eq!(
            window,
            vec![Value::Null, Value::Null, Value::Float(10.0)]
        );
    }

    #[test]
    fn test_select_window_first_message_is_all_nulls() {
        let window = select_window(&[], 1, 2);
        assert_eq!(window, vec![Value::Null, Value::Null]);
    }

    #[test]
    fn test_select_window_collapses_duplicate_seqs() {
        let entries = vec![entry(2, 20.0), entry(2, 20.0), entry(1, 10.0)];
        let window = select_window(&entries, 3, 2);
        assert_eq!(window, vec![Value::Float(10.0), Value::Float(20.0)]);
    }

    #[tokio::test]
    async fn test_push_skips_already_pushed_seq() {
        let broker = MemoryBroker::new();
        let key = history_key("V1", "r:lat");
        assert!(push(&broker, &key, 1, &Value::Float(1.0), 4).await.unwrap());
        assert!(!push(&broker, &key, 1, &Value::Float(1.0), 4).await.unwrap());
        assert!(push(&broker, &key, 2, &Value::Float(2.0), 4).await.unwrap());
        let entries = read_entries(&broker, &key).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].seq, 2);
    }

    #[tokio::test]
    async fn test_racing_pushes_land_in_seq_order() {
        let broker = MemoryBroker::new();
        let key = history_key("V1", "r:lat");
        push(&broker, &key, 1, &Value::Int(1), 4).await.unwrap();

        // Seq 3 arrives first; its push waits for seq 2.
        let racer = {
            let broker = broker.clone();
            let key = key.clone();
            tokio::spawn(async move {
                push(&broker, &key, 3, &Value::Int(3), 4).await.unwrap()
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        push(&broker, &key, 2, &Value::Int(2), 4).await.unwrap();
        assert!(racer.await.unwrap());

        let entries = read_entries(&broker, &key).await.unwrap();
        let seqs: Vec<u64> = entries.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn test_ring_is_capped() {
        let broker = MemoryBroker::new();
        let key = history_key("V1", "r:lat");
        for seq in 1..=5 {
            push(&broker, &key, seq, &Value::Int(seq as i64), 2)
                .await
                .unwrap();
        }
        let entries = read_entries(&broker, &key).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].seq, 5);
        assert_eq!(entries[1].seq, 4);
    }

    #[tokio::test]
    async fn test_wait_for_window_blocks_until_predecessor() {
        let broker = MemoryBroker::new();
        let key = history_key("V1", "r:lat");

        // Predecessor missing: bounded wait gives up.
        let window = wait_for_window(&broker, &key, 2, 1, 2, Duration::from_millis(1))
            .await
            .unwrap();
        assert!(window.is_none());

        push(&broker, &key, 1, &Value::Float(9.0), 4).await.unwrap();
        let window = wait_for_window(&broker, &key, 2, 1, 2, Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(window, Some(vec![Value::Float(9.0)]));
    }

    #[tokio::test]
    async fn test_wait_for_window_first_message_is_immediate() {
        let broker = MemoryBroker::new();
        let key = history_key("V1", "r:lat");
        let window = wait_for_window(&broker, &key, 1, 2, 1, Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(window, Some(vec![Value::Null, Value::Null]));
    }
}
