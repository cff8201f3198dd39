//! Pending-message join state
//!
//! Field generators and dependency resolvers share one join discipline:
//! per-message partial state accumulates in a broker hash under
//! `pending:<consumer>:<message-id>` until every required sub-stream has
//! contributed its value, at which point exactly one worker observes the
//! completing write and takes the message forward.
//!
//! Completion detection relies on the atomic arrived-count returned by
//! [`Broker::hash_set_arrived`]; the publish-once marker covers the
//! remaining redelivery races so downstream sees at most one value per
//! message.

use crate::broker::{Broker, BrokerError};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// Join state handle for one consumer (one generator or resolver group).
pub struct PendingJoin {
    broker: Arc<dyn Broker>,
    consumer: String,
    required: BTreeSet<String>,
    ttl: Duration,
}

/// Partial or complete map of arrived values, keyed by sub-stream name.
pub type ArrivedValues = Vec<(String, String)>;

impl PendingJoin {
    pub fn new(
        broker: Arc<dyn Broker>,
        consumer: &str,
        required: impl IntoIterator<Item = String>,
        ttl: Duration,
    ) -> Self {
        Self {
            broker,
            consumer: consumer.to_string(),
            required: required.into_iter().collect(),
            ttl,
        }
    }

    pub fn required_len(&self) -> usize {
        self.required.len()
    }

    fn key_prefix(&self) -> String {
        format!("pending:{}:", self.consumer)
    }

    fn state_key(&self, msg_id: &str) -> String {
        format!("{}{}", self.key_prefix(), msg_id)
    }

    fn emitted_key(&self, msg_id: &str) -> String {
        format!("emitted:{}:{}", self.consumer, msg_id)
    }

    /// Record the arrival of `stream`'s value for `msg_id`. Returns the
    /// full arrived map when this arrival completed the set, `None` while
    /// fields are still missing.
    pub async fn record_arrival(
        &self,
        msg_id: &str,
        stream: &str,
        encoded_value: &str,
    ) -> Result<Option<ArrivedValues>, BrokerError> {
        let key = self.state_key(msg_id);
        let count = self
            .broker
            .hash_set_arrived(&key, stream, encoded_value)
            .await?;
        // Incomplete joins are garbage-collected after the TTL.
        self.broker.expire(&key, self.ttl).await?;
        if count as usize >= self.required.len() {
            let arrived = self.broker.hash_get_all(&key).await?;
            if self.is_complete(&arrived) {
                return Ok(Some(arrived));
            }
        }
        Ok(None)
    }

    fn is_complete(&self, arrived: &ArrivedValues) -> bool {
        self.required
            .iter()
            .all(|need| arrived.iter().any(|(k, _)| k == need))
    }

    /// Claim the right to publish for `msg_id`. At-least-once delivery can
    /// drive a completed join more than once; only the first claim wins.
    pub async fn try_mark_emitted(&self, msg_id: &str) -> Result<bool, BrokerError> {
        self.broker
            .kv_set_nx(&self.emitted_key(msg_id), "1", self.ttl)
            .await
    }

    /// Drop the partial state for `msg_id`.
    pub async fn delete(&self, msg_id: &str) -> Result<(), BrokerError> {
        self.broker.kv_delete(&self.state_key(msg_id)).await
    }

    /// Messages whose state survived a restart and is already complete.
    /// Inputs are acked as soon as partial state is persisted, so after a
    /// crash these are re-driven from the KV side rather than the streams.
    pub async fn complete_survivors(
        &self,
    ) -> Result<Vec<(String, ArrivedValues)>, BrokerError> {
        let prefix = self.key_prefix();
        let mut out = Vec::new();
        for key in self.broker.scan_prefix(&prefix).await? {
            let Some(msg_id) = key.strip_prefix(&prefix) else {
                continue;
            };
            let arrived = self.broker.hash_get_all(&key).await?;
            if self.is_complete(&arrived) {
                out.push((msg_id.to_string(), arrived));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;

    fn join(broker: Arc<dyn Broker>, streams: &[&str]) -> PendingJoin {
        PendingJoin::new(
            broker,
            "gen-test",
            streams.iter().map(|s| s.to_string()),
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn test_completes_only_when_all_arrived() {
        let broker = Arc::new(MemoryBroker::new());
        let join = join(broker, &["r:lat", "r:lon"]);

        assert!(join
            .record_arrival("V1:1", "r:lat", "1.0")
            .await
            .unwrap()
            .is_none());
        let complete = join
            .record_arrival("V1:1", "r:lon", "2.0")
            .await
            .unwrap()
            .expect("second arrival completes the join");
        assert_eq!(complete.len(), 2);
        assert!(complete.iter().any(|(k, v)| k == "r:lat" && v == "1.0"));
    }

    #[tokio::test]
    async fn test_redelivered_field_does_not_complete() {
        let broker = Arc::new(MemoryBroker::new());
        let join = join(broker, &["r:lat", "r:lon"]);

        assert!(join
            .record_arrival("V1:1", "r:lat", "1.0")
            .await
            .unwrap()
            .is_none());
        assert!(join
            .record_arrival("V1:1", "r:lat", "1.0")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_messages_join_independently() {
        let broker = Arc::new(MemoryBroker::new());
        let join = join(broker, &["r:lat", "r:lon"]);

        join.record_arrival("V1:1", "r:lat", "1.0").await.unwrap();
        assert!(join
            .record_arrival("V1:2", "r:lon", "2.0")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_emitted_marker_single_winner() {
        let broker = Arc::new(MemoryBroker::new());
        let join = join(broker, &["r:lat"]);
        assert!(join.try_mark_emitted("V1:1").await.unwrap());
        assert!(!join.try_mark_emitted("V1:1").await.unwrap());
        assert!(join.try_mark_emitted("V1:2").await.unwrap());
    }

    #[tokio::test]
    async fn test_incomplete_state_is_garbage_collected() {
        // A join that can never complete (its other field was
        // dead-lettered upstream) ages out instead of accumulating.
        let broker = Arc::new(MemoryBroker::new());
        let join = PendingJoin::new(
            broker.clone(),
            "gen-test",
            ["r:lat".to_string(), "r:lon".to_string()],
            Duration::from_millis(30),
        );
        assert!(join
            .record_arrival("V1:1", "r:lat", "1.0")
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            broker.scan_prefix("pending:gen-test:").await.unwrap().len(),
            1
        );

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(broker
            .scan_prefix("pending:gen-test:")
            .await
            .unwrap()
            .is_empty());
        assert!(join.complete_survivors().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_complete_survivors_after_restart() {
        let broker = Arc::new(MemoryBroker::new());
        let join = join(broker.clone(), &["r:lat", "r:lon"]);
        join.record_arrival("V1:1", "r:lat", "1.0").await.unwrap();
        join.record_arrival("V1:1", "r:lon", "2.0").await.unwrap();
        join.record_arrival("V1:2", "r:lat", "3.0").await.unwrap();

        // A fresh handle (as after a worker restart) sees the complete one.
        let fresh = PendingJoin::new(
            broker,
            "gen-test",
            ["r:lat".to_string(), "r:lon".to_string()],
            Duration::from_secs(60),
        );
        let survivors = fresh.complete_survivors().await.unwrap();
        assert_eq!(survivors.len(), 1);
        assert_eq!(survivors[0].0, "V1:1");

        fresh.delete("V1:1").await.unwrap();
        assert!(fresh.complete_survivors().await.unwrap().is_empty());
    }
}
