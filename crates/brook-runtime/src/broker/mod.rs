//! Broker adapter
//!
//! A thin contract over an append-only stream bus with consumer groups and
//! a key/value space. [`RedisBroker`] is the production implementation;
//! [`MemoryBroker`] implements the same contract in-process for tests.
//!
//! Messages left unacknowledged by a crashed worker are re-delivered to
//! another consumer of the same group via [`Broker::claim_stale`].

mod memory;
mod redis;

pub use self::memory::MemoryBroker;
pub use self::redis::RedisBroker;

use async_trait::async_trait;
use rand::Rng;
use std::time::Duration;
use tokio::sync::mpsc;

/// Identifier of a stream entry, as assigned by the broker.
pub type EntryId = String;

/// One entry read from a stream.
#[derive(Debug, Clone)]
pub struct StreamRecord {
    pub stream: String,
    pub id: EntryId,
    pub fields: Vec<(String, String)>,
}

/// Errors surfaced by broker operations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Failed to reach the broker; retried with backoff by consumers.
    #[error("broker connection failed: {0}")]
    Connection(String),

    /// The broker rejected or failed a command.
    #[error("broker command failed: {0}")]
    Command(String),
}

/// Contract over the stream bus and KV space.
///
/// All mutating KV operations used concurrently are atomic on the broker
/// side: counters via `incr_with_marker`, join state via
/// `hash_set_arrived`, history via `list_push_trim`.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Append an entry to a stream, creating the stream if needed.
    async fn append(&self, stream: &str, fields: &[(String, String)])
        -> Result<EntryId, BrokerError>;

    /// All entries of a stream, oldest first.
    async fn range(&self, stream: &str) -> Result<Vec<StreamRecord>, BrokerError>;

    /// The most recent entry of a stream, if any.
    async fn last_entry(&self, stream: &str) -> Result<Option<StreamRecord>, BrokerError>;

    /// Create a consumer group reading new entries. Idempotent.
    async fn create_group(&self, stream: &str, group: &str) -> Result<(), BrokerError>;

    /// Read up to `count` new entries across `streams` for one consumer of
    /// `group`, blocking up to `block` when nothing is available.
    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamRecord>, BrokerError>;

    /// Acknowledge one entry for `group`.
    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), BrokerError>;

    /// Take over entries that have been pending for at least `min_idle`
    /// (delivered to a consumer that never acked them).
    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamRecord>, BrokerError>;

    async fn kv_get(&self, key: &str) -> Result<Option<String>, BrokerError>;

    async fn kv_set(&self, key: &str, value: &str) -> Result<(), BrokerError>;

    /// Set `key` only if absent; returns whether this call set it.
    async fn kv_set_nx(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, BrokerError>;

    /// Delete a key of any kind (scalar, hash, or list).
    async fn kv_delete(&self, key: &str) -> Result<(), BrokerError>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), BrokerError>;

    /// Keys starting with `prefix`.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, BrokerError>;

    /// Idempotent sequence claim: if `marker_key` exists, return its
    /// recorded value and `false`; otherwise increment `counter_key`,
    /// record the result under `marker_key` (with `ttl`), and return it
    /// with `true`. Atomic.
    async fn incr_with_marker(
        &self,
        counter_key: &str,
        marker_key: &str,
        ttl: Duration,
    ) -> Result<(u64, bool), BrokerError>;

    /// Set one field of a hash and return the hash's cardinality after the
    /// write. Atomic, so exactly one writer observes each cardinality.
    async fn hash_set_arrived(
        &self,
        key: &str,
        field: &str,
        value: &str,
    ) -> Result<u64, BrokerError>;

    async fn hash_get_all(&self, key: &str) -> Result<Vec<(String, String)>, BrokerError>;

    /// Push to the head of a list and trim it to `cap` entries, atomically.
    async fn list_push_trim(&self, key: &str, value: &str, cap: usize)
        -> Result<(), BrokerError>;

    /// All entries of a list, head (newest) first.
    async fn list_range(&self, key: &str) -> Result<Vec<String>, BrokerError>;

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BrokerError>;

    /// Subscribe to a channel; messages arrive on the returned receiver
    /// until it is dropped.
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>, BrokerError>;
}

/// Exponential backoff with jitter for transient broker failures.
#[derive(Debug)]
pub struct Backoff {
    attempt: u32,
    base: Duration,
    cap: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            attempt: 0,
            base,
            cap,
        }
    }

    /// Delay before the next retry: `base * 2^attempt`, capped, with up to
    /// 25% random jitter so restarting workers do not reconnect in step.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self
            .base
            .saturating_mul(1u32 << self.attempt.min(16))
            .min(self.cap);
        self.attempt = self.attempt.saturating_add(1);
        let jitter = rand::thread_rng().gen_range(0.0..0.25);
        exp.mul_f64(1.0 + jitter)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut b = Backoff::new(Duration::from_millis(100), Duration::from_secs(1));
        let d1 = b.next_delay();
        let d2 = b.next_delay();
        let d3 = b.next_delay();
        assert!(d1 >= Duration::from_millis(100));
        assert!(d2 >= Duration::from_millis(200));
        assert!(d3 >= Duration::from_millis(400));
        for _ in 0..10 {
            assert!(b.next_delay() <= Duration::from_millis(1250));
        }
    }

    #[test]
    fn test_backoff_reset() {
        let mut b = Backoff::default();
        b.next_delay();
        b.next_delay();
        b.reset();
        assert!(b.next_delay() < Duration::from_millis(130));
    }
}
