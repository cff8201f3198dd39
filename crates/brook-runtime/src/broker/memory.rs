//! In-memory broker
//!
//! A complete in-process implementation of the [`Broker`] contract:
//! streams with consumer groups and pending-entry redelivery, a KV space
//! with lazy key expiry, capped lists, and pub/sub. Used by the test
//! suite and useful for local single-process runs without a Redis server.

use super::{Broker, BrokerError, EntryId, StreamRecord};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex, Notify};

#[derive(Default)]
struct StreamState {
    entries: Vec<(EntryId, Vec<(String, String)>)>,
    next_seq: u64,
    groups: HashMap<String, GroupState>,
}

#[derive(Default)]
struct GroupState {
    /// Index of the next entry not yet delivered to any consumer.
    cursor: usize,
    pending: HashMap<EntryId, PendingEntry>,
}

struct PendingEntry {
    index: usize,
    #[allow(dead_code)]
    consumer: String,
    delivered_at: Instant,
}

#[derive(Default)]
struct Inner {
    streams: HashMap<String, StreamState>,
    kv: HashMap<String, String>,
    hashes: HashMap<String, Vec<(String, String)>>,
    lists: HashMap<String, Vec<String>>,
    /// Expiry deadlines for keys with a TTL, enforced lazily on access.
    expiries: HashMap<String, Instant>,
    subscribers: HashMap<String, Vec<mpsc::Sender<String>>>,
}

impl Inner {
    fn key_exists(&self, key: &str) -> bool {
        self.kv.contains_key(key) || self.hashes.contains_key(key) || self.lists.contains_key(key)
    }

    /// Drop `key` in every keyspace when its deadline has passed.
    fn purge_if_expired(&mut self, key: &str) {
        if self
            .expiries
            .get(key)
            .is_some_and(|deadline| Instant::now() >= *deadline)
        {
            self.kv.remove(key);
            self.hashes.remove(key);
            self.lists.remove(key);
            self.expiries.remove(key);
        }
    }
}

/// In-memory [`Broker`]. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Mutex<Inner>>,
    appended: Arc<Notify>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries in a stream. Test helper.
    pub async fn stream_len(&self, stream: &str) -> usize {
        let inner = self.inner.lock().await;
        inner.streams.get(stream).map_or(0, |s| s.entries.len())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn append(
        &self,
        stream: &str,
        fields: &[(String, String)],
    ) -> Result<EntryId, BrokerError> {
        let mut inner = self.inner.lock().await;
        let state = inner.streams.entry(stream.to_string()).or_default();
        state.next_seq += 1;
        let id = format!("{}-0", state.next_seq);
        state.entries.push((id.clone(), fields.to_vec()));
        drop(inner);
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn range(&self, stream: &str) -> Result<Vec<StreamRecord>, BrokerError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .streams
            .get(stream)
            .map(|s| {
                s.entries
                    .iter()
                    .map(|(id, fields)| StreamRecord {
                        stream: stream.to_string(),
                        id: id.clone(),
                        fields: fields.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn last_entry(&self, stream: &str) -> Result<Option<StreamRecord>, BrokerError> {
        let inner = self.inner.lock().await;
        Ok(inner.streams.get(stream).and_then(|s| {
            s.entries.last().map(|(id, fields)| StreamRecord {
                stream: stream.to_string(),
                id: id.clone(),
                fields: fields.clone(),
            })
        }))
    }

    async fn create_group(&self, stream: &str, group: &str) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().await;
        let state = inner.streams.entry(stream.to_string()).or_default();
        state.groups.entry(group.to_string()).or_default();
        Ok(())
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamRecord>, BrokerError> {
        let deadline = Instant::now() + block;
        loop {
            let notified = self.appended.notified();
            {
                let mut inner = self.inner.lock().await;
                let mut out = Vec::new();
                for stream in streams {
                    if out.len() >= count {
                        break;
                    }
                    let Some(state) = inner.streams.get_mut(stream) else {
                        continue;
                    };
                    let entries = &state.entries;
                    let Some(group_state) = state.groups.get_mut(group) else {
                        continue;
                    };
                    while group_state.cursor < entries.len() && out.len() < count {
                        let index = group_state.cursor;
                        let (id, fields) = &entries[index];
                        group_state.pending.insert(
                            id.clone(),
                            PendingEntry {
                                index,
                                consumer: consumer.to_string(),
                                delivered_at: Instant::now(),
                            },
                        );
                        out.push(StreamRecord {
                            stream: stream.clone(),
                            id: id.clone(),
                            fields: fields.clone(),
                        });
                        group_state.cursor += 1;
                    }
                }
                if !out.is_empty() {
                    return Ok(out);
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Vec::new());
            }
            let _ = tokio::time::timeout(remaining, notified).await;
        }
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().await;
        if let Some(state) = inner.streams.get_mut(stream) {
            if let Some(group_state) = state.groups.get_mut(group) {
                group_state.pending.remove(id);
            }
        }
        Ok(())
    }

    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamRecord>, BrokerError> {
        let mut inner = self.inner.lock().await;
        let Some(state) = inner.streams.get_mut(stream) else {
            return Ok(Vec::new());
        };
        let Some(group_state) = state.groups.get_mut(group) else {
            return Ok(Vec::new());
        };
        let now = Instant::now();
        let mut out = Vec::new();
        for (id, pending) in group_state.pending.iter_mut() {
            if out.len() >= count {
                break;
            }
            if now.duration_since(pending.delivered_at) >= min_idle {
                pending.consumer = consumer.to_string();
                pending.delivered_at = now;
                let (_, fields) = &state.entries[pending.index];
                out.push(StreamRecord {
                    stream: stream.to_string(),
                    id: id.clone(),
                    fields: fields.clone(),
                });
            }
        }
        Ok(out)
    }

    async fn kv_get(&self, key: &str) -> Result<Option<String>, BrokerError> {
        let mut inner = self.inner.lock().await;
        inner.purge_if_expired(key);
        Ok(inner.kv.get(key).cloned())
    }

    async fn kv_set(&self, key: &str, value: &str) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().await;
        inner.expiries.remove(key);
        inner.kv.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn kv_set_nx(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, BrokerError> {
        let mut inner = self.inner.lock().await;
        inner.purge_if_expired(key);
        if inner.kv.contains_key(key) {
            return Ok(false);
        }
        inner.kv.insert(key.to_string(), value.to_string());
        inner.expiries.insert(key.to_string(), Instant::now() + ttl);
        Ok(true)
    }

    async fn kv_delete(&self, key: &str) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().await;
        inner.kv.remove(key);
        inner.hashes.remove(key);
        inner.lists.remove(key);
        inner.expiries.remove(key);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().await;
        inner.purge_if_expired(key);
        if inner.key_exists(key) {
            inner.expiries.insert(key.to_string(), Instant::now() + ttl);
        }
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, BrokerError> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        let expired: Vec<String> = inner
            .expiries
            .iter()
            .filter(|(_, deadline)| now >= **deadline)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            inner.purge_if_expired(key);
        }
        let mut keys: Vec<String> = inner
            .kv
            .keys()
            .chain(inner.hashes.keys())
            .chain(inner.lists.keys())
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn incr_with_marker(
        &self,
        counter_key: &str,
        marker_key: &str,
        ttl: Duration,
    ) -> Result<(u64, bool), BrokerError> {
        let mut inner = self.inner.lock().await;
        inner.purge_if_expired(marker_key);
        if let Some(existing) = inner.kv.get(marker_key) {
            let seq = existing
                .parse()
                .map_err(|_| BrokerError::Command(format!("bad marker value '{existing}'")))?;
            return Ok((seq, false));
        }
        let counter = inner
            .kv
            .get(counter_key)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        let seq = counter + 1;
        inner.kv.insert(counter_key.to_string(), seq.to_string());
        inner.kv.insert(marker_key.to_string(), seq.to_string());
        inner
            .expiries
            .insert(marker_key.to_string(), Instant::now() + ttl);
        Ok((seq, true))
    }

    async fn hash_set_arrived(
        &self,
        key: &str,
        field: &str,
        value: &str,
    ) -> Result<u64, BrokerError> {
        let mut inner = self.inner.lock().await;
        inner.purge_if_expired(key);
        let hash = inner.hashes.entry(key.to_string()).or_default();
        match hash.iter_mut().find(|(k, _)| k == field) {
            Some((_, v)) => *v = value.to_string(),
            None => hash.push((field.to_string(), value.to_string())),
        }
        Ok(hash.len() as u64)
    }

    async fn hash_get_all(&self, key: &str) -> Result<Vec<(String, String)>, BrokerError> {
        let mut inner = self.inner.lock().await;
        inner.purge_if_expired(key);
        Ok(inner.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn list_push_trim(
        &self,
        key: &str,
        value: &str,
        cap: usize,
    ) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().await;
        let list = inner.lists.entry(key.to_string()).or_default();
        list.insert(0, value.to_string());
        list.truncate(cap);
        Ok(())
    }

    async fn list_range(&self, key: &str) -> Result<Vec<String>, BrokerError> {
        let mut inner = self.inner.lock().await;
        inner.purge_if_expired(key);
        Ok(inner.lists.get(key).cloned().unwrap_or_default())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().await;
        if let Some(senders) = inner.subscribers.get_mut(channel) {
            senders.retain(|tx| tx.try_send(payload.to_string()).is_ok());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>, BrokerError> {
        let (tx, rx) = mpsc::channel(256);
        let mut inner = self.inner.lock().await;
        inner
            .subscribers
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}
