//! Redis broker
//!
//! [`Broker`] implementation over Redis streams, hashes, lists, and
//! pub/sub, using an auto-reconnecting [`ConnectionManager`]. The two
//! compound read-modify-write operations the engine relies on
//! (`incr_with_marker`, `hash_set_arrived`) are Lua scripts, which Redis
//! executes atomically.

use super::{Broker, BrokerError, EntryId, StreamRecord};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamAutoClaimOptions, StreamAutoClaimReply, StreamId, StreamRangeReply, StreamReadOptions,
    StreamReadReply,
};
use redis::AsyncCommands;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

const INCR_WITH_MARKER_LUA: &str = r#"
local existing = redis.call('GET', KEYS[2])
if existing then
  return {tonumber(existing), 0}
end
local seq = redis.call('INCR', KEYS[1])
redis.call('SET', KEYS[2], seq, 'EX', ARGV[1])
return {seq, 1}
"#;

const HASH_SET_ARRIVED_LUA: &str = r#"
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
return redis.call('HLEN', KEYS[1])
"#;

/// Redis-backed [`Broker`].
pub struct RedisBroker {
    client: redis::Client,
    conn: ConnectionManager,
    incr_with_marker: redis::Script,
    hash_set_arrived: redis::Script,
}

impl RedisBroker {
    /// Connect to the broker at `url` (e.g. `redis://localhost`).
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let client = redis::Client::open(url)
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        info!("connected to redis broker at {}", url);
        Ok(Self {
            client,
            conn,
            incr_with_marker: redis::Script::new(INCR_WITH_MARKER_LUA),
            hash_set_arrived: redis::Script::new(HASH_SET_ARRIVED_LUA),
        })
    }

    fn record_from_stream_id(stream: &str, id: &StreamId) -> StreamRecord {
        let mut fields = Vec::with_capacity(id.map.len());
        for (key, value) in &id.map {
            match redis::from_redis_value::<String>(value) {
                Ok(text) => fields.push((key.clone(), text)),
                Err(e) => warn!("non-string field '{}' in stream '{}': {}", key, stream, e),
            }
        }
        StreamRecord {
            stream: stream.to_string(),
            id: id.id.clone(),
            fields,
        }
    }
}

fn command_err(e: redis::RedisError) -> BrokerError {
    if e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout() {
        BrokerError::Connection(e.to_string())
    } else {
        BrokerError::Command(e.to_string())
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn append(
        &self,
        stream: &str,
        fields: &[(String, String)],
    ) -> Result<EntryId, BrokerError> {
        let mut conn = self.conn.clone();
        let id: String = conn
            .xadd(stream, "*", fields)
            .await
            .map_err(command_err)?;
        Ok(id)
    }

    async fn range(&self, stream: &str) -> Result<Vec<StreamRecord>, BrokerError> {
        let mut conn = self.conn.clone();
        let reply: StreamRangeReply = conn.xrange_all(stream).await.map_err(command_err)?;
        Ok(reply
            .ids
            .iter()
            .map(|id| Self::record_from_stream_id(stream, id))
            .collect())
    }

    async fn last_entry(&self, stream: &str) -> Result<Option<StreamRecord>, BrokerError> {
        let mut conn = self.conn.clone();
        let reply: StreamRangeReply = conn
            .xrevrange_count(stream, "+", "-", 1)
            .await
            .map_err(command_err)?;
        Ok(reply
            .ids
            .first()
            .map(|id| Self::record_from_stream_id(stream, id)))
    }

    async fn create_group(&self, stream: &str, group: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let result: Result<(), redis::RedisError> =
            conn.xgroup_create_mkstream(stream, group, "0").await;
        match result {
            Ok(()) => Ok(()),
            // Group already exists: creation is idempotent.
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(command_err(e)),
        }
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamRecord>, BrokerError> {
        let mut conn = self.conn.clone();
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block.as_millis() as usize);
        let ids: Vec<&str> = streams.iter().map(|_| ">").collect();
        let reply: StreamReadReply = conn
            .xread_options(streams, &ids, &options)
            .await
            .map_err(command_err)?;
        let mut out = Vec::new();
        for key in &reply.keys {
            for id in &key.ids {
                out.push(Self::record_from_stream_id(&key.key, id));
            }
        }
        Ok(out)
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _: u64 = conn.xack(stream, group, &[id]).await.map_err(command_err)?;
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
        let mut conn = self.conn.clone();
        let options = StreamAutoClaimOptions::default().count(count);
        let reply: StreamAutoClaimReply = conn
            .xautoclaim_options(
                stream,
                group,
                consumer,
                min_idle.as_millis() as usize,
                "0-0",
                options,
            )
            .await
            .map_err(command_err)?;
        Ok(reply
            .claimed
            .iter()
            .map(|id| Self::record_from_stream_id(stream, id))
            .collect())
    }

    async fn kv_get(&self, key: &str) -> Result<Option<String>, BrokerError> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(command_err)
    }

    async fn kv_set(&self, key: &str, value: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key, value).await.map_err(command_err)
    }

    async fn kv_set_nx(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, BrokerError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(command_err)?;
        Ok(reply.is_some())
    }

    async fn kv_delete(&self, key: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await.map_err(command_err)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        conn.expire::<_, ()>(key, ttl.as_secs().max(1) as i64)
            .await
            .map_err(command_err)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, BrokerError> {
        let mut conn = self.conn.clone();
        let pattern = format!("{prefix}*");
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await
                .map_err(command_err)?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }

    async fn incr_with_marker(
        &self,
        counter_key: &str,
        marker_key: &str,
        ttl: Duration,
    ) -> Result<(u64, bool), BrokerError> {
        let mut conn = self.conn.clone();
        let (seq, fresh): (u64, u64) = self
            .incr_with_marker
            .key(counter_key)
            .key(marker_key)
            .arg(ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await
            .map_err(command_err)?;
        Ok((seq, fresh == 1))
    }

    async fn hash_set_arrived(
        &self,
        key: &str,
        field: &str,
        value: &str,
    ) -> Result<u64, BrokerError> {
        let mut conn = self.conn.clone();
        self.hash_set_arrived
            .key(key)
            .arg(field)
            .arg(value)
            .invoke_async(&mut conn)
            .await
            .map_err(command_err)
    }

    async fn hash_get_all(&self, key: &str) -> Result<Vec<(String, String)>, BrokerError> {
        let mut conn = self.conn.clone();
        let map: std::collections::HashMap<String, String> =
            conn.hgetall(key).await.map_err(command_err)?;
        Ok(map.into_iter().collect())
    }

    async fn list_push_trim(
        &self,
        key: &str,
        value: &str,
        cap: usize,
    ) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .lpush(key, value)
            .ignore()
            .ltrim(key, 0, cap.saturating_sub(1) as isize)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(command_err)?;
        Ok(())
    }

    async fn list_range(&self, key: &str) -> Result<Vec<String>, BrokerError> {
        let mut conn = self.conn.clone();
        conn.lrange(key, 0, -1).await.map_err(command_err)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(channel, payload)
            .await
            .map_err(command_err)
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>, BrokerError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        let (tx, rx) = mpsc::channel(256);
        let channel = channel.to_string();
        tokio::spawn(async move {
            use futures::StreamExt;
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!("bad payload on channel '{}': {}", channel, e);
                        continue;
                    }
                };
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}
