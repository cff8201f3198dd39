//! Shared consumer loop
//!
//! Every role (splitter, generator, resolver) is a [`StreamConsumer`]
//! driven by [`run_consumer`]: create the consumer group, re-drive state
//! that survived a restart, then loop reading batches, handling records,
//! and acking. Entries stranded by crashed workers are periodically
//! claimed back into the group. Transient broker failures back off with
//! jitter and never ack, so the broker re-delivers.

use crate::broker::{Backoff, Broker, BrokerError, StreamRecord};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Tuning knobs shared by all consumer loops.
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    /// Entries per read batch.
    pub read_batch: usize,
    /// Blocking read timeout; bounds shutdown latency.
    pub block: Duration,
    /// Pending age after which another worker may claim an entry.
    pub claim_min_idle: Duration,
    /// Claim sweep runs once per this many read iterations.
    pub claim_every: u32,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            read_batch: 100,
            block: Duration::from_secs(2),
            claim_min_idle: Duration::from_secs(30),
            claim_every: 16,
        }
    }
}

/// One role instance processing records from its consumer group.
#[async_trait]
pub trait StreamConsumer: Send + Sync {
    /// Consumer group this role reads with.
    fn group(&self) -> &str;

    /// Streams the group consumes.
    fn streams(&self) -> Vec<String>;

    /// Called once before the read loop; used to re-drive persisted state
    /// after a restart.
    async fn on_start(&self) -> Result<(), BrokerError> {
        Ok(())
    }

    /// Process one record. Returning an error means the record was *not*
    /// dealt with (broker trouble) and must stay unacked for redelivery;
    /// poison records are dead-lettered inside and return `Ok`.
    async fn handle(&self, record: &StreamRecord) -> Result<(), BrokerError>;

    /// Called on the same cadence as the stale-entry claim sweep; roles
    /// with persisted join state re-drive stragglers here.
    async fn on_sweep(&self) -> Result<(), BrokerError> {
        Ok(())
    }

    /// Called after the read loop stops; waits out in-flight work.
    async fn on_drain(&self) {}
}

/// Drive a consumer until `shutdown` flips to true.
pub async fn run_consumer(
    broker: Arc<dyn Broker>,
    consumer: Arc<dyn StreamConsumer>,
    options: ConsumerOptions,
    shutdown: watch::Receiver<bool>,
) {
    let name = format!("{}-{}", consumer.group(), Uuid::new_v4().simple());
    let streams = consumer.streams();
    let group = consumer.group().to_string();

    let mut backoff = Backoff::default();
    while !create_groups(broker.as_ref(), &streams, &group).await {
        if *shutdown.borrow() {
            return;
        }
        tokio::time::sleep(backoff.next_delay()).await;
    }

    if let Err(e) = consumer.on_start().await {
        warn!("consumer {}: re-drive failed: {}", name, e);
    }
    info!("consumer {} started on {:?}", name, streams);

    backoff.reset();
    let mut iteration: u32 = 0;
    while !*shutdown.borrow() {
        iteration = iteration.wrapping_add(1);

        if iteration % options.claim_every == 0 {
            claim_sweep(&broker, consumer.as_ref(), &name, &streams, &group, &options).await;
            if let Err(e) = consumer.on_sweep().await {
                warn!("consumer {}: sweep re-drive failed: {}", name, e);
            }
        }

        let batch = broker
            .read_group(&group, &name, &streams, options.read_batch, options.block)
            .await;
        let records = match batch {
            Ok(records) => {
                backoff.reset();
                records
            }
            Err(e) => {
                let delay = backoff.next_delay();
                warn!(
                    "consumer {}: read failed ({}), retrying in {:?}",
                    name, e, delay
                );
                tokio::time::sleep(delay).await;
                continue;
            }
        };

        for record in &records {
            if let Err(e) = process_record(broker.as_ref(), consumer.as_ref(), &group, record).await
            {
                // Left unacked: the broker will re-deliver it.
                warn!(
                    "consumer {}: record {} on '{}' failed: {}",
                    name, record.id, record.stream, e
                );
            }
        }
    }

    consumer.on_drain().await;
    info!("consumer {} stopped", name);
}

async fn create_groups(broker: &dyn Broker, streams: &[String], group: &str) -> bool {
    for stream in streams {
        if let Err(e) = broker.create_group(stream, group).await {
            warn!("group '{}' on '{}' not ready: {}", group, stream, e);
            return false;
        }
    }
    true
}

async fn process_record(
    broker: &dyn Broker,
    consumer: &dyn StreamConsumer,
    group: &str,
    record: &StreamRecord,
) -> Result<(), BrokerError> {
    consumer.handle(record).await?;
    broker.ack(&record.stream, group, &record.id).await
}

async fn claim_sweep(
    broker: &Arc<dyn Broker>,
    consumer: &dyn StreamConsumer,
    name: &str,
    streams: &[String],
    group: &str,
    options: &ConsumerOptions,
) {
    for stream in streams {
        let claimed = match broker
            .claim_stale(stream, group, name, options.claim_min_idle, options.read_batch)
            .await
        {
            Ok(claimed) => claimed,
            Err(e) => {
                warn!("consumer {}: claim on '{}' failed: {}", name, stream, e);
                continue;
            }
        };
        if !claimed.is_empty() {
            debug!(
                "consumer {}: claimed {} stale entries from '{}'",
                name,
                claimed.len(),
                stream
            );
        }
        for record in &claimed {
            if let Err(e) = process_record(broker.as_ref(), consumer, group, record).await {
                warn!(
                    "consumer {}: claimed record {} failed: {}",
                    name, record.id, e
                );
            }
        }
    }
}
