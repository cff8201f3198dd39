//! Field generators
//!
//! One generator role per artificial field. The generator joins the
//! field's dependencies by message id, reads history windows once the
//! join completes, and invokes the user computation inside a bounded
//! in-flight pool so long computations never stall the read loop.
//!
//! History windows are read before this message's own effects are applied:
//! the window a computation sees for message M is exactly the ring state
//! after M-1, enforced by the wait predicate in [`crate::history`].

use crate::broker::{Broker, BrokerError, StreamRecord};
use crate::consumer::StreamConsumer;
use crate::dlq;
use crate::encoding::{decode_msg_id, decode_value, encode_record};
use crate::history;
use crate::model::{FieldContext, GeneratorSpec};
use crate::pending::{ArrivedValues, PendingJoin};
use async_trait::async_trait;
use brook_core::{MessageId, Value, ARTIFICIAL_NAMESPACE};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Tuning for generator roles.
#[derive(Debug, Clone)]
pub struct GeneratorOptions {
    /// Maximum concurrent user computations per worker. Reads pause while
    /// the pool is saturated.
    pub max_inflight: usize,
    /// TTL on pending join state and publish markers.
    pub pending_ttl: Duration,
    /// Bounded wait for a predecessor's history push.
    pub history_wait_attempts: u32,
    pub history_wait_delay: Duration,
}

impl Default for GeneratorOptions {
    fn default() -> Self {
        Self {
            max_inflight: 16,
            pending_ttl: Duration::from_secs(600),
            history_wait_attempts: 20,
            history_wait_delay: Duration::from_millis(50),
        }
    }
}

pub struct FieldGenerator {
    inner: Arc<GenInner>,
}

struct GenInner {
    spec: GeneratorSpec,
    broker: Arc<dyn Broker>,
    sep: char,
    join: PendingJoin,
    inflight: Arc<Semaphore>,
    options: GeneratorOptions,
    /// Payload field name per consumed sub-stream.
    stream_fields: HashMap<String, String>,
}

impl FieldGenerator {
    pub fn new(
        spec: GeneratorSpec,
        broker: Arc<dyn Broker>,
        sep: char,
        options: GeneratorOptions,
    ) -> Self {
        let mut stream_fields = HashMap::new();
        for dep in &spec.current {
            stream_fields.insert(dep.stream.clone(), dep.field.clone());
        }
        for hist in &spec.history {
            if !hist.is_self {
                stream_fields
                    .entry(hist.stream.clone())
                    .or_insert_with(|| hist.field.clone());
            }
        }
        // Readiness is gated on the current dependencies; history-only
        // records are consumed as arrival markers and retry triggers.
        let required: Vec<String> = {
            let mut streams: Vec<String> =
                spec.current.iter().map(|d| d.stream.clone()).collect();
            streams.sort();
            streams.dedup();
            streams
        };
        let join = PendingJoin::new(broker.clone(), &spec.group, required, options.pending_ttl);
        Self {
            inner: Arc::new(GenInner {
                inflight: Arc::new(Semaphore::new(options.max_inflight)),
                spec,
                broker,
                sep,
                join,
                options,
                stream_fields,
            }),
        }
    }

    async fn spawn_compute(&self, msg_id: MessageId, arrived: ArrivedValues) {
        // Acquiring before spawning is the back-pressure: a saturated pool
        // pauses further reads instead of queueing unbounded work.
        let Ok(permit) = self.inner.inflight.clone().acquire_owned().await else {
            return;
        };
        let inner = self.inner.clone();
        tokio::spawn(async move {
            GenInner::compute(&inner, &msg_id, &arrived).await;
            drop(permit);
        });
    }
}

impl GenInner {
    /// Run the user computation for a ready message and publish its value.
    async fn compute(inner: &Arc<GenInner>, msg_id: &MessageId, arrived: &ArrivedValues) {
        let msg_key = msg_id.to_string();

        let mut values = HashMap::new();
        for dep in &inner.spec.current {
            let Some((_, raw)) = arrived.iter().find(|(k, _)| k == &dep.stream) else {
                warn!(
                    "generator {}: ready message {} lost value of '{}'",
                    inner.spec.field, msg_key, dep.stream
                );
                return;
            };
            match decode_value(&dep.field, raw) {
                Ok(value) => {
                    values.insert(dep.param.clone(), value);
                }
                Err(e) => {
                    dlq::write(
                        inner.broker.as_ref(),
                        ARTIFICIAL_NAMESPACE,
                        &inner.spec.group,
                        Some(&msg_key),
                        &e.to_string(),
                        arrived,
                    )
                    .await;
                    let _ = inner.join.delete(&msg_key).await;
                    return;
                }
            }
        }

        let mut windows = HashMap::new();
        for hist in &inner.spec.history {
            let key = history::history_key(&msg_id.source, &hist.stream);
            let window = history::wait_for_window(
                inner.broker.as_ref(),
                &key,
                msg_id.seq,
                hist.len,
                inner.options.history_wait_attempts,
                inner.options.history_wait_delay,
            )
            .await;
            match window {
                Ok(Some(window)) => {
                    windows.insert(hist.param.clone(), window);
                }
                Ok(None) => {
                    // Predecessor not processed yet. The message stays
                    // pending; a later arrival or sweep re-drive retries.
                    debug!(
                        "generator {}: history of '{}' not ready at {}, deferring",
                        inner.spec.field, hist.stream, msg_key
                    );
                    return;
                }
                Err(e) => {
                    warn!(
                        "generator {}: history read failed at {}: {}",
                        inner.spec.field, msg_key, e
                    );
                    return;
                }
            }
        }

        let ctx = FieldContext::new(msg_id.clone(), values, windows);
        let value = match (inner.spec.func)(ctx).await {
            Ok(value) => value,
            Err(e) => {
                // Deterministic computations fail the same way on every
                // retry: dead-letter once and drop the join state. Outputs
                // depending on this message never complete and their
                // pending state ages out.
                dlq::write(
                    inner.broker.as_ref(),
                    ARTIFICIAL_NAMESPACE,
                    &inner.spec.group,
                    Some(&msg_key),
                    &e.to_string(),
                    arrived,
                )
                .await;
                let _ = inner.join.delete(&msg_key).await;
                return;
            }
        };

        if let Err(e) = Self::publish(inner, msg_id, &msg_key, &value).await {
            warn!(
                "generator {}: publish of {} failed: {}",
                inner.spec.field, msg_key, e
            );
        }
    }

    async fn publish(
        inner: &Arc<GenInner>,
        msg_id: &MessageId,
        msg_key: &str,
        value: &Value,
    ) -> Result<(), BrokerError> {
        // At-least-once delivery can complete the same join twice; only
        // the first writer publishes.
        if inner.join.try_mark_emitted(msg_key).await? {
            if let Some(cap) = inner.spec.own_history_cap {
                let key = history::history_key(&msg_id.source, &inner.spec.output_stream);
                history::push(inner.broker.as_ref(), &key, msg_id.seq, value, cap).await?;
            }
            let record =
                encode_record(msg_id, &[(inner.spec.field.clone(), value.clone())]);
            inner
                .broker
                .append(&inner.spec.output_stream, &record)
                .await?;
        }
        inner.join.delete(msg_key).await
    }

    async fn redrive(inner: &Arc<GenInner>) -> Result<Vec<(MessageId, ArrivedValues)>, BrokerError> {
        let mut ready = Vec::new();
        for (msg_key, arrived) in inner.join.complete_survivors().await? {
            match MessageId::parse(&msg_key, inner.sep) {
                Ok(msg_id) => ready.push((msg_id, arrived)),
                Err(e) => {
                    warn!(
                        "generator {}: dropping unparseable pending key '{}': {}",
                        inner.spec.field, msg_key, e
                    );
                    let _ = inner.join.delete(&msg_key).await;
                }
            }
        }
        Ok(ready)
    }
}

#[async_trait]
impl StreamConsumer for FieldGenerator {
    fn group(&self) -> &str {
        &self.inner.spec.group
    }

    fn streams(&self) -> Vec<String> {
        self.inner.spec.reads.clone()
    }

    async fn on_start(&self) -> Result<(), BrokerError> {
        self.on_sweep().await
    }

    async fn on_sweep(&self) -> Result<(), BrokerError> {
        // Inputs are acked once their arrival is persisted, so completed
        // joins interrupted before publishing are re-driven from KV.
        for (msg_id, arrived) in GenInner::redrive(&self.inner).await? {
            self.spawn_compute(msg_id, arrived).await;
        }
        Ok(())
    }

    async fn handle(&self, record: &StreamRecord) -> Result<(), BrokerError> {
        let msg_id = match decode_msg_id(&record.fields, self.inner.sep) {
            Ok(msg_id) => msg_id,
            Err(e) => {
                dlq::write(
                    self.inner.broker.as_ref(),
                    ARTIFICIAL_NAMESPACE,
                    &self.inner.spec.group,
                    None,
                    &e.to_string(),
                    &record.fields,
                )
                .await;
                return Ok(());
            }
        };

        let Some(field) = self.inner.stream_fields.get(&record.stream) else {
            warn!(
                "generator {}: record from undeclared stream '{}'",
                self.inner.spec.field, record.stream
            );
            return Ok(());
        };
        let Some((_, raw)) = record.fields.iter().find(|(k, _)| k == field) else {
            dlq::write(
                self.inner.broker.as_ref(),
                ARTIFICIAL_NAMESPACE,
                &self.inner.spec.group,
                Some(&msg_id.to_string()),
                &format!("record on '{}' has no '{}' field", record.stream, field),
                &record.fields,
            )
            .await;
            return Ok(());
        };

        if let Some(arrived) = self
            .inner
            .join
            .record_arrival(&msg_id.to_string(), &record.stream, raw)
            .await?
        {
            self.spawn_compute(msg_id, arrived).await;
        }
        Ok(())
    }

    async fn on_drain(&self) {
        // Wait for every in-flight computation to finish.
        let _ = self
            .inner
            .inflight
            .acquire_many(self.inner.options.max_inflight as u32)
            .await;
    }
}
