//! Dependency resolvers
//!
//! One resolver role per output report: the terminal join. When every
//! field the report references has been produced for a message id, the
//! resolver assembles the complete record, appends it to the output
//! stream, and publishes it on the report's channel for live consumers.

use crate::broker::{Broker, BrokerError, StreamRecord};
use crate::consumer::StreamConsumer;
use crate::dlq;
use crate::encoding::{decode_msg_id, decode_value, encode_value};
use crate::model::ResolverSpec;
use crate::pending::{ArrivedValues, PendingJoin};
use async_trait::async_trait;
use brook_core::{MessageId, Value, MSG_ID_FIELD, SOURCE_ID_FIELD};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub struct DependencyResolver {
    spec: ResolverSpec,
    broker: Arc<dyn Broker>,
    sep: char,
    join: PendingJoin,
}

impl DependencyResolver {
    pub fn new(
        spec: ResolverSpec,
        broker: Arc<dyn Broker>,
        sep: char,
        pending_ttl: Duration,
    ) -> Self {
        let mut required: Vec<String> = spec.fields.iter().map(|d| d.stream.clone()).collect();
        required.sort();
        required.dedup();
        let join = PendingJoin::new(broker.clone(), &spec.group, required, pending_ttl);
        Self {
            spec,
            broker,
            sep,
            join,
        }
    }

    /// Assemble and emit the completed report, exactly once per message.
    async fn finalize(
        &self,
        msg_id: &MessageId,
        arrived: &ArrivedValues,
    ) -> Result<(), BrokerError> {
        let msg_key = msg_id.to_string();
        if self.join.try_mark_emitted(&msg_key).await? {
            let mut record: Vec<(String, String)> =
                Vec::with_capacity(self.spec.fields.len() + 2);
            let mut object = serde_json::Map::new();
            for dep in &self.spec.fields {
                let Some((_, raw)) = arrived.iter().find(|(k, _)| k == &dep.stream) else {
                    warn!(
                        "resolver {}: ready message {} lost value of '{}'",
                        self.spec.report, msg_key, dep.stream
                    );
                    return Ok(());
                };
                record.push((dep.param.clone(), raw.clone()));
                let value = decode_value(&dep.field, raw).unwrap_or(Value::Null);
                object.insert(dep.param.clone(), value.into());
            }
            record.push((
                MSG_ID_FIELD.to_string(),
                encode_value(&Value::Str(msg_key.clone())),
            ));
            record.push((
                SOURCE_ID_FIELD.to_string(),
                encode_value(&Value::Str(msg_id.source.clone())),
            ));
            object.insert(
                MSG_ID_FIELD.to_string(),
                serde_json::Value::String(msg_key.clone()),
            );
            object.insert(
                SOURCE_ID_FIELD.to_string(),
                serde_json::Value::String(msg_id.source.clone()),
            );

            self.broker
                .append(&self.spec.output_stream, &record)
                .await?;
            let payload = serde_json::Value::Object(object).to_string();
            self.broker.publish(&self.spec.channel, &payload).await?;
        }
        self.join.delete(&msg_key).await
    }
}

#[async_trait]
impl StreamConsumer for DependencyResolver {
    fn group(&self) -> &str {
        &self.spec.group
    }

    fn streams(&self) -> Vec<String> {
        let mut streams: Vec<String> =
            self.spec.fields.iter().map(|d| d.stream.clone()).collect();
        streams.sort();
        streams.dedup();
        streams
    }

    async fn on_start(&self) -> Result<(), BrokerError> {
        self.on_sweep().await
    }

    async fn on_sweep(&self) -> Result<(), BrokerError> {
        for (msg_key, arrived) in self.join.complete_survivors().await? {
            match MessageId::parse(&msg_key, self.sep) {
                Ok(msg_id) => self.finalize(&msg_id, &arrived).await?,
                Err(e) => {
                    warn!(
                        "resolver {}: dropping unparseable pending key '{}': {}",
                        self.spec.report, msg_key, e
                    );
                    let _ = self.join.delete(&msg_key).await;
                }
            }
        }
        Ok(())
    }

    async fn handle(&self, record: &StreamRecord) -> Result<(), BrokerError> {
        let msg_id = match decode_msg_id(&record.fields, self.sep) {
            Ok(msg_id) => msg_id,
            Err(e) => {
                dlq::write(
                    self.broker.as_ref(),
                    &self.spec.report,
                    &self.spec.group,
                    None,
                    &e.to_string(),
                    &record.fields,
                )
                .await;
                return Ok(());
            }
        };

        let Some(dep) = self.spec.fields.iter().find(|d| d.stream == record.stream) else {
            warn!(
                "resolver {}: record from undeclared stream '{}'",
                self.spec.report, record.stream
            );
            return Ok(());
        };
        let Some((_, raw)) = record.fields.iter().find(|(k, _)| k == &dep.field) else {
            dlq::write(
                self.broker.as_ref(),
                &self.spec.report,
                &self.spec.group,
                Some(&msg_id.to_string()),
                &format!("record on '{}' has no '{}' field", record.stream, dep.field),
                &record.fields,
            )
            .await;
            return Ok(());
        };

        if let Some(arrived) = self
            .join
            .record_arrival(&msg_id.to_string(), &record.stream, raw)
            .await?
        {
            self.finalize(&msg_id, &arrived).await?;
        }
        Ok(())
    }
}
