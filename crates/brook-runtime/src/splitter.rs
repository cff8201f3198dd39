//! Splitter
//!
//! One splitter role per input report. Each input record gets a per-source
//! sequence number, then fans out into one sub-stream per declared field
//! plus an identity sub-stream. Sequence assignment is keyed by the input
//! entry id, so a record re-delivered after a partial failure keeps the
//! message id it was first assigned and the per-source sequence stays
//! gap-free.

use crate::broker::{Broker, BrokerError, StreamRecord};
use crate::consumer::StreamConsumer;
use crate::dlq;
use crate::encoding::{decode_value, encode_record, encode_value};
use crate::history;
use crate::model::SplitterSpec;
use async_trait::async_trait;
use brook_core::{MessageId, Value, ID_FIELD, ID_STREAM_SUFFIX, MSG_ID_FIELD};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub struct Splitter {
    spec: SplitterSpec,
    broker: Arc<dyn Broker>,
    sep: char,
    marker_ttl: Duration,
}

struct DecodedInput {
    source: String,
    fields: Vec<(String, Value)>,
}

impl Splitter {
    pub fn new(
        spec: SplitterSpec,
        broker: Arc<dyn Broker>,
        sep: char,
        marker_ttl: Duration,
    ) -> Self {
        Self {
            spec,
            broker,
            sep,
            marker_ttl,
        }
    }

    fn sub_stream(&self, field: &str) -> String {
        format!("{}:{}", self.spec.report, field)
    }

    fn decode(&self, record: &StreamRecord) -> Result<DecodedInput, String> {
        let mut fields = Vec::with_capacity(self.spec.fields.len());
        for name in &self.spec.fields {
            let raw = record
                .fields
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str())
                .ok_or_else(|| format!("missing field '{name}'"))?;
            let value = decode_value(name, raw).map_err(|e| e.to_string())?;
            fields.push((name.clone(), value));
        }

        let id_value = fields
            .iter()
            .find(|(name, _)| name == &self.spec.id_field)
            .map(|(_, v)| v.clone())
            .ok_or_else(|| format!("missing id field '{}'", self.spec.id_field))?;
        let source = match id_value {
            Value::Str(s) => s,
            Value::Int(n) => n.to_string(),
            other => return Err(format!("id field has non-scalar type {}", other.type_name())),
        };
        if source.contains(self.sep) {
            return Err(format!(
                "source id '{}' contains the reserved separator '{}'",
                source, self.sep
            ));
        }
        Ok(DecodedInput { source, fields })
    }
}

#[async_trait]
impl StreamConsumer for Splitter {
    fn group(&self) -> &str {
        &self.spec.group
    }

    fn streams(&self) -> Vec<String> {
        vec![self.spec.input_stream.clone()]
    }

    async fn handle(&self, record: &StreamRecord) -> Result<(), BrokerError> {
        let input = match self.decode(record) {
            Ok(input) => input,
            Err(error) => {
                dlq::write(
                    self.broker.as_ref(),
                    &self.spec.report,
                    &self.spec.group,
                    None,
                    &error,
                    &record.fields,
                )
                .await;
                return Ok(());
            }
        };

        // Idempotent sequence claim keyed by the input entry id: on
        // redelivery the same seq comes back and the fan-out below simply
        // repeats, which downstream joins absorb.
        let counter_key = format!("counter:{}:{}", input.source, self.spec.report);
        let marker_key = format!("seen:{}:{}", self.spec.report, record.id);
        let (seq, fresh) = self
            .broker
            .incr_with_marker(&counter_key, &marker_key, self.marker_ttl)
            .await?;
        // new() cannot fail here: decode() rejected separators in the source.
        let msg_id = MessageId::new(&input.source, seq, self.sep)
            .map_err(|e| BrokerError::Command(e.to_string()))?;
        if !fresh {
            debug!(
                "re-splitting {} (redelivered entry {})",
                msg_id, record.id
            );
        }

        // History first: once a sub-stream record is visible, the ring
        // already holds this message's value for every observed field.
        for (field, cap) in &self.spec.history {
            let Some((_, value)) = input.fields.iter().find(|(name, _)| name == field) else {
                continue;
            };
            let key = history::history_key(&input.source, &self.sub_stream(field));
            history::push(self.broker.as_ref(), &key, seq, value, *cap).await?;
        }

        for (field, value) in &input.fields {
            let encoded = encode_record(&msg_id, &[(field.clone(), value.clone())]);
            self.broker.append(&self.sub_stream(field), &encoded).await?;
        }

        let identity = vec![
            (
                MSG_ID_FIELD.to_string(),
                encode_value(&Value::Str(msg_id.to_string())),
            ),
            (
                ID_FIELD.to_string(),
                encode_value(&Value::Str(input.source.clone())),
            ),
            ("seq".to_string(), encode_value(&Value::Int(seq as i64))),
        ];
        self.broker
            .append(&self.sub_stream(ID_STREAM_SUFFIX), &identity)
            .await?;

        Ok(())
    }
}
