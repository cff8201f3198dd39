//! Dead-letter streams
//!
//! Records the engine chose not to process are appended to a `:_dlq`
//! stream next to the stream they came from, with enough metadata to
//! reprocess them later: the consumer that gave up, the error text, the
//! message id when one was assigned, and a timestamp.

use crate::broker::{Broker, BrokerError};
use brook_core::DLQ_STREAM_SUFFIX;
use tracing::warn;

/// Name of the dead-letter stream for a namespace (an input report name,
/// an output report name, or the artificial namespace).
pub fn dlq_stream(namespace: &str) -> String {
    format!("{namespace}:{DLQ_STREAM_SUFFIX}")
}

/// Append a dead-letter record. Failures to write the DLQ itself are
/// logged and swallowed; dead-lettering must never take the consumer down.
pub async fn write(
    broker: &dyn Broker,
    namespace: &str,
    consumer: &str,
    msg_id: Option<&str>,
    error: &str,
    payload: &[(String, String)],
) {
    let mut fields = vec![
        ("consumer".to_string(), consumer.to_string()),
        ("error".to_string(), error.to_string()),
        (
            "timestamp".to_string(),
            chrono::Utc::now().to_rfc3339(),
        ),
    ];
    if let Some(msg_id) = msg_id {
        fields.push((brook_core::MSG_ID_FIELD.to_string(), msg_id.to_string()));
    }
    for (key, value) in payload {
        fields.push((format!("payload.{key}"), value.clone()));
    }
    let stream = dlq_stream(namespace);
    if let Err(e) = broker.append(&stream, &fields).await {
        warn!("failed to write dead-letter record to '{}': {}", stream, e);
    }
}

/// Count of dead-letter records for a namespace. Test and ops helper.
pub async fn len(broker: &dyn Broker, namespace: &str) -> Result<usize, BrokerError> {
    Ok(broker.range(&dlq_stream(namespace)).await?.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;

    #[tokio::test]
    async fn test_dlq_record_shape() {
        let broker = MemoryBroker::new();
        write(
            &broker,
            "artificial",
            "gen-direction",
            Some("V1:3"),
            "division by zero",
            &[("lat".to_string(), "1.0".to_string())],
        )
        .await;

        let records = broker.range(&dlq_stream("artificial")).await.unwrap();
        assert_eq!(records.len(), 1);
        let fields = &records[0].fields;
        let get = |k: &str| {
            fields
                .iter()
                .find(|(key, _)| key == k)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(get("consumer"), Some("gen-direction"));
        assert_eq!(get("error"), Some("division by zero"));
        assert_eq!(get("_msg"), Some("V1:3"));
        assert_eq!(get("payload.lat"), Some("1.0"));
        assert!(get("timestamp").is_some());
    }
}
