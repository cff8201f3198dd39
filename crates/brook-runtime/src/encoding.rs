//! Wire encoding for broker records
//!
//! Every value stored in a stream entry, pending hash, or history list is
//! the JSON text of the field value. Stream entries are flat maps of field
//! name to encoded value, with the message id under [`MSG_ID_FIELD`].

use brook_core::{MessageId, Value, MSG_ID_FIELD};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("field '{field}' is not valid JSON: {source}")]
    BadJson {
        field: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("record has no '{0}' field")]
    MissingField(String),
    #[error("bad message id: {0}")]
    BadMessageId(#[from] brook_core::MessageIdError),
}

/// Encode a single value as its JSON text.
pub fn encode_value(value: &Value) -> String {
    // Value serialization cannot fail: it is JSON-shaped by construction.
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

/// Decode the JSON text of a single value.
pub fn decode_value(field: &str, raw: &str) -> Result<Value, DecodeError> {
    serde_json::from_str(raw).map_err(|source| DecodeError::BadJson {
        field: field.to_string(),
        source,
    })
}

/// Encode a message id under [`MSG_ID_FIELD`] plus one encoded value per
/// field, preserving field order.
pub fn encode_record(msg_id: &MessageId, fields: &[(String, Value)]) -> Vec<(String, String)> {
    let mut out = Vec::with_capacity(fields.len() + 1);
    out.push((
        MSG_ID_FIELD.to_string(),
        encode_value(&Value::Str(msg_id.to_string())),
    ));
    for (name, value) in fields {
        out.push((name.clone(), encode_value(value)));
    }
    out
}

/// Extract and parse the message id of a record.
pub fn decode_msg_id(fields: &[(String, String)], sep: char) -> Result<MessageId, DecodeError> {
    let raw = fields
        .iter()
        .find(|(k, _)| k == MSG_ID_FIELD)
        .map(|(_, v)| v.as_str())
        .ok_or_else(|| DecodeError::MissingField(MSG_ID_FIELD.to_string()))?;
    let value = decode_value(MSG_ID_FIELD, raw)?;
    let text = value
        .as_str()
        .ok_or_else(|| DecodeError::MissingField(MSG_ID_FIELD.to_string()))?;
    Ok(MessageId::parse(text, sep)?)
}

/// Look up and decode a named field of a record.
pub fn decode_field(fields: &[(String, String)], name: &str) -> Result<Value, DecodeError> {
    let raw = fields
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
        .ok_or_else(|| DecodeError::MissingField(name.to_string()))?;
    decode_value(name, raw)
}
