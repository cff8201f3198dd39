//! Schema document served to frontends
//!
//! Mirrors the JSON configuration document consumed by map frontends: one
//! entry per output stream with its WebSocket path and report schema, plus
//! the well-known field roles (latitude, longitude, time, group, direction).

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Declared type of a report field, used for schema generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Bool,
    Integer,
    Float,
    String,
    Object,
}

impl FieldType {
    /// JSON Schema `type` keyword for this field type.
    pub fn json_type(&self) -> &'static str {
        match self {
            FieldType::Bool => "boolean",
            FieldType::Integer => "integer",
            FieldType::Float => "number",
            FieldType::String => "string",
            FieldType::Object => "object",
        }
    }
}

/// Schema of a single output report: JSON Schema `properties` keyed by
/// field name.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReportSchema {
    pub properties: IndexMap<String, PropertySchema>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertySchema {
    #[serde(rename = "type")]
    pub field_type: String,
    pub title: String,
}

/// One output stream exposed over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamInfo {
    pub stream_name: String,
    pub websocket_path: String,
    pub report_schema: ReportSchema,
}

/// Pointer to a field within an output stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldInfo {
    pub stream_name: String,
    pub field_name: String,
}

/// The configuration document returned by the schema endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BrookSchema {
    pub streams: Vec<StreamInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitude_field: Option<FieldInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitude_field: Option<FieldInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_field: Option<FieldInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_field: Option<FieldInfo>,
    pub direction_field: Option<FieldInfo>,
    pub msg_id_field: String,
    pub special_char: String,
}

impl BrookSchema {
    pub fn new(special_char: char) -> Self {
        Self {
            msg_id_field: crate::MSG_ID_FIELD.to_string(),
            special_char: special_char.to_string(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_types() {
        assert_eq!(FieldType::Float.json_type(), "number");
        assert_eq!(FieldType::Integer.json_type(), "integer");
        assert_eq!(FieldType::String.json_type(), "string");
    }

    #[test]
    fn test_schema_document_shape() {
        let mut schema = BrookSchema::new(':');
        let mut properties = IndexMap::new();
        properties.insert(
            "lat".to_string(),
            PropertySchema {
                field_type: "number".to_string(),
                title: "lat".to_string(),
            },
        );
        schema.streams.push(StreamInfo {
            stream_name: "location-report".to_string(),
            websocket_path: "/location-report".to_string(),
            report_schema: ReportSchema { properties },
        });
        schema.latitude_field = Some(FieldInfo {
            stream_name: "location-report".to_string(),
            field_name: "lat".to_string(),
        });

        let json: serde_json::Value =
            serde_json::to_value(&schema).expect("schema serializes");
        assert_eq!(json["msg_id_field"], "_msg");
        assert_eq!(json["special_char"], ":");
        assert_eq!(json["streams"][0]["websocket_path"], "/location-report");
        assert_eq!(
            json["streams"][0]["report_schema"]["properties"]["lat"]["type"],
            "number"
        );
        // direction_field is serialized even when absent.
        assert!(json.get("direction_field").is_some());
        assert!(json["direction_field"].is_null());
    }
}
