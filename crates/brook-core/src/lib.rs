//! Brook Core - Shared vocabulary for the Brook dataflow engine
//!
//! This crate holds the types that cross crate boundaries: runtime values,
//! message identifiers, and the schema document served to frontends.

pub mod msgid;
pub mod schema;
pub mod value;

pub use msgid::{MessageId, MessageIdError};
pub use schema::{BrookSchema, FieldInfo, FieldType, StreamInfo};
pub use value::Value;

/// Field key carrying the message identifier in every internal stream record.
pub const MSG_ID_FIELD: &str = "_msg";

/// Field key carrying the source id in output records.
pub const SOURCE_ID_FIELD: &str = "_source";

/// Field key used on identity sub-streams (`<report>:_id`).
pub const ID_FIELD: &str = "_id";

/// Suffix of identity sub-streams.
pub const ID_STREAM_SUFFIX: &str = "_id";

/// Suffix of dead-letter streams (`<namespace>:_dlq`).
pub const DLQ_STREAM_SUFFIX: &str = "_dlq";

/// Namespace under which artificial field sub-streams live.
pub const ARTIFICIAL_NAMESPACE: &str = "artificial";

/// Default separator between source id and sequence number in a message id.
pub const DEFAULT_SPECIAL_CHAR: char = ':';

/// Environment variable naming the broker endpoint.
pub const REDIS_URL_ENV: &str = "REDIS_URL";

/// Environment variable overriding the per-role worker count.
pub const DEFAULT_WORKERS_ENV: &str = "DEFAULT_WORKERS";

/// Per-role worker count when `DEFAULT_WORKERS` is unset.
pub const DEFAULT_WORKERS: usize = 4;
