//! Consumer-group reading over Redis Streams.

mod backend;
mod consumer;
mod cursor;
#[cfg(any(test, feature = "memory"))]
pub mod memory;

use std::collections::HashMap;

pub use backend::{ReadGroup, RedisBackend, StreamBackend};
pub use consumer::{Consumer, ConsumerOptions};
pub use cursor::Cursor;

/// A single field value of a stream entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    /// Bulk string payload, not necessarily UTF-8.
    Bytes(Vec<u8>),
    /// Any other reply type, described for logging.
    Other(String),
}

impl FieldValue {
    pub fn from_redis(value: &redis::Value) -> Self {
        match value {
            redis::Value::Data(bytes) => FieldValue::Bytes(bytes.clone()),
            redis::Value::Status(text) => FieldValue::Bytes(text.clone().into_bytes()),
            other => FieldValue::Other(format!("{:?}", other)),
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            FieldValue::Bytes(bytes) => Some(bytes),
            FieldValue::Other(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|bytes| std::str::from_utf8(bytes).ok())
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Bytes(value.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(value: Vec<u8>) -> Self {
        FieldValue::Bytes(value)
    }
}

/// One entry as returned by the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub id: String,
    pub fields: HashMap<String, FieldValue>,
}

/// Entries returned for one stream of a batched read. An empty `entries`
/// list means the stream has no more backlog for this consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamBatch {
    pub stream: String,
    pub entries: Vec<StreamEntry>,
}

/// A consumed entry, tagged with the stream it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamMessage {
    pub stream: String,
    pub id: String,
    pub fields: HashMap<String, FieldValue>,
}

impl StreamMessage {
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }
}
