//! Debezium change envelope.
//!
//! Both key and value may arrive wrapped as `{"schema": ..., "payload": ...}`
//! (JSON converter with schemas enabled) or bare. [`unwrap_payload`] accepts
//! either form.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{CanalError, Result};

/// Row operation of a change event.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum Operation {
    Create,
    Update,
    Delete,
    /// Initial snapshot read.
    Snapshot,
    Unknown(String),
}

impl From<String> for Operation {
    fn from(op: String) -> Self {
        match op.as_str() {
            "c" => Operation::Create,
            "u" => Operation::Update,
            "d" => Operation::Delete,
            "r" => Operation::Snapshot,
            _ => Operation::Unknown(op),
        }
    }
}

impl Operation {
    pub fn code(&self) -> &str {
        match self {
            Operation::Create => "c",
            Operation::Update => "u",
            Operation::Delete => "d",
            Operation::Snapshot => "r",
            Operation::Unknown(op) => op,
        }
    }

    /// Metric label value; unrecognised codes share one label.
    pub fn metric_label(&self) -> &'static str {
        match self {
            Operation::Create => "c",
            Operation::Update => "u",
            Operation::Delete => "d",
            Operation::Snapshot => "r",
            Operation::Unknown(_) => "unknown",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Source {
    #[serde(default)]
    pub table: String,
}

/// One row-level mutation with its before and after images.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChangeEnvelope {
    #[serde(default)]
    pub before: Option<Value>,
    #[serde(default)]
    pub after: Option<Value>,
    #[serde(default)]
    pub source: Source,
    pub op: Operation,
}

impl ChangeEnvelope {
    pub fn table(&self) -> &str {
        &self.source.table
    }

    /// Decode the before image. An absent or `null` image is an error.
    pub fn before_as<T: DeserializeOwned>(&self) -> Result<T> {
        decode_image(self.table(), "before", self.before.as_ref())
    }

    /// Decode the after image. An absent or `null` image is an error.
    pub fn after_as<T: DeserializeOwned>(&self) -> Result<T> {
        decode_image(self.table(), "after", self.after.as_ref())
    }
}

fn decode_image<T: DeserializeOwned>(
    table: &str,
    image: &'static str,
    value: Option<&Value>,
) -> Result<T> {
    match value {
        None | Some(Value::Null) => Err(CanalError::MissingImage {
            table: table.to_string(),
            image,
        }),
        Some(value) => T::deserialize(value).map_err(|source| CanalError::ImageDecode {
            table: table.to_string(),
            image,
            source,
        }),
    }
}

/// Return the `payload` member of a schema-wrapped document, or the document
/// itself when it is not wrapped.
pub fn unwrap_payload(document: Value) -> Value {
    match document {
        Value::Object(mut map) if map.contains_key("payload") => {
            map.remove("payload").unwrap_or(Value::Null)
        }
        other => other,
    }
}

/// Parse a raw message value into an envelope.
pub fn decode_envelope(value: &[u8]) -> serde_json::Result<ChangeEnvelope> {
    let document: Value = serde_json::from_slice(value)?;
    serde_json::from_value(unwrap_payload(document))
}

/// Parse a raw message key into its payload document.
pub fn decode_key(key: &[u8]) -> serde_json::Result<Value> {
    let document: Value = serde_json::from_slice(key)?;
    Ok(unwrap_payload(document))
}
