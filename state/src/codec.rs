//! Serialization of staged substates and of the persisted envelope
//!
//! The stored blob is double-encoded: every top-level key maps to its own
//! serialized string, and that map is serialized once more as a whole.

use rehydra_core::{PersistError, PersistResult};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use tracing::error;

pub type SerializeFn = Arc<dyn Fn(&Value) -> PersistResult<String> + Send + Sync>;
pub type DeserializeFn = Arc<dyn Fn(&str) -> PersistResult<Value> + Send + Sync>;

/// How substates are encoded before staging
#[derive(Clone, Default)]
pub enum Serializer {
    /// JSON text
    #[default]
    Json,
    Custom(SerializeFn),
    /// Stage raw values; the envelope is still written as JSON text
    Disabled,
}

impl Serializer {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&Value) -> PersistResult<String> + Send + Sync + 'static,
    {
        Serializer::Custom(Arc::new(f))
    }

    fn encode(&self, value: &Value) -> PersistResult<String> {
        match self {
            Serializer::Json | Serializer::Disabled => Ok(serde_json::to_string(value)?),
            Serializer::Custom(f) => f(value),
        }
    }

    /// Encode one substate for the staged set
    pub fn encode_entry(&self, value: &Value) -> PersistResult<Value> {
        match self {
            Serializer::Disabled => Ok(value.clone()),
            _ => self.encode(value).map(Value::String).map_err(|err| {
                error!("Error serializing state: {}", err);
                err
            }),
        }
    }

    /// Encode the whole staged set into the stored blob
    pub fn encode_envelope(&self, staged: &Map<String, Value>) -> PersistResult<String> {
        self.encode(&Value::Object(staged.clone()))
    }
}

impl fmt::Debug for Serializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Serializer::Json => f.write_str("Json"),
            Serializer::Custom(_) => f.write_str("Custom"),
            Serializer::Disabled => f.write_str("Disabled"),
        }
    }
}

/// How a stored blob is decoded
#[derive(Clone, Default)]
pub enum Deserializer {
    #[default]
    Json,
    Custom(DeserializeFn),
    /// Per-key values are taken as stored; the envelope is still JSON text
    Disabled,
}

impl Deserializer {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&str) -> PersistResult<Value> + Send + Sync + 'static,
    {
        Deserializer::Custom(Arc::new(f))
    }

    fn decode(&self, text: &str) -> PersistResult<Value> {
        match self {
            Deserializer::Json | Deserializer::Disabled => serde_json::from_str(text)
                .map_err(|e| PersistError::Deserialization(e.to_string())),
            Deserializer::Custom(f) => f(text),
        }
    }

    /// Decode the stored blob into its per-key map
    pub fn decode_envelope(&self, blob: &str) -> PersistResult<Map<String, Value>> {
        match self.decode(blob)? {
            Value::Object(map) => Ok(map),
            other => Err(PersistError::Deserialization(format!(
                "expected an object envelope, found {}",
                kind_of(&other)
            ))),
        }
    }

    /// Decode one per-key entry of the envelope
    pub fn decode_entry(&self, entry: Value) -> PersistResult<Value> {
        match (self, entry) {
            (Deserializer::Disabled, entry) => Ok(entry),
            (_, Value::String(text)) => self.decode(&text),
            (_, other) => Err(PersistError::Deserialization(format!(
                "expected a serialized string, found {}",
                kind_of(&other)
            ))),
        }
    }
}

impl fmt::Debug for Deserializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Deserializer::Json => f.write_str("Json"),
            Deserializer::Custom(_) => f.write_str("Custom"),
            Deserializer::Disabled => f.write_str("Disabled"),
        }
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
