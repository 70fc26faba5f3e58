/*
    registry.rs - Collection name to decoder mapping

    Wire records are decoded into models by the decoder registered for
    their collection. An unknown collection, or a record its decoder
    rejects, is logged and dropped; the rest of the batch still applies.
*/

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

use super::errors::{Result, SyncError};
use super::types::{record_id, RecordId};
use crate::metrics::{self, DECODE_DROPPED};

/// A decoded record held by the store
pub trait Model: Send + Sync + fmt::Debug + 'static {
    fn id(&self) -> RecordId;

    /// Wire representation, used for the persisted cache.
    fn to_json(&self) -> Value;

    fn as_any(&self) -> &dyn Any;
}

/// Typed record with a serde wire format. Every `Record` is a [`Model`].
pub trait Record: Serialize + DeserializeOwned + Send + Sync + fmt::Debug + 'static {
    fn id(&self) -> RecordId;
}

impl<T: Record> Model for T {
    fn id(&self) -> RecordId {
        Record::id(self)
    }

    fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Schemaless record, kept as received
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRecord {
    id: RecordId,
    data: Value,
}

impl JsonRecord {
    /// `None` if the value has no numeric `id`.
    pub fn from_value(data: Value) -> Option<Self> {
        record_id(&data).map(|id| Self { id, data })
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.data.get(name)
    }
}

impl Model for JsonRecord {
    fn id(&self) -> RecordId {
        self.id
    }

    fn to_json(&self) -> Value {
        self.data.clone()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Decoder for one collection
pub type Decoder = Arc<dyn Fn(&Value) -> Result<Arc<dyn Model>> + Send + Sync>;

/// Typed map from collection name to decoder
#[derive(Clone, Default)]
pub struct DecoderRegistry {
    decoders: HashMap<String, Decoder>,
}

impl fmt::Debug for DecoderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.decoders.keys().collect();
        names.sort();
        f.debug_struct("DecoderRegistry")
            .field("collections", &names)
            .finish()
    }
}

impl DecoderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `collection` records with serde into `T`.
    pub fn register<T: Record>(&mut self, collection: impl Into<String>) -> &mut Self {
        self.register_with(collection, |value| {
            let record: T = serde_json::from_value(value.clone())?;
            Ok(Arc::new(record) as Arc<dyn Model>)
        })
    }

    pub fn register_with<F>(&mut self, collection: impl Into<String>, decoder: F) -> &mut Self
    where
        F: Fn(&Value) -> Result<Arc<dyn Model>> + Send + Sync + 'static,
    {
        self.decoders.insert(collection.into(), Arc::new(decoder));
        self
    }

    /// Keep `collection` records as [`JsonRecord`]s.
    pub fn register_json(&mut self, collection: impl Into<String>) -> &mut Self {
        self.register_with(collection, |value| {
            JsonRecord::from_value(value.clone())
                .map(|record| Arc::new(record) as Arc<dyn Model>)
                .ok_or_else(|| SyncError::Decode("record without numeric id".to_string()))
        })
    }

    pub fn is_registered(&self, collection: &str) -> bool {
        self.decoders.contains_key(collection)
    }

    pub fn collections(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.decoders.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Strict decode of one record.
    pub fn decode(&self, collection: &str, value: &Value) -> Result<Arc<dyn Model>> {
        let decoder = self
            .decoders
            .get(collection)
            .ok_or_else(|| SyncError::Decode(format!("unknown collection {}", collection)))?;
        decoder(value)
    }

    /// Lenient decode of a batch: unknown collections and bad records are
    /// logged and dropped.
    pub fn decode_many(&self, collection: &str, values: &[Value]) -> Vec<Arc<dyn Model>> {
        let Some(decoder) = self.decoders.get(collection) else {
            if !values.is_empty() {
                warn!(collection, dropped = values.len(), "no decoder for collection");
                metrics::record_counter(DECODE_DROPPED, values.len() as u64);
            }
            return Vec::new();
        };

        values
            .iter()
            .filter_map(|value| match decoder(value) {
                Ok(model) => Some(model),
                Err(e) => {
                    warn!(collection, id = ?record_id(value), error = %e, "dropping undecodable record");
                    metrics::record_counter(DECODE_DROPPED, 1);
                    None
                }
            })
            .collect()
    }
}
