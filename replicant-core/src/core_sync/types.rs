/*
    types.rs - Wire and bookkeeping types for incremental updates

    An incremental update is either a delta between two change ids or a
    complete snapshot of the server state. Records travel as opaque JSON
    objects; the only field this layer looks at is `id`.
*/

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Monotonically increasing identifier of a store state ("change id").
pub type Version = u64;

/// Identifier of a record inside its collection.
pub type RecordId = u64;

/// Record ids grouped by collection name.
pub type CollectionIds = BTreeMap<String, Vec<RecordId>>;

/// Extract the `id` field of a wire record.
pub fn record_id(record: &Value) -> Option<RecordId> {
    record.get("id").and_then(Value::as_u64)
}

/// One message of the update protocol.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IncrementalUpdate {
    /// Created or modified records, per collection
    #[serde(default)]
    pub changed: BTreeMap<String, Vec<Value>>,

    /// Ids of removed records, per collection
    #[serde(default)]
    pub deleted: BTreeMap<String, Vec<RecordId>>,

    /// First change id covered by this delta
    #[serde(rename = "from_change_id", default)]
    pub from_version: Version,

    /// Change id the store is at after applying this update
    #[serde(rename = "to_change_id", default)]
    pub to_version: Version,

    /// Complete replacement of the store instead of a delta
    #[serde(rename = "all_data", default)]
    pub full: bool,
}

impl IncrementalUpdate {
    /// An empty delta covering `from..=to`.
    pub fn delta(from_version: Version, to_version: Version) -> Self {
        Self {
            from_version,
            to_version,
            ..Default::default()
        }
    }

    /// An empty full snapshot declaring `version` as the new store version.
    pub fn snapshot(version: Version) -> Self {
        Self {
            from_version: 0,
            to_version: version,
            full: true,
            ..Default::default()
        }
    }

    /// Builder: add a changed record.
    pub fn with_changed(mut self, collection: impl Into<String>, record: Value) -> Self {
        self.changed.entry(collection.into()).or_default().push(record);
        self
    }

    /// Builder: add a deleted record id.
    pub fn with_deleted(mut self, collection: impl Into<String>, id: RecordId) -> Self {
        self.deleted.entry(collection.into()).or_default().push(id);
        self
    }

    /// Classify this update against the store's current version.
    ///
    /// Full updates are always continuous; they are not subject to the
    /// version check.
    pub fn continuity(&self, current: Version) -> Continuity {
        if self.full {
            return Continuity::Continuous;
        }
        if self.to_version <= current {
            Continuity::Stale
        } else if self.from_version <= current.saturating_add(1) {
            Continuity::Continuous
        } else {
            Continuity::Gap
        }
    }

    /// Whether the update carries neither changes nor deletions.
    pub fn is_empty(&self) -> bool {
        self.changed.values().all(Vec::is_empty) && self.deleted.values().all(Vec::is_empty)
    }

    /// Total number of changed records over all collections.
    pub fn changed_count(&self) -> usize {
        self.changed.values().map(Vec::len).sum()
    }

    /// Total number of deleted ids over all collections.
    pub fn deleted_count(&self) -> usize {
        self.deleted.values().map(Vec::len).sum()
    }
}

/// Result of checking an update against the store version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuity {
    /// Entirely behind the store, drop silently
    Stale,
    /// Applies on top of the store
    Continuous,
    /// Starts after a change the store never saw
    Gap,
}

impl fmt::Display for Continuity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Continuity::Stale => write!(f, "stale"),
            Continuity::Continuous => write!(f, "continuous"),
            Continuity::Gap => write!(f, "gap"),
        }
    }
}
