/*
    store.rs - The local replica

    Per-collection maps of decoded models plus the highest applied
    version. Reads are public; every mutation is crate-private and only
    reached through UpdateCoordinator::commit, which runs without yielding,
    so readers never observe a half-applied batch.

    Persistence (durable local storage):
        DS:DS             { collection: [wire record, ...] }
        DS:maxChangeId    applied version
        DS:schemaVersion  server schema the cache was built against
        lastUserLoggedIn  user the cache belongs to
*/

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::errors::{Result, StorageError};
use super::registry::{DecoderRegistry, Model};
use super::storage::{self, LocalStorage};
use super::types::{RecordId, Version};

pub const STORE_KEY: &str = "DS:DS";
pub const VERSION_KEY: &str = "DS:maxChangeId";
pub const SCHEMA_KEY: &str = "DS:schemaVersion";
pub const USER_KEY: &str = "lastUserLoggedIn";

/// Store-wide notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEvent {
    /// A commit finished; the store is at `version`
    Modified { version: Version },
    /// Store and cache were wiped
    Cleared,
}

type Collection = BTreeMap<RecordId, Arc<dyn Model>>;

#[derive(Default)]
struct StoreState {
    collections: BTreeMap<String, Collection>,
    version: Version,
}

/// In-memory replica with a persisted cache
pub struct ReplicatedStore {
    state: RwLock<StoreState>,
    storage: Arc<dyn LocalStorage>,
    events: broadcast::Sender<StoreEvent>,
}

impl fmt::Debug for ReplicatedStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("ReplicatedStore")
            .field("version", &state.version)
            .field("collections", &state.collections.len())
            .finish_non_exhaustive()
    }
}

impl ReplicatedStore {
    pub fn new(storage: Arc<dyn LocalStorage>, event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            state: RwLock::new(StoreState::default()),
            storage,
            events,
        }
    }

    pub fn storage(&self) -> &Arc<dyn LocalStorage> {
        &self.storage
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub fn version(&self) -> Version {
        self.state.read().version
    }

    /// Typed lookup.
    pub fn get<T: Model + Clone>(&self, collection: &str, id: RecordId) -> Option<T> {
        self.get_raw(collection, id)
            .and_then(|model| model.as_any().downcast_ref::<T>().cloned())
    }

    pub fn get_raw(&self, collection: &str, id: RecordId) -> Option<Arc<dyn Model>> {
        self.state
            .read()
            .collections
            .get(collection)
            .and_then(|records| records.get(&id))
            .cloned()
    }

    /// Models for the given ids, skipping unknown ones.
    pub fn get_many(&self, collection: &str, ids: &[RecordId]) -> Vec<Arc<dyn Model>> {
        let state = self.state.read();
        let Some(records) = state.collections.get(collection) else {
            return Vec::new();
        };
        ids.iter().filter_map(|id| records.get(id).cloned()).collect()
    }

    /// All models of a collection, ordered by id.
    pub fn get_all(&self, collection: &str) -> Vec<Arc<dyn Model>> {
        self.state
            .read()
            .collections
            .get(collection)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn filter<F>(&self, collection: &str, predicate: F) -> Vec<Arc<dyn Model>>
    where
        F: Fn(&dyn Model) -> bool,
    {
        self.state
            .read()
            .collections
            .get(collection)
            .map(|records| {
                records
                    .values()
                    .filter(|model| predicate(model.as_ref()))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self, collection: &str) -> usize {
        self.state
            .read()
            .collections
            .get(collection)
            .map_or(0, BTreeMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().collections.values().all(BTreeMap::is_empty)
    }

    /// Names of collections holding at least one model.
    pub fn collections(&self) -> Vec<String> {
        self.state
            .read()
            .collections
            .iter()
            .filter(|(_, records)| !records.is_empty())
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub(crate) fn remove(&self, collection: &str, id: RecordId) -> Option<Arc<dyn Model>> {
        self.state
            .write()
            .collections
            .get_mut(collection)
            .and_then(|records| records.remove(&id))
    }

    pub(crate) fn upsert(&self, collection: &str, model: Arc<dyn Model>) {
        self.state
            .write()
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(model.id(), model);
    }

    /// Replace every collection at once.
    pub(crate) fn replace_all(&self, collections: BTreeMap<String, Vec<Arc<dyn Model>>>) {
        let collections = collections
            .into_iter()
            .map(|(name, models)| {
                let records: Collection = models.into_iter().map(|m| (m.id(), m)).collect();
                (name, records)
            })
            .collect();
        self.state.write().collections = collections;
    }

    pub(crate) fn set_version(&self, version: Version) {
        self.state.write().version = version;
    }

    pub(crate) fn notify(&self, event: StoreEvent) {
        // no receivers is fine
        let _ = self.events.send(event);
    }

    fn snapshot(&self) -> BTreeMap<String, Vec<Value>> {
        self.state
            .read()
            .collections
            .iter()
            .map(|(name, records)| {
                (
                    name.clone(),
                    records.values().map(|model| model.to_json()).collect(),
                )
            })
            .collect()
    }

    /// Persist the snapshot and `version`.
    pub async fn flush_to_storage(&self, version: Version) -> Result<()> {
        let snapshot = self.snapshot();
        storage::store(self.storage.as_ref(), STORE_KEY, &snapshot).await?;
        storage::store(self.storage.as_ref(), VERSION_KEY, &version).await?;
        debug!(version, collections = snapshot.len(), "store persisted");
        Ok(())
    }

    /// Restore from the cache. Any unreadable entry discards the whole
    /// cache and leaves the store empty at version 0.
    pub async fn init_from_storage(&self, registry: &DecoderRegistry) -> Result<Version> {
        match self.load_cache(registry).await {
            Ok(Some((collections, version))) => {
                self.replace_all(collections);
                self.set_version(version);
                info!(version, "store restored from cache");
                Ok(version)
            }
            Ok(None) => {
                debug!("no cached store");
                Ok(0)
            }
            Err(e) => {
                warn!(error = %e, "cached store unusable, clearing");
                self.clear().await?;
                Ok(0)
            }
        }
    }

    async fn load_cache(
        &self,
        registry: &DecoderRegistry,
    ) -> Result<Option<(BTreeMap<String, Vec<Arc<dyn Model>>>, Version)>> {
        let storage = self.storage.as_ref();
        let Some(version) = storage::load::<Version>(storage, VERSION_KEY).await? else {
            return Ok(None);
        };
        let snapshot: BTreeMap<String, Vec<Value>> = storage::load(storage, STORE_KEY)
            .await?
            .ok_or_else(|| StorageError::Serialization("version without snapshot".to_string()))?;

        let mut collections = BTreeMap::new();
        for (name, values) in snapshot {
            let models = values
                .iter()
                .map(|value| registry.decode(&name, value))
                .collect::<Result<Vec<_>>>()?;
            collections.insert(name, models);
        }
        Ok(Some((collections, version)))
    }

    /// Wipe memory and cache.
    pub async fn clear(&self) -> Result<()> {
        {
            let mut state = self.state.write();
            state.collections.clear();
            state.version = 0;
        }
        self.storage.clear().await?;
        self.notify(StoreEvent::Cleared);
        info!("store cleared");
        Ok(())
    }
}
