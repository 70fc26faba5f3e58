/*
    coordinator.rs - Serialized, two-phase commits to the store

    acquire_slot() hands out at most one open UpdateSlot at a time; further
    callers wait in FIFO order. The slot collects deletions and changed
    models, then commit() applies them:

    Phase 1, per collection: delete by id, then upsert by id. Dependents
    hear about both (deleted_models / changed_models). Deleting before
    upserting means an id deleted and recreated in one batch ends up
    present.

    Phase 2: every dependent recomputes derived state with the full map of
    changed ids, since a change in one collection can affect another.

    Then StoreEvent::Modified fires and the next waiter gets its slot.
    Nothing in commit awaits, so no reader sees a half-applied batch.
*/

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, trace};

use super::errors::{Result, SyncError};
use super::mutex::{FifoGuard, FifoMutex};
use super::registry::Model;
use super::store::{ReplicatedStore, StoreEvent};
use super::types::{CollectionIds, RecordId, Version};
use crate::metrics::{Timer, COMMIT_DURATION};

/// Slot ids are unique per process, so a slot can never be mistaken for
/// one of another coordinator.
static NEXT_SLOT_ID: AtomicU64 = AtomicU64::new(1);

/// Derived state that has to follow store changes
pub trait Dependent: Send + Sync {
    fn deleted_models(&self, _collection: &str, _ids: &[RecordId]) {}

    fn changed_models(&self, _collection: &str, _models: &[Arc<dyn Model>]) {}

    /// Second phase, once per commit with every changed id.
    fn recompute(&self, _changed: &CollectionIds) {}

    /// Drop cached state ahead of a full resync.
    fn reset(&self) {}
}

/// Outcome of one commit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommitSummary {
    pub slot: u64,
    pub version: Version,
    pub deleted: usize,
    pub changed: usize,
    pub full: bool,
}

/// Exclusive batch for one commit. Dropping it uncommitted releases it.
pub struct UpdateSlot {
    id: u64,
    deleted: BTreeMap<String, Vec<RecordId>>,
    changed: BTreeMap<String, Vec<Arc<dyn Model>>>,
    replace_all: bool,
    open: Arc<Mutex<Option<u64>>>,
    _guard: FifoGuard,
}

impl fmt::Debug for UpdateSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateSlot")
            .field("id", &self.id)
            .field("deleted", &self.deleted)
            .field("changed", &self.changed.values().map(Vec::len).sum::<usize>())
            .field("replace_all", &self.replace_all)
            .finish()
    }
}

impl UpdateSlot {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn delete(&mut self, collection: &str, ids: impl IntoIterator<Item = RecordId>) {
        self.deleted
            .entry(collection.to_string())
            .or_default()
            .extend(ids);
    }

    pub fn change(&mut self, collection: &str, models: impl IntoIterator<Item = Arc<dyn Model>>) {
        self.changed
            .entry(collection.to_string())
            .or_default()
            .extend(models);
    }

    /// Turn this slot into a full replacement of the store.
    pub fn replace_all(&mut self, collections: BTreeMap<String, Vec<Arc<dyn Model>>>) {
        self.replace_all = true;
        self.deleted.clear();
        self.changed = collections;
    }

    pub fn is_replace_all(&self) -> bool {
        self.replace_all
    }

    pub fn is_empty(&self) -> bool {
        !self.replace_all
            && self.deleted.values().all(Vec::is_empty)
            && self.changed.values().all(Vec::is_empty)
    }

    fn changed_ids(&self) -> CollectionIds {
        self.changed
            .iter()
            .filter(|(_, models)| !models.is_empty())
            .map(|(name, models)| (name.clone(), models.iter().map(|m| m.id()).collect()))
            .collect()
    }
}

impl Drop for UpdateSlot {
    fn drop(&mut self) {
        let mut open = self.open.lock();
        if *open == Some(self.id) {
            trace!(slot = self.id, "slot dropped without commit");
            *open = None;
        }
        // the guard field is dropped next and serves the next waiter
    }
}

/// Hands out update slots and commits them
pub struct UpdateCoordinator {
    store: Arc<ReplicatedStore>,
    queue: FifoMutex,
    open: Arc<Mutex<Option<u64>>>,
    dependents: RwLock<Vec<Arc<dyn Dependent>>>,
}

impl fmt::Debug for UpdateCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateCoordinator")
            .field("open_slot", &*self.open.lock())
            .field("waiting", &self.queue.waiting())
            .field("dependents", &self.dependents.read().len())
            .finish()
    }
}

impl UpdateCoordinator {
    pub fn new(store: Arc<ReplicatedStore>) -> Self {
        Self {
            store,
            queue: FifoMutex::new(),
            open: Arc::new(Mutex::new(None)),
            dependents: RwLock::new(Vec::new()),
        }
    }

    pub fn store(&self) -> &Arc<ReplicatedStore> {
        &self.store
    }

    pub fn register_dependent(&self, dependent: Arc<dyn Dependent>) {
        self.dependents.write().push(dependent);
    }

    /// Id of the open slot, if any.
    pub fn open_slot(&self) -> Option<u64> {
        *self.open.lock()
    }

    /// Number of callers waiting for a slot.
    pub fn waiting(&self) -> usize {
        self.queue.waiting()
    }

    /// Wait for the exclusive slot.
    pub async fn acquire_slot(&self) -> UpdateSlot {
        let guard = self.queue.lock().await;
        let id = NEXT_SLOT_ID.fetch_add(1, Ordering::SeqCst);
        *self.open.lock() = Some(id);
        trace!(slot = id, "slot acquired");
        UpdateSlot {
            id,
            deleted: BTreeMap::new(),
            changed: BTreeMap::new(),
            replace_all: false,
            open: self.open.clone(),
            _guard: guard,
        }
    }

    /// Apply `slot` and bring the store to `version`. With `resync` the
    /// dependents' caches are reset first.
    pub fn commit(&self, slot: UpdateSlot, version: Version, resync: bool) -> Result<CommitSummary> {
        let open = *self.open.lock();
        if open != Some(slot.id) {
            error!(slot = slot.id, ?open, "commit of a slot that is not open");
            return Err(SyncError::ProtocolMisuse(format!(
                "slot {} is not the open update slot",
                slot.id
            )));
        }

        let timer = Timer::new(COMMIT_DURATION);
        let dependents = self.dependents.read().clone();
        if resync {
            for dependent in &dependents {
                dependent.reset();
            }
        }

        let mut summary = CommitSummary {
            slot: slot.id,
            version,
            full: slot.replace_all,
            ..Default::default()
        };
        let changed_ids = slot.changed_ids();

        // Phase 1
        if slot.replace_all {
            summary.changed = slot.changed.values().map(Vec::len).sum();
            self.store.replace_all(slot.changed.clone());
            for (collection, models) in &slot.changed {
                for dependent in &dependents {
                    dependent.changed_models(collection, models);
                }
            }
        } else {
            let collections: BTreeSet<&String> =
                slot.deleted.keys().chain(slot.changed.keys()).collect();
            for collection in collections {
                if let Some(ids) = slot.deleted.get(collection) {
                    summary.deleted += ids
                        .iter()
                        .filter(|id| self.store.remove(collection, **id).is_some())
                        .count();
                    for dependent in &dependents {
                        dependent.deleted_models(collection, ids);
                    }
                }
                if let Some(models) = slot.changed.get(collection) {
                    for model in models {
                        self.store.upsert(collection, model.clone());
                    }
                    summary.changed += models.len();
                    for dependent in &dependents {
                        dependent.changed_models(collection, models);
                    }
                }
            }
        }

        // Phase 2
        for dependent in &dependents {
            dependent.recompute(&changed_ids);
        }

        self.store.set_version(version);
        *self.open.lock() = None;
        self.store.notify(StoreEvent::Modified { version });
        timer.stop();

        debug!(
            slot = summary.slot,
            version,
            deleted = summary.deleted,
            changed = summary.changed,
            full = summary.full,
            "slot committed"
        );
        // dropping the slot releases the queue
        drop(slot);
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_sync::registry::JsonRecord;
    use crate::core_sync::storage::MemoryStorage;
    use crate::test_utils::fixtures::RecordingDependent;
    use serde_json::json;
    use std::time::Duration;

    fn coordinator() -> UpdateCoordinator {
        let store = Arc::new(ReplicatedStore::new(Arc::new(MemoryStorage::new()), 8));
        UpdateCoordinator::new(store)
    }

    fn user(id: u64, name: &str) -> Arc<dyn Model> {
        Arc::new(JsonRecord::from_value(json!({"id": id, "name": name})).unwrap())
    }

    #[tokio::test]
    async fn test_delete_then_recreate_in_one_commit() {
        let coordinator = coordinator();
        let mut slot = coordinator.acquire_slot().await;
        slot.change("users", [user(7, "old")]);
        coordinator.commit(slot, 1, false).unwrap();

        let mut slot = coordinator.acquire_slot().await;
        slot.delete("users", [7]);
        slot.change("users", [user(7, "new")]);
        let summary = coordinator.commit(slot, 2, false).unwrap();

        assert_eq!(summary.deleted, 1);
        assert_eq!(summary.changed, 1);
        let model = coordinator.store().get_raw("users", 7).unwrap();
        assert_eq!(model.to_json()["name"], "new");
        assert_eq!(coordinator.store().version(), 2);
    }

    #[tokio::test]
    async fn test_dependents_notified_in_two_phases() {
        let coordinator = coordinator();
        let dependent = Arc::new(RecordingDependent::default());
        coordinator.register_dependent(dependent.clone());

        let mut slot = coordinator.acquire_slot().await;
        slot.delete("groups", [3]);
        slot.change("users", [user(1, "a"), user(2, "b")]);
        coordinator.commit(slot, 5, false).unwrap();

        assert_eq!(
            dependent.calls(),
            vec![
                "deleted groups [3]".to_string(),
                "changed users [1, 2]".to_string(),
                "recompute {\"users\": [1, 2]}".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_resync_resets_and_replaces() {
        let coordinator = coordinator();
        let dependent = Arc::new(RecordingDependent::default());
        coordinator.register_dependent(dependent.clone());

        let mut slot = coordinator.acquire_slot().await;
        slot.change("users", [user(1, "a")]);
        coordinator.commit(slot, 1, false).unwrap();

        let mut slot = coordinator.acquire_slot().await;
        let mut all = BTreeMap::new();
        all.insert("groups".to_string(), vec![user(9, "g")]);
        slot.replace_all(all);
        let summary = coordinator.commit(slot, 40, true).unwrap();

        assert!(summary.full);
        assert!(coordinator.store().get_raw("users", 1).is_none());
        assert!(coordinator.store().get_raw("groups", 9).is_some());
        assert_eq!(coordinator.store().version(), 40);
        assert!(dependent.calls().contains(&"reset".to_string()));
    }

    #[tokio::test]
    async fn test_modified_event_after_commit() {
        let coordinator = coordinator();
        let mut events = coordinator.store().subscribe();
        let slot = coordinator.acquire_slot().await;
        coordinator.commit(slot, 3, false).unwrap();
        assert_eq!(events.recv().await.unwrap(), StoreEvent::Modified { version: 3 });
    }

    #[tokio::test]
    async fn test_foreign_slot_is_misuse() {
        let a = coordinator();
        let b = coordinator();
        let foreign = b.acquire_slot().await;
        let own = a.acquire_slot().await;

        assert!(matches!(a.commit(foreign, 1, false), Err(SyncError::ProtocolMisuse(_))));
        // the foreign slot was released on its own coordinator
        assert!(b.open_slot().is_none());
        assert_eq!(a.store().version(), 0);
        a.commit(own, 1, false).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_slot_waits_for_commit() {
        let coordinator = Arc::new(coordinator());
        let slot = coordinator.acquire_slot().await;

        let waiter = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                let slot = coordinator.acquire_slot().await;
                coordinator.commit(slot, 2, false).unwrap()
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(coordinator.waiting(), 1);

        coordinator.commit(slot, 1, false).unwrap();
        let summary = waiter.await.unwrap();
        assert_eq!(summary.version, 2);
    }

    #[tokio::test]
    async fn test_dropped_slot_releases() {
        let coordinator = coordinator();
        let slot = coordinator.acquire_slot().await;
        let id = slot.id();
        assert_eq!(coordinator.open_slot(), Some(id));
        drop(slot);
        assert!(coordinator.open_slot().is_none());

        let slot = coordinator.acquire_slot().await;
        assert!(slot.id() > id);
    }
}
