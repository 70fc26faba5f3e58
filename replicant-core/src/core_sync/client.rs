/*
    client.rs - Top-level synchronization policy

    SyncContext is built once at startup and owns every component. SyncClient
    drives them:

        stream ─► handler ─► ThrottleGate ─► driver ─► apply ─► coordinator
                                               ▲
                         resync requests ──────┘ (get_elements)

    apply(update), serialized by a FIFO lock:
    - full       -> replace the store, commit with resync, persist
    - stale      -> dropped
    - gap        -> one ResyncRequest::Since(version), nothing applied
    - continuous -> delete then upsert, commit, persist

    inject(update) skips the continuity check for updates known to be
    authoritative but still goes through the same lock.
*/

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::connection::{ConnectionManager, MessageHandler, ParamsFn, RetryPolicy, StreamSubscription};
use super::coordinator::{CommitSummary, UpdateCoordinator};
use super::errors::{Result, SyncError};
use super::latest::Latest;
use super::mutex::FifoMutex;
use super::registry::DecoderRegistry;
use super::session::{Connectivity, Session};
use super::storage::{self, LocalStorage};
use super::store::{ReplicatedStore, SCHEMA_KEY, USER_KEY};
use super::throttle::ThrottleGate;
use super::transport::{StreamTransport, SyncBackend};
use super::types::{Continuity, IncrementalUpdate, Version};
use crate::config::Config;
use crate::metrics::{self, FULL_RESYNCS, UPDATES_APPLIED, UPDATES_GAP, UPDATES_STALE};

/// Recovery the client asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncRequest {
    /// Everything after this version
    Since(Version),
    /// Complete snapshot
    Full,
}

/// What `apply` did with an update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied(CommitSummary),
    Stale,
    Gap,
}

/// Result of `bootstrap`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootstrapOutcome {
    /// Version restored from the cache, 0 if none
    pub version: Version,
    /// The cache belonged to another user or schema and was dropped
    pub cache_cleared: bool,
}

/// Every component of the subsystem, constructed once
pub struct SyncContext {
    pub store: Arc<ReplicatedStore>,
    pub coordinator: Arc<UpdateCoordinator>,
    pub registry: Arc<DecoderRegistry>,
    pub connections: ConnectionManager,
    pub throttle: ThrottleGate,
    pub backend: Arc<dyn SyncBackend>,
    pub session: Arc<Session>,
    pub stream_path: String,
    updates: Mutex<Option<mpsc::UnboundedReceiver<IncrementalUpdate>>>,
}

impl fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncContext")
            .field("store", &self.store)
            .field("connections", &self.connections)
            .field("throttle", &self.throttle)
            .field("stream_path", &self.stream_path)
            .finish_non_exhaustive()
    }
}

impl SyncContext {
    /// `throttle_delay` is final for the lifetime of the context.
    pub fn new(
        config: &Config,
        transport: Arc<dyn StreamTransport>,
        backend: Arc<dyn SyncBackend>,
        storage: Arc<dyn LocalStorage>,
        registry: DecoderRegistry,
        session: Arc<Session>,
        throttle_delay: Duration,
    ) -> Self {
        let capacity = config.sync.event_capacity;
        let store = Arc::new(ReplicatedStore::new(storage, capacity));
        let coordinator = Arc::new(UpdateCoordinator::new(store.clone()));
        let connections = ConnectionManager::new(
            transport,
            backend.clone(),
            session.clone(),
            RetryPolicy::from_config(&config.sync),
            capacity,
        );
        let (throttle, updates) = ThrottleGate::new(throttle_delay);

        Self {
            store,
            coordinator,
            registry: Arc::new(registry),
            connections,
            throttle,
            backend,
            session,
            stream_path: config.server.stream_path.clone(),
            updates: Mutex::new(Some(updates)),
        }
    }
}

struct ClientInner {
    ctx: SyncContext,
    apply_lock: FifoMutex,
    last_full: AtomicBool,
    resync_tx: mpsc::UnboundedSender<ResyncRequest>,
    resync_rx: Mutex<Option<mpsc::UnboundedReceiver<ResyncRequest>>>,
    subscription: Mutex<Option<StreamSubscription>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.get_mut().take() {
            subscription.close();
        }
        if let Some(driver) = self.driver.get_mut().take() {
            driver.abort();
        }
    }
}

/// Keeps the local replica in sync with the server
#[derive(Clone)]
pub struct SyncClient {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncClient")
            .field("version", &self.inner.ctx.store.version())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl SyncClient {
    pub fn new(ctx: SyncContext) -> Self {
        let (resync_tx, resync_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(ClientInner {
                ctx,
                apply_lock: FifoMutex::new(),
                last_full: AtomicBool::new(false),
                resync_tx,
                resync_rx: Mutex::new(Some(resync_rx)),
                subscription: Mutex::new(None),
                driver: Mutex::new(None),
            }),
        }
    }

    pub fn context(&self) -> &SyncContext {
        &self.inner.ctx
    }

    pub fn store(&self) -> &Arc<ReplicatedStore> {
        &self.inner.ctx.store
    }

    pub fn connectivity(&self) -> &Latest<Connectivity> {
        self.inner.ctx.connections.connectivity()
    }

    pub fn is_running(&self) -> bool {
        self.inner.subscription.lock().is_some()
    }

    /// Take the resync request receiver. Requests taken this way are no
    /// longer resolved by the driver started in `start`.
    pub fn resync_requests(&self) -> Option<mpsc::UnboundedReceiver<ResyncRequest>> {
        self.inner.resync_rx.lock().take()
    }

    /// Restore the cached replica for `user`. The cache is dropped if it
    /// belongs to another user or the server schema changed since it was
    /// written.
    pub async fn bootstrap(&self, user: Option<u64>) -> Result<BootstrapOutcome> {
        let ctx = &self.inner.ctx;
        ctx.session.set_user(user);
        let storage = ctx.store.storage().as_ref();

        let stored_user: Option<Option<u64>> = storage::load(storage, USER_KEY).await?;
        let cached_schema: Option<String> = storage::load(storage, SCHEMA_KEY).await?;
        let server_schema = match ctx.backend.schema_version().await {
            Ok(schema) => Some(schema),
            Err(e) => {
                warn!(error = %e, "schema version unavailable, trusting cache");
                None
            }
        };

        let same_user = stored_user == Some(user);
        let same_schema = server_schema
            .as_ref()
            .map_or(true, |schema| cached_schema.as_ref() == Some(schema));

        if same_user && same_schema {
            let version = ctx.store.init_from_storage(&ctx.registry).await?;
            return Ok(BootstrapOutcome {
                version,
                cache_cleared: false,
            });
        }

        info!(same_user, same_schema, "discarding cached store");
        ctx.store.clear().await?;
        storage::store(storage, USER_KEY, &user).await?;
        if let Some(schema) = &server_schema {
            storage::store(storage, SCHEMA_KEY, schema).await?;
        }
        Ok(BootstrapOutcome {
            version: 0,
            cache_cleared: true,
        })
    }

    /// Start communication and stream updates into the store.
    pub async fn start(&self) -> Result<()> {
        let ctx = &self.inner.ctx;
        ctx.connections.start_communication()?;
        self.spawn_driver();

        let throttle = ctx.throttle.clone();
        let handler: MessageHandler = Arc::new(move |value: Value| {
            match serde_json::from_value::<IncrementalUpdate>(value) {
                Ok(update) => throttle.new_update(update),
                Err(e) => warn!(error = %e, "ignoring malformed update message"),
            }
        });
        let store = ctx.store.clone();
        let params_fn: ParamsFn =
            Arc::new(move || vec![("change_id".to_string(), store.version().to_string())]);

        let subscription = ctx
            .connections
            .subscribe(ctx.stream_path.clone(), handler, params_fn);
        if let Some(previous) = self.inner.subscription.lock().replace(subscription) {
            previous.close();
        }
        info!(version = ctx.store.version(), "sync started");
        Ok(())
    }

    /// Close the stream and drop queued updates.
    pub fn stop(&self) {
        let ctx = &self.inner.ctx;
        if let Some(subscription) = self.inner.subscription.lock().take() {
            subscription.close();
        }
        ctx.connections.close_connections();
        ctx.throttle.discard();
        info!("sync stopped");
    }

    fn spawn_driver(&self) {
        let mut driver = self.inner.driver.lock();
        if driver.is_some() {
            return;
        }
        let Some(updates) = self.inner.ctx.updates.lock().take() else {
            return;
        };
        let resyncs = self.inner.resync_rx.lock().take();
        let weak = Arc::downgrade(&self.inner);
        *driver = Some(tokio::spawn(run_driver(weak, updates, resyncs)));
    }

    /// Apply one update under the continuity rules.
    pub async fn apply(&self, update: IncrementalUpdate) -> Result<ApplyOutcome> {
        let _guard = self.inner.apply_lock.lock().await;
        self.apply_locked(update, true).await
    }

    /// Apply without the continuity check.
    pub async fn inject(&self, update: IncrementalUpdate) -> Result<ApplyOutcome> {
        let _guard = self.inner.apply_lock.lock().await;
        self.apply_locked(update, false).await
    }

    async fn apply_locked(&self, update: IncrementalUpdate, check: bool) -> Result<ApplyOutcome> {
        let ctx = &self.inner.ctx;
        // tracks the last received update, stale and gap ones included
        self.inner.last_full.store(update.full, Ordering::SeqCst);
        if update.full {
            return self.apply_full(update).await;
        }

        let current = ctx.store.version();
        if check {
            match update.continuity(current) {
                Continuity::Stale => {
                    trace!(current, to = update.to_version, "dropping stale update");
                    metrics::record_counter(UPDATES_STALE, 1);
                    return Ok(ApplyOutcome::Stale);
                }
                Continuity::Gap => {
                    warn!(current, from = update.from_version, "gap detected, requesting resync");
                    metrics::record_counter(UPDATES_GAP, 1);
                    if self.inner.resync_tx.send(ResyncRequest::Since(current)).is_err() {
                        debug!("resync receiver gone");
                    }
                    return Ok(ApplyOutcome::Gap);
                }
                Continuity::Continuous => {}
            }
        }

        let mut slot = ctx.coordinator.acquire_slot().await;
        for (collection, ids) in &update.deleted {
            slot.delete(collection, ids.iter().copied());
        }
        for (collection, records) in &update.changed {
            slot.change(collection, ctx.registry.decode_many(collection, records));
        }

        // an injected update never moves the version backwards
        let version = if check {
            update.to_version
        } else {
            current.max(update.to_version)
        };
        let summary = ctx.coordinator.commit(slot, version, false)?;
        metrics::record_counter(UPDATES_APPLIED, 1);
        self.persist(version).await;
        Ok(ApplyOutcome::Applied(summary))
    }

    async fn apply_full(&self, update: IncrementalUpdate) -> Result<ApplyOutcome> {
        let ctx = &self.inner.ctx;
        let mut slot = ctx.coordinator.acquire_slot().await;
        let collections: BTreeMap<_, _> = update
            .changed
            .iter()
            .map(|(collection, records)| {
                (collection.clone(), ctx.registry.decode_many(collection, records))
            })
            .collect();
        slot.replace_all(collections);

        let summary = ctx.coordinator.commit(slot, update.to_version, true)?;
        metrics::record_counter(FULL_RESYNCS, 1);
        info!(version = update.to_version, records = summary.changed, "full update applied");
        self.persist(update.to_version).await;
        Ok(ApplyOutcome::Applied(summary))
    }

    async fn persist(&self, version: Version) {
        // the store stays authoritative in memory, a failed write only
        // costs a resync after restart
        if let Err(e) = self.inner.ctx.store.flush_to_storage(version).await {
            warn!(version, error = %e, "persisting store failed");
        }
    }

    /// Replace the store with a fresh snapshot. Returns `false` when
    /// skipped because the last applied update already was one.
    pub async fn request_full_resync(&self) -> Result<bool> {
        if self.inner.last_full.load(Ordering::SeqCst) {
            debug!("last update was complete, skipping full resync");
            return Ok(false);
        }
        let update = self.inner.ctx.backend.get_elements(None).await?;
        if !update.full {
            warn!("snapshot request answered with a delta");
        }
        self.apply(update).await?;
        Ok(true)
    }

    async fn resolve(&self, request: ResyncRequest) -> Result<()> {
        match request {
            ResyncRequest::Full => {
                self.request_full_resync().await?;
            }
            ResyncRequest::Since(version) => {
                // the store may have moved on since the request was queued
                let current = self.inner.ctx.store.version();
                debug!(requested = version, current, "resolving resync");
                match self.inner.ctx.backend.get_elements(Some(current)).await {
                    Ok(update) => {
                        self.apply(update).await?;
                    }
                    Err(SyncError::VersionTooOld(_)) => {
                        info!(current, "server cannot replay, full resync");
                        self.request_full_resync().await?;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    /// Send a mutating request. Throttling is suspended until the change
    /// it produced arrives; a 403 forces a full resync.
    pub async fn send_request(&self, path: &str, payload: Value) -> Result<Value> {
        let ctx = &self.inner.ctx;
        let version = ctx.store.version();
        match ctx.backend.request(path, payload, version).await {
            Ok(response) => {
                if let Some(change_id) = response.get("change_id").and_then(Value::as_u64) {
                    ctx.throttle.disable_until(change_id);
                }
                Ok(response)
            }
            Err(SyncError::VersionTooOld(version)) => {
                warn!(version, "request rejected, version too old");
                self.inner.last_full.store(false, Ordering::SeqCst);
                if let Err(e) = self.request_full_resync().await {
                    warn!(error = %e, "full resync after rejected request failed");
                }
                Err(SyncError::VersionTooOld(version))
            }
            Err(e) => Err(e),
        }
    }
}

async fn recv_optional<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn run_driver(
    client: Weak<ClientInner>,
    mut updates: mpsc::UnboundedReceiver<IncrementalUpdate>,
    mut resyncs: Option<mpsc::UnboundedReceiver<ResyncRequest>>,
) {
    debug!("sync driver running");
    loop {
        tokio::select! {
            update = updates.recv() => {
                let Some(update) = update else { break };
                let Some(inner) = client.upgrade() else { break };
                let client = SyncClient { inner };
                if let Err(e) = client.apply(update).await {
                    warn!(error = %e, "applying update failed");
                }
            }
            Some(request) = recv_optional(&mut resyncs) => {
                let Some(inner) = client.upgrade() else { break };
                let client = SyncClient { inner };
                if let Err(e) = client.resolve(request).await {
                    warn!(?request, error = %e, "resync failed");
                }
            }
        }
    }
    debug!("sync driver stopped");
}
