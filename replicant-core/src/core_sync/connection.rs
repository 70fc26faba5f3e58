/*
    connection.rs - Stream subscriptions with reconnect and backoff

    Every subscription is driven by one task:

        open ──► parse ──► deliver ──► error ──► policy ──► sleep ──► relevant? ──► open
                                                   │                      │
                                                   ▼                      ▼
                                                offline                 stop

    Retry policy per failed stream:
    1. failures += 1
    2. failures > max_retries        -> offline (ConnectionLost), stop
    3. authentication failure        -> offline (AuthFailed), stop
    4. otherwise sleep first_delay on the first failure, a random value in
       [min_delay, max_delay) after that, then reopen if still relevant

    Any object with "connected": true is the sentinel. It resets the failure
    counter and is not delivered to the handler.

    Going offline closes every subscription, clears the registry and emits
    CommunicationEvent::Stopped. Connectivity is published through a
    last-value channel so late subscribers still see the current state.
*/

use futures::StreamExt;
use parking_lot::Mutex;
use rand::Rng;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::errors::{ErrorType, Result, StreamError, SyncError};
use super::latest::Latest;
use super::session::{Connectivity, OfflineReason, Session};
use super::stream::{StreamConnection, StreamEvent};
use super::transport::{Params, StreamTransport, SyncBackend};
use crate::config::SyncConfig;
use crate::metrics::{self, RECONNECT_ATTEMPTS, STREAM_FAILURES, STREAM_MESSAGES};

/// Consecutive failures tolerated before giving up
pub const MAX_RETRIES: u32 = 3;

/// Receives every data message of a subscription
pub type MessageHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// Computes the query parameters each time the stream is (re)opened
pub type ParamsFn = Arc<dyn Fn() -> Params + Send + Sync>;

/// Lifecycle signal of the communication layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommunicationEvent {
    Started,
    Stopped,
}

/// Whether a decoded message is the reconnect sentinel.
pub fn is_connected_sentinel(value: &Value) -> bool {
    value.get("connected") == Some(&Value::Bool(true))
}

/// Backoff schedule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub first_delay: Duration,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            first_delay: Duration::from_millis(500),
            min_delay: Duration::from_millis(2000),
            max_delay: Duration::from_millis(5000),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            first_delay: config.first_retry_delay,
            min_delay: config.retry_delay_min,
            max_delay: config.retry_delay_max,
        }
    }

    /// Delay before the reconnect following failure number `failures`.
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures <= 1 {
            return self.first_delay;
        }
        let min = self.min_delay.as_millis() as u64;
        let max = self.max_delay.as_millis() as u64;
        if max <= min {
            return self.min_delay;
        }
        Duration::from_millis(rand::rng().random_range(min..max))
    }
}

struct Inner {
    transport: Arc<dyn StreamTransport>,
    backend: Arc<dyn SyncBackend>,
    session: Arc<Session>,
    policy: RetryPolicy,
    subscriptions: Mutex<HashMap<u64, JoinHandle<()>>>,
    started: AtomicBool,
    connectivity: Latest<Connectivity>,
    events: broadcast::Sender<CommunicationEvent>,
}

impl Inner {
    fn close_connections(&self) {
        let handles: Vec<_> = self.subscriptions.lock().drain().collect();
        for (id, handle) in &handles {
            trace!(subscription = id, "closing subscription");
            handle.abort();
        }
        self.started.store(false, Ordering::SeqCst);
        let _ = self.events.send(CommunicationEvent::Stopped);
        debug!(closed = handles.len(), "communication stopped");
    }

    fn go_offline(&self, reason: OfflineReason) {
        warn!(%reason, "going offline");
        metrics::record_offline(reason);
        self.connectivity.publish(Connectivity::Offline(reason));
        self.close_connections();
    }

    fn is_registered(&self, id: u64) -> bool {
        self.subscriptions.lock().contains_key(&id)
    }

    /// Checked after every backoff sleep.
    fn is_relevant(&self, id: u64, epoch: u64) -> bool {
        self.connectivity.get().is_online()
            && self.is_registered(id)
            && self.session.epoch() == epoch
            && self.session.should_retry()
    }
}

/// Owns the open stream subscriptions
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("policy", &self.inner.policy)
            .field("subscriptions", &self.subscription_count())
            .field("started", &self.is_started())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn StreamTransport>,
        backend: Arc<dyn SyncBackend>,
        session: Arc<Session>,
        policy: RetryPolicy,
        event_capacity: usize,
    ) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                transport,
                backend,
                session,
                policy,
                subscriptions: Mutex::new(HashMap::new()),
                started: AtomicBool::new(false),
                connectivity: Latest::new(Connectivity::Online),
                events,
            }),
        }
    }

    /// Open a stream on `endpoint`. Every data message goes to `handler`.
    pub fn subscribe(
        &self,
        endpoint: impl Into<String>,
        handler: MessageHandler,
        params_fn: ParamsFn,
    ) -> StreamSubscription {
        let endpoint = endpoint.into();
        let mut subscriptions = self.inner.subscriptions.lock();

        let mut id = rand::random::<u64>();
        while subscriptions.contains_key(&id) {
            id = rand::random::<u64>();
        }

        debug!(subscription = id, %endpoint, "subscribing");
        let handle = tokio::spawn(run_subscription(
            self.inner.clone(),
            id,
            endpoint,
            handler,
            params_fn,
        ));
        subscriptions.insert(id, handle);

        StreamSubscription {
            id,
            inner: self.inner.clone(),
            closed: AtomicBool::new(false),
        }
    }

    /// Begin an online session. Calling this twice without going offline in
    /// between is a usage error.
    pub fn start_communication(&self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            error!("start_communication called while communication is already running");
            return Err(SyncError::ProtocolMisuse(
                "communication was already started".to_string(),
            ));
        }
        self.inner.connectivity.publish(Connectivity::Online);
        let _ = self.inner.events.send(CommunicationEvent::Started);
        info!("communication started");
        Ok(())
    }

    /// Close every subscription.
    pub fn close_connections(&self) {
        self.inner.close_connections();
    }

    pub fn go_offline(&self, reason: OfflineReason) {
        self.inner.go_offline(reason);
    }

    pub fn events(&self) -> broadcast::Receiver<CommunicationEvent> {
        self.inner.events.subscribe()
    }

    pub fn connectivity(&self) -> &Latest<Connectivity> {
        &self.inner.connectivity
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.lock().len()
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.inner.session
    }

    /// Ask the server whether it is up at all. Any failure counts as down.
    pub async fn is_communication_online(&self) -> bool {
        match self.inner.backend.is_healthy().await {
            Ok(healthy) => healthy,
            Err(e) => {
                debug!(error = %e, "health check failed");
                false
            }
        }
    }
}

/// Handle of one subscription. `close` is the unsubscribe operation.
pub struct StreamSubscription {
    id: u64,
    inner: Arc<Inner>,
    closed: AtomicBool,
}

impl fmt::Debug for StreamSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSubscription")
            .field("id", &self.id)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl StreamSubscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the subscription is still registered with its manager.
    pub fn is_active(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.inner.is_registered(self.id)
    }

    /// Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.inner.subscriptions.lock().remove(&self.id) {
            debug!(subscription = self.id, "unsubscribed");
            handle.abort();
        }
    }
}

/// One connection attempt. Returns the error that ended it.
async fn run_connection(
    inner: &Inner,
    id: u64,
    endpoint: &str,
    handler: &MessageHandler,
    params: &Params,
    failures: &mut u32,
) -> StreamError {
    let mut stream = inner.transport.open(endpoint, params).await;
    let mut connection = StreamConnection::new();

    while let Some(event) = stream.next().await {
        for output in connection.on_event(event) {
            match output {
                StreamEvent::Message(value) if is_connected_sentinel(&value) => {
                    debug!(subscription = id, "stream connected");
                    *failures = 0;
                }
                StreamEvent::Message(value) => {
                    metrics::record_counter(STREAM_MESSAGES, 1);
                    handler(value);
                }
                StreamEvent::Error(e) => {
                    connection.close();
                    return e;
                }
            }
        }
    }

    // transport ended without a Finished event
    let error = match connection.on_finished() {
        Some(StreamEvent::Error(e)) => e,
        _ => StreamError::new(ErrorType::Server, None, "The stream was closed unexpectedly"),
    };
    connection.close();
    error
}

async fn run_subscription(
    inner: Arc<Inner>,
    id: u64,
    endpoint: String,
    handler: MessageHandler,
    params_fn: ParamsFn,
) {
    let mut failures: u32 = 0;

    loop {
        let params = params_fn();
        let error = run_connection(&inner, id, &endpoint, &handler, &params, &mut failures).await;

        failures += 1;
        metrics::record_counter(STREAM_FAILURES, 1);
        warn!(subscription = id, failures, error = %error, "stream failed");

        if failures > inner.policy.max_retries {
            inner.go_offline(OfflineReason::ConnectionLost);
            return;
        }
        if error.is_auth_failure() {
            inner.go_offline(OfflineReason::AuthFailed);
            return;
        }

        let delay = inner.policy.delay_for(failures);
        let epoch = inner.session.epoch();
        info!(subscription = id, ?delay, "reconnecting");
        tokio::time::sleep(delay).await;

        if !inner.is_relevant(id, epoch) {
            debug!(subscription = id, "reconnect no longer relevant");
            inner.subscriptions.lock().remove(&id);
            return;
        }
        metrics::record_counter(RECONNECT_ATTEMPTS, 1);
    }
}
