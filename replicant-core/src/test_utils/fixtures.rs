//! Test fixtures: scripted network seams and store observers
//!
//! `ScriptedTransport` replays one `StreamScript` per opened stream and
//! idles once the scripts run out. `ScriptedBackend` answers from queues.
//! `RecordingDependent` writes every callback into a log.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::core_sync::{
    CollectionIds, DecoderRegistry, Dependent, IncrementalUpdate, LocalStorage, Model, Params,
    RecordId, Result, Session, StreamTransport, SyncBackend, SyncContext, SyncError,
    TransportEvent, TransportStream, Version,
};

/// A `{"id", "name"}` wire record
pub fn user(id: RecordId, name: &str) -> Value {
    json!({ "id": id, "name": name })
}

/// Registry keeping the given collections as JSON records
pub fn json_registry(collections: &[&str]) -> DecoderRegistry {
    let mut registry = DecoderRegistry::new();
    for collection in collections {
        registry.register_json(*collection);
    }
    registry
}

/// Context over scripted seams with `users` and `groups` registered, user 1
/// logged in.
pub fn test_context(
    transport: Arc<ScriptedTransport>,
    backend: Arc<ScriptedBackend>,
    storage: Arc<dyn LocalStorage>,
    throttle_delay: Duration,
) -> SyncContext {
    SyncContext::new(
        &Config::default(),
        transport,
        backend,
        storage,
        json_registry(&["users", "groups"]),
        Arc::new(Session::new(Some(1), false)),
        throttle_delay,
    )
}

/// Events one scripted stream produces
#[derive(Debug, Clone, PartialEq)]
pub struct StreamScript {
    status: Option<u16>,
    chunks: Vec<Bytes>,
    failure: Option<String>,
    finish: bool,
}

impl StreamScript {
    pub fn new(status: u16) -> Self {
        Self {
            status: Some(status),
            chunks: Vec::new(),
            failure: None,
            finish: true,
        }
    }

    /// Status 200 and one chunk per line.
    pub fn open_lines(lines: &[&str]) -> Self {
        lines.iter().fold(Self::new(200), |script, line| script.line(line))
    }

    /// Error status with an empty body.
    pub fn server_error(status: u16) -> Self {
        Self::new(status)
    }

    pub fn error_body(status: u16, body: &str) -> Self {
        Self::new(status).chunk(body.as_bytes())
    }

    /// Connection refused before any response.
    pub fn unreachable(message: &str) -> Self {
        Self {
            status: None,
            chunks: Vec::new(),
            failure: Some(message.to_string()),
            finish: false,
        }
    }

    pub fn chunk(mut self, bytes: &[u8]) -> Self {
        self.chunks.push(Bytes::copy_from_slice(bytes));
        self
    }

    pub fn line(self, line: &str) -> Self {
        self.chunk(format!("{}\n", line).as_bytes())
    }

    /// Serialize an update as one line.
    pub fn update(self, update: &IncrementalUpdate) -> Self {
        let line = serde_json::to_string(update).unwrap_or_default();
        self.line(&line)
    }

    /// Never end the body.
    pub fn keep_open(mut self) -> Self {
        self.finish = false;
        self
    }

    /// End with a network failure instead of a clean finish.
    pub fn fail(mut self, message: &str) -> Self {
        self.failure = Some(message.to_string());
        self
    }

    fn into_stream(self) -> TransportStream {
        let mut events = Vec::new();
        if let Some(status) = self.status {
            events.push(TransportEvent::Header { status });
        }
        events.extend(self.chunks.into_iter().map(TransportEvent::Chunk));

        let ends = match (self.failure, self.finish) {
            (Some(message), _) => {
                events.push(TransportEvent::Failed(message));
                true
            }
            (None, true) => {
                events.push(TransportEvent::Finished);
                true
            }
            (None, false) => false,
        };

        if ends {
            stream::iter(events).boxed()
        } else {
            stream::iter(events).chain(stream::pending()).boxed()
        }
    }
}

/// Transport replaying queued scripts
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    scripts: Mutex<VecDeque<StreamScript>>,
    opened: Mutex<Vec<(String, Params)>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, script: StreamScript) {
        self.scripts.lock().push_back(script);
    }

    pub fn open_count(&self) -> usize {
        self.opened.lock().len()
    }

    /// Endpoint and parameters of every open call so far.
    pub fn opened(&self) -> Vec<(String, Params)> {
        self.opened.lock().clone()
    }
}

#[async_trait]
impl StreamTransport for ScriptedTransport {
    async fn open(&self, endpoint: &str, params: &Params) -> TransportStream {
        self.opened.lock().push((endpoint.to_string(), params.clone()));
        match self.scripts.lock().pop_front() {
            Some(script) => script.into_stream(),
            // out of scripts: a connection that never says anything
            None => stream::pending().boxed(),
        }
    }
}

/// Backend answering from queues
#[derive(Debug)]
pub struct ScriptedBackend {
    elements: Mutex<VecDeque<Result<IncrementalUpdate>>>,
    elements_calls: Mutex<Vec<Option<Version>>>,
    requests: Mutex<VecDeque<Result<Value>>>,
    request_calls: Mutex<Vec<(String, Value, Version)>>,
    healthy: Mutex<std::result::Result<bool, String>>,
    schema: Mutex<Option<String>>,
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self {
            elements: Mutex::new(VecDeque::new()),
            elements_calls: Mutex::new(Vec::new()),
            requests: Mutex::new(VecDeque::new()),
            request_calls: Mutex::new(Vec::new()),
            healthy: Mutex::new(Ok(true)),
            schema: Mutex::new(None),
        }
    }
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_elements(&self, update: IncrementalUpdate) {
        self.elements.lock().push_back(Ok(update));
    }

    pub fn push_elements_error(&self, error: SyncError) {
        self.elements.lock().push_back(Err(error));
    }

    pub fn push_request(&self, response: Result<Value>) {
        self.requests.lock().push_back(response);
    }

    pub fn set_healthy(&self, healthy: Result<bool>) {
        *self.healthy.lock() = healthy.map_err(|e| e.to_string());
    }

    pub fn set_schema(&self, schema: &str) {
        *self.schema.lock() = Some(schema.to_string());
    }

    /// `since` argument of every get_elements call.
    pub fn elements_calls(&self) -> Vec<Option<Version>> {
        self.elements_calls.lock().clone()
    }

    pub fn request_calls(&self) -> Vec<(String, Value, Version)> {
        self.request_calls.lock().clone()
    }
}

#[async_trait]
impl SyncBackend for ScriptedBackend {
    async fn get_elements(&self, since: Option<Version>) -> Result<IncrementalUpdate> {
        self.elements_calls.lock().push(since);
        self.elements
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(SyncError::Transport("no scripted elements".to_string())))
    }

    async fn request(&self, path: &str, payload: Value, version: Version) -> Result<Value> {
        self.request_calls
            .lock()
            .push((path.to_string(), payload, version));
        self.requests.lock().pop_front().unwrap_or_else(|| Ok(json!({})))
    }

    async fn is_healthy(&self) -> Result<bool> {
        self.healthy.lock().clone().map_err(SyncError::Transport)
    }

    async fn schema_version(&self) -> Result<String> {
        self.schema.lock().clone().ok_or(SyncError::Http {
            status: 404,
            message: "no schema".to_string(),
        })
    }
}

/// Dependent logging every callback as a line
#[derive(Debug, Default)]
pub struct RecordingDependent {
    calls: Mutex<Vec<String>>,
}

impl RecordingDependent {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }
}

impl Dependent for RecordingDependent {
    fn deleted_models(&self, collection: &str, ids: &[RecordId]) {
        self.calls
            .lock()
            .push(format!("deleted {} {:?}", collection, ids));
    }

    fn changed_models(&self, collection: &str, models: &[Arc<dyn Model>]) {
        let ids: Vec<RecordId> = models.iter().map(|m| m.id()).collect();
        self.calls
            .lock()
            .push(format!("changed {} {:?}", collection, ids));
    }

    fn recompute(&self, changed: &CollectionIds) {
        self.calls.lock().push(format!("recompute {:?}", changed));
    }

    fn reset(&self) {
        self.calls.lock().push("reset".to_string());
    }
}
