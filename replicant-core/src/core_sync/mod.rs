//! Replication of server-owned data into a local store.
//!
//! Leaves first: [`mutex`] and [`latest`] are primitives, [`stream`] parses
//! streamed responses opened through [`transport`], [`connection`] keeps
//! those streams alive, [`throttle`] coalesces bursts, [`coordinator`]
//! commits batches into the [`store`], and [`client`] ties it together.

pub mod client;
pub mod connection;
pub mod coordinator;
pub mod errors;
pub mod latest;
pub mod mutex;
pub mod registry;
pub mod session;
pub mod storage;
pub mod store;
pub mod stream;
pub mod throttle;
pub mod transport;
pub mod types;

pub use client::{ApplyOutcome, BootstrapOutcome, ResyncRequest, SyncClient, SyncContext};
pub use connection::{
    CommunicationEvent, ConnectionManager, MessageHandler, ParamsFn, RetryPolicy,
    StreamSubscription, MAX_RETRIES,
};
pub use coordinator::{CommitSummary, Dependent, UpdateCoordinator, UpdateSlot};
pub use errors::{CommunicationError, ErrorType, Result, StorageError, StreamError, SyncError};
pub use latest::Latest;
pub use mutex::{FifoGuard, FifoMutex};
pub use registry::{DecoderRegistry, JsonRecord, Model, Record};
pub use session::{Connectivity, OfflineReason, Session};
pub use storage::{FileStorage, LocalStorage, MemoryStorage};
pub use store::{ReplicatedStore, StoreEvent};
pub use stream::{StreamConnection, StreamEvent};
pub use throttle::{merge_updates, ThrottleGate, ThrottleSettings};
pub use transport::{
    HttpBackend, HttpTransport, Params, StreamTransport, SyncBackend, TransportEvent,
    TransportStream,
};
pub use types::{CollectionIds, Continuity, IncrementalUpdate, RecordId, Version};
