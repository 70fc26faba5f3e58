pub mod config;
pub mod core_sync;
pub mod logging;
pub mod metrics;
pub mod test_utils;

pub use config::Config;
pub use core_sync::{
    DecoderRegistry, IncrementalUpdate, ReplicatedStore, Session, SyncClient, SyncContext,
    SyncError,
};
pub use logging::{init_logging, LogLevel};
