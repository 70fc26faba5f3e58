//! Test utilities for the replication client
//!
//! Scripted stand-ins for the network seams plus small async helpers,
//! shared by unit tests and the integration tests under `tests/`.

pub mod async_helpers;
pub mod fixtures;

pub use async_helpers::*;
pub use fixtures::*;
