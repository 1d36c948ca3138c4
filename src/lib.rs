//! driftsync - Bidirectional record synchronization
//!
//! Keeps a local object store and a remote record store consistent in both
//! directions under unreliable, rate-limited network conditions: a
//! change-history-driven push pipeline, a recursive graph pull pipeline,
//! and a resumable cache state machine for large binary payloads.

pub mod cache;
pub mod config;
pub mod convert;
pub mod engine;
pub mod error;
pub mod history;
pub mod pull;
pub mod push;
pub mod remote;
pub mod schema;
pub mod store;
pub mod throttle;
pub mod types;

pub use config::{DeleteOrdering, SyncConfig};
pub use engine::SyncEngine;
pub use error::{ErrorSink, Module, NullSink, RemoteError, Result, StoreError, SyncError};
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
