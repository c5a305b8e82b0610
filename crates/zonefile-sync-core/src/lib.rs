//! Core engine for keeping a directory of DNS zone files in step with a
//! revisioned key-value store.
//!
//! This crate defines the pieces shared by every store backend:
//! - `KvTransport`: the raw range-read / watch capability of a remote store
//! - `StoreClient`: consistent snapshots with retry, and revision-anchored change streams
//! - `ZonefileDir`: owned handle over the managed zone file directory
//! - `reconcile::diff`: deletions needed to match the local key set to a snapshot
//! - `SyncSession`: bootstrap, reconcile, then stream changes until terminated
//! - `MemoryKv`: in-memory revisioned transport backing the engine tests

mod error;
mod local;
mod memory;
mod model;
pub mod reconcile;
mod session;
mod store;
mod transport;

pub use error::SyncError;
pub use local::ZonefileDir;
pub use memory::MemoryKv;
pub use model::{ChangeEvent, Key, Revision, Snapshot, ZonefileRecord};
pub use session::{SessionState, SessionSummary, SyncSession, Termination, TerminationKind};
pub use store::{ChangeStream, RetryPolicy, StoreClient};
pub use transport::{
    KeyValue, KvEvent, KvTransport, RangeResult, TransportError, TransportErrorKind, WatchStream,
};
