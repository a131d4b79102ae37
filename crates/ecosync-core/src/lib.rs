//! ecosync-core - Offline-first sync engine
//!
//! Reconciles the authoritative server store with many intermittently
//! connected replicas. Pushed mutations are resolved last-write-wins,
//! committed under an optimistic version guard, and streamed back to other
//! devices through a cursor-driven change log. Deletes are tombstones that
//! are purged only once every active device has observed them.

pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod sync;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{SyncConfig, TombstonePolicy};
pub use error::{Error, Result};
pub use models::{Cursor, PushOutcome, PushedRecord, RecordId, SyncMetadata, SyncableRecord};
pub use services::SyncService;
pub use sync::{GcReport, SyncEngine, SyncRequest, SyncResponse, SyncStatus};
