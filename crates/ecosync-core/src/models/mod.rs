//! Data models for ecosync

mod change;
mod cursor;
mod device;
mod entity;
mod push;
mod record;
mod sync_conflict;

pub use change::{ChangeEntry, GcHorizon, LogEntry};
pub use cursor::{Cursor, CursorState};
pub use device::{Device, DeviceKind, DevicePlatform, DeviceRegistration};
pub use entity::{EntityDefinition, EntityRegistry, ParentLink};
pub use push::{ConflictReason, ConflictReport, Mutation, PushOutcome, PushResult, PushedRecord};
pub use record::{sanitize_payload, RecordId, SyncMetadata, Syncable, SyncableRecord, RESERVED_FIELDS};
pub use sync_conflict::{ConflictDecision, ConflictResolution, NewSyncConflict, SyncConflict};
