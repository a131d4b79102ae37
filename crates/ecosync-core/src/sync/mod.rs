//! Sync engine: conflict resolution, versioning, change streams, sessions
//! and tombstone GC

mod changes;
mod resolver;
mod session;
mod tombstone;
mod versioning;


pub use changes::ChangeStream;
pub use resolver::{ConflictResolver, IncomingWrite, LastWriteWins, Resolution, WriteStamp};
pub use session::{SyncEngine, SyncRequest, SyncResponse, SyncStatus};
pub use tombstone::{GcReport, TombstoneManager};
pub use versioning::{CommitOutcome, ProposedWrite, VersioningAuthority};
