//! Change log entries

use serde::{Deserialize, Serialize};

use super::{Cursor, RecordId, SyncableRecord};

/// A record delivered by the change stream, with its log position
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEntry {
    pub seq: i64,
    pub record: SyncableRecord,
}

impl ChangeEntry {
    /// Cursor pointing just past this entry
    pub fn cursor(&self, gc_epoch: i64) -> Cursor {
        Cursor {
            entity_type: self.record.entity_type.clone(),
            seq: self.seq,
            last_modified_at: self.record.meta.last_modified_at,
            version: self.record.meta.version,
            record_id: Some(self.record.id.clone()),
            gc_epoch,
        }
    }
}

/// One committed version of a record, as kept in the change log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub seq: i64,
    pub entity_type: String,
    pub record_id: RecordId,
    pub version: i64,
    pub last_modified_at: i64,
    pub is_deleted: bool,
    pub modified_by_device_id: Option<String>,
    /// Server time of the commit (Unix ms)
    pub committed_at: i64,
}

/// How far tombstone GC has eaten into one entity type's change log
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcHorizon {
    /// Highest sequence of any purged tombstone
    pub purged_through_seq: i64,
    /// Bumped by every GC pass that purged something
    pub epoch: i64,
}

impl GcHorizon {
    /// Whether a client holding `cursor` can still continue incrementally
    ///
    /// The origin holds no state that could miss a purge. Cursors at or past
    /// the horizon have seen every purged tombstone.
    /// Cursors issued under the current epoch were produced by a scan that
    /// already ran without the purged entries, so nothing is lost either.
    pub const fn admits(&self, cursor: &Cursor) -> bool {
        cursor.is_origin()
            || cursor.seq >= self.purged_through_seq
            || cursor.gc_epoch == self.epoch
    }
}
