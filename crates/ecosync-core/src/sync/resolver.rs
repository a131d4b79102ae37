//! Conflict resolution
//!
//! Writes are ordered by [`WriteStamp`]: the effective `last_modified_at`
//! first, then the writing device's id. The device id makes the order total,
//! so two replicas that see the same pair of writes in opposite order still
//! pick the same winner. Resolution is whole-record; no field-level merge.

use std::cmp::Ordering;

use serde_json::Value;

use crate::models::SyncableRecord;

/// Total order over writes to the same record
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WriteStamp {
    pub last_modified_at: i64,
    pub device_id: String,
}

impl WriteStamp {
    pub fn new(last_modified_at: i64, device_id: impl Into<String>) -> Self {
        Self {
            last_modified_at,
            device_id: device_id.into(),
        }
    }

    /// Stamp of the write that produced a stored record's current version
    pub fn of(record: &SyncableRecord) -> Self {
        Self::new(record.meta.last_modified_at, record.modified_by())
    }
}

/// A pushed write after sanitizing and stamping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingWrite {
    pub stamp: WriteStamp,
    pub is_deleted: bool,
    pub payload: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Incoming write wins and becomes the next version
    Accept,
    /// Server state wins; the client must adopt it
    Reject,
    /// Server already holds exactly the incoming state; acknowledge without a new version
    Merge,
}

/// Strategy deciding between stored and incoming state
pub trait ConflictResolver: Send + Sync {
    /// Name recorded in the conflict log
    fn name(&self) -> &'static str;

    fn resolve(&self, server: Option<&SyncableRecord>, incoming: &IncomingWrite) -> Resolution;
}

/// Last-write-wins on [`WriteStamp`]
#[derive(Debug, Clone, Copy, Default)]
pub struct LastWriteWins;

impl ConflictResolver for LastWriteWins {
    fn name(&self) -> &'static str {
        "lww"
    }

    fn resolve(&self, server: Option<&SyncableRecord>, incoming: &IncomingWrite) -> Resolution {
        let Some(server) = server else {
            return Resolution::Accept;
        };

        let server_stamp = WriteStamp::of(server);
        let same_state = server.holds(incoming.is_deleted, &incoming.payload);

        // A newer write with the same content still carries the winning
        // stamp, so it commits. Equal stamps only happen for one device
        // writing twice in the same millisecond; the later arrival is its
        // later write.
        match incoming.stamp.cmp(&server_stamp) {
            Ordering::Greater => Resolution::Accept,
            Ordering::Equal if !same_state => Resolution::Accept,
            _ if same_state => Resolution::Merge,
            _ => Resolution::Reject,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RecordId, SyncMetadata};
    use serde_json::json;

    fn server(ts: i64, device: &str, payload: Value) -> SyncableRecord {
        SyncableRecord {
            entity_type: "task".into(),
            id: RecordId::new("t-1"),
            meta: SyncMetadata {
                version: 3,
                last_modified_at: ts,
                is_deleted: false,
                deleted_at: None,
                modified_by_device_id: Some(device.into()),
            },
            payload,
        }
    }

    fn incoming(ts: i64, device: &str, payload: Value) -> IncomingWrite {
        IncomingWrite {
            stamp: WriteStamp::new(ts, device),
            is_deleted: false,
            payload,
        }
    }

    #[test]
    fn test_create_is_accepted() {
        let write = incoming(1, "a", json!({}));
        assert_eq!(LastWriteWins.resolve(None, &write), Resolution::Accept);
    }

    #[test]
    fn test_newer_wins_older_loses() {
        let stored = server(200, "a", json!({ "title": "server" }));

        let newer = incoming(201, "b", json!({ "title": "newer" }));
        assert_eq!(LastWriteWins.resolve(Some(&stored), &newer), Resolution::Accept);

        let older = incoming(199, "z", json!({ "title": "older" }));
        assert_eq!(LastWriteWins.resolve(Some(&stored), &older), Resolution::Reject);
    }

    #[test]
    fn test_timestamp_tie_broken_by_device() {
        let stored = server(200, "device-b", json!({ "title": "b" }));

        let lower = incoming(200, "device-a", json!({ "title": "a" }));
        assert_eq!(LastWriteWins.resolve(Some(&stored), &lower), Resolution::Reject);

        let higher = incoming(200, "device-c", json!({ "title": "c" }));
        assert_eq!(LastWriteWins.resolve(Some(&stored), &higher), Resolution::Accept);
    }

    #[test]
    fn test_identical_state_merges() {
        let stored = server(200, "a", json!({ "title": "same" }));
        let older_same = incoming(100, "b", json!({ "title": "same" }));
        assert_eq!(
            LastWriteWins.resolve(Some(&stored), &older_same),
            Resolution::Merge
        );
    }

    #[test]
    fn test_newer_identical_state_takes_the_stamp() {
        let stored = server(200, "a", json!({ "title": "same" }));

        let newer_same = incoming(300, "b", json!({ "title": "same" }));
        assert_eq!(
            LastWriteWins.resolve(Some(&stored), &newer_same),
            Resolution::Accept
        );

        let replay = incoming(200, "a", json!({ "title": "same" }));
        assert_eq!(LastWriteWins.resolve(Some(&stored), &replay), Resolution::Merge);
    }

    #[test]
    fn test_newer_update_resurrects_tombstone() {
        let mut tombstone = server(200, "a", json!({}));
        tombstone.meta.is_deleted = true;

        let update = incoming(300, "b", json!({ "title": "back" }));
        assert_eq!(LastWriteWins.resolve(Some(&tombstone), &update), Resolution::Accept);

        let stale = incoming(150, "b", json!({ "title": "back" }));
        assert_eq!(LastWriteWins.resolve(Some(&tombstone), &stale), Resolution::Reject);
    }
}
