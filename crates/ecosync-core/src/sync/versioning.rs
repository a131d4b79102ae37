//! Versioning authority
//!
//! The only place that assigns `version`, `last_modified_at` and
//! `modified_by_device_id`. A commit writes the record under an
//! expected-version guard and appends the change log entry in the caller's
//! transaction.

use std::sync::Arc;

use rusqlite::Connection;
use serde_json::Value;

use crate::clock::Clock;
use crate::db::{ChangeLogRepository, RecordRepository, SqliteChangeLog, SqliteRecordRepository};
use crate::error::Result;
use crate::models::{RecordId, SyncMetadata, SyncableRecord};

/// State an accepted write asks to commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposedWrite {
    pub entity_type: String,
    pub id: RecordId,
    pub is_deleted: bool,
    pub payload: Value,
    /// Effective `last_modified_at`, from [`VersioningAuthority::stamp`]
    pub stamp: i64,
    pub device_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed { record: SyncableRecord, seq: i64 },
    /// Someone else committed first; re-read and resolve again
    VersionMismatch,
}

pub struct VersioningAuthority {
    clock: Arc<dyn Clock>,
}

impl VersioningAuthority {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    pub fn now(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Effective stamp for a write
    ///
    /// The client's own modification time is kept so offline edits order by
    /// when they were made, but it can never be later than the server clock.
    pub fn stamp(&self, client_timestamp: Option<i64>) -> i64 {
        let now = self.now();
        client_timestamp.map_or(now, |ts| ts.min(now).max(0))
    }

    /// Commit the next version of a record on top of `current`
    ///
    /// `conn` should be inside a transaction; on `VersionMismatch` nothing was
    /// written.
    pub fn commit(
        &self,
        conn: &Connection,
        current: Option<&SyncableRecord>,
        write: &ProposedWrite,
    ) -> Result<CommitOutcome> {
        let now = self.now();
        let deleted_at = match current {
            Some(current) if write.is_deleted && current.is_deleted() => current.meta.deleted_at,
            _ if write.is_deleted => Some(now),
            _ => None,
        };

        let record = SyncableRecord {
            entity_type: write.entity_type.clone(),
            id: write.id.clone(),
            meta: SyncMetadata {
                version: current.map_or(1, |current| current.version() + 1),
                last_modified_at: write.stamp,
                is_deleted: write.is_deleted,
                deleted_at,
                modified_by_device_id: Some(write.device_id.clone()),
            },
            payload: write.payload.clone(),
        };

        let records = SqliteRecordRepository::new(conn);
        let written = match current {
            Some(current) => records.update_guarded(&record, current.version())?,
            None => records.insert_new(&record)?,
        };
        if !written {
            return Ok(CommitOutcome::VersionMismatch);
        }

        let seq = SqliteChangeLog::new(conn).append(&record, now)?;

        tracing::debug!(
            entity_type = %record.entity_type,
            id = %record.id,
            version = record.meta.version,
            seq,
            "Committed version"
        );
        Ok(CommitOutcome::Committed { record, seq })
    }
}
