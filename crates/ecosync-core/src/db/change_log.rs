//! Change log repository
//!
//! Every committed version gets one row with a server-assigned sequence.
//! `seq` is `AUTOINCREMENT`, so it is strictly increasing in commit order and
//! never reused, even after GC deletes rows. Pulls scan by `seq`, which is
//! what makes the delta gap-free when timestamps tie or arrive out of order.

use crate::error::Result;
use crate::models::{ChangeEntry, GcHorizon, LogEntry, RecordId, SyncableRecord};
use rusqlite::{params, Connection, OptionalExtension};

use super::SqliteRecordRepository;

/// Trait for change log operations
pub trait ChangeLogRepository {
    /// Append a committed version, returning its sequence
    fn append(&self, record: &SyncableRecord, committed_at: i64) -> Result<i64>;

    /// Current versions whose log entry lies after `after_seq`, in `seq` order
    ///
    /// Entries superseded by a later version of the same record are skipped;
    /// the later version has a larger `seq` and is delivered instead.
    fn scan(&self, entity_type: &str, after_seq: i64, limit: usize) -> Result<Vec<ChangeEntry>>;

    /// All logged versions of one record, oldest first
    fn history(&self, entity_type: &str, id: &RecordId) -> Result<Vec<LogEntry>>;

    /// Highest sequence ever issued for an entity type (purged entries included)
    fn max_seq(&self, entity_type: &str) -> Result<i64>;

    /// Tombstones deleted at or before `deleted_before` whose current entry
    /// is at or below `through_seq`, with that entry's sequence
    fn purgeable_tombstones(
        &self,
        entity_type: &str,
        deleted_before: i64,
        through_seq: Option<i64>,
    ) -> Result<Vec<(RecordId, i64)>>;

    /// Drop every entry of a record
    fn purge_record(&self, entity_type: &str, id: &RecordId) -> Result<usize>;

    /// GC horizon of an entity type
    fn horizon(&self, entity_type: &str) -> Result<GcHorizon>;

    /// Record a GC pass that purged entries up to `seq`
    fn raise_horizon(&self, entity_type: &str, seq: i64, now: i64) -> Result<GcHorizon>;
}

/// `SQLite` implementation of `ChangeLogRepository`
pub struct SqliteChangeLog<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteChangeLog<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_log_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<LogEntry> {
        Ok(LogEntry {
            seq: row.get(0)?,
            entity_type: row.get(1)?,
            record_id: RecordId::new(row.get::<_, String>(2)?),
            version: row.get(3)?,
            last_modified_at: row.get(4)?,
            is_deleted: row.get(5)?,
            modified_by_device_id: row.get(6)?,
            committed_at: row.get(7)?,
        })
    }
}

impl ChangeLogRepository for SqliteChangeLog<'_> {
    fn append(&self, record: &SyncableRecord, committed_at: i64) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO change_log (entity_type, record_id, version, last_modified_at,
                 is_deleted, modified_by_device_id, committed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.entity_type,
                record.id.as_str(),
                record.meta.version,
                record.meta.last_modified_at,
                record.meta.is_deleted,
                record.meta.modified_by_device_id,
                committed_at,
            ],
        )?;

        Ok(self.conn.last_insert_rowid())
    }

    fn scan(&self, entity_type: &str, after_seq: i64, limit: usize) -> Result<Vec<ChangeEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT c.seq, r.entity_type, r.id, r.version, r.last_modified_at, r.is_deleted,
                    r.deleted_at, r.modified_by_device_id, r.payload
             FROM change_log c
             JOIN sync_records r
               ON r.entity_type = c.entity_type AND r.id = c.record_id AND r.version = c.version
             WHERE c.entity_type = ?1 AND c.seq > ?2
             ORDER BY c.seq
             LIMIT ?3",
        )?;

        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let entries = stmt
            .query_map(params![entity_type, after_seq, limit], |row| {
                Ok(ChangeEntry {
                    seq: row.get(0)?,
                    record: SqliteRecordRepository::parse_record(row, 1)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(entries)
    }

    fn history(&self, entity_type: &str, id: &RecordId) -> Result<Vec<LogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT seq, entity_type, record_id, version, last_modified_at, is_deleted,
                    modified_by_device_id, committed_at
             FROM change_log
             WHERE entity_type = ?1 AND record_id = ?2
             ORDER BY version",
        )?;

        let entries = stmt
            .query_map(params![entity_type, id.as_str()], Self::parse_log_entry)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(entries)
    }

    fn max_seq(&self, entity_type: &str) -> Result<i64> {
        let logged: i64 = self.conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) FROM change_log WHERE entity_type = ?1",
            [entity_type],
            |row| row.get(0),
        )?;

        Ok(logged.max(self.horizon(entity_type)?.purged_through_seq))
    }

    fn purgeable_tombstones(
        &self,
        entity_type: &str,
        deleted_before: i64,
        through_seq: Option<i64>,
    ) -> Result<Vec<(RecordId, i64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT r.id, c.seq
             FROM sync_records r
             JOIN change_log c
               ON c.entity_type = r.entity_type AND c.record_id = r.id AND c.version = r.version
             WHERE r.entity_type = ?1
               AND r.is_deleted = 1
               AND r.deleted_at <= ?2
               AND (?3 IS NULL OR c.seq <= ?3)
             ORDER BY c.seq",
        )?;

        let tombstones = stmt
            .query_map(params![entity_type, deleted_before, through_seq], |row| {
                Ok((RecordId::new(row.get::<_, String>(0)?), row.get(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(tombstones)
    }

    fn purge_record(&self, entity_type: &str, id: &RecordId) -> Result<usize> {
        let rows = self.conn.execute(
            "DELETE FROM change_log WHERE entity_type = ?1 AND record_id = ?2",
            params![entity_type, id.as_str()],
        )?;
        Ok(rows)
    }

    fn horizon(&self, entity_type: &str) -> Result<GcHorizon> {
        let horizon = self
            .conn
            .query_row(
                "SELECT purged_through_seq, epoch FROM gc_horizons WHERE entity_type = ?1",
                [entity_type],
                |row| {
                    Ok(GcHorizon {
                        purged_through_seq: row.get(0)?,
                        epoch: row.get(1)?,
                    })
                },
            )
            .optional()?;

        Ok(horizon.unwrap_or_default())
    }

    fn raise_horizon(&self, entity_type: &str, seq: i64, now: i64) -> Result<GcHorizon> {
        self.conn.execute(
            "INSERT INTO gc_horizons (entity_type, purged_through_seq, epoch, updated_at)
             VALUES (?1, ?2, 1, ?3)
             ON CONFLICT (entity_type) DO UPDATE SET
                 purged_through_seq = MAX(purged_through_seq, excluded.purged_through_seq),
                 epoch = epoch + 1,
                 updated_at = excluded.updated_at",
            params![entity_type, seq, now],
        )?;

        self.horizon(entity_type)
    }
}
