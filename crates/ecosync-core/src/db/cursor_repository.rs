//! Cursor repository implementation

use crate::error::Result;
use crate::models::{Cursor, CursorState, RecordId};
use rusqlite::{params, Connection, OptionalExtension};

/// Trait for per-(device, entity type) cursor storage
pub trait CursorRepository {
    fn get(&self, device_id: &str, entity_type: &str) -> Result<Option<CursorState>>;

    /// Move a cursor forward; `false` if the stored one is already further
    fn advance(&self, device_id: &str, cursor: &Cursor, now: i64) -> Result<bool>;

    /// Overwrite a cursor unconditionally for a full resync that began at
    /// `resync_started_at`
    fn replace(&self, device_id: &str, cursor: &Cursor, resync_started_at: i64, now: i64) -> Result<()>;

    fn list_for_device(&self, device_id: &str) -> Result<Vec<CursorState>>;

    /// Lowest cursor sequence among active devices holding a cursor for the
    /// entity type. Devices whose last activity is before `active_since` are
    /// left out. `None` when no device qualifies.
    fn min_active_seq(&self, entity_type: &str, active_since: Option<i64>) -> Result<Option<i64>>;
}

/// `SQLite` implementation of `CursorRepository`
pub struct SqliteCursorRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteCursorRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_state(row: &rusqlite::Row<'_>) -> rusqlite::Result<CursorState> {
        let record_id: Option<String> = row.get(5)?;
        Ok(CursorState {
            device_id: row.get(0)?,
            cursor: Cursor {
                entity_type: row.get(1)?,
                seq: row.get(2)?,
                last_modified_at: row.get(3)?,
                version: row.get(4)?,
                record_id: record_id.map(RecordId::new),
                gc_epoch: row.get(6)?,
            },
            updated_at: row.get(7)?,
            resync_started_at: row.get(8)?,
        })
    }
}

impl CursorRepository for SqliteCursorRepository<'_> {
    fn get(&self, device_id: &str, entity_type: &str) -> Result<Option<CursorState>> {
        let state = self
            .conn
            .query_row(
                "SELECT device_id, entity_type, seq, last_modified_at, version, record_id,
                        gc_epoch, updated_at, resync_started_at
                 FROM sync_cursors WHERE device_id = ?1 AND entity_type = ?2",
                params![device_id, entity_type],
                Self::parse_state,
            )
            .optional()?;

        Ok(state)
    }

    fn advance(&self, device_id: &str, cursor: &Cursor, now: i64) -> Result<bool> {
        let rows = self.conn.execute(
            "INSERT INTO sync_cursors (device_id, entity_type, seq, last_modified_at, version,
                 record_id, gc_epoch, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT (device_id, entity_type) DO UPDATE SET
                 seq = excluded.seq,
                 last_modified_at = excluded.last_modified_at,
                 version = excluded.version,
                 record_id = excluded.record_id,
                 gc_epoch = excluded.gc_epoch,
                 updated_at = excluded.updated_at
             WHERE excluded.seq > sync_cursors.seq
                OR (excluded.seq = sync_cursors.seq AND excluded.gc_epoch > sync_cursors.gc_epoch)",
            params![
                device_id,
                cursor.entity_type,
                cursor.seq,
                cursor.last_modified_at,
                cursor.version,
                cursor.record_id.as_ref().map(RecordId::as_str),
                cursor.gc_epoch,
                now,
            ],
        )?;

        if rows == 1 {
            tracing::debug!(device_id, entity_type = %cursor.entity_type, seq = cursor.seq, "Cursor advanced");
        }
        Ok(rows == 1)
    }

    fn replace(&self, device_id: &str, cursor: &Cursor, resync_started_at: i64, now: i64) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO sync_cursors (device_id, entity_type, seq, last_modified_at,
                 version, record_id, gc_epoch, updated_at, resync_started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                device_id,
                cursor.entity_type,
                cursor.seq,
                cursor.last_modified_at,
                cursor.version,
                cursor.record_id.as_ref().map(RecordId::as_str),
                cursor.gc_epoch,
                now,
                resync_started_at,
            ],
        )?;

        tracing::debug!(device_id, entity_type = %cursor.entity_type, seq = cursor.seq, "Cursor reset");
        Ok(())
    }

    fn list_for_device(&self, device_id: &str) -> Result<Vec<CursorState>> {
        let mut stmt = self.conn.prepare(
            "SELECT device_id, entity_type, seq, last_modified_at, version, record_id,
                    gc_epoch, updated_at, resync_started_at
             FROM sync_cursors WHERE device_id = ?1
             ORDER BY entity_type",
        )?;

        let states = stmt
            .query_map([device_id], Self::parse_state)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(states)
    }

    fn min_active_seq(&self, entity_type: &str, active_since: Option<i64>) -> Result<Option<i64>> {
        let seq = self.conn.query_row(
            "SELECT MIN(c.seq)
             FROM sync_cursors c
             JOIN devices d ON d.id = c.device_id
             WHERE c.entity_type = ?1
               AND d.is_active = 1
               AND (?2 IS NULL
                    OR COALESCE(d.last_sync_at, d.last_seen_at, d.registered_at) >= ?2)",
            params![entity_type, active_since],
            |row| row.get::<_, Option<i64>>(0),
        )?;

        Ok(seq)
    }
}
