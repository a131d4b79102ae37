//! Conflict log repository

use crate::error::Result;
use crate::models::{ConflictResolution, NewSyncConflict, RecordId, SyncConflict};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

const CONFLICT_COLUMNS: &str = "id, device_id, entity_type, record_id, incoming_timestamp,
    client_payload, client_deleted, server_version, server_timestamp, server_device_id,
    server_payload, strategy, created_at, resolved_at, resolution";

/// Trait for the LWW conflict log
pub trait ConflictRepository {
    /// Record a rejected write
    fn record(&self, conflict: &NewSyncConflict, created_at: i64) -> Result<i64>;

    fn get(&self, id: i64) -> Result<Option<SyncConflict>>;

    /// Recorded conflicts, newest first, optionally for a single device
    fn list(
        &self,
        device_id: Option<&str>,
        unresolved_only: bool,
        limit: usize,
    ) -> Result<Vec<SyncConflict>>;

    /// Close an open conflict. Returns false when it was already resolved.
    fn mark_resolved(&self, id: i64, resolution: ConflictResolution, now: i64) -> Result<bool>;

    fn count_for_device(&self, device_id: &str, unresolved_only: bool) -> Result<usize>;
}

/// `SQLite` implementation of `ConflictRepository`
pub struct SqliteConflictRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteConflictRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_json(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Value> {
        let raw: String = row.get(idx)?;
        serde_json::from_str(&raw)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    }

    fn parse_conflict(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncConflict> {
        let resolution = row
            .get::<_, Option<String>>(14)?
            .map(|raw| {
                raw.parse::<ConflictResolution>().map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(14, Type::Text, Box::new(e))
                })
            })
            .transpose()?;

        Ok(SyncConflict {
            id: row.get(0)?,
            device_id: row.get(1)?,
            entity_type: row.get(2)?,
            record_id: RecordId::new(row.get::<_, String>(3)?),
            incoming_timestamp: row.get(4)?,
            client_payload: Self::parse_json(row, 5)?,
            client_deleted: row.get(6)?,
            server_version: row.get(7)?,
            server_timestamp: row.get(8)?,
            server_device_id: row.get(9)?,
            server_payload: Self::parse_json(row, 10)?,
            strategy: row.get(11)?,
            created_at: row.get(12)?,
            resolved_at: row.get(13)?,
            resolution,
        })
    }
}

impl ConflictRepository for SqliteConflictRepository<'_> {
    fn record(&self, conflict: &NewSyncConflict, created_at: i64) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO sync_conflicts (device_id, entity_type, record_id, incoming_timestamp,
                 client_payload, client_deleted, server_version, server_timestamp,
                 server_device_id, server_payload, strategy, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                conflict.device_id,
                conflict.entity_type,
                conflict.record_id.as_str(),
                conflict.incoming_timestamp,
                serde_json::to_string(&conflict.client_payload)?,
                conflict.client_deleted,
                conflict.server_version,
                conflict.server_timestamp,
                conflict.server_device_id,
                serde_json::to_string(&conflict.server_payload)?,
                conflict.strategy,
                created_at,
            ],
        )?;

        Ok(self.conn.last_insert_rowid())
    }

    fn get(&self, id: i64) -> Result<Option<SyncConflict>> {
        let conflict = self
            .conn
            .query_row(
                &format!("SELECT {CONFLICT_COLUMNS} FROM sync_conflicts WHERE id = ?1"),
                [id],
                Self::parse_conflict,
            )
            .optional()?;
        Ok(conflict)
    }

    fn list(
        &self,
        device_id: Option<&str>,
        unresolved_only: bool,
        limit: usize,
    ) -> Result<Vec<SyncConflict>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CONFLICT_COLUMNS}
             FROM sync_conflicts
             WHERE (?1 IS NULL OR device_id = ?1)
               AND (?2 = 0 OR resolved_at IS NULL)
             ORDER BY created_at DESC, id DESC
             LIMIT ?3"
        ))?;

        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let conflicts = stmt
            .query_map(params![device_id, unresolved_only, limit], Self::parse_conflict)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(conflicts)
    }

    fn mark_resolved(&self, id: i64, resolution: ConflictResolution, now: i64) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE sync_conflicts SET resolved_at = ?2, resolution = ?3
             WHERE id = ?1 AND resolved_at IS NULL",
            params![id, now, resolution.as_str()],
        )?;
        Ok(changed == 1)
    }

    fn count_for_device(&self, device_id: &str, unresolved_only: bool) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sync_conflicts
             WHERE device_id = ?1 AND (?2 = 0 OR resolved_at IS NULL)",
            params![device_id, unresolved_only],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or_default())
    }
}
