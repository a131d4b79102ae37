//! Record repository implementation
//!
//! Writes are guarded by the expected version: an insert only succeeds if
//! the record does not exist yet, an update only if nobody bumped the version
//! since it was read. A `false` return means the caller lost a race and must
//! re-read.

use crate::error::Result;
use crate::models::{RecordId, SyncMetadata, SyncableRecord};
use rusqlite::{params, Connection, OptionalExtension};

const RECORD_COLUMNS: &str = "entity_type, id, version, last_modified_at, is_deleted, deleted_at,
     modified_by_device_id, payload";

/// Trait for record storage operations
pub trait RecordRepository {
    /// Get a record by id, tombstones included
    fn get(&self, entity_type: &str, id: &RecordId) -> Result<Option<SyncableRecord>>;

    /// Insert the first version of a record; `false` if it already exists
    fn insert_new(&self, record: &SyncableRecord) -> Result<bool>;

    /// Replace a record if its stored version still equals `expected_version`
    fn update_guarded(&self, record: &SyncableRecord, expected_version: i64) -> Result<bool>;

    /// Permanently remove a record
    fn purge(&self, entity_type: &str, id: &RecordId) -> Result<bool>;
}

/// `SQLite` implementation of `RecordRepository`
pub struct SqliteRecordRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteRecordRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Parse a record from a row selected with `RECORD_COLUMNS`, starting at `offset`
    pub(crate) fn parse_record(row: &rusqlite::Row<'_>, offset: usize) -> rusqlite::Result<SyncableRecord> {
        let payload: String = row.get(offset + 7)?;
        let payload = serde_json::from_str(&payload).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                offset + 7,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })?;

        Ok(SyncableRecord {
            entity_type: row.get(offset)?,
            id: RecordId::new(row.get::<_, String>(offset + 1)?),
            meta: SyncMetadata {
                version: row.get(offset + 2)?,
                last_modified_at: row.get(offset + 3)?,
                is_deleted: row.get(offset + 4)?,
                deleted_at: row.get(offset + 5)?,
                modified_by_device_id: row.get(offset + 6)?,
            },
            payload,
        })
    }
}

impl RecordRepository for SqliteRecordRepository<'_> {
    fn get(&self, entity_type: &str, id: &RecordId) -> Result<Option<SyncableRecord>> {
        let record = self
            .conn
            .query_row(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM sync_records WHERE entity_type = ?1 AND id = ?2"
                ),
                params![entity_type, id.as_str()],
                |row| Self::parse_record(row, 0),
            )
            .optional()?;

        Ok(record)
    }

    fn insert_new(&self, record: &SyncableRecord) -> Result<bool> {
        let rows = self.conn.execute(
            "INSERT INTO sync_records (entity_type, id, version, last_modified_at, is_deleted,
                 deleted_at, modified_by_device_id, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT (entity_type, id) DO NOTHING",
            params![
                record.entity_type,
                record.id.as_str(),
                record.meta.version,
                record.meta.last_modified_at,
                record.meta.is_deleted,
                record.meta.deleted_at,
                record.meta.modified_by_device_id,
                serde_json::to_string(&record.payload)?,
            ],
        )?;

        Ok(rows == 1)
    }

    fn update_guarded(&self, record: &SyncableRecord, expected_version: i64) -> Result<bool> {
        let rows = self.conn.execute(
            "UPDATE sync_records
             SET version = ?1, last_modified_at = ?2, is_deleted = ?3, deleted_at = ?4,
                 modified_by_device_id = ?5, payload = ?6
             WHERE entity_type = ?7 AND id = ?8 AND version = ?9",
            params![
                record.meta.version,
                record.meta.last_modified_at,
                record.meta.is_deleted,
                record.meta.deleted_at,
                record.meta.modified_by_device_id,
                serde_json::to_string(&record.payload)?,
                record.entity_type,
                record.id.as_str(),
                expected_version,
            ],
        )?;

        Ok(rows == 1)
    }

    fn purge(&self, entity_type: &str, id: &RecordId) -> Result<bool> {
        let rows = self.conn.execute(
            "DELETE FROM sync_records WHERE entity_type = ?1 AND id = ?2",
            params![entity_type, id.as_str()],
        )?;
        Ok(rows == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn setup() -> Database {
        Database::open_in_memory().unwrap()
    }

    fn record(id: &str, version: i64) -> SyncableRecord {
        SyncableRecord {
            entity_type: "project".into(),
            id: RecordId::new(id),
            meta: SyncMetadata {
                version,
                last_modified_at: 1_000 * version,
                is_deleted: false,
                deleted_at: None,
                modified_by_device_id: Some("laptop".into()),
            },
            payload: json!({ "name": format!("Project v{version}") }),
        }
    }

    #[test]
    fn test_insert_and_get() {
        let db = setup();
        let conn = db.connection().unwrap();
        let repo = SqliteRecordRepository::new(&conn);

        let original = record("p-1", 1);
        assert!(repo.insert_new(&original).unwrap());

        let fetched = repo.get("project", &original.id).unwrap().unwrap();
        assert_eq!(fetched, original);
        assert!(repo.get("task", &original.id).unwrap().is_none());
    }

    #[test]
    fn test_insert_existing_is_refused() {
        let db = setup();
        let conn = db.connection().unwrap();
        let repo = SqliteRecordRepository::new(&conn);

        assert!(repo.insert_new(&record("p-1", 1)).unwrap());
        assert!(!repo.insert_new(&record("p-1", 1)).unwrap());
    }

    #[test]
    fn test_update_guarded_by_version() {
        let db = setup();
        let conn = db.connection().unwrap();
        let repo = SqliteRecordRepository::new(&conn);

        repo.insert_new(&record("p-1", 1)).unwrap();

        // Stale expectation loses
        assert!(!repo.update_guarded(&record("p-1", 3), 2).unwrap());
        assert!(repo.update_guarded(&record("p-1", 2), 1).unwrap());

        let fetched = repo.get("project", &RecordId::new("p-1")).unwrap().unwrap();
        assert_eq!(fetched.meta.version, 2);
        assert_eq!(fetched.payload, json!({ "name": "Project v2" }));
    }

    #[test]
    fn test_tombstone_roundtrip_and_purge() {
        let db = setup();
        let conn = db.connection().unwrap();
        let repo = SqliteRecordRepository::new(&conn);

        let mut tombstone = record("p-1", 1);
        tombstone.meta.is_deleted = true;
        tombstone.meta.deleted_at = Some(1_000);
        repo.insert_new(&tombstone).unwrap();
        repo.insert_new(&record("p-2", 1)).unwrap();

        let fetched = repo.get("project", &tombstone.id).unwrap().unwrap();
        assert!(fetched.is_deleted());
        assert_eq!(fetched.meta.deleted_at, Some(1_000));
        assert!(!repo.get("project", &RecordId::new("p-2")).unwrap().unwrap().is_deleted());

        assert!(repo.purge("project", &tombstone.id).unwrap());
        assert!(repo.get("project", &tombstone.id).unwrap().is_none());
        assert!(!repo.purge("project", &tombstone.id).unwrap());
    }
}
