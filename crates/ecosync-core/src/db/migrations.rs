//! Database migrations

use crate::error::Result;
use rusqlite::{Connection, OptionalExtension};

/// Current schema version
pub(crate) const CURRENT_VERSION: i32 = 3;

/// Run all pending migrations
pub fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn)?;

    if version < 1 {
        migrate_v1(conn)?;
    }
    if version < 2 {
        migrate_v2(conn)?;
    }
    if version < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// Get the current schema version
pub(crate) fn get_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version = conn
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
            row.get::<_, Option<i32>>(0)
        })
        .optional()?
        .flatten()
        .unwrap_or(0);

    Ok(version)
}

/// Apply a migration's statements atomically
fn apply(conn: &Connection, version: i32, statements: &[&str]) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    for stmt in statements {
        tx.execute(stmt, [])?;
    }
    tx.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    tx.commit()?;

    tracing::info!("Migrated sync database to version {version}");
    Ok(())
}

/// Migration to version 1: records, change log, devices, cursors
fn migrate_v1(conn: &Connection) -> Result<()> {
    let statements = [
        // Schema version tracking
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )",
        // Current state of every syncable record
        "CREATE TABLE IF NOT EXISTS sync_records (
            entity_type TEXT NOT NULL,
            id TEXT NOT NULL,
            version INTEGER NOT NULL CHECK (version >= 1),
            last_modified_at INTEGER NOT NULL,
            is_deleted INTEGER NOT NULL DEFAULT 0,
            deleted_at INTEGER,
            modified_by_device_id TEXT,
            payload TEXT NOT NULL DEFAULT '{}',
            PRIMARY KEY (entity_type, id)
        )",
        "CREATE INDEX IF NOT EXISTS idx_sync_records_modified
            ON sync_records(entity_type, last_modified_at)",
        "CREATE INDEX IF NOT EXISTS idx_sync_records_deleted
            ON sync_records(entity_type, is_deleted)",
        // Append-only journal of committed versions
        "CREATE TABLE IF NOT EXISTS change_log (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_type TEXT NOT NULL,
            record_id TEXT NOT NULL,
            version INTEGER NOT NULL,
            last_modified_at INTEGER NOT NULL,
            is_deleted INTEGER NOT NULL DEFAULT 0,
            modified_by_device_id TEXT,
            committed_at INTEGER NOT NULL,
            UNIQUE (entity_type, record_id, version)
        )",
        "CREATE INDEX IF NOT EXISTS idx_change_log_scan ON change_log(entity_type, seq)",
        // Registered replicas
        "CREATE TABLE IF NOT EXISTS devices (
            id TEXT PRIMARY KEY,
            client_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            name TEXT,
            registered_at INTEGER NOT NULL,
            last_seen_at INTEGER,
            last_sync_at INTEGER,
            is_active INTEGER NOT NULL DEFAULT 1
        )",
        "CREATE INDEX IF NOT EXISTS idx_devices_client ON devices(client_id)",
        // Per (device, entity type) watermark
        "CREATE TABLE IF NOT EXISTS sync_cursors (
            device_id TEXT NOT NULL REFERENCES devices(id) ON DELETE CASCADE,
            entity_type TEXT NOT NULL,
            seq INTEGER NOT NULL,
            last_modified_at INTEGER NOT NULL,
            version INTEGER NOT NULL,
            record_id TEXT,
            gc_epoch INTEGER NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (device_id, entity_type)
        )",
        "CREATE INDEX IF NOT EXISTS idx_sync_cursors_entity ON sync_cursors(entity_type, seq)",
    ];

    apply(conn, 1, &statements)
}

/// Migration to version 2: LWW conflict log, push receipts, GC horizons
fn migrate_v2(conn: &Connection) -> Result<()> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS sync_conflicts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            device_id TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            record_id TEXT NOT NULL,
            incoming_timestamp INTEGER NOT NULL,
            server_version INTEGER NOT NULL,
            server_timestamp INTEGER NOT NULL,
            server_device_id TEXT,
            strategy TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )",
        "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_device ON sync_conflicts(device_id)",
        "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_created_at
            ON sync_conflicts(created_at DESC)",
        // Idempotency receipts, keyed by (record, token)
        "CREATE TABLE IF NOT EXISTS push_receipts (
            entity_type TEXT NOT NULL,
            record_id TEXT NOT NULL,
            token TEXT NOT NULL,
            device_id TEXT NOT NULL,
            outcome TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (entity_type, record_id, token)
        )",
        "CREATE INDEX IF NOT EXISTS idx_push_receipts_created_at ON push_receipts(created_at)",
        // Highest change log sequence lost to tombstone GC
        "CREATE TABLE IF NOT EXISTS gc_horizons (
            entity_type TEXT PRIMARY KEY,
            purged_through_seq INTEGER NOT NULL,
            epoch INTEGER NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL
        )",
    ];

    apply(conn, 2, &statements)
}

/// Migration to version 3: conflict payloads and resolution, acknowledged
/// versions on receipts, resync start on cursors, device metadata
fn migrate_v3(conn: &Connection) -> Result<()> {
    let statements = [
        "ALTER TABLE sync_conflicts ADD COLUMN client_payload TEXT NOT NULL DEFAULT '{}'",
        "ALTER TABLE sync_conflicts ADD COLUMN client_deleted INTEGER NOT NULL DEFAULT 0",
        "ALTER TABLE sync_conflicts ADD COLUMN server_payload TEXT NOT NULL DEFAULT '{}'",
        "ALTER TABLE sync_conflicts ADD COLUMN resolved_at INTEGER",
        "ALTER TABLE sync_conflicts ADD COLUMN resolution TEXT",
        "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_unresolved
            ON sync_conflicts(device_id) WHERE resolved_at IS NULL",
        // Version the pushing device holds after an applied or unchanged push
        "ALTER TABLE push_receipts ADD COLUMN acknowledged_version INTEGER",
        "CREATE INDEX IF NOT EXISTS idx_push_receipts_acknowledged
            ON push_receipts(entity_type, record_id, acknowledged_version)",
        "ALTER TABLE sync_cursors ADD COLUMN resync_started_at INTEGER NOT NULL DEFAULT 0",
        "ALTER TABLE devices ADD COLUMN platform TEXT",
        "ALTER TABLE devices ADD COLUMN os_version TEXT",
        "ALTER TABLE devices ADD COLUMN app_version TEXT",
        "ALTER TABLE devices ADD COLUMN push_token TEXT",
    ];

    apply(conn, 3, &statements)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    fn table_exists(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            [name],
            |row| row.get(0),
        )
        .unwrap()
    }

    #[test]
    fn test_migrations() {
        let conn = setup();
        run(&conn).unwrap();

        let version = get_version(&conn).unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_migrations_idempotent() {
        let conn = setup();
        run(&conn).unwrap();
        run(&conn).unwrap(); // Should not fail

        let version = get_version(&conn).unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_migrations_create_sync_tables() {
        let conn = setup();
        run(&conn).unwrap();

        for table in [
            "sync_records",
            "change_log",
            "devices",
            "sync_cursors",
            "sync_conflicts",
            "push_receipts",
            "gc_horizons",
        ] {
            assert!(table_exists(&conn, table), "missing table {table}");
        }
    }

    #[test]
    fn test_version_guard_rejects_zero_version() {
        let conn = setup();
        run(&conn).unwrap();

        let result = conn.execute(
            "INSERT INTO sync_records (entity_type, id, version, last_modified_at)
             VALUES ('task', 't-1', 0, 1)",
            [],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_upgrade_from_v2_keeps_conflicts() {
        let conn = setup();
        migrate_v1(&conn).unwrap();
        migrate_v2(&conn).unwrap();
        conn.execute(
            "INSERT INTO sync_conflicts (device_id, entity_type, record_id, incoming_timestamp,
                 server_version, server_timestamp, strategy, created_at)
             VALUES ('phone', 'task', 't-1', 1, 2, 3, 'lww', 4)",
            [],
        )
        .unwrap();

        run(&conn).unwrap();
        assert_eq!(get_version(&conn).unwrap(), 3);

        let (payload, resolved_at): (String, Option<i64>) = conn
            .query_row(
                "SELECT client_payload, resolved_at FROM sync_conflicts WHERE record_id = 't-1'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(payload, "{}");
        assert_eq!(resolved_at, None);
    }
}
