//! Idempotency receipts
//!
//! A receipt stores the outcome handed back for a pushed record, keyed by
//! the record and the client's idempotency token. A replay inside the window
//! gets the stored outcome instead of being resolved again. Receipts also
//! remember which version a device holds after its own push, which is how
//! pulls leave out a device's own writes.

use crate::error::Result;
use crate::models::{PushOutcome, RecordId};
use rusqlite::{params, Connection, OptionalExtension};

/// Trait for push receipt storage
pub trait ReceiptRepository {
    /// Outcome stored for `(entity_type, record_id, token)` at or after `not_before`
    fn find(
        &self,
        entity_type: &str,
        record_id: &RecordId,
        token: &str,
        not_before: i64,
    ) -> Result<Option<PushOutcome>>;

    /// Store an outcome, overwriting an expired receipt with the same key
    fn store(
        &self,
        entity_type: &str,
        record_id: &RecordId,
        token: &str,
        device_id: &str,
        outcome: &PushOutcome,
        now: i64,
    ) -> Result<()>;

    /// Whether a push by `device_id` at or after `since` was acknowledged at
    /// `version` of the record
    fn acknowledged(
        &self,
        device_id: &str,
        entity_type: &str,
        record_id: &RecordId,
        version: i64,
        since: i64,
    ) -> Result<bool>;

    /// Drop receipts created before `cutoff`
    fn purge_before(&self, cutoff: i64) -> Result<usize>;
}

/// `SQLite` implementation of `ReceiptRepository`
pub struct SqliteReceiptRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteReceiptRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl ReceiptRepository for SqliteReceiptRepository<'_> {
    fn find(
        &self,
        entity_type: &str,
        record_id: &RecordId,
        token: &str,
        not_before: i64,
    ) -> Result<Option<PushOutcome>> {
        let outcome: Option<String> = self
            .conn
            .query_row(
                "SELECT outcome FROM push_receipts
                 WHERE entity_type = ?1 AND record_id = ?2 AND token = ?3 AND created_at >= ?4",
                params![entity_type, record_id.as_str(), token, not_before],
                |row| row.get(0),
            )
            .optional()?;

        Ok(outcome
            .map(|json| serde_json::from_str(&json))
            .transpose()?)
    }

    fn store(
        &self,
        entity_type: &str,
        record_id: &RecordId,
        token: &str,
        device_id: &str,
        outcome: &PushOutcome,
        now: i64,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO push_receipts (entity_type, record_id, token, device_id,
                 outcome, acknowledged_version, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entity_type,
                record_id.as_str(),
                token,
                device_id,
                serde_json::to_string(outcome)?,
                outcome.acknowledged_version(),
                now,
            ],
        )?;
        Ok(())
    }

    fn acknowledged(
        &self,
        device_id: &str,
        entity_type: &str,
        record_id: &RecordId,
        version: i64,
        since: i64,
    ) -> Result<bool> {
        let found = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM push_receipts
                 WHERE entity_type = ?1 AND record_id = ?2 AND acknowledged_version = ?3
                   AND device_id = ?4 AND created_at >= ?5)",
            params![entity_type, record_id.as_str(), version, device_id, since],
            |row| row.get(0),
        )?;
        Ok(found)
    }

    fn purge_before(&self, cutoff: i64) -> Result<usize> {
        let rows = self
            .conn
            .execute("DELETE FROM push_receipts WHERE created_at < ?1", [cutoff])?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_store_and_find_within_window() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.connection().unwrap();
        let repo = SqliteReceiptRepository::new(&conn);
        let id = RecordId::new("v-1");
        let outcome = PushOutcome::Applied {
            version: 2,
            last_modified_at: 900,
        };

        repo.store("volunteer", &id, "tok-1", "phone", &outcome, 1_000)
            .unwrap();

        assert_eq!(
            repo.find("volunteer", &id, "tok-1", 500).unwrap(),
            Some(outcome)
        );
        // Outside the window
        assert!(repo.find("volunteer", &id, "tok-1", 1_001).unwrap().is_none());
        // Tokens are scoped to the record
        assert!(repo
            .find("volunteer", &RecordId::new("v-2"), "tok-1", 0)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_purge_before() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.connection().unwrap();
        let repo = SqliteReceiptRepository::new(&conn);
        let id = RecordId::new("v-1");
        let outcome = PushOutcome::Unchanged { version: 1 };

        repo.store("volunteer", &id, "old", "phone", &outcome, 10)
            .unwrap();
        repo.store("volunteer", &id, "new", "phone", &outcome, 20)
            .unwrap();

        assert_eq!(repo.purge_before(15).unwrap(), 1);
        assert!(repo.find("volunteer", &id, "old", 0).unwrap().is_none());
        assert!(repo.find("volunteer", &id, "new", 0).unwrap().is_some());
    }

    #[test]
    fn test_acknowledged_versions() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.connection().unwrap();
        let repo = SqliteReceiptRepository::new(&conn);
        let id = RecordId::new("v-1");

        let applied = PushOutcome::Applied {
            version: 2,
            last_modified_at: 900,
        };
        repo.store("volunteer", &id, "a", "phone", &applied, 1_000)
            .unwrap();
        repo.store(
            "volunteer",
            &id,
            "b",
            "laptop",
            &PushOutcome::Invalid {
                reason: "bad".into(),
            },
            1_000,
        )
        .unwrap();

        assert!(repo.acknowledged("phone", "volunteer", &id, 2, 0).unwrap());
        assert!(repo.acknowledged("phone", "volunteer", &id, 2, 1_000).unwrap());
        // Pushed before the device's resync began
        assert!(!repo.acknowledged("phone", "volunteer", &id, 2, 1_001).unwrap());
        assert!(!repo.acknowledged("phone", "volunteer", &id, 3, 0).unwrap());
        assert!(!repo.acknowledged("laptop", "volunteer", &id, 2, 0).unwrap());
        assert!(!repo.acknowledged("phone", "project", &id, 2, 0).unwrap());
    }
}
