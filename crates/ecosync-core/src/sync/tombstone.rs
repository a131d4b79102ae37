//! Tombstone garbage collection
//!
//! A tombstone is purged once it is older than the retention window and
//! every active device holding a cursor for its entity type has consumed its
//! change log entry. Purging raises the entity type's GC horizon so that
//! cursors which never saw the deletion are refused instead of silently
//! missing it.

use std::collections::BTreeMap;

use crate::clock::{duration_ms, Clock};
use crate::config::TombstonePolicy;
use crate::db::{
    ChangeLogRepository, CursorRepository, Database, RecordRepository, SqliteChangeLog,
    SqliteCursorRepository, SqliteRecordRepository,
};
use crate::error::Result;

/// Result of a maintenance pass over every entity type
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Purged tombstones per entity type
    pub purged: BTreeMap<String, usize>,
    /// Expired idempotency receipts dropped
    pub receipts_purged: usize,
}

impl GcReport {
    pub fn total_purged(&self) -> usize {
        self.purged.values().sum()
    }
}

pub struct TombstoneManager<'a> {
    db: &'a Database,
    policy: &'a TombstonePolicy,
    clock: &'a dyn Clock,
}

impl<'a> TombstoneManager<'a> {
    pub const fn new(db: &'a Database, policy: &'a TombstonePolicy, clock: &'a dyn Clock) -> Self {
        Self { db, policy, clock }
    }

    /// Purge eligible tombstones of one entity type, returning how many went
    pub fn gc(&self, entity_type: &str) -> Result<usize> {
        let now = self.clock.now_ms();
        let deleted_before = now.saturating_sub(duration_ms(self.policy.retention));
        let active_since = self
            .policy
            .abandoned_device_after
            .map(|after| now.saturating_sub(duration_ms(after)));

        let conn = self.db.connection()?;
        let tx = conn.unchecked_transaction()?;

        let min_cursor = SqliteCursorRepository::new(&tx).min_active_seq(entity_type, active_since)?;
        let log = SqliteChangeLog::new(&tx);
        let tombstones = log.purgeable_tombstones(entity_type, deleted_before, min_cursor)?;
        if tombstones.is_empty() {
            return Ok(0);
        }

        let records = SqliteRecordRepository::new(&tx);
        let mut purged_through = 0;
        for (id, seq) in &tombstones {
            records.purge(entity_type, id)?;
            log.purge_record(entity_type, id)?;
            purged_through = purged_through.max(*seq);
        }
        let horizon = log.raise_horizon(entity_type, purged_through, now)?;
        tx.commit()?;

        tracing::info!(
            entity_type,
            purged = tombstones.len(),
            purged_through_seq = horizon.purged_through_seq,
            gc_epoch = horizon.epoch,
            "Purged tombstones"
        );
        Ok(tombstones.len())
    }
}
