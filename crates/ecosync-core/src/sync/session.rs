//! Sync session coordinator
//!
//! One [`SyncEngine::sync_batch`] call is one client exchange: the pushed
//! mutations are resolved and committed record by record, then the delta
//! after the client's cursor is read and the stored cursor advanced in the
//! same transaction as that read.
//!
//! Sessions hold the database lock only for single statements or short
//! transactions. A record is read, resolved without the lock, and written
//! under an expected-version guard; losing the guard means another session
//! committed in between, so the record is re-read and resolved again.

use std::sync::Arc;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::changes::ChangeStream;
use super::resolver::{ConflictResolver, IncomingWrite, LastWriteWins, Resolution, WriteStamp};
use super::tombstone::{GcReport, TombstoneManager};
use super::versioning::{CommitOutcome, ProposedWrite, VersioningAuthority};
use crate::clock::{duration_ms, Clock, SystemClock};
use crate::config::SyncConfig;
use crate::db::{
    ChangeLogRepository, ConflictRepository, CursorRepository, Database, DeviceRepository,
    ReceiptRepository, RecordRepository, SqliteChangeLog, SqliteConflictRepository,
    SqliteCursorRepository, SqliteDeviceRepository, SqliteReceiptRepository,
    SqliteRecordRepository,
};
use crate::error::{Error, Result};
use crate::models::{
    sanitize_payload, ConflictDecision, ConflictReason, ConflictReport, Cursor, CursorState, Device,
    DeviceRegistration, EntityDefinition, EntityRegistry, GcHorizon, LogEntry, Mutation,
    NewSyncConflict, ParentLink, PushOutcome, PushResult, PushedRecord, RecordId, SyncConflict,
    SyncableRecord,
};

/// One client exchange for one entity type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    /// Account the device belongs to
    pub client_id: String,
    pub device_id: String,
    pub entity_type: String,
    /// Local mutations, applied in order
    #[serde(default)]
    pub pushes: Vec<PushedRecord>,
    /// Last cursor the client received; `None` asks for a full resync
    #[serde(default)]
    pub cursor: Option<Cursor>,
    /// Maximum records to pull; clamped to the configured bounds
    #[serde(default)]
    pub limit: Option<usize>,
}

impl SyncRequest {
    pub fn new(
        client_id: impl Into<String>,
        device_id: impl Into<String>,
        entity_type: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            device_id: device_id.into(),
            entity_type: entity_type.into(),
            pushes: Vec::new(),
            cursor: None,
            limit: None,
        }
    }

    #[must_use]
    pub fn push(mut self, record: PushedRecord) -> Self {
        self.pushes.push(record);
        self
    }

    #[must_use]
    pub fn with_cursor(mut self, cursor: Option<Cursor>) -> Self {
        self.cursor = cursor;
        self
    }

    #[must_use]
    pub const fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResponse {
    /// One result per pushed record, in push order
    pub results: Vec<PushResult>,
    /// Delta after the request cursor, ordered by `(last_modified_at, version, id)`
    pub records: Vec<SyncableRecord>,
    pub next_cursor: Cursor,
    /// More changes are waiting; pull again with `next_cursor`
    pub has_more: bool,
}

/// Sync health of one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub device: Device,
    pub cursors: Vec<CursorState>,
    pub conflicts_recorded: usize,
    /// Recorded conflicts nobody has decided on yet
    pub conflicts_unresolved: usize,
    /// Never synced, or last sync older than the configured staleness
    pub needs_sync: bool,
    /// Silent past the abandoned-device threshold; no longer holds back GC
    pub abandoned: bool,
}

/// The pushed record being settled and who pushed it
struct PushContext<'a> {
    entity_type: &'a str,
    device_id: &'a str,
    push: &'a PushedRecord,
    receipts_since: i64,
}

impl PushContext<'_> {
    fn replayed(&self, conn: &Connection) -> Result<Option<PushOutcome>> {
        SqliteReceiptRepository::new(conn).find(
            self.entity_type,
            &self.push.record_id,
            &self.push.idempotency_token,
            self.receipts_since,
        )
    }

    fn store_receipt(&self, conn: &Connection, outcome: &PushOutcome, now: i64) -> Result<()> {
        SqliteReceiptRepository::new(conn).store(
            self.entity_type,
            &self.push.record_id,
            &self.push.idempotency_token,
            self.device_id,
            outcome,
            now,
        )
    }
}

/// Server-side sync engine shared by all sessions
pub struct SyncEngine {
    db: Arc<Database>,
    config: SyncConfig,
    registry: EntityRegistry,
    clock: Arc<dyn Clock>,
    authority: VersioningAuthority,
    resolver: Box<dyn ConflictResolver>,
}

impl SyncEngine {
    /// Engine with the default entity types, the system clock and LWW
    pub fn new(db: Arc<Database>, config: SyncConfig) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Self {
            db,
            config,
            registry: EntityRegistry::with_defaults(),
            authority: VersioningAuthority::new(clock.clone()),
            clock,
            resolver: Box::new(LastWriteWins),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.authority = VersioningAuthority::new(clock.clone());
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_registry(mut self, registry: EntityRegistry) -> Self {
        self.registry = registry;
        self
    }

    #[must_use]
    pub fn with_resolver(mut self, resolver: impl ConflictResolver + 'static) -> Self {
        self.resolver = Box::new(resolver);
        self
    }

    pub const fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub const fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    /// Run one push+pull exchange
    ///
    /// Conflicts come back as per-record outcomes. Errors mean nothing past
    /// the failing step happened; pushes already settled stay settled and are
    /// replayed from their receipts when the client retries.
    pub fn sync_batch(&self, request: SyncRequest) -> Result<SyncResponse> {
        let started_at = self.clock.now_ms();
        let definition = self.registry.require(&request.entity_type)?;
        let device = self.authorize(&request.client_id, &request.device_id)?;

        // A resync-required session must not apply anything
        {
            let conn = self.db.connection()?;
            check_cursor(&conn, &request.entity_type, request.cursor.as_ref())?;
        }

        let mut results = Vec::with_capacity(request.pushes.len());
        for push in request.pushes {
            let outcome = self.apply_push(definition, &device.id, &push)?;
            results.push(PushResult {
                record_id: push.record_id,
                idempotency_token: push.idempotency_token,
                outcome,
            });
        }

        let limit = self.config.page_limit(request.limit);
        let (records, next_cursor, has_more) = self.pull(
            &device.id,
            &request.entity_type,
            request.cursor.as_ref(),
            limit,
            started_at,
        )?;

        tracing::info!(
            device_id = %device.id,
            entity_type = %request.entity_type,
            pushed = results.len(),
            applied = results.iter().filter(|r| r.outcome.is_applied()).count(),
            rejected = results.iter().filter(|r| r.outcome.is_rejected()).count(),
            pulled = records.len(),
            has_more,
            "Sync batch complete"
        );

        Ok(SyncResponse {
            results,
            records,
            next_cursor,
            has_more,
        })
    }

    /// Lazy stream of changes after `cursor` (`None` streams everything)
    pub fn changes_since(&self, entity_type: &str, cursor: Option<&Cursor>) -> Result<ChangeStream<'_>> {
        self.registry.require(entity_type)?;
        let horizon = {
            let conn = self.db.connection()?;
            check_cursor(&conn, entity_type, cursor)?
        };

        let from = Cursor {
            gc_epoch: horizon.epoch,
            ..cursor
                .cloned()
                .unwrap_or_else(|| Cursor::origin(entity_type))
        };
        Ok(ChangeStream::new(&self.db, from, self.config.pull_page_size))
    }

    /// Record that a device consumed changes up to `cursor`
    ///
    /// Returns `false` when the stored cursor is already further along.
    pub fn advance_cursor(&self, client_id: &str, device_id: &str, cursor: &Cursor) -> Result<bool> {
        self.registry.require(&cursor.entity_type)?;
        let device = self.authorize(client_id, device_id)?;

        let conn = self.db.connection()?;
        check_cursor(&conn, &cursor.entity_type, Some(cursor))?;
        SqliteCursorRepository::new(&conn).advance(&device.id, cursor, self.clock.now_ms())
    }

    pub fn register_device(&self, registration: &DeviceRegistration) -> Result<Device> {
        let conn = self.db.connection()?;
        SqliteDeviceRepository::new(&conn).upsert(registration, self.clock.now_ms())
    }

    pub fn list_devices(&self, client_id: &str, include_inactive: bool) -> Result<Vec<Device>> {
        let conn = self.db.connection()?;
        SqliteDeviceRepository::new(&conn).list(client_id, include_inactive)
    }

    /// Deactivate a device; it can no longer sync and stops holding back GC
    pub fn revoke_device(&self, client_id: &str, device_id: &str) -> Result<Device> {
        let conn = self.db.connection()?;
        let devices = SqliteDeviceRepository::new(&conn);
        owned_device(&devices, client_id, device_id)?;

        devices.set_active(device_id, false)?;
        tracing::info!(device_id, client_id, "Revoked device");

        devices
            .get(device_id)?
            .ok_or_else(|| Error::DeviceNotRegistered(device_id.to_string()))
    }

    /// Recorded LWW rejections, newest first
    pub fn conflicts(
        &self,
        device_id: Option<&str>,
        unresolved_only: bool,
        limit: usize,
    ) -> Result<Vec<SyncConflict>> {
        let conn = self.db.connection()?;
        SqliteConflictRepository::new(&conn).list(device_id, unresolved_only, limit)
    }

    /// Settle a recorded conflict by an explicit decision
    ///
    /// `ClientWins` and `Manual` commit a new version stamped with server
    /// time on behalf of the device that lost. `ServerWins` only closes the
    /// conflict. Either way the conflict is marked resolved exactly once.
    pub fn resolve_conflict(
        &self,
        client_id: &str,
        conflict_id: i64,
        decision: ConflictDecision,
    ) -> Result<SyncConflict> {
        let conflict = {
            let conn = self.db.connection()?;
            let conflict = SqliteConflictRepository::new(&conn)
                .get(conflict_id)?
                .ok_or(Error::ConflictNotFound(conflict_id))?;
            owned_device(&SqliteDeviceRepository::new(&conn), client_id, &conflict.device_id)?;
            conflict
        };
        if conflict.is_resolved() {
            return Err(Error::ConflictResolved(conflict_id));
        }

        let resolution = decision.resolution();
        let (is_deleted, payload) = match decision {
            ConflictDecision::ServerWins => {
                let conn = self.db.connection()?;
                let conflicts = SqliteConflictRepository::new(&conn);
                if !conflicts.mark_resolved(conflict_id, resolution, self.clock.now_ms())? {
                    return Err(Error::ConflictResolved(conflict_id));
                }
                tracing::info!(conflict_id, %resolution, "Resolved conflict");
                return conflicts
                    .get(conflict_id)?
                    .ok_or(Error::ConflictNotFound(conflict_id));
            }
            ConflictDecision::ClientWins => (conflict.client_deleted, conflict.client_payload.clone()),
            ConflictDecision::Manual { payload } => (false, sanitize_payload(payload)?),
        };

        let definition = self.registry.require(&conflict.entity_type)?;
        let not_found = || Error::RecordNotFound {
            entity_type: conflict.entity_type.clone(),
            id: conflict.record_id.to_string(),
        };

        let attempts = self.config.max_commit_attempts.max(1);
        for attempt in 1..=attempts {
            let current = {
                let conn = self.db.connection()?;
                if let (Some(link), false) = (&definition.parent, is_deleted) {
                    if let Some(outcome) = check_parent(&conn, link, &payload)? {
                        return Err(Error::InvalidInput(format!(
                            "cannot restore {}/{}: {outcome:?}",
                            conflict.entity_type, conflict.record_id
                        )));
                    }
                }
                SqliteRecordRepository::new(&conn)
                    .get(&conflict.entity_type, &conflict.record_id)?
                    .ok_or_else(not_found)?
            };

            let conn = self.db.connection()?;
            let tx = conn.unchecked_transaction()?;
            let write = ProposedWrite {
                entity_type: conflict.entity_type.clone(),
                id: conflict.record_id.clone(),
                is_deleted,
                payload: if is_deleted { Value::Object(Map::new()) } else { payload.clone() },
                stamp: self.authority.now().max(current.meta.last_modified_at),
                device_id: conflict.device_id.clone(),
            };
            let CommitOutcome::Committed { record, .. } = self.authority.commit(&tx, Some(&current), &write)? else {
                tracing::debug!(conflict_id, attempt, "Version guard lost, re-reading");
                continue;
            };

            let conflicts = SqliteConflictRepository::new(&tx);
            if !conflicts.mark_resolved(conflict_id, resolution, self.clock.now_ms())? {
                return Err(Error::ConflictResolved(conflict_id));
            }
            let resolved = conflicts
                .get(conflict_id)?
                .ok_or(Error::ConflictNotFound(conflict_id))?;
            tx.commit()?;

            tracing::info!(
                conflict_id,
                %resolution,
                entity_type = %record.entity_type,
                id = %record.id,
                version = record.version(),
                "Resolved conflict"
            );
            return Ok(resolved);
        }

        Err(Error::ConcurrentCommitConflict {
            entity_type: conflict.entity_type,
            id: conflict.record_id.to_string(),
            attempts,
        })
    }

    pub fn status(&self, client_id: &str, device_id: &str) -> Result<SyncStatus> {
        let now = self.clock.now_ms();
        let conn = self.db.connection()?;
        let device = owned_device(&SqliteDeviceRepository::new(&conn), client_id, device_id)?;

        let stale_after = duration_ms(self.config.stale_sync_after);
        let needs_sync = match device.last_sync_at {
            Some(at) => now.saturating_sub(at) > stale_after,
            None => true,
        };

        let abandoned = self
            .config
            .tombstone
            .abandoned_device_after
            .is_some_and(|after| device.last_activity() < now.saturating_sub(duration_ms(after)));

        let conflicts = SqliteConflictRepository::new(&conn);
        Ok(SyncStatus {
            cursors: SqliteCursorRepository::new(&conn).list_for_device(device_id)?,
            conflicts_recorded: conflicts.count_for_device(device_id, false)?,
            conflicts_unresolved: conflicts.count_for_device(device_id, true)?,
            device,
            needs_sync,
            abandoned,
        })
    }

    /// Logged versions of a record, oldest first
    pub fn history(&self, entity_type: &str, id: &RecordId) -> Result<Vec<LogEntry>> {
        self.registry.require(entity_type)?;
        let conn = self.db.connection()?;
        SqliteChangeLog::new(&conn).history(entity_type, id)
    }

    /// Current server state of a record, tombstones included
    pub fn get(&self, entity_type: &str, id: &RecordId) -> Result<SyncableRecord> {
        self.registry.require(entity_type)?;
        let conn = self.db.connection()?;
        SqliteRecordRepository::new(&conn)
            .get(entity_type, id)?
            .ok_or_else(|| Error::RecordNotFound {
                entity_type: entity_type.to_string(),
                id: id.to_string(),
            })
    }

    /// Drop idempotency receipts older than the window
    pub fn purge_expired_receipts(&self) -> Result<usize> {
        let cutoff = self.receipts_since();
        let conn = self.db.connection()?;
        let purged = SqliteReceiptRepository::new(&conn).purge_before(cutoff)?;
        if purged > 0 {
            tracing::debug!(purged, "Purged expired push receipts");
        }
        Ok(purged)
    }

    /// Purge eligible tombstones of one entity type
    pub fn gc(&self, entity_type: &str) -> Result<usize> {
        self.registry.require(entity_type)?;
        TombstoneManager::new(&self.db, &self.config.tombstone, self.clock.as_ref()).gc(entity_type)
    }

    /// Maintenance pass: tombstone GC for every entity type plus receipt purge
    pub fn gc_all(&self) -> Result<GcReport> {
        let mut report = GcReport::default();
        for entity_type in self.registry.names() {
            let purged = self.gc(entity_type)?;
            report.purged.insert(entity_type.to_string(), purged);
        }
        report.receipts_purged = self.purge_expired_receipts()?;
        Ok(report)
    }

    fn receipts_since(&self) -> i64 {
        self.clock
            .now_ms()
            .saturating_sub(duration_ms(self.config.idempotency_window))
    }

    fn authorize(&self, client_id: &str, device_id: &str) -> Result<Device> {
        let conn = self.db.connection()?;
        let device = owned_device(&SqliteDeviceRepository::new(&conn), client_id, device_id)?;
        if !device.is_active {
            return Err(Error::DeviceInactive(device_id.to_string()));
        }
        Ok(device)
    }

    fn apply_push(&self, definition: &EntityDefinition, device_id: &str, push: &PushedRecord) -> Result<PushOutcome> {
        let ctx = PushContext {
            entity_type: &definition.name,
            device_id,
            push,
            receipts_since: self.receipts_since(),
        };

        if push.record_id.is_empty() {
            return Ok(invalid("record id must not be empty"));
        }
        if push.idempotency_token.trim().is_empty() {
            return Ok(invalid("idempotency token must not be empty"));
        }

        let payload = match &push.mutation {
            Mutation::Upsert(payload) => match sanitize_payload(payload.clone()) {
                Ok(payload) => Some(payload),
                Err(err) => return Ok(invalid(err.to_string())),
            },
            Mutation::Delete => None,
        };
        let stamp = WriteStamp::new(self.authority.stamp(push.client_timestamp), device_id);

        let attempts = self.config.max_commit_attempts.max(1);
        for attempt in 1..=attempts {
            let current = {
                let conn = self.db.connection()?;
                if let Some(outcome) = ctx.replayed(&conn)? {
                    tracing::debug!(id = %push.record_id, token = %push.idempotency_token, "Replayed push");
                    return Ok(outcome);
                }
                if let (Some(link), Some(payload)) = (&definition.parent, &payload) {
                    if let Some(outcome) = check_parent(&conn, link, payload)? {
                        return Ok(outcome);
                    }
                }
                SqliteRecordRepository::new(&conn).get(ctx.entity_type, &push.record_id)?
            };

            let incoming = match (&payload, &current) {
                (Some(payload), _) => IncomingWrite {
                    stamp: stamp.clone(),
                    is_deleted: false,
                    payload: payload.clone(),
                },
                (None, Some(_)) => IncomingWrite {
                    stamp: stamp.clone(),
                    is_deleted: true,
                    payload: Value::Object(Map::new()),
                },
                (None, None) => {
                    return Ok(PushOutcome::NotFound {
                        entity_type: ctx.entity_type.to_string(),
                        id: push.record_id.clone(),
                    })
                }
            };

            let settled = match (self.resolver.resolve(current.as_ref(), &incoming), current) {
                (Resolution::Accept, current) | (_, current @ None) => {
                    self.settle_accepted(&ctx, current.as_ref(), incoming)?
                }
                (Resolution::Reject, Some(current)) => self.settle_rejected(&ctx, current, &incoming)?,
                (Resolution::Merge, Some(current)) => self.settle_merged(&ctx, &current)?,
            };
            if let Some(outcome) = settled {
                return Ok(outcome);
            }

            tracing::debug!(id = %push.record_id, attempt, "Version guard lost, re-reading");
        }

        tracing::warn!(
            entity_type = ctx.entity_type,
            id = %push.record_id,
            attempts,
            "Giving up on contended record"
        );
        Err(Error::ConcurrentCommitConflict {
            entity_type: ctx.entity_type.to_string(),
            id: push.record_id.to_string(),
            attempts,
        })
    }

    /// Commit the winning write; `None` if the version guard was lost
    fn settle_accepted(
        &self,
        ctx: &PushContext<'_>,
        current: Option<&SyncableRecord>,
        incoming: IncomingWrite,
    ) -> Result<Option<PushOutcome>> {
        let conn = self.db.connection()?;
        let tx = conn.unchecked_transaction()?;

        let write = ProposedWrite {
            entity_type: ctx.entity_type.to_string(),
            id: ctx.push.record_id.clone(),
            is_deleted: incoming.is_deleted,
            payload: incoming.payload,
            stamp: incoming.stamp.last_modified_at,
            device_id: ctx.device_id.to_string(),
        };
        let CommitOutcome::Committed { record, .. } = self.authority.commit(&tx, current, &write)? else {
            return Ok(None);
        };

        let outcome = PushOutcome::Applied {
            version: record.version(),
            last_modified_at: record.meta.last_modified_at,
        };
        ctx.store_receipt(&tx, &outcome, self.authority.now())?;
        tx.commit()?;

        Ok(Some(outcome))
    }

    /// Record a lost write; `None` if the server state moved since it was read
    fn settle_rejected(
        &self,
        ctx: &PushContext<'_>,
        current: SyncableRecord,
        incoming: &IncomingWrite,
    ) -> Result<Option<PushOutcome>> {
        let now = self.clock.now_ms();
        let conn = self.db.connection()?;
        let tx = conn.unchecked_transaction()?;

        if let Some(outcome) = ctx.replayed(&tx)? {
            return Ok(Some(outcome));
        }
        if !still_current(&tx, &current)? {
            return Ok(None);
        }

        SqliteConflictRepository::new(&tx).record(
            &NewSyncConflict {
                device_id: ctx.device_id.to_string(),
                entity_type: ctx.entity_type.to_string(),
                record_id: current.id.clone(),
                incoming_timestamp: incoming.stamp.last_modified_at,
                client_payload: incoming.payload.clone(),
                client_deleted: incoming.is_deleted,
                server_version: current.version(),
                server_timestamp: current.meta.last_modified_at,
                server_device_id: current.meta.modified_by_device_id.clone(),
                server_payload: current.payload.clone(),
                strategy: self.resolver.name().to_string(),
            },
            now,
        )?;

        tracing::info!(
            entity_type = ctx.entity_type,
            id = %current.id,
            device_id = ctx.device_id,
            incoming = incoming.stamp.last_modified_at,
            server = current.meta.last_modified_at,
            "Rejected stale write"
        );

        let outcome = PushOutcome::Rejected(ConflictReport {
            record_id: current.id.clone(),
            reason: ConflictReason::StaleWrite,
            authoritative: current,
        });
        ctx.store_receipt(&tx, &outcome, now)?;
        tx.commit()?;

        Ok(Some(outcome))
    }

    /// Acknowledge a write the server already holds
    fn settle_merged(&self, ctx: &PushContext<'_>, current: &SyncableRecord) -> Result<Option<PushOutcome>> {
        let conn = self.db.connection()?;
        let tx = conn.unchecked_transaction()?;

        if let Some(outcome) = ctx.replayed(&tx)? {
            return Ok(Some(outcome));
        }
        if !still_current(&tx, current)? {
            return Ok(None);
        }

        let outcome = PushOutcome::Unchanged {
            version: current.version(),
        };
        ctx.store_receipt(&tx, &outcome, self.clock.now_ms())?;
        tx.commit()?;

        Ok(Some(outcome))
    }

    fn pull(
        &self,
        device_id: &str,
        entity_type: &str,
        cursor: Option<&Cursor>,
        limit: usize,
        started_at: i64,
    ) -> Result<(Vec<SyncableRecord>, Cursor, bool)> {
        let now = self.clock.now_ms();
        let conn = self.db.connection()?;
        let tx = conn.unchecked_transaction()?;

        // GC may have run while pushes were applied
        let horizon = check_cursor(&tx, entity_type, cursor)?;
        let from = cursor
            .cloned()
            .unwrap_or_else(|| Cursor::origin(entity_type));

        let mut entries = SqliteChangeLog::new(&tx).scan(entity_type, from.seq, limit.saturating_add(1))?;
        let has_more = entries.len() > limit;
        entries.truncate(limit);

        let next_cursor = entries.last().map_or_else(
            || Cursor {
                gc_epoch: horizon.epoch,
                ..from.clone()
            },
            |entry| entry.cursor(horizon.epoch),
        );

        // A device holds its own acknowledged writes, except those pushed
        // before its latest full resync began
        let cursors = SqliteCursorRepository::new(&tx);
        let holds_since = if cursor.is_some() {
            let since = cursors
                .get(device_id, entity_type)?
                .map_or(0, |state| state.resync_started_at);
            cursors.advance(device_id, &next_cursor, now)?;
            since
        } else {
            cursors.replace(device_id, &next_cursor, started_at, now)?;
            started_at
        };
        SqliteDeviceRepository::new(&tx).touch_sync(device_id, now)?;

        let receipts = SqliteReceiptRepository::new(&tx);
        let mut records = Vec::with_capacity(entries.len());
        for entry in entries {
            let record = entry.record;
            let echo = record.modified_by() == device_id
                && receipts.acknowledged(
                    device_id,
                    entity_type,
                    &record.id,
                    record.version(),
                    holds_since,
                )?;
            if !echo {
                records.push(record);
            }
        }
        tx.commit()?;

        records.sort_by(|a, b| {
            (a.meta.last_modified_at, a.meta.version, &a.id).cmp(&(
                b.meta.last_modified_at,
                b.meta.version,
                &b.id,
            ))
        });

        Ok((records, next_cursor, has_more))
    }
}

fn invalid(reason: impl Into<String>) -> PushOutcome {
    PushOutcome::Invalid {
        reason: reason.into(),
    }
}

/// Validate a client cursor against the change log, returning the GC horizon
fn check_cursor(conn: &Connection, entity_type: &str, cursor: Option<&Cursor>) -> Result<GcHorizon> {
    let log = SqliteChangeLog::new(conn);
    let horizon = log.horizon(entity_type)?;
    let Some(cursor) = cursor else {
        return Ok(horizon);
    };

    if cursor.entity_type != entity_type {
        return Err(Error::CursorInvalid(format!(
            "cursor belongs to {}, not {entity_type}",
            cursor.entity_type
        )));
    }
    if !horizon.admits(cursor) {
        tracing::info!(
            entity_type,
            seq = cursor.seq,
            horizon = horizon.purged_through_seq,
            "Cursor predates purged history"
        );
        return Err(Error::CursorInvalid(format!(
            "history up to seq {} has been purged",
            horizon.purged_through_seq
        )));
    }
    if cursor.seq > log.max_seq(entity_type)? {
        return Err(Error::CursorInvalid(format!(
            "cursor seq {} is ahead of the change log",
            cursor.seq
        )));
    }

    Ok(horizon)
}

/// `NotFound`/`Invalid` outcome when a child's parent is unusable
fn check_parent(conn: &Connection, link: &ParentLink, payload: &Value) -> Result<Option<PushOutcome>> {
    let Some(parent_id) = link.parent_id(payload) else {
        return Ok(Some(invalid(format!("missing parent reference `{}`", link.field))));
    };

    let parent = SqliteRecordRepository::new(conn).get(&link.entity_type, &parent_id)?;
    if parent.is_some_and(|parent| !parent.is_deleted()) {
        return Ok(None);
    }

    Ok(Some(PushOutcome::NotFound {
        entity_type: link.entity_type.clone(),
        id: parent_id,
    }))
}

fn still_current(conn: &Connection, record: &SyncableRecord) -> Result<bool> {
    let stored = SqliteRecordRepository::new(conn).get(&record.entity_type, &record.id)?;
    Ok(stored.is_some_and(|stored| stored.version() == record.version()))
}

fn owned_device(devices: &SqliteDeviceRepository<'_>, client_id: &str, device_id: &str) -> Result<Device> {
    let device = devices
        .get(device_id)?
        .ok_or_else(|| Error::DeviceNotRegistered(device_id.to_string()))?;
    if device.client_id != client_id {
        return Err(Error::DeviceOwnership(device_id.to_string()));
    }
    Ok(device)
}
