//! Push request and result types

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{RecordId, SyncableRecord};

/// What a pushed record does to its target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "payload", rename_all = "snake_case")]
pub enum Mutation {
    /// Create or replace the record's payload (resurrects a tombstone)
    Upsert(Value),
    /// Soft delete
    Delete,
}

impl Mutation {
    pub const fn is_delete(&self) -> bool {
        matches!(self, Self::Delete)
    }
}

/// A local mutation sent by a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushedRecord {
    pub record_id: RecordId,
    /// Client-generated token; replays with the same token are no-ops
    pub idempotency_token: String,
    pub mutation: Mutation,
    /// When the client made the change (Unix ms). Advisory: bounded by the
    /// server clock before use.
    #[serde(default)]
    pub client_timestamp: Option<i64>,
}

impl PushedRecord {
    pub fn upsert(
        record_id: impl Into<RecordId>,
        idempotency_token: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            record_id: record_id.into(),
            idempotency_token: idempotency_token.into(),
            mutation: Mutation::Upsert(payload),
            client_timestamp: None,
        }
    }

    pub fn delete(record_id: impl Into<RecordId>, idempotency_token: impl Into<String>) -> Self {
        Self {
            record_id: record_id.into(),
            idempotency_token: idempotency_token.into(),
            mutation: Mutation::Delete,
            client_timestamp: None,
        }
    }

    /// Attach the client-side modification time
    #[must_use]
    pub const fn at(mut self, client_timestamp: i64) -> Self {
        self.client_timestamp = Some(client_timestamp);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictReason {
    /// A newer write already won
    StaleWrite,
}

/// Returned for every rejected push so the client can reconcile locally
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictReport {
    pub record_id: RecordId,
    pub reason: ConflictReason,
    /// Server state the client must adopt
    pub authoritative: SyncableRecord,
}

/// Per-record result of a push
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PushOutcome {
    /// Committed as a new version
    Applied { version: i64, last_modified_at: i64 },
    /// The server already holds exactly this write
    Unchanged { version: i64 },
    /// Lost last-write-wins
    Rejected(ConflictReport),
    /// Target (or its parent) does not exist or is tombstoned
    NotFound { entity_type: String, id: RecordId },
    /// Malformed push; nothing was written
    Invalid { reason: String },
}

impl PushOutcome {
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }

    pub const fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }

    /// Version the client now shares with the server, if any
    pub const fn acknowledged_version(&self) -> Option<i64> {
        match self {
            Self::Applied { version, .. } | Self::Unchanged { version } => Some(*version),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushResult {
    pub record_id: RecordId,
    pub idempotency_token: String,
    pub outcome: PushOutcome,
}
