//! Sync conflict model

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use super::RecordId;
use crate::error::Error;

/// How a recorded conflict was closed by an explicit decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    ClientWins,
    ServerWins,
    Manual,
}

impl ConflictResolution {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ClientWins => "client_wins",
            Self::ServerWins => "server_wins",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for ConflictResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictResolution {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "client_wins" => Ok(Self::ClientWins),
            "server_wins" => Ok(Self::ServerWins),
            "manual" => Ok(Self::Manual),
            other => Err(Error::InvalidInput(format!(
                "unknown conflict resolution: {other}"
            ))),
        }
    }
}

/// Decision a user makes about a recorded conflict
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "resolution", rename_all = "snake_case")]
pub enum ConflictDecision {
    /// Restore the rejected write as a new version
    ClientWins,
    /// Keep the server state
    ServerWins,
    /// Commit a hand-merged payload as a new version
    Manual { payload: Value },
}

impl ConflictDecision {
    pub const fn resolution(&self) -> ConflictResolution {
        match self {
            Self::ClientWins => ConflictResolution::ClientWins,
            Self::ServerWins => ConflictResolution::ServerWins,
            Self::Manual { .. } => ConflictResolution::Manual,
        }
    }
}

/// Recorded sync conflict resolved by strategy (e.g., LWW)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConflict {
    /// Conflict row identifier
    pub id: i64,
    /// Device whose push lost
    pub device_id: String,
    pub entity_type: String,
    pub record_id: RecordId,
    /// Stamp of the rejected write
    pub incoming_timestamp: i64,
    /// Rejected payload, kept so the write can still be restored
    pub client_payload: Value,
    /// The rejected write was a delete
    pub client_deleted: bool,
    /// Server version that won
    pub server_version: i64,
    /// Server stamp that won
    pub server_timestamp: i64,
    /// Device that produced the winning version
    pub server_device_id: Option<String>,
    pub server_payload: Value,
    /// Resolution strategy name
    pub strategy: String,
    /// Detection timestamp (unix ms)
    pub created_at: i64,
    pub resolved_at: Option<i64>,
    pub resolution: Option<ConflictResolution>,
}

impl SyncConflict {
    pub const fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }
}

/// Conflict about to be recorded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSyncConflict {
    pub device_id: String,
    pub entity_type: String,
    pub record_id: RecordId,
    pub incoming_timestamp: i64,
    pub client_payload: Value,
    pub client_deleted: bool,
    pub server_version: i64,
    pub server_timestamp: i64,
    pub server_device_id: Option<String>,
    pub server_payload: Value,
    pub strategy: String,
}
