//! Error types for ecosync-core

use thiserror::Error;

use crate::config::ConfigError;

/// Result type alias using ecosync-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in ecosync-core operations
///
/// Conflict outcomes are not errors: a stale write comes back as
/// [`crate::PushOutcome::Rejected`]. Only storage failures and conditions the
/// caller must act on are surfaced here.
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Entity type is not registered for sync
    #[error("Unknown entity type: {0}")]
    UnknownEntityType(String),

    /// Record not found (or already purged)
    #[error("Record not found: {entity_type}/{id}")]
    RecordNotFound { entity_type: String, id: String },

    /// Device has never registered
    #[error("Device not registered: {0}")]
    DeviceNotRegistered(String),

    /// Device was revoked
    #[error("Device is inactive: {0}")]
    DeviceInactive(String),

    /// Device id is registered to a different client
    #[error("Device {0} belongs to another client")]
    DeviceOwnership(String),

    /// Cursor predates available history; the client must resync from scratch
    #[error("Cursor invalid, full resync required: {0}")]
    CursorInvalid(String),

    /// No conflict row with this id
    #[error("Conflict not found: {0}")]
    ConflictNotFound(i64),

    /// Conflict was already settled
    #[error("Conflict {0} is already resolved")]
    ConflictResolved(i64),

    /// Optimistic version guard kept losing races
    #[error("Concurrent commit conflict on {entity_type}/{id} after {attempts} attempts")]
    ConcurrentCommitConflict {
        entity_type: String,
        id: String,
        attempts: u32,
    },
}

impl Error {
    /// Whether retrying the whole session later may succeed.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConcurrentCommitConflict { .. } | Self::Database(_) | Self::Io(_)
        )
    }

    /// Whether the client must discard its cursor and pull everything again.
    pub const fn requires_full_resync(&self) -> bool {
        matches!(self, Self::CursorInvalid(_))
    }
}
