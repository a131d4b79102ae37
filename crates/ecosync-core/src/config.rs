//! Engine configuration
//!
//! Retention and retry windows are policy, not something the engine can
//! infer from the data, so every knob lives here with a conservative default.

use std::collections::HashMap;
use std::env;
use std::ops::RangeInclusive;
use std::time::Duration;

use thiserror::Error;

const DAY_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// When tombstones may be purged permanently
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TombstonePolicy {
    /// Minimum age of a tombstone before it is eligible for purge
    pub retention: Duration,
    /// Devices silent for longer than this are left out of the minimum-cursor
    /// computation. `None` keeps every active device in it.
    pub abandoned_device_after: Option<Duration>,
}

impl Default for TombstonePolicy {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(30 * DAY_SECS),
            abandoned_device_after: None,
        }
    }
}

/// Configuration for the sync engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub tombstone: TombstonePolicy,
    /// How long push receipts are kept for replay deduplication
    pub idempotency_window: Duration,
    /// Optimistic commit attempts per pushed record before giving up
    pub max_commit_attempts: u32,
    /// Records returned per pull when the client does not ask for a limit
    pub pull_page_size: usize,
    /// Upper bound on a client-requested pull limit
    pub max_pull_page_size: usize,
    /// A device that has not synced for this long is reported as needing sync
    pub stale_sync_after: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tombstone: TombstonePolicy::default(),
            idempotency_window: Duration::from_secs(DAY_SECS),
            max_commit_attempts: 5,
            pull_page_size: 100,
            max_pull_page_size: 1_000,
            stale_sync_after: Duration::from_secs(60 * 60),
        }
    }
}

impl SyncConfig {
    #[must_use]
    pub const fn with_tombstone_policy(mut self, policy: TombstonePolicy) -> Self {
        self.tombstone = policy;
        self
    }

    #[must_use]
    pub const fn with_idempotency_window(mut self, window: Duration) -> Self {
        self.idempotency_window = window;
        self
    }

    #[must_use]
    pub const fn with_max_commit_attempts(mut self, attempts: u32) -> Self {
        self.max_commit_attempts = attempts;
        self
    }

    #[must_use]
    pub const fn with_pull_page_size(mut self, page_size: usize) -> Self {
        self.pull_page_size = page_size;
        self
    }

    /// Clamp a client-requested pull limit to the configured bounds
    pub fn page_limit(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.pull_page_size)
            .clamp(1, self.max_pull_page_size.max(1))
    }

    /// Load configuration from `ECOSYNC_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let retention_days = parse_bounded(
            &lookup,
            "ECOSYNC_TOMBSTONE_RETENTION_DAYS",
            30,
            1..=3_650,
        )?;

        let abandoned_device_after =
            match optional_trimmed(&lookup, "ECOSYNC_ABANDONED_DEVICE_DAYS") {
                None => None,
                Some(value) => {
                    let days = value.parse::<u64>().map_err(|_| {
                        ConfigError::Invalid(
                            "ECOSYNC_ABANDONED_DEVICE_DAYS must be an integer in [1, 3650]"
                                .to_string(),
                        )
                    })?;
                    if !(1..=3_650).contains(&days) {
                        return Err(ConfigError::Invalid(
                            "ECOSYNC_ABANDONED_DEVICE_DAYS must be in [1, 3650]".to_string(),
                        ));
                    }
                    Some(Duration::from_secs(days * DAY_SECS))
                }
            };

        if let Some(abandoned) = abandoned_device_after {
            if abandoned.as_secs() < retention_days * DAY_SECS {
                return Err(ConfigError::Invalid(
                    "ECOSYNC_ABANDONED_DEVICE_DAYS must not be shorter than the tombstone retention"
                        .to_string(),
                ));
            }
        }

        let idempotency_window_secs = parse_bounded(
            &lookup,
            "ECOSYNC_IDEMPOTENCY_WINDOW_SECS",
            defaults.idempotency_window.as_secs(),
            60..=30 * DAY_SECS,
        )?;

        let max_commit_attempts = parse_bounded(
            &lookup,
            "ECOSYNC_MAX_COMMIT_ATTEMPTS",
            u64::from(defaults.max_commit_attempts),
            1..=50,
        )?;

        let max_pull_page_size = parse_bounded(
            &lookup,
            "ECOSYNC_MAX_PULL_PAGE_SIZE",
            defaults.max_pull_page_size as u64,
            1..=10_000,
        )?;

        let pull_page_size = parse_bounded(
            &lookup,
            "ECOSYNC_PULL_PAGE_SIZE",
            defaults.pull_page_size as u64,
            1..=max_pull_page_size,
        )?;

        let stale_sync_secs = parse_bounded(
            &lookup,
            "ECOSYNC_STALE_SYNC_SECS",
            defaults.stale_sync_after.as_secs(),
            60..=30 * DAY_SECS,
        )?;

        Ok(Self {
            tombstone: TombstonePolicy {
                retention: Duration::from_secs(retention_days * DAY_SECS),
                abandoned_device_after,
            },
            idempotency_window: Duration::from_secs(idempotency_window_secs),
            max_commit_attempts: u32::try_from(max_commit_attempts)
                .map_err(|_| ConfigError::Invalid("ECOSYNC_MAX_COMMIT_ATTEMPTS".to_string()))?,
            pull_page_size: usize::try_from(pull_page_size)
                .map_err(|_| ConfigError::Invalid("ECOSYNC_PULL_PAGE_SIZE".to_string()))?,
            max_pull_page_size: usize::try_from(max_pull_page_size)
                .map_err(|_| ConfigError::Invalid("ECOSYNC_MAX_PULL_PAGE_SIZE".to_string()))?,
            stale_sync_after: Duration::from_secs(stale_sync_secs),
        })
    }
}

fn parse_bounded(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: u64,
    bounds: RangeInclusive<u64>,
) -> Result<u64, ConfigError> {
    let Some(raw) = optional_trimmed(lookup, name) else {
        return Ok(default);
    };

    let value = raw.parse::<u64>().map_err(|_| {
        ConfigError::Invalid(format!(
            "{name} must be an integer in [{}, {}]",
            bounds.start(),
            bounds.end()
        ))
    })?;
    if !bounds.contains(&value) {
        return Err(ConfigError::Invalid(format!(
            "{name} must be in [{}, {}]",
            bounds.start(),
            bounds.end()
        )));
    }
    Ok(value)
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}
