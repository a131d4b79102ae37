//! Change-stream cursors
//!
//! A cursor marks how much of one entity type's change log a device has
//! consumed. Clients treat it as an opaque token; the server reads the change
//! log sequence from it and keeps the position of the last delivered record
//! for diagnostics.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use super::RecordId;
use crate::error::{Error, Result};

const TOKEN_VERSION: &str = "v1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Cursor {
    pub entity_type: String,
    /// Change log sequence of the last consumed entry (0 = nothing consumed)
    pub seq: i64,
    /// `last_modified_at` of the last delivered record
    pub last_modified_at: i64,
    /// Version of the last delivered record
    pub version: i64,
    /// Id of the last delivered record
    pub record_id: Option<RecordId>,
    /// Tombstone GC generation the cursor was issued under
    pub gc_epoch: i64,
}

impl Cursor {
    /// Cursor that has consumed nothing; a pull from here is a full resync
    pub fn origin(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            seq: 0,
            last_modified_at: 0,
            version: 0,
            record_id: None,
            gc_epoch: 0,
        }
    }

    pub const fn is_origin(&self) -> bool {
        self.seq == 0
    }

    /// Encode as an opaque, URL-safe token
    pub fn encode(&self) -> String {
        let raw = format!(
            "{TOKEN_VERSION}|{}|{}|{}|{}|{}|{}",
            self.entity_type,
            self.seq,
            self.last_modified_at,
            self.version,
            self.gc_epoch,
            self.record_id.as_ref().map_or("", RecordId::as_str)
        );
        URL_SAFE_NO_PAD.encode(raw)
    }

    /// Decode a token produced by [`Cursor::encode`]
    ///
    /// Anything unreadable is a `CursorInvalid`: the client cannot continue
    /// incrementally from a position the server does not understand.
    pub fn decode(token: &str) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|_| Error::CursorInvalid("cursor token is not valid base64".into()))?;
        let raw = String::from_utf8(bytes)
            .map_err(|_| Error::CursorInvalid("cursor token is not valid UTF-8".into()))?;

        let mut parts = raw.splitn(7, '|');
        let malformed = || Error::CursorInvalid("malformed cursor token".into());

        if parts.next() != Some(TOKEN_VERSION) {
            return Err(Error::CursorInvalid("unsupported cursor token version".into()));
        }
        let entity_type = parts.next().filter(|s| !s.is_empty()).ok_or_else(malformed)?;
        let seq = parse_i64(parts.next()).ok_or_else(malformed)?;
        let last_modified_at = parse_i64(parts.next()).ok_or_else(malformed)?;
        let version = parse_i64(parts.next()).ok_or_else(malformed)?;
        let gc_epoch = parse_i64(parts.next()).ok_or_else(malformed)?;
        let record_id = parts.next().ok_or_else(malformed)?;

        if seq < 0 || gc_epoch < 0 {
            return Err(malformed());
        }

        Ok(Self {
            entity_type: entity_type.to_string(),
            seq,
            last_modified_at,
            version,
            record_id: (!record_id.is_empty()).then(|| RecordId::new(record_id)),
            gc_epoch,
        })
    }
}

fn parse_i64(part: Option<&str>) -> Option<i64> {
    part?.parse().ok()
}

impl From<Cursor> for String {
    fn from(cursor: Cursor) -> Self {
        cursor.encode()
    }
}

impl TryFrom<String> for Cursor {
    type Error = Error;

    fn try_from(token: String) -> Result<Self> {
        Self::decode(&token)
    }
}

/// Stored cursor of one device for one entity type
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CursorState {
    pub device_id: String,
    pub cursor: Cursor,
    /// When the cursor last moved (Unix ms)
    pub updated_at: i64,
    /// When the device's latest full resync began (Unix ms)
    pub resync_started_at: i64,
}
