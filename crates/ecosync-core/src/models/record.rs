//! Syncable record model
//!
//! [`SyncMetadata`] is the shared metadata bag every syncable entity carries.
//! Domain structs embed it with `#[serde(flatten)]` and implement
//! [`Syncable`]; the engine itself only ever sees [`SyncableRecord`], where
//! the domain fields are an opaque JSON payload.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Field names owned by the sync engine; never accepted from a payload
pub const RESERVED_FIELDS: [&str; 6] = [
    "id",
    "version",
    "last_modified_at",
    "is_deleted",
    "deleted_at",
    "modified_by_device_id",
];

/// Stable record identity, unique within an entity type
///
/// Clients create records offline, so ids are client generated. UUID v7 is
/// recommended (time-sortable), but any non-empty string is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh id using UUID v7
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for RecordId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Sync metadata carried by every syncable entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMetadata {
    /// Starts at 1, +1 on every accepted mutation
    pub version: i64,
    /// Stamp of the mutation that produced `version` (Unix ms)
    pub last_modified_at: i64,
    /// Tombstone flag
    #[serde(default)]
    pub is_deleted: bool,
    /// When the record was first tombstoned (Unix ms)
    #[serde(default)]
    pub deleted_at: Option<i64>,
    /// Device that produced the current version
    #[serde(default)]
    pub modified_by_device_id: Option<String>,
}

impl Default for SyncMetadata {
    fn default() -> Self {
        Self {
            version: 1,
            last_modified_at: 0,
            is_deleted: false,
            deleted_at: None,
            modified_by_device_id: None,
        }
    }
}

/// A record as stored and exchanged by the sync engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncableRecord {
    pub entity_type: String,
    pub id: RecordId,
    #[serde(flatten)]
    pub meta: SyncMetadata,
    /// Entity-specific fields, opaque to the engine
    pub payload: Value,
}

impl SyncableRecord {
    pub fn is_deleted(&self) -> bool {
        self.meta.is_deleted
    }

    pub fn version(&self) -> i64 {
        self.meta.version
    }

    /// Device that wrote the current version, empty when unknown
    pub fn modified_by(&self) -> &str {
        self.meta.modified_by_device_id.as_deref().unwrap_or_default()
    }

    /// Whether this record already holds exactly the given state
    pub fn holds(&self, is_deleted: bool, payload: &Value) -> bool {
        self.meta.is_deleted == is_deleted && &self.payload == payload
    }
}

/// Validate a pushed payload and drop engine-owned fields
///
/// Payloads must be JSON objects. `null` is accepted as an empty object.
pub fn sanitize_payload(payload: Value) -> Result<Value> {
    let mut object = match payload {
        Value::Object(object) => object,
        Value::Null => Map::new(),
        other => {
            return Err(Error::InvalidInput(format!(
                "payload must be a JSON object, got {}",
                json_kind(&other)
            )))
        }
    };

    for field in RESERVED_FIELDS {
        object.remove(field);
    }

    Ok(Value::Object(object))
}

const fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Contract for domain entities that take part in sync
///
/// Implementors embed [`SyncMetadata`] (flattened) next to their own fields
/// and name the entity type they are registered under.
pub trait Syncable: Serialize + DeserializeOwned {
    /// Entity type name, as registered in the [`crate::models::EntityRegistry`]
    const ENTITY_TYPE: &'static str;

    fn record_id(&self) -> RecordId;

    fn sync_metadata(&self) -> &SyncMetadata;

    /// Domain fields only, ready to push
    fn to_payload(&self) -> Result<Value> {
        sanitize_payload(serde_json::to_value(self)?)
    }

    /// Rebuild the domain struct from a record received in a pull delta
    fn from_record(record: &SyncableRecord) -> Result<Self> {
        if record.entity_type != Self::ENTITY_TYPE {
            return Err(Error::InvalidInput(format!(
                "expected {} record, got {}",
                Self::ENTITY_TYPE,
                record.entity_type
            )));
        }

        let mut object = match &record.payload {
            Value::Object(object) => object.clone(),
            _ => Map::new(),
        };
        object.insert("id".to_string(), Value::String(record.id.to_string()));
        if let Value::Object(meta) = serde_json::to_value(&record.meta)? {
            object.extend(meta);
        }

        Ok(serde_json::from_value(Value::Object(object))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct Volunteer {
        id: String,
        name: String,
        email: String,
        #[serde(flatten)]
        sync: SyncMetadata,
    }

    impl Syncable for Volunteer {
        const ENTITY_TYPE: &'static str = "volunteer";

        fn record_id(&self) -> RecordId {
            RecordId::new(self.id.clone())
        }

        fn sync_metadata(&self) -> &SyncMetadata {
            &self.sync
        }
    }

    #[test]
    fn test_record_id_generate_unique() {
        let a = RecordId::generate();
        let b = RecordId::generate();
        assert_ne!(a, b);
        assert!(!a.is_empty());
    }

    #[test]
    fn test_metadata_default() {
        let meta = SyncMetadata::default();
        assert_eq!(meta.version, 1);
        assert!(!meta.is_deleted);
        assert!(meta.deleted_at.is_none());
    }

    #[test]
    fn test_sanitize_strips_reserved_fields() {
        let payload = json!({
            "id": "v-1",
            "name": "Ada",
            "version": 99,
            "last_modified_at": 5,
            "modified_by_device_id": "evil"
        });
        assert_eq!(sanitize_payload(payload).unwrap(), json!({ "name": "Ada" }));
    }

    #[test]
    fn test_sanitize_rejects_non_objects() {
        assert!(sanitize_payload(json!([1, 2])).is_err());
        assert!(sanitize_payload(json!("text")).is_err());
        assert_eq!(sanitize_payload(Value::Null).unwrap(), json!({}));
    }

    #[test]
    fn test_syncable_payload_excludes_metadata() {
        let volunteer = Volunteer {
            id: "v-1".into(),
            name: "Ada".into(),
            email: "ada@example.org".into(),
            sync: SyncMetadata::default(),
        };

        assert_eq!(
            volunteer.to_payload().unwrap(),
            json!({ "name": "Ada", "email": "ada@example.org" })
        );
        assert_eq!(volunteer.record_id().as_str(), "v-1");
    }

    #[test]
    fn test_syncable_from_record() {
        let record = SyncableRecord {
            entity_type: "volunteer".into(),
            id: RecordId::new("v-1"),
            meta: SyncMetadata {
                version: 4,
                last_modified_at: 1_700,
                is_deleted: false,
                deleted_at: None,
                modified_by_device_id: Some("phone".into()),
            },
            payload: json!({ "name": "Ada", "email": "ada@example.org" }),
        };

        let volunteer = Volunteer::from_record(&record).unwrap();
        assert_eq!(volunteer.name, "Ada");
        assert_eq!(volunteer.sync_metadata(), &record.meta);
    }

    #[test]
    fn test_syncable_from_record_checks_entity_type() {
        let record = SyncableRecord {
            entity_type: "project".into(),
            id: RecordId::new("p-1"),
            meta: SyncMetadata::default(),
            payload: json!({}),
        };
        assert!(Volunteer::from_record(&record).is_err());
    }

    #[test]
    fn test_record_serializes_flat_metadata() {
        let record = SyncableRecord {
            entity_type: "task".into(),
            id: RecordId::new("t-1"),
            meta: SyncMetadata::default(),
            payload: json!({ "title": "Plant trees" }),
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["version"], json!(1));
        assert_eq!(value["id"], json!("t-1"));
        assert_eq!(value["payload"]["title"], json!("Plant trees"));
    }
}
