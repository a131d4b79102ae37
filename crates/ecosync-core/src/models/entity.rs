//! Registry of syncable entity types

use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::LazyLock;

use super::RecordId;
use crate::error::{Error, Result};

static ENTITY_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_]*$").expect("Invalid regex"));

/// Reference from a child entity to the record it belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentLink {
    /// Parent entity type
    pub entity_type: String,
    /// Payload field holding the parent's id
    pub field: String,
}

impl ParentLink {
    /// Extract the parent id from a payload, if the field is set
    ///
    /// Numeric ids are accepted and compared in their decimal form.
    pub fn parent_id(&self, payload: &Value) -> Option<RecordId> {
        match payload.get(&self.field)? {
            Value::String(id) if !id.trim().is_empty() => Some(RecordId::new(id.clone())),
            Value::Number(id) => Some(RecordId::new(id.to_string())),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDefinition {
    pub name: String,
    pub parent: Option<ParentLink>,
}

/// Entity types the engine accepts sessions for
#[derive(Debug, Clone, Default)]
pub struct EntityRegistry {
    entities: BTreeMap<String, EntityDefinition>,
}

impl EntityRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the volunteer/project platform's entity types
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        let roots = ["volunteer", "volunteer_skill", "volunteer_training", "project", "resource"];
        let children = [
            ("volunteer_skill_assignment", "volunteer", "volunteer_id"),
            ("volunteer_time_log", "volunteer", "volunteer_id"),
            ("volunteer_training_record", "volunteer", "volunteer_id"),
            ("project_team", "project", "project_id"),
            ("milestone", "project", "project_id"),
            ("environmental_metric", "project", "project_id"),
            ("task", "project", "project_id"),
            ("task_dependency", "task", "task_id"),
            ("project_resource", "project", "project_id"),
        ];

        for name in roots {
            registry.insert(name, None);
        }
        for (name, parent, field) in children {
            registry.insert(
                name,
                Some(ParentLink {
                    entity_type: parent.to_string(),
                    field: field.to_string(),
                }),
            );
        }
        registry
    }

    fn insert(&mut self, name: &str, parent: Option<ParentLink>) {
        self.entities.insert(
            name.to_string(),
            EntityDefinition {
                name: name.to_string(),
                parent,
            },
        );
    }

    /// Register a top-level entity type
    pub fn register(&mut self, name: &str) -> Result<()> {
        validate_name(name)?;
        self.insert(name, None);
        Ok(())
    }

    /// Register an entity type whose records reference a parent record
    ///
    /// The parent type must already be registered.
    pub fn register_child(&mut self, name: &str, parent: &str, field: &str) -> Result<()> {
        validate_name(name)?;
        if !self.entities.contains_key(parent) {
            return Err(Error::UnknownEntityType(parent.to_string()));
        }
        if field.trim().is_empty() {
            return Err(Error::InvalidInput(format!(
                "parent field for {name} must not be empty"
            )));
        }

        self.insert(
            name,
            Some(ParentLink {
                entity_type: parent.to_string(),
                field: field.to_string(),
            }),
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&EntityDefinition> {
        self.entities.get(name)
    }

    /// Look up an entity type, failing with `UnknownEntityType`
    pub fn require(&self, name: &str) -> Result<&EntityDefinition> {
        self.get(name)
            .ok_or_else(|| Error::UnknownEntityType(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entities.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

fn validate_name(name: &str) -> Result<()> {
    if ENTITY_NAME.is_match(name) {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!("invalid entity type name: {name:?}")))
    }
}
