//! Row and entity models.
//!
//! Raw rows come back from the driver as JSON maps keyed by column name.
//! Materialization turns them into [`Entity`] values keyed by field name, and
//! linking attaches related entities to them.

use serde::{Serialize, Serializer};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;

/// A raw row: column name to scalar value.
pub type Row = Map<String, JsonValue>;

/// One ordered set of rows returned by a single statement.
pub type RowSet = Vec<Row>;

/// An entity attached to another through a relation.
#[derive(Debug, Clone, PartialEq)]
pub enum Related {
    One(Box<Entity>),
    Many(Vec<Entity>),
}

impl Related {
    fn to_json(&self) -> JsonValue {
        match self {
            Related::One(entity) => entity.to_json(),
            Related::Many(entities) => {
                JsonValue::Array(entities.iter().map(Entity::to_json).collect())
            }
        }
    }
}

/// A materialized row of a registered entity type.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    entity_type: String,
    fields: Row,
    related: BTreeMap<String, Related>,
}

impl Entity {
    /// Create an entity from canonical (already materialized) fields.
    pub fn new(entity_type: impl Into<String>, fields: Row) -> Self {
        Self {
            entity_type: entity_type.into(),
            fields,
            related: BTreeMap::new(),
        }
    }

    /// Name of the entity type this entity belongs to.
    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    /// Get a field value.
    pub fn get(&self, field: &str) -> Option<&JsonValue> {
        self.fields.get(field)
    }

    /// Get a field value as a string slice.
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(JsonValue::as_str)
    }

    /// Set a field value.
    pub fn set(&mut self, field: impl Into<String>, value: JsonValue) {
        self.fields.insert(field.into(), value);
    }

    pub fn fields(&self) -> &Row {
        &self.fields
    }

    pub fn into_fields(self) -> Row {
        self.fields
    }

    /// Get a relation attachment by relation name.
    pub fn related(&self, name: &str) -> Option<&Related> {
        self.related.get(name)
    }

    /// Get the entity attached through a to-one relation.
    pub fn one(&self, name: &str) -> Option<&Entity> {
        match self.related.get(name) {
            Some(Related::One(entity)) => Some(entity),
            _ => None,
        }
    }

    /// Get the entities attached through a to-many relation.
    ///
    /// Returns an empty slice when nothing is attached under `name`.
    pub fn many(&self, name: &str) -> &[Entity] {
        match self.related.get(name) {
            Some(Related::Many(entities)) => entities,
            _ => &[],
        }
    }

    /// Attach (or replace) a to-one relation.
    pub fn attach_one(&mut self, name: impl Into<String>, entity: Entity) {
        self.related
            .insert(name.into(), Related::One(Box::new(entity)));
    }

    /// Attach a to-many relation, replacing any previous collection.
    pub fn attach_many(&mut self, name: impl Into<String>, entities: Vec<Entity>) {
        self.related.insert(name.into(), Related::Many(entities));
    }

    /// Render the entity and its attachments as one JSON object.
    ///
    /// Relation attachments are written under their relation name and shadow
    /// a scalar field of the same name.
    pub fn to_json(&self) -> JsonValue {
        let mut obj = self.fields.clone();
        for (name, related) in &self.related {
            obj.insert(name.clone(), related.to_json());
        }
        JsonValue::Object(obj)
    }
}

impl Serialize for Entity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

/// The materialized data of an operation, shaped by its one-result policy.
#[derive(Debug, Clone, PartialEq)]
pub enum Materialized {
    One(Entity),
    Many(Vec<Entity>),
}

impl Materialized {
    /// Take the single entity, or the first of many.
    pub fn into_one(self) -> Option<Entity> {
        match self {
            Materialized::One(entity) => Some(entity),
            Materialized::Many(entities) => entities.into_iter().next(),
        }
    }

    /// Take all entities as a vector.
    pub fn into_many(self) -> Vec<Entity> {
        match self {
            Materialized::One(entity) => vec![entity],
            Materialized::Many(entities) => entities,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Materialized::One(_) => 1,
            Materialized::Many(entities) => entities.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Serialize for Materialized {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Materialized::One(entity) => entity.serialize(serializer),
            Materialized::Many(entities) => entities.serialize(serializer),
        }
    }
}

/// What a mapped operation returns to application code.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationResult {
    pub data: Materialized,
    /// Scalar return code reported by the routine, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_value: Option<i64>,
    /// Output parameter values by name
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub output: Row,
}

impl OperationResult {
    pub fn into_one(self) -> Option<Entity> {
        self.data.into_one()
    }

    pub fn into_many(self) -> Vec<Entity> {
        self.data.into_many()
    }
}
