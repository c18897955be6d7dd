//! Entity types and the registry that resolves them.
//!
//! Entity types are collected with a [`RegistryBuilder`] and frozen into an
//! [`EntityRegistry`]. Building resolves every relation target to an
//! [`EntityTypeId`], so an unknown target is reported once, at registration,
//! instead of on the first call that returns rows for it.

use crate::error::{DbError, DbResult};
use crate::models::Row;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Index of an entity type inside its registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityTypeId(usize);

impl EntityTypeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Per-field value transform.
pub type FieldTransform = Arc<dyn Fn(JsonValue) -> JsonValue + Send + Sync>;

/// Expected JSON kind of a field after materialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FieldKind {
    #[default]
    Any,
    String,
    Integer,
    Number,
    Boolean,
}

impl FieldKind {
    fn accepts(&self, value: &JsonValue) -> bool {
        match self {
            FieldKind::Any => true,
            FieldKind::String => value.is_string(),
            FieldKind::Integer => value.is_i64() || value.is_u64(),
            FieldKind::Number => value.is_number(),
            FieldKind::Boolean => value.is_boolean(),
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            FieldKind::Any => "any value",
            FieldKind::String => "a string",
            FieldKind::Integer => "an integer",
            FieldKind::Number => "a number",
            FieldKind::Boolean => "a boolean",
        }
    }
}

/// A declared field of an entity type.
#[derive(Clone, Default)]
pub struct FieldDef {
    pub name: String,
    /// Column name on the database side, when it differs from `name`
    pub alias: Option<String>,
    pub kind: FieldKind,
    pub required: bool,
    pub from_db: Option<FieldTransform>,
    pub to_db: Option<FieldTransform>,
}

impl FieldDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn alias(mut self, column: impl Into<String>) -> Self {
        self.alias = Some(column.into());
        self
    }

    pub fn kind(mut self, kind: FieldKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Transform applied when a value is read from the database.
    pub fn from_db<F>(mut self, f: F) -> Self
    where
        F: Fn(JsonValue) -> JsonValue + Send + Sync + 'static,
    {
        self.from_db = Some(Arc::new(f));
        self
    }

    /// Transform applied when a value is sent to the database.
    pub fn to_db<F>(mut self, f: F) -> Self
    where
        F: Fn(JsonValue) -> JsonValue + Send + Sync + 'static,
    {
        self.to_db = Some(Arc::new(f));
        self
    }

    /// Column this field is read from and written to.
    pub fn column(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

impl fmt::Debug for FieldDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldDef")
            .field("name", &self.name)
            .field("alias", &self.alias)
            .field("kind", &self.kind)
            .field("required", &self.required)
            .field("from_db", &self.from_db.is_some())
            .field("to_db", &self.to_db.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    One,
    Many,
}

/// How join keys are compared when linking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyMatch {
    /// Integers, integral floats, numeric strings and booleans compare as
    /// numbers; blank strings compare as zero
    #[default]
    Loose,
    /// Keys must be equal JSON values
    Strict,
}

/// A join from one entity type to another.
#[derive(Debug, Clone)]
pub struct Relation {
    /// Attribute the related entities are attached under
    pub name: String,
    pub local_field: String,
    pub remote_field: String,
    pub cardinality: Cardinality,
    pub target: String,
    pub key_match: KeyMatch,
    target_id: Option<EntityTypeId>,
}

impl Relation {
    fn new(
        cardinality: Cardinality,
        local_field: impl Into<String>,
        target: impl Into<String>,
        remote_field: impl Into<String>,
    ) -> Self {
        let local_field = local_field.into();
        Self {
            name: local_field.clone(),
            local_field,
            remote_field: remote_field.into(),
            cardinality,
            target: target.into(),
            key_match: KeyMatch::default(),
            target_id: None,
        }
    }

    /// `local[local_field] == target[remote_field]`, last match wins.
    pub fn one(
        local_field: impl Into<String>,
        target: impl Into<String>,
        remote_field: impl Into<String>,
    ) -> Self {
        Self::new(Cardinality::One, local_field, target, remote_field)
    }

    /// `local[local_field] == target[remote_field]`, all matches in row order.
    pub fn many(
        local_field: impl Into<String>,
        target: impl Into<String>,
        remote_field: impl Into<String>,
    ) -> Self {
        Self::new(Cardinality::Many, local_field, target, remote_field)
    }

    /// Attach under `name` instead of the local field name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn strict_keys(mut self) -> Self {
        self.key_match = KeyMatch::Strict;
        self
    }

    /// Resolved target; always `Some` for relations of a built registry.
    pub fn target_id(&self) -> Option<EntityTypeId> {
        self.target_id
    }
}

/// A validation failure reported by a [`RowValidator`].
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct ValidationError {
    pub field: Option<String>,
    pub message: String,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            field: None,
            message: message.into(),
        }
    }

    pub fn field(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: Some(field.into()),
            message: message.into(),
        }
    }
}

/// Schema validation collaborator: turns a row into its canonical form.
#[async_trait]
pub trait RowValidator: Send + Sync {
    async fn validate(&self, row: Row) -> Result<Row, ValidationError>;
}

#[async_trait]
impl<F> RowValidator for F
where
    F: Fn(Row) -> Result<Row, ValidationError> + Send + Sync,
{
    async fn validate(&self, row: Row) -> Result<Row, ValidationError> {
        self(row)
    }
}

/// A named row schema.
#[derive(Clone)]
pub struct EntityType {
    name: String,
    fields: Vec<FieldDef>,
    relations: Vec<Relation>,
    validator: Option<Arc<dyn RowValidator>>,
    drop_unknown: bool,
}

impl EntityType {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            relations: Vec::new(),
            validator: None,
            drop_unknown: false,
        }
    }

    pub fn field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    pub fn relation(mut self, relation: Relation) -> Self {
        self.relations.push(relation);
        self
    }

    pub fn validator(mut self, validator: impl RowValidator + 'static) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Discard columns that match no declared field.
    pub fn drop_unknown(mut self) -> Self {
        self.drop_unknown = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn relations(&self) -> &[Relation] {
        &self.relations
    }

    pub(crate) fn row_validator(&self) -> Option<&Arc<dyn RowValidator>> {
        self.validator.as_ref()
    }

    fn field_for_column(&self, column: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.column() == column)
    }

    /// Map a raw row to canonical field names, applying `from_db` transforms
    /// and field checks. Relations are not touched here.
    pub fn canonicalize(&self, row: Row) -> DbResult<Row> {
        let mut out = Row::new();
        for (column, value) in row {
            match self.field_for_column(&column) {
                Some(field) => {
                    let value = match &field.from_db {
                        Some(transform) => transform(value),
                        None => value,
                    };
                    out.insert(field.name.clone(), value);
                }
                None if self.drop_unknown => {}
                None => {
                    out.insert(column, value);
                }
            }
        }

        for field in &self.fields {
            match out.get(&field.name) {
                None | Some(JsonValue::Null) if field.required => {
                    return Err(DbError::field_validation(
                        &self.name,
                        &field.name,
                        "required field is missing",
                    ));
                }
                Some(value) if !value.is_null() && !field.kind.accepts(value) => {
                    return Err(DbError::field_validation(
                        &self.name,
                        &field.name,
                        format!("expected {}", field.kind.describe()),
                    ));
                }
                _ => {}
            }
        }
        Ok(out)
    }

    /// Map canonical fields back to database columns, applying `to_db` transforms.
    pub fn to_db(&self, fields: &Row) -> Row {
        let mut out = Row::new();
        for (name, value) in fields {
            match self.fields.iter().find(|f| &f.name == name) {
                Some(field) => {
                    let value = match &field.to_db {
                        Some(transform) => transform(value.clone()),
                        None => value.clone(),
                    };
                    out.insert(field.column().to_string(), value);
                }
                None => {
                    out.insert(name.clone(), value.clone());
                }
            }
        }
        out
    }
}

impl fmt::Debug for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityType")
            .field("name", &self.name)
            .field("fields", &self.fields)
            .field("relations", &self.relations)
            .field("validator", &self.validator.is_some())
            .field("drop_unknown", &self.drop_unknown)
            .finish()
    }
}

/// Collects entity types before they are frozen into a registry.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    types: Vec<EntityType>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, entity_type: EntityType) -> Self {
        self.types.push(entity_type);
        self
    }

    /// Freeze the registry, resolving every relation target.
    pub fn build(self) -> DbResult<EntityRegistry> {
        let mut by_name = HashMap::with_capacity(self.types.len());
        for (idx, ty) in self.types.iter().enumerate() {
            if ty.name.trim().is_empty() {
                return Err(DbError::invalid_definition(
                    "<entity type>",
                    "entity type name cannot be empty",
                ));
            }
            if by_name.insert(ty.name.clone(), EntityTypeId(idx)).is_some() {
                return Err(DbError::invalid_definition(
                    &ty.name,
                    "entity type is registered twice",
                ));
            }
        }

        let mut types = self.types;
        for ty in &mut types {
            for relation in &mut ty.relations {
                if relation.local_field.is_empty() || relation.remote_field.is_empty() {
                    return Err(DbError::invalid_definition(
                        &ty.name,
                        format!("relation '{}' needs both join fields", relation.name),
                    ));
                }
                let target = by_name
                    .get(&relation.target)
                    .copied()
                    .ok_or_else(|| DbError::unknown_entity_type(&relation.target))?;
                relation.target_id = Some(target);
            }
        }

        debug!(types = types.len(), "Entity registry built");
        Ok(EntityRegistry { types, by_name })
    }
}

/// Frozen set of entity types, shared by every operation of a mapper.
#[derive(Debug)]
pub struct EntityRegistry {
    types: Vec<EntityType>,
    by_name: HashMap<String, EntityTypeId>,
}

impl EntityRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Look up an entity type by name.
    pub fn get(&self, name: &str) -> DbResult<&EntityType> {
        self.id(name).map(|id| self.by_id(id))
    }

    /// Resolve a name to its id.
    pub fn id(&self, name: &str) -> DbResult<EntityTypeId> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| DbError::unknown_entity_type(name))
    }

    pub fn by_id(&self, id: EntityTypeId) -> &EntityType {
        &self.types[id.0]
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}
