//! Result materialization: raw rows to validated entities.

use crate::error::{DbError, DbResult};
use crate::mapping::registry::EntityType;
use crate::models::{Entity, Materialized, Row, RowSet};
use tracing::trace;

/// Materialize one raw row into an entity of `entity_type`.
///
/// Columns are mapped to field names and passed through the `from_db`
/// transforms and field checks, then through the type's validator if it has
/// one.
pub async fn materialize_row(entity_type: &EntityType, row: Row) -> DbResult<Entity> {
    let mut fields = entity_type.canonicalize(row)?;
    if let Some(validator) = entity_type.row_validator() {
        fields = validator.validate(fields).await.map_err(|e| match e.field {
            Some(field) => DbError::field_validation(entity_type.name(), field, e.message),
            None => DbError::validation(entity_type.name(), e.message),
        })?;
    }
    Ok(Entity::new(entity_type.name(), fields))
}

/// Materialize every row of a set, preserving row order.
pub async fn materialize_set(entity_type: &EntityType, rows: RowSet) -> DbResult<Vec<Entity>> {
    let mut entities = Vec::with_capacity(rows.len());
    for row in rows {
        entities.push(materialize_row(entity_type, row).await?);
    }
    trace!(
        entity_type = %entity_type.name(),
        count = entities.len(),
        "Materialized row set"
    );
    Ok(entities)
}

/// Apply the one-result policy to a row set.
///
/// With `one_result`, an absent or empty set is `EmptyResult` and only the
/// first row is materialized.
pub async fn materialize(
    operation: &str,
    entity_type: &EntityType,
    rows: Option<RowSet>,
    one_result: bool,
) -> DbResult<Materialized> {
    let rows = rows.unwrap_or_default();
    if one_result {
        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| DbError::empty_result(operation))?;
        return Ok(Materialized::One(materialize_row(entity_type, row).await?));
    }
    Ok(Materialized::Many(materialize_set(entity_type, rows).await?))
}

/// Column values of an entity, ready to feed back into operation arguments.
pub fn to_db(entity_type: &EntityType, entity: &Entity) -> Row {
    entity_type.to_db(entity.fields())
}
