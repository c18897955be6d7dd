//! Relational linking: rebuilding an object graph from several row sets.
//!
//! Each row set of a call is materialized into the entity type it is paired
//! with. Relations whose target type is also present are then resolved by
//! matching `remote[remote_field]` against `local[local_field]`:
//!
//! - `One`: the related entity is attached; when several remote entities
//!   match, the last one in row order wins.
//! - `Many`: every match is attached in remote row order; a local entity
//!   without matches gets an empty collection.
//!
//! Matching is a hash join on the normalized remote key, which gives the same
//! attachments as comparing every local entity against every remote one.

use crate::error::{DbError, DbResult};
use crate::mapping::registry::{Cardinality, EntityRegistry, EntityTypeId, KeyMatch, Relation};
use crate::models::{Entity, RowSet};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use tracing::debug;

/// Normalized join key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum JoinKey {
    Integer(i128),
    /// Bit pattern of a non-integral float
    Float(u64),
    Text(String),
    /// Exact JSON rendering, for strict matching and composite values
    Json(String),
}

fn number_key(n: f64) -> JoinKey {
    if n.fract() == 0.0 && n.abs() < 1e36 {
        JoinKey::Integer(n as i128)
    } else {
        JoinKey::Float(n.to_bits())
    }
}

/// Compute the join key of a field value; `None` never matches anything.
fn join_key(value: Option<&JsonValue>, policy: KeyMatch) -> Option<JoinKey> {
    let value = match value {
        None | Some(JsonValue::Null) => return None,
        Some(v) => v,
    };
    if policy == KeyMatch::Strict {
        return Some(JoinKey::Json(value.to_string()));
    }
    let key = match value {
        JsonValue::Bool(b) => JoinKey::Integer(i128::from(*b)),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                JoinKey::Integer(i128::from(i))
            } else if let Some(u) = n.as_u64() {
                JoinKey::Integer(i128::from(u))
            } else {
                number_key(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        // blank text reads as zero, as it does under loose equality
        JsonValue::String(s) if s.trim().is_empty() => JoinKey::Integer(0),
        JsonValue::String(s) => match s.trim().parse::<f64>() {
            Ok(n) if n.is_finite() => match s.trim().parse::<i128>() {
                Ok(i) => JoinKey::Integer(i),
                Err(_) => number_key(n),
            },
            _ => JoinKey::Text(s.clone()),
        },
        other => JoinKey::Json(other.to_string()),
    };
    Some(key)
}

/// Check the number of row sets against the declared result types.
///
/// A single row set (or none) always pairs with the primary type.
pub fn check_shape(operation: &str, expected: usize, row_sets: &[RowSet]) -> DbResult<()> {
    if row_sets.len() > 1 && row_sets.len() != expected {
        return Err(DbError::result_shape(operation, expected, row_sets.len()));
    }
    Ok(())
}

/// Entities of one call, grouped by entity type in row-set order.
#[derive(Debug, Default)]
pub struct EntitySets {
    sets: HashMap<EntityTypeId, Vec<Entity>>,
}

impl EntitySets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add entities of `ty`; a type returned twice accumulates in order.
    pub fn insert(&mut self, ty: EntityTypeId, entities: Vec<Entity>) {
        self.sets.entry(ty).or_default().extend(entities);
    }

    pub fn contains(&self, ty: EntityTypeId) -> bool {
        self.sets.contains_key(&ty)
    }

    pub fn get(&self, ty: EntityTypeId) -> &[Entity] {
        self.sets.get(&ty).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Link the materialized sets and return the primary type's entities with
/// their relations attached.
pub fn link(registry: &EntityRegistry, primary: EntityTypeId, sets: &EntitySets) -> Vec<Entity> {
    let mut path = Vec::new();
    resolve(registry, primary, sets, &mut path)
}

/// Entities of `ty` with relations attached, recursing into targets that are
/// not already on `path`.
fn resolve(
    registry: &EntityRegistry,
    ty: EntityTypeId,
    sets: &EntitySets,
    path: &mut Vec<EntityTypeId>,
) -> Vec<Entity> {
    let mut locals = sets.get(ty).to_vec();
    path.push(ty);

    for relation in registry.by_id(ty).relations() {
        let Some(target) = relation.target_id() else {
            continue;
        };
        if !sets.contains(target) || path.contains(&target) {
            continue;
        }
        let remotes = resolve(registry, target, sets, path);
        attach(relation, &mut locals, remotes);
        debug!(
            relation = %relation.name,
            local = %registry.by_id(ty).name(),
            remote = %relation.target,
            "Linked relation"
        );
    }

    path.pop();
    locals
}

fn attach(relation: &Relation, locals: &mut [Entity], remotes: Vec<Entity>) {
    match relation.cardinality {
        Cardinality::One => {
            let mut index: HashMap<JoinKey, Entity> = HashMap::new();
            for remote in remotes {
                if let Some(key) = join_key(remote.get(&relation.remote_field), relation.key_match)
                {
                    // last match wins
                    index.insert(key, remote);
                }
            }
            for local in locals.iter_mut() {
                let matched = join_key(local.get(&relation.local_field), relation.key_match)
                    .and_then(|key| index.get(&key));
                if let Some(remote) = matched {
                    local.attach_one(&relation.name, remote.clone());
                }
            }
        }
        Cardinality::Many => {
            let mut index: HashMap<JoinKey, Vec<Entity>> = HashMap::new();
            for remote in remotes {
                if let Some(key) = join_key(remote.get(&relation.remote_field), relation.key_match)
                {
                    index.entry(key).or_default().push(remote);
                }
            }
            for local in locals.iter_mut() {
                let matched = join_key(local.get(&relation.local_field), relation.key_match)
                    .and_then(|key| index.get(&key))
                    .cloned()
                    .unwrap_or_default();
                local.attach_many(&relation.name, matched);
            }
        }
    }
}
