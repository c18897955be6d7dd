//! The mapping layer: entity types, materialization, linking and the
//! operation façade built on top of the database layer.

pub mod link;
pub mod mapper;
pub mod materialize;
pub mod registry;

pub use link::EntitySets;
pub use mapper::Mapper;
pub use registry::{
    Cardinality, EntityRegistry, EntityType, EntityTypeId, FieldDef, FieldKind, FieldTransform,
    KeyMatch, RegistryBuilder, Relation, RowValidator, ValidationError,
};
