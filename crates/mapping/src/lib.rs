//! `erpbridge-mapping`: bidirectional field mapping between the unified schema and
//! vendor schemas.

pub mod error;
pub mod mapper;
pub mod path;

pub use error::MappingError;
pub use mapper::{
    DefaultFn, DefaultValue, FieldMapping, MappingDefinition, SchemaMapper, TransformFn, UNIFIED_SCHEMA,
};
pub use path::{FieldPath, Segment};
