//! Schema and field type system
//!
//! - Field types (text, keyword, long, double, date, geo_point)
//! - Index mappings keyed by dotted field path
//! - The shared mapping registry that validates and promotes fields

mod field_type;
mod mapping;
mod registry;

pub use field_type::{parse_date, parse_geo, FieldType};
pub use mapping::{DynamicMapping, FieldMapping, IndexMapping};
pub use registry::{Admitted, MappingRegistry};
