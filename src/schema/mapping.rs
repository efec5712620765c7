//! Index mapping definitions
//!
//! Mappings define the schema for an index: which type each field has and how it is indexed.
//! Nested JSON objects are flattened, so properties are keyed by dotted paths.

use super::field_type::{looks_like_geo, parse_date, FieldType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Dynamic mapping behavior for unmapped fields
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DynamicMapping {
    /// Automatically detect and map new fields (default)
    #[default]
    True,
    /// Keep unmapped fields in the stored document but don't index them
    False,
    /// Reject documents with unmapped fields
    Strict,
}

impl DynamicMapping {
    /// Check if new fields should be automatically mapped
    pub fn should_auto_map(&self) -> bool {
        matches!(self, DynamicMapping::True)
    }

    /// Check if unmapped fields should cause an error
    pub fn should_reject_unmapped(&self) -> bool {
        matches!(self, DynamicMapping::Strict)
    }
}

/// Field mapping configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    /// Field data type
    #[serde(rename = "type")]
    pub field_type: FieldType,

    /// Whether to index this field for search (default: true)
    #[serde(default = "default_true")]
    pub index: bool,

    /// Whether to keep a columnar copy for sorting (default: true)
    #[serde(default = "default_true")]
    pub doc_values: bool,
}

fn default_true() -> bool {
    true
}

impl Default for FieldMapping {
    fn default() -> Self {
        Self::new(FieldType::default())
    }
}

impl FieldMapping {
    pub fn new(field_type: FieldType) -> Self {
        Self {
            field_type,
            index: true,
            doc_values: true,
        }
    }

    pub fn text() -> Self {
        Self::new(FieldType::text())
    }

    pub fn keyword() -> Self {
        Self::new(FieldType::keyword())
    }

    pub fn long() -> Self {
        Self::new(FieldType::Long)
    }

    pub fn double() -> Self {
        Self::new(FieldType::Double)
    }

    pub fn date() -> Self {
        Self::new(FieldType::Date)
    }

    pub fn geo_point() -> Self {
        Self::new(FieldType::GeoPoint)
    }

    /// Set whether the field should be indexed
    pub fn with_index(mut self, index: bool) -> Self {
        self.index = index;
        self
    }

    /// Set whether a columnar copy is kept
    pub fn with_doc_values(mut self, doc_values: bool) -> Self {
        self.doc_values = doc_values;
        self
    }

    /// Whether this field gets a columnar copy
    pub fn has_column(&self) -> bool {
        self.doc_values && !matches!(self.field_type, FieldType::Text { .. })
    }
}

/// Index mapping (schema) definition
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexMapping {
    /// Field mappings keyed by dotted path
    #[serde(default)]
    pub properties: BTreeMap<String, FieldMapping>,

    /// Dynamic mapping behavior
    #[serde(default)]
    pub dynamic: DynamicMapping,

    /// Map new string fields that parse as dates to `date` instead of `text`
    #[serde(default)]
    pub date_detection: bool,
}

impl IndexMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mapping with strict mode
    pub fn strict() -> Self {
        Self {
            dynamic: DynamicMapping::Strict,
            ..Default::default()
        }
    }

    /// Add a field mapping
    pub fn field(mut self, name: impl Into<String>, mapping: FieldMapping) -> Self {
        self.properties.insert(name.into(), mapping);
        self
    }

    pub fn with_dynamic(mut self, dynamic: DynamicMapping) -> Self {
        self.dynamic = dynamic;
        self
    }

    pub fn with_date_detection(mut self, enabled: bool) -> Self {
        self.date_detection = enabled;
        self
    }

    /// Get a field mapping by dotted path
    pub fn get_field(&self, path: &str) -> Option<&FieldMapping> {
        self.properties.get(path)
    }

    pub fn field_type(&self, path: &str) -> Option<&FieldType> {
        self.properties.get(path).map(|m| &m.field_type)
    }

    pub fn has_field(&self, path: &str) -> bool {
        self.properties.contains_key(path)
    }

    /// Field names in sorted order
    pub fn field_names(&self) -> Vec<String> {
        self.properties.keys().cloned().collect()
    }

    /// Indexed full-text fields, used by queries that don't name a field
    pub fn text_fields(&self) -> Vec<String> {
        self.properties
            .iter()
            .filter(|(_, m)| m.index && m.field_type.supports_fulltext())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Auto-detect a field type from a JSON leaf.
    ///
    /// Returns `None` for values that cannot be mapped (null, nested arrays).
    pub fn detect_field_type(&self, value: &serde_json::Value) -> Option<FieldType> {
        match value {
            serde_json::Value::Bool(_) => Some(FieldType::keyword()),
            serde_json::Value::Number(n) => {
                if n.is_i64() || n.is_u64() {
                    Some(FieldType::Long)
                } else {
                    Some(FieldType::Double)
                }
            }
            serde_json::Value::String(s) => {
                if self.date_detection && parse_date(s).is_some() {
                    Some(FieldType::Date)
                } else {
                    Some(FieldType::text())
                }
            }
            serde_json::Value::Object(map) if looks_like_geo(map) => Some(FieldType::GeoPoint),
            _ => None,
        }
    }
}
