//! Shared, versioned index mapping with check-and-set dynamic promotion.

use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use super::field_type::{looks_like_geo, FieldType};
use super::mapping::{DynamicMapping, FieldMapping, IndexMapping};
use crate::error::{Result, ShoalError};
use crate::models::{Document, FieldValue};
use crate::persistence::write_atomic;

/// A document that passed mapping validation
#[derive(Clone, Debug)]
pub struct Admitted {
    /// Values coerced to their bound field types
    pub document: Document,
    /// The mapping the document was validated against
    pub mapping: Arc<IndexMapping>,
}

/// The live mapping of one index, shared by all of its shard copies.
///
/// Readers take lock-free snapshots. Promotions of new fields serialize on
/// `promote`, re-check the current mapping, and publish a new version.
pub struct MappingRegistry {
    current: ArcSwap<IndexMapping>,
    promote: Mutex<()>,
    path: Option<PathBuf>,
}

impl MappingRegistry {
    /// In-memory registry
    pub fn new(mapping: IndexMapping) -> Self {
        Self {
            current: ArcSwap::from_pointee(mapping),
            promote: Mutex::new(()),
            path: None,
        }
    }

    /// Registry persisted as JSON at `path`; an existing file wins over `initial`
    pub fn open(path: PathBuf, initial: IndexMapping) -> Result<Self> {
        let mapping = if path.exists() {
            let bytes = std::fs::read(&path)?;
            serde_json::from_slice(&bytes)?
        } else {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            write_atomic(&path, &serde_json::to_vec_pretty(&initial)?)?;
            initial
        };
        Ok(Self {
            current: ArcSwap::from_pointee(mapping),
            promote: Mutex::new(()),
            path: Some(path),
        })
    }

    pub fn snapshot(&self) -> Arc<IndexMapping> {
        self.current.load_full()
    }

    pub fn field_type(&self, field: &str) -> Option<FieldType> {
        self.current.load().field_type(field).cloned()
    }

    /// Validate a document against the mapping, promoting unseen fields when dynamic.
    ///
    /// Fails with `MappingConflict` when a value does not fit its bound type and with
    /// `MalformedDocument` for invalid values or unmapped fields under a strict mapping.
    pub fn admit(&self, doc: &Document) -> Result<Admitted> {
        let mapping = self.current.load_full();
        let mut normalized = Document::new();
        let mut unmapped: Vec<(&str, &[FieldValue])> = Vec::new();

        for (field, values) in doc.fields() {
            validate_values(field, values)?;
            match mapping.get_field(field) {
                Some(fm) => coerce_into(&mut normalized, field, &fm.field_type, values)?,
                None => unmapped.push((field, values)),
            }
        }

        if unmapped.is_empty() {
            return Ok(Admitted {
                document: normalized,
                mapping,
            });
        }

        match mapping.dynamic {
            DynamicMapping::Strict => {
                return Err(ShoalError::MalformedDocument(format!(
                    "field '{}' is not mapped and the mapping is strict",
                    unmapped[0].0
                )));
            }
            DynamicMapping::False => {
                // Stored but never indexed
                for (field, values) in unmapped {
                    for value in values {
                        normalized.add(field, value.clone());
                    }
                }
                return Ok(Admitted {
                    document: normalized,
                    mapping,
                });
            }
            DynamicMapping::True => {}
        }

        let _guard = self.promote.lock();
        // Another writer may have bound these fields since our snapshot
        let latest = self.current.load_full();
        let mut next = (*latest).clone();
        let mut promoted = Vec::new();

        for (field, values) in unmapped {
            let field_type = match next.field_type(field) {
                Some(existing) => existing.clone(),
                None => {
                    let inferred = FieldType::for_value(&values[0]);
                    next.properties
                        .insert(field.to_string(), FieldMapping::new(inferred.clone()));
                    promoted.push(field.to_string());
                    inferred
                }
            };
            coerce_into(&mut normalized, field, &field_type, values)?;
        }

        // Fields bound in the first pass may have been read from an older snapshot;
        // bindings never change once made, so they are still valid in `next`.
        let mapping = if promoted.is_empty() {
            latest
        } else {
            let next = Arc::new(next);
            self.persist(&next)?;
            self.current.store(next.clone());
            tracing::debug!(fields = ?promoted, "Promoted dynamic fields");
            next
        };

        Ok(Admitted {
            document: normalized,
            mapping,
        })
    }

    /// Parse a JSON object into a document, flattening nested objects with dots.
    ///
    /// Values of bound fields are coerced to their type; other values get an inferred type.
    /// The result still has to go through [`MappingRegistry::admit`].
    pub fn parse_json(&self, value: &serde_json::Value) -> Result<Document> {
        let serde_json::Value::Object(_) = value else {
            return Err(ShoalError::MalformedDocument(
                "document must be a JSON object".to_string(),
            ));
        };

        let mapping = self.current.load();
        let mut leaves = Vec::new();
        flatten("", value, &mut leaves);

        let mut doc = Document::new();
        for (field, leaf) in leaves {
            let converted = match mapping.field_type(&field) {
                Some(ft) => ft.coerce_json(leaf).ok_or_else(|| ShoalError::MappingConflict {
                    field: field.clone(),
                    existing: ft.name().to_string(),
                    attempted: json_kind(leaf).to_string(),
                })?,
                None => {
                    let Some(ft) = mapping.detect_field_type(leaf) else {
                        continue;
                    };
                    ft.coerce_json(leaf).ok_or_else(|| {
                        ShoalError::MalformedDocument(format!(
                            "cannot convert value of field '{}'",
                            field
                        ))
                    })?
                }
            };
            doc.add(field, converted);
        }
        Ok(doc)
    }

    fn persist(&self, mapping: &IndexMapping) -> Result<()> {
        if let Some(path) = &self.path {
            write_atomic(path, &serde_json::to_vec_pretty(mapping)?)?;
        }
        Ok(())
    }
}

fn validate_values(field: &str, values: &[FieldValue]) -> Result<()> {
    if field.is_empty() || field.contains('\0') {
        return Err(ShoalError::MalformedDocument(format!(
            "invalid field name {:?}",
            field
        )));
    }
    for value in values {
        match value {
            FieldValue::GeoPoint(p) if !p.is_valid() => {
                return Err(ShoalError::MalformedDocument(format!(
                    "field '{}' has out-of-range geo point ({}, {})",
                    field, p.lat, p.lon
                )));
            }
            FieldValue::Double(v) if !v.is_finite() => {
                return Err(ShoalError::MalformedDocument(format!(
                    "field '{}' has non-finite number",
                    field
                )));
            }
            _ => {}
        }
    }
    Ok(())
}

fn coerce_into(
    doc: &mut Document,
    field: &str,
    field_type: &FieldType,
    values: &[FieldValue],
) -> Result<()> {
    for value in values {
        let coerced = field_type
            .coerce(value)
            .ok_or_else(|| ShoalError::MappingConflict {
                field: field.to_string(),
                existing: field_type.name().to_string(),
                attempted: value.kind().to_string(),
            })?;
        doc.add(field, coerced);
    }
    Ok(())
}

fn flatten<'a>(
    prefix: &str,
    value: &'a serde_json::Value,
    out: &mut Vec<(String, &'a serde_json::Value)>,
) {
    match value {
        serde_json::Value::Null => {}
        serde_json::Value::Object(map) if !prefix.is_empty() && looks_like_geo(map) => {
            out.push((prefix.to_string(), value));
        }
        serde_json::Value::Object(map) => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                flatten(&path, child, out);
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                flatten(prefix, item, out);
            }
        }
        _ => out.push((prefix.to_string(), value)),
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
