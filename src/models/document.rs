use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// External document key, unique within an index
pub type DocKey = String;

/// Per-shard operation sequence number (starts at 1; 0 means "nothing applied")
pub type SeqNo = u64;

/// Latitude/longitude pair in degrees
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    pub fn is_valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.lat) && (-180.0..=180.0).contains(&self.lon)
    }
}

/// A single typed field value
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    /// Analyzed full text
    Text(String),
    /// Exact string, indexed as a single term
    Keyword(String),
    Long(i64),
    Double(f64),
    /// Milliseconds since the Unix epoch
    Date(i64),
    GeoPoint(GeoPoint),
}

impl FieldValue {
    /// Short name of the value kind, matching field type names
    pub fn kind(&self) -> &'static str {
        match self {
            FieldValue::Text(_) => "text",
            FieldValue::Keyword(_) => "keyword",
            FieldValue::Long(_) => "long",
            FieldValue::Double(_) => "double",
            FieldValue::Date(_) => "date",
            FieldValue::GeoPoint(_) => "geo_point",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) | FieldValue::Keyword(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric view used by range queries and sorting
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Long(v) | FieldValue::Date(v) => Some(*v as f64),
            FieldValue::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            FieldValue::Text(s) | FieldValue::Keyword(s) => serde_json::Value::String(s.clone()),
            FieldValue::Long(v) | FieldValue::Date(v) => serde_json::Value::from(*v),
            FieldValue::Double(v) => serde_json::Value::from(*v),
            FieldValue::GeoPoint(p) => serde_json::json!({ "lat": p.lat, "lon": p.lon }),
        }
    }
}

/// A document: field name to one or more typed values, ordered by field name
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    fields: BTreeMap<String, Vec<FieldValue>>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value to a field (builder style)
    pub fn with_field(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.add(name, value);
        self
    }

    pub fn with_text(self, name: impl Into<String>, text: impl Into<String>) -> Self {
        self.with_field(name, FieldValue::Text(text.into()))
    }

    pub fn with_keyword(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.with_field(name, FieldValue::Keyword(value.into()))
    }

    pub fn with_long(self, name: impl Into<String>, value: i64) -> Self {
        self.with_field(name, FieldValue::Long(value))
    }

    pub fn with_double(self, name: impl Into<String>, value: f64) -> Self {
        self.with_field(name, FieldValue::Double(value))
    }

    pub fn with_date(self, name: impl Into<String>, millis: i64) -> Self {
        self.with_field(name, FieldValue::Date(millis))
    }

    pub fn with_geo(self, name: impl Into<String>, lat: f64, lon: f64) -> Self {
        self.with_field(name, FieldValue::GeoPoint(GeoPoint::new(lat, lon)))
    }

    pub fn add(&mut self, name: impl Into<String>, value: FieldValue) {
        self.fields.entry(name.into()).or_default().push(value);
    }

    pub fn get(&self, name: &str) -> Option<&[FieldValue]> {
        self.fields.get(name).map(|v| v.as_slice())
    }

    pub fn first(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name).and_then(|v| v.first())
    }

    pub fn remove(&mut self, name: &str) -> Option<Vec<FieldValue>> {
        self.fields.remove(name)
    }

    /// Keep only the fields for which `keep` returns true
    pub fn retain_fields<F>(&mut self, mut keep: F)
    where
        F: FnMut(&str) -> bool,
    {
        self.fields.retain(|name, _| keep(name));
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &[FieldValue])> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Render as a JSON object; single-valued fields are not wrapped in arrays
    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (name, values) in &self.fields {
            let value = if values.len() == 1 {
                values[0].to_json()
            } else {
                serde_json::Value::Array(values.iter().map(FieldValue::to_json).collect())
            };
            map.insert(name.clone(), value);
        }
        serde_json::Value::Object(map)
    }

    /// Rough in-memory footprint, used for buffer accounting
    pub fn approx_size(&self) -> usize {
        self.fields
            .iter()
            .map(|(name, values)| {
                name.len()
                    + values
                        .iter()
                        .map(|v| match v {
                            FieldValue::Text(s) | FieldValue::Keyword(s) => s.len() + 8,
                            FieldValue::GeoPoint(_) => 16,
                            _ => 8,
                        })
                        .sum::<usize>()
            })
            .sum()
    }
}

/// Current Unix timestamp in milliseconds
pub fn current_timestamp_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
