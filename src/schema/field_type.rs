//! Field type definitions
//!
//! Defines how different data types are indexed and queried.

use serde::{Deserialize, Serialize};

use crate::models::{FieldValue, GeoPoint};

/// Field data type
///
/// Determines how a field is indexed, stored, and queried.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    /// Full-text searchable field
    ///
    /// Text fields are analyzed (tokenized, lowercased, optionally stemmed) before indexing.
    /// They support `match` and `phrase` queries.
    Text {
        /// Store term positions for phrase queries
        #[serde(default = "default_true")]
        index_positions: bool,
    },

    /// Exact match keyword field
    ///
    /// The entire value is indexed as a single term. Supports term, prefix and sort.
    Keyword {
        /// Values longer than this are stored but not indexed
        #[serde(default = "default_ignore_above")]
        ignore_above: usize,
    },

    /// 64-bit signed integer
    Long,

    /// 64-bit floating point
    Double,

    /// Milliseconds since the epoch; strings are parsed as RFC 3339 or `YYYY-MM-DD`
    Date,

    /// Latitude/longitude pair, indexed in a 2-D block tree
    #[serde(rename = "geo_point")]
    GeoPoint,
}

fn default_true() -> bool {
    true
}

fn default_ignore_above() -> usize {
    256
}

impl Default for FieldType {
    fn default() -> Self {
        FieldType::text()
    }
}

impl FieldType {
    pub fn text() -> Self {
        FieldType::Text {
            index_positions: true,
        }
    }

    pub fn keyword() -> Self {
        FieldType::Keyword {
            ignore_above: default_ignore_above(),
        }
    }

    /// Infer a type for a value seen on an unmapped field
    pub fn for_value(value: &FieldValue) -> Self {
        match value {
            FieldValue::Text(_) => FieldType::text(),
            FieldValue::Keyword(_) => FieldType::keyword(),
            FieldValue::Long(_) => FieldType::Long,
            FieldValue::Double(_) => FieldType::Double,
            FieldValue::Date(_) => FieldType::Date,
            FieldValue::GeoPoint(_) => FieldType::GeoPoint,
        }
    }

    pub fn supports_fulltext(&self) -> bool {
        matches!(self, FieldType::Text { .. })
    }

    /// Field values are kept in a numeric or geo block tree
    pub fn supports_range(&self) -> bool {
        matches!(
            self,
            FieldType::Long | FieldType::Double | FieldType::Date | FieldType::GeoPoint
        )
    }

    pub fn supports_sorting(&self) -> bool {
        !matches!(self, FieldType::Text { .. } | FieldType::GeoPoint)
    }

    /// Dimensions of the range index for this type
    pub fn range_dims(&self) -> Option<usize> {
        match self {
            FieldType::Long | FieldType::Double | FieldType::Date => Some(1),
            FieldType::GeoPoint => Some(2),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FieldType::Text { .. } => "text",
            FieldType::Keyword { .. } => "keyword",
            FieldType::Long => "long",
            FieldType::Double => "double",
            FieldType::Date => "date",
            FieldType::GeoPoint => "geo_point",
        }
    }

    /// Convert a typed value into this field's representation.
    ///
    /// Returns `None` when the value kind cannot be stored in this field.
    /// Only lossless widenings are accepted (long to double, long to date).
    pub fn coerce(&self, value: &FieldValue) -> Option<FieldValue> {
        match (self, value) {
            (FieldType::Text { .. }, FieldValue::Text(_)) => Some(value.clone()),
            (FieldType::Keyword { .. }, FieldValue::Keyword(_)) => Some(value.clone()),
            (FieldType::Long, FieldValue::Long(_)) => Some(value.clone()),
            (FieldType::Double, FieldValue::Double(_)) => Some(value.clone()),
            (FieldType::Double, FieldValue::Long(v)) => Some(FieldValue::Double(*v as f64)),
            (FieldType::Date, FieldValue::Date(_)) => Some(value.clone()),
            (FieldType::Date, FieldValue::Long(v)) => Some(FieldValue::Date(*v)),
            (FieldType::GeoPoint, FieldValue::GeoPoint(_)) => Some(value.clone()),
            _ => None,
        }
    }

    /// Convert a JSON leaf into this field's representation
    pub fn coerce_json(&self, value: &serde_json::Value) -> Option<FieldValue> {
        use serde_json::Value;
        match self {
            FieldType::Text { .. } => json_scalar_string(value).map(FieldValue::Text),
            FieldType::Keyword { .. } => json_scalar_string(value).map(FieldValue::Keyword),
            FieldType::Long => match value {
                Value::Number(n) => n
                    .as_i64()
                    .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
                    .map(FieldValue::Long),
                Value::String(s) => s.trim().parse::<i64>().ok().map(FieldValue::Long),
                _ => None,
            },
            FieldType::Double => match value {
                Value::Number(n) => n.as_f64().map(FieldValue::Double),
                Value::String(s) => s.trim().parse::<f64>().ok().map(FieldValue::Double),
                _ => None,
            },
            FieldType::Date => match value {
                Value::Number(n) => n.as_i64().map(FieldValue::Date),
                Value::String(s) => parse_date(s).map(FieldValue::Date),
                _ => None,
            },
            FieldType::GeoPoint => parse_geo(value).map(FieldValue::GeoPoint),
        }
    }
}

fn json_scalar_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Parse an RFC 3339 timestamp or a plain `YYYY-MM-DD` date into epoch millis
pub fn parse_date(s: &str) -> Option<i64> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp_millis())
}

/// Parse `{"lat": .., "lon": ..}` or `"lat,lon"`
pub fn parse_geo(value: &serde_json::Value) -> Option<GeoPoint> {
    let point = match value {
        serde_json::Value::Object(map) => {
            let lat = map.get("lat")?.as_f64()?;
            let lon = map.get("lon")?.as_f64()?;
            GeoPoint::new(lat, lon)
        }
        serde_json::Value::String(s) => {
            let (lat, lon) = s.split_once(',')?;
            GeoPoint::new(lat.trim().parse().ok()?, lon.trim().parse().ok()?)
        }
        _ => return None,
    };
    point.is_valid().then_some(point)
}

/// Whether a JSON object is shaped like a geo point
pub fn looks_like_geo(map: &serde_json::Map<String, serde_json::Value>) -> bool {
    map.len() == 2
        && map.get("lat").map_or(false, |v| v.is_number())
        && map.get("lon").map_or(false, |v| v.is_number())
}
