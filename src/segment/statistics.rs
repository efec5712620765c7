//! Segment statistics for BM25 scoring
//!
//! Per segment and per text field: the token length of every document and the
//! totals needed for the average field length. Shard-level numbers are summed
//! across the segments of a snapshot at query time.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::types::DocNo;

/// Token lengths of one field across a segment's documents
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldLengths {
    /// Length per docno; 0 when the document has no value for the field
    lengths: Vec<u32>,
    /// Documents with at least one token in this field
    pub doc_count: u32,
    /// Sum of all lengths
    pub total_length: u64,
}

impl FieldLengths {
    pub fn get(&self, docno: DocNo) -> u32 {
        self.lengths.get(docno.as_usize()).copied().unwrap_or(0)
    }

    pub fn average(&self) -> f64 {
        if self.doc_count == 0 {
            0.0
        } else {
            self.total_length as f64 / self.doc_count as f64
        }
    }
}

/// Statistics for a single segment
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SegmentStatistics {
    /// Total number of documents in this segment, deleted ones included
    pub doc_count: u32,
    fields: BTreeMap<String, FieldLengths>,
}

impl SegmentStatistics {
    pub fn new(doc_count: u32) -> Self {
        Self {
            doc_count,
            fields: BTreeMap::new(),
        }
    }

    /// Record the token length of `field` for `docno`; repeated calls accumulate
    pub fn add_field_length(&mut self, field: &str, docno: DocNo, len: u32) {
        if len == 0 {
            return;
        }
        let stats = self.fields.entry(field.to_string()).or_default();
        let idx = docno.as_usize();
        if stats.lengths.len() <= idx {
            stats.lengths.resize(idx + 1, 0);
        }
        if stats.lengths[idx] == 0 {
            stats.doc_count += 1;
        }
        stats.lengths[idx] += len;
        stats.total_length += len as u64;
    }

    pub fn field(&self, field: &str) -> Option<&FieldLengths> {
        self.fields.get(field)
    }

    /// Token length of `field` in `docno`
    pub fn field_length(&self, field: &str, docno: DocNo) -> u32 {
        self.fields.get(field).map_or(0, |f| f.get(docno))
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldLengths)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn to_bytes(&self) -> bincode::Result<Vec<u8>> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> bincode::Result<Self> {
        bincode::deserialize(bytes)
    }
}

/// Statistics summed over every segment of a shard snapshot
#[derive(Clone, Debug, Default)]
pub struct CollectionStatistics {
    /// Documents across all segments, deleted ones included
    pub total_docs: u64,
    fields: BTreeMap<String, (u64, u64)>,
}

impl CollectionStatistics {
    pub fn aggregate<'a>(segments: impl IntoIterator<Item = &'a SegmentStatistics>) -> Self {
        let mut stats = CollectionStatistics::default();
        for segment in segments {
            stats.total_docs += segment.doc_count as u64;
            for (field, lengths) in segment.fields() {
                let entry = stats.fields.entry(field.to_string()).or_insert((0, 0));
                entry.0 += lengths.doc_count as u64;
                entry.1 += lengths.total_length;
            }
        }
        stats
    }

    /// Average token length of `field` over documents that have it
    pub fn avg_field_length(&self, field: &str) -> f32 {
        match self.fields.get(field) {
            Some((docs, total)) if *docs > 0 => (*total as f64 / *docs as f64) as f32,
            _ => 0.0,
        }
    }
}
