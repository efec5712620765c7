//! Segment manifest for tracking live segments
//!
//! Commit order on every refresh or merge:
//! 1. Write new segment files, fsync each file and the segment directory
//! 2. Write dirty live bitsets (tmp + fsync + rename)
//! 3. Write `segments.manifest.tmp`, fsync, rename over `segments.manifest`, fsync the directory
//!
//! Only segments listed in the manifest exist after a restart; anything else
//! in the shard directory is an orphan of an interrupted flush or merge.

use std::collections::BTreeMap;
use std::io;

use serde::{Deserialize, Serialize};

use super::reader::SegmentMeta;
use super::types::SegmentId;
use crate::models::{current_timestamp_millis, SeqNo};

/// Manifest entry for a segment
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub meta: SegmentMeta,
    /// crc32 of every immutable segment file, by file name
    pub checksums: BTreeMap<String, u32>,
}

/// The segment manifest tracks all live segments of one shard copy
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SegmentManifest {
    /// Manifest format version
    pub version: u32,
    /// Incremented on each update
    pub generation: u64,
    /// Next segment generation to allocate
    pub next_segment_id: SegmentId,
    /// Every operation up to this sequence number is reflected in the listed segments
    pub committed_seq: SeqNo,
    /// Live segments in generation order
    pub segments: Vec<ManifestEntry>,
    /// Timestamp of last update in milliseconds
    pub updated_at: u64,
}

impl SegmentManifest {
    /// Current manifest format version
    pub const VERSION: u32 = 1;

    pub fn new() -> Self {
        Self {
            version: Self::VERSION,
            generation: 0,
            next_segment_id: SegmentId::new(1),
            committed_seq: 0,
            segments: Vec::new(),
            updated_at: 0,
        }
    }

    /// Allocate a new segment generation
    pub fn allocate_segment_id(&mut self) -> SegmentId {
        let id = self.next_segment_id;
        self.next_segment_id = id.next();
        id
    }

    /// Make sure ids allocated from now on are above `id`
    pub fn reserve_past(&mut self, id: SegmentId) {
        if self.next_segment_id <= id {
            self.next_segment_id = id.next();
        }
    }

    pub fn add_segment(&mut self, meta: SegmentMeta, checksums: BTreeMap<String, u32>) {
        self.segments.push(ManifestEntry { meta, checksums });
        self.segments.sort_by_key(|e| e.meta.id);
        self.touch();
    }

    /// Remove a segment from the manifest (after merge)
    pub fn remove_segment(&mut self, segment_id: SegmentId) -> Option<ManifestEntry> {
        let pos = self.segments.iter().position(|e| e.meta.id == segment_id)?;
        self.touch();
        Some(self.segments.remove(pos))
    }

    /// Advance the committed sequence number; it never moves backwards
    pub fn advance_committed(&mut self, seq: SeqNo) {
        if seq > self.committed_seq {
            self.committed_seq = seq;
            self.touch();
        }
    }

    pub fn total_doc_count(&self) -> u64 {
        self.segments.iter().map(|e| e.meta.doc_count as u64).sum()
    }

    pub fn total_size_bytes(&self) -> u64 {
        self.segments.iter().map(|e| e.meta.size_bytes).sum()
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn get_segment(&self, segment_id: SegmentId) -> Option<&ManifestEntry> {
        self.segments.iter().find(|e| e.meta.id == segment_id)
    }

    pub fn contains(&self, segment_id: SegmentId) -> bool {
        self.get_segment(segment_id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.segments.iter()
    }

    pub fn to_json(&self) -> io::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub fn from_json(data: &[u8]) -> io::Result<Self> {
        serde_json::from_slice(data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    fn touch(&mut self) {
        self.generation += 1;
        self.updated_at = current_timestamp_millis();
    }
}

impl Default for SegmentManifest {
    fn default() -> Self {
        Self::new()
    }
}
