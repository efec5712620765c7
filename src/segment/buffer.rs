//! Mutable buffer for in-memory writes
//!
//! Holds sequenced documents that have been logged but not yet flushed into
//! an immutable segment. At most one entry per key: an update replaces the
//! buffered version, a delete removes it. Flush walks the entries in
//! sequence order and the buffer is cleared only after the new segment is
//! published.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::config::BufferConfig;
use crate::models::{DocKey, Document, SeqNo};

/// A document waiting in the buffer
#[derive(Clone, Debug)]
pub struct BufferedDoc {
    pub key: DocKey,
    pub seq_no: SeqNo,
    pub document: Arc<Document>,
    size: usize,
}

/// In-memory mutable buffer for recent writes
#[derive(Debug, Default)]
pub struct MutableBuffer {
    /// Entries ordered by sequence number
    docs: BTreeMap<SeqNo, BufferedDoc>,
    /// Key to the sequence number of its buffered entry
    by_key: HashMap<DocKey, SeqNo>,
    /// Approximate size in bytes
    size_bytes: usize,
}

impl MutableBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a document. Returns the entry it replaced, if the key was buffered.
    pub fn insert(
        &mut self,
        key: DocKey,
        seq_no: SeqNo,
        document: Arc<Document>,
    ) -> Option<BufferedDoc> {
        let replaced = self.remove(&key);
        let size = document.approx_size() + key.len() + 32;
        self.size_bytes += size;
        self.by_key.insert(key.clone(), seq_no);
        self.docs.insert(
            seq_no,
            BufferedDoc {
                key,
                seq_no,
                document,
                size,
            },
        );
        replaced
    }

    /// Drop the buffered entry for `key`
    pub fn remove(&mut self, key: &str) -> Option<BufferedDoc> {
        let seq = self.by_key.remove(key)?;
        let entry = self.docs.remove(&seq)?;
        self.size_bytes = self.size_bytes.saturating_sub(entry.size);
        Some(entry)
    }

    pub fn get(&self, key: &str) -> Option<&BufferedDoc> {
        self.by_key.get(key).and_then(|seq| self.docs.get(seq))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.by_key.contains_key(key)
    }

    /// Entries in ascending sequence order
    pub fn iter(&self) -> impl Iterator<Item = &BufferedDoc> {
        self.docs.values()
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    /// Whether either flush threshold has been reached
    pub fn should_flush(&self, config: &BufferConfig) -> bool {
        self.docs.len() >= config.max_docs || self.size_bytes >= config.max_bytes
    }

    /// Lowest and highest buffered sequence number
    pub fn seq_range(&self) -> Option<(SeqNo, SeqNo)> {
        let min = *self.docs.keys().next()?;
        let max = *self.docs.keys().next_back()?;
        Some((min, max))
    }

    pub fn clear(&mut self) {
        self.docs.clear();
        self.by_key.clear();
        self.size_bytes = 0;
    }
}
