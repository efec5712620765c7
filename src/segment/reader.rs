//! Immutable segment reader
//!
//! A segment bundles the term dictionary, postings, columnar values, range
//! index, stored documents, docno map and statistics written by one flush or
//! merge. Everything except the live bitset is immutable; a delete flips one
//! bit by publishing a new bitmap so open snapshots keep the one they loaded.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};

use super::docno_map::DocNoMap;
use super::docvalues::ColumnStore;
use super::postings::{PostingIterator, PostingsReader};
use super::range_index::{RangeIndex, RangeQueryIter};
use super::statistics::SegmentStatistics;
use super::stored::StoredDocuments;
use super::term_dict::TermDictionary;
use super::types::{DocNo, PostingListMeta, SegmentId, Term};
use crate::error::{Result, ShoalError};
use crate::models::{Document, FieldValue, SeqNo};

/// Metadata for a segment stored in the manifest
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SegmentMeta {
    pub id: SegmentId,
    pub codec_version: u32,
    /// Lowest sequence number of a document in the segment
    pub min_seq: SeqNo,
    /// Highest sequence number of a document in the segment
    pub max_seq: SeqNo,
    /// Number of documents, deleted ones included
    pub doc_count: u32,
    /// Size in bytes (all segment files combined)
    pub size_bytes: u64,
    /// Creation timestamp in milliseconds
    pub created_at: u64,
}

/// The decoded parts of a segment
pub struct SegmentParts {
    pub terms: TermDictionary,
    pub postings: PostingsReader,
    pub columns: ColumnStore,
    pub ranges: RangeIndex,
    pub stored: StoredDocuments,
    pub docs: DocNoMap,
    pub stats: SegmentStatistics,
}

/// Immutable segment with a mutable live bitset
pub struct Segment {
    meta: SegmentMeta,
    terms: TermDictionary,
    postings: PostingsReader,
    columns: ColumnStore,
    ranges: RangeIndex,
    stored: StoredDocuments,
    docs: DocNoMap,
    stats: SegmentStatistics,
    live: ArcSwap<RoaringBitmap>,
    /// Set when the live bitset changed since it was last persisted
    live_dirty: AtomicBool,
}

impl Segment {
    /// Assemble a segment; `live` defaults to every document
    pub fn from_parts(meta: SegmentMeta, parts: SegmentParts, live: Option<RoaringBitmap>) -> Self {
        let live = live.unwrap_or_else(|| {
            let mut all = RoaringBitmap::new();
            all.insert_range(0..meta.doc_count);
            all
        });
        Self {
            meta,
            terms: parts.terms,
            postings: parts.postings,
            columns: parts.columns,
            ranges: parts.ranges,
            stored: parts.stored,
            docs: parts.docs,
            stats: parts.stats,
            live: ArcSwap::from_pointee(live),
            live_dirty: AtomicBool::new(false),
        }
    }

    pub fn meta(&self) -> &SegmentMeta {
        &self.meta
    }

    pub fn id(&self) -> SegmentId {
        self.meta.id
    }

    pub fn terms(&self) -> &TermDictionary {
        &self.terms
    }

    pub fn term_meta(&self, term: &Term) -> Option<&PostingListMeta> {
        self.terms.get(term)
    }

    /// Postings iterator for a term, `None` when the term is absent
    pub fn postings(&self, term: &Term) -> Result<Option<PostingIterator<'_>>> {
        match self.terms.get(term) {
            Some(meta) => self.postings_for(meta).map(Some),
            None => Ok(None),
        }
    }

    /// Postings iterator for a dictionary entry of this segment
    pub fn postings_for(&self, meta: &PostingListMeta) -> Result<PostingIterator<'_>> {
        self.postings
            .get_postings(meta)
            .map_err(|e| self.corrupt(format!("postings: {}", e)))
    }

    /// Document frequency of a term, deleted documents included
    pub fn doc_frequency(&self, term: &Term) -> u32 {
        self.terms.get(term).map_or(0, |m| m.doc_frequency)
    }

    /// Terms of `field` starting with `prefix`, in dictionary order
    pub fn prefix_terms(&self, field: &str, prefix: &str) -> Vec<(Term, &PostingListMeta)> {
        self.terms.prefix_search(field, prefix)
    }

    /// Columnar value of `field` for `docno`
    pub fn values_for(&self, field: &str, docno: DocNo) -> Option<FieldValue> {
        self.columns.values_for(field, docno)
    }

    pub fn columns(&self) -> &ColumnStore {
        &self.columns
    }

    /// Lazy block iterator over docnos whose `field` value lies in `[lo, hi]`
    pub fn range_query(
        &self,
        field: &str,
        lo: [i64; 2],
        hi: [i64; 2],
    ) -> Option<RangeQueryIter<'_>> {
        self.ranges.range_query(field, lo, hi)
    }

    pub fn ranges(&self) -> &RangeIndex {
        &self.ranges
    }

    /// Decode the stored source of `docno`
    pub fn stored_document(&self, docno: DocNo) -> Result<Option<Document>> {
        self.stored
            .get(docno)
            .map_err(|e| self.corrupt(format!("stored document {}: {}", docno.0, e)))
    }

    pub fn stored(&self) -> &StoredDocuments {
        &self.stored
    }

    pub fn docs(&self) -> &DocNoMap {
        &self.docs
    }

    pub fn key(&self, docno: DocNo) -> Option<&str> {
        self.docs.key(docno)
    }

    pub fn seq_no(&self, docno: DocNo) -> Option<SeqNo> {
        self.docs.seq_no(docno)
    }

    /// Docno of `key` if the key is live in this segment
    pub fn live_docno(&self, key: &str) -> Option<DocNo> {
        let docno = self.docs.docno(key)?;
        self.is_live(docno).then_some(docno)
    }

    pub fn stats(&self) -> &SegmentStatistics {
        &self.stats
    }

    pub fn is_live(&self, docno: DocNo) -> bool {
        self.live.load().contains(docno.0)
    }

    /// Current live bitset; the returned snapshot never changes
    pub fn live_docs(&self) -> Arc<RoaringBitmap> {
        self.live.load_full()
    }

    /// Clear the live bit of `docno`. Returns false if it was already clear.
    pub fn delete(&self, docno: DocNo) -> bool {
        if !self.is_live(docno) {
            return false;
        }
        self.live.rcu(|current| {
            let mut next = RoaringBitmap::clone(current);
            next.remove(docno.0);
            next
        });
        self.live_dirty.store(true, Ordering::Release);
        true
    }

    /// Clear the dirty flag, returning whether the bitset needs persisting
    pub fn take_live_dirty(&self) -> bool {
        self.live_dirty.swap(false, Ordering::AcqRel)
    }

    /// Re-arm the dirty flag after a failed persist
    pub fn mark_live_dirty(&self) {
        self.live_dirty.store(true, Ordering::Release);
    }

    pub fn doc_count(&self) -> u32 {
        self.meta.doc_count
    }

    pub fn live_doc_count(&self) -> u32 {
        self.live.load().len() as u32
    }

    pub fn delete_ratio(&self) -> f64 {
        if self.meta.doc_count == 0 {
            0.0
        } else {
            1.0 - (self.live_doc_count() as f64 / self.meta.doc_count as f64)
        }
    }

    pub fn size_bytes(&self) -> u64 {
        self.meta.size_bytes
    }

    fn corrupt(&self, reason: String) -> ShoalError {
        ShoalError::CorruptSegment {
            segment: self.meta.id.to_string(),
            reason,
        }
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("id", &self.meta.id)
            .field("doc_count", &self.meta.doc_count)
            .field("live", &self.live_doc_count())
            .finish()
    }
}

/// A segment together with the live bitset captured at one point in time.
///
/// Holding a view keeps the segment alive, so its files are not removed
/// while a reader or merge still uses it.
#[derive(Clone, Debug)]
pub struct SegmentView {
    pub segment: Arc<Segment>,
    pub live: Arc<RoaringBitmap>,
}

impl SegmentView {
    pub fn new(segment: Arc<Segment>) -> Self {
        let live = segment.live_docs();
        Self { segment, live }
    }

    /// Live documents in the captured bitset
    pub fn live_count(&self) -> u64 {
        self.live.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TokenizerConfig;
    use crate::schema::{FieldMapping, IndexMapping};
    use crate::segment::writer::SegmentBuilder;
    use crate::tokenizer::Tokenizer;

    fn build_segment() -> Segment {
        let mapping = IndexMapping::new()
            .field("body", FieldMapping::text())
            .field("tag", FieldMapping::keyword())
            .field("price", FieldMapping::long());
        let tokenizer = Tokenizer::new(&TokenizerConfig::default()).unwrap();
        let mut builder = SegmentBuilder::new(SegmentId::new(1), &mapping, &tokenizer);
        builder
            .add_document(
                "a",
                1,
                &Document::new()
                    .with_text("body", "hello world")
                    .with_keyword("tag", "x")
                    .with_long("price", 10),
            )
            .unwrap();
        builder
            .add_document(
                "b",
                2,
                &Document::new().with_text("body", "hello there").with_long("price", 30),
            )
            .unwrap();
        builder.finish().unwrap().segment
    }

    #[test]
    fn test_segment_lookups() {
        let segment = build_segment();
        assert_eq!(segment.doc_count(), 2);
        assert_eq!(segment.meta().min_seq, 1);
        assert_eq!(segment.meta().max_seq, 2);

        let hello = Term::new("body", "hello");
        assert_eq!(segment.doc_frequency(&hello), 2);
        let docs: Vec<_> = segment.postings(&hello).unwrap().unwrap().collect();
        assert_eq!(docs, vec![(DocNo(0), 1), (DocNo(1), 1)]);
        assert!(segment.postings(&Term::new("body", "missing")).unwrap().is_none());

        assert_eq!(segment.values_for("price", DocNo(1)), Some(FieldValue::Long(30)));
        assert_eq!(segment.key(DocNo(0)), Some("a"));
        assert_eq!(segment.live_docno("b"), Some(DocNo(1)));

        let stored = segment.stored_document(DocNo(0)).unwrap().unwrap();
        assert_eq!(stored.first("tag"), Some(&FieldValue::Keyword("x".to_string())));
    }

    #[test]
    fn test_segment_range_query() {
        let segment = build_segment();
        let hits: Vec<DocNo> = segment
            .range_query("price", [20, 0], [40, 0])
            .unwrap()
            .flatten()
            .collect();
        assert_eq!(hits, vec![DocNo(1)]);
        assert!(segment.range_query("body", [0, 0], [1, 0]).is_none());
    }

    #[test]
    fn test_segment_delete_keeps_snapshots() {
        let segment = build_segment();
        let before = segment.live_docs();

        assert!(segment.delete(DocNo(0)));
        assert!(!segment.delete(DocNo(0)));
        assert!(segment.take_live_dirty());
        assert!(!segment.take_live_dirty());

        assert!(!segment.is_live(DocNo(0)));
        assert_eq!(segment.live_docno("a"), None);
        assert_eq!(segment.live_doc_count(), 1);
        assert!((segment.delete_ratio() - 0.5).abs() < 1e-9);
        // An earlier snapshot still sees the document
        assert!(before.contains(0));
    }
}
