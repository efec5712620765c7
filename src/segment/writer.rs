//! Segment writer for creating new immutable segments
//!
//! A flush feeds buffered documents through `SegmentBuilder`, which analyzes
//! text, accumulates postings per term and fills the columnar, range, stored
//! and statistics structures. `merge_segments` rebuilds one segment from
//! several without re-analyzing: postings are k-way merged by remapped docno.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};

use super::docno_map::DocNoMap;
use super::docvalues::ColumnStoreBuilder;
use super::postings::{DocCursor, PostingIterator, PostingsReader, PostingsWriter};
use super::range_index::RangeIndexBuilder;
use super::reader::{Segment, SegmentMeta, SegmentParts, SegmentView};
use super::statistics::SegmentStatistics;
use super::store::SegmentFiles;
use super::stored::StoredDocuments;
use super::term_dict::TermDictionaryBuilder;
use super::types::{DocNo, Posting, SegmentId, Term, SEGMENT_CODEC_VERSION};
use crate::error::{Result, ShoalError};
use crate::models::{current_timestamp_millis, Document, FieldValue, SeqNo};
use crate::schema::{FieldType, IndexMapping};
use crate::tokenizer::Tokenizer;

/// Position gap inserted between values of a multi-valued text field, so a
/// phrase never matches across two values
const POSITION_INCREMENT_GAP: u32 = 100;

/// A freshly built segment together with its encoded files
pub struct SegmentWriteResult {
    pub segment: Segment,
    pub files: SegmentFiles,
}

/// Builds one segment from documents in docno order
pub struct SegmentBuilder<'a> {
    id: SegmentId,
    mapping: &'a IndexMapping,
    tokenizer: &'a Tokenizer,
    postings: BTreeMap<Term, Vec<Posting>>,
    columns: ColumnStoreBuilder,
    ranges: RangeIndexBuilder,
    stored: StoredDocuments,
    docs: DocNoMap,
    stats: SegmentStatistics,
}

impl<'a> SegmentBuilder<'a> {
    pub fn new(id: SegmentId, mapping: &'a IndexMapping, tokenizer: &'a Tokenizer) -> Self {
        Self {
            id,
            mapping,
            tokenizer,
            postings: BTreeMap::new(),
            columns: ColumnStoreBuilder::new(),
            ranges: RangeIndexBuilder::new(),
            stored: StoredDocuments::new(),
            docs: DocNoMap::new(),
            stats: SegmentStatistics::default(),
        }
    }

    /// Add one document; it receives the next docno.
    ///
    /// Fields absent from the mapping are stored but not indexed.
    pub fn add_document(&mut self, key: &str, seq_no: SeqNo, doc: &Document) -> Result<DocNo> {
        let docno = self.docs.add(key.to_string(), seq_no)?;
        self.stored.push(doc)?;

        let mut doc_postings: HashMap<Term, Posting> = HashMap::new();

        for (field, values) in doc.fields() {
            let Some(field_mapping) = self.mapping.get_field(field) else {
                continue;
            };
            if field_mapping.has_column() {
                if let Some(first) = values.first() {
                    self.columns.add(field, docno, first);
                }
            }
            if !field_mapping.index {
                continue;
            }

            let mut next_position = 0u32;
            let mut field_length = 0u32;
            for value in values {
                match (&field_mapping.field_type, value) {
                    (FieldType::Text { index_positions }, FieldValue::Text(text)) => {
                        let mut last = None;
                        for (token, pos) in self.tokenizer.tokenize_with_positions_ordered(text) {
                            let position = next_position + pos;
                            let posting = doc_postings
                                .entry(Term::new(field, token))
                                .or_insert_with(|| Posting::new(docno, 0));
                            posting.term_frequency += 1;
                            if *index_positions {
                                posting.positions.push(position);
                            }
                            field_length += 1;
                            last = Some(position);
                        }
                        if let Some(last) = last {
                            next_position = last + 1 + POSITION_INCREMENT_GAP;
                        }
                    }
                    (FieldType::Keyword { ignore_above }, FieldValue::Keyword(keyword)) => {
                        if keyword.chars().count() <= *ignore_above {
                            let posting = doc_postings
                                .entry(Term::new(field, keyword.as_str()))
                                .or_insert_with(|| Posting::new(docno, 0));
                            posting.term_frequency += 1;
                            field_length += 1;
                        }
                    }
                    (_, value) => self.ranges.add(field, docno, value),
                }
            }
            if field_length > 0 {
                self.stats.add_field_length(field, docno, field_length);
            }
        }

        for (term, posting) in doc_postings {
            self.postings.entry(term).or_default().push(posting);
        }
        Ok(docno)
    }

    pub fn doc_count(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn finish(self) -> Result<SegmentWriteResult> {
        let parts = SegmentAssembly {
            postings: self.postings.into_iter().map(Ok),
            columns: self.columns,
            ranges: self.ranges,
            stored: self.stored,
            docs: self.docs,
            stats: self.stats,
        };
        parts.assemble(self.id)
    }
}

/// Everything needed to freeze a segment; postings arrive in term order
struct SegmentAssembly<I> {
    postings: I,
    columns: ColumnStoreBuilder,
    ranges: RangeIndexBuilder,
    stored: StoredDocuments,
    docs: DocNoMap,
    stats: SegmentStatistics,
}

impl<I> SegmentAssembly<I>
where
    I: Iterator<Item = Result<(Term, Vec<Posting>)>>,
{
    fn assemble(self, id: SegmentId) -> Result<SegmentWriteResult> {
        let mut writer = PostingsWriter::new();
        let mut term_builder = TermDictionaryBuilder::new();

        for entry in self.postings {
            let (term, postings) = entry?;
            if postings.is_empty() {
                continue;
            }
            writer.start_posting_list();
            let mut total_term_frequency = 0u64;
            let doc_frequency = postings.len() as u32;
            for posting in postings {
                total_term_frequency += posting.term_frequency as u64;
                writer.add_posting(posting)?;
            }
            term_builder.add(
                &term,
                writer.finish_posting_list(doc_frequency, total_term_frequency),
            );
        }

        let doc_count = self.docs.len();
        let mut stats = self.stats;
        stats.doc_count = doc_count as u32;

        let parts = SegmentParts {
            terms: term_builder.build()?,
            postings: PostingsReader::new(writer.into_data()),
            columns: self.columns.build(doc_count),
            ranges: self.ranges.build(),
            stored: self.stored,
            docs: self.docs,
            stats,
        };
        let files = SegmentFiles::encode(&parts)?;
        let (min_seq, max_seq) = parts.docs.seq_range().unwrap_or((0, 0));
        let meta = SegmentMeta {
            id,
            codec_version: SEGMENT_CODEC_VERSION,
            min_seq,
            max_seq,
            doc_count: doc_count as u32,
            size_bytes: files.size_bytes(),
            created_at: current_timestamp_millis(),
        };

        Ok(SegmentWriteResult {
            segment: Segment::from_parts(meta, parts, None),
            files,
        })
    }
}

/// One input of a merge: the segment and the live bitset captured when the merge started
pub type MergeInput = SegmentView;

/// Result of a merge
pub struct MergeOutput {
    pub result: SegmentWriteResult,
    /// Per input, old docno to new docno (`None` for documents dropped as deleted)
    pub remap: Vec<Vec<Option<DocNo>>>,
}

impl MergeOutput {
    /// Delete from the merged segment every document that was deleted in an
    /// input after the merge captured its live bitset. Returns the count.
    pub fn carry_over_deletes(&self, inputs: &[MergeInput]) -> usize {
        let mut carried = 0;
        for (input, remap) in inputs.iter().zip(&self.remap) {
            let now = input.segment.live_docs();
            for old in input.live.iter() {
                if now.contains(old) {
                    continue;
                }
                if let Some(Some(new)) = remap.get(old as usize) {
                    if self.result.segment.delete(*new) {
                        carried += 1;
                    }
                }
            }
        }
        carried
    }
}

/// Merge several segments into a new one, dropping documents not live in
/// each input's captured bitset and renumbering the rest densely, inputs in
/// the given order.
pub fn merge_segments(id: SegmentId, inputs: &[MergeInput]) -> Result<MergeOutput> {
    if inputs.is_empty() {
        return Err(ShoalError::Internal("no segments to merge".to_string()));
    }

    let mut docs = DocNoMap::new();
    let mut stored = StoredDocuments::new();
    let mut columns = ColumnStoreBuilder::new();
    let mut ranges = RangeIndexBuilder::new();
    let mut stats = SegmentStatistics::default();
    let mut remap: Vec<Vec<Option<DocNo>>> = Vec::with_capacity(inputs.len());

    for input in inputs {
        let segment = &input.segment;
        let mut input_remap = vec![None; segment.doc_count() as usize];
        for old in input.live.iter() {
            let old = DocNo(old);
            let (Some(key), Some(seq)) = (segment.key(old), segment.seq_no(old)) else {
                continue;
            };
            let doc = segment.stored_document(old)?.ok_or_else(|| ShoalError::CorruptSegment {
                segment: segment.id().to_string(),
                reason: format!("missing stored document {}", old.0),
            })?;
            let new = docs.add(key.to_string(), seq)?;
            stored.push(&doc)?;
            for field in segment.columns().fields() {
                if let Some(value) = segment.values_for(field, old) {
                    columns.add(field, new, &value);
                }
            }
            for (field, lengths) in segment.stats().fields() {
                stats.add_field_length(field, new, lengths.get(old));
            }
            if let Some(slot) = input_remap.get_mut(old.as_usize()) {
                *slot = Some(new);
            }
        }

        for field in segment.ranges().fields() {
            if let Some(tree) = segment.ranges().tree(field) {
                for (coords, old) in tree.points() {
                    if let Some(Some(new)) = input_remap.get(old.as_usize()) {
                        ranges.add_point(field, tree.encoding(), coords, *new);
                    }
                }
            }
        }
        remap.push(input_remap);
    }

    let mut terms = BTreeSet::new();
    for input in inputs {
        for (term, _) in input.segment.terms().iter_terms() {
            terms.insert(term);
        }
    }

    let merged_postings = terms
        .into_iter()
        .map(|term| merge_postings(inputs, &remap, &term).map(|postings| (term, postings)));

    let result = SegmentAssembly {
        postings: merged_postings,
        columns,
        ranges,
        stored,
        docs,
        stats,
    }
    .assemble(id)?;

    Ok(MergeOutput { result, remap })
}

/// K-way merge of one term's postings across inputs by remapped docno
fn merge_postings(
    inputs: &[MergeInput],
    remap: &[Vec<Option<DocNo>>],
    term: &Term,
) -> Result<Vec<Posting>> {
    let mut cursors: Vec<(usize, PostingIterator<'_>)> = Vec::new();
    for (i, input) in inputs.iter().enumerate() {
        if let Some(iter) = input.segment.postings(term)? {
            cursors.push((i, iter));
        }
    }

    let advance = |input: usize, cursor: &mut PostingIterator<'_>| -> Option<DocNo> {
        while let Some(old) = cursor.next_doc() {
            if let Some(Some(new)) = remap[input].get(old.as_usize()) {
                return Some(*new);
            }
        }
        None
    };

    let mut heap = BinaryHeap::new();
    for (slot, (input, cursor)) in cursors.iter_mut().enumerate() {
        if let Some(new) = advance(*input, cursor) {
            heap.push(Reverse((new, slot)));
        }
    }

    let mut merged = Vec::new();
    while let Some(Reverse((new, slot))) = heap.pop() {
        let (input, cursor) = &mut cursors[slot];
        let positions = cursor.positions();
        merged.push(if positions.is_empty() {
            Posting::new(new, cursor.term_frequency())
        } else {
            Posting::with_positions(new, positions.to_vec())
        });
        if let Some(next) = advance(*input, cursor) {
            heap.push(Reverse((next, slot)));
        }
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::config::TokenizerConfig;
    use crate::schema::FieldMapping;

    fn mapping() -> IndexMapping {
        IndexMapping::new()
            .field("body", FieldMapping::text())
            .field("tag", FieldMapping::keyword())
            .field("price", FieldMapping::double())
    }

    fn build(id: u64, docs: &[(&str, SeqNo, &str, f64)]) -> Arc<Segment> {
        let mapping = mapping();
        let tokenizer = Tokenizer::new(&TokenizerConfig::default()).unwrap();
        let mut builder = SegmentBuilder::new(SegmentId::new(id), &mapping, &tokenizer);
        for (key, seq, body, price) in docs {
            builder
                .add_document(
                    key,
                    *seq,
                    &Document::new()
                        .with_text("body", *body)
                        .with_keyword("tag", *key)
                        .with_double("price", *price),
                )
                .unwrap();
        }
        Arc::new(builder.finish().unwrap().segment)
    }

    fn keys_for(segment: &Segment, term: &Term) -> Vec<String> {
        let live = segment.live_docs();
        segment
            .postings(term)
            .unwrap()
            .map(|iter| {
                iter.filter(|(d, _)| live.contains(d.0))
                    .filter_map(|(d, _)| segment.key(d).map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    #[test]
    fn test_builder_positions_and_lengths() {
        let mapping = mapping();
        let tokenizer = Tokenizer::new(&TokenizerConfig::default()).unwrap();
        let mut builder = SegmentBuilder::new(SegmentId::new(1), &mapping, &tokenizer);
        let doc = Document::new()
            .with_text("body", "the cat saw the cat")
            .with_text("body", "cat")
            .with_text("unmapped", "ignored words");
        builder.add_document("k", 5, &doc).unwrap();
        let segment = builder.finish().unwrap().segment;

        let mut iter = segment.postings(&Term::new("body", "cat")).unwrap().unwrap();
        assert_eq!(iter.next_doc(), Some(DocNo(0)));
        assert_eq!(iter.term_frequency(), 3);
        assert_eq!(iter.positions(), &[1, 4, 5 + POSITION_INCREMENT_GAP]);
        assert_eq!(segment.stats().field_length("body", DocNo(0)), 6);

        // Unmapped fields are stored only
        assert!(segment.postings(&Term::new("unmapped", "ignored")).unwrap().is_none());
        let stored = segment.stored_document(DocNo(0)).unwrap().unwrap();
        assert_eq!(stored, doc);
    }

    #[test]
    fn test_merge_drops_deleted_and_remaps() {
        let a = build(1, &[("a1", 1, "red apple", 1.0), ("a2", 2, "green apple", 2.0)]);
        let b = build(2, &[("b1", 3, "red berry", 3.0), ("b2", 4, "blue berry", 4.0)]);
        a.delete(DocNo(1));

        let inputs = vec![MergeInput::new(a.clone()), MergeInput::new(b.clone())];
        let output = merge_segments(SegmentId::new(3), &inputs).unwrap();
        let merged = &output.result.segment;

        assert_eq!(merged.doc_count(), 3);
        assert_eq!(merged.meta().min_seq, 1);
        assert_eq!(merged.meta().max_seq, 4);
        assert_eq!(output.remap[0], vec![Some(DocNo(0)), None]);
        assert_eq!(output.remap[1], vec![Some(DocNo(1)), Some(DocNo(2))]);

        for term in ["red", "apple", "berry", "green", "blue"] {
            let term = Term::new("body", term);
            let mut expected = keys_for(&a, &term);
            expected.extend(keys_for(&b, &term));
            assert_eq!(keys_for(merged, &term), expected, "term {}", term);
        }

        assert_eq!(merged.values_for("price", DocNo(2)), Some(FieldValue::Double(4.0)));
        assert_eq!(merged.stats().field_length("body", DocNo(1)), 2);
        let hits: Vec<DocNo> = merged
            .range_query("price", [i64::MIN, 0], [i64::MAX, 0])
            .unwrap()
            .flatten()
            .collect();
        assert_eq!(hits.len(), 3);
        assert_eq!(merged.live_docno("a2"), None);
        assert_eq!(merged.live_docno("b2"), Some(DocNo(2)));
    }

    #[test]
    fn test_merge_carries_over_concurrent_deletes() {
        let a = build(1, &[("a1", 1, "x", 1.0), ("a2", 2, "y", 2.0)]);
        let inputs = vec![MergeInput::new(a.clone())];
        let output = merge_segments(SegmentId::new(2), &inputs).unwrap();

        // Delete lands after the merge captured its bitset
        a.delete(DocNo(0));
        assert_eq!(output.carry_over_deletes(&inputs), 1);
        assert_eq!(output.result.segment.live_docno("a1"), None);
        assert_eq!(output.result.segment.live_doc_count(), 1);
    }
}
