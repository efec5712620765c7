//! Core types for the segment-based index

use serde::{Deserialize, Serialize};
use std::fmt;

/// On-disk format version written into every segment's metadata
pub const SEGMENT_CODEC_VERSION: u32 = 1;

/// Postings are written in fixed blocks of this many documents
pub const BLOCK_SIZE: usize = 128;

/// Separator between field and token in term dictionary keys
pub const TERM_SEPARATOR: u8 = 0;

/// Segment generation (monotonically increasing per shard copy)
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SegmentId(pub u64);

impl SegmentId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "segment_{}", self.0)
    }
}

/// Dense document number within a segment (0..max_doc)
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct DocNo(pub u32);

impl DocNo {
    pub const MAX: DocNo = DocNo(u32::MAX);

    pub fn new(n: u32) -> Self {
        Self(n)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// A (field, token) pair
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Term {
    pub field: String,
    pub token: String,
}

impl Term {
    pub fn new(field: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            token: token.into(),
        }
    }

    /// Dictionary key: `field \0 token`. Sorting keys sorts by field, then token.
    pub fn to_key(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.field.len() + 1 + self.token.len());
        key.extend_from_slice(self.field.as_bytes());
        key.push(TERM_SEPARATOR);
        key.extend_from_slice(self.token.as_bytes());
        key
    }

    /// Key prefix shared by every term of `field` whose token starts with `token_prefix`
    pub fn key_prefix(field: &str, token_prefix: &str) -> Vec<u8> {
        Term::new(field, token_prefix).to_key()
    }

    pub fn from_key(key: &[u8]) -> Option<Self> {
        let sep = key.iter().position(|b| *b == TERM_SEPARATOR)?;
        let field = std::str::from_utf8(&key[..sep]).ok()?;
        let token = std::str::from_utf8(&key[sep + 1..]).ok()?;
        Some(Term::new(field, token))
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.field, self.token)
    }
}

/// A single posting entry within a posting list
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Posting {
    pub docno: DocNo,
    pub term_frequency: u32,
    /// Token positions within the field, ascending (empty for untokenized fields)
    pub positions: Vec<u32>,
}

impl Posting {
    pub fn new(docno: DocNo, term_frequency: u32) -> Self {
        Self {
            docno,
            term_frequency,
            positions: Vec::new(),
        }
    }

    pub fn with_positions(docno: DocNo, positions: Vec<u32>) -> Self {
        Self {
            docno,
            term_frequency: positions.len() as u32,
            positions,
        }
    }
}

/// A block of postings waiting to be encoded
#[derive(Clone, Debug, Default)]
pub struct PostingBlock {
    pub docnos: Vec<DocNo>,
    pub term_frequencies: Vec<u32>,
    pub positions: Vec<Vec<u32>>,
    pub max_docno: DocNo,
    pub max_tf: u32,
}

impl PostingBlock {
    pub fn new() -> Self {
        Self {
            docnos: Vec::with_capacity(BLOCK_SIZE),
            term_frequencies: Vec::with_capacity(BLOCK_SIZE),
            positions: Vec::with_capacity(BLOCK_SIZE),
            max_docno: DocNo(0),
            max_tf: 0,
        }
    }

    pub fn is_full(&self) -> bool {
        self.docnos.len() >= BLOCK_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.docnos.is_empty()
    }

    pub fn len(&self) -> usize {
        self.docnos.len()
    }

    pub fn push(&mut self, posting: Posting) {
        if posting.docno > self.max_docno {
            self.max_docno = posting.docno;
        }
        if posting.term_frequency > self.max_tf {
            self.max_tf = posting.term_frequency;
        }
        self.docnos.push(posting.docno);
        self.term_frequencies.push(posting.term_frequency);
        self.positions.push(posting.positions);
    }
}

/// Posting list metadata stored in the term dictionary
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PostingListMeta {
    /// Offset in the postings file
    pub offset: u64,
    /// Length in bytes
    pub length: u64,
    /// Number of documents containing this term (deleted ones included)
    pub doc_frequency: u32,
    /// Total term frequency across all documents
    pub total_term_frequency: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_id() {
        let id = SegmentId::new(42);
        assert_eq!(id.next().0, 43);
        assert_eq!(format!("{}", id), "segment_42");
    }

    #[test]
    fn test_term_key_ordering() {
        let a = Term::new("body", "zebra").to_key();
        let b = Term::new("title", "apple").to_key();
        // Field sorts first because the separator is the smallest byte
        assert!(a < b);
        assert!(Term::new("ab", "c").to_key() < Term::new("abc", "").to_key());

        let term = Term::from_key(&Term::new("title", "rust").to_key()).unwrap();
        assert_eq!(term, Term::new("title", "rust"));
    }

    #[test]
    fn test_posting_block() {
        let mut block = PostingBlock::new();
        assert!(block.is_empty());

        block.push(Posting::new(DocNo(1), 5));
        block.push(Posting::with_positions(DocNo(10), vec![0, 4, 9]));

        assert_eq!(block.len(), 2);
        assert_eq!(block.max_docno, DocNo(10));
        assert_eq!(block.max_tf, 5);
        assert_eq!(block.term_frequencies[1], 3);
    }
}
