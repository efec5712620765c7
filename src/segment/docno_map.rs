//! Dense document number mapping
//!
//! Each segment allocates a dense `docno: u32` in `[0..max_doc)` and keeps
//! `docno -> (key, seq_no)` plus the reverse key lookup used by get and delete.

use std::collections::HashMap;
use std::io;

use super::postings::{decode_vbyte, encode_vbyte};
use super::types::DocNo;
use crate::models::{DocKey, SeqNo};

/// Dense document number mapping for a segment
#[derive(Clone, Debug, Default)]
pub struct DocNoMap {
    keys: Vec<DocKey>,
    seq_nos: Vec<SeqNo>,
    by_key: HashMap<DocKey, DocNo>,
}

impl DocNoMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            keys: Vec::with_capacity(capacity),
            seq_nos: Vec::with_capacity(capacity),
            by_key: HashMap::with_capacity(capacity),
        }
    }

    /// Add a new document and return its docno. A segment holds each key at most once.
    pub fn add(&mut self, key: DocKey, seq_no: SeqNo) -> io::Result<DocNo> {
        let docno = DocNo::new(self.keys.len() as u32);
        if self.by_key.insert(key.clone(), docno).is_some() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("duplicate key '{}' in segment", key),
            ));
        }
        self.keys.push(key);
        self.seq_nos.push(seq_no);
        Ok(docno)
    }

    pub fn key(&self, docno: DocNo) -> Option<&str> {
        self.keys.get(docno.as_usize()).map(|k| k.as_str())
    }

    pub fn seq_no(&self, docno: DocNo) -> Option<SeqNo> {
        self.seq_nos.get(docno.as_usize()).copied()
    }

    pub fn docno(&self, key: &str) -> Option<DocNo> {
        self.by_key.get(key).copied()
    }

    /// Number of documents (including deleted)
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Lowest and highest sequence number in the segment
    pub fn seq_range(&self) -> Option<(SeqNo, SeqNo)> {
        let min = self.seq_nos.iter().copied().min()?;
        let max = self.seq_nos.iter().copied().max()?;
        Some((min, max))
    }

    pub fn iter(&self) -> impl Iterator<Item = (DocNo, &str, SeqNo)> {
        self.keys
            .iter()
            .zip(self.seq_nos.iter())
            .enumerate()
            .map(|(i, (k, s))| (DocNo::new(i as u32), k.as_str(), *s))
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut output = Vec::new();
        encode_vbyte(self.keys.len() as u32, &mut output);
        for (key, seq) in self.keys.iter().zip(self.seq_nos.iter()) {
            output.extend_from_slice(&seq.to_le_bytes());
            encode_vbyte(key.len() as u32, &mut output);
            output.extend_from_slice(key.as_bytes());
        }
        output
    }

    pub fn deserialize(data: &[u8]) -> io::Result<Self> {
        let truncated = || io::Error::new(io::ErrorKind::UnexpectedEof, "docno map truncated");
        let mut pos = 0;
        let count = decode_vbyte(data, &mut pos)? as usize;
        let mut map = DocNoMap::with_capacity(count.min(data.len()));

        for _ in 0..count {
            let seq_bytes = data.get(pos..pos + 8).ok_or_else(truncated)?;
            let mut seq = [0u8; 8];
            seq.copy_from_slice(seq_bytes);
            pos += 8;

            let len = decode_vbyte(data, &mut pos)? as usize;
            let key_bytes = data.get(pos..pos + len).ok_or_else(truncated)?;
            let key = std::str::from_utf8(key_bytes)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
                .to_string();
            pos += len;

            map.add(key, u64::from_le_bytes(seq))?;
        }
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_docno_map_basic() {
        let mut map = DocNoMap::new();
        let a = map.add("a".to_string(), 7).unwrap();
        let b = map.add("b".to_string(), 3).unwrap();

        assert_eq!(a, DocNo(0));
        assert_eq!(b, DocNo(1));
        assert_eq!(map.key(b), Some("b"));
        assert_eq!(map.seq_no(a), Some(7));
        assert_eq!(map.docno("b"), Some(DocNo(1)));
        assert_eq!(map.docno("zz"), None);
        assert_eq!(map.seq_range(), Some((3, 7)));
        assert!(map.add("a".to_string(), 9).is_err());
    }

    #[test]
    fn test_docno_map_serialization() {
        let mut map = DocNoMap::new();
        for i in 0..100u64 {
            map.add(format!("doc-{}", i), i + 1).unwrap();
        }

        let restored = DocNoMap::deserialize(&map.serialize()).unwrap();
        assert_eq!(restored.len(), 100);
        assert_eq!(restored.key(DocNo(42)), Some("doc-42"));
        assert_eq!(restored.seq_no(DocNo(42)), Some(43));
        assert_eq!(restored.docno("doc-99"), Some(DocNo(99)));

        let bytes = map.serialize();
        assert!(DocNoMap::deserialize(&bytes[..bytes.len() - 3]).is_err());
    }
}
