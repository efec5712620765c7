//! Term dictionary using FST (Finite State Transducer)
//!
//! Keys are `field \0 token` (see [`Term::to_key`]) mapped to an index into a
//! parallel array of postings metadata. Sorted keys make per-field prefix
//! lookups a single FST range scan.

use std::io;

use fst::{IntoStreamer, Map, MapBuilder, Streamer};

use super::types::{PostingListMeta, Term};

/// Term dictionary backed by FST
pub struct TermDictionary {
    /// FST mapping term key -> index in metadata array
    fst: Map<Vec<u8>>,
    /// Metadata for each term (parallel to FST output values)
    metadata: Vec<PostingListMeta>,
}

impl TermDictionary {
    /// Create a term dictionary from FST data and metadata
    pub fn new(fst_data: Vec<u8>, metadata: Vec<PostingListMeta>) -> io::Result<Self> {
        let fst =
            Map::new(fst_data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if fst.len() != metadata.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "term dictionary has {} keys but {} metadata entries",
                    fst.len(),
                    metadata.len()
                ),
            ));
        }
        Ok(Self { fst, metadata })
    }

    pub fn empty() -> io::Result<Self> {
        TermDictionaryBuilder::new().build()
    }

    /// Look up a term and return its postings metadata
    pub fn get(&self, term: &Term) -> Option<&PostingListMeta> {
        self.fst
            .get(term.to_key())
            .and_then(|idx| self.metadata.get(idx as usize))
    }

    pub fn contains(&self, term: &Term) -> bool {
        self.fst.contains_key(term.to_key())
    }

    pub fn len(&self) -> usize {
        self.metadata.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metadata.is_empty()
    }

    /// All terms of `field` whose token starts with `prefix`, in token order
    pub fn prefix_search(&self, field: &str, prefix: &str) -> Vec<(Term, &PostingListMeta)> {
        let key_prefix = Term::key_prefix(field, prefix);
        let mut results = Vec::new();

        let mut stream = self.fst.range().ge(&key_prefix).into_stream();
        while let Some((key, idx)) = stream.next() {
            if !key.starts_with(&key_prefix) {
                break;
            }
            if let (Some(term), Some(meta)) = (Term::from_key(key), self.metadata.get(idx as usize))
            {
                results.push((term, meta));
            }
        }

        results
    }

    pub fn fst_bytes(&self) -> &[u8] {
        self.fst.as_fst().as_bytes()
    }

    pub fn metadata(&self) -> &[PostingListMeta] {
        &self.metadata
    }

    /// Iterate over all terms in key order
    pub fn iter_terms(&self) -> Vec<(Term, &PostingListMeta)> {
        let mut results = Vec::with_capacity(self.metadata.len());
        let mut stream = self.fst.stream();
        while let Some((key, idx)) = stream.next() {
            if let (Some(term), Some(meta)) = (Term::from_key(key), self.metadata.get(idx as usize))
            {
                results.push((term, meta));
            }
        }
        results
    }
}

/// Builder for term dictionaries
pub struct TermDictionaryBuilder {
    terms: Vec<(Vec<u8>, PostingListMeta)>,
}

impl TermDictionaryBuilder {
    pub fn new() -> Self {
        Self { terms: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            terms: Vec::with_capacity(capacity),
        }
    }

    /// Add a term with its postings metadata
    pub fn add(&mut self, term: &Term, meta: PostingListMeta) {
        self.terms.push((term.to_key(), meta));
    }

    /// Build the term dictionary
    pub fn build(mut self) -> io::Result<TermDictionary> {
        // FST requires sorted, unique input
        self.terms.sort_by(|a, b| a.0.cmp(&b.0));

        let mut fst_builder = MapBuilder::memory();
        let mut metadata = Vec::with_capacity(self.terms.len());

        for (idx, (key, meta)) in self.terms.into_iter().enumerate() {
            fst_builder
                .insert(&key, idx as u64)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            metadata.push(meta);
        }

        let fst_data = fst_builder
            .into_inner()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        TermDictionary::new(fst_data, metadata)
    }
}

impl Default for TermDictionaryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(offset: u64, df: u32) -> PostingListMeta {
        PostingListMeta {
            offset,
            length: 10,
            doc_frequency: df,
            total_term_frequency: df as u64,
        }
    }

    #[test]
    fn test_term_dictionary_builder() {
        let mut builder = TermDictionaryBuilder::new();
        builder.add(&Term::new("body", "cherry"), meta(20, 15));
        builder.add(&Term::new("body", "apple"), meta(0, 10));
        builder.add(&Term::new("title", "apple"), meta(10, 20));

        let dict = builder.build().unwrap();

        assert_eq!(dict.len(), 3);
        assert_eq!(dict.get(&Term::new("body", "apple")).unwrap().doc_frequency, 10);
        assert_eq!(dict.get(&Term::new("title", "apple")).unwrap().doc_frequency, 20);
        assert!(!dict.contains(&Term::new("body", "date")));
        assert!(!dict.contains(&Term::new("tag", "apple")));

        let terms: Vec<Term> = dict.iter_terms().into_iter().map(|(t, _)| t).collect();
        assert_eq!(terms[0], Term::new("body", "apple"));
        assert_eq!(terms[2], Term::new("title", "apple"));
    }

    #[test]
    fn test_prefix_search_stays_in_field() {
        let mut builder = TermDictionaryBuilder::new();
        builder.add(&Term::new("body", "test"), meta(0, 10));
        builder.add(&Term::new("body", "testing"), meta(10, 5));
        builder.add(&Term::new("body", "tester"), meta(20, 3));
        builder.add(&Term::new("body", "other"), meta(30, 2));
        builder.add(&Term::new("bodyx", "test"), meta(40, 1));
        builder.add(&Term::new("title", "testing"), meta(50, 1));

        let dict = builder.build().unwrap();

        let results = dict.prefix_search("body", "test");
        let tokens: Vec<&str> = results.iter().map(|(t, _)| t.token.as_str()).collect();
        assert_eq!(tokens, vec!["test", "tester", "testing"]);
        assert!(results.iter().all(|(t, _)| t.field == "body"));

        assert!(dict.prefix_search("body", "zz").is_empty());
        assert_eq!(dict.prefix_search("title", "").len(), 1);
    }

    #[test]
    fn test_metadata_mismatch_is_rejected() {
        let dict = TermDictionaryBuilder::new().build().unwrap();
        let bytes = dict.fst_bytes().to_vec();
        assert!(TermDictionary::new(bytes, vec![meta(0, 1)]).is_err());
    }
}
