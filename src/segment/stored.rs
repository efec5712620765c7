//! Stored documents: the full source of every document, addressed by docno

use serde::{Deserialize, Serialize};

use super::types::DocNo;
use crate::models::Document;

/// Offsets into one contiguous buffer of bincode-encoded documents
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StoredDocuments {
    offsets: Vec<u64>,
    data: Vec<u8>,
}

impl StoredDocuments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a document; docnos are assigned in append order
    pub fn push(&mut self, doc: &Document) -> bincode::Result<DocNo> {
        let docno = DocNo(self.offsets.len() as u32);
        self.offsets.push(self.data.len() as u64);
        bincode::serialize_into(&mut self.data, doc)?;
        Ok(docno)
    }

    /// Decode the document at `docno`
    pub fn get(&self, docno: DocNo) -> bincode::Result<Option<Document>> {
        let idx = docno.as_usize();
        let Some(&start) = self.offsets.get(idx) else {
            return Ok(None);
        };
        let end = self
            .offsets
            .get(idx + 1)
            .copied()
            .unwrap_or(self.data.len() as u64);
        let bytes = self
            .data
            .get(start as usize..end as usize)
            .ok_or_else(|| {
                Box::new(bincode::ErrorKind::Custom("stored offset out of range".into()))
            })?;
        bincode::deserialize(bytes).map(Some)
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn size_bytes(&self) -> usize {
        self.data.len() + self.offsets.len() * 8
    }

    pub fn to_bytes(&self) -> bincode::Result<Vec<u8>> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> bincode::Result<Self> {
        bincode::deserialize(bytes)
    }
}
