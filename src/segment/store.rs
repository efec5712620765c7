//! On-disk layout of a shard copy's segments
//!
//! ```text
//! <shard dir>/
//!   segments.manifest
//!   segment_<gen>/postings.bin terms.fst terms.meta columns.bin
//!                 ranges.bin stored.bin docs.bin stats.bin live.bin
//! ```
//!
//! Every immutable file is checksummed in the manifest; `live.bin` carries its
//! own crc because it is rewritten when documents are deleted.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use roaring::RoaringBitmap;
use tracing::{debug, warn};

use super::docno_map::DocNoMap;
use super::docvalues::ColumnStore;
use super::manifest::{ManifestEntry, SegmentManifest};
use super::postings::PostingsReader;
use super::range_index::RangeIndex;
use super::reader::{Segment, SegmentParts};
use super::statistics::SegmentStatistics;
use super::stored::StoredDocuments;
use super::term_dict::TermDictionary;
use super::types::{PostingListMeta, SegmentId, SEGMENT_CODEC_VERSION};
use crate::error::{Result, ShoalError};
use crate::persistence::{sync_dir, write_atomic, write_synced};

pub const MANIFEST_FILE: &str = "segments.manifest";
pub const POSTINGS_FILE: &str = "postings.bin";
pub const TERMS_FST_FILE: &str = "terms.fst";
pub const TERMS_META_FILE: &str = "terms.meta";
pub const COLUMNS_FILE: &str = "columns.bin";
pub const RANGES_FILE: &str = "ranges.bin";
pub const STORED_FILE: &str = "stored.bin";
pub const DOCS_FILE: &str = "docs.bin";
pub const STATS_FILE: &str = "stats.bin";
pub const LIVE_FILE: &str = "live.bin";

const SEGMENT_DIR_PREFIX: &str = "segment_";

/// The encoded immutable files of one segment
#[derive(Clone, Debug, Default)]
pub struct SegmentFiles {
    files: BTreeMap<&'static str, Vec<u8>>,
}

impl SegmentFiles {
    pub fn encode(parts: &SegmentParts) -> Result<Self> {
        let mut files = BTreeMap::new();
        files.insert(POSTINGS_FILE, parts.postings.data().to_vec());
        files.insert(TERMS_FST_FILE, parts.terms.fst_bytes().to_vec());
        files.insert(TERMS_META_FILE, bincode::serialize(parts.terms.metadata())?);
        files.insert(COLUMNS_FILE, parts.columns.serialize()?);
        files.insert(RANGES_FILE, parts.ranges.to_bytes()?);
        files.insert(STORED_FILE, parts.stored.to_bytes()?);
        files.insert(DOCS_FILE, parts.docs.serialize());
        files.insert(STATS_FILE, parts.stats.to_bytes()?);
        Ok(Self { files })
    }

    /// Decode the parts back. Missing files or undecodable bytes are `InvalidData`.
    pub fn decode(mut self) -> io::Result<SegmentParts> {
        let invalid = |e: Box<bincode::ErrorKind>| io::Error::new(io::ErrorKind::InvalidData, e);

        let term_meta: Vec<PostingListMeta> =
            bincode::deserialize(&self.take(TERMS_META_FILE)?).map_err(invalid)?;
        let terms = TermDictionary::new(self.take(TERMS_FST_FILE)?, term_meta)?;
        Ok(SegmentParts {
            terms,
            postings: PostingsReader::new(self.take(POSTINGS_FILE)?),
            columns: ColumnStore::deserialize(&self.take(COLUMNS_FILE)?)?,
            ranges: RangeIndex::from_bytes(&self.take(RANGES_FILE)?).map_err(invalid)?,
            stored: StoredDocuments::from_bytes(&self.take(STORED_FILE)?).map_err(invalid)?,
            docs: DocNoMap::deserialize(&self.take(DOCS_FILE)?)?,
            stats: SegmentStatistics::from_bytes(&self.take(STATS_FILE)?).map_err(invalid)?,
        })
    }

    pub fn checksums(&self) -> BTreeMap<String, u32> {
        self.files
            .iter()
            .map(|(name, bytes)| (name.to_string(), crc32fast::hash(bytes)))
            .collect()
    }

    pub fn size_bytes(&self) -> u64 {
        self.files.values().map(|b| b.len() as u64).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &[u8])> {
        self.files.iter().map(|(name, bytes)| (*name, bytes.as_slice()))
    }

    fn take(&mut self, name: &'static str) -> io::Result<Vec<u8>> {
        self.files.remove(name).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, format!("missing {}", name))
        })
    }
}

/// Persistent storage for segment files and the manifest
pub struct SegmentStore {
    base_dir: PathBuf,
    /// Pending injected write failures
    fail_writes: AtomicU32,
}

impl SegmentStore {
    pub fn new<P: AsRef<Path>>(base_dir: P) -> Result<Self> {
        fs::create_dir_all(&base_dir)?;
        Ok(Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            fail_writes: AtomicU32::new(0),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn segment_dir(&self, id: SegmentId) -> PathBuf {
        self.base_dir.join(id.to_string())
    }

    /// Make the next `count` segment writes fail after their first file
    pub fn inject_write_failures(&self, count: u32) {
        self.fail_writes.store(count, Ordering::SeqCst);
    }

    /// Write and fsync every file of a new segment. On failure the partial
    /// directory is removed.
    pub fn write_segment(&self, id: SegmentId, files: &SegmentFiles) -> Result<()> {
        let dir = self.segment_dir(id);
        let result = self.write_segment_files(&dir, files);
        if result.is_err() {
            if let Err(e) = fs::remove_dir_all(&dir) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(segment = %id, error = %e, "failed to remove partial segment directory");
                }
            }
        }
        result
    }

    fn write_segment_files(&self, dir: &Path, files: &SegmentFiles) -> Result<()> {
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        fs::create_dir_all(dir)?;
        for (name, bytes) in files.iter() {
            write_synced(&dir.join(name), bytes)?;
            if self.take_injected_failure() {
                return Err(ShoalError::Io(io::Error::new(
                    io::ErrorKind::Other,
                    "injected segment write failure",
                )));
            }
        }
        sync_dir(dir)?;
        sync_dir(&self.base_dir)?;
        Ok(())
    }

    fn take_injected_failure(&self) -> bool {
        self.fail_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Load a segment listed in the manifest, verifying every checksum
    pub fn read_segment(&self, entry: &ManifestEntry) -> Result<Segment> {
        let id = entry.meta.id;
        let corrupt = |reason: String| ShoalError::CorruptSegment {
            segment: id.to_string(),
            reason,
        };

        if entry.meta.codec_version != SEGMENT_CODEC_VERSION {
            return Err(corrupt(format!(
                "unsupported codec version {}",
                entry.meta.codec_version
            )));
        }

        let dir = self.segment_dir(id);
        let mut files = SegmentFiles::default();
        for (name, expected) in &entry.checksums {
            let Some(known) = known_file(name) else {
                return Err(corrupt(format!("unexpected file {}", name)));
            };
            let bytes = fs::read(dir.join(name)).map_err(|e| corrupt(format!("{}: {}", name, e)))?;
            let actual = crc32fast::hash(&bytes);
            if actual != *expected {
                return Err(corrupt(format!(
                    "{} checksum mismatch: expected {:08x}, got {:08x}",
                    name, expected, actual
                )));
            }
            files.files.insert(known, bytes);
        }

        let parts = files.decode().map_err(|e| corrupt(e.to_string()))?;
        if parts.docs.len() != entry.meta.doc_count as usize {
            return Err(corrupt(format!(
                "doc count {} does not match manifest {}",
                parts.docs.len(),
                entry.meta.doc_count
            )));
        }
        let live = self.read_live(id)?;
        debug!(segment = %id, docs = entry.meta.doc_count, "loaded segment");
        Ok(Segment::from_parts(entry.meta.clone(), parts, live))
    }

    /// Persist the live bitset of a segment
    pub fn write_live(&self, segment: &Segment) -> Result<()> {
        let live = segment.live_docs();
        let mut payload = Vec::with_capacity(live.serialized_size());
        live.serialize_into(&mut payload)?;
        let mut bytes = Vec::with_capacity(payload.len() + 4);
        bytes.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        bytes.extend_from_slice(&payload);
        write_atomic(&self.segment_dir(segment.id()).join(LIVE_FILE), &bytes)?;
        Ok(())
    }

    /// Read a persisted live bitset; `None` when the segment has no deletes on disk
    pub fn read_live(&self, id: SegmentId) -> Result<Option<RoaringBitmap>> {
        let path = self.segment_dir(id).join(LIVE_FILE);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let corrupt = |reason: &str| ShoalError::CorruptSegment {
            segment: id.to_string(),
            reason: format!("{}: {}", LIVE_FILE, reason),
        };
        if bytes.len() < 4 {
            return Err(corrupt("truncated"));
        }
        let mut crc = [0u8; 4];
        crc.copy_from_slice(&bytes[..4]);
        if crc32fast::hash(&bytes[4..]) != u32::from_le_bytes(crc) {
            return Err(corrupt("checksum mismatch"));
        }
        RoaringBitmap::deserialize_from(&bytes[4..])
            .map(Some)
            .map_err(|e| corrupt(&e.to_string()))
    }

    pub fn remove_segment(&self, id: SegmentId) -> Result<()> {
        match fs::remove_dir_all(self.segment_dir(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Segment generations that have a directory on disk
    pub fn list_segment_dirs(&self) -> Result<Vec<SegmentId>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(gen) = name
                .to_str()
                .and_then(|n| n.strip_prefix(SEGMENT_DIR_PREFIX))
                .and_then(|n| n.parse::<u64>().ok())
            else {
                continue;
            };
            ids.push(SegmentId::new(gen));
        }
        ids.sort();
        Ok(ids)
    }

    /// Delete segment directories the manifest does not list
    pub fn remove_orphans(&self, manifest: &SegmentManifest) -> Result<Vec<SegmentId>> {
        let mut removed = Vec::new();
        for id in self.list_segment_dirs()? {
            if !manifest.contains(id) {
                self.remove_segment(id)?;
                removed.push(id);
            }
        }
        if !removed.is_empty() {
            debug!(count = removed.len(), "removed orphan segment directories");
        }
        Ok(removed)
    }

    pub fn save_manifest(&self, manifest: &SegmentManifest) -> Result<()> {
        write_atomic(&self.base_dir.join(MANIFEST_FILE), &manifest.to_json()?)?;
        Ok(())
    }

    /// Load the manifest; `None` for a fresh directory
    pub fn load_manifest(&self) -> Result<Option<SegmentManifest>> {
        let path = self.base_dir.join(MANIFEST_FILE);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        SegmentManifest::from_json(&bytes)
            .map(Some)
            .map_err(|e| ShoalError::CorruptSegment {
                segment: MANIFEST_FILE.to_string(),
                reason: e.to_string(),
            })
    }
}

fn known_file(name: &str) -> Option<&'static str> {
    [
        POSTINGS_FILE,
        TERMS_FST_FILE,
        TERMS_META_FILE,
        COLUMNS_FILE,
        RANGES_FILE,
        STORED_FILE,
        DOCS_FILE,
        STATS_FILE,
    ]
    .into_iter()
    .find(|known| *known == name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TokenizerConfig;
    use crate::models::Document;
    use crate::schema::{FieldMapping, IndexMapping};
    use crate::segment::types::{DocNo, Term};
    use crate::segment::writer::{SegmentBuilder, SegmentWriteResult};
    use crate::tokenizer::Tokenizer;
    use tempfile::TempDir;

    fn build(id: u64) -> SegmentWriteResult {
        let mapping = IndexMapping::new().field("body", FieldMapping::text());
        let tokenizer = Tokenizer::new(&TokenizerConfig::default()).unwrap();
        let mut builder = SegmentBuilder::new(SegmentId::new(id), &mapping, &tokenizer);
        builder
            .add_document("a", 1, &Document::new().with_text("body", "quick fox"))
            .unwrap();
        builder
            .add_document("b", 2, &Document::new().with_text("body", "lazy dog"))
            .unwrap();
        builder.finish().unwrap()
    }

    fn entry(result: &SegmentWriteResult) -> ManifestEntry {
        ManifestEntry {
            meta: result.segment.meta().clone(),
            checksums: result.files.checksums(),
        }
    }

    #[test]
    fn test_write_and_read_segment() {
        let dir = TempDir::new().unwrap();
        let store = SegmentStore::new(dir.path()).unwrap();
        let result = build(1);
        store.write_segment(SegmentId::new(1), &result.files).unwrap();

        let segment = store.read_segment(&entry(&result)).unwrap();
        assert_eq!(segment.doc_count(), 2);
        assert_eq!(segment.doc_frequency(&Term::new("body", "fox")), 1);
        assert_eq!(segment.live_doc_count(), 2);
    }

    #[test]
    fn test_live_bitset_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = SegmentStore::new(dir.path()).unwrap();
        let result = build(1);
        store.write_segment(SegmentId::new(1), &result.files).unwrap();

        result.segment.delete(DocNo(1));
        store.write_live(&result.segment).unwrap();

        let segment = store.read_segment(&entry(&result)).unwrap();
        assert!(segment.is_live(DocNo(0)));
        assert!(!segment.is_live(DocNo(1)));
    }

    #[test]
    fn test_corrupt_file_is_refused() {
        let dir = TempDir::new().unwrap();
        let store = SegmentStore::new(dir.path()).unwrap();
        let result = build(1);
        store.write_segment(SegmentId::new(1), &result.files).unwrap();

        let path = store.segment_dir(SegmentId::new(1)).join(POSTINGS_FILE);
        let mut bytes = fs::read(&path).unwrap();
        bytes[0] ^= 0xff;
        fs::write(&path, bytes).unwrap();

        match store.read_segment(&entry(&result)) {
            Err(ShoalError::CorruptSegment { segment, reason }) => {
                assert_eq!(segment, "segment_1");
                assert!(reason.contains("checksum"));
            }
            other => panic!("expected corruption, got {:?}", other.map(|s| s.id())),
        }
    }

    #[test]
    fn test_failed_write_removes_partial_directory() {
        let dir = TempDir::new().unwrap();
        let store = SegmentStore::new(dir.path()).unwrap();
        let result = build(1);

        store.inject_write_failures(1);
        assert!(store.write_segment(SegmentId::new(1), &result.files).is_err());
        assert!(!store.segment_dir(SegmentId::new(1)).exists());

        // The next attempt succeeds
        store.write_segment(SegmentId::new(1), &result.files).unwrap();
        assert_eq!(
            fs::read_dir(store.segment_dir(SegmentId::new(1))).unwrap().count(),
            8
        );
    }

    #[test]
    fn test_manifest_and_orphans() {
        let dir = TempDir::new().unwrap();
        let store = SegmentStore::new(dir.path()).unwrap();
        assert!(store.load_manifest().unwrap().is_none());

        let kept = build(1);
        let orphan = build(2);
        store.write_segment(SegmentId::new(1), &kept.files).unwrap();
        store.write_segment(SegmentId::new(2), &orphan.files).unwrap();

        let mut manifest = SegmentManifest::new();
        manifest.add_segment(kept.segment.meta().clone(), kept.files.checksums());
        store.save_manifest(&manifest).unwrap();

        let loaded = store.load_manifest().unwrap().unwrap();
        assert_eq!(loaded, manifest);
        assert_eq!(store.remove_orphans(&loaded).unwrap(), vec![SegmentId::new(2)]);
        assert_eq!(store.list_segment_dirs().unwrap(), vec![SegmentId::new(1)]);
    }
}
