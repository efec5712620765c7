//! Shard engine
//!
//! One copy of one shard: operation log, mutable buffer, immutable segments
//! and the published reader snapshot.
//!
//! # Write path
//!
//! Every mutation runs under the writer lock: assign (or check) the sequence
//! number, append to the operation log, apply to the buffer and to the
//! working live bitsets of flushed segments. `get` reads that working state,
//! so it sees a write as soon as it returns.
//!
//! # Visibility
//!
//! Searches read a [`ShardSnapshot`] swapped in by `refresh` and by merge
//! publish. A refresh flushes the buffer into a new segment, persists dirty
//! live bitsets, writes the manifest last and then publishes. A merge never
//! changes what searches see, only how it is laid out.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::snapshot::{ContextId, SearchContexts, ShardQueryResult, ShardSnapshot};
use super::worker::ShardWorker;
use crate::config::{Durability, ShardConfig};
use crate::error::{Result, ShoalError};
use crate::models::{
    AppliedWrite, DocKey, Document, Operation, OperationKind, SearchRequest, SeqNo, ShardKey,
    WriteOutcome,
};
use crate::persistence::{AppendFailure, OperationLog};
use crate::query::{Bm25Scorer, DocAddress, QueryExecutor, QueryPlanner};
use crate::schema::MappingRegistry;
use crate::segment::{
    merge_segments, DocNo, MergeCandidate, MergeInput, MergeScheduler, MutableBuffer, Segment,
    SegmentBuilder, SegmentFiles, SegmentId, SegmentManifest, SegmentStore, SegmentView,
    TieredMergePolicy,
};
use crate::tokenizer::Tokenizer;

/// File name of the operation log inside a shard directory
pub const OPERATION_LOG_FILE: &str = "translog.log";

/// Idle time after which a search context is dropped
pub const CONTEXT_KEEP_ALIVE: Duration = Duration::from_secs(300);

/// Base delay between flush attempts, multiplied by the attempt number
const FLUSH_BACKOFF: Duration = Duration::from_millis(10);

/// Merges that may run at once on one shard copy
const MAX_CONCURRENT_MERGES: usize = 2;

/// Lifecycle of a shard copy
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardState {
    Initializing,
    Active,
    Closing,
    Closed,
}

impl fmt::Display for ShardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ShardState::Initializing => "Initializing",
            ShardState::Active => "Active",
            ShardState::Closing => "Closing",
            ShardState::Closed => "Closed",
        };
        f.write_str(name)
    }
}

/// Point-in-time counters of a shard copy
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ShardStats {
    pub state: ShardState,
    pub primary: bool,
    /// False when a listed segment failed verification on recovery
    pub intact: bool,
    pub local_checkpoint: SeqNo,
    pub committed_seq: SeqNo,
    pub refresh_seq: SeqNo,
    pub buffered_docs: usize,
    pub segment_count: usize,
    /// Live documents visible to searches
    pub searchable_docs: u64,
    pub open_contexts: usize,
    pub retired_segments: usize,
}

/// State guarded by the writer lock
struct WriterState {
    buffer: MutableBuffer,
    manifest: SegmentManifest,
    /// Working segment list in generation order; same segments as the published snapshot
    segments: Vec<Arc<Segment>>,
    /// Operations read from the log on open, consumed by `recover`
    pending_replay: Vec<Operation>,
}

pub struct ShardEngine {
    key: ShardKey,
    dir: PathBuf,
    config: ShardConfig,
    mapping: Arc<MappingRegistry>,
    tokenizer: Arc<Tokenizer>,
    store: SegmentStore,
    log: OperationLog,
    state: RwLock<ShardState>,
    primary: AtomicBool,
    intact: AtomicBool,
    /// Highest sequence number applied locally; contiguous from the start
    checkpoint: AtomicU64,
    /// Set by every applied operation, cleared by refresh
    unrefreshed: AtomicBool,
    writer: Mutex<WriterState>,
    snapshot: ArcSwap<ShardSnapshot>,
    contexts: SearchContexts,
    merge_policy: TieredMergePolicy,
    merges: Mutex<MergeScheduler>,
    /// Segments merged away, deleted from disk once nothing references them
    retired: Mutex<Vec<Arc<Segment>>>,
    worker: Mutex<Option<ShardWorker>>,
}

impl ShardEngine {
    /// Open the shard copy stored in `dir`, recover it and start its worker
    pub fn open(
        key: ShardKey,
        dir: impl AsRef<Path>,
        config: ShardConfig,
        mapping: Arc<MappingRegistry>,
        tokenizer: Arc<Tokenizer>,
        primary: bool,
    ) -> Result<Arc<Self>> {
        let dir = dir.as_ref().to_path_buf();
        let store = SegmentStore::new(&dir)?;
        let (log, ops) = OperationLog::open(dir.join(OPERATION_LOG_FILE), config.durability)?;

        let engine = Arc::new(Self {
            merge_policy: TieredMergePolicy::new(config.merge.clone()),
            key,
            dir,
            mapping,
            tokenizer,
            store,
            log,
            state: RwLock::new(ShardState::Initializing),
            primary: AtomicBool::new(primary),
            intact: AtomicBool::new(true),
            checkpoint: AtomicU64::new(0),
            unrefreshed: AtomicBool::new(false),
            writer: Mutex::new(WriterState {
                buffer: MutableBuffer::new(),
                manifest: SegmentManifest::new(),
                segments: Vec::new(),
                pending_replay: ops,
            }),
            snapshot: ArcSwap::from_pointee(ShardSnapshot::default()),
            contexts: SearchContexts::new(CONTEXT_KEEP_ALIVE),
            merges: Mutex::new(MergeScheduler::new(MAX_CONCURRENT_MERGES)),
            retired: Mutex::new(Vec::new()),
            worker: Mutex::new(None),
            config,
        });

        engine.recover()?;

        let worker = ShardWorker::spawn(
            Arc::downgrade(&engine),
            format!("shard-{}", engine.key),
            engine.config.refresh_interval(),
        )?;
        *engine.worker.lock() = Some(worker);
        Ok(engine)
    }

    pub fn key(&self) -> &ShardKey {
        &self.key
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn state(&self) -> ShardState {
        *self.state.read()
    }

    pub fn is_primary(&self) -> bool {
        self.primary.load(Ordering::Acquire)
    }

    pub fn is_intact(&self) -> bool {
        self.intact.load(Ordering::Acquire)
    }

    /// Highest sequence number applied on this copy
    pub fn local_checkpoint(&self) -> SeqNo {
        self.checkpoint.load(Ordering::Acquire)
    }

    /// Highest sequence number reflected in persisted segments
    pub fn committed_seq(&self) -> SeqNo {
        self.writer.lock().manifest.committed_seq
    }

    pub fn has_unrefreshed_changes(&self) -> bool {
        self.unrefreshed.load(Ordering::Acquire)
    }

    /// Currently published reader snapshot
    pub fn snapshot(&self) -> Arc<ShardSnapshot> {
        self.snapshot.load_full()
    }

    pub fn stats(&self) -> ShardStats {
        let snapshot = self.snapshot.load();
        let (buffered_docs, committed_seq) = {
            let w = self.writer.lock();
            (w.buffer.len(), w.manifest.committed_seq)
        };
        ShardStats {
            state: self.state(),
            primary: self.is_primary(),
            intact: self.is_intact(),
            local_checkpoint: self.local_checkpoint(),
            committed_seq,
            refresh_seq: snapshot.refresh_seq,
            buffered_docs,
            segment_count: snapshot.segment_count(),
            searchable_docs: snapshot.live_doc_count(),
            open_contexts: self.contexts.len(),
            retired_segments: self.retired.lock().len(),
        }
    }

    fn ensure_active(&self) -> Result<()> {
        let state = self.state();
        if state != ShardState::Active {
            return Err(ShoalError::IllegalState {
                state: state.to_string(),
            });
        }
        Ok(())
    }

    /// A copy that refused a corrupt segment is missing documents; it must
    /// not answer reads or take writes as if they never existed
    fn ensure_intact(&self) -> Result<()> {
        if !self.is_intact() {
            return Err(ShoalError::ShardUnavailable {
                shard: self.key.shard,
                reason: format!("copy of {} refused a corrupt segment", self.key),
            });
        }
        Ok(())
    }

    fn ensure_primary(&self) -> Result<()> {
        if !self.is_primary() {
            return Err(ShoalError::NotPrimary(self.key.shard));
        }
        Ok(())
    }

    // --- Recovery ---

    /// Load the manifest and its segments, replay the log above the
    /// committed sequence number, publish, and go `Active`.
    pub fn recover(&self) -> Result<()> {
        let state = self.state();
        if state != ShardState::Initializing {
            return Err(ShoalError::IllegalState {
                state: state.to_string(),
            });
        }

        let mut w = self.writer.lock();
        let manifest = self.store.load_manifest()?.unwrap_or_default();
        let mut segments = Vec::with_capacity(manifest.segment_count());
        for entry in manifest.iter() {
            match self.store.read_segment(entry) {
                Ok(segment) => segments.push(Arc::new(segment)),
                Err(e @ ShoalError::CorruptSegment { .. }) => {
                    error!(
                        shard = %self.key,
                        segment = %entry.meta.id,
                        error = %e,
                        "refusing corrupt segment"
                    );
                    self.intact.store(false, Ordering::Release);
                }
                Err(e) => return Err(e),
            }
        }
        self.store.remove_orphans(&manifest)?;

        let committed = manifest.committed_seq;
        w.manifest = manifest;
        w.segments = segments;

        let ops = std::mem::take(&mut w.pending_replay);
        let mut checkpoint = committed;
        let mut replayed = 0usize;
        for op in ops.into_iter().filter(|op| op.seq_no > committed) {
            if op.seq_no != checkpoint + 1 {
                return Err(ShoalError::SequenceGap {
                    expected: checkpoint + 1,
                    actual: op.seq_no,
                });
            }
            checkpoint = op.seq_no;
            self.apply_locked(&mut w, op);
            replayed += 1;
        }
        self.log.advance_to(checkpoint);
        self.checkpoint.store(checkpoint, Ordering::Release);

        if w.buffer.is_empty() {
            self.publish_locked(&w, committed);
        } else {
            self.flush_locked(&mut w)?;
        }
        *self.state.write() = ShardState::Active;

        info!(
            shard = %self.key,
            segments = w.segments.len(),
            committed_seq = committed,
            replayed,
            local_checkpoint = checkpoint,
            intact = self.is_intact(),
            "shard recovered"
        );
        Ok(())
    }

    // --- Writes ---

    /// Index `doc` under `key` on the primary, assigning the next sequence number
    pub fn index(&self, key: DocKey, doc: Document) -> Result<AppliedWrite> {
        self.ensure_active()?;
        self.ensure_intact()?;
        self.ensure_primary()?;
        if key.is_empty() {
            return Err(ShoalError::MalformedDocument(
                "document key must not be empty".to_string(),
            ));
        }
        let admitted = self.mapping.admit(&doc)?;

        let mut w = self.writer.lock();
        let seq_no = self.local_checkpoint() + 1;
        let op = Operation::index(seq_no, key, admitted.document);
        self.log.append(&op)?;
        let existed = self.apply_locked(&mut w, op.clone());
        self.checkpoint.store(seq_no, Ordering::Release);
        self.maybe_flush_locked(&mut w);

        Ok(AppliedWrite {
            operation: Some(op),
            outcome: if existed {
                WriteOutcome::Updated
            } else {
                WriteOutcome::Created
            },
        })
    }

    /// Delete `key` on the primary. A key with no live document is not logged.
    pub fn delete(&self, key: &str) -> Result<AppliedWrite> {
        self.ensure_active()?;
        self.ensure_intact()?;
        self.ensure_primary()?;

        let mut w = self.writer.lock();
        if !Self::contains_locked(&w, key) {
            return Ok(AppliedWrite {
                operation: None,
                outcome: WriteOutcome::NotFound,
            });
        }
        let seq_no = self.local_checkpoint() + 1;
        let op = Operation::delete(seq_no, key);
        self.log.append(&op)?;
        self.apply_locked(&mut w, op.clone());
        self.checkpoint.store(seq_no, Ordering::Release);

        Ok(AppliedWrite {
            operation: Some(op),
            outcome: WriteOutcome::Deleted,
        })
    }

    /// Apply an operation sequenced by the primary. Returns the local checkpoint.
    ///
    /// Operations at or below the checkpoint were already applied and are
    /// ignored; anything but the next sequence number is a gap.
    pub fn apply_replicated(&self, op: Operation) -> Result<SeqNo> {
        self.ensure_active()?;
        self.ensure_intact()?;

        let mut w = self.writer.lock();
        let checkpoint = self.local_checkpoint();
        if op.seq_no <= checkpoint {
            return Ok(checkpoint);
        }
        if op.seq_no != checkpoint + 1 {
            return Err(ShoalError::SequenceGap {
                expected: checkpoint + 1,
                actual: op.seq_no,
            });
        }
        let seq_no = op.seq_no;
        self.log.append(&op)?;
        self.apply_locked(&mut w, op);
        self.checkpoint.store(seq_no, Ordering::Release);
        self.maybe_flush_locked(&mut w);
        Ok(seq_no)
    }

    /// Logged operations above `after`, for a replica catching up
    pub fn operations_since(&self, after: SeqNo) -> Result<Vec<Operation>> {
        self.ensure_active()?;
        self.log.read_after(after)
    }

    /// Drop log entries through `upto`, never past the committed sequence number
    pub fn trim_log(&self, upto: SeqNo) -> Result<usize> {
        self.ensure_active()?;
        let limit = upto.min(self.committed_seq());
        let removed = self.log.trim_through(limit)?;
        if removed > 0 {
            debug!(shard = %self.key, upto = limit, removed, "trimmed operation log");
        }
        Ok(removed)
    }

    /// Start assigning sequence numbers, continuing from the local checkpoint
    pub fn promote_to_primary(&self) -> Result<()> {
        self.ensure_active()?;
        // Serialize with in-flight replicated writes
        let _w = self.writer.lock();
        if !self.primary.swap(true, Ordering::AcqRel) {
            info!(shard = %self.key, seq_no = self.local_checkpoint(), "promoted to primary");
        }
        Ok(())
    }

    /// Stop accepting primary writes; used when another copy took over
    pub fn demote_to_replica(&self) {
        let _w = self.writer.lock();
        if self.primary.swap(false, Ordering::AcqRel) {
            info!(shard = %self.key, "demoted to replica");
        }
    }

    fn contains_locked(w: &WriterState, key: &str) -> bool {
        w.buffer.contains(key) || w.segments.iter().any(|s| s.live_docno(key).is_some())
    }

    /// Apply a sequenced operation to the buffer and working live bitsets.
    /// Returns whether a live document with the key existed.
    fn apply_locked(&self, w: &mut WriterState, op: Operation) -> bool {
        let mut existed = w.buffer.remove(&op.key).is_some();
        for segment in w.segments.iter().rev() {
            if let Some(docno) = segment.live_docno(&op.key) {
                existed |= segment.delete(docno);
            }
        }
        if let OperationKind::Index(doc) = op.kind {
            w.buffer.insert(op.key, op.seq_no, Arc::new(doc));
        }
        self.unrefreshed.store(true, Ordering::Release);
        existed
    }

    fn maybe_flush_locked(&self, w: &mut WriterState) {
        if !w.buffer.should_flush(&self.config.buffer) {
            return;
        }
        if let Err(e) = self.flush_locked(w) {
            warn!(
                shard = %self.key,
                error = %e,
                buffered = w.buffer.len(),
                "automatic flush failed, buffer retained"
            );
            // The worker retries off the write path
            if let Some(worker) = self.worker.lock().as_ref() {
                worker.request_refresh();
            }
        }
    }

    // --- Reads ---

    /// Latest version of `key`: the buffer first, then segments newest first
    pub fn get(&self, key: &str) -> Result<Option<Document>> {
        self.ensure_active()?;
        self.ensure_intact()?;
        let w = self.writer.lock();
        if let Some(buffered) = w.buffer.get(key) {
            return Ok(Some(Document::clone(&buffered.document)));
        }
        for segment in w.segments.iter().rev() {
            if let Some(docno) = segment.live_docno(key) {
                return segment.stored_document(docno);
            }
        }
        Ok(None)
    }

    // --- Refresh ---

    /// Make every applied operation visible to new searches
    pub fn refresh(&self) -> Result<()> {
        self.ensure_active()?;
        let flushed = {
            let mut w = self.writer.lock();
            let before = w.segments.len();
            self.flush_locked(&mut w)?;
            w.segments.len() > before
        };
        if flushed && self.config.background_merges {
            if let Some(worker) = self.worker.lock().as_ref() {
                worker.request_merge();
            }
        }
        Ok(())
    }

    /// Make the next `count` segment writes fail; for failure testing
    pub fn inject_flush_failures(&self, count: u32) {
        self.store.inject_write_failures(count);
    }

    /// Make the next operation log append fail; for failure testing
    pub fn inject_log_failure(&self, failure: AppendFailure) {
        self.log.inject_append_failure(failure);
    }

    /// Flush the buffer into a new segment, persist live bitsets and the
    /// manifest, then publish. The buffer is cleared only on success.
    fn flush_locked(&self, w: &mut WriterState) -> Result<()> {
        let checkpoint = self.local_checkpoint();
        if self.config.durability == Durability::Async {
            self.log.sync()?;
        }

        let mut manifest = w.manifest.clone();
        let mut flushed = None;
        if !w.buffer.is_empty() {
            let id = manifest.allocate_segment_id();
            let mapping = self.mapping.snapshot();
            let mut builder = SegmentBuilder::new(id, &mapping, &self.tokenizer);
            for entry in w.buffer.iter() {
                builder.add_document(&entry.key, entry.seq_no, &entry.document)?;
            }
            let result = builder.finish()?;
            self.write_segment_with_retry(id, &result.files)?;
            manifest.add_segment(result.segment.meta().clone(), result.files.checksums());
            flushed = Some(Arc::new(result.segment));
        }

        for segment in &w.segments {
            if segment.take_live_dirty() {
                if let Err(e) = self.store.write_live(segment) {
                    segment.mark_live_dirty();
                    return Err(e);
                }
            }
        }

        manifest.advance_committed(checkpoint);
        if manifest != w.manifest {
            self.store.save_manifest(&manifest)?;
            w.manifest = manifest;
        }

        if let Some(segment) = flushed {
            debug!(
                shard = %self.key,
                segment = %segment.id(),
                docs = segment.doc_count(),
                committed_seq = checkpoint,
                "flushed buffer"
            );
            w.segments.push(segment);
        }
        w.buffer.clear();
        self.unrefreshed.store(false, Ordering::Release);
        self.publish_locked(w, checkpoint);
        Ok(())
    }

    fn write_segment_with_retry(&self, id: SegmentId, files: &SegmentFiles) -> Result<()> {
        let attempts = self.config.flush_retries.max(1);
        let mut attempt = 1;
        loop {
            match self.store.write_segment(id, files) {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts => {
                    warn!(
                        shard = %self.key,
                        segment = %id,
                        attempt,
                        error = %e,
                        "segment write failed, retrying"
                    );
                    thread::sleep(FLUSH_BACKOFF * attempt);
                    attempt += 1;
                }
                Err(e) => {
                    error!(shard = %self.key, segment = %id, attempts, error = %e, "flush failed");
                    return Err(e);
                }
            }
        }
    }

    /// Publish the working segment list with freshly captured live bitsets
    fn publish_locked(&self, w: &WriterState, refresh_seq: SeqNo) {
        let generation = self.snapshot.load().generation + 1;
        let views = w
            .segments
            .iter()
            .map(|s| SegmentView::new(s.clone()))
            .collect();
        self.snapshot
            .store(Arc::new(ShardSnapshot::new(generation, refresh_seq, views)));
    }

    // --- Merges ---

    /// Run the merges the policy asks for. Returns how many were published.
    pub fn maybe_merge(&self) -> Result<usize> {
        self.ensure_active()?;
        let mut merged = 0;
        loop {
            let candidate = {
                let w = self.writer.lock();
                let candidates = self
                    .merge_policy
                    .find_merges(&w.segments)
                    .into_iter()
                    .filter(|c| self.merge_makes_progress(c))
                    .collect();
                self.merges.lock().next_merge(candidates)
            };
            let Some(candidate) = candidate else {
                break;
            };
            self.run_merge(candidate)?;
            merged += 1;
        }
        Ok(merged)
    }

    /// Merge until at most `max_segments` segments remain
    pub fn force_merge(&self, max_segments: usize) -> Result<usize> {
        self.ensure_active()?;
        let mut merged = 0;
        loop {
            let candidate = {
                let w = self.writer.lock();
                match self.merge_policy.find_forced_merge(&w.segments, max_segments) {
                    Some(candidate) if self.merge_makes_progress(&candidate) => {
                        self.merges.lock().next_merge(vec![candidate])
                    }
                    _ => break,
                }
            };
            match candidate {
                Some(candidate) => {
                    self.run_merge(candidate)?;
                    merged += 1;
                }
                // A background merge holds some of the segments
                None => thread::sleep(FLUSH_BACKOFF),
            }
        }
        info!(shard = %self.key, merged, max_segments, "force merge done");
        Ok(merged)
    }

    /// Several segments always shrink the count. A lone segment only gains from
    /// a rewrite when searches already see deletes in it; unrefreshed deletes
    /// would be carried over unchanged.
    fn merge_makes_progress(&self, candidate: &MergeCandidate) -> bool {
        match candidate.segment_ids.as_slice() {
            [id] => self
                .snapshot
                .load()
                .view(*id)
                .map_or(false, |v| v.live_count() < u64::from(v.segment.doc_count())),
            _ => true,
        }
    }

    fn run_merge(&self, candidate: MergeCandidate) -> Result<()> {
        let result = self.merge_and_publish(&candidate);
        self.merges.lock().complete_merge(&candidate.segment_ids);
        self.sweep_retired();
        result
    }

    fn merge_and_publish(&self, candidate: &MergeCandidate) -> Result<()> {
        // Inputs come from the published snapshot so the merge keeps exactly
        // what searches currently see
        let (id, inputs) = {
            let mut w = self.writer.lock();
            let snapshot = self.snapshot.load();
            let inputs: Vec<MergeInput> = candidate
                .segment_ids
                .iter()
                .filter_map(|id| snapshot.view(*id).cloned())
                .collect();
            if inputs.len() != candidate.segment_ids.len() {
                return Err(ShoalError::Internal(format!(
                    "merge input missing from snapshot: {:?}",
                    candidate.segment_ids
                )));
            }
            (w.manifest.allocate_segment_id(), inputs)
        };

        let output = merge_segments(id, &inputs)?;
        let empty = output.result.segment.doc_count() == 0;
        if !empty {
            self.store.write_segment(id, &output.result.files)?;
        }

        let mut w = self.writer.lock();
        let carried = output.carry_over_deletes(&inputs);
        let current = self.snapshot.load_full();

        let mut manifest = w.manifest.clone();
        for input in &inputs {
            manifest.remove_segment(input.segment.id());
        }
        let merged = if empty {
            None
        } else {
            let segment = output.result.segment;
            if segment.take_live_dirty() {
                self.store.write_live(&segment)?;
            }
            manifest.add_segment(segment.meta().clone(), output.result.files.checksums());
            Some(Arc::new(segment))
        };
        self.store.save_manifest(&manifest)?;
        w.manifest = manifest;

        let is_input = |id: SegmentId| inputs.iter().any(|i| i.segment.id() == id);
        w.segments.retain(|s| !is_input(s.id()));
        let mut views: Vec<SegmentView> = current
            .views
            .iter()
            .filter(|v| !is_input(v.segment.id()))
            .cloned()
            .collect();
        if let Some(segment) = &merged {
            w.segments.push(segment.clone());
            w.segments.sort_by_key(|s| s.id());
            views.push(SegmentView {
                segment: segment.clone(),
                live: Arc::new(published_live(&current, &inputs, &output.remap)),
            });
            views.sort_by_key(|v| v.segment.id());
        } else if let Err(e) = self.store.remove_segment(id) {
            warn!(
                shard = %self.key,
                segment = %id,
                error = %e,
                "failed to remove empty merge output"
            );
        }
        self.snapshot.store(Arc::new(ShardSnapshot::new(
            current.generation + 1,
            current.refresh_seq,
            views,
        )));
        drop(w);

        self.retired
            .lock()
            .extend(inputs.iter().map(|i| i.segment.clone()));
        info!(
            shard = %self.key,
            inputs = ?candidate.segment_ids,
            segment = %id,
            reason = ?candidate.reason,
            docs = merged.as_ref().map_or(0, |s| s.doc_count()),
            carried_deletes = carried,
            "merged segments"
        );
        Ok(())
    }

    /// Delete retired segments no snapshot or merge holds anymore
    fn sweep_retired(&self) -> usize {
        let mut retired = self.retired.lock();
        let before = retired.len();
        retired.retain(|segment| {
            if Arc::strong_count(segment) > 1 {
                return true;
            }
            match self.store.remove_segment(segment.id()) {
                Ok(()) => false,
                Err(e) => {
                    warn!(
                        shard = %self.key,
                        segment = %segment.id(),
                        error = %e,
                        "failed to delete retired segment"
                    );
                    true
                }
            }
        });
        before - retired.len()
    }

    /// Periodic upkeep: expire idle contexts and delete unreferenced segments
    pub fn housekeeping(&self) {
        let expired = self.contexts.expire();
        let removed = self.sweep_retired();
        if expired > 0 || removed > 0 {
            debug!(shard = %self.key, expired, removed, "housekeeping");
        }
    }

    // --- Search ---

    /// Phase 1: run `request` on the published snapshot and pin it under a context
    pub fn search_local(&self, request: &SearchRequest) -> Result<ShardQueryResult> {
        self.ensure_active()?;
        self.ensure_intact()?;
        let mapping = self.mapping.snapshot();
        let plan = QueryPlanner::new(&mapping, &self.tokenizer).plan(&request.query)?;
        let snapshot = self.snapshot.load_full();
        let stats = snapshot.statistics(Bm25Scorer::new(self.config.bm25));
        let top = QueryExecutor::execute(&plan, &snapshot.views, &stats, request)?;
        let context = self.contexts.open(snapshot);
        Ok(ShardQueryResult { context, top })
    }

    /// Phase 2: stored documents at `addresses` in the context's snapshot
    pub fn fetch(
        &self,
        context: ContextId,
        addresses: &[DocAddress],
    ) -> Result<Vec<Option<Document>>> {
        self.ensure_active()?;
        self.ensure_intact()?;
        let snapshot = self
            .contexts
            .get(context)
            .ok_or(ShoalError::ContextMissing(context))?;
        addresses.iter().map(|addr| snapshot.fetch(addr)).collect()
    }

    /// Drop a search context. Returns false if it was unknown or expired.
    pub fn release_context(&self, context: ContextId) -> bool {
        let released = self.contexts.release(context);
        if released {
            self.sweep_retired();
        }
        released
    }

    // --- Shutdown ---

    /// Flush, stop the worker and move to `Closed`
    pub fn close(&self) -> Result<()> {
        {
            let mut state = self.state.write();
            match *state {
                ShardState::Closed | ShardState::Closing => return Ok(()),
                _ => *state = ShardState::Closing,
            }
        }
        // Release the slot before joining; the worker locks it to queue tasks
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker.shutdown();
        }
        let flushed = {
            let mut w = self.writer.lock();
            self.flush_locked(&mut w)
        };
        self.contexts.clear();
        self.sweep_retired();
        self.log.sync()?;
        *self.state.write() = ShardState::Closed;
        info!(shard = %self.key, checkpoint = self.local_checkpoint(), "shard closed");
        flushed
    }
}

impl Drop for ShardEngine {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            worker.shutdown();
        }
    }
}

impl fmt::Debug for ShardEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardEngine")
            .field("key", &self.key)
            .field("state", &self.state())
            .field("primary", &self.is_primary())
            .field("checkpoint", &self.local_checkpoint())
            .finish()
    }
}

/// Live bitset of a merged segment as of the snapshot being replaced: the
/// remap of each input's published bitset
fn published_live(
    snapshot: &ShardSnapshot,
    inputs: &[MergeInput],
    remap: &[Vec<Option<DocNo>>],
) -> RoaringBitmap {
    let mut live = RoaringBitmap::new();
    for (input, remap) in inputs.iter().zip(remap) {
        let captured = snapshot
            .view(input.segment.id())
            .map_or_else(|| input.live.clone(), |v| v.live.clone());
        for old in captured.iter() {
            if let Some(Some(new)) = remap.get(old as usize) {
                live.insert(new.0);
            }
        }
    }
    live
}
