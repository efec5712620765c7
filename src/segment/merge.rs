//! Tiered merge policy for segment management
//!
//! Segments are grouped into size tiers (`floor_segment_bytes` times powers of
//! `segments_per_tier`). A tier holding more than `segments_per_tier` segments
//! merges its smallest members; a segment whose soft-delete ratio passes
//! `delete_ratio_threshold` is rewritten to expunge its deleted documents.

use std::cmp::Ordering;
use std::sync::Arc;

use super::reader::Segment;
use super::types::SegmentId;
use crate::config::MergePolicyConfig;

const MAX_TIERS: usize = 10;

/// A candidate merge operation
#[derive(Clone, Debug)]
pub struct MergeCandidate {
    /// Segment IDs to merge, in generation order
    pub segment_ids: Vec<SegmentId>,
    /// Total size after merge (estimate)
    pub estimated_size: u64,
    /// Merge score (higher = more urgent)
    pub score: f64,
    pub reason: MergeReason,
}

/// Reason why segments should be merged
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeReason {
    /// Too many segments in a tier
    TierOverflow,
    /// High delete ratio
    HighDeleteRatio,
    /// Requested through force merge
    Forced,
}

impl MergeCandidate {
    fn new(mut segments: Vec<&Arc<Segment>>, score: f64, reason: MergeReason) -> Self {
        segments.sort_by_key(|s| s.id());
        Self {
            segment_ids: segments.iter().map(|s| s.id()).collect(),
            estimated_size: segments.iter().map(|s| live_size(s)).sum(),
            score,
            reason,
        }
    }
}

/// Tiered merge policy implementation
#[derive(Clone, Debug, Default)]
pub struct TieredMergePolicy {
    config: MergePolicyConfig,
}

impl TieredMergePolicy {
    pub fn new(config: MergePolicyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MergePolicyConfig {
        &self.config
    }

    /// Find merge candidates among `segments`, most urgent first
    pub fn find_merges(&self, segments: &[Arc<Segment>]) -> Vec<MergeCandidate> {
        let mut candidates = Vec::new();
        if let Some(candidate) = self.find_high_delete_merge(segments) {
            candidates.push(candidate);
        }
        for candidate in self.find_tiered_merges(segments) {
            let overlaps = candidates.iter().any(|c: &MergeCandidate| {
                c.segment_ids.iter().any(|id| candidate.segment_ids.contains(id))
            });
            if !overlaps {
                candidates.push(candidate);
            }
        }
        candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        candidates
    }

    /// Merge until at most `max_segments` remain, smallest segments first.
    /// A single segment with deletes is rewritten when `max_segments` is 1.
    pub fn find_forced_merge(
        &self,
        segments: &[Arc<Segment>],
        max_segments: usize,
    ) -> Option<MergeCandidate> {
        let max_segments = max_segments.max(1);
        if segments.len() <= max_segments {
            let single_with_deletes =
                max_segments == 1 && segments.len() == 1 && segments[0].delete_ratio() > 0.0;
            if !single_with_deletes {
                return None;
            }
            return Some(MergeCandidate::new(
                segments.iter().collect(),
                f64::MAX,
                MergeReason::Forced,
            ));
        }
        let mut by_size: Vec<&Arc<Segment>> = segments.iter().collect();
        by_size.sort_by_key(|s| live_size(s));
        let take = segments.len() - max_segments + 1;
        Some(MergeCandidate::new(
            by_size.into_iter().take(take).collect(),
            f64::MAX,
            MergeReason::Forced,
        ))
    }

    /// Segments whose deleted share passes the threshold, merged together
    fn find_high_delete_merge(&self, segments: &[Arc<Segment>]) -> Option<MergeCandidate> {
        let mut high_delete: Vec<&Arc<Segment>> = segments
            .iter()
            .filter(|s| s.delete_ratio() > self.config.delete_ratio_threshold)
            .collect();
        if high_delete.is_empty() {
            return None;
        }
        high_delete.sort_by(|a, b| {
            b.delete_ratio()
                .partial_cmp(&a.delete_ratio())
                .unwrap_or(Ordering::Equal)
        });
        high_delete.truncate(self.config.max_merge_count.max(1));

        let avg_delete_ratio = high_delete.iter().map(|s| s.delete_ratio()).sum::<f64>()
            / high_delete.len() as f64;
        Some(MergeCandidate::new(
            high_delete,
            avg_delete_ratio * 100.0,
            MergeReason::HighDeleteRatio,
        ))
    }

    fn find_tiered_merges(&self, segments: &[Arc<Segment>]) -> Vec<MergeCandidate> {
        let mut candidates = Vec::new();
        if segments.len() < self.config.min_merge_count {
            return candidates;
        }

        for (tier_idx, tier) in self.group_by_tier(segments).into_iter().enumerate() {
            if tier.len() <= self.config.segments_per_tier {
                continue;
            }
            let merge_count = (tier.len() - self.config.segments_per_tier + 1)
                .min(self.config.max_merge_count)
                .max(self.config.min_merge_count);

            let mut sorted = tier;
            sorted.sort_by_key(|s| live_size(s));

            let mut to_merge = Vec::new();
            let mut total = 0u64;
            for segment in sorted {
                if to_merge.len() == merge_count {
                    break;
                }
                let size = live_size(segment);
                if total + size > self.config.max_merged_segment_bytes && !to_merge.is_empty() {
                    break;
                }
                total += size;
                to_merge.push(segment);
            }

            if to_merge.len() >= self.config.min_merge_count {
                // Lower tiers are cheaper and more urgent
                let score = (MAX_TIERS as f64 - tier_idx as f64).max(1.0) * to_merge.len() as f64;
                candidates.push(MergeCandidate::new(to_merge, score, MergeReason::TierOverflow));
            }
        }
        candidates
    }

    fn group_by_tier<'a>(&self, segments: &'a [Arc<Segment>]) -> Vec<Vec<&'a Arc<Segment>>> {
        let floor = self.config.floor_segment_bytes.max(1);
        let ratio = (self.config.segments_per_tier as u64).max(2);

        let mut tiers: Vec<Vec<&Arc<Segment>>> = vec![Vec::new(); MAX_TIERS];
        for segment in segments {
            let size = live_size(segment).max(floor);
            let tier = size_to_tier(size, floor, ratio).min(MAX_TIERS - 1);
            tiers[tier].push(segment);
        }
        while tiers.last().map_or(false, |t| t.is_empty()) {
            tiers.pop();
        }
        tiers
    }
}

/// Size of a segment's live documents, pro-rated from its byte size
fn live_size(segment: &Segment) -> u64 {
    (segment.size_bytes() as f64 * (1.0 - segment.delete_ratio())) as u64
}

fn size_to_tier(size: u64, floor: u64, ratio: u64) -> usize {
    let mut tier_max = floor;
    let mut tier = 0;
    while size > tier_max && tier < MAX_TIERS {
        tier += 1;
        tier_max = tier_max.saturating_mul(ratio);
    }
    tier
}

/// Tracks running merges so no segment takes part in two at once
#[derive(Debug, Default)]
pub struct MergeScheduler {
    running: Vec<Vec<SegmentId>>,
    max_concurrent: usize,
}

impl MergeScheduler {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            running: Vec::new(),
            max_concurrent: max_concurrent.max(1),
        }
    }

    pub fn is_merging(&self, id: SegmentId) -> bool {
        self.running.iter().any(|r| r.contains(&id))
    }

    /// Register the first candidate that overlaps no running merge
    pub fn next_merge(&mut self, candidates: Vec<MergeCandidate>) -> Option<MergeCandidate> {
        if self.running.len() >= self.max_concurrent {
            return None;
        }
        let candidate = candidates
            .into_iter()
            .find(|c| !c.segment_ids.iter().any(|id| self.is_merging(*id)))?;
        self.running.push(candidate.segment_ids.clone());
        Some(candidate)
    }

    /// Mark a merge as complete (or abandoned)
    pub fn complete_merge(&mut self, segment_ids: &[SegmentId]) {
        self.running.retain(|running| running != segment_ids);
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TokenizerConfig;
    use crate::models::Document;
    use crate::schema::{FieldMapping, IndexMapping};
    use crate::segment::types::DocNo;
    use crate::segment::writer::SegmentBuilder;
    use crate::tokenizer::Tokenizer;

    fn segment(id: u64, docs: usize) -> Arc<Segment> {
        let mapping = IndexMapping::new().field("body", FieldMapping::text());
        let tokenizer = Tokenizer::new(&TokenizerConfig::default()).unwrap();
        let mut builder = SegmentBuilder::new(SegmentId::new(id), &mapping, &tokenizer);
        for i in 0..docs {
            builder
                .add_document(
                    &format!("{}-{}", id, i),
                    (id * 1000) + i as u64 + 1,
                    &Document::new().with_text("body", format!("doc {} of segment {}", i, id)),
                )
                .unwrap();
        }
        Arc::new(builder.finish().unwrap().segment)
    }

    fn small_tier_policy() -> TieredMergePolicy {
        TieredMergePolicy::new(MergePolicyConfig {
            segments_per_tier: 3,
            min_merge_count: 2,
            max_merge_count: 10,
            delete_ratio_threshold: 0.3,
            floor_segment_bytes: 1024 * 1024,
            ..Default::default()
        })
    }

    #[test]
    fn test_tier_overflow() {
        let policy = small_tier_policy();
        let segments: Vec<_> = (1..=3).map(|i| segment(i, 2)).collect();
        assert!(policy.find_merges(&segments).is_empty());

        let segments: Vec<_> = (1..=5).map(|i| segment(i, 2)).collect();
        let merges = policy.find_merges(&segments);
        assert_eq!(merges.len(), 1);
        assert_eq!(merges[0].reason, MergeReason::TierOverflow);
        assert_eq!(merges[0].segment_ids.len(), 3);
        let mut sorted = merges[0].segment_ids.clone();
        sorted.sort();
        assert_eq!(sorted, merges[0].segment_ids);
    }

    #[test]
    fn test_high_delete_ratio() {
        let policy = small_tier_policy();
        let seg = segment(1, 4);
        seg.delete(DocNo(0));
        seg.delete(DocNo(1));

        let merges = policy.find_merges(&[seg, segment(2, 4)]);
        assert_eq!(merges.len(), 1);
        assert_eq!(merges[0].reason, MergeReason::HighDeleteRatio);
        assert_eq!(merges[0].segment_ids, vec![SegmentId::new(1)]);
    }

    #[test]
    fn test_forced_merge() {
        let policy = small_tier_policy();
        let segments: Vec<_> = (1..=4).map(|i| segment(i, 1)).collect();

        let all = policy.find_forced_merge(&segments, 1).unwrap();
        assert_eq!(all.segment_ids.len(), 4);
        assert_eq!(all.reason, MergeReason::Forced);

        let some = policy.find_forced_merge(&segments, 3).unwrap();
        assert_eq!(some.segment_ids.len(), 2);
        assert!(policy.find_forced_merge(&segments, 4).is_none());

        let single = segment(9, 2);
        assert!(policy.find_forced_merge(&[single.clone()], 1).is_none());
        single.delete(DocNo(0));
        assert!(policy.find_forced_merge(&[single], 1).is_some());
    }

    #[test]
    fn test_scheduler_prevents_overlap() {
        let mut scheduler = MergeScheduler::new(2);
        let a = MergeCandidate {
            segment_ids: vec![SegmentId::new(1), SegmentId::new(2)],
            estimated_size: 0,
            score: 1.0,
            reason: MergeReason::TierOverflow,
        };
        let b = MergeCandidate {
            segment_ids: vec![SegmentId::new(2), SegmentId::new(3)],
            ..a.clone()
        };

        assert!(scheduler.next_merge(vec![a.clone()]).is_some());
        assert!(scheduler.is_merging(SegmentId::new(2)));
        assert!(scheduler.next_merge(vec![b.clone()]).is_none());

        scheduler.complete_merge(&a.segment_ids);
        assert_eq!(scheduler.running_count(), 0);
        assert!(scheduler.next_merge(vec![b]).is_some());
    }
}
