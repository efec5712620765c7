//! Storage invariants checked against a single shard copy: segment
//! immutability, merge equivalence, sequence monotonicity and reader
//! isolation during merges.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::thread;

use shoal::config::{MergePolicyConfig, ShardConfig, TokenizerConfig};
use shoal::models::{Document, SearchRequest, ShardKey};
use shoal::query::Query;
use shoal::schema::{FieldMapping, IndexMapping, MappingRegistry};
use shoal::segment::{DocNo, Segment, Term};
use shoal::{ShardEngine, Tokenizer};
use tempfile::TempDir;

fn open_engine(dir: &Path, primary: bool) -> Arc<ShardEngine> {
    let mapping = IndexMapping::new()
        .field("body", FieldMapping::text())
        .field("tag", FieldMapping::keyword())
        .field("n", FieldMapping::long());
    ShardEngine::open(
        ShardKey::new("inv", 0),
        dir,
        ShardConfig::default()
            .with_refresh_interval(None)
            .with_background_merges(false),
        Arc::new(MappingRegistry::new(mapping)),
        Arc::new(Tokenizer::new(&TokenizerConfig::default()).unwrap()),
        primary,
    )
    .unwrap()
}

fn doc(body: &str, tag: &str, n: i64) -> Document {
    Document::new()
        .with_text("body", body)
        .with_keyword("tag", tag)
        .with_long("n", n)
}

fn matching_keys(engine: &ShardEngine, query: Query) -> BTreeSet<String> {
    let result = engine
        .search_local(&SearchRequest::new(query).with_size(10_000))
        .unwrap();
    engine.release_context(result.context);
    result.top.hits.into_iter().map(|h| h.key).collect()
}

fn read_postings(segment: &Segment, term: &Term) -> Vec<(DocNo, u32, Vec<u32>)> {
    let mut out = Vec::new();
    if let Some(mut postings) = segment.postings(term).unwrap() {
        while let Some((docno, tf)) = postings.next() {
            out.push((docno, tf, postings.positions().to_vec()));
        }
    }
    out
}

#[test]
fn test_published_segments_are_immutable() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(dir.path(), true);
    for batch in 0..3 {
        for i in 0..20 {
            let key = format!("b{}-{}", batch, i);
            engine
                .index(key, doc("the cat sat on the cat mat", "t", i))
                .unwrap();
        }
        engine.refresh().unwrap();
    }

    let snapshot = engine.snapshot();
    let term = Term::new("body", "cat");
    let before: Vec<_> = snapshot
        .views
        .iter()
        .map(|v| read_postings(&v.segment, &term))
        .collect();
    let files_before: Vec<Vec<u8>> = snapshot
        .views
        .iter()
        .map(|v| {
            let path = dir.path().join(v.segment.id().to_string()).join("postings.bin");
            std::fs::read(path).unwrap()
        })
        .collect();

    let merger = {
        let engine = engine.clone();
        thread::spawn(move || {
            engine.delete("b0-3").unwrap();
            engine.force_merge(1).unwrap()
        })
    };
    for _ in 0..50 {
        let again: Vec<_> = snapshot
            .views
            .iter()
            .map(|v| read_postings(&v.segment, &term))
            .collect();
        assert_eq!(again, before);
    }
    assert!(merger.join().unwrap() >= 1);

    // Merged away but still pinned: contents and files unchanged
    for (view, (postings, bytes)) in snapshot.views.iter().zip(before.iter().zip(&files_before)) {
        assert_eq!(&read_postings(&view.segment, &term), postings);
        let path = dir.path().join(view.segment.id().to_string()).join("postings.bin");
        assert_eq!(&std::fs::read(path).unwrap(), bytes);
    }
}

#[test]
fn test_merge_preserves_matching_documents() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(dir.path(), true);
    let bodies = [
        "rust search engine",
        "segment merge policy",
        "rust segment",
        "quick brown fox",
        "engine of search",
    ];
    for batch in 0..4 {
        for (i, body) in bodies.iter().enumerate() {
            let n = (batch * 10 + i) as i64;
            let tag = if i % 2 == 0 { "even" } else { "odd" };
            engine.index(format!("d{}", n), doc(body, tag, n)).unwrap();
        }
        engine.refresh().unwrap();
    }
    for key in ["d1", "d12", "d33"] {
        engine.delete(key).unwrap();
    }
    engine.index("d20".into(), doc("replaced body", "odd", 20)).unwrap();
    engine.refresh().unwrap();

    let queries = vec![
        Query::MatchAll,
        Query::match_text("body", "rust"),
        Query::match_all_terms("body", "search engine"),
        Query::phrase("body", "search engine"),
        Query::prefix("body", "seg"),
        Query::term("tag", "odd"),
        Query::range("n", Some(5.0), Some(25.0)),
        Query::bool()
            .with_must(Query::match_text("body", "segment"))
            .with_must_not(Query::term("tag", "even")),
    ];
    let before: Vec<_> = queries
        .iter()
        .map(|q| matching_keys(&engine, q.clone()))
        .collect();
    assert!(engine.stats().segment_count > 1);

    engine.force_merge(1).unwrap();
    assert_eq!(engine.stats().segment_count, 1);
    for (query, expected) in queries.iter().zip(&before) {
        assert_eq!(&matching_keys(&engine, query.clone()), expected, "query {:?}", query);
    }
    assert!(!before[0].contains("d1"));
    assert!(before[0].contains("d20"));
}

#[test]
fn test_sequence_numbers_contiguous_after_recovery() {
    let dir = TempDir::new().unwrap();
    {
        let engine = open_engine(dir.path(), true);
        for i in 0..30 {
            engine.index(format!("k{}", i % 12), doc("x", "t", i)).unwrap();
            if i % 7 == 0 {
                engine.delete(&format!("k{}", (i + 3) % 12)).unwrap();
                engine.delete("never-indexed").unwrap();
            }
            if i % 10 == 9 {
                engine.refresh().unwrap();
            }
        }
    }

    let engine = open_engine(dir.path(), true);
    let checkpoint = engine.local_checkpoint();
    let ops = engine.operations_since(0).unwrap();
    let seqs: Vec<u64> = ops.iter().map(|op| op.seq_no).collect();
    assert_eq!(seqs, (1..=checkpoint).collect::<Vec<_>>());

    // A replica fed the same operations ends with the same log
    let replica_dir = TempDir::new().unwrap();
    let replica = open_engine(replica_dir.path(), false);
    for op in ops {
        replica.apply_replicated(op).unwrap();
    }
    drop(replica);
    let replica = open_engine(replica_dir.path(), false);
    assert_eq!(replica.local_checkpoint(), checkpoint);
    let replica_seqs: Vec<u64> = replica
        .operations_since(0)
        .unwrap()
        .iter()
        .map(|op| op.seq_no)
        .collect();
    assert_eq!(replica_seqs, seqs);
}

/// A query racing a merge of the only two segments holding matches still
/// finds both, and the inputs outlive the merge while the query holds them.
#[test]
fn test_query_during_merge_keeps_both_matches() {
    let dir = TempDir::new().unwrap();
    let mapping_dir = dir.path().join("shard");
    let engine = open_engine(&mapping_dir, true);
    engine.index("1".into(), doc("cat sat", "t", 1)).unwrap();
    engine.refresh().unwrap();
    engine.index("2".into(), doc("cat ran", "t", 2)).unwrap();
    engine.refresh().unwrap();
    let inputs: Vec<_> = engine
        .snapshot()
        .views
        .iter()
        .map(|v| mapping_dir.join(v.segment.id().to_string()))
        .collect();
    assert_eq!(inputs.len(), 2);

    let request = SearchRequest::new(Query::match_text("body", "cat"));
    let pinned = engine.search_local(&request).unwrap();
    assert_eq!(pinned.top.hits.len(), 2);

    let merger = {
        let engine = engine.clone();
        thread::spawn(move || engine.force_merge(1).unwrap())
    };
    while !merger.is_finished() {
        let during = engine.search_local(&request).unwrap();
        engine.release_context(during.context);
        assert_eq!(during.top.hits.len(), 2);
    }
    assert_eq!(merger.join().unwrap(), 1);

    // Inputs stay on disk while the pinned context can still fetch from them
    assert!(inputs.iter().all(|dir| dir.exists()));
    let addresses: Vec<_> = pinned.top.hits.iter().map(|h| h.address).collect();
    let docs = engine.fetch(pinned.context, &addresses).unwrap();
    assert!(docs.iter().all(|d| d.is_some()));

    let after = engine.search_local(&request).unwrap();
    engine.release_context(after.context);
    assert_eq!(after.top.hits.len(), 2);

    engine.release_context(pinned.context);
    assert!(inputs.iter().all(|dir| !dir.exists()));
}

#[test]
fn test_background_merges_bound_segment_count() {
    let dir = TempDir::new().unwrap();
    let mapping = IndexMapping::new().field("body", FieldMapping::text());
    let mut config = ShardConfig::default()
        .with_refresh_interval(None)
        .with_background_merges(false);
    config.merge = MergePolicyConfig::default();
    let engine = ShardEngine::open(
        ShardKey::new("inv", 0),
        dir.path(),
        config,
        Arc::new(MappingRegistry::new(mapping)),
        Arc::new(Tokenizer::new(&TokenizerConfig::default()).unwrap()),
        true,
    )
    .unwrap();
    for i in 0..40 {
        engine
            .index(format!("k{}", i), Document::new().with_text("body", "merge me"))
            .unwrap();
        engine.refresh().unwrap();
    }
    let before = engine.stats().segment_count;
    engine.maybe_merge().unwrap();
    let after = engine.stats().segment_count;
    assert!(after < before, "{} segments before, {} after", before, after);
    assert_eq!(engine.stats().searchable_docs, 40);
}
