use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tempfile::TempDir;

use shoal::config::{ShardConfig, TokenizerConfig};
use shoal::models::{Document, SearchRequest, ShardKey, SortSpec};
use shoal::query::Query;
use shoal::schema::{FieldMapping, IndexMapping, MappingRegistry};
use shoal::{ShardEngine, Tokenizer};

const WORDS: [&str; 8] = [
    "rust", "programming", "language", "search", "engine", "segment", "merge", "query",
];

struct BenchEnv {
    _tmp: TempDir,
    engine: Arc<ShardEngine>,
}

fn make_body(i: usize) -> String {
    (0..6)
        .map(|j| WORDS[(i * 7 + j * 3) % WORDS.len()])
        .collect::<Vec<_>>()
        .join(" ")
}

/// One shard copy with `doc_count` documents spread over several segments
fn build_env(doc_count: usize) -> BenchEnv {
    let tmp = TempDir::new().unwrap();
    let mapping = IndexMapping::new()
        .field("body", FieldMapping::text())
        .field("rank", FieldMapping::long());
    let engine = ShardEngine::open(
        ShardKey::new("bench", 0),
        tmp.path(),
        ShardConfig::default()
            .with_refresh_interval(None)
            .with_background_merges(false)
            .with_buffer_max_docs(doc_count / 4 + 1),
        Arc::new(MappingRegistry::new(mapping)),
        Arc::new(Tokenizer::new(&TokenizerConfig::default()).unwrap()),
        true,
    )
    .unwrap();

    for i in 0..doc_count {
        let doc = Document::new()
            .with_text("body", make_body(i))
            .with_long("rank", i as i64);
        engine.index(format!("doc-{}", i), doc).unwrap();
    }
    engine.refresh().unwrap();

    BenchEnv { _tmp: tmp, engine }
}

fn run(env: &BenchEnv, request: &SearchRequest) {
    let result = env.engine.search_local(request).unwrap();
    env.engine.release_context(result.context);
    black_box(result);
}

fn bench_local_search(c: &mut Criterion) {
    let counts = [1_000usize, 5_000, 10_000];
    let envs: Vec<(usize, BenchEnv)> = counts.iter().map(|&n| (n, build_env(n))).collect();

    let requests = [
        ("match", SearchRequest::new(Query::match_text("body", "rust programming"))),
        ("phrase", SearchRequest::new(Query::phrase("body", "search engine"))),
        (
            "range_sorted",
            SearchRequest::new(Query::range("rank", Some(100.0), Some(900.0)))
                .with_sort(SortSpec::desc("rank")),
        ),
    ];

    for (name, request) in requests.iter() {
        let mut group = c.benchmark_group(format!("local_search/{}", name));
        for (count, env) in envs.iter() {
            group.bench_with_input(BenchmarkId::from_parameter(count), env, |b, env| {
                b.iter(|| run(env, request));
            });
        }
        group.finish();
    }
}

fn bench_force_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("force_merge");
    group.sample_size(10);
    for count in [1_000usize, 5_000] {
        group.bench_function(BenchmarkId::from_parameter(count), |b| {
            b.iter_with_setup(
                || build_env(count),
                |env| {
                    black_box(env.engine.force_merge(1).unwrap());
                },
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_local_search, bench_force_merge);
criterion_main!(benches);
