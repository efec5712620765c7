use std::io::BufRead;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use shoal::{
    ClusterConfig, IndexSettings, PerformanceProfile, Query, SearchCluster, SearchRequest,
};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "shoal")]
#[command(about = "Segment-based, replicated document search engine", long_about = None)]
struct Args {
    /// Data directory holding every simulated node
    #[arg(long, env = "SHOAL_DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,

    /// Number of simulated nodes shard copies are spread over
    #[arg(long, env = "SHOAL_NODES", default_value = "3")]
    nodes: usize,

    /// Performance profile (low-latency, balanced, high-throughput, durable)
    #[arg(long, env = "SHOAL_PROFILE", default_value = "balanced")]
    profile: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create an index
    CreateIndex {
        name: String,
        #[arg(long, default_value = "1")]
        shards: u32,
        #[arg(long, default_value = "1")]
        replicas: u32,
        /// JSON settings file; overrides --shards and --replicas
        #[arg(long)]
        settings: Option<PathBuf>,
    },
    /// Index newline-delimited JSON documents
    Ingest {
        index: String,
        /// File to read, stdin when absent
        #[arg(long)]
        file: Option<PathBuf>,
        /// Field holding the document key; keys are generated when absent
        #[arg(long)]
        key_field: Option<String>,
    },
    /// Search an index
    Search {
        index: String,
        /// Query as JSON, e.g. '{"match": {"field": "body", "text": "rust"}}'
        query: String,
        #[arg(long, default_value = "0")]
        from: usize,
        #[arg(long, default_value = "10")]
        size: usize,
    },
    /// Fetch one document by key
    Get { index: String, key: String },
    /// Delete one document by key
    Delete { index: String, key: String },
    /// Make indexed documents searchable
    Refresh { index: String },
    /// Merge segments down to at most `max_segments` per shard copy
    ForceMerge {
        index: String,
        #[arg(long, default_value = "1")]
        max_segments: usize,
    },
    /// Index health and per-copy stats
    Health { index: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();
    info!("Starting shoal v{}", shoal::VERSION);

    let profile = PerformanceProfile::parse(&args.profile).unwrap_or_else(|| {
        warn!("Unknown profile '{}', using 'balanced'", args.profile);
        PerformanceProfile::Balanced
    });

    let cluster = SearchCluster::open(ClusterConfig::new(&args.data_dir, args.nodes))
        .await
        .with_context(|| format!("opening cluster in {}", args.data_dir.display()))?;

    let outcome = run(&cluster, args.command, profile).await;
    cluster.close().await?;
    outcome
}

async fn run(cluster: &SearchCluster, command: Command, profile: PerformanceProfile) -> Result<()> {
    match command {
        Command::CreateIndex {
            name,
            shards,
            replicas,
            settings,
        } => {
            let settings = match settings {
                Some(path) => IndexSettings::from_json_file(&path)
                    .with_context(|| format!("reading settings from {}", path.display()))?,
                None => {
                    let mut settings = IndexSettings::default()
                        .with_shards(shards)
                        .with_replicas(replicas);
                    profile.apply_to(&mut settings.shard);
                    settings
                }
            };
            cluster.create_index(&name, settings).await?;
            println!("created index {}", name);
        }
        Command::Ingest {
            index,
            file,
            key_field,
        } => {
            let reader: Box<dyn BufRead> = match file {
                Some(path) => Box::new(std::io::BufReader::new(
                    std::fs::File::open(&path)
                        .with_context(|| format!("opening {}", path.display()))?,
                )),
                None => Box::new(std::io::BufReader::new(std::io::stdin())),
            };
            let (mut indexed, mut rejected) = (0usize, 0usize);
            for (line_no, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let value: serde_json::Value = serde_json::from_str(&line)
                    .with_context(|| format!("line {} is not JSON", line_no + 1))?;
                let key = key_field
                    .as_deref()
                    .and_then(|field| value.get(field))
                    .map(|v| match v {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    });
                match cluster.index_json(&index, key, &value).await {
                    Ok(_) => indexed += 1,
                    Err(e) if e.is_admission_error() => {
                        warn!(line = line_no + 1, error = %e, "document rejected");
                        rejected += 1;
                    }
                    Err(e) => {
                        return Err(e).with_context(|| format!("indexing line {}", line_no + 1))
                    }
                }
            }
            cluster.refresh(&index).await?;
            println!("indexed {} documents, {} rejected", indexed, rejected);
        }
        Command::Search {
            index,
            query,
            from,
            size,
        } => {
            let query: Query = serde_json::from_str(&query).context("parsing query")?;
            let response = cluster
                .search(
                    &index,
                    SearchRequest::new(query).with_from(from).with_size(size),
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Command::Get { index, key } => match cluster.get(&index, &key).await? {
            Some(doc) => println!("{}", serde_json::to_string_pretty(&doc)?),
            None => bail!("document {} not found in {}", key, index),
        },
        Command::Delete { index, key } => {
            let response = cluster.delete(&index, &key).await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Command::Refresh { index } => {
            cluster.refresh(&index).await?;
            println!("refreshed {}", index);
        }
        Command::ForceMerge {
            index,
            max_segments,
        } => {
            let merges = cluster.force_merge(&index, max_segments).await?;
            println!("ran {} merges on primaries of {}", merges, index);
        }
        Command::Health { index } => {
            let status = cluster.health(&index).await?;
            println!("{}: {:?}", index, status);
            for copy in cluster.copy_stats(&index).await? {
                let role = if copy.primary { "primary" } else { "replica" };
                match copy.stats {
                    Some(stats) => println!(
                        "  {} node{} {}{} checkpoint={} segments={} docs={}",
                        copy.shard,
                        copy.node,
                        role,
                        if copy.stale { " (stale)" } else { "" },
                        stats.local_checkpoint,
                        stats.segment_count,
                        stats.searchable_docs
                    ),
                    None => println!("  {} node{} {} unreachable", copy.shard, copy.node, role),
                }
            }
        }
    }
    Ok(())
}
