pub mod cluster;
pub mod config;
pub mod error;
pub mod models;
pub mod persistence;
pub mod query;
pub mod replication;
pub mod schema;
pub mod segment;
pub mod shard;
pub mod tokenizer;

pub use cluster::SearchCluster;
pub use config::{
    AckQuorum, ClusterConfig, IndexSettings, PerformanceProfile, ShardConfig, TokenizerConfig,
};
pub use error::{Result, ShoalError};
pub use models::*;
pub use query::Query;
pub use shard::ShardEngine;
pub use tokenizer::Tokenizer;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
