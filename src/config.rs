use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, ShoalError};
use crate::query::Bm25Params;
use crate::schema::IndexMapping;

/// Tokenizer configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TokenizerConfig {
    pub lowercase: bool,
    pub remove_stopwords: bool,
    pub stem: bool,
    pub min_token_length: usize,
    pub max_token_length: usize,
    pub language: String,
    /// Regex describing the separator class; Unicode word boundaries when unset
    #[serde(default)]
    pub separators: Option<String>,
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self {
            lowercase: true,
            remove_stopwords: false,
            stem: false,
            min_token_length: 1,
            max_token_length: 64,
            language: "english".to_string(),
            separators: None,
        }
    }
}

impl TokenizerConfig {
    pub fn with_stemming(mut self, stem: bool) -> Self {
        self.stem = stem;
        self
    }

    pub fn with_stopwords(mut self, remove: bool) -> Self {
        self.remove_stopwords = remove;
        self
    }

    pub fn with_separators(mut self, pattern: impl Into<String>) -> Self {
        self.separators = Some(pattern.into());
        self
    }
}

/// When the operation log is fsynced
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Durability {
    /// fsync before acknowledging every operation
    #[default]
    Request,
    /// Hand writes to the OS and fsync on refresh
    Async,
}

/// Thresholds that trigger an automatic flush of the in-memory buffer
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BufferConfig {
    pub max_docs: usize,
    pub max_bytes: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_docs: 10_000,
            max_bytes: 64 * 1024 * 1024,
        }
    }
}

/// Configuration for the tiered merge policy
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MergePolicyConfig {
    /// Maximum size for a merged segment
    pub max_merged_segment_bytes: u64,
    /// Target number of segments per size tier
    pub segments_per_tier: usize,
    /// Minimum number of segments to merge at once
    pub min_merge_count: usize,
    /// Maximum number of segments to merge at once
    pub max_merge_count: usize,
    /// Soft-delete ratio above which a segment is merged away
    pub delete_ratio_threshold: f64,
    /// Segments below this size are treated as this size
    pub floor_segment_bytes: u64,
}

impl Default for MergePolicyConfig {
    fn default() -> Self {
        Self {
            max_merged_segment_bytes: 5 * 1024 * 1024 * 1024,
            segments_per_tier: 10,
            min_merge_count: 2,
            max_merge_count: 10,
            delete_ratio_threshold: 0.3,
            floor_segment_bytes: 1024 * 1024,
        }
    }
}

/// Per shard-copy engine configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShardConfig {
    pub buffer: BufferConfig,
    pub merge: MergePolicyConfig,
    pub bm25: Bm25Params,
    pub durability: Durability,
    /// Background refresh period; `None` means refresh only on demand
    pub refresh_interval_ms: Option<u64>,
    /// Attempts per flush before the error is surfaced
    pub flush_retries: u32,
    /// Whether the background worker merges after refreshes
    pub background_merges: bool,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            buffer: BufferConfig::default(),
            merge: MergePolicyConfig::default(),
            bm25: Bm25Params::default(),
            durability: Durability::Request,
            refresh_interval_ms: Some(1000),
            flush_retries: 3,
            background_merges: true,
        }
    }
}

impl ShardConfig {
    pub fn with_refresh_interval(mut self, interval: Option<Duration>) -> Self {
        self.refresh_interval_ms = interval.map(|d| d.as_millis() as u64);
        self
    }

    pub fn with_background_merges(mut self, enabled: bool) -> Self {
        self.background_merges = enabled;
        self
    }

    pub fn with_buffer_max_docs(mut self, max_docs: usize) -> Self {
        self.buffer.max_docs = max_docs;
        self
    }

    pub fn refresh_interval(&self) -> Option<Duration> {
        self.refresh_interval_ms.map(Duration::from_millis)
    }
}

/// How many shard copies (primary included) must acknowledge a write
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckQuorum {
    /// Every copy currently in the acknowledgment set
    #[default]
    All,
    /// More than half of all configured copies
    Majority,
    /// An explicit copy count
    Count(usize),
}

impl AckQuorum {
    /// Required acknowledgments given the configured copy count and the ack set size
    pub fn required(&self, total_copies: usize, ack_set: usize) -> usize {
        match self {
            AckQuorum::All => ack_set.max(1),
            AckQuorum::Majority => total_copies / 2 + 1,
            AckQuorum::Count(n) => (*n).max(1),
        }
    }
}

/// Write replication settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplicationConfig {
    pub quorum: AckQuorum,
    pub ack_timeout_ms: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            quorum: AckQuorum::All,
            ack_timeout_ms: 5_000,
        }
    }
}

impl ReplicationConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

/// Index settings configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexSettings {
    pub number_of_shards: u32,
    pub number_of_replicas: u32,
    pub replication: ReplicationConfig,
    /// Default per-shard search deadline
    pub search_timeout_ms: u64,
    pub tokenizer: TokenizerConfig,
    pub shard: ShardConfig,
    #[serde(default)]
    pub mapping: IndexMapping,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            number_of_shards: 1,
            number_of_replicas: 1,
            replication: ReplicationConfig::default(),
            search_timeout_ms: 10_000,
            tokenizer: TokenizerConfig::default(),
            shard: ShardConfig::default(),
            mapping: IndexMapping::default(),
        }
    }
}

impl IndexSettings {
    pub fn with_shards(mut self, shards: u32) -> Self {
        self.number_of_shards = shards;
        self
    }

    pub fn with_replicas(mut self, replicas: u32) -> Self {
        self.number_of_replicas = replicas;
        self
    }

    pub fn with_quorum(mut self, quorum: AckQuorum) -> Self {
        self.replication.quorum = quorum;
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.replication.ack_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_search_timeout(mut self, timeout: Duration) -> Self {
        self.search_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_mapping(mut self, mapping: IndexMapping) -> Self {
        self.mapping = mapping;
        self
    }

    pub fn with_shard_config(mut self, shard: ShardConfig) -> Self {
        self.shard = shard;
        self
    }

    pub fn with_tokenizer(mut self, tokenizer: TokenizerConfig) -> Self {
        self.tokenizer = tokenizer;
        self
    }

    pub fn search_timeout(&self) -> Duration {
        Duration::from_millis(self.search_timeout_ms)
    }

    /// Total copies of every shard
    pub fn copies_per_shard(&self) -> usize {
        1 + self.number_of_replicas as usize
    }

    pub fn validate(&self) -> Result<()> {
        if self.number_of_shards == 0 {
            return Err(ShoalError::InvalidConfig(
                "number_of_shards must be at least 1".to_string(),
            ));
        }
        if self.shard.flush_retries == 0 {
            return Err(ShoalError::InvalidConfig(
                "flush_retries must be at least 1".to_string(),
            ));
        }
        if let AckQuorum::Count(n) = self.replication.quorum {
            if n > self.copies_per_shard() {
                return Err(ShoalError::InvalidConfig(format!(
                    "quorum of {} exceeds {} copies per shard",
                    n,
                    self.copies_per_shard()
                )));
            }
        }
        Ok(())
    }

    /// Load settings from a JSON file
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let settings: IndexSettings = serde_json::from_slice(&bytes)?;
        settings.validate()?;
        Ok(settings)
    }
}

/// In-process cluster configuration
#[derive(Clone, Debug)]
pub struct ClusterConfig {
    pub data_dir: PathBuf,
    /// Number of simulated nodes shard copies are spread over
    pub node_count: usize,
    pub worker_threads: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            node_count: 3,
            worker_threads: num_cpus::get(),
        }
    }
}

impl ClusterConfig {
    pub fn new(data_dir: impl Into<PathBuf>, node_count: usize) -> Self {
        Self {
            data_dir: data_dir.into(),
            node_count,
            ..Default::default()
        }
    }

    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    /// Data directory of one node
    pub fn node_dir(&self, node: u64) -> PathBuf {
        self.data_dir.join(format!("node{}", node))
    }
}

/// Configuration profiles for different workloads
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PerformanceProfile {
    LowLatency,
    Balanced,
    HighThroughput,
    Durable,
}

impl PerformanceProfile {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "low-latency" | "low_latency" => Some(PerformanceProfile::LowLatency),
            "balanced" => Some(PerformanceProfile::Balanced),
            "high-throughput" | "high_throughput" => Some(PerformanceProfile::HighThroughput),
            "durable" => Some(PerformanceProfile::Durable),
            _ => None,
        }
    }

    /// Background refresh period for this profile
    pub fn refresh_interval_ms(&self) -> Option<u64> {
        match self {
            PerformanceProfile::LowLatency => Some(200),
            PerformanceProfile::Balanced => Some(1_000),
            PerformanceProfile::HighThroughput => Some(30_000),
            PerformanceProfile::Durable => Some(1_000),
        }
    }

    /// Buffered documents before a forced flush
    pub fn buffer_max_docs(&self) -> usize {
        match self {
            PerformanceProfile::LowLatency => 1_000,
            PerformanceProfile::Balanced => 10_000,
            PerformanceProfile::HighThroughput => 100_000,
            PerformanceProfile::Durable => 10_000,
        }
    }

    pub fn durability(&self) -> Durability {
        match self {
            PerformanceProfile::HighThroughput => Durability::Async,
            _ => Durability::Request,
        }
    }

    /// Apply this profile to a shard configuration
    pub fn apply_to(&self, config: &mut ShardConfig) {
        config.refresh_interval_ms = self.refresh_interval_ms();
        config.buffer.max_docs = self.buffer_max_docs();
        config.durability = self.durability();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_configs() {
        let settings = IndexSettings::default();
        assert_eq!(settings.number_of_shards, 1);
        assert_eq!(settings.replication.quorum, AckQuorum::All);
        assert_eq!(settings.copies_per_shard(), 2);

        let tokenizer = TokenizerConfig::default();
        assert!(tokenizer.lowercase);
        assert!(!tokenizer.stem);

        let shard = ShardConfig::default();
        assert_eq!(shard.refresh_interval(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_quorum_required() {
        // 3 copies, all in the ack set
        assert_eq!(AckQuorum::All.required(3, 3), 3);
        // one replica went stale
        assert_eq!(AckQuorum::All.required(3, 2), 2);
        assert_eq!(AckQuorum::Majority.required(3, 2), 2);
        assert_eq!(AckQuorum::Majority.required(5, 5), 3);
        assert_eq!(AckQuorum::Count(2).required(3, 3), 2);
    }

    #[test]
    fn test_validate_rejects_oversized_quorum() {
        let settings = IndexSettings::default()
            .with_replicas(1)
            .with_quorum(AckQuorum::Count(3));
        assert!(settings.validate().is_err());

        let settings = IndexSettings::default().with_shards(0);
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_performance_profiles() {
        let mut config = ShardConfig::default();
        PerformanceProfile::HighThroughput.apply_to(&mut config);
        assert_eq!(config.durability, Durability::Async);
        assert_eq!(config.buffer.max_docs, 100_000);

        assert_eq!(
            PerformanceProfile::parse("low-latency"),
            Some(PerformanceProfile::LowLatency)
        );
        assert_eq!(PerformanceProfile::parse("bogus"), None);
    }

    #[test]
    fn test_settings_json_roundtrip() {
        let settings = IndexSettings::default()
            .with_shards(3)
            .with_quorum(AckQuorum::Majority);
        let json = serde_json::to_string(&settings).unwrap();
        let restored: IndexSettings = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.number_of_shards, 3);
        assert_eq!(restored.replication.quorum, AckQuorum::Majority);
    }

    #[test]
    fn test_cluster_config_node_dir() {
        let config = ClusterConfig::new("./data", 3);
        assert_eq!(config.node_dir(1), PathBuf::from("./data/node1"));
    }
}
