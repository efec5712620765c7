//! End-to-end tests of the cluster API: replication quorums, stale replicas,
//! failover, durability across restarts and health reporting.

use std::path::Path;
use std::time::Duration;

use shoal::cluster::RoutingTable;
use shoal::config::{AckQuorum, ClusterConfig, IndexSettings, ShardConfig};
use shoal::models::{Document, HealthStatus, ShardKey, WriteOutcome};
use shoal::query::Query;
use shoal::replication::Fault;
use shoal::schema::{FieldMapping, IndexMapping};
use shoal::{SearchCluster, SearchRequest, ShoalError};
use tempfile::TempDir;

fn settings(shards: u32, replicas: u32) -> IndexSettings {
    IndexSettings::default()
        .with_shards(shards)
        .with_replicas(replicas)
        .with_ack_timeout(Duration::from_millis(300))
        .with_shard_config(
            ShardConfig::default()
                .with_refresh_interval(None)
                .with_background_merges(false),
        )
        .with_mapping(
            IndexMapping::new()
                .field("title", FieldMapping::text())
                .field("year", FieldMapping::long()),
        )
}

fn doc(title: &str, year: i64) -> Document {
    Document::new().with_text("title", title).with_long("year", year)
}

async fn open(dir: &Path, nodes: usize) -> SearchCluster {
    SearchCluster::open(ClusterConfig::new(dir, nodes))
        .await
        .unwrap()
}

fn shard0() -> ShardKey {
    ShardKey::new("books", 0)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_quorum_all_reaches_every_copy() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let cluster = open(dir.path(), 3).await;
    cluster.create_index("books", settings(1, 2)).await?;

    for i in 0..5 {
        let response = cluster
            .index("books", Some(format!("k{}", i)), doc("dune", 1965))
            .await?;
        assert_eq!(response.seq_no, Some(i + 1));
    }
    for node in 1..=3 {
        let engine = cluster.transport().engine(node, &shard0()).unwrap();
        assert_eq!(engine.local_checkpoint(), 5);
        assert!(engine.get("k4")?.is_some());
    }
    assert_eq!(cluster.health("books").await?, HealthStatus::Green);
    cluster.close().await?;
    Ok(())
}

/// Replication factor 3 with quorum 3: a replica that stops answering fails
/// the write; quorum 2 with the same replica down succeeds.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_replica_down_quorum_three_then_two() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let cluster = open(dir.path(), 3).await;
    cluster
        .create_index("books", settings(1, 2).with_quorum(AckQuorum::Count(3)))
        .await?;

    cluster.inject_fault(3, Fault::Hang);
    let err = cluster
        .index("books", Some("a".into()), doc("dune", 1965))
        .await
        .unwrap_err();
    assert!(
        matches!(err, ShoalError::ReplicationTimeout { seq_no: 1, acked: 2, required: 3 }),
        "unexpected error: {}",
        err
    );
    assert!(cluster.routing().shard(&shard0())?.is_stale(3));

    cluster.set_quorum("books", AckQuorum::Count(2))?;
    let ok = cluster
        .index("books", Some("b".into()), doc("emma", 1815))
        .await?;
    assert_eq!(ok.seq_no, Some(2));
    assert_eq!(cluster.health("books").await?, HealthStatus::Yellow);

    // The stale replica rejoins by replaying the primary's log
    cluster.heal_node(3);
    assert_eq!(cluster.recover_replica("books", 0, 3).await?, 2);
    let replica = cluster.transport().engine(3, &shard0()).unwrap();
    assert!(replica.get("a")?.is_some());
    assert!(replica.get("b")?.is_some());
    assert_eq!(cluster.health("books").await?, HealthStatus::Green);
    cluster.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_quorum_majority_tolerates_one_replica() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let cluster = open(dir.path(), 3).await;
    cluster
        .create_index("books", settings(1, 2).with_quorum(AckQuorum::Majority))
        .await?;

    cluster.isolate_node(2);
    let response = cluster
        .index("books", Some("a".into()), doc("dune", 1965))
        .await?;
    assert_eq!(response.seq_no, Some(1));

    // Two of three copies remain once node 2 is stale; a second loss breaks majority
    tokio::time::sleep(Duration::from_millis(50)).await;
    cluster.isolate_node(3);
    let err = cluster
        .index("books", Some("b".into()), doc("emma", 1815))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ShoalError::ReplicationTimeout { .. } | ShoalError::InsufficientCopies { .. }
    ));

    cluster.heal_node(2);
    cluster.heal_node(3);
    assert!(cluster.recover_stale_replicas("books").await? >= 1);
    cluster.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_acknowledged_writes_survive_primary_loss() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let cluster = open(dir.path(), 3).await;
    cluster.create_index("books", settings(1, 2)).await?;

    let mut acked = Vec::new();
    for i in 0..20 {
        let key = format!("k{}", i);
        cluster
            .index("books", Some(key.clone()), doc(&format!("title {}", i), i))
            .await?;
        acked.push(key);
    }
    cluster
        .index("books", Some("k3".into()), doc("rewritten", 99))
        .await?;

    cluster.isolate_node(1);
    let promoted = cluster.failover("books", 0).await?;
    assert_ne!(promoted, 1);

    for key in &acked {
        let found = cluster.get("books", key).await?;
        assert!(found.is_some(), "{} lost after failover", key);
    }
    let k3 = cluster.get("books", "k3").await?.unwrap();
    assert_eq!(k3.first("title").and_then(|v| v.as_str()), Some("rewritten"));

    // Every surviving copy has every acknowledged write
    for node in [2, 3] {
        let engine = cluster.transport().engine(node, &shard0()).unwrap();
        for key in &acked {
            assert!(engine.get(key)?.is_some());
        }
    }

    // The new primary keeps sequencing where the old one stopped
    let next = cluster
        .index("books", Some("after".into()), doc("after failover", 1))
        .await?;
    assert_eq!(next.seq_no, Some(22));
    cluster.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_restart_replays_unflushed_writes() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    {
        let cluster = open(dir.path(), 2).await;
        cluster.create_index("books", settings(2, 1)).await?;
        for i in 0..10 {
            cluster
                .index("books", Some(format!("k{}", i)), doc("persisted", i))
                .await?;
        }
        cluster.refresh("books").await?;
        for i in 10..15 {
            cluster
                .index("books", Some(format!("k{}", i)), doc("only in the log", i))
                .await?;
        }
        cluster.delete("books", "k0").await?;
        // Dropped without close: nothing past the log is flushed
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let cluster = open(dir.path(), 2).await;
    assert_eq!(cluster.index_names(), vec!["books".to_string()]);
    for i in 1..15 {
        assert!(cluster.get("books", &format!("k{}", i)).await?.is_some());
    }
    assert!(cluster.get("books", "k0").await?.is_none());

    let response = cluster
        .search("books", SearchRequest::new(Query::match_text("title", "log")))
        .await?;
    assert_eq!(response.hits.len(), 5);
    assert_eq!(cluster.health("books").await?, HealthStatus::Green);
    cluster.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_delete_missing_key_is_idempotent() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let cluster = open(dir.path(), 2).await;
    cluster.create_index("books", settings(1, 1)).await?;

    for _ in 0..2 {
        let response = cluster.delete("books", "ghost").await?;
        assert_eq!(response.result, WriteOutcome::NotFound);
        assert_eq!(response.seq_no, None);
    }
    let engine = cluster.transport().engine(1, &shard0()).unwrap();
    assert_eq!(engine.local_checkpoint(), 0);

    cluster
        .index("books", Some("real".into()), doc("x", 1))
        .await?;
    assert_eq!(cluster.delete("books", "real").await?.result, WriteOutcome::Deleted);
    for _ in 0..2 {
        assert_eq!(cluster.delete("books", "real").await?.result, WriteOutcome::NotFound);
    }
    assert_eq!(engine.local_checkpoint(), 2);
    cluster.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_admission_errors_never_logged() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let cluster = open(dir.path(), 2).await;
    cluster.create_index("books", settings(1, 1)).await?;

    let bad = Document::new().with_text("year", "not a number");
    assert!(matches!(
        cluster.index("books", Some("bad".into()), bad).await,
        Err(ShoalError::MappingConflict { .. })
    ));
    assert!(matches!(
        cluster.index("books", Some(String::new()), doc("x", 1)).await,
        Err(ShoalError::MalformedDocument(_))
    ));
    let engine = cluster.transport().engine(1, &shard0()).unwrap();
    assert_eq!(engine.local_checkpoint(), 0);
    assert!(engine.operations_since(0)?.is_empty());
    cluster.close().await?;
    Ok(())
}

/// Overwrite the postings of every flushed segment of a shard copy
fn corrupt_segments(shard_dir: &Path) -> std::io::Result<usize> {
    let mut corrupted = 0;
    for entry in std::fs::read_dir(shard_dir)? {
        let path = entry?.path();
        if path.is_dir() && path.join("postings.bin").exists() {
            std::fs::write(path.join("postings.bin"), b"garbage")?;
            corrupted += 1;
        }
    }
    Ok(corrupted)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_health_red_without_intact_copy() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    {
        let cluster = open(dir.path(), 1).await;
        cluster.create_index("books", settings(1, 0)).await?;
        cluster
            .index("books", Some("a".into()), doc("dune", 1965))
            .await?;
        cluster.refresh("books").await?;
        cluster.close().await?;
    }

    assert!(corrupt_segments(&dir.path().join("node1/books/0"))? > 0);

    let cluster = open(dir.path(), 1).await;
    assert_eq!(cluster.health("books").await?, HealthStatus::Red);
    // The damaged copy answers with an error, never with the documents it kept
    let response = cluster
        .search("books", SearchRequest::new(Query::match_text("title", "dune")))
        .await?;
    assert!(response.partial);
    assert_eq!(response.failed_shards.len(), 1);
    assert!(response.hits.is_empty());
    assert!(cluster.get("books", "a").await.is_err());
    assert!(cluster
        .index("books", Some("b".into()), doc("emma", 1815))
        .await
        .is_err());
    cluster.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_corrupt_primary_yields_to_intact_replica() -> Result<(), Box<dyn std::error::Error>>
{
    let dir = TempDir::new()?;
    {
        let cluster = open(dir.path(), 2).await;
        cluster.create_index("books", settings(1, 1)).await?;
        cluster
            .index("books", Some("a".into()), doc("dune", 1965))
            .await?;
        cluster.refresh("books").await?;
        cluster.close().await?;
    }
    assert!(corrupt_segments(&dir.path().join("node1/books/0"))? > 0);

    let cluster = open(dir.path(), 2).await;
    let damaged = cluster.transport().engine(1, &shard0()).unwrap();
    let intact = cluster.transport().engine(2, &shard0()).unwrap();
    assert!(!damaged.is_intact());
    assert!(intact.is_primary());
    assert!(!damaged.is_primary());
    assert_eq!(cluster.health("books").await?, HealthStatus::Yellow);

    let response = cluster
        .search("books", SearchRequest::new(Query::match_text("title", "dune")))
        .await?;
    assert!(!response.partial);
    assert_eq!(response.keys(), vec!["a"]);
    assert!(cluster.get("books", "a").await?.is_some());
    assert!(damaged.get("a").is_err());

    let deleted = cluster.delete("books", "a").await?;
    assert_eq!(deleted.result, WriteOutcome::Deleted);
    assert!(cluster.get("books", "a").await?.is_none());
    cluster.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_isolated_copies_degrade_health() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let cluster = open(dir.path(), 2).await;
    cluster.create_index("books", settings(1, 1)).await?;
    assert_eq!(cluster.health("books").await?, HealthStatus::Green);

    cluster.isolate_node(2);
    assert_eq!(cluster.health("books").await?, HealthStatus::Yellow);
    cluster.isolate_node(1);
    assert_eq!(cluster.health("books").await?, HealthStatus::Red);

    cluster.heal_node(1);
    cluster.heal_node(2);
    assert_eq!(cluster.health("books").await?, HealthStatus::Green);
    cluster.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_trim_log_after_all_replicas_ack() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let cluster = open(dir.path(), 2).await;
    cluster.create_index("books", settings(1, 1)).await?;

    for i in 0..4 {
        cluster
            .index("books", Some(format!("k{}", i)), doc("t", i))
            .await?;
    }
    // Nothing is committed to segments yet
    assert_eq!(cluster.trim_log("books").await?, 0);

    cluster.refresh("books").await?;
    assert_eq!(cluster.trim_log("books").await?, 4);
    let primary = cluster.transport().engine(1, &shard0()).unwrap();
    assert!(matches!(
        primary.operations_since(0),
        Err(ShoalError::LogTruncated(_))
    ));
    cluster.close().await?;
    Ok(())
}
