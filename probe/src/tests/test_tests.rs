//! Tests for test composition and peer sharding

use crate::queries::QueryRegistry;
use crate::test::{build_test, PeerHandle, PeerInfo, TestSpec};
use crate::tests::{noop_config, subprocess_config};
use shared::config::TestConfig;
use std::sync::Arc;
use tempfile::TempDir;

fn peers(peer_id: Option<u32>, num_peers: Option<u32>) -> Arc<PeerHandle> {
    Arc::new(PeerHandle::new(PeerInfo { peer_id, num_peers }))
}

#[test]
fn test_sharding_partition() {
    // With three peers, peer 1 owns exactly the indexes congruent to 1.
    let peers = peers(Some(1), Some(3));
    for index in 0..9 {
        let spec = TestSpec::new(vec![], Some(index), Arc::clone(&peers));
        assert_eq!(spec.should_run(), index % 3 == 1, "index {index}");
    }
}

#[test]
fn test_sharding_disabled_without_peers() {
    for info in [
        peers(None, None),
        peers(Some(2), None),
        peers(None, Some(0)),
    ] {
        let spec = TestSpec::new(vec![], Some(7), Arc::clone(&info));
        assert!(spec.should_run());
    }

    // An unset peer id behaves as peer 0.
    let spec = TestSpec::new(vec![], Some(6), peers(None, Some(3)));
    assert!(spec.should_run());
    let spec = TestSpec::new(vec![], Some(7), peers(None, Some(3)));
    assert!(!spec.should_run());
}

#[tokio::test]
async fn test_sharded_out_test_is_a_noop() {
    let temp_dir = TempDir::new().unwrap();
    let mut registry = QueryRegistry::new().unwrap();
    let cluster = peers(Some(1), Some(3));

    let mut markers = Vec::new();
    let mut tests = Vec::new();
    for index in 0..6u32 {
        let marker = temp_dir.path().join(format!("marker-{index}"));
        let conf = TestConfig {
            name: format!("sharded-{index}"),
            repeat: None,
            timeout: None,
            test_index: Some(index),
            filters: vec![],
            query: subprocess_config(&format!("echo ran > {}", marker.display()), Some("10")),
        };
        markers.push(marker);
        tests.push(build_test(&conf, index, &mut registry, &cluster).unwrap());
    }

    for test in &tests {
        let outcome = test.start().await;
        assert!(outcome.is_ok());
    }

    // Only the shard owned by peer 1 issued its query; the skipped
    // tests resolved immediately without touching any state.
    for (index, marker) in markers.iter().enumerate() {
        assert_eq!(marker.exists(), index % 3 == 1, "marker {index}");
    }
    for (index, test) in tests.iter().enumerate() {
        assert_eq!(test.result().is_some(), index as u32 % 3 == 1);
    }
}

#[tokio::test]
async fn test_compose_threads_the_query_through_filters() {
    let mut registry = QueryRegistry::new().unwrap();
    let cluster = peers(None, None);

    let conf = TestConfig {
        name: "uptime check".to_string(),
        repeat: Some("60s".to_string()),
        timeout: None,
        test_index: None,
        filters: vec![
            "regex:uptime=(\\d+)".to_string(),
            "critical:< 300".to_string(),
        ],
        query: noop_config("uptime=12345 status=ok"),
    };
    let test = build_test(&conf, 0, &mut registry, &cluster).unwrap();

    assert_eq!(test.start().await, Ok("12345".to_string()));

    let fresh_boot = TestConfig {
        name: "uptime check fresh".to_string(),
        filters: conf.filters.clone(),
        query: noop_config("uptime=60 status=ok"),
        ..conf
    };
    let test = build_test(&fresh_boot, 1, &mut registry, &cluster).unwrap();
    let failure = test.start().await.unwrap_err();
    assert_eq!(failure.status, shared::Status::Critical);
}

#[tokio::test]
async fn test_positional_index_is_the_default_shard_index() {
    let mut registry = QueryRegistry::new().unwrap();
    // Cluster of two, this node is peer 0: even positions run.
    let cluster = peers(Some(0), Some(2));

    let conf = TestConfig {
        name: "positional".to_string(),
        repeat: None,
        timeout: None,
        test_index: None,
        filters: vec![],
        query: noop_config("payload"),
    };

    let even = build_test(&conf, 4, &mut registry, &cluster).unwrap();
    assert_eq!(even.start().await, Ok("payload".to_string()));

    let odd_conf = TestConfig {
        name: "positional-odd".to_string(),
        ..conf
    };
    let odd = build_test(&odd_conf, 5, &mut registry, &cluster).unwrap();
    assert_eq!(odd.start().await, Ok(String::new()));
    assert!(odd.result().is_none());
}
