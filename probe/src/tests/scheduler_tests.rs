//! Tests for grouping, staggering, backpressure and the task census

use crate::queries::QueryRegistry;
use crate::runnable::{Runnable, RunnableKind};
use crate::scheduler::{Scheduler, SchedulerState, TaskCensus, TickEvent};
use crate::test::{build_test, PeerInfo};
use crate::tests::subprocess_config;
use shared::config::{EngineConfig, TestConfig};
use std::sync::Arc;
use std::time::Duration;

fn plain_60s(name: &str) -> Arc<Runnable> {
    Runnable::new(name, RunnableKind::Plain, Duration::from_secs(60), None)
}

#[test]
fn test_simple_grouping() {
    let r1 = plain_60s("r1");
    let r2 = plain_60s("r2");
    let r3 = plain_60s("r3");

    let t1 = plain_60s("t1");
    t1.add_dependency(&r1).unwrap();
    t1.add_dependency(&r2).unwrap();
    let t2 = plain_60s("t2");
    t2.add_dependency(&r2).unwrap();
    let t3 = plain_60s("t3");
    t3.add_dependency(&r3).unwrap();

    let mut scheduler = Scheduler::new(&EngineConfig::default());
    scheduler.register(t1).unwrap();
    scheduler.register(t2).unwrap();
    scheduler.register(t3).unwrap();
    scheduler.prepare().unwrap();

    // t1 and t2 share r2 so they form one cohort; t3 stands alone. Six
    // user runnables plus the two synthetic groups.
    let stats = scheduler.stats();
    let expect = TaskCensus {
        count: 8,
        tests: 0,
        queries: 0,
        groups: 2,
        runnables: 6,
    };
    assert_eq!(stats.tasks, expect);
    assert_eq!(scheduler.group_count(), 2);
}

#[test]
fn test_stagger_offsets_spread_over_period() {
    let mut scheduler = Scheduler::new(&EngineConfig::default());
    for i in 0..4 {
        scheduler.register(plain_60s(&format!("r{i}"))).unwrap();
    }
    scheduler.prepare().unwrap();

    let offsets = scheduler.group_offsets();
    assert_eq!(offsets.len(), 4);
    assert_eq!(offsets[0], Duration::ZERO);
    for window in offsets.windows(2) {
        assert!(window[0] < window[1]);
    }
    for offset in &offsets {
        assert!(*offset < Duration::from_secs(60));
    }

    // Evenly distributed across the 60 second period.
    assert_eq!(offsets[1], Duration::from_secs(15));
    assert_eq!(offsets[2], Duration::from_secs(30));
    assert_eq!(offsets[3], Duration::from_secs(45));
}

#[test]
fn test_register_after_prepare_is_rejected() {
    let mut scheduler = Scheduler::new(&EngineConfig::default());
    scheduler.register(plain_60s("r1")).unwrap();
    scheduler.prepare().unwrap();

    assert!(scheduler.register(plain_60s("r2")).is_err());
    assert!(scheduler.prepare().is_err());
}

#[tokio::test]
async fn test_group_backpressure_skips_overlapping_ticks() {
    let mut registry = QueryRegistry::new().unwrap();
    let mut scheduler = Scheduler::new(&EngineConfig::default());
    let peers = scheduler.peers();

    let conf = TestConfig {
        name: "slow".to_string(),
        repeat: Some("60s".to_string()),
        timeout: None,
        test_index: None,
        filters: vec![],
        query: subprocess_config("sleep 0.4", Some("10")),
    };
    let test = build_test(&conf, 0, &mut registry, &peers).unwrap();
    scheduler.register(test).unwrap();
    scheduler.prepare().unwrap();

    let tick = TickEvent {
        index: 0,
        latency: Duration::from_millis(1),
    };

    scheduler.handle_tick(tick);
    assert!(scheduler.is_in_flight(0));

    // The second tick arrives while the first is still running: it is
    // skipped, not queued, and the skip counter moves by exactly one.
    scheduler.handle_tick(tick);
    assert_eq!(scheduler.stats().skipped_ticks, 1);

    // stop() waits for the in-flight run before aborting tickers.
    scheduler.stop().await.unwrap();
    assert!(!scheduler.is_in_flight(0));
    assert_eq!(scheduler.stats().skipped_ticks, 1);
}

#[test]
fn test_latency_samples_feed_stats() {
    let scheduler = Scheduler::new(&EngineConfig::default());
    let stats_handle = scheduler.stats_handle();

    stats_handle.record_latency(Duration::from_millis(10));
    stats_handle.record_latency(Duration::from_millis(30));
    stats_handle.record_latency(Duration::from_millis(20));

    let stats = scheduler.stats();
    assert_eq!(stats.latency.samples, 3);
    assert_eq!(stats.latency.period_seconds, 60);
    assert!((stats.latency.min - 0.010).abs() < 1e-9);
    assert!((stats.latency.max - 0.030).abs() < 1e-9);
    assert!((stats.latency.avg - 0.020).abs() < 1e-9);
}

#[test]
fn test_empty_latency_summary_is_zero() {
    let scheduler = Scheduler::new(&EngineConfig::default());
    let stats = scheduler.stats();
    assert_eq!(stats.latency.samples, 0);
    assert_eq!(stats.latency.min, 0.0);
    assert_eq!(stats.latency.max, 0.0);
    assert_eq!(stats.latency.avg, 0.0);
}

#[tokio::test]
async fn test_peer_info_comes_from_config() {
    let config = EngineConfig {
        peer_id: Some(1),
        num_peers: Some(3),
        ..EngineConfig::default()
    };
    let scheduler = Scheduler::new(&config);
    assert_eq!(scheduler.state, SchedulerState::Stopped);

    let peers = scheduler.peers();
    let info: PeerInfo = peers.read().unwrap().clone();
    assert_eq!(info.peer_id, Some(1));
    assert_eq!(info.num_peers, Some(3));
}
