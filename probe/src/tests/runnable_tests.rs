//! Tests for the Runnable engine

use crate::queries::QueryRegistry;
use crate::runnable::{RunState, Runnable, RunnableKind};
use crate::test::{build_test, PeerHandle, PeerInfo};
use crate::tests::{subprocess_config, tcp_config};
use shared::config::TestConfig;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn plain(name: &str) -> Arc<Runnable> {
    Runnable::new(name, RunnableKind::Plain, Duration::ZERO, None)
}

#[tokio::test]
async fn test_single_shot_runnable() {
    let runnable = plain("single");
    assert_eq!(runnable.state(), RunState::Idle);
    assert!(runnable.result().is_none());

    let outcome = runnable.start().await;
    assert_eq!(outcome, Ok(String::new()));
    assert_eq!(runnable.result(), Some(Ok(String::new())));
    assert_eq!(runnable.state(), RunState::Idle);
    assert!(runnable.last_run_millis().is_some());
    assert!(runnable.last_finish_millis().is_some());
}

#[tokio::test]
async fn test_concurrent_starts_share_one_run() {
    let temp_dir = TempDir::new().unwrap();
    let marker = temp_dir.path().join("marker");

    let mut registry = QueryRegistry::new().unwrap();
    let conf = subprocess_config(
        &format!("echo tick >> {}; sleep 0.2", marker.display()),
        Some("10"),
    );
    let runnable = registry.add_query(&conf).unwrap();
    assert_eq!(runnable.timeout(), Some(Duration::from_secs(10)));

    let first = runnable.start();
    let second = runnable.start();
    let (outcome_a, outcome_b) = tokio::join!(first, second);

    // Both callers observed the same run and the body executed once.
    assert_eq!(outcome_a, outcome_b);
    let content = std::fs::read_to_string(&marker).unwrap();
    assert_eq!(content.lines().count(), 1);

    // After completion a new start() begins a fresh run.
    runnable.start().await.unwrap();
    let content = std::fs::read_to_string(&marker).unwrap();
    assert_eq!(content.lines().count(), 2);
}

#[tokio::test]
async fn test_dependencies_settle_before_body() {
    let leaf = plain("leaf");
    let mid = plain("mid");
    let root = plain("root");

    mid.add_dependency(&leaf).unwrap();
    root.add_dependency(&mid).unwrap();

    root.start().await.unwrap();

    // The whole chain ran within the one tick of the root.
    assert!(leaf.result().is_some());
    assert!(mid.result().is_some());
    assert!(root.result().is_some());
}

#[tokio::test]
async fn test_dependency_failure_does_not_abort_dependent() {
    let mut registry = QueryRegistry::new().unwrap();
    let peers = Arc::new(PeerHandle::new(PeerInfo::default()));

    // Port 1 on loopback refuses connections.
    let conf = TestConfig {
        name: "refused".to_string(),
        repeat: None,
        timeout: None,
        test_index: None,
        filters: vec![],
        query: tcp_config(1, None, Some("5")),
    };
    let test = build_test(&conf, 0, &mut registry, &peers).unwrap();

    let outcome = test.start().await;
    let failure = outcome.unwrap_err();
    assert_eq!(failure.status, shared::Status::Critical);
    assert!(
        failure.message.contains("TCP"),
        "unexpected message: {}",
        failure.message
    );

    // The test itself did run: its pipeline may recover the failure.
    let conf = TestConfig {
        name: "recovered".to_string(),
        repeat: None,
        timeout: None,
        test_index: None,
        filters: vec!["default:recovered".to_string()],
        query: tcp_config(1, None, Some("5")),
    };
    let test = build_test(&conf, 0, &mut registry, &peers).unwrap();
    assert_eq!(test.start().await, Ok("recovered".to_string()));
}

#[tokio::test]
async fn test_add_dependency_after_start_is_rejected() {
    let runnable = plain("started");
    runnable.start().await.unwrap();

    let dep = plain("late");
    assert!(runnable.add_dependency(&dep).is_err());
}

#[test]
fn test_dependency_cycles_are_rejected() {
    let a = plain("a");
    let b = plain("b");
    let c = plain("c");

    a.add_dependency(&b).unwrap();
    b.add_dependency(&c).unwrap();

    // Direct and transitive cycles, and self-dependency.
    assert!(b.add_dependency(&a).is_err());
    assert!(c.add_dependency(&a).is_err());
    assert!(a.add_dependency(&a).is_err());

    assert!(a.depends_on(&c));
    assert!(!c.depends_on(&a));
}
