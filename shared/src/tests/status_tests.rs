//! Tests for the status and failure model

use crate::status::{outcome_status, Failure, Outcome, Status};

#[test]
fn test_status_names() {
    assert_eq!(Status::Ok.as_str(), "OK");
    assert_eq!(Status::Warning.as_str(), "WARNING");
    assert_eq!(Status::Critical.as_str(), "CRITICAL");
    assert_eq!(Status::Unknown.as_str(), "UNKNOWN");
    assert_eq!(format!("{}", Status::Critical), "CRITICAL");
}

#[test]
fn test_failure_constructors() {
    let failure = Failure::critical("TCP connection refused");
    assert_eq!(failure.status, Status::Critical);
    assert_eq!(failure.message, "TCP connection refused");
    assert_eq!(failure.error, "TCP connection refused");
    assert!(failure.partial.is_none());

    let failure = Failure::warning("slow response").with_error("took 4.2s");
    assert_eq!(failure.status, Status::Warning);
    assert_eq!(failure.error, "took 4.2s");

    assert_eq!(Failure::unknown("bad config").status, Status::Unknown);
}

#[test]
fn test_failure_partial_payload() {
    let failure = Failure::critical("Timeout waiting for connection close.")
        .with_partial("partial banner data");
    assert_eq!(failure.partial.as_deref(), Some("partial banner data"));

    // empty partials are dropped
    let failure = Failure::critical("timeout").with_partial("");
    assert!(failure.partial.is_none());
}

#[test]
fn test_failure_display() {
    let failure = Failure::critical("HTTP error: 503 Service Unavailable");
    assert_eq!(
        failure.to_string(),
        "CRITICAL: HTTP error: 503 Service Unavailable"
    );
}

#[test]
fn test_outcome_status() {
    let ok: Outcome = Ok("payload".to_string());
    assert_eq!(outcome_status(&ok), Status::Ok);

    let warn: Outcome = Err(Failure::warning("above threshold"));
    assert_eq!(outcome_status(&warn), Status::Warning);
}
