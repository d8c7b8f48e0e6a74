//! Tests for the filter pipeline

use crate::filters::{parse_pipeline, Comparison, Filter};
use shared::status::{Failure, Outcome};
use shared::Status;

fn ok(payload: &str) -> Outcome {
    Ok(payload.to_string())
}

#[test]
fn test_regex_extracts_first_capture() {
    let filter = Filter::parse("regex:load average: (\\d+\\.\\d+)").unwrap();
    let outcome = filter.apply(ok("14:02  load average: 0.42, 0.40, 0.36"));
    assert_eq!(outcome, Ok("0.42".to_string()));
}

#[test]
fn test_regex_without_groups_returns_whole_match() {
    let filter = Filter::parse("regex:up \\d+ days").unwrap();
    let outcome = filter.apply(ok("router up 12 days, 4:02"));
    assert_eq!(outcome, Ok("up 12 days".to_string()));
}

#[test]
fn test_regex_mismatch_is_critical_with_partial() {
    let filter = Filter::parse("regex:READY").unwrap();
    let failure = filter.apply(ok("status: DOWN")).unwrap_err();
    assert_eq!(failure.status, Status::Critical);
    assert_eq!(failure.message, "No match for regex 'READY'");
    assert_eq!(failure.partial.as_deref(), Some("status: DOWN"));
}

#[test]
fn test_grep_keeps_matching_lines() {
    let filter = Filter::parse("grep:^eth").unwrap();
    let outcome = filter.apply(ok("lo: up\neth0: up\neth1: down\n"));
    assert_eq!(outcome, Ok("eth0: up\neth1: down".to_string()));

    let failure = filter.apply(ok("lo: up\n")).unwrap_err();
    assert_eq!(failure.message, "No lines matched '^eth'");
}

#[test]
fn test_default_recovers_failures() {
    let filter = Filter::parse("default:0").unwrap();

    let recovered = filter.apply(Err(Failure::critical("TCP connection refused")));
    assert_eq!(recovered, Ok("0".to_string()));

    // Successes pass through untouched.
    assert_eq!(filter.apply(ok("42")), Ok("42".to_string()));
}

#[test]
fn test_thresholds_raise_on_match() {
    let warning = Filter::parse("warning:> 5").unwrap();
    let critical = Filter::parse("critical:>= 10").unwrap();

    assert_eq!(warning.apply(ok("3")), Ok("3".to_string()));

    let failure = warning.apply(ok("7")).unwrap_err();
    assert_eq!(failure.status, Status::Warning);
    assert_eq!(failure.partial.as_deref(), Some("7"));

    let failure = critical.apply(ok("10")).unwrap_err();
    assert_eq!(failure.status, Status::Critical);
    assert_eq!(failure.message, "Matched threshold '>= 10'");
}

#[test]
fn test_threshold_on_non_numeric_payload_is_critical() {
    let filter = Filter::parse("critical:> 5").unwrap();
    let failure = filter.apply(ok("not a number")).unwrap_err();
    assert_eq!(failure.status, Status::Critical);
    assert!(failure.message.contains("numeric comparison"));
}

#[test]
fn test_threshold_passes_failures_through() {
    let filter = Filter::parse("critical:> 5").unwrap();
    let input = Failure::critical("TCP connection refused");
    let failure = filter.apply(Err(input.clone())).unwrap_err();
    assert_eq!(failure, input);
}

#[test]
fn test_equality_falls_back_to_string_comparison() {
    let check = Comparison::parse("== up").unwrap();
    assert!(check.evaluate("up").unwrap());
    assert!(!check.evaluate("down").unwrap());

    // Numeric equality when both sides are numbers.
    let check = Comparison::parse("== 5").unwrap();
    assert!(check.evaluate("5.0").unwrap());

    let check = Comparison::parse("!= 5").unwrap();
    assert!(check.evaluate("6").unwrap());
}

#[test]
fn test_match_operator_uses_regex() {
    let filter = Filter::parse("critical:=~ (?i)error").unwrap();
    let failure = filter.apply(ok("Disk ERROR on /dev/sda")).unwrap_err();
    assert_eq!(failure.status, Status::Critical);

    assert_eq!(filter.apply(ok("all good")), Ok("all good".to_string()));
}

#[test]
fn test_pipeline_applies_in_order() {
    let pipeline = parse_pipeline(&[
        "regex:count=(\\d+)".to_string(),
        "warning:> 100".to_string(),
        "critical:> 1000".to_string(),
    ])
    .unwrap();

    let mut outcome = ok("status count=50 end");
    for filter in &pipeline {
        outcome = filter.apply(outcome);
    }
    assert_eq!(outcome, Ok("50".to_string()));

    let mut outcome = ok("status count=500 end");
    for filter in &pipeline {
        outcome = filter.apply(outcome);
    }
    assert_eq!(outcome.unwrap_err().status, Status::Warning);
}

#[test]
fn test_invalid_filters_are_rejected() {
    assert!(Filter::parse("nofilter").is_err());
    assert!(Filter::parse("bogus:x").is_err());
    assert!(Filter::parse("regex:(unclosed").is_err());
    assert!(Filter::parse("warning:~> 5").is_err());
    assert!(Filter::parse("warning:>").is_err());
}
