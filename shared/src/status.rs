//! Status and failure types carried by scheduled work
//!
//! Every unit of work in the engine finishes with an [`Outcome`]: either a
//! successful string payload or a [`Failure`] record describing what went
//! wrong. Failures are data, not exceptions: dependents observe them in
//! the result slot and decide how to compose or report.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Nagios-compatible result states, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Ok,
    Warning,
    Critical,
    Unknown,
}

impl Status {
    /// Returns the canonical upper-case name used in status output.
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::Warning => "WARNING",
            Status::Critical => "CRITICAL",
            Status::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured failure record.
///
/// Carries the state code, a short message, a more detailed error string
/// (defaults to the message) and whatever partial payload the work had
/// accumulated before it failed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{status}: {message}")]
pub struct Failure {
    /// Result state. Never `Ok`; a failure is at least a warning.
    pub status: Status,
    /// Short human-readable message, e.g. "TCP connection refused".
    pub message: String,
    /// Detail for diagnostics; defaults to `message`.
    pub error: String,
    /// Partial payload collected before the failure, if any.
    pub partial: Option<String>,
}

impl Failure {
    fn new(status: Status, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            status,
            error: message.clone(),
            message,
            partial: None,
        }
    }

    /// A CRITICAL failure.
    pub fn critical(message: impl Into<String>) -> Self {
        Self::new(Status::Critical, message)
    }

    /// A WARNING failure.
    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(Status::Warning, message)
    }

    /// An UNKNOWN failure: the monitor itself could not determine a state.
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(Status::Unknown, message)
    }

    /// Attaches the payload accumulated before the failure. An empty
    /// payload is dropped rather than stored.
    pub fn with_partial(mut self, partial: impl Into<String>) -> Self {
        let partial = partial.into();
        self.partial = if partial.is_empty() {
            None
        } else {
            Some(partial)
        };
        self
    }

    /// Replaces the detailed error string.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = error.into();
        self
    }
}

/// The outcome of one run: a payload or a failure record.
pub type Outcome = Result<String, Failure>;

/// Returns the state of an outcome: `Ok` for success, the failure's
/// status otherwise.
pub fn outcome_status(outcome: &Outcome) -> Status {
    match outcome {
        Ok(_) => Status::Ok,
        Err(failure) => failure.status,
    }
}
