//! Boundary outcomes: what callers of the engine branch on.
//!
//! Every engine entry point returns `std::result::Result<T, Failure>`.
//! A [`Failure`] carries a machine-readable [`FailureKind`] and a message
//! that is safe to show to a worker. [`Reply`] is the serialized form
//! handed to the presentation layer.

use serde::{Deserialize, Serialize};

/// Why an engine operation did not produce its success payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Supply exhaustion: nothing eligible for this worker.
    NoWorkAvailable,
    /// The identity already finished its claim.
    AlreadyCompleted,
    /// The claim reference does not exist (never created, or reclaimed).
    ClaimNotFound,
    /// Store contention outlasted the retry policy. Safe to try again.
    RetryLater,
    /// Integrity violation or unexpected store error. Details are logged.
    Internal,
}

impl FailureKind {
    /// Wire name, also used as a metric label.
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::NoWorkAvailable => "no_work_available",
            FailureKind::AlreadyCompleted => "already_completed",
            FailureKind::ClaimNotFound => "claim_not_found",
            FailureKind::RetryLater => "retry_later",
            FailureKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed, user-presentable failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn no_work() -> Self {
        Self::new(
            FailureKind::NoWorkAvailable,
            "We have run out of tasks for you. Apologies.",
        )
    }

    /// Returned by the assigner when the identity's claim is finished.
    pub fn already_finished_task() -> Self {
        Self::new(
            FailureKind::AlreadyCompleted,
            "You have already completed this task.",
        )
    }

    /// Returned by the recorder on a duplicate submission.
    pub fn already_submitted() -> Self {
        Self::new(
            FailureKind::AlreadyCompleted,
            "You have already submitted this task. Your earlier submission was recorded.",
        )
    }

    pub fn claim_not_found() -> Self {
        Self::new(
            FailureKind::ClaimNotFound,
            "We were unable to locate the task assigned to you.",
        )
    }

    pub fn retry_later() -> Self {
        Self::new(
            FailureKind::RetryLater,
            "We could not reach our database. Please wait a few seconds and try again.",
        )
    }

    pub fn internal() -> Self {
        Self::new(
            FailureKind::Internal,
            "Something went wrong on our end. Please reload the page and try again.",
        )
    }

    pub fn is(&self, kind: FailureKind) -> bool {
        self.kind == kind
    }
}

/// Discriminated reply for the presentation layer.
///
/// Serializes as `{"status": "ok", ...}` or
/// `{"status": "error", "kind": ..., "message": ...}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Reply<T> {
    Ok(T),
    Error(Failure),
}

impl<T> From<std::result::Result<T, Failure>> for Reply<T> {
    fn from(result: std::result::Result<T, Failure>) -> Self {
        match result {
            Ok(v) => Reply::Ok(v),
            Err(f) => Reply::Error(f),
        }
    }
}

impl<T> Reply<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, Reply::Ok(_))
    }
}
