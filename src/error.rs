//! Typed error hierarchy for the orchestration core.
//!
//! One top-level enum covers the whole core. The structured variants are the
//! ones callers are expected to match on: scope violations, missing jobs, and
//! rejected state transitions. Everything transient (SQLite, queue plumbing)
//! flows through the transparent variants and is eligible for retry at the
//! queue layer.

use thiserror::Error;

use crate::state::{JobEvent, JobStatus};

/// Errors surfaced by the orchestration core.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A storage operation against a multi-tenant table was attempted with no
    /// tenant scope bound. Raised before any SQL is sent.
    #[error("no tenant scope is bound to the current task")]
    TenantScopeMissing,

    /// An ownership check found a row belonging to a different tenant.
    #[error("access denied: {kind} belongs to another tenant")]
    TenantAccessDenied { kind: String },

    #[error("job {id} not found")]
    JobNotFound { id: String },

    /// The event is not applicable in the job's current state.
    #[error("invalid transition: event {event} not permitted in state {from}")]
    InvalidTransition { from: JobStatus, event: JobEvent },

    /// The queue substrate rejected an operation (closed broker, bad queue).
    #[error("queue error: {0}")]
    Queue(String),

    #[error("database lock poisoned")]
    LockPoisoned,

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CoreError {
    /// Ownership check failure for the given row kind.
    pub fn access_denied(kind: impl Into<String>) -> Self {
        Self::TenantAccessDenied { kind: kind.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_scope_missing_is_matchable() {
        let err = CoreError::TenantScopeMissing;
        assert!(matches!(err, CoreError::TenantScopeMissing));
    }

    #[test]
    fn access_denied_carries_kind() {
        let err = CoreError::access_denied("repository");
        match &err {
            CoreError::TenantAccessDenied { kind } => assert_eq!(kind, "repository"),
            _ => panic!("Expected TenantAccessDenied"),
        }
        assert!(err.to_string().contains("repository"));
    }

    #[test]
    fn invalid_transition_names_state_and_event() {
        let err = CoreError::InvalidTransition {
            from: JobStatus::Completed,
            event: JobEvent::Cancel,
        };
        let msg = err.to_string();
        assert!(msg.contains("completed"));
        assert!(msg.contains("cancel"));
    }

    #[test]
    fn job_not_found_carries_id() {
        let err = CoreError::JobNotFound { id: "job-42".into() };
        assert!(err.to_string().contains("job-42"));
    }

    #[test]
    fn all_variants_implement_std_error() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&CoreError::TenantScopeMissing);
        assert_std_error(&CoreError::LockPoisoned);
        assert_std_error(&CoreError::Queue("closed".into()));
    }
}
