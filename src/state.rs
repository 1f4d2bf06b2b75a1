//! The job state machine: states, events, and the transition relation.
//!
//! Pure logic with no I/O. The transactional engine that binds these
//! predicates to storage lives in the store (`TenantDb::transition_job`);
//! keeping the relation itself side-effect free means every worker and test
//! shares one source of truth for what moves are legal.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Persisted status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Planning,
    Coding,
    Reviewing,
    PrOpen,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Planning => "planning",
            Self::Coding => "coding",
            Self::Reviewing => "reviewing",
            Self::PrOpen => "pr_open",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal states have no outgoing transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "planning" => Ok(Self::Planning),
            "coding" => Ok(Self::Coding),
            "reviewing" => Ok(Self::Reviewing),
            "pr_open" => Ok(Self::PrOpen),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

/// A named trigger requesting a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobEvent {
    StartPlanning,
    PlanSucceeded,
    PlanFailed,
    CodeSucceeded,
    CodeFailed,
    ReviewApproved,
    ReviewRejected,
    ReviewFailed,
    PrOpened,
    PrFailed,
    Cancel,
    Fail,
}

impl JobEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StartPlanning => "start_planning",
            Self::PlanSucceeded => "plan_succeeded",
            Self::PlanFailed => "plan_failed",
            Self::CodeSucceeded => "code_succeeded",
            Self::CodeFailed => "code_failed",
            Self::ReviewApproved => "review_approved",
            Self::ReviewRejected => "review_rejected",
            Self::ReviewFailed => "review_failed",
            Self::PrOpened => "pr_opened",
            Self::PrFailed => "pr_failed",
            Self::Cancel => "cancel",
            Self::Fail => "fail",
        }
    }
}

impl std::fmt::Display for JobEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start_planning" => Ok(Self::StartPlanning),
            "plan_succeeded" => Ok(Self::PlanSucceeded),
            "plan_failed" => Ok(Self::PlanFailed),
            "code_succeeded" => Ok(Self::CodeSucceeded),
            "code_failed" => Ok(Self::CodeFailed),
            "review_approved" => Ok(Self::ReviewApproved),
            "review_rejected" => Ok(Self::ReviewRejected),
            "review_failed" => Ok(Self::ReviewFailed),
            "pr_opened" => Ok(Self::PrOpened),
            "pr_failed" => Ok(Self::PrFailed),
            "cancel" => Ok(Self::Cancel),
            "fail" => Ok(Self::Fail),
            _ => Err(format!("Invalid job event: {}", s)),
        }
    }
}

/// The state an event moves a job into, or `None` when the event is not
/// applicable in the current state. Terminal states map every event to
/// `None`.
pub fn next_state(current: JobStatus, event: JobEvent) -> Option<JobStatus> {
    use JobEvent::*;
    use JobStatus::*;

    match (current, event) {
        (Queued, StartPlanning) => Some(Planning),
        (Queued, Cancel) => Some(Cancelled),
        (Queued, Fail) => Some(Failed),
        (Planning, PlanSucceeded) => Some(Coding),
        (Planning, PlanFailed) => Some(Failed),
        (Planning, Cancel) => Some(Cancelled),
        (Coding, CodeSucceeded) => Some(Reviewing),
        (Coding, CodeFailed) => Some(Failed),
        (Coding, Cancel) => Some(Cancelled),
        (Reviewing, ReviewApproved) => Some(PrOpen),
        (Reviewing, ReviewRejected) => Some(Coding),
        (Reviewing, ReviewFailed) => Some(Failed),
        (Reviewing, Cancel) => Some(Cancelled),
        (PrOpen, PrOpened) => Some(Completed),
        (PrOpen, PrFailed) => Some(Failed),
        _ => None,
    }
}

/// The set of states reachable from `from` in one transition.
pub fn valid_transitions(from: JobStatus) -> &'static [JobStatus] {
    use JobStatus::*;

    match from {
        Queued => &[Planning, Cancelled, Failed],
        Planning => &[Coding, Failed, Cancelled],
        Coding => &[Reviewing, Failed, Cancelled],
        Reviewing => &[PrOpen, Coding, Failed, Cancelled],
        PrOpen => &[Completed, Failed],
        Completed | Failed | Cancelled => &[],
    }
}

/// Whether a direct move from `from` to `to` is permitted.
pub fn is_valid_transition(from: JobStatus, to: JobStatus) -> bool {
    valid_transitions(from).contains(&to)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATUSES: [JobStatus; 8] = [
        JobStatus::Queued,
        JobStatus::Planning,
        JobStatus::Coding,
        JobStatus::Reviewing,
        JobStatus::PrOpen,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    const ALL_EVENTS: [JobEvent; 12] = [
        JobEvent::StartPlanning,
        JobEvent::PlanSucceeded,
        JobEvent::PlanFailed,
        JobEvent::CodeSucceeded,
        JobEvent::CodeFailed,
        JobEvent::ReviewApproved,
        JobEvent::ReviewRejected,
        JobEvent::ReviewFailed,
        JobEvent::PrOpened,
        JobEvent::PrFailed,
        JobEvent::Cancel,
        JobEvent::Fail,
    ];

    #[test]
    fn test_status_roundtrip() {
        for status in ALL_STATUSES {
            let parsed: JobStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("invalid".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_event_roundtrip() {
        for event in ALL_EVENTS {
            let parsed: JobEvent = event.as_str().parse().unwrap();
            assert_eq!(parsed, event);
        }
        assert!("invalid".parse::<JobEvent>().is_err());
    }

    #[test]
    fn test_serde_produces_lowercase_strings() {
        assert_eq!(
            serde_json::to_string(&JobStatus::PrOpen).unwrap(),
            "\"pr_open\""
        );
        assert_eq!(
            serde_json::to_string(&JobEvent::ReviewRejected).unwrap(),
            "\"review_rejected\""
        );
        assert_eq!(
            serde_json::from_str::<JobStatus>("\"reviewing\"").unwrap(),
            JobStatus::Reviewing
        );
    }

    #[test]
    fn test_happy_path_transitions() {
        assert_eq!(
            next_state(JobStatus::Queued, JobEvent::StartPlanning),
            Some(JobStatus::Planning)
        );
        assert_eq!(
            next_state(JobStatus::Planning, JobEvent::PlanSucceeded),
            Some(JobStatus::Coding)
        );
        assert_eq!(
            next_state(JobStatus::Coding, JobEvent::CodeSucceeded),
            Some(JobStatus::Reviewing)
        );
        assert_eq!(
            next_state(JobStatus::Reviewing, JobEvent::ReviewApproved),
            Some(JobStatus::PrOpen)
        );
        assert_eq!(
            next_state(JobStatus::PrOpen, JobEvent::PrOpened),
            Some(JobStatus::Completed)
        );
    }

    #[test]
    fn test_review_rejection_reenters_coding() {
        assert_eq!(
            next_state(JobStatus::Reviewing, JobEvent::ReviewRejected),
            Some(JobStatus::Coding)
        );
        assert!(is_valid_transition(JobStatus::Reviewing, JobStatus::Coding));
    }

    #[test]
    fn test_failure_events() {
        assert_eq!(
            next_state(JobStatus::Planning, JobEvent::PlanFailed),
            Some(JobStatus::Failed)
        );
        assert_eq!(
            next_state(JobStatus::Coding, JobEvent::CodeFailed),
            Some(JobStatus::Failed)
        );
        assert_eq!(
            next_state(JobStatus::Reviewing, JobEvent::ReviewFailed),
            Some(JobStatus::Failed)
        );
        assert_eq!(
            next_state(JobStatus::PrOpen, JobEvent::PrFailed),
            Some(JobStatus::Failed)
        );
    }

    #[test]
    fn test_cancel_not_permitted_after_pr_open() {
        assert_eq!(next_state(JobStatus::PrOpen, JobEvent::Cancel), None);
    }

    #[test]
    fn test_terminal_states_have_no_transitions() {
        for status in [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled] {
            assert!(status.is_terminal());
            assert!(valid_transitions(status).is_empty());
            for event in ALL_EVENTS {
                assert_eq!(next_state(status, event), None);
            }
        }
    }

    #[test]
    fn test_next_state_agrees_with_permitted_set() {
        // Every (state, event) pair that maps to a next state must also be in
        // the permitted set; this is the §4.1 validity definition.
        for from in ALL_STATUSES {
            for event in ALL_EVENTS {
                if let Some(to) = next_state(from, event) {
                    assert!(
                        is_valid_transition(from, to),
                        "{from} --{event}--> {to} missing from permitted set"
                    );
                }
            }
        }
    }

    #[test]
    fn test_invalid_pairs_rejected() {
        assert_eq!(next_state(JobStatus::Queued, JobEvent::PlanSucceeded), None);
        assert_eq!(next_state(JobStatus::Coding, JobEvent::ReviewApproved), None);
        assert!(!is_valid_transition(JobStatus::Queued, JobStatus::Completed));
        assert!(!is_valid_transition(JobStatus::Completed, JobStatus::Queued));
    }
}
