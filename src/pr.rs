//! The pull-request-opening collaborator.
//!
//! The pr-open worker invokes this boundary; a production binding fronts the
//! hosted platform's API, which the core never learns about.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::agent::{CodeResult, JobContext};

/// An opened pull request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub pr_number: i64,
    pub pr_url: String,
}

#[async_trait]
pub trait PullRequestOpener: Send + Sync {
    /// Push the produced branch and open a pull request for it.
    async fn open(&self, ctx: &JobContext, code: &CodeResult) -> Result<PullRequest>;
}

/// Deterministic test double: sequential PR numbers, a URL derived from the
/// context, and an optional forced failure.
#[derive(Clone, Default)]
pub struct MockPullRequestOpener {
    inner: Arc<Mutex<MockPrState>>,
}

#[derive(Default)]
struct MockPrState {
    fail: bool,
    opened: Vec<PullRequest>,
}

impl MockPullRequestOpener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail(&self, fail: bool) {
        self.inner.lock().unwrap().fail = fail;
    }

    pub fn opened(&self) -> Vec<PullRequest> {
        self.inner.lock().unwrap().opened.clone()
    }
}

#[async_trait]
impl PullRequestOpener for MockPullRequestOpener {
    async fn open(&self, ctx: &JobContext, code: &CodeResult) -> Result<PullRequest> {
        let mut state = self.inner.lock().unwrap();
        if state.fail {
            anyhow::bail!("mock PR failure for branch {}", code.branch);
        }
        let pr = PullRequest {
            pr_number: state.opened.len() as i64 + 1,
            pr_url: format!(
                "https://example.com/{}/pull/{}",
                ctx.repository_id,
                state.opened.len() + 1
            ),
        };
        state.opened.push(pr.clone());
        Ok(pr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{ChangeOperation, FileChange};

    fn ctx() -> JobContext {
        JobContext {
            job_id: "job-1".into(),
            tenant_id: "tenant-a".into(),
            repository_id: "repo-1".into(),
            issue_number: 123,
            issue_title: "Test Issue".into(),
            issue_body: String::new(),
            issue_url: "https://github.com/acme/widgets/issues/123".into(),
        }
    }

    fn code() -> CodeResult {
        CodeResult {
            changes: vec![FileChange {
                path: "src/lib.rs".into(),
                operation: ChangeOperation::Update,
                content: Some("fixed".into()),
                original_content: None,
            }],
            commit_message: "Fix #123".into(),
            branch: "patchflow/issue-123".into(),
            metadata: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn test_sequential_pr_numbers() {
        let opener = MockPullRequestOpener::new();
        let first = opener.open(&ctx(), &code()).await.unwrap();
        let second = opener.open(&ctx(), &code()).await.unwrap();
        assert_eq!(first.pr_number, 1);
        assert_eq!(second.pr_number, 2);
        assert!(second.pr_url.ends_with("/pull/2"));
        assert_eq!(opener.opened().len(), 2);
    }

    #[tokio::test]
    async fn test_forced_failure() {
        let opener = MockPullRequestOpener::new();
        opener.set_fail(true);
        let err = opener.open(&ctx(), &code()).await.unwrap_err();
        assert!(err.to_string().contains("mock PR failure"));
        assert!(opener.opened().is_empty());
    }
}
