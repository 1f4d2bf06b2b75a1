//! The agent capability contract.
//!
//! An [`Agent`] is the `{plan, code, review}` capability set the workers
//! call into at each stage. Agent operations are pure with respect to core
//! state: they never touch storage, never enqueue, never transition. A
//! failing operation is translated by the calling worker into the stage's
//! failure event.
//!
//! [`MockAgent`] is the deterministic test double: configurable delay,
//! per-capability forced failure, and forced review rejection, with stable
//! outputs derived from the job context.

use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Everything an agent may know about the job it is working.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobContext {
    pub job_id: String,
    pub tenant_id: String,
    pub repository_id: String,
    pub issue_number: i64,
    pub issue_title: String,
    pub issue_body: String,
    pub issue_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

impl Complexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl FromStr for Complexity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            _ => Err(format!("Invalid complexity: {}", s)),
        }
    }
}

/// Output of the planning capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanResult {
    pub summary: String,
    pub steps: Vec<String>,
    pub files_changed: Vec<String>,
    pub estimated_complexity: Complexity,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOperation {
    Create,
    Update,
    Delete,
}

/// One file-level change produced by the coding capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub operation: ChangeOperation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_content: Option<String>,
}

/// Output of the coding capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeResult {
    pub changes: Vec<FileChange>,
    pub commit_message: String,
    pub branch: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Output of the reviewing capability. `quality_score` is 0–100.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewResult {
    pub approved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    #[serde(default)]
    pub suggested_changes: Vec<String>,
    #[serde(default)]
    pub security_issues: Vec<String>,
    pub quality_score: u8,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// The capability set the pipeline calls into at each stage.
///
/// Real implementation: an external LLM binding. Test double: [`MockAgent`].
#[async_trait]
pub trait Agent: Send + Sync {
    async fn plan(&self, ctx: &JobContext) -> Result<PlanResult>;

    async fn code(&self, ctx: &JobContext, plan: &PlanResult) -> Result<CodeResult>;

    async fn review(
        &self,
        ctx: &JobContext,
        plan: &PlanResult,
        code: &CodeResult,
    ) -> Result<ReviewResult>;
}

/// Convert a title to a URL-safe slug, limited to `max_len` characters.
pub fn slugify(title: &str, max_len: usize) -> String {
    let slug: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.len() > max_len {
        slug[..max_len].trim_end_matches('-').to_string()
    } else {
        slug
    }
}

#[derive(Debug, Clone, Default)]
pub struct MockAgentConfig {
    /// Artificial delay applied to every capability call.
    pub delay: Duration,
    pub fail_planning: bool,
    pub fail_coding: bool,
    pub fail_review: bool,
    /// Review completes but rejects the change.
    pub reject_review: bool,
}

/// Recorded capability invocation, for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentCall {
    Plan { job_id: String },
    Code { job_id: String },
    Review { job_id: String },
}

/// Deterministic in-memory agent.
///
/// Allows programmatic control over behavior and records all calls.
#[derive(Clone, Default)]
pub struct MockAgent {
    inner: Arc<Mutex<MockAgentState>>,
}

#[derive(Default)]
struct MockAgentState {
    config: MockAgentConfig,
    calls: Vec<AgentCall>,
}

impl MockAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: MockAgentConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockAgentState {
                config,
                calls: Vec::new(),
            })),
        }
    }

    pub fn set_delay(&self, delay: Duration) {
        self.inner.lock().unwrap().config.delay = delay;
    }

    pub fn set_fail_planning(&self, fail: bool) {
        self.inner.lock().unwrap().config.fail_planning = fail;
    }

    pub fn set_fail_coding(&self, fail: bool) {
        self.inner.lock().unwrap().config.fail_coding = fail;
    }

    pub fn set_fail_review(&self, fail: bool) {
        self.inner.lock().unwrap().config.fail_review = fail;
    }

    pub fn set_reject_review(&self, reject: bool) {
        self.inner.lock().unwrap().config.reject_review = reject;
    }

    /// All recorded capability calls, in order.
    pub fn calls(&self) -> Vec<AgentCall> {
        self.inner.lock().unwrap().calls.clone()
    }

    fn config(&self) -> MockAgentConfig {
        self.inner.lock().unwrap().config.clone()
    }

    fn record(&self, call: AgentCall) {
        self.inner.lock().unwrap().calls.push(call);
    }

    async fn pause(&self, delay: Duration) {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl Agent for MockAgent {
    async fn plan(&self, ctx: &JobContext) -> Result<PlanResult> {
        self.record(AgentCall::Plan {
            job_id: ctx.job_id.clone(),
        });
        let config = self.config();
        self.pause(config.delay).await;
        if config.fail_planning {
            anyhow::bail!("mock planning failure for issue #{}", ctx.issue_number);
        }
        Ok(PlanResult {
            summary: format!("Plan for issue #{}: {}", ctx.issue_number, ctx.issue_title),
            steps: vec![
                "Analyze the issue".to_string(),
                "Apply the change".to_string(),
                "Add regression coverage".to_string(),
            ],
            files_changed: vec![format!("src/issue_{}.rs", ctx.issue_number)],
            estimated_complexity: Complexity::Low,
            metadata: serde_json::json!({ "mock": true }),
        })
    }

    async fn code(&self, ctx: &JobContext, plan: &PlanResult) -> Result<CodeResult> {
        self.record(AgentCall::Code {
            job_id: ctx.job_id.clone(),
        });
        let config = self.config();
        self.pause(config.delay).await;
        if config.fail_coding {
            anyhow::bail!("mock coding failure for issue #{}", ctx.issue_number);
        }
        let path = plan
            .files_changed
            .first()
            .cloned()
            .unwrap_or_else(|| format!("src/issue_{}.rs", ctx.issue_number));
        Ok(CodeResult {
            changes: vec![FileChange {
                path,
                operation: ChangeOperation::Create,
                content: Some(format!("// resolves issue #{}\n", ctx.issue_number)),
                original_content: None,
            }],
            commit_message: format!("Fix #{}: {}", ctx.issue_number, ctx.issue_title),
            branch: format!(
                "patchflow/issue-{}-{}",
                ctx.issue_number,
                slugify(&ctx.issue_title, 40)
            ),
            metadata: serde_json::json!({ "mock": true }),
        })
    }

    async fn review(
        &self,
        ctx: &JobContext,
        _plan: &PlanResult,
        code: &CodeResult,
    ) -> Result<ReviewResult> {
        self.record(AgentCall::Review {
            job_id: ctx.job_id.clone(),
        });
        let config = self.config();
        self.pause(config.delay).await;
        if config.fail_review {
            anyhow::bail!("mock review failure for issue #{}", ctx.issue_number);
        }
        if config.reject_review {
            return Ok(ReviewResult {
                approved: false,
                feedback: Some(format!(
                    "changes to {} need another pass",
                    code.changes
                        .first()
                        .map(|c| c.path.as_str())
                        .unwrap_or("the branch")
                )),
                suggested_changes: vec!["tighten error handling".to_string()],
                security_issues: vec![],
                quality_score: 40,
                metadata: serde_json::json!({ "mock": true }),
            });
        }
        Ok(ReviewResult {
            approved: true,
            feedback: None,
            suggested_changes: vec![],
            security_issues: vec![],
            quality_score: 92,
            metadata: serde_json::json!({ "mock": true }),
        })
    }
}
