//! The stage consumers.
//!
//! One worker per queue. The shared shape: dequeue, rebuild the job context,
//! invoke the agent capability, fire the stage's exit event, enqueue the
//! next stage with the job id as message id. Exactly one worker owns each
//! transition and fires it at its own *exit* — the planning worker is the
//! single exception, firing `START_PLANNING` on entry because the producer
//! does not transition.
//!
//! Workers never assume their entry state. A job observed in an unexpected
//! or terminal state (e.g. cancelled while the message was in flight) is
//! abandoned without writing, which also drops queue retries for cancelled
//! jobs.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::agent::{Agent, CodeResult, JobContext, PlanResult, ReviewResult};
use crate::error::CoreError;
use crate::models::Job;
use crate::orchestrator::OrchestratorConfig;
use crate::pr::PullRequestOpener;
use crate::queue::{
    Broker, MessageHandler, QueueMessage, QUEUE_CODING, QUEUE_PR_OPEN, QUEUE_REVIEWING,
};
use crate::scope::{self, TenantScope};
use crate::state::{JobEvent, JobStatus};
use crate::store::TenantDb;

/// Payload seeded by the producer onto the planning queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanningPayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub issue_title: String,
    pub issue_body: String,
    pub issue_url: String,
}

/// Payload carried into the coding stage. `attempts` counts review
/// rejections so far; the reviewing worker bumps it on every rejection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodingPayload {
    pub plan: PlanResult,
    #[serde(default)]
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewingPayload {
    pub plan: PlanResult,
    pub code: CodeResult,
    #[serde(default)]
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrOpenPayload {
    pub plan: PlanResult,
    pub code: CodeResult,
    pub review: ReviewResult,
}

/// Everything a stage worker needs, shared across the four consumers.
pub(crate) struct WorkerContext {
    pub store: TenantDb,
    pub broker: Arc<Broker>,
    pub agent: Arc<dyn Agent>,
    pub pr_opener: Arc<dyn PullRequestOpener>,
    pub config: OrchestratorConfig,
}

impl WorkerContext {
    /// Load the job referenced by a message, dropping the message when the
    /// job is gone, terminal, or not in the stage's entry state.
    async fn job_for_stage(
        &self,
        message: &QueueMessage,
        stage: &str,
        entry: JobStatus,
    ) -> Result<Option<Job>, CoreError> {
        let Some(job) = self.store.get_job(&message.job_id).await? else {
            tracing::warn!(job_id = %message.job_id, stage, "message for unknown job dropped");
            return Ok(None);
        };
        if job.status.is_terminal() {
            tracing::info!(
                job_id = %job.id,
                status = %job.status,
                stage,
                "job already terminal, dropping message"
            );
            return Ok(None);
        }
        if job.status != entry {
            tracing::warn!(
                job_id = %job.id,
                status = %job.status,
                expected = %entry,
                stage,
                "unexpected state on stage entry, dropping message"
            );
            return Ok(None);
        }
        Ok(Some(job))
    }

    /// Fire a transition, treating "job already terminal" as a no-op.
    /// Returns the new state, or `None` when the job raced into a terminal
    /// state and the message should be abandoned. Any other failure bubbles
    /// up so the queue substrate can retry it.
    async fn fire(
        &self,
        job_id: &str,
        event: JobEvent,
        error_details: Option<String>,
    ) -> anyhow::Result<Option<JobStatus>> {
        match self.store.transition_job(job_id, event, error_details).await {
            Ok(next) => Ok(Some(next)),
            Err(CoreError::InvalidTransition { from, event }) => {
                if from.is_terminal() {
                    tracing::info!(job_id, %event, status = %from, "transition skipped, job is terminal");
                    Ok(None)
                } else {
                    Err(CoreError::InvalidTransition { from, event }.into())
                }
            }
            Err(other) => Err(other.into()),
        }
    }

    fn forward(
        &self,
        queue: &str,
        job: &Job,
        issue_number: i64,
        payload: serde_json::Value,
    ) -> Result<(), CoreError> {
        self.broker.enqueue(
            queue,
            QueueMessage::for_job(&job.id, &job.tenant_id, &job.repository_id, issue_number, payload),
        )?;
        Ok(())
    }
}

/// Rebuild the agent-facing context from the message and the issue details
/// recorded in the job's metadata at creation.
fn job_context(message: &QueueMessage, job: &Job) -> JobContext {
    let issue = &job.metadata["issue"];
    JobContext {
        job_id: job.id.clone(),
        tenant_id: job.tenant_id.clone(),
        repository_id: job.repository_id.clone(),
        issue_number: message.issue_number,
        issue_title: issue["title"].as_str().unwrap_or_default().to_string(),
        issue_body: issue["body"].as_str().unwrap_or_default().to_string(),
        issue_url: issue["url"].as_str().unwrap_or_default().to_string(),
    }
}

fn summarize(error: &anyhow::Error) -> String {
    format!("{error:#}")
}

// ── Planning ──────────────────────────────────────────────────────────

pub(crate) struct PlanningWorker {
    pub ctx: Arc<WorkerContext>,
}

#[async_trait]
impl MessageHandler for PlanningWorker {
    async fn handle(&self, message: QueueMessage) -> anyhow::Result<()> {
        let scope = TenantScope::new(&message.tenant_id);
        scope::run_with(scope, self.process(message)).await
    }
}

impl PlanningWorker {
    async fn process(&self, message: QueueMessage) -> anyhow::Result<()> {
        let ctx = &self.ctx;
        let Some(job) = ctx.store.get_job(&message.job_id).await? else {
            tracing::warn!(job_id = %message.job_id, "planning message for unknown job dropped");
            return Ok(());
        };
        if job.status.is_terminal() {
            tracing::info!(job_id = %job.id, status = %job.status, "job already terminal, dropping message");
            return Ok(());
        }
        match job.status {
            JobStatus::Queued => {
                if ctx
                    .fire(&job.id, JobEvent::StartPlanning, None)
                    .await?
                    .is_none()
                {
                    return Ok(());
                }
            }
            // Redelivery after a crash mid-stage: the entry transition
            // already happened, pick the work back up.
            JobStatus::Planning => {}
            other => {
                tracing::warn!(job_id = %job.id, status = %other, "unexpected state on planning entry, dropping message");
                return Ok(());
            }
        }

        let agent_ctx = job_context(&message, &job);
        let outcome =
            tokio::time::timeout(ctx.config.planning_deadline, ctx.agent.plan(&agent_ctx)).await;
        match outcome {
            Ok(Ok(plan)) => {
                ctx.store
                    .record_stage_result(&job.id, "plan", serde_json::to_value(&plan)?)
                    .await?;
                if ctx.fire(&job.id, JobEvent::PlanSucceeded, None).await?.is_some() {
                    let payload = serde_json::to_value(CodingPayload { plan, attempts: 0 })?;
                    ctx.forward(QUEUE_CODING, &job, message.issue_number, payload)?;
                    tracing::info!(job_id = %job.id, "planning complete, queued for coding");
                }
            }
            Ok(Err(error)) => {
                tracing::warn!(job_id = %job.id, error = %summarize(&error), "planning agent failed");
                ctx.fire(&job.id, JobEvent::PlanFailed, Some(summarize(&error)))
                    .await?;
            }
            Err(_) => {
                let details = format!(
                    "planning exceeded the {}s deadline",
                    ctx.config.planning_deadline.as_secs()
                );
                ctx.fire(&job.id, JobEvent::PlanFailed, Some(details)).await?;
            }
        }
        Ok(())
    }
}

// ── Coding ────────────────────────────────────────────────────────────

pub(crate) struct CodingWorker {
    pub ctx: Arc<WorkerContext>,
}

#[async_trait]
impl MessageHandler for CodingWorker {
    async fn handle(&self, message: QueueMessage) -> anyhow::Result<()> {
        let scope = TenantScope::new(&message.tenant_id);
        scope::run_with(scope, self.process(message)).await
    }
}

impl CodingWorker {
    async fn process(&self, message: QueueMessage) -> anyhow::Result<()> {
        let ctx = &self.ctx;
        let Some(job) = ctx
            .job_for_stage(&message, "coding", JobStatus::Coding)
            .await?
        else {
            return Ok(());
        };

        let payload: CodingPayload = serde_json::from_value(message.payload.clone())?;
        let agent_ctx = job_context(&message, &job);
        let outcome = tokio::time::timeout(
            ctx.config.coding_deadline,
            ctx.agent.code(&agent_ctx, &payload.plan),
        )
        .await;
        match outcome {
            Ok(Ok(code)) => {
                ctx.store
                    .record_stage_result(&job.id, "code", serde_json::to_value(&code)?)
                    .await?;
                if ctx.fire(&job.id, JobEvent::CodeSucceeded, None).await?.is_some() {
                    let next = serde_json::to_value(ReviewingPayload {
                        plan: payload.plan,
                        code,
                        attempts: payload.attempts,
                    })?;
                    ctx.forward(QUEUE_REVIEWING, &job, message.issue_number, next)?;
                    tracing::info!(job_id = %job.id, "coding complete, queued for review");
                }
            }
            Ok(Err(error)) => {
                tracing::warn!(job_id = %job.id, error = %summarize(&error), "coding agent failed");
                ctx.fire(&job.id, JobEvent::CodeFailed, Some(summarize(&error)))
                    .await?;
            }
            Err(_) => {
                let details = format!(
                    "coding exceeded the {}s deadline",
                    ctx.config.coding_deadline.as_secs()
                );
                ctx.fire(&job.id, JobEvent::CodeFailed, Some(details)).await?;
            }
        }
        Ok(())
    }
}

// ── Reviewing ─────────────────────────────────────────────────────────

pub(crate) struct ReviewingWorker {
    pub ctx: Arc<WorkerContext>,
}

#[async_trait]
impl MessageHandler for ReviewingWorker {
    async fn handle(&self, message: QueueMessage) -> anyhow::Result<()> {
        let scope = TenantScope::new(&message.tenant_id);
        scope::run_with(scope, self.process(message)).await
    }
}

impl ReviewingWorker {
    async fn process(&self, message: QueueMessage) -> anyhow::Result<()> {
        let ctx = &self.ctx;
        let Some(job) = ctx
            .job_for_stage(&message, "reviewing", JobStatus::Reviewing)
            .await?
        else {
            return Ok(());
        };

        let payload: ReviewingPayload = serde_json::from_value(message.payload.clone())?;
        let agent_ctx = job_context(&message, &job);
        let outcome = tokio::time::timeout(
            ctx.config.reviewing_deadline,
            ctx.agent.review(&agent_ctx, &payload.plan, &payload.code),
        )
        .await;
        match outcome {
            Ok(Ok(review)) => {
                ctx.store
                    .record_stage_result(&job.id, "review", serde_json::to_value(&review)?)
                    .await?;
                if review.approved {
                    if ctx
                        .fire(&job.id, JobEvent::ReviewApproved, None)
                        .await?
                        .is_some()
                    {
                        let next = serde_json::to_value(PrOpenPayload {
                            plan: payload.plan,
                            code: payload.code,
                            review,
                        })?;
                        ctx.forward(QUEUE_PR_OPEN, &job, message.issue_number, next)?;
                        tracing::info!(job_id = %job.id, "review approved, queued for PR");
                    }
                    return Ok(());
                }

                let attempts = payload.attempts + 1;
                if attempts > ctx.config.max_coding_attempts {
                    // The rejection loop is bounded here: re-entering coding
                    // past the budget would thrash forever.
                    let details = format!(
                        "review rejected {} times; coding attempt budget exhausted",
                        attempts
                    );
                    tracing::warn!(job_id = %job.id, attempts, "rejection budget exhausted, failing job");
                    ctx.fire(&job.id, JobEvent::ReviewFailed, Some(details)).await?;
                } else if ctx
                    .fire(&job.id, JobEvent::ReviewRejected, None)
                    .await?
                    .is_some()
                {
                    let next = serde_json::to_value(CodingPayload {
                        plan: payload.plan,
                        attempts,
                    })?;
                    ctx.forward(QUEUE_CODING, &job, message.issue_number, next)?;
                    tracing::info!(job_id = %job.id, attempts, "review rejected, job re-enters coding");
                }
            }
            Ok(Err(error)) => {
                tracing::warn!(job_id = %job.id, error = %summarize(&error), "review agent failed");
                ctx.fire(&job.id, JobEvent::ReviewFailed, Some(summarize(&error)))
                    .await?;
            }
            Err(_) => {
                let details = format!(
                    "reviewing exceeded the {}s deadline",
                    ctx.config.reviewing_deadline.as_secs()
                );
                ctx.fire(&job.id, JobEvent::ReviewFailed, Some(details)).await?;
            }
        }
        Ok(())
    }
}

// ── PR open ───────────────────────────────────────────────────────────

pub(crate) struct PrOpenWorker {
    pub ctx: Arc<WorkerContext>,
}

#[async_trait]
impl MessageHandler for PrOpenWorker {
    async fn handle(&self, message: QueueMessage) -> anyhow::Result<()> {
        let scope = TenantScope::new(&message.tenant_id);
        scope::run_with(scope, self.process(message)).await
    }
}

impl PrOpenWorker {
    async fn process(&self, message: QueueMessage) -> anyhow::Result<()> {
        let ctx = &self.ctx;
        let Some(job) = ctx
            .job_for_stage(&message, "pr-open", JobStatus::PrOpen)
            .await?
        else {
            return Ok(());
        };

        let payload: PrOpenPayload = serde_json::from_value(message.payload.clone())?;
        let agent_ctx = job_context(&message, &job);
        let outcome = tokio::time::timeout(
            ctx.config.pr_open_deadline,
            ctx.pr_opener.open(&agent_ctx, &payload.code),
        )
        .await;
        match outcome {
            Ok(Ok(pr)) => {
                ctx.store
                    .record_stage_result(&job.id, "pr", serde_json::to_value(&pr)?)
                    .await?;
                if ctx.fire(&job.id, JobEvent::PrOpened, None).await?.is_some() {
                    tracing::info!(job_id = %job.id, pr_url = %pr.pr_url, "pull request opened, job complete");
                }
            }
            Ok(Err(error)) => {
                tracing::warn!(job_id = %job.id, error = %summarize(&error), "pull request collaborator failed");
                ctx.fire(&job.id, JobEvent::PrFailed, Some(summarize(&error)))
                    .await?;
            }
            Err(_) => {
                let details = format!(
                    "pr-open exceeded the {}s deadline",
                    ctx.config.pr_open_deadline.as_secs()
                );
                ctx.fire(&job.id, JobEvent::PrFailed, Some(details)).await?;
            }
        }
        Ok(())
    }
}
