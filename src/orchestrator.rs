//! Pipeline assembly: the job producer, the inbound programmatic surface,
//! and start/stop of the queue consumers.
//!
//! `Orchestrator::create_job` inserts a `QUEUED` job row through the
//! tenant-aware client and seeds the planning queue; from there the stage
//! workers carry the job through `planning → coding → reviewing → pr-open`
//! asynchronously. The job row in storage stays the single source of truth
//! at every hop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::agent::Agent;
use crate::db::DbHandle;
use crate::error::CoreError;
use crate::models::{Job, JobTransition};
use crate::pr::PullRequestOpener;
use crate::queue::{Broker, QueueConfig, QueueMessage, QUEUE_CODING, QUEUE_PLANNING, QUEUE_PR_OPEN, QUEUE_REVIEWING};
use crate::state::{JobEvent, JobStatus};
use crate::store::TenantDb;
use crate::worker::{
    CodingWorker, PlanningPayload, PlanningWorker, PrOpenWorker, ReviewingWorker, WorkerContext,
};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub queue: QueueConfig,
    /// Per-stage deadlines for agent / collaborator calls; expiry surfaces
    /// as the stage's failure event.
    pub planning_deadline: Duration,
    pub coding_deadline: Duration,
    pub reviewing_deadline: Duration,
    pub pr_open_deadline: Duration,
    /// Review rejections a job may absorb before it is failed outright.
    pub max_coding_attempts: u32,
    /// How long graceful shutdown waits for in-flight handlers.
    pub drain_deadline: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            planning_deadline: Duration::from_secs(15 * 60),
            coding_deadline: Duration::from_secs(30 * 60),
            reviewing_deadline: Duration::from_secs(15 * 60),
            pr_open_deadline: Duration::from_secs(5 * 60),
            max_coding_attempts: 3,
            drain_deadline: Duration::from_secs(30),
        }
    }
}

/// Reference to an external issue that needs work. The repository id is the
/// core's own; the caller resolves it from the platform webhook beforehand.
#[derive(Debug, Clone)]
pub struct NewJobRequest {
    pub repository_id: String,
    pub issue_number: i64,
    pub issue_title: String,
    pub issue_body: String,
    pub issue_url: String,
}

pub struct Orchestrator {
    store: TenantDb,
    broker: Arc<Broker>,
    worker_ctx: Arc<WorkerContext>,
    config: OrchestratorConfig,
    started: AtomicBool,
}

impl Orchestrator {
    pub fn new(
        db: DbHandle,
        agent: Arc<dyn Agent>,
        pr_opener: Arc<dyn PullRequestOpener>,
        config: OrchestratorConfig,
    ) -> Self {
        let store = TenantDb::new(db);
        let broker = Arc::new(Broker::new(config.queue.clone()));
        let worker_ctx = Arc::new(WorkerContext {
            store: store.clone(),
            broker: Arc::clone(&broker),
            agent,
            pr_opener,
            config: config.clone(),
        });
        Self {
            store,
            broker,
            worker_ctx,
            config,
            started: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &TenantDb {
        &self.store
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// Attach the four stage consumers. Idempotent per lifecycle; call
    /// again after [`shutdown`](Self::shutdown) for a fresh start.
    pub fn start(&self) -> Result<(), CoreError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.broker.subscribe(
            QUEUE_PLANNING,
            Arc::new(PlanningWorker {
                ctx: Arc::clone(&self.worker_ctx),
            }),
        )?;
        self.broker.subscribe(
            QUEUE_CODING,
            Arc::new(CodingWorker {
                ctx: Arc::clone(&self.worker_ctx),
            }),
        )?;
        self.broker.subscribe(
            QUEUE_REVIEWING,
            Arc::new(ReviewingWorker {
                ctx: Arc::clone(&self.worker_ctx),
            }),
        )?;
        self.broker.subscribe(
            QUEUE_PR_OPEN,
            Arc::new(PrOpenWorker {
                ctx: Arc::clone(&self.worker_ctx),
            }),
        )?;
        tracing::info!("pipeline consumers started");
        Ok(())
    }

    /// Graceful shutdown: drain in-flight handlers up to the configured
    /// deadline, close the queues, and reset the instance map.
    pub async fn shutdown(&self) -> Result<(), CoreError> {
        self.broker.shutdown(self.config.drain_deadline).await?;
        self.started.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Create a job for the issue and seed the planning queue. Returns the
    /// fresh job id; the pipeline runs asynchronously from here.
    pub async fn create_job(&self, issue: NewJobRequest) -> Result<String, CoreError> {
        let job_id = uuid::Uuid::new_v4().to_string();
        let metadata = serde_json::json!({
            "issue": {
                "number": issue.issue_number,
                "title": issue.issue_title,
                "body": issue.issue_body,
                "url": issue.issue_url,
            }
        });
        let job = self
            .store
            .insert_job(&job_id, &issue.repository_id, metadata)
            .await?;

        let payload = serde_json::to_value(PlanningPayload {
            kind: "queued".to_string(),
            issue_title: issue.issue_title,
            issue_body: issue.issue_body,
            issue_url: issue.issue_url,
        })?;
        self.broker.enqueue(
            QUEUE_PLANNING,
            QueueMessage::for_job(
                &job.id,
                &job.tenant_id,
                &job.repository_id,
                issue.issue_number,
                payload,
            ),
        )?;
        tracing::info!(
            job_id = %job.id,
            issue_number = issue.issue_number,
            "job created and queued for planning"
        );
        Ok(job.id)
    }

    /// Drive an event through the state machine for a job.
    pub async fn transition(
        &self,
        job_id: &str,
        event: JobEvent,
        error_details: Option<String>,
    ) -> Result<JobStatus, CoreError> {
        self.store.transition_job(job_id, event, error_details).await
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<Job>, CoreError> {
        self.store.get_job(job_id).await
    }

    pub async fn current_status(&self, job_id: &str) -> Result<JobStatus, CoreError> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| CoreError::JobNotFound {
                id: job_id.to_string(),
            })?;
        Ok(job.status)
    }

    pub async fn list_jobs(&self) -> Result<Vec<Job>, CoreError> {
        self.store.list_jobs().await
    }

    /// External cancellation: drives the CANCEL event. Valid from any
    /// pre-PR, non-terminal state; workers in progress will observe the
    /// terminal state and abandon.
    pub async fn cancel_job(&self, job_id: &str) -> Result<JobStatus, CoreError> {
        self.transition(job_id, JobEvent::Cancel, None).await
    }

    /// The recorded transition sequence for a job, oldest first.
    pub async fn job_history(&self, job_id: &str) -> Result<Vec<JobTransition>, CoreError> {
        self.store.job_history(job_id).await
    }
}
