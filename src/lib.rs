//! Patchflow — autonomous code-change orchestration core.
//!
//! ## Overview
//!
//! Given a reference to an external issue (owner, repository, issue number,
//! title, body), the core drives it through a fixed pipeline of AI-mediated
//! stages — plan → code → review → open pull request — and records the
//! outcome on a durable job row. The AI implementations, the platform API
//! client, webhook ingestion, and the HTTP surface are all external
//! collaborators; the core owns the state machine, the queueing pipeline,
//! the multi-tenant storage discipline, and the agent contract.
//!
//! ## Module Map
//!
//! | Module         | Responsibility                                        |
//! |----------------|-------------------------------------------------------|
//! | `state`        | Job state machine: states, events, transition relation |
//! | `scope`        | Task-local tenant scope (`run_with` / `current`)       |
//! | `models`       | Row types: `Plan`, `Tenant`, `Repository`, `Job`       |
//! | `db`           | Raw SQLite client + async `DbHandle`, migrations       |
//! | `store`        | Tenant-aware client: auto-filter / auto-inject         |
//! | `queue`        | Named FIFO queues: retry, backoff, retention, dedup    |
//! | `agent`        | `Agent` capability set `{plan, code, review}` + mock   |
//! | `pr`           | Pull-request-opening collaborator boundary + mock      |
//! | `worker`       | The four stage consumers                               |
//! | `orchestrator` | Producer, inbound surface, lifecycle                   |
//! | `error`        | `CoreError` taxonomy                                   |
//!
//! ## Typical Flow
//!
//! 1. Register a tenant through the raw client (`db::Db::create_tenant`)
//!    and its repositories through the tenant-aware client under a scope.
//! 2. `Orchestrator::start()` attaches one consumer per stage queue.
//! 3. Under `scope::run_with`, `create_job(...)` inserts a `QUEUED` row and
//!    seeds the `planning` queue with the job id as message id.
//! 4. Each worker invokes its agent capability, fires the stage's exit
//!    event through the transactional transition engine, and forwards the
//!    job to the next queue. Review rejections re-enter coding up to a
//!    bounded attempt budget.
//! 5. The pr-open worker invokes the pull-request collaborator and drives
//!    the job to `COMPLETED`; failures land in `FAILED` with the error
//!    summary in the job's metadata.

pub mod agent;
pub mod db;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod pr;
pub mod queue;
pub mod scope;
pub mod state;
pub mod store;
mod worker;

pub use agent::{Agent, JobContext, MockAgent, MockAgentConfig};
pub use db::{Db, DbHandle};
pub use error::CoreError;
pub use orchestrator::{NewJobRequest, Orchestrator, OrchestratorConfig};
pub use pr::{MockPullRequestOpener, PullRequest, PullRequestOpener};
pub use queue::{Broker, QueueConfig, QueueMessage};
pub use scope::TenantScope;
pub use state::{JobEvent, JobStatus};
pub use store::TenantDb;
pub use worker::{CodingPayload, PlanningPayload, PrOpenPayload, ReviewingPayload};
