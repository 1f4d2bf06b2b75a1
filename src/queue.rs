//! In-process queue substrate.
//!
//! A named set of FIFO queues with at-least-once delivery: handlers may see
//! a message more than once and must be idempotent keyed by job id. Failed
//! deliveries are retried with exponential backoff up to a configured
//! attempt budget, then parked in the failed pool. Completed and failed
//! deliveries are retained for inspection with age and count bounds.
//!
//! Queues are constructed lazily on first use, never at load time, so a
//! broker can be created long before anything runs. Graceful shutdown
//! drains in-flight handlers up to a deadline, then resets the instance
//! map; a subsequent subscribe starts from fresh instances.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::CoreError;

/// Literal queue names, one per pipeline stage.
pub const QUEUE_PLANNING: &str = "planning";
pub const QUEUE_CODING: &str = "coding";
pub const QUEUE_REVIEWING: &str = "reviewing";
pub const QUEUE_PR_OPEN: &str = "pr-open";

/// A message carried between stages. The job row in storage is the source
/// of truth; the message carries only a reference plus stage-local payload.
///
/// `id` doubles as the dedup key. Stage forwards set it to the job id, so a
/// crashed worker re-enqueueing the same hop cannot create duplicates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMessage {
    pub id: String,
    pub job_id: String,
    pub tenant_id: String,
    pub repository_id: String,
    pub issue_number: i64,
    pub payload: serde_json::Value,
    /// Zero-based delivery attempt, bumped by the retry path.
    #[serde(default)]
    pub attempt: u32,
}

impl QueueMessage {
    /// A stage-forward message for `job_id`, with the message id equal to
    /// the job id.
    pub fn for_job(
        job_id: &str,
        tenant_id: &str,
        repository_id: &str,
        issue_number: i64,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: job_id.to_string(),
            job_id: job_id.to_string(),
            tenant_id: tenant_id.to_string(),
            repository_id: repository_id.to_string(),
            issue_number,
            payload,
            attempt: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// A message is delivered at most this many times before it is parked
    /// in the failed pool.
    pub max_attempts: u32,
    /// Backoff before the first retry; doubles per subsequent retry.
    pub initial_backoff: Duration,
    /// Handlers running in parallel per queue.
    pub concurrency: usize,
    /// Dispatches per second per queue.
    pub rate_limit_per_sec: u32,
    pub completed_retention: Duration,
    pub completed_max: usize,
    pub failed_retention: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(2),
            concurrency: 5,
            rate_limit_per_sec: 10,
            completed_retention: Duration::from_secs(24 * 60 * 60),
            completed_max: 1000,
            failed_retention: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

/// Stage consumers implement this; the broker invokes it once per delivery.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: QueueMessage) -> anyhow::Result<()>;
}

/// A delivery that exhausted its attempt budget.
#[derive(Debug, Clone)]
pub struct FailedDelivery {
    pub message: QueueMessage,
    pub error: String,
    failed_at: Instant,
}

#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub pending: usize,
    pub in_flight: usize,
    pub completed: usize,
    pub failed: usize,
    pub delivered: u64,
    pub retried: u64,
}

struct QueueState {
    pending: HashSet<String>,
    completed: VecDeque<(String, Instant)>,
    failed: VecDeque<FailedDelivery>,
    delivered: u64,
    retried: u64,
}

pub struct Queue {
    name: String,
    config: QueueConfig,
    tx: mpsc::UnboundedSender<QueueMessage>,
    rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<QueueMessage>>>,
    semaphore: Arc<Semaphore>,
    state: std::sync::Mutex<QueueState>,
}

impl Queue {
    fn new(name: &str, config: QueueConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let semaphore = Arc::new(Semaphore::new(config.concurrency));
        Self {
            name: name.to_string(),
            config,
            tx,
            rx: std::sync::Mutex::new(Some(rx)),
            semaphore,
            state: std::sync::Mutex::new(QueueState {
                pending: HashSet::new(),
                completed: VecDeque::new(),
                failed: VecDeque::new(),
                delivered: 0,
                retried: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, QueueState>, CoreError> {
        self.state.lock().map_err(|_| CoreError::LockPoisoned)
    }

    /// Enqueue a message. Returns `false` when a message with the same id
    /// is already pending or in flight (the enqueue is collapsed).
    pub fn enqueue(&self, message: QueueMessage) -> Result<bool, CoreError> {
        {
            let mut state = self.lock_state()?;
            if state.pending.contains(&message.id) {
                tracing::debug!(
                    queue = %self.name,
                    message_id = %message.id,
                    "duplicate enqueue collapsed"
                );
                return Ok(false);
            }
            state.pending.insert(message.id.clone());
        }
        self.tx
            .send(message)
            .map_err(|_| CoreError::Queue(format!("queue {} is closed", self.name)))?;
        Ok(true)
    }

    pub fn stats(&self) -> Result<QueueStats, CoreError> {
        let state = self.lock_state()?;
        Ok(QueueStats {
            pending: state.pending.len(),
            in_flight: self.config.concurrency - self.semaphore.available_permits(),
            completed: state.completed.len(),
            failed: state.failed.len(),
            delivered: state.delivered,
            retried: state.retried,
        })
    }

    pub fn failed_deliveries(&self) -> Result<Vec<FailedDelivery>, CoreError> {
        let state = self.lock_state()?;
        Ok(state.failed.iter().cloned().collect())
    }

    async fn run_consumer(
        self: Arc<Self>,
        handler: Arc<dyn MessageHandler>,
        mut rx: mpsc::UnboundedReceiver<QueueMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let gap = Duration::from_secs_f64(1.0 / self.config.rate_limit_per_sec.max(1) as f64);
        let mut next_slot = Instant::now();

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                received = rx.recv() => {
                    let Some(message) = received else { break };
                    tokio::time::sleep_until(next_slot).await;
                    next_slot = Instant::now() + gap;
                    let Ok(permit) = self.semaphore.clone().acquire_owned().await else {
                        break;
                    };
                    let queue = Arc::clone(&self);
                    let handler = Arc::clone(&handler);
                    tokio::spawn(async move {
                        let _permit = permit;
                        if let Err(error) = queue.deliver(handler, message).await {
                            tracing::error!(error = %error, "delivery bookkeeping failed");
                        }
                    });
                }
            }
        }
        tracing::debug!(queue = %self.name, "consumer stopped");
    }

    async fn deliver(
        self: Arc<Self>,
        handler: Arc<dyn MessageHandler>,
        message: QueueMessage,
    ) -> Result<(), CoreError> {
        {
            let mut state = self.lock_state()?;
            state.delivered += 1;
        }
        match handler.handle(message.clone()).await {
            Ok(()) => {
                let mut state = self.lock_state()?;
                state.pending.remove(&message.id);
                state.completed.push_back((message.id.clone(), Instant::now()));
                prune_completed(&mut state, &self.config);
            }
            Err(error) => {
                if message.attempt + 1 < self.config.max_attempts {
                    let backoff = self.config.initial_backoff * 2u32.pow(message.attempt);
                    tracing::warn!(
                        queue = %self.name,
                        message_id = %message.id,
                        attempt = message.attempt + 1,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %format!("{error:#}"),
                        "handler failed, scheduling retry"
                    );
                    {
                        let mut state = self.lock_state()?;
                        state.retried += 1;
                    }
                    let queue = Arc::clone(&self);
                    let mut retry = message;
                    retry.attempt += 1;
                    tokio::spawn(async move {
                        tokio::time::sleep(backoff).await;
                        // The id is still in the pending set, so this cannot
                        // race a fresh enqueue of the same job.
                        let _ = queue.tx.send(retry);
                    });
                } else {
                    tracing::error!(
                        queue = %self.name,
                        message_id = %message.id,
                        attempts = message.attempt + 1,
                        error = %format!("{error:#}"),
                        "attempt budget exhausted, moving to failed pool"
                    );
                    let mut state = self.lock_state()?;
                    state.pending.remove(&message.id);
                    state.failed.push_back(FailedDelivery {
                        message,
                        error: format!("{error:#}"),
                        failed_at: Instant::now(),
                    });
                    prune_failed(&mut state, &self.config);
                }
            }
        }
        Ok(())
    }
}

fn prune_completed(state: &mut QueueState, config: &QueueConfig) {
    while state.completed.len() > config.completed_max {
        state.completed.pop_front();
    }
    let now = Instant::now();
    while let Some((_, at)) = state.completed.front() {
        if now.duration_since(*at) > config.completed_retention {
            state.completed.pop_front();
        } else {
            break;
        }
    }
}

fn prune_failed(state: &mut QueueState, config: &QueueConfig) {
    let now = Instant::now();
    while let Some(front) = state.failed.front() {
        if now.duration_since(front.failed_at) > config.failed_retention {
            state.failed.pop_front();
        } else {
            break;
        }
    }
}

struct BrokerInner {
    queues: HashMap<String, Arc<Queue>>,
    consumers: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
}

/// The process-wide set of queue instances.
pub struct Broker {
    config: QueueConfig,
    inner: std::sync::Mutex<BrokerInner>,
}

impl Broker {
    pub fn new(config: QueueConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            inner: std::sync::Mutex::new(BrokerInner {
                queues: HashMap::new(),
                consumers: Vec::new(),
                shutdown_tx,
            }),
        }
    }

    fn lock_inner(&self) -> Result<std::sync::MutexGuard<'_, BrokerInner>, CoreError> {
        self.inner.lock().map_err(|_| CoreError::LockPoisoned)
    }

    /// The queue named `name`, constructed on first use.
    pub fn queue(&self, name: &str) -> Result<Arc<Queue>, CoreError> {
        let mut inner = self.lock_inner()?;
        if let Some(queue) = inner.queues.get(name) {
            return Ok(Arc::clone(queue));
        }
        let queue = Arc::new(Queue::new(name, self.config.clone()));
        inner.queues.insert(name.to_string(), Arc::clone(&queue));
        tracing::debug!(queue = name, "queue instance created");
        Ok(queue)
    }

    /// Attach a consumer to `name`. Each queue accepts exactly one consumer
    /// per lifecycle.
    pub fn subscribe(
        &self,
        name: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), CoreError> {
        let queue = self.queue(name)?;
        let rx = queue
            .rx
            .lock()
            .map_err(|_| CoreError::LockPoisoned)?
            .take()
            .ok_or_else(|| {
                CoreError::Queue(format!("queue {} already has a consumer", name))
            })?;
        let mut inner = self.lock_inner()?;
        let shutdown_rx = inner.shutdown_tx.subscribe();
        inner
            .consumers
            .push(tokio::spawn(queue.run_consumer(handler, rx, shutdown_rx)));
        Ok(())
    }

    /// Enqueue onto the named queue (creating it if needed). Returns `false`
    /// when the enqueue was collapsed by message-id dedup.
    pub fn enqueue(&self, name: &str, message: QueueMessage) -> Result<bool, CoreError> {
        self.queue(name)?.enqueue(message)
    }

    pub fn stats(&self, name: &str) -> Result<Option<QueueStats>, CoreError> {
        let queue = {
            let inner = self.lock_inner()?;
            inner.queues.get(name).map(Arc::clone)
        };
        match queue {
            Some(queue) => Ok(Some(queue.stats()?)),
            None => Ok(None),
        }
    }

    pub fn queue_names(&self) -> Result<Vec<String>, CoreError> {
        let inner = self.lock_inner()?;
        Ok(inner.queues.keys().cloned().collect())
    }

    /// Graceful shutdown: stop consumers, wait for in-flight handlers up to
    /// `drain_deadline`, then reset the instance map so a subsequent start
    /// returns fresh instances.
    pub async fn shutdown(&self, drain_deadline: Duration) -> Result<(), CoreError> {
        let (queues, consumers) = {
            let mut inner = self.lock_inner()?;
            let _ = inner.shutdown_tx.send(true);
            (
                inner.queues.clone(),
                std::mem::take(&mut inner.consumers),
            )
        };

        for consumer in consumers {
            let _ = consumer.await;
        }

        let deadline = Instant::now() + drain_deadline;
        for queue in queues.values() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(
                remaining,
                queue.semaphore.acquire_many(queue.config.concurrency as u32),
            )
            .await
            {
                Ok(_) => {}
                Err(_) => tracing::warn!(
                    queue = %queue.name,
                    "drain deadline expired with handlers still in flight"
                ),
            }
        }

        let mut inner = self.lock_inner()?;
        inner.queues.clear();
        let (shutdown_tx, _) = watch::channel(false);
        inner.shutdown_tx = shutdown_tx;
        tracing::info!("queue broker shut down");
        Ok(())
    }
}
