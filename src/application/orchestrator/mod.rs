//! Dispatch / retry orchestrator
//!
//! Tasks live in a [`TaskStore`] so queued work survives a restart. Each lane
//! runs `concurrency` worker tasks that claim due work with a lease, execute
//! the registered handler and then either finish the task, schedule a retry
//! through `next_run_at`, or fail it. Workers never sleep out a backoff; idle
//! workers wait on the lane's `Notify` or the poll interval.

pub mod lane;
pub mod registry;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::domain::entities::task::{Lane, TaskKind, TaskRecord, TaskStatus};
use crate::domain::errors::{DispatchError, DispatchResult};
use crate::domain::repositories::store::{CancelOutcome, TaskStore};

pub use lane::{Backoff, LanePolicies, LanePolicy};
pub use registry::{HandlerRegistry, TaskHandler};

pub const CANCELLED: &str = "cancelled";

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub lanes: LanePolicies,
    /// How long a claimed task stays leased to its worker
    pub lease_duration: Duration,
    pub poll_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            lanes: LanePolicies::default(),
            lease_duration: Duration::from_secs(300),
            poll_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Busy,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerInfo {
    pub worker_id: String,
    pub lane: Lane,
    pub state: WorkerState,
    pub current_task: Option<String>,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub last_heartbeat: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct LaneStats {
    pub pending: i64,
    pub running: i64,
    pub retrying: i64,
    pub success: i64,
    pub failure: i64,
    pub workers: usize,
}

pub struct Orchestrator {
    store: Arc<dyn TaskStore>,
    registry: HandlerRegistry,
    config: OrchestratorConfig,
    notifiers: HashMap<Lane, Arc<Notify>>,
    workers: Mutex<HashMap<String, WorkerInfo>>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: HandlerRegistry,
        config: OrchestratorConfig,
    ) -> Self {
        let notifiers = Lane::all()
            .into_iter()
            .map(|lane| (lane, Arc::new(Notify::new())))
            .collect();
        Self {
            store,
            registry,
            config,
            notifiers,
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self, lane: Lane) -> LanePolicy {
        self.config.lanes.get(lane)
    }

    fn notify(&self, lane: Lane) {
        if let Some(n) = self.notifiers.get(&lane) {
            n.notify_one();
        }
    }

    /// Queue `kind` on its default lane
    pub async fn enqueue(&self, kind: TaskKind, priority: Option<i32>) -> DispatchResult<String> {
        let lane = kind.default_lane();
        self.enqueue_on(lane, kind, priority).await
    }

    pub async fn enqueue_on(
        &self,
        lane: Lane,
        kind: TaskKind,
        priority: Option<i32>,
    ) -> DispatchResult<String> {
        let policy = self.policy(lane);
        let task = TaskRecord::new(
            lane,
            kind,
            priority.unwrap_or(policy.priority),
            policy.max_attempts(),
        );
        self.store.insert_task(&task).await?;
        debug!(
            task_id = %task.id,
            lane = %lane,
            kind = task.kind.name(),
            priority = task.priority,
            "Task enqueued"
        );
        self.notify(lane);
        Ok(task.id)
    }

    pub async fn status(&self, task_id: &str) -> DispatchResult<Option<TaskStatus>> {
        Ok(self.store.get_task(task_id).await?.map(|t| t.status))
    }

    pub async fn task(&self, task_id: &str) -> DispatchResult<Option<TaskRecord>> {
        Ok(self.store.get_task(task_id).await?)
    }

    /// Queued tasks fail immediately; running tasks are flagged and will not
    /// be retried. Returns false for unknown or finished tasks.
    pub async fn cancel(&self, task_id: &str) -> DispatchResult<bool> {
        match self.store.cancel_task(task_id, Utc::now()).await? {
            CancelOutcome::Cancelled => {
                info!(task_id, "Task cancelled");
                if let Some(task) = self.store.get_task(task_id).await? {
                    if let Some(handler) = self.registry.get(task.kind.name()) {
                        handler
                            .on_exhausted(&task, &DispatchError::InternalFailure(CANCELLED.into()))
                            .await;
                    }
                }
                Ok(true)
            }
            CancelOutcome::Flagged => {
                info!(task_id, "Running task flagged for cancellation");
                Ok(true)
            }
            CancelOutcome::AlreadyFinished | CancelOutcome::NotFound => Ok(false),
        }
    }

    /// Run a failed or waiting task again as soon as a worker is free.
    /// A failed task is granted one more attempt.
    pub async fn retry(&self, task_id: &str) -> DispatchResult<bool> {
        let Some(mut task) = self.store.get_task(task_id).await? else {
            return Ok(false);
        };
        let now = Utc::now();
        match task.status {
            TaskStatus::Failure => {
                task.status = TaskStatus::Retrying;
                task.max_attempts = task.max_attempts.max(task.attempts + 1);
                task.cancel_requested = false;
                task.finished_at = None;
            }
            TaskStatus::Pending | TaskStatus::Retrying => {}
            TaskStatus::Running | TaskStatus::Success => return Ok(false),
        }
        task.next_run_at = now;
        task.updated_at = now;
        self.store.update_task(&task).await?;
        info!(task_id, lane = %task.lane, "Task requeued manually");
        self.notify(task.lane);
        Ok(true)
    }

    /// Drop every queued task of `lane`
    pub async fn purge(&self, lane: Lane) -> DispatchResult<u64> {
        let purged = self.store.purge_lane(lane).await?;
        if purged > 0 {
            warn!(lane = %lane, purged, "Purged queued tasks");
        }
        Ok(purged)
    }

    pub async fn queue_stats(&self) -> DispatchResult<HashMap<Lane, LaneStats>> {
        let mut stats: HashMap<Lane, LaneStats> = Lane::all()
            .into_iter()
            .map(|lane| (lane, LaneStats::default()))
            .collect();

        for row in self.store.task_counts().await? {
            let entry = stats.entry(row.lane).or_default();
            match row.status {
                TaskStatus::Pending => entry.pending += row.count,
                TaskStatus::Running => entry.running += row.count,
                TaskStatus::Retrying => entry.retrying += row.count,
                TaskStatus::Success => entry.success += row.count,
                TaskStatus::Failure => entry.failure += row.count,
            }
        }
        for worker in self.worker_health() {
            if worker.state != WorkerState::Stopped {
                stats.entry(worker.lane).or_default().workers += 1;
            }
        }
        Ok(stats)
    }

    pub fn worker_health(&self) -> Vec<WorkerInfo> {
        let workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<WorkerInfo> = workers.values().cloned().collect();
        list.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        list
    }

    fn update_worker(&self, worker_id: &str, lane: Lane, f: impl FnOnce(&mut WorkerInfo)) {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        let info = workers
            .entry(worker_id.to_string())
            .or_insert_with(|| WorkerInfo {
                worker_id: worker_id.to_string(),
                lane,
                state: WorkerState::Idle,
                current_task: None,
                tasks_succeeded: 0,
                tasks_failed: 0,
                last_heartbeat: Utc::now(),
            });
        f(info);
        info.last_heartbeat = Utc::now();
    }

    /// Claim and execute one due task of `lane`. Returns the task as written
    /// back, or `None` when nothing was due or the lease was lost.
    pub async fn run_once(&self, lane: Lane, worker_id: &str) -> DispatchResult<Option<TaskRecord>> {
        let now = Utc::now();
        let lease = chrono::Duration::from_std(self.config.lease_duration)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        let Some(mut task) = self
            .store
            .claim_next_task(lane, worker_id, now + lease, now)
            .await?
        else {
            return Ok(None);
        };
        let token = task.lease_token.clone().unwrap_or_default();

        self.update_worker(worker_id, lane, |w| {
            w.state = WorkerState::Busy;
            w.current_task = Some(task.id.clone());
        });
        debug!(
            task_id = %task.id,
            kind = task.kind.name(),
            attempt = task.attempts,
            max_attempts = task.max_attempts,
            "Task claimed"
        );

        let handler = self.registry.get(task.kind.name());
        let result = match &handler {
            Some(handler) => handler.run(&task).await,
            None => Err(DispatchError::ValidationFailure(format!(
                "no handler registered for '{}'",
                task.kind.name()
            ))),
        };

        let finished = Utc::now();
        task.lease_owner = None;
        task.lease_token = None;
        task.lease_expires_at = None;
        task.updated_at = finished;

        let failure = match result {
            Ok(()) => {
                task.status = TaskStatus::Success;
                task.last_error = None;
                task.finished_at = Some(finished);
                None
            }
            Err(err) => {
                // Cancel may have been requested while the handler ran
                let cancel_requested = self
                    .store
                    .get_task(&task.id)
                    .await?
                    .map(|t| t.cancel_requested)
                    .unwrap_or(false);

                if cancel_requested {
                    task.status = TaskStatus::Failure;
                    task.cancel_requested = true;
                    task.last_error = Some(CANCELLED.to_string());
                    task.finished_at = Some(finished);
                } else if err.is_retryable() && task.attempts_left() {
                    let delay = self.policy(lane).backoff.chrono_delay(task.attempts);
                    task.status = TaskStatus::Retrying;
                    task.next_run_at = finished + delay;
                    task.last_error = Some(err.to_string());
                } else {
                    task.status = TaskStatus::Failure;
                    task.last_error = Some(err.to_string());
                    task.finished_at = Some(finished);
                }
                Some(err)
            }
        };

        let applied = self.store.update_task_if_leased(&task, &token).await?;
        self.update_worker(worker_id, lane, |w| {
            w.state = WorkerState::Idle;
            w.current_task = None;
            if failure.is_none() {
                w.tasks_succeeded += 1;
            } else {
                w.tasks_failed += 1;
            }
        });
        if !applied {
            warn!(task_id = %task.id, worker_id, "Lease lost before completion, result discarded");
            return Ok(None);
        }

        match (&failure, task.status) {
            (None, _) => {
                info!(task_id = %task.id, kind = task.kind.name(), attempt = task.attempts, "Task succeeded");
            }
            (Some(err), TaskStatus::Retrying) => {
                warn!(
                    task_id = %task.id,
                    kind = task.kind.name(),
                    attempt = task.attempts,
                    next_run_at = %task.next_run_at,
                    error = %err,
                    "Task failed, retry scheduled"
                );
                if let Some(handler) = &handler {
                    handler.on_retry_scheduled(&task, err, task.next_run_at).await;
                }
            }
            (Some(err), _) => {
                error!(
                    task_id = %task.id,
                    kind = task.kind.name(),
                    attempts = task.attempts,
                    error = %err,
                    "Task failed permanently"
                );
                if let Some(handler) = &handler {
                    let reported = if task.cancel_requested {
                        DispatchError::InternalFailure(CANCELLED.into())
                    } else {
                        err.clone()
                    };
                    handler.on_exhausted(&task, &reported).await;
                }
            }
        }
        Ok(Some(task))
    }

    /// Start every lane's workers. They exit after their current task once
    /// `shutdown` flips to true.
    pub fn spawn_workers(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for lane in Lane::all() {
            let policy = self.policy(lane);
            for n in 0..policy.concurrency.max(1) {
                let worker_id = format!("{}-{}", lane.as_str(), n);
                self.update_worker(&worker_id, lane, |w| w.state = WorkerState::Idle);
                let this = Arc::clone(self);
                let shutdown = shutdown.clone();
                handles.push(tokio::spawn(async move {
                    this.worker_loop(lane, worker_id, shutdown).await;
                }));
            }
        }
        info!("Started {} orchestrator workers", handles.len());
        handles
    }

    async fn worker_loop(&self, lane: Lane, worker_id: String, mut shutdown: watch::Receiver<bool>) {
        let notify = self
            .notifiers
            .get(&lane)
            .cloned()
            .unwrap_or_else(|| Arc::new(Notify::new()));

        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.run_once(lane, &worker_id).await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => error!(worker_id = %worker_id, "Worker iteration failed: {}", e),
            }

            tokio::select! {
                _ = notify.notified() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.update_worker(&worker_id, lane, |w| {
            w.state = WorkerState::Stopped;
            w.current_task = None;
        });
        debug!(worker_id = %worker_id, "Worker stopped");
    }
}
