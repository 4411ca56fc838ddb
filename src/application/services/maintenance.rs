//! Housekeeping tasks: purge old deliveries and finished tasks, reclaim
//! expired leases.
//!
//! Reclaimed tasks go through the same `on_retry_scheduled` / `on_exhausted`
//! hooks a worker would have called, so their deliveries and orders follow.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::info;

use crate::application::orchestrator::{HandlerRegistry, TaskHandler, CANCELLED};
use crate::domain::entities::task::{TaskKind, TaskRecord, TaskStatus};
use crate::domain::errors::{DispatchError, DispatchResult};
use crate::domain::repositories::store::Store;

pub struct Maintenance {
    store: Arc<dyn Store>,
    /// Handlers of the kinds whose leases may be reclaimed
    hooks: HandlerRegistry,
}

impl Maintenance {
    pub fn new(store: Arc<dyn Store>, hooks: HandlerRegistry) -> Self {
        Self { store, hooks }
    }

    /// Delete finished deliveries and tasks older than `older_than_days`
    pub async fn purge(&self, older_than_days: i64) -> DispatchResult<(u64, u64)> {
        if older_than_days < 1 {
            return Err(DispatchError::ValidationFailure(format!(
                "retention must be at least one day, got {}",
                older_than_days
            )));
        }
        let cutoff = Utc::now() - Duration::days(older_than_days);
        let deliveries = self.store.purge_deliveries_before(cutoff).await?;
        let tasks = self.store.purge_finished_tasks(cutoff).await?;
        info!(deliveries, tasks, older_than_days, "Purged old records");
        Ok((deliveries, tasks))
    }

    pub async fn reclaim_leases(&self) -> DispatchResult<u64> {
        let reclaimed = self.store.reclaim_expired_leases(Utc::now()).await?;
        for task in &reclaimed {
            let Some(handler) = self.hooks.get(task.kind.name()) else {
                continue;
            };
            let error = if task.cancel_requested {
                DispatchError::InternalFailure(CANCELLED.into())
            } else {
                DispatchError::InternalFailure("lease expired".into())
            };
            match task.status {
                TaskStatus::Retrying => {
                    handler.on_retry_scheduled(task, &error, task.next_run_at).await
                }
                TaskStatus::Failure => handler.on_exhausted(task, &error).await,
                _ => {}
            }
        }
        if !reclaimed.is_empty() {
            info!(reclaimed = reclaimed.len(), "Reclaimed expired task leases");
        }
        Ok(reclaimed.len() as u64)
    }
}

#[async_trait]
impl TaskHandler for Maintenance {
    async fn run(&self, task: &TaskRecord) -> DispatchResult<()> {
        match task.kind {
            TaskKind::PurgeDeliveries { older_than_days } => self.purge(older_than_days).await.map(|_| ()),
            TaskKind::ReclaimLeases => self.reclaim_leases().await.map(|_| ()),
            ref other => Err(DispatchError::ValidationFailure(format!(
                "maintenance cannot run '{}'",
                other.name()
            ))),
        }
    }
}
