//! Task handler registry
//!
//! Handlers are registered by task kind name at startup. A task whose kind
//! has no handler fails terminally.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::entities::task::TaskRecord;
use crate::domain::errors::{DispatchError, DispatchResult};

#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Execute one attempt. The orchestrator decides retry vs terminal.
    async fn run(&self, task: &TaskRecord) -> DispatchResult<()>;

    /// Called after a retry has been scheduled for `task`
    async fn on_retry_scheduled(
        &self,
        _task: &TaskRecord,
        _error: &DispatchError,
        _next_run_at: DateTime<Utc>,
    ) {
    }

    /// Called once when the task ends in failure (out of attempts, not
    /// retryable, or cancelled)
    async fn on_exhausted(&self, _task: &TaskRecord, _error: &DispatchError) {}
}

#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<&'static str, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: &'static str, handler: Arc<dyn TaskHandler>) {
        if self.handlers.insert(kind, handler).is_some() {
            tracing::warn!("Replaced task handler for '{}'", kind);
        }
    }

    pub fn with(mut self, kind: &'static str, handler: Arc<dyn TaskHandler>) -> Self {
        self.register(kind, handler);
        self
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(kind).cloned()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<_> = self.handlers.keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl TaskHandler for Noop {
        async fn run(&self, _task: &TaskRecord) -> DispatchResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = HandlerRegistry::new()
            .with("process_webhook", Arc::new(Noop))
            .with("health_check", Arc::new(Noop));
        assert!(registry.get("process_webhook").is_some());
        assert!(registry.get("execute_order").is_none());
        assert_eq!(registry.kinds(), vec!["health_check", "process_webhook"]);
    }
}
