//! Orchestrator task records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Independent queue with its own workers and retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    WebhookProcessing,
    OrderExecution,
    HealthChecks,
    Maintenance,
}

impl Lane {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lane::WebhookProcessing => "webhook_processing",
            Lane::OrderExecution => "order_execution",
            Lane::HealthChecks => "health_checks",
            Lane::Maintenance => "maintenance",
        }
    }

    pub fn all() -> [Lane; 4] {
        [
            Lane::WebhookProcessing,
            Lane::OrderExecution,
            Lane::HealthChecks,
            Lane::Maintenance,
        ]
    }
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Lane {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "webhook_processing" | "webhooks" => Ok(Lane::WebhookProcessing),
            "order_execution" | "orders" => Ok(Lane::OrderExecution),
            "health_checks" | "health" => Ok(Lane::HealthChecks),
            "maintenance" => Ok(Lane::Maintenance),
            other => Err(format!("Unknown lane: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failure,
    Retrying,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Failure => "failure",
            TaskStatus::Retrying => "retrying",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failure)
    }

    /// Waiting to be claimed by a worker
    pub fn is_queued(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Retrying)
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "success" => Ok(TaskStatus::Success),
            "failure" => Ok(TaskStatus::Failure),
            "retrying" => Ok(TaskStatus::Retrying),
            other => Err(format!("Unknown task status: {}", other)),
        }
    }
}

/// Unit of work and its payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKind {
    ProcessWebhook { delivery_id: i64 },
    ExecuteOrder { order_id: i64 },
    HealthCheck { account_id: i64 },
    PurgeDeliveries { older_than_days: i64 },
    ReclaimLeases,
}

impl TaskKind {
    /// Registry key of the handler for this kind
    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::ProcessWebhook { .. } => "process_webhook",
            TaskKind::ExecuteOrder { .. } => "execute_order",
            TaskKind::HealthCheck { .. } => "health_check",
            TaskKind::PurgeDeliveries { .. } => "purge_deliveries",
            TaskKind::ReclaimLeases => "reclaim_leases",
        }
    }

    pub fn default_lane(&self) -> Lane {
        match self {
            TaskKind::ProcessWebhook { .. } => Lane::WebhookProcessing,
            TaskKind::ExecuteOrder { .. } => Lane::OrderExecution,
            TaskKind::HealthCheck { .. } => Lane::HealthChecks,
            TaskKind::PurgeDeliveries { .. } | TaskKind::ReclaimLeases => Lane::Maintenance,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub lane: Lane,
    pub kind: TaskKind,
    pub priority: i32,
    pub status: TaskStatus,
    /// Executions started so far
    pub attempts: u32,
    pub max_attempts: u32,
    pub next_run_at: DateTime<Utc>,
    pub lease_owner: Option<String>,
    pub lease_token: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    pub fn new(lane: Lane, kind: TaskKind, priority: i32, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            lane,
            kind,
            priority,
            status: TaskStatus::Pending,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            next_run_at: now,
            lease_owner: None,
            lease_token: None,
            lease_expires_at: None,
            cancel_requested: false,
            last_error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// True when `token` is the lease currently held on this task
    pub fn holds_lease(&self, token: &str) -> bool {
        self.status == TaskStatus::Running && self.lease_token.as_deref() == Some(token)
    }
}
