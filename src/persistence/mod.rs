//! Persistence Layer
//!
//! Durable storage for webhooks, deliveries, orders, exchange accounts and
//! orchestrator tasks. Uses SQLite with async operations via sqlx; an in-memory
//! implementation of the same traits lives in [`memory`].
//!
//! # Database Schema
//!
//! ## webhooks
//! Inbound endpoints keyed by unique `url_path`, with default trading parameters
//! and delivery counters.
//!
//! ## webhook_deliveries
//! One row per inbound alert. Indexed on `(webhook_id, alert_id, created_at)` for
//! the duplicate check.
//!
//! ## orders
//! Exchange orders, unique on `client_order_id`.
//!
//! ## exchange_accounts
//! Encrypted credentials plus health and balance snapshots.
//!
//! ## tasks
//! Orchestrator queue. `kind` holds the JSON payload; leases are
//! `(lease_owner, lease_token, lease_expires_at)`.

pub mod memory;
pub mod models;
pub mod repository;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::ConnectOptions;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

use crate::domain::errors::DispatchError;

/// Database connection pool
pub type DbPool = SqlitePool;

/// Database error
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Database connection error: {0}")]
    ConnectionError(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    MigrationError(String),

    #[error("Query error: {0}")]
    QueryError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Stored value could not be mapped back to a domain type
    #[error("Corrupt record: {0}")]
    Decode(String),
}

impl From<DatabaseError> for DispatchError {
    fn from(err: DatabaseError) -> Self {
        DispatchError::InternalFailure(err.to_string())
    }
}

/// Initialize the database connection pool
///
/// # Arguments
/// - `config`: URL and pool size (e.g. `sqlite://data/dispatch.db`, `sqlite::memory:`)
///
/// # Errors
/// Returns error if database connection fails or migrations fail
pub async fn init_database(config: &DatabaseConfig) -> Result<DbPool, DatabaseError> {
    info!("Initializing database: {}", config.url);

    // Ensure data directory exists
    if let Some(db_path) = config.url.strip_prefix("sqlite://") {
        if let Some(parent) = Path::new(db_path).parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::ConnectionError(sqlx::Error::Configuration(Box::new(e)))
            })?;
        }
    }

    let log_level = if config.log_queries {
        tracing::log::LevelFilter::Debug
    } else {
        tracing::log::LevelFilter::Trace
    };
    let options = SqliteConnectOptions::from_str(&config.url)?
        .create_if_missing(true)
        .log_statements(log_level);

    // Every connection to ":memory:" is a separate database
    let max_connections = if config.url.contains(":memory:") {
        1
    } else {
        config.max_connections
    };

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    run_migrations(&pool).await?;

    info!("✓ Database initialized successfully");

    Ok(pool)
}

const MIGRATIONS: &[(&str, &str)] = &[
    (
        "webhooks",
        r#"
        CREATE TABLE IF NOT EXISTS webhooks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            url_path TEXT NOT NULL UNIQUE,
            secret TEXT,
            status TEXT NOT NULL CHECK(status IN ('active', 'paused', 'disabled', 'error')),
            default_margin REAL,
            default_leverage INTEGER,
            default_stop_loss_pct REAL,
            default_take_profit_pct REAL,
            exchange TEXT,
            environment TEXT,
            total_deliveries INTEGER NOT NULL DEFAULT 0,
            successful_deliveries INTEGER NOT NULL DEFAULT 0,
            failed_deliveries INTEGER NOT NULL DEFAULT 0,
            consecutive_errors INTEGER NOT NULL DEFAULT 0,
            error_threshold INTEGER NOT NULL DEFAULT 5,
            auto_pause_on_errors BOOLEAN NOT NULL DEFAULT 1,
            last_delivery_at DATETIME,
            last_success_at DATETIME,
            created_at DATETIME NOT NULL,
            updated_at DATETIME NOT NULL
        )
        "#,
    ),
    (
        "webhook_deliveries",
        r#"
        CREATE TABLE IF NOT EXISTS webhook_deliveries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            webhook_id INTEGER NOT NULL,
            alert_id TEXT,
            payload TEXT NOT NULL,
            headers TEXT NOT NULL,
            hmac_valid BOOLEAN NOT NULL,
            payload_valid BOOLEAN NOT NULL,
            status TEXT NOT NULL
                CHECK(status IN ('pending', 'processing', 'success', 'failed', 'retrying')),
            retry_count INTEGER NOT NULL DEFAULT 0,
            next_retry_at DATETIME,
            orders_created INTEGER NOT NULL DEFAULT 0,
            orders_executed INTEGER NOT NULL DEFAULT 0,
            orders_failed INTEGER NOT NULL DEFAULT 0,
            processing_duration_ms INTEGER,
            error_message TEXT,
            error_details TEXT,
            task_id TEXT,
            created_at DATETIME NOT NULL,
            processed_at DATETIME,
            updated_at DATETIME NOT NULL,
            FOREIGN KEY (webhook_id) REFERENCES webhooks(id)
        )
        "#,
    ),
    (
        "orders",
        r#"
        CREATE TABLE IF NOT EXISTS orders (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            account_id INTEGER NOT NULL,
            webhook_delivery_id INTEGER,
            client_order_id TEXT NOT NULL UNIQUE,
            exchange_order_id TEXT,
            exchange TEXT NOT NULL,
            symbol TEXT NOT NULL,
            side TEXT NOT NULL CHECK(side IN ('buy', 'sell')),
            order_type TEXT NOT NULL,
            role TEXT NOT NULL,
            quantity REAL NOT NULL,
            price REAL,
            stop_price REAL,
            reduce_only BOOLEAN NOT NULL DEFAULT 0,
            filled_quantity REAL NOT NULL DEFAULT 0.0,
            filled_notional REAL NOT NULL DEFAULT 0.0,
            average_fill_price REAL,
            status TEXT NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            failure_reason TEXT,
            exchange_error_code TEXT,
            created_at DATETIME NOT NULL,
            submitted_at DATETIME,
            updated_at DATETIME NOT NULL,
            FOREIGN KEY (webhook_delivery_id) REFERENCES webhook_deliveries(id)
        )
        "#,
    ),
    (
        "exchange_accounts",
        r#"
        CREATE TABLE IF NOT EXISTS exchange_accounts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            exchange TEXT NOT NULL,
            environment TEXT NOT NULL CHECK(environment IN ('testnet', 'mainnet')),
            api_key_encrypted TEXT NOT NULL,
            api_secret_encrypted TEXT NOT NULL,
            passphrase_encrypted TEXT,
            is_active BOOLEAN NOT NULL DEFAULT 1,
            is_default BOOLEAN NOT NULL DEFAULT 0,
            health_status TEXT NOT NULL DEFAULT 'unknown',
            last_health_check_at DATETIME,
            last_healthy_at DATETIME,
            last_error TEXT,
            available_balance REAL NOT NULL DEFAULT 0.0,
            open_exposure REAL NOT NULL DEFAULT 0.0,
            total_orders INTEGER NOT NULL DEFAULT 0,
            successful_orders INTEGER NOT NULL DEFAULT 0,
            failed_orders INTEGER NOT NULL DEFAULT 0,
            last_used_at DATETIME,
            created_at DATETIME NOT NULL,
            updated_at DATETIME NOT NULL
        )
        "#,
    ),
    (
        "tasks",
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            lane TEXT NOT NULL,
            kind TEXT NOT NULL,
            priority INTEGER NOT NULL,
            status TEXT NOT NULL
                CHECK(status IN ('pending', 'running', 'success', 'failure', 'retrying')),
            attempts INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL,
            next_run_at DATETIME NOT NULL,
            lease_owner TEXT,
            lease_token TEXT,
            lease_expires_at DATETIME,
            cancel_requested BOOLEAN NOT NULL DEFAULT 0,
            last_error TEXT,
            created_at DATETIME NOT NULL,
            updated_at DATETIME NOT NULL,
            started_at DATETIME,
            finished_at DATETIME
        )
        "#,
    ),
];

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_deliveries_alert ON webhook_deliveries(webhook_id, alert_id, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_deliveries_created_at ON webhook_deliveries(created_at)",
    "CREATE INDEX IF NOT EXISTS idx_orders_delivery ON orders(webhook_delivery_id)",
    "CREATE INDEX IF NOT EXISTS idx_accounts_user ON exchange_accounts(user_id)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_claim ON tasks(lane, status, next_run_at)",
];

/// Run database migrations
async fn run_migrations(pool: &DbPool) -> Result<(), DatabaseError> {
    info!("Running database migrations...");

    for (table, ddl) in MIGRATIONS {
        sqlx::query(ddl).execute(pool).await.map_err(|e| {
            DatabaseError::MigrationError(format!("Failed to create {} table: {}", table, e))
        })?;
    }

    for ddl in INDEXES {
        sqlx::query(ddl)
            .execute(pool)
            .await
            .map_err(|e| DatabaseError::MigrationError(format!("Failed to create index: {}", e)))?;
    }

    info!("✓ Database migrations completed successfully");

    Ok(())
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Database URL (e.g., "sqlite://data/dispatch.db"), or "memory" for the
    /// in-memory store
    pub url: String,

    /// Maximum number of connections in the pool
    pub max_connections: u32,

    /// Enable query logging
    pub log_queries: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://data/dispatch.db".to_string(),
            max_connections: 5,
            log_queries: cfg!(debug_assertions),
        }
    }
}

impl DatabaseConfig {
    /// Load from environment variables
    pub fn from_env() -> Self {
        Self::from_env_with(&|name: &str| std::env::var(name).ok())
    }

    pub fn from_env_with<F>(lookup: &F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let url = lookup("DATABASE_URL").unwrap_or(defaults.url);

        let max_connections = lookup("DATABASE_MAX_CONNECTIONS")
            .and_then(|s| s.parse().ok())
            .filter(|n| *n > 0)
            .unwrap_or(defaults.max_connections);

        let log_queries = lookup("DATABASE_LOG_QUERIES")
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.log_queries);

        Self {
            url,
            max_connections,
            log_queries,
        }
    }

    pub fn is_in_memory_store(&self) -> bool {
        self.url == "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_config() -> DatabaseConfig {
        DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            ..DatabaseConfig::default()
        }
    }

    #[tokio::test]
    async fn test_database_init() {
        let pool = init_database(&memory_config()).await;
        assert!(pool.is_ok());
    }

    #[tokio::test]
    async fn test_migrations() {
        let pool = init_database(&memory_config()).await.unwrap();

        let result: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN \
             ('webhooks', 'webhook_deliveries', 'orders', 'exchange_accounts', 'tasks')",
        )
        .fetch_one(&pool)
        .await
        .unwrap();

        assert_eq!(result.0, 5);

        // Idempotent
        run_migrations(&pool).await.unwrap();
    }

    #[test]
    fn test_database_config_default() {
        let config = DatabaseConfig::default();
        assert_eq!(config.url, "sqlite://data/dispatch.db");
        assert_eq!(config.max_connections, 5);
        assert!(!config.is_in_memory_store());
    }
}
