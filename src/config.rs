//! Service configuration
//!
//! Defaults first, then environment overrides. Values that fail to parse or
//! fall outside their allowed range are logged and ignored.

use std::collections::HashSet;
use std::fmt::Display;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::application::orchestrator::{Backoff, LanePolicies, OrchestratorConfig};
use crate::application::services::webhook_pipeline::PipelineConfig;
use crate::domain::entities::task::Lane;
use crate::domain::services::account_selector::SelectionPolicy;
use crate::persistence::DatabaseConfig;

/// Minimum admin API key length (256 bits of base64)
pub const MIN_ADMIN_KEY_LENGTH: usize = 32;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("ADMIN_API_KEYS must contain at least one key")]
    NoAdminKeys,

    #[error("admin API key too short ({0} chars, minimum 32)")]
    WeakAdminKey(usize),

    #[error("invalid bind address '{0}'")]
    BindAddress(String),
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_address: SocketAddr,
    pub admin_api_keys: HashSet<String>,
    /// Webhook route, requests per minute across all callers
    pub webhook_rate_limit_per_minute: u32,
    pub body_limit_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub positions_ttl: Duration,
    pub sweep_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct VaultConfig {
    pub cache_ttl: Duration,
    pub cache_capacity: usize,
}

#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    pub request_timeout: Duration,
    pub recv_window_ms: u64,
}

/// Periodic jobs enqueued by the scheduler
#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub health_check_interval: Duration,
    pub lease_reclaim_interval: Duration,
    pub purge_interval: Duration,
    pub retention_days: i64,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub webhook: PipelineConfig,
    pub dispatch: OrchestratorConfig,
    pub cache: CacheConfig,
    pub vault: VaultConfig,
    pub exchange: ExchangeConfig,
    pub schedule: ScheduleConfig,
    pub selection_policy: SelectionPolicy,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                bind_address: SocketAddr::from(([127, 0, 0, 1], 3000)),
                admin_api_keys: HashSet::new(),
                webhook_rate_limit_per_minute: 600,
                body_limit_bytes: 64 * 1024,
            },
            database: DatabaseConfig::default(),
            webhook: PipelineConfig::default(),
            dispatch: OrchestratorConfig::default(),
            cache: CacheConfig {
                positions_ttl: Duration::from_secs(5),
                sweep_interval: Duration::from_secs(30),
            },
            vault: VaultConfig {
                cache_ttl: Duration::from_secs(300),
                cache_capacity: 256,
            },
            exchange: ExchangeConfig {
                request_timeout: Duration::from_secs(10),
                recv_window_ms: 5_000,
            },
            schedule: ScheduleConfig {
                health_check_interval: Duration::from_secs(300),
                lease_reclaim_interval: Duration::from_secs(60),
                purge_interval: Duration::from_secs(6 * 3600),
                retention_days: 30,
            },
            selection_policy: SelectionPolicy::default(),
        }
    }
}

/// Parse `name`, falling back to `current` (with a warning) when the value is
/// unparsable or fails `valid`
fn parse_var<T, F>(lookup: &F, name: &str, current: T, valid: impl Fn(&T) -> bool) -> T
where
    T: FromStr + Display + Copy,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(name) else {
        return current;
    };
    match raw.trim().parse::<T>() {
        Ok(value) if valid(&value) => value,
        Ok(value) => {
            warn!("Invalid {} value: {} (out of range), using default: {}", name, value, current);
            current
        }
        Err(e) => {
            warn!("Failed to parse {} '{}': {}, using default: {}", name, raw, e, current);
            current
        }
    }
}

fn parse_bool<F>(lookup: &F, name: &str, current: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(raw) => {
            let raw = raw.trim().to_lowercase();
            raw == "true" || raw == "1" || raw == "yes"
        }
        None => current,
    }
}

fn secs<F>(lookup: &F, name: &str, current: Duration, min: u64, max: u64) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    Duration::from_secs(parse_var(lookup, name, current.as_secs(), |v| {
        (min..=max).contains(v)
    }))
}

impl AppConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup("BIND_ADDRESS") {
            config.server.bind_address = addr
                .trim()
                .parse()
                .map_err(|_| ConfigError::BindAddress(addr.clone()))?;
        }

        let keys = lookup("ADMIN_API_KEYS").unwrap_or_default();
        for key in keys.split(',').map(str::trim).filter(|k| !k.is_empty()) {
            if key.len() < MIN_ADMIN_KEY_LENGTH {
                return Err(ConfigError::WeakAdminKey(key.len()));
            }
            config.server.admin_api_keys.insert(key.to_string());
        }
        if config.server.admin_api_keys.is_empty() {
            return Err(ConfigError::NoAdminKeys);
        }

        config.server.webhook_rate_limit_per_minute = parse_var(
            &lookup,
            "WEBHOOK_RATE_LIMIT_PER_MINUTE",
            config.server.webhook_rate_limit_per_minute,
            |v| (1..=100_000).contains(v),
        );
        config.server.body_limit_bytes = parse_var(
            &lookup,
            "WEBHOOK_BODY_LIMIT_BYTES",
            config.server.body_limit_bytes,
            |v| (1024..=1024 * 1024).contains(v),
        );

        config.database = DatabaseConfig::from_env_with(&lookup);

        config.webhook.dedup_window = secs(
            &lookup,
            "DEDUP_WINDOW_SECONDS",
            config.webhook.dedup_window,
            1,
            3600,
        );
        config.webhook.require_signature = parse_bool(
            &lookup,
            "WEBHOOK_REQUIRE_SIGNATURE",
            config.webhook.require_signature,
        );

        config.dispatch.lanes = lane_policies(&lookup, config.dispatch.lanes);
        config.dispatch.lease_duration = secs(
            &lookup,
            "TASK_LEASE_SECONDS",
            config.dispatch.lease_duration,
            10,
            3600,
        );
        config.dispatch.poll_interval = Duration::from_millis(parse_var(
            &lookup,
            "TASK_POLL_INTERVAL_MS",
            config.dispatch.poll_interval.as_millis() as u64,
            |v| (50..=60_000).contains(v),
        ));

        config.cache.positions_ttl = secs(
            &lookup,
            "POSITIONS_CACHE_TTL_SECONDS",
            config.cache.positions_ttl,
            1,
            300,
        );
        config.cache.sweep_interval = secs(
            &lookup,
            "CACHE_SWEEP_INTERVAL_SECONDS",
            config.cache.sweep_interval,
            1,
            3600,
        );

        config.vault.cache_ttl = secs(
            &lookup,
            "VAULT_CACHE_TTL_SECONDS",
            config.vault.cache_ttl,
            0,
            86_400,
        );
        config.vault.cache_capacity = parse_var(
            &lookup,
            "VAULT_CACHE_CAPACITY",
            config.vault.cache_capacity,
            |v| (1..=100_000).contains(v),
        );

        config.exchange.request_timeout = secs(
            &lookup,
            "EXCHANGE_REQUEST_TIMEOUT_SECONDS",
            config.exchange.request_timeout,
            1,
            120,
        );
        config.exchange.recv_window_ms = parse_var(
            &lookup,
            "EXCHANGE_RECV_WINDOW_MS",
            config.exchange.recv_window_ms,
            |v| (1_000..=60_000).contains(v),
        );

        config.schedule.health_check_interval = secs(
            &lookup,
            "HEALTH_CHECK_INTERVAL_SECONDS",
            config.schedule.health_check_interval,
            30,
            86_400,
        );
        config.schedule.lease_reclaim_interval = secs(
            &lookup,
            "LEASE_RECLAIM_INTERVAL_SECONDS",
            config.schedule.lease_reclaim_interval,
            5,
            3600,
        );
        config.schedule.purge_interval = secs(
            &lookup,
            "PURGE_INTERVAL_SECONDS",
            config.schedule.purge_interval,
            60,
            7 * 86_400,
        );
        config.schedule.retention_days = parse_var(
            &lookup,
            "DELIVERY_RETENTION_DAYS",
            config.schedule.retention_days,
            |v| (1..=3650).contains(v),
        );

        if let Some(raw) = lookup("ACCOUNT_SELECTION_POLICY") {
            match raw.parse::<SelectionPolicy>() {
                Ok(policy) => config.selection_policy = policy,
                Err(e) => warn!("Invalid ACCOUNT_SELECTION_POLICY: {}, using default", e),
            }
        }

        Ok(config)
    }
}

/// `LANE_<NAME>_CONCURRENCY`, `LANE_<NAME>_MAX_RETRIES`, `LANE_<NAME>_BASE_DELAY_SECONDS`
fn lane_policies<F>(lookup: &F, mut policies: LanePolicies) -> LanePolicies
where
    F: Fn(&str) -> Option<String>,
{
    for lane in Lane::all() {
        let prefix = format!("LANE_{}", lane.as_str().to_uppercase());
        let mut policy = policies.get(lane);

        policy.concurrency = parse_var(
            lookup,
            &format!("{}_CONCURRENCY", prefix),
            policy.concurrency,
            |v| (1..=64).contains(v),
        );
        policy.max_retries = parse_var(
            lookup,
            &format!("{}_MAX_RETRIES", prefix),
            policy.max_retries,
            |v| *v <= 20,
        );
        let delay_var = format!("{}_BASE_DELAY_SECONDS", prefix);
        policy.backoff = match policy.backoff {
            Backoff::Exponential { base } => Backoff::Exponential {
                base: secs(lookup, &delay_var, base, 1, 86_400),
            },
            Backoff::Fixed(delay) => Backoff::Fixed(secs(lookup, &delay_var, delay, 1, 86_400)),
        };
        policies.set(lane, policy);
    }
    policies
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const KEY: &str = "0123456789abcdef0123456789abcdef";

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_with_admin_key() {
        let config = AppConfig::from_lookup(lookup_from(&[("ADMIN_API_KEYS", KEY)])).unwrap();
        assert_eq!(config.webhook.dedup_window, Duration::from_secs(10));
        assert_eq!(config.cache.positions_ttl, Duration::from_secs(5));
        assert_eq!(config.dispatch.lanes.get(Lane::OrderExecution).max_retries, 5);
        assert_eq!(config.selection_policy, SelectionPolicy::Balanced);
    }

    #[test]
    fn test_admin_keys_required_and_strong() {
        assert_eq!(
            AppConfig::from_lookup(lookup_from(&[])).unwrap_err(),
            ConfigError::NoAdminKeys
        );
        assert_eq!(
            AppConfig::from_lookup(lookup_from(&[("ADMIN_API_KEYS", "short")])).unwrap_err(),
            ConfigError::WeakAdminKey(5)
        );
    }

    #[test]
    fn test_out_of_range_values_keep_defaults() {
        let config = AppConfig::from_lookup(lookup_from(&[
            ("ADMIN_API_KEYS", KEY),
            ("DEDUP_WINDOW_SECONDS", "0"),
            ("VAULT_CACHE_CAPACITY", "lots"),
            ("POSITIONS_CACHE_TTL_SECONDS", "12"),
        ]))
        .unwrap();
        assert_eq!(config.webhook.dedup_window, Duration::from_secs(10));
        assert_eq!(config.vault.cache_capacity, 256);
        assert_eq!(config.cache.positions_ttl, Duration::from_secs(12));
    }

    #[test]
    fn test_lane_overrides() {
        let config = AppConfig::from_lookup(lookup_from(&[
            ("ADMIN_API_KEYS", KEY),
            ("LANE_ORDER_EXECUTION_MAX_RETRIES", "2"),
            ("LANE_ORDER_EXECUTION_BASE_DELAY_SECONDS", "5"),
            ("LANE_HEALTH_CHECKS_CONCURRENCY", "8"),
        ]))
        .unwrap();
        let orders = config.dispatch.lanes.get(Lane::OrderExecution);
        assert_eq!(orders.max_retries, 2);
        assert_eq!(
            orders.backoff,
            Backoff::Exponential {
                base: Duration::from_secs(5)
            }
        );
        assert_eq!(config.dispatch.lanes.get(Lane::HealthChecks).concurrency, 8);
    }

    #[test]
    fn test_selection_policy_and_flags() {
        let config = AppConfig::from_lookup(lookup_from(&[
            ("ADMIN_API_KEYS", KEY),
            ("ACCOUNT_SELECTION_POLICY", "highest_balance"),
            ("WEBHOOK_REQUIRE_SIGNATURE", "true"),
        ]))
        .unwrap();
        assert_eq!(config.selection_policy, SelectionPolicy::HighestBalance);
        assert!(config.webhook.require_signature);
    }
}
