//! Account selection
//!
//! Picks the credentialed account a trading request is executed on. Only
//! accounts that can trade (active and healthy) and match the requested
//! exchange/environment are candidates.

use chrono::{DateTime, Duration, Utc};
use std::cmp::Ordering;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

use crate::domain::entities::account::ExchangeAccount;
use crate::domain::entities::exchange::{Environment, Exchange};
use crate::domain::errors::DispatchResult;
use crate::domain::repositories::store::AccountRepository;

/// Health checks older than this halve an account's balanced score
const STALE_HEALTH_AFTER_MINUTES: i64 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionPolicy {
    /// Free balance weighted by exposure and health freshness
    #[default]
    Balanced,
    DefaultFirst,
    MostRecentlyHealthy,
    HighestBalance,
}

impl FromStr for SelectionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "balanced" => Ok(SelectionPolicy::Balanced),
            "default_first" | "default" => Ok(SelectionPolicy::DefaultFirst),
            "most_recently_healthy" | "recent" => Ok(SelectionPolicy::MostRecentlyHealthy),
            "highest_balance" | "balance" => Ok(SelectionPolicy::HighestBalance),
            other => Err(format!("Unknown selection policy: {}", other)),
        }
    }
}

/// Constraints a candidate account must satisfy
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccountCriteria {
    pub exchange: Option<Exchange>,
    pub environment: Option<Environment>,
}

impl AccountCriteria {
    pub fn matches(&self, account: &ExchangeAccount) -> bool {
        self.exchange.map_or(true, |e| account.exchange == e)
            && self.environment.map_or(true, |e| account.environment == e)
    }
}

fn balanced_score(account: &ExchangeAccount, now: DateTime<Utc>) -> f64 {
    let free = account.available_balance.max(0.0);
    let exposure = account.open_exposure.max(0.0);
    let utilization = if free + exposure > 0.0 {
        exposure / (free + exposure)
    } else {
        0.0
    };
    let fresh = account
        .last_health_check_at
        .map(|at| now - at <= Duration::minutes(STALE_HEALTH_AFTER_MINUTES))
        .unwrap_or(false);
    let freshness = if fresh { 1.0 } else { 0.5 };
    free * (1.0 - utilization) * freshness
}

/// Default first, then most recently healthy, then lowest id
fn tie_break(a: &ExchangeAccount, b: &ExchangeAccount) -> Ordering {
    b.is_default
        .cmp(&a.is_default)
        .then_with(|| b.last_healthy_at.cmp(&a.last_healthy_at))
        .then_with(|| a.id.cmp(&b.id))
}

fn by_score_desc(a: f64, b: f64) -> Ordering {
    b.partial_cmp(&a).unwrap_or(Ordering::Equal)
}

/// Rank candidates in memory; the first element is the pick
pub fn rank(
    accounts: Vec<ExchangeAccount>,
    criteria: &AccountCriteria,
    policy: SelectionPolicy,
    now: DateTime<Utc>,
) -> Vec<ExchangeAccount> {
    let mut candidates: Vec<ExchangeAccount> = accounts
        .into_iter()
        .filter(|a| a.can_trade() && criteria.matches(a))
        .collect();

    candidates.sort_by(|a, b| {
        let primary = match policy {
            SelectionPolicy::Balanced => {
                by_score_desc(balanced_score(a, now), balanced_score(b, now))
            }
            SelectionPolicy::DefaultFirst => Ordering::Equal,
            SelectionPolicy::MostRecentlyHealthy => b.last_healthy_at.cmp(&a.last_healthy_at),
            SelectionPolicy::HighestBalance => {
                by_score_desc(a.available_balance, b.available_balance)
            }
        };
        primary.then_with(|| tie_break(a, b))
    });
    candidates
}

pub struct AccountSelector {
    accounts: Arc<dyn AccountRepository>,
    policy: SelectionPolicy,
}

impl AccountSelector {
    pub fn new(accounts: Arc<dyn AccountRepository>, policy: SelectionPolicy) -> Self {
        Self { accounts, policy }
    }

    pub fn policy(&self) -> SelectionPolicy {
        self.policy
    }

    pub async fn select(
        &self,
        user_id: i64,
        criteria: &AccountCriteria,
    ) -> DispatchResult<Option<ExchangeAccount>> {
        self.select_with(user_id, criteria, self.policy).await
    }

    pub async fn select_with(
        &self,
        user_id: i64,
        criteria: &AccountCriteria,
        policy: SelectionPolicy,
    ) -> DispatchResult<Option<ExchangeAccount>> {
        let accounts = self.accounts.list_accounts_for_user(user_id).await?;
        let total = accounts.len();
        let picked = rank(accounts, criteria, policy, Utc::now()).into_iter().next();

        debug!(
            user_id,
            candidates = total,
            policy = ?policy,
            selected = ?picked.as_ref().map(|a| a.id),
            "Account selection"
        );
        Ok(picked)
    }
}
