//! Account health probes
//!
//! Refreshes an account's health, free balance and open exposure. These
//! snapshots feed account selection.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

use crate::application::orchestrator::{Orchestrator, TaskHandler};
use crate::domain::entities::account::{ExchangeAccount, HealthStatus};
use crate::domain::entities::task::{TaskKind, TaskRecord};
use crate::domain::errors::{DispatchError, DispatchResult};
use crate::domain::repositories::exchange_client::{AccountInfo, ExchangeClientProvider};
use crate::domain::repositories::store::Store;
use crate::domain::services::credential_vault::CredentialVault;

pub struct HealthChecker {
    store: Arc<dyn Store>,
    vault: Arc<CredentialVault>,
    clients: Arc<dyn ExchangeClientProvider>,
}

impl HealthChecker {
    pub fn new(
        store: Arc<dyn Store>,
        vault: Arc<CredentialVault>,
        clients: Arc<dyn ExchangeClientProvider>,
    ) -> Self {
        Self {
            store,
            vault,
            clients,
        }
    }

    async fn probe(&self, account: &ExchangeAccount) -> DispatchResult<(AccountInfo, f64)> {
        let credentials = self.vault.decrypt_credentials(account)?;
        let client = self
            .clients
            .client(account.exchange, account.environment, credentials)?;
        client.connect().await?;
        let info = client.account_info().await?;
        let exposure = client
            .positions(None)
            .await?
            .iter()
            .map(|p| p.notional())
            .sum();
        Ok((info, exposure))
    }

    pub async fn check_account(&self, account_id: i64) -> DispatchResult<HealthStatus> {
        let mut account = self
            .store
            .get_account(account_id)
            .await?
            .ok_or_else(|| DispatchError::ValidationFailure(format!("account {} not found", account_id)))?;

        let now = Utc::now();
        match self.probe(&account).await {
            Ok((info, exposure)) => {
                let status = if info.can_trade {
                    HealthStatus::Healthy
                } else {
                    HealthStatus::Warning
                };
                account.available_balance = info.available_balance;
                account.open_exposure = exposure;
                account.record_health(
                    status,
                    (!info.can_trade).then(|| "trading disabled on exchange".to_string()),
                    now,
                );
                self.store.update_account(&account).await?;
                info!(
                    account_id,
                    status = status.as_str(),
                    available = info.available_balance,
                    exposure,
                    "Account health refreshed"
                );
                Ok(status)
            }
            Err(err) => {
                let status = match err {
                    DispatchError::ExchangeTransient(_) => HealthStatus::Warning,
                    _ => HealthStatus::Error,
                };
                warn!(account_id, status = status.as_str(), error = %err, "Account health check failed");
                account.record_health(status, Some(err.to_string()), now);
                self.store.update_account(&account).await?;
                Err(err)
            }
        }
    }
}

#[async_trait]
impl TaskHandler for HealthChecker {
    async fn run(&self, task: &TaskRecord) -> DispatchResult<()> {
        match task.kind {
            TaskKind::HealthCheck { account_id } => self.check_account(account_id).await.map(|_| ()),
            ref other => Err(DispatchError::ValidationFailure(format!(
                "health checker cannot run '{}'",
                other.name()
            ))),
        }
    }
}

/// Queue a health check for every active account
pub async fn schedule_health_checks(
    store: &dyn Store,
    orchestrator: &Orchestrator,
) -> DispatchResult<usize> {
    let accounts = store.list_active_accounts().await?;
    for account in &accounts {
        orchestrator
            .enqueue(TaskKind::HealthCheck { account_id: account.id }, None)
            .await?;
    }
    Ok(accounts.len())
}
