use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use signal_dispatch::application::handlers::{build_router, AppState, RouterOptions};
use signal_dispatch::application::orchestrator::{HandlerRegistry, Orchestrator, TaskHandler};
use signal_dispatch::application::services::health_checker::{schedule_health_checks, HealthChecker};
use signal_dispatch::application::services::maintenance::Maintenance;
use signal_dispatch::application::services::order_dispatcher::OrderDispatcher;
use signal_dispatch::application::services::webhook_pipeline::WebhookPipeline;
use signal_dispatch::auth::AdminKeys;
use signal_dispatch::config::AppConfig;
use signal_dispatch::domain::entities::task::TaskKind;
use signal_dispatch::domain::repositories::store::Store;
use signal_dispatch::domain::services::account_selector::AccountSelector;
use signal_dispatch::domain::services::credential_vault::CredentialVault;
use signal_dispatch::domain::services::positions_cache::PositionsCache;
use signal_dispatch::infrastructure::exchange_client_factory::ExchangeClientFactory;
use signal_dispatch::persistence::memory::InMemoryStore;
use signal_dispatch::persistence::repository::SqliteStore;
use signal_dispatch::persistence::init_database;
use signal_dispatch::rate_limit::{create_rate_limiter, RateLimiterConfig};
use signal_dispatch::secrets::{load_master_key, SecretConfig};
use signal_dispatch::task_runner::{run_periodic, CircuitBreakerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Could not read .env: {}", e);
        }
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "signal_dispatch=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::from_env()?;
    info!(
        bind = %config.server.bind_address,
        admin_keys = config.server.admin_api_keys.len(),
        policy = ?config.selection_policy,
        "Configuration loaded"
    );

    if config.database.is_in_memory_store() {
        warn!("Using the in-memory store; queued work is lost on restart");
        run(Arc::new(InMemoryStore::new()), config).await
    } else {
        let pool = init_database(&config.database).await?;
        run(Arc::new(SqliteStore::new(pool)), config).await
    }
}

async fn run<S>(store: Arc<S>, config: AppConfig) -> Result<(), Box<dyn std::error::Error>>
where
    S: Store + 'static,
{
    let master_key = load_master_key(&SecretConfig::from_env())?;
    let vault = Arc::new(CredentialVault::new(
        &master_key,
        config.vault.cache_ttl,
        config.vault.cache_capacity,
    )?);
    drop(master_key);

    let clients = Arc::new(ExchangeClientFactory::new(
        config.exchange.request_timeout,
        config.exchange.recv_window_ms,
    )?);
    let cache = Arc::new(PositionsCache::new(config.cache.positions_ttl));

    let dispatcher: Arc<dyn TaskHandler> = Arc::new(OrderDispatcher::new(
        store.clone(),
        AccountSelector::new(store.clone(), config.selection_policy),
        vault.clone(),
        clients.clone(),
        cache.clone(),
    ));
    let health_checker: Arc<dyn TaskHandler> =
        Arc::new(HealthChecker::new(store.clone(), vault.clone(), clients.clone()));

    let registry = HandlerRegistry::new()
        .with("process_webhook", dispatcher.clone())
        .with("execute_order", dispatcher)
        .with("health_check", health_checker);
    let maintenance: Arc<dyn TaskHandler> =
        Arc::new(Maintenance::new(store.clone(), registry.clone()));
    let registry = registry
        .with("purge_deliveries", maintenance.clone())
        .with("reclaim_leases", maintenance);
    info!(kinds = ?registry.kinds(), "Task handlers registered");

    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        registry,
        config.dispatch.clone(),
    ));
    let pipeline = Arc::new(WebhookPipeline::new(
        store.clone(),
        orchestrator.clone(),
        config.webhook.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);

    let mut background = orchestrator.spawn_workers(shutdown_rx.clone());
    background.push(
        cache
            .clone()
            .spawn_sweeper(config.cache.sweep_interval, shutdown_rx.clone()),
    );

    // Health checks
    {
        let store = store.clone();
        let orchestrator = orchestrator.clone();
        let shutdown_tx = shutdown_tx.clone();
        let rx = shutdown_rx.clone();
        let interval = config.schedule.health_check_interval;
        background.push(tokio::spawn(async move {
            let result = run_periodic("health_checks", interval, CircuitBreakerConfig::default(), rx, || {
                let store = store.clone();
                let orchestrator = orchestrator.clone();
                async move {
                    schedule_health_checks(store.as_ref(), &orchestrator)
                        .await
                        .map(|n| info!(accounts = n, "Health checks queued"))
                        .map_err(|e| e.to_string())
                }
            })
            .await;
            if let Err(open) = result {
                error!("{}", open);
                let _ = shutdown_tx.send(true);
            }
        }));
    }

    // Lease reclaim and retention purge
    let maintenance_jobs = [
        (
            "reclaim_leases",
            config.schedule.lease_reclaim_interval,
            TaskKind::ReclaimLeases,
        ),
        (
            "purge_deliveries",
            config.schedule.purge_interval,
            TaskKind::PurgeDeliveries {
                older_than_days: config.schedule.retention_days,
            },
        ),
    ];
    for (name, interval, kind) in maintenance_jobs {
        let orchestrator = orchestrator.clone();
        let shutdown_tx = shutdown_tx.clone();
        let rx = shutdown_rx.clone();
        background.push(tokio::spawn(async move {
            let result = run_periodic(name, interval, CircuitBreakerConfig::default(), rx, || {
                let orchestrator = orchestrator.clone();
                let kind = kind.clone();
                async move {
                    orchestrator
                        .enqueue(kind, None)
                        .await
                        .map(|_| ())
                        .map_err(|e| e.to_string())
                }
            })
            .await;
            if let Err(open) = result {
                error!("{}", open);
                let _ = shutdown_tx.send(true);
            }
        }));
    }

    let state = AppState {
        pipeline,
        orchestrator: orchestrator.clone(),
        vault,
        cache,
    };
    let app = build_router(
        state,
        RouterOptions {
            admin_keys: AdminKeys::new(&config.server.admin_api_keys),
            webhook_limiter: create_rate_limiter(RateLimiterConfig {
                requests_per_minute: config.server.webhook_rate_limit_per_minute,
            }),
            body_limit_bytes: config.server.body_limit_bytes,
        },
    );

    let listener = tokio::net::TcpListener::bind(config.server.bind_address).await?;
    info!("Listening on {}", config.server.bind_address);

    let mut internal_stop = shutdown_rx.clone();
    let shutdown_signal = async move {
        let ctrl_c = async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl+C signal"),
                Err(e) => error!("Failed to install Ctrl+C handler: {}", e),
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                    info!("Received SIGTERM signal");
                }
                Err(e) => error!("Failed to install SIGTERM handler: {}", e),
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        let stopped = async {
            while !*internal_stop.borrow() {
                if internal_stop.changed().await.is_err() {
                    break;
                }
            }
            warn!("Background task requested shutdown");
        };

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
            _ = stopped => {},
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    info!("Server stopped, draining workers");
    let _ = shutdown_tx.send(true);
    for handle in background {
        if let Err(e) = handle.await {
            error!("Background task ended abnormally: {}", e);
        }
    }

    info!("Shutdown complete");
    Ok(())
}
