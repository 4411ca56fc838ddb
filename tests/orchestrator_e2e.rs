//! Queue behaviour across the dispatch core: retry limits, operator actions
//! and the background lanes.

use serde_json::json;

use signal_dispatch::application::orchestrator::CANCELLED;
use signal_dispatch::application::services::health_checker::schedule_health_checks;
use signal_dispatch::application::services::webhook_pipeline::DeliveryResult;
use signal_dispatch::domain::entities::account::HealthStatus;
use signal_dispatch::domain::entities::delivery::DeliveryStatus;
use signal_dispatch::domain::entities::exchange::Exchange;
use signal_dispatch::domain::entities::task::{Lane, TaskKind, TaskStatus};
use signal_dispatch::domain::entities::webhook::WebhookStatus;
use signal_dispatch::domain::repositories::exchange_client::{AccountInfo, ExchangeError};
use signal_dispatch::domain::repositories::store::{
    AccountRepository, DeliveryRepository, TaskStore, WebhookRepository,
};
use signal_dispatch::testing::{seed_account, seed_webhook, Harness};

const PATH: &str = "queue-hook";

fn buy() -> serde_json::Value {
    json!({"ticker": "BTCUSDT", "action": "buy", "quantity": 0.01})
}

async fn accept(h: &Harness, payload: &serde_json::Value) -> (i64, String) {
    match h.send(PATH, payload, None).await.unwrap() {
        DeliveryResult::Accepted {
            delivery_id,
            task_id,
        } => (delivery_id, task_id),
        other => panic!("expected acceptance, got {:?}", other),
    }
}

#[tokio::test]
async fn test_retries_stop_at_lane_limit_and_fail_delivery() {
    let h = Harness::without_backoff(Exchange::Binance);
    let webhook = seed_webhook(h.store.as_ref(), 1, PATH, None).await.unwrap();
    seed_account(h.store.as_ref(), &h.vault, 1, Exchange::Binance, HealthStatus::Error)
        .await
        .unwrap();

    let (delivery_id, task_id) = accept(&h, &buy()).await;
    let max_attempts = h.orchestrator.policy(Lane::WebhookProcessing).max_attempts() as usize;
    assert_eq!(h.drain(Lane::WebhookProcessing).await.unwrap(), max_attempts);

    let task = h.orchestrator.task(&task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failure);
    assert_eq!(task.attempts as usize, max_attempts);
    assert!(task.finished_at.is_some());

    let delivery = h.store.get_delivery(delivery_id).await.unwrap().unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Failed);
    assert!(delivery.next_retry_at.is_none());
    let details = delivery.error_details.unwrap();
    assert_eq!(details["code"], "account_unavailable");
    assert_eq!(details["attempts"], max_attempts as u64);

    let webhook = h.store.get_webhook(webhook.id).await.unwrap().unwrap();
    assert_eq!(webhook.failed_deliveries, 1);
    assert!(h.exchange.calls().is_empty());
}

#[tokio::test]
async fn test_manual_retry_after_exhaustion_succeeds() {
    let h = Harness::without_backoff(Exchange::Binance);
    seed_webhook(h.store.as_ref(), 1, PATH, None).await.unwrap();
    let mut account =
        seed_account(h.store.as_ref(), &h.vault, 1, Exchange::Binance, HealthStatus::Error)
            .await
            .unwrap();

    let (delivery_id, task_id) = accept(&h, &buy()).await;
    h.drain(Lane::WebhookProcessing).await.unwrap();
    assert_eq!(
        h.orchestrator.status(&task_id).await.unwrap(),
        Some(TaskStatus::Failure)
    );

    account.record_health(HealthStatus::Healthy, None, chrono::Utc::now());
    h.store.update_account(&account).await.unwrap();

    assert!(h.orchestrator.retry(&task_id).await.unwrap());
    assert_eq!(h.drain(Lane::WebhookProcessing).await.unwrap(), 1);

    let delivery = h.store.get_delivery(delivery_id).await.unwrap().unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Success);
    assert_eq!(delivery.orders_created, 1);
    assert_eq!(
        h.orchestrator.status(&task_id).await.unwrap(),
        Some(TaskStatus::Success)
    );

    // Finished successfully, nothing left to retry
    assert!(!h.orchestrator.retry(&task_id).await.unwrap());
}

#[tokio::test]
async fn test_cancel_queued_task_fails_delivery() {
    let h = Harness::new(Exchange::Binance, Default::default());
    seed_webhook(h.store.as_ref(), 1, PATH, None).await.unwrap();
    seed_account(h.store.as_ref(), &h.vault, 1, Exchange::Binance, HealthStatus::Healthy)
        .await
        .unwrap();

    let (delivery_id, task_id) = accept(&h, &buy()).await;
    assert!(h.orchestrator.cancel(&task_id).await.unwrap());

    let task = h.orchestrator.task(&task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failure);
    assert_eq!(task.last_error.as_deref(), Some(CANCELLED));

    let delivery = h.store.get_delivery(delivery_id).await.unwrap().unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Failed);
    assert!(delivery.error_message.unwrap().contains(CANCELLED));

    assert_eq!(h.drain(Lane::WebhookProcessing).await.unwrap(), 0);
    assert!(h.exchange.calls().is_empty());
    // Second cancel finds a finished task
    assert!(!h.orchestrator.cancel(&task_id).await.unwrap());
}

#[tokio::test]
async fn test_rejected_order_is_not_retried() {
    let h = Harness::without_backoff(Exchange::Bybit);
    seed_webhook(h.store.as_ref(), 1, PATH, None).await.unwrap();
    seed_account(h.store.as_ref(), &h.vault, 1, Exchange::Bybit, HealthStatus::Healthy)
        .await
        .unwrap();
    h.exchange.fail_next_create(ExchangeError::Rejected {
        code: "110007".to_string(),
        message: "ab not enough for new order".to_string(),
    });

    let (delivery_id, task_id) = accept(&h, &buy()).await;
    assert_eq!(h.drain(Lane::WebhookProcessing).await.unwrap(), 1);

    let task = h.orchestrator.task(&task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failure);
    assert_eq!(task.attempts, 1);

    let delivery = h.store.get_delivery(delivery_id).await.unwrap().unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Failed);
    assert_eq!(delivery.orders_failed, 1);
    assert_eq!(h.exchange.count("create_order"), 1);
}

#[tokio::test]
async fn test_repeated_failures_pause_webhook() {
    let h = Harness::new(Exchange::Binance, Default::default());
    let webhook = seed_webhook(h.store.as_ref(), 1, PATH, Some("s3cret"))
        .await
        .unwrap();

    let reject = |n: i64| {
        let payload = json!({"ticker": "BTCUSDT", "action": "buy", "quantity": 1, "n": n});
        let pipeline = h.pipeline.clone();
        async move {
            pipeline
                .receive(PATH, payload.to_string().as_bytes(), json!({}), Some("00ff"))
                .await
                .unwrap()
        }
    };

    for n in 0..webhook.error_threshold - 1 {
        assert!(matches!(
            reject(n).await,
            DeliveryResult::InvalidSignature { .. }
        ));
    }
    let stored = h.store.get_webhook(webhook.id).await.unwrap().unwrap();
    assert_eq!(stored.consecutive_errors, webhook.error_threshold - 1);
    assert_eq!(stored.status, WebhookStatus::Active);

    reject(webhook.error_threshold).await;
    let stored = h.store.get_webhook(webhook.id).await.unwrap().unwrap();
    assert_eq!(stored.failed_deliveries, webhook.error_threshold);
    assert_eq!(stored.status, WebhookStatus::Paused);

    let result = h.send(PATH, &buy(), Some("s3cret")).await.unwrap();
    assert_eq!(
        result,
        DeliveryResult::Inactive {
            status: WebhookStatus::Paused
        }
    );
}

#[tokio::test]
async fn test_health_checks_refresh_account_snapshot() {
    let h = Harness::new(Exchange::Binance, Default::default());
    let account = seed_account(
        h.store.as_ref(),
        &h.vault,
        1,
        Exchange::Binance,
        HealthStatus::Unknown,
    )
    .await
    .unwrap();
    h.exchange.set_account_info(AccountInfo {
        can_trade: true,
        total_balance: 2_500.0,
        available_balance: 1_750.0,
        unrealized_pnl: 0.0,
    });

    assert_eq!(
        schedule_health_checks(h.store.as_ref(), &h.orchestrator)
            .await
            .unwrap(),
        1
    );
    assert_eq!(h.drain(Lane::HealthChecks).await.unwrap(), 1);

    let refreshed = h.store.get_account(account.id).await.unwrap().unwrap();
    assert_eq!(refreshed.health_status, HealthStatus::Healthy);
    assert!(refreshed.can_trade());
    assert_eq!(refreshed.available_balance, 1_750.0);
    assert_eq!(h.exchange.count("connect"), 1);
}

#[tokio::test]
async fn test_health_check_auth_failure_marks_account_error() {
    let h = Harness::new(Exchange::Bybit, Default::default());
    let account = seed_account(
        h.store.as_ref(),
        &h.vault,
        1,
        Exchange::Bybit,
        HealthStatus::Healthy,
    )
    .await
    .unwrap();
    h.exchange
        .fail_connect(ExchangeError::Auth("API key is invalid".to_string()));

    let task_id = h
        .orchestrator
        .enqueue(TaskKind::HealthCheck { account_id: account.id }, None)
        .await
        .unwrap();
    h.drain(Lane::HealthChecks).await.unwrap();

    let refreshed = h.store.get_account(account.id).await.unwrap().unwrap();
    assert_eq!(refreshed.health_status, HealthStatus::Error);
    assert!(refreshed.last_error.unwrap().contains("API key is invalid"));
    assert_eq!(
        h.orchestrator.status(&task_id).await.unwrap(),
        Some(TaskStatus::Failure)
    );
}

#[tokio::test]
async fn test_queue_stats_and_purge() {
    let h = Harness::new(Exchange::Binance, Default::default());
    seed_webhook(h.store.as_ref(), 1, PATH, None).await.unwrap();
    for n in 0..3 {
        accept(&h, &json!({"ticker": "BTCUSDT", "action": "buy", "quantity": 0.01, "id": n})).await;
    }

    let stats = h.orchestrator.queue_stats().await.unwrap();
    assert_eq!(stats[&Lane::WebhookProcessing].pending, 3);
    assert_eq!(stats[&Lane::OrderExecution].pending, 0);

    assert_eq!(h.orchestrator.purge(Lane::WebhookProcessing).await.unwrap(), 3);
    let stats = h.orchestrator.queue_stats().await.unwrap();
    assert_eq!(stats[&Lane::WebhookProcessing].pending, 0);
}

#[tokio::test]
async fn test_maintenance_lane_runs_purge_and_reclaim() {
    let h = Harness::new(Exchange::Binance, Default::default());
    let purge = h
        .orchestrator
        .enqueue(TaskKind::PurgeDeliveries { older_than_days: 30 }, None)
        .await
        .unwrap();
    let reclaim = h
        .orchestrator
        .enqueue(TaskKind::ReclaimLeases, None)
        .await
        .unwrap();

    assert_eq!(h.drain(Lane::Maintenance).await.unwrap(), 2);
    assert_eq!(
        h.orchestrator.status(&purge).await.unwrap(),
        Some(TaskStatus::Success)
    );
    assert_eq!(
        h.orchestrator.status(&reclaim).await.unwrap(),
        Some(TaskStatus::Success)
    );
}

#[tokio::test]
async fn test_reclaimed_leases_follow_delivery_to_failure() {
    let h = Harness::new(Exchange::Binance, Default::default());
    let webhook = seed_webhook(h.store.as_ref(), 1, PATH, None).await.unwrap();
    let (delivery_id, task_id) = accept(&h, &buy()).await;
    let max_attempts = h.orchestrator.policy(Lane::WebhookProcessing).max_attempts();

    // A worker that claims and then dies, every attempt
    let crash = |h: &Harness| {
        let store = h.store.clone();
        async move {
            let expired = chrono::Utc::now() - chrono::Duration::minutes(10);
            store
                .claim_next_task(Lane::WebhookProcessing, "crashed", expired, chrono::Utc::now())
                .await
                .unwrap()
                .expect("task should be due");
        }
    };

    crash(&h).await;
    h.orchestrator
        .enqueue(TaskKind::ReclaimLeases, None)
        .await
        .unwrap();
    h.drain(Lane::Maintenance).await.unwrap();

    let task = h.orchestrator.task(&task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Retrying);
    let delivery = h.store.get_delivery(delivery_id).await.unwrap().unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Retrying);
    assert!(delivery.next_retry_at.is_some());

    for _ in 1..max_attempts {
        crash(&h).await;
        h.orchestrator
            .enqueue(TaskKind::ReclaimLeases, None)
            .await
            .unwrap();
        h.drain(Lane::Maintenance).await.unwrap();
    }

    let task = h.orchestrator.task(&task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failure);
    assert_eq!(task.attempts, max_attempts);

    let delivery = h.store.get_delivery(delivery_id).await.unwrap().unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Failed);
    assert!(delivery.error_message.unwrap().contains("lease expired"));
    assert_eq!(delivery.error_details.unwrap()["attempts"], max_attempts as u64);

    let webhook = h.store.get_webhook(webhook.id).await.unwrap().unwrap();
    assert_eq!(webhook.failed_deliveries, 1);
    assert!(h.exchange.calls().is_empty());
}
