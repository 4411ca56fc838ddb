//! Webhook to exchange order, end to end against the in-memory store and a
//! scripted exchange.

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

use signal_dispatch::application::handlers::webhook_handler::WebhookResponse;
use signal_dispatch::application::handlers::{build_router, AppState, RouterOptions};
use signal_dispatch::application::services::order_dispatcher::client_order_id;
use signal_dispatch::application::services::webhook_pipeline::DeliveryResult;
use signal_dispatch::auth::AdminKeys;
use signal_dispatch::domain::entities::account::HealthStatus;
use signal_dispatch::domain::entities::delivery::DeliveryStatus;
use signal_dispatch::domain::entities::exchange::Exchange;
use signal_dispatch::domain::entities::order::{OrderRole, OrderSide, OrderStatus, OrderType};
use signal_dispatch::domain::entities::task::{Lane, TaskStatus};
use signal_dispatch::domain::repositories::exchange_client::{ExchangeError, PositionInfo};
use signal_dispatch::domain::repositories::store::{
    DeliveryRepository, OrderRepository, WebhookRepository,
};
use signal_dispatch::domain::services::signature::compute_signature;
use signal_dispatch::rate_limit::{create_rate_limiter, RateLimiterConfig};
use signal_dispatch::testing::{seed_account, seed_webhook, Harness};

const SECRET: &str = "whsec-test";
const PATH: &str = "tv-alpha";
const ADMIN_KEY: &str = "0123456789abcdef0123456789abcdef";

async fn harness_with_account(health: HealthStatus) -> Harness {
    let harness = Harness::new(Exchange::Binance, Default::default());
    seed_webhook(harness.store.as_ref(), 1, PATH, Some(SECRET))
        .await
        .unwrap();
    seed_account(
        harness.store.as_ref(),
        &harness.vault,
        1,
        Exchange::Binance,
        health,
    )
    .await
    .unwrap();
    harness
}

fn accepted_id(result: DeliveryResult) -> i64 {
    match result {
        DeliveryResult::Accepted { delivery_id, .. } => delivery_id,
        other => panic!("expected acceptance, got {:?}", other),
    }
}

#[tokio::test]
async fn test_signed_buy_alert_places_one_market_order() {
    let h = harness_with_account(HealthStatus::Healthy).await;
    let payload = json!({"ticker": "BTCUSDT", "action": "buy", "quantity": 0.01, "alert_id": "a-1"});

    let delivery_id = accepted_id(h.send(PATH, &payload, Some(SECRET)).await.unwrap());
    assert_eq!(h.drain(Lane::WebhookProcessing).await.unwrap(), 1);

    let delivery = h.store.get_delivery(delivery_id).await.unwrap().unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Success);
    assert_eq!(delivery.orders_created, 1);
    assert_eq!(delivery.orders_failed, 0);
    assert!(delivery.hmac_valid);

    let orders = h.store.orders_for_delivery(delivery_id).await.unwrap();
    assert_eq!(orders.len(), 1);
    let entry = &orders[0];
    assert_eq!(entry.side, OrderSide::Buy);
    assert_eq!(entry.order_type, OrderType::Market);
    assert_eq!(entry.status, OrderStatus::Filled);
    assert_eq!(entry.client_order_id, client_order_id(delivery_id, OrderRole::Entry));
    assert!((entry.filled_quantity - 0.01).abs() < 1e-9);

    assert_eq!(h.exchange.count("create_order"), 1);
    let webhook = h.store.get_webhook_by_path(PATH).await.unwrap().unwrap();
    assert_eq!(webhook.successful_deliveries, 1);
    assert_eq!(webhook.failed_deliveries, 0);
}

#[tokio::test]
async fn test_tampered_payload_is_recorded_and_never_dispatched() {
    let h = harness_with_account(HealthStatus::Healthy).await;
    let signed = json!({"ticker": "BTCUSDT", "action": "buy", "quantity": 0.01});
    let tampered = json!({"ticker": "BTCUSDT", "action": "buy", "quantity": 10});
    let signature = compute_signature(SECRET, &signed).unwrap();

    let result = h
        .pipeline
        .receive(
            PATH,
            tampered.to_string().as_bytes(),
            json!({}),
            Some(&signature),
        )
        .await
        .unwrap();
    let DeliveryResult::InvalidSignature { delivery_id } = result else {
        panic!("expected signature rejection, got {:?}", result);
    };

    let delivery = h.store.get_delivery(delivery_id).await.unwrap().unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Failed);
    assert!(!delivery.hmac_valid);
    assert_eq!(delivery.orders_created, 0);

    let webhook = h.store.get_webhook_by_path(PATH).await.unwrap().unwrap();
    assert_eq!(webhook.failed_deliveries, 1);

    assert_eq!(h.drain(Lane::WebhookProcessing).await.unwrap(), 0);
    assert!(h.exchange.calls().is_empty());
}

#[tokio::test]
async fn test_unhealthy_account_schedules_retry_without_exchange_call() {
    let h = harness_with_account(HealthStatus::Error).await;
    let payload = json!({"ticker": "BTCUSDT", "action": "buy", "quantity": 0.01});

    let delivery_id = accepted_id(h.send(PATH, &payload, Some(SECRET)).await.unwrap());
    assert_eq!(h.drain(Lane::WebhookProcessing).await.unwrap(), 1);

    let delivery = h.store.get_delivery(delivery_id).await.unwrap().unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Retrying);
    assert!(delivery.next_retry_at.unwrap() > chrono::Utc::now());
    assert_eq!(delivery.orders_created, 0);

    let task = h
        .orchestrator
        .task(delivery.task_id.as_deref().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.status, TaskStatus::Retrying);
    assert_eq!(task.attempts, 1);

    assert_eq!(h.provider.built(), 0);
    assert!(h.exchange.calls().is_empty());
}

#[tokio::test]
async fn test_rejected_stop_loss_keeps_entry_and_succeeds() {
    let h = harness_with_account(HealthStatus::Healthy).await;
    h.exchange.fail_order_type(
        OrderType::StopMarket,
        ExchangeError::Rejected {
            code: "-2021".to_string(),
            message: "Order would immediately trigger.".to_string(),
        },
    );
    let payload = json!({
        "ticker": "BTCUSDT",
        "action": "buy",
        "quantity": 0.01,
        "stop_loss": "2%",
    });

    let delivery_id = accepted_id(h.send(PATH, &payload, Some(SECRET)).await.unwrap());
    h.drain(Lane::WebhookProcessing).await.unwrap();

    let delivery = h.store.get_delivery(delivery_id).await.unwrap().unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Success);
    assert_eq!(delivery.orders_created, 2);
    assert_eq!(delivery.orders_failed, 1);
    assert!(delivery.error_message.unwrap().contains("stop_loss"));

    let entry = h
        .store
        .get_order_by_client_id(&client_order_id(delivery_id, OrderRole::Entry))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.status, OrderStatus::Filled);

    let stop = h
        .store
        .get_order_by_client_id(&client_order_id(delivery_id, OrderRole::StopLoss))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stop.status, OrderStatus::Rejected);
    assert_eq!(stop.side, OrderSide::Sell);
    assert_eq!(stop.exchange_error_code.as_deref(), Some("-2021"));
    // 2% under a 30000 fill
    assert!((stop.stop_price.unwrap() - 29_400.0).abs() < 1e-6);
}

#[tokio::test]
async fn test_protective_orders_follow_entry_fill() {
    let h = harness_with_account(HealthStatus::Healthy).await;
    let payload = json!({
        "symbol": "BTCUSDT",
        "action": "sell",
        "quantity": 0.02,
        "sl_pct": 1,
        "tp_pct": 2,
    });

    let delivery_id = accepted_id(h.send(PATH, &payload, Some(SECRET)).await.unwrap());
    h.drain(Lane::WebhookProcessing).await.unwrap();

    let orders = h.store.orders_for_delivery(delivery_id).await.unwrap();
    assert_eq!(orders.len(), 3);
    for order in orders.iter().filter(|o| o.role != OrderRole::Entry) {
        assert_eq!(order.side, OrderSide::Buy);
        assert!(order.reduce_only);
        assert_eq!(order.status, OrderStatus::Open);
        assert!((order.quantity - 0.02).abs() < 1e-9);
    }
    let stop = orders.iter().find(|o| o.role == OrderRole::StopLoss).unwrap();
    let target = orders.iter().find(|o| o.role == OrderRole::TakeProfit).unwrap();
    assert!((stop.stop_price.unwrap() - 30_300.0).abs() < 1e-6);
    assert!((target.stop_price.unwrap() - 29_400.0).abs() < 1e-6);
}

#[tokio::test]
async fn test_duplicate_alert_within_window_is_ignored() {
    let h = harness_with_account(HealthStatus::Healthy).await;
    let payload = json!({"ticker": "BTCUSDT", "action": "buy", "quantity": 0.01, "alert_id": "dup-1"});

    let first = accepted_id(h.send(PATH, &payload, Some(SECRET)).await.unwrap());
    let second = h.send(PATH, &payload, Some(SECRET)).await.unwrap();
    assert_eq!(
        second,
        DeliveryResult::Duplicate {
            prior_delivery_id: first,
            status: DeliveryStatus::Pending,
        }
    );

    assert_eq!(h.drain(Lane::WebhookProcessing).await.unwrap(), 1);
    assert_eq!(h.exchange.count("create_order"), 1);
}

#[tokio::test]
async fn test_forged_alert_does_not_shadow_genuine_one() {
    let h = harness_with_account(HealthStatus::Healthy).await;
    let payload = json!({"ticker": "BTCUSDT", "action": "buy", "quantity": 0.01, "alert_id": "race-1"});

    let forged = h
        .pipeline
        .receive(PATH, payload.to_string().as_bytes(), json!({}), Some("sha256=00"))
        .await
        .unwrap();
    assert!(matches!(forged, DeliveryResult::InvalidSignature { .. }));

    let delivery_id = accepted_id(h.send(PATH, &payload, Some(SECRET)).await.unwrap());
    assert_eq!(h.drain(Lane::WebhookProcessing).await.unwrap(), 1);

    let delivery = h.store.get_delivery(delivery_id).await.unwrap().unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Success);
    assert_eq!(h.store.orders_for_delivery(delivery_id).await.unwrap().len(), 1);
    assert_eq!(h.exchange.count("create_order"), 1);
}

#[tokio::test]
async fn test_close_flattens_open_position() {
    let h = harness_with_account(HealthStatus::Healthy).await;
    h.exchange.set_positions(vec![PositionInfo {
        symbol: "BTCUSDT".to_string(),
        side: OrderSide::Buy,
        quantity: 0.05,
        entry_price: 29_000.0,
        mark_price: Some(30_000.0),
        unrealized_pnl: 50.0,
        leverage: Some(5),
    }]);

    let payload = json!({"ticker": "BTCUSDT", "action": "close"});
    let delivery_id = accepted_id(h.send(PATH, &payload, Some(SECRET)).await.unwrap());
    h.drain(Lane::WebhookProcessing).await.unwrap();

    let orders = h.store.orders_for_delivery(delivery_id).await.unwrap();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].role, OrderRole::Close);
    assert_eq!(orders[0].side, OrderSide::Sell);
    assert!(orders[0].reduce_only);
    assert!((orders[0].quantity - 0.05).abs() < 1e-9);
}

#[tokio::test]
async fn test_close_without_position_succeeds_with_no_orders() {
    let h = harness_with_account(HealthStatus::Healthy).await;
    let payload = json!({"ticker": "BTCUSDT", "action": "exit"});

    let delivery_id = accepted_id(h.send(PATH, &payload, Some(SECRET)).await.unwrap());
    h.drain(Lane::WebhookProcessing).await.unwrap();

    let delivery = h.store.get_delivery(delivery_id).await.unwrap().unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Success);
    assert_eq!(delivery.orders_created, 0);
    assert_eq!(h.exchange.count("create_order"), 0);
}

#[tokio::test]
async fn test_retried_delivery_reconciles_instead_of_resubmitting() {
    let h = Harness::without_backoff(Exchange::Bybit);
    seed_webhook(h.store.as_ref(), 1, PATH, None).await.unwrap();
    seed_account(h.store.as_ref(), &h.vault, 1, Exchange::Bybit, HealthStatus::Healthy)
        .await
        .unwrap();
    h.exchange
        .fail_next_create(ExchangeError::Unavailable("timeout".to_string()));

    let payload = json!({"ticker": "BTCUSDT", "action": "buy", "quantity": 0.01});
    let delivery_id = accepted_id(h.send(PATH, &payload, None).await.unwrap());
    assert_eq!(h.drain(Lane::WebhookProcessing).await.unwrap(), 2);

    let delivery = h.store.get_delivery(delivery_id).await.unwrap().unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Success);
    assert_eq!(delivery.retry_count, 1);
    assert_eq!(delivery.orders_created, 1);

    let cid = client_order_id(delivery_id, OrderRole::Entry);
    assert_eq!(h.exchange.count(&format!("get_order:{}", cid)), 1);
    assert_eq!(h.exchange.order_count(), 1);
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn router(h: &Harness, per_minute: u32) -> axum::Router {
    router_with_body_limit(h, per_minute, 64 * 1024)
}

fn router_with_body_limit(h: &Harness, per_minute: u32, body_limit_bytes: usize) -> axum::Router {
    build_router(
        AppState {
            pipeline: h.pipeline.clone(),
            orchestrator: h.orchestrator.clone(),
            vault: h.vault.clone(),
            cache: h.cache.clone(),
        },
        RouterOptions {
            admin_keys: AdminKeys::new([ADMIN_KEY]),
            webhook_limiter: create_rate_limiter(RateLimiterConfig {
                requests_per_minute: per_minute,
            }),
            body_limit_bytes,
        },
    )
}

#[tokio::test]
async fn test_http_webhook_always_answers_200() {
    let h = harness_with_account(HealthStatus::Healthy).await;
    let app = router(&h, 600);
    let payload = json!({"ticker": "BTCUSDT", "action": "buy", "quantity": 0.01});
    let signature = compute_signature(SECRET, &payload).unwrap();

    let response = app
        .clone()
        .oneshot(
            Request::post(format!("/webhooks/{}", PATH))
                .header("content-type", "application/json")
                .header("x-signature", format!("sha256={}", signature))
                .body(Body::from(payload.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: WebhookResponse = serde_json::from_value(body_json(response).await).unwrap();
    assert!(body.success);
    assert!(body.delivery_id.is_some());

    let response = app
        .oneshot(
            Request::post("/webhooks/does-not-exist")
                .body(Body::from(payload.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["message"], "Webhook not found");
}

#[tokio::test]
async fn test_http_oversized_body_answers_200() {
    let h = harness_with_account(HealthStatus::Healthy).await;
    let app = router_with_body_limit(&h, 600, 64);
    let payload = json!({"ticker": "BTCUSDT", "action": "buy", "quantity": 0.01, "comment": "x".repeat(128)});

    let response = app
        .oneshot(
            Request::post(format!("/webhooks/{}", PATH))
                .header("content-type", "application/json")
                .body(Body::from(payload.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["message"], "Payload too large");

    let webhook = h.store.get_webhook_by_path(PATH).await.unwrap().unwrap();
    assert_eq!(webhook.total_deliveries, 0);
}

#[tokio::test]
async fn test_http_rate_limit_and_admin_auth() {
    let h = harness_with_account(HealthStatus::Healthy).await;
    let app = router(&h, 1);
    let payload = json!({"ticker": "BTCUSDT", "action": "buy", "quantity": 0.01});

    let send = |app: axum::Router| {
        let body = payload.to_string();
        async move {
            app.oneshot(
                Request::post(format!("/webhooks/{}", PATH))
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap()
        }
    };
    assert_eq!(send(app.clone()).await.status(), StatusCode::OK);
    let limited = send(app.clone()).await;
    assert_eq!(limited.status(), StatusCode::OK);
    let body = body_json(limited).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["message"], "Rate limit exceeded");

    let unauthorized = app
        .clone()
        .oneshot(Request::get("/admin/queues").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(unauthorized.status(), StatusCode::UNAUTHORIZED);

    let stats = app
        .oneshot(
            Request::get("/admin/queues")
                .header("authorization", format!("Bearer {}", ADMIN_KEY))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(stats.status(), StatusCode::OK);
    let body = body_json(stats).await;
    assert_eq!(body["webhook_processing"]["pending"], 1);
}
