//! HTTP surface
//!
//! `POST /webhooks/:url_path` is public and rate limited, and answers 200 to
//! every request. The `/admin` routes require a bearer key. `GET /health` is open.

pub mod admin_handler;
pub mod webhook_handler;

use axum::{
    body::Body,
    extract::Request,
    middleware::{self, Next},
    routing::{delete, get, post},
    Extension, Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::application::orchestrator::Orchestrator;
use crate::application::services::webhook_pipeline::WebhookPipeline;
use crate::auth::{require_auth, AdminKeys};
use crate::domain::services::credential_vault::CredentialVault;
use crate::domain::services::positions_cache::PositionsCache;
use self::webhook_handler::WebhookBodyLimit;
use crate::rate_limit::{rate_limit_middleware, GlobalRateLimiter};

/// Shared state of every handler
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<WebhookPipeline>,
    pub orchestrator: Arc<Orchestrator>,
    pub vault: Arc<CredentialVault>,
    pub cache: Arc<PositionsCache>,
}

pub struct RouterOptions {
    pub admin_keys: AdminKeys,
    pub webhook_limiter: GlobalRateLimiter,
    pub body_limit_bytes: usize,
}

pub fn build_router(state: AppState, options: RouterOptions) -> Router {
    let limiter = options.webhook_limiter;
    let webhooks = Router::new()
        .route("/webhooks/:url_path", post(webhook_handler::receive_webhook))
        .layer(middleware::from_fn(move |request: Request, next: Next| {
            rate_limit_middleware(limiter.clone(), request, next)
        }))
        .layer(Extension(WebhookBodyLimit(options.body_limit_bytes)));

    let admin = Router::new()
        .route("/admin/tasks/:id", get(admin_handler::get_task))
        .route("/admin/tasks/:id/retry", post(admin_handler::retry_task))
        .route("/admin/tasks/:id/cancel", post(admin_handler::cancel_task))
        .route("/admin/queues", get(admin_handler::queue_stats))
        .route("/admin/queues/:lane", delete(admin_handler::purge_queue))
        .route("/admin/workers", get(admin_handler::workers))
        .route("/admin/cache/clear", post(admin_handler::clear_cache))
        .layer(
            ServiceBuilder::new()
                .layer(RequestBodyLimitLayer::new(options.body_limit_bytes))
                .map_request(|request: axum::http::Request<_>| request.map(Body::new))
                .layer(middleware::from_fn_with_state(options.admin_keys, require_auth)),
        );

    Router::new()
        .route("/health", get(admin_handler::health))
        .merge(webhooks)
        .merge(admin)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
