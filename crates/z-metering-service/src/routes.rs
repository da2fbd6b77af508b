//! Router configuration.
//!
//! This module sets up the Axum router with all routes and middleware.

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{credits, health, plans, reservations, subscription, usage, webhooks};
use crate::state::AppState;

// ============================================================================
// Concurrency Limiting Constants
// ============================================================================

/// Maximum concurrent requests for reservation endpoints.
/// Every paid action passes through here, so the limit is higher.
const RESERVATION_MAX_CONCURRENT_REQUESTS: usize = 100;

/// Maximum concurrent requests for general API endpoints.
const API_MAX_CONCURRENT_REQUESTS: usize = 50;

/// Create the service router with all routes and middleware.
///
/// # Routes
///
/// ## Public
/// - `GET /health` - Health check
/// - `GET /v1/plans` - Plan catalog
///
/// ## Subscription (user JWT)
/// - `GET /v1/subscription` - Current subscription
/// - `GET /v1/subscription/plan` - Active plan
/// - `POST /v1/subscription/plan` - Change plan
/// - `POST /v1/subscription/cancel` - Cancel
///
/// ## Credits and usage (user JWT)
/// - `GET /v1/credits/balance` - Current period balance
/// - `GET /v1/usage` - Usage history
/// - `GET /v1/usage/reconcile` - Usage log audit
///
/// ## Reservations (service API key, rate-limited)
/// - `POST /v1/reservations` - Reserve credits
/// - `POST /v1/reservations/:id/commit` - Commit
/// - `POST /v1/reservations/:id/release` - Release
///
/// ## Webhooks (service API key)
/// - `POST /webhooks/gateway` - Normalized payment gateway events
pub fn create_router(state: AppState) -> Router {
    let cors_origins = state.config.cors_origins.clone();
    let max_body_bytes = state.config.max_body_bytes;
    let request_timeout_seconds = state.config.request_timeout_seconds;

    let cors = build_cors_layer(&cors_origins);

    let state = Arc::new(state);

    let reservation_routes = Router::new()
        .route("/", post(reservations::reserve))
        .route("/:id/commit", post(reservations::commit))
        .route("/:id/release", post(reservations::release))
        .layer(ConcurrencyLimitLayer::new(
            RESERVATION_MAX_CONCURRENT_REQUESTS,
        ));

    let api_routes = Router::new()
        // Plans
        .route("/plans", get(plans::list_plans))
        // Subscription
        .route("/subscription", get(subscription::get_subscription))
        .route(
            "/subscription/plan",
            get(subscription::get_active_plan).post(subscription::change_plan),
        )
        .route("/subscription/cancel", post(subscription::cancel_subscription))
        // Credits
        .route("/credits/balance", get(credits::get_balance))
        // Usage
        .route("/usage", get(usage::list_usage))
        .route("/usage/reconcile", get(usage::reconcile))
        // Reservations (with their own concurrency limit)
        .nest("/reservations", reservation_routes)
        .layer(ConcurrencyLimitLayer::new(API_MAX_CONCURRENT_REQUESTS));

    Router::new()
        .route("/health", get(health::health))
        .nest("/v1", api_routes)
        .route("/webhooks/gateway", post(webhooks::gateway_webhook))
        // Global middleware
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(TimeoutLayer::new(Duration::from_secs(
            request_timeout_seconds,
        )))
        .with_state(state)
}

/// Build the CORS layer from configured origins.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}
