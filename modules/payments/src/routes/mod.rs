//! The admission/observability glue: a thin JSON front door onto
//! `AuthorizationEngine`/`Storage`, plus health and metrics. Routes are
//! merged onto one `Router`, with middleware layered so the admission
//! gate sits outermost.

pub mod authorize;
pub mod balance;
pub mod health;
pub mod metrics;
pub mod payment;

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::engine::AuthorizationEngine;
use crate::metrics::Metrics;
use crate::middleware::rate_limit::{admission_gate, RateLimitState};
use crate::middleware::timing::timing_middleware;
use crate::ratelimit::RateLimiter;
use crate::storage::Storage;

#[derive(Clone)]
pub struct AppState<S: Storage> {
    pub engine: Arc<AuthorizationEngine<S>>,
    pub storage: S,
    pub metrics: Metrics,
}

/// The main RPC-equivalent router: `AuthorizePayment`, `GetPayment`,
/// `GetAccountBalance`, admission-gated and timed.
pub fn api_router<S: Storage + Clone + 'static>(
    state: AppState<S>,
    rate_limiter: Arc<RateLimiter>,
    rate_limit_per_window: u32,
    rate_limit_window: Duration,
) -> Router {
    let rl_state = RateLimitState {
        limiter: rate_limiter,
        limit: rate_limit_per_window,
        window: rate_limit_window,
        metrics: state.metrics.clone(),
    };

    let inner = Router::new()
        .route("/v1/payments", post(authorize::authorize_payment::<S>))
        .route("/v1/payments/{id}", get(payment::get_payment::<S>))
        .route(
            "/v1/accounts/{id}/balance",
            get(balance::get_account_balance::<S>),
        )
        .with_state(state.clone())
        .layer(axum::middleware::from_fn_with_state(
            state.metrics.clone(),
            timing_middleware,
        ));

    Router::new()
        .merge(inner)
        .layer(axum::middleware::from_fn_with_state(
            rl_state,
            admission_gate,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Liveness/readiness, served on the same listener as the API router in
/// this minimal front door.
pub fn health_router(checks: health::HealthState) -> Router {
    Router::new()
        .route("/health/live", get(health::live))
        .route("/health/ready", get(health::ready))
        .with_state(checks)
}

/// Plain-text metrics on a separate listener.
pub fn metrics_router(metrics: Metrics) -> Router {
    Router::new()
        .route("/metrics", get(metrics::metrics))
        .with_state(metrics)
}
