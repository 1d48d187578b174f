//! Admission gate.
//!
//! Runs before anything else in the chain. On reject it answers directly
//! with the transport-level RESOURCE_EXHAUSTED mapping and increments the
//! rejection counter itself; the inner timing layer never sees a rejected
//! request, so it can't double-count it.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;

use crate::ratelimit::{Admission, RateLimiter};

#[derive(Clone)]
pub struct RateLimitState {
    pub limiter: Arc<RateLimiter>,
    pub limit: u32,
    pub window: std::time::Duration,
    pub metrics: crate::metrics::Metrics,
}

/// Caller identity for the limiter key: client id if present, else caller
/// IP, else method name.
fn admission_key<B>(req: &Request<B>) -> String {
    if let Some(client_id) = req
        .headers()
        .get("x-client-id")
        .and_then(|v| v.to_str().ok())
    {
        return format!("client:{client_id}");
    }
    if let Some(ConnectInfo(addr)) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        return format!("ip:{}", addr.ip());
    }
    format!("method:{}", req.uri().path())
}

pub async fn admission_gate(
    State(state): State<RateLimitState>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let key = admission_key(&req);

    match state.limiter.allow(&key, state.limit, state.window).await {
        Admission::Admitted | Admission::AdmittedFailOpen => next.run(req).await,
        Admission::Rejected => {
            state.metrics.payments_rate_limited_total.inc();
            (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({
                    "error": {
                        "code": "RATE_LIMITED",
                        "message": "too many requests, try again later",
                    }
                })),
            )
                .into_response()
        }
    }
}
