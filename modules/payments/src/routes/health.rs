//! Liveness/readiness endpoints, the HTTP-equivalent of a standard
//! health-check RPC.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use health::{ReadinessCheck, ServingGate};

#[derive(Clone)]
pub struct HealthState {
    pub checks: Arc<Vec<Box<dyn ReadinessCheck>>>,
    pub serving: ServingGate,
}

pub async fn live() -> StatusCode {
    health::live().await
}

/// Reports NOT_SERVING once shutdown has begun, even if dependencies are
/// still reachable, so load balancers start draining traffic immediately.
pub async fn ready(State(state): State<HealthState>) -> impl IntoResponse {
    if !state.serving.is_serving() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    health::ready(&state.checks).await.into_response()
}

pub struct DbReadiness(pub sqlx::PgPool);

#[async_trait::async_trait]
impl ReadinessCheck for DbReadiness {
    fn name(&self) -> &'static str {
        "database"
    }

    async fn check(&self) -> Result<(), String> {
        sqlx::query("SELECT 1")
            .execute(&self.0)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}
