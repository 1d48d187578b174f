//! Shared liveness/readiness helpers.
//!
//! Every service binary in this workspace wires the same two checks:
//! a liveness probe that never touches a dependency, and a readiness
//! probe that does. This crate fixes the shape of both so a load
//! balancer's health-check config doesn't have to vary per service.

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

/// A single dependency's up/down state as seen by a readiness probe.
#[derive(Debug, Clone, Serialize)]
pub struct DependencyStatus {
    pub name: &'static str,
    pub up: bool,
}

/// A dependency a readiness probe should check before answering SERVING.
#[async_trait::async_trait]
pub trait ReadinessCheck: Send + Sync {
    /// Name used in the rendered readiness report (e.g. "database", "broker").
    fn name(&self) -> &'static str;

    /// `Ok(())` if the dependency is reachable and usable.
    async fn check(&self) -> Result<(), String>;
}

/// Liveness is process-level: if this handler runs at all, the process is alive.
pub async fn live() -> StatusCode {
    StatusCode::OK
}

/// Run every registered readiness check and report SERVING only if all pass.
///
/// Used both by the HTTP readiness endpoint and by the graceful-shutdown
/// path, which flips this to NOT_SERVING before draining in-flight work.
pub async fn ready(checks: &[Box<dyn ReadinessCheck>]) -> impl IntoResponse {
    let mut statuses = Vec::with_capacity(checks.len());
    let mut all_up = true;

    for check in checks {
        let up = check.check().await.is_ok();
        all_up &= up;
        statuses.push(DependencyStatus {
            name: check.name(),
            up,
        });
    }

    let status = if all_up {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, Json(ReadinessReport { status: if all_up { "ready" } else { "not_ready" }, dependencies: statuses }))
}

#[derive(Debug, Serialize)]
struct ReadinessReport {
    status: &'static str,
    dependencies: Vec<DependencyStatus>,
}

/// Flipped to `false` on shutdown signal so `ready()` reports NOT_SERVING
/// while in-flight RPCs drain.
#[derive(Clone, Default)]
pub struct ServingGate(std::sync::Arc<std::sync::atomic::AtomicBool>);

impl ServingGate {
    pub fn new() -> Self {
        Self(std::sync::Arc::new(std::sync::atomic::AtomicBool::new(true)))
    }

    pub fn is_serving(&self) -> bool {
        self.0.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn stop_serving(&self) {
        self.0.store(false, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysUp;
    #[async_trait::async_trait]
    impl ReadinessCheck for AlwaysUp {
        fn name(&self) -> &'static str {
            "always_up"
        }
        async fn check(&self) -> Result<(), String> {
            Ok(())
        }
    }

    struct AlwaysDown;
    #[async_trait::async_trait]
    impl ReadinessCheck for AlwaysDown {
        fn name(&self) -> &'static str {
            "always_down"
        }
        async fn check(&self) -> Result<(), String> {
            Err("nope".to_string())
        }
    }

    #[tokio::test]
    async fn ready_is_ok_when_all_dependencies_up() {
        let checks: Vec<Box<dyn ReadinessCheck>> = vec![Box::new(AlwaysUp)];
        let resp = ready(&checks).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn ready_is_unavailable_when_any_dependency_down() {
        let checks: Vec<Box<dyn ReadinessCheck>> = vec![Box::new(AlwaysUp), Box::new(AlwaysDown)];
        let resp = ready(&checks).await.into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn serving_gate_starts_serving_and_can_be_stopped() {
        let gate = ServingGate::new();
        assert!(gate.is_serving());
        gate.stop_serving();
        assert!(!gate.is_serving());
    }
}
