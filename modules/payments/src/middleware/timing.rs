//! Inner-handler timing. Mirrors the teacher's
//! `middleware::metrics::metrics_middleware`: wraps only the handler the
//! admission gate let through, recording `payments_request_duration_seconds`.

use std::time::Instant;

use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;

use crate::metrics::Metrics;

pub async fn timing_middleware(
    State(metrics): State<Metrics>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let route = req.uri().path().to_string();
    let start = Instant::now();

    let res = next.run(req).await;

    let status = res.status().as_u16().to_string();
    metrics
        .payments_request_duration_seconds
        .with_label_values(&[&route, &status])
        .observe(start.elapsed().as_secs_f64());

    res
}
