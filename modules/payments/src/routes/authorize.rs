//! `AuthorizePayment` handler.
//!
//! Translates `AuthorizationEngine::authorize`'s sum-typed result into
//! HTTP status: OK for any domain outcome, 400 for missing fields, 503
//! for transient infrastructure failure. Rate limiting itself never
//! reaches this handler; the admission gate upstream short-circuits
//! first.

use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use chrono::Utc;
use serde::Serialize;

use crate::engine::{AuthorizeCommand, OutwardStatus};
use crate::routes::AppState;
use crate::storage::Storage;

#[derive(Debug, Serialize)]
pub struct AuthorizeResponse {
    pub payment_id: String,
    pub status: OutwardStatus,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub processed_at: chrono::DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: &'static str,
    pub message: String,
}

pub async fn authorize_payment<S: Storage + Clone + 'static>(
    State(state): State<AppState<S>>,
    Json(cmd): Json<AuthorizeCommand>,
) -> impl IntoResponse {
    let start = Instant::now();
    let outcome = state.engine.authorize(cmd).await;
    state
        .metrics
        .payments_authorize_duration_seconds
        .observe(start.elapsed().as_secs_f64());

    match outcome {
        Ok(Ok(outcome)) => {
            let status_label = match outcome.status {
                OutwardStatus::Authorized => "authorized",
                OutwardStatus::Declined => "declined",
                OutwardStatus::Duplicate => "duplicate",
            };
            state
                .metrics
                .payments_requests_total
                .with_label_values(&[status_label])
                .inc();

            let body = AuthorizeResponse {
                payment_id: outcome.payment_id,
                status: outcome.status,
                error_code: outcome.error_code,
                error_message: outcome.error_message,
                processed_at: Utc::now(),
            };
            (StatusCode::OK, Json(body)).into_response()
        }
        Ok(Err(invalid)) => {
            state
                .metrics
                .payments_requests_total
                .with_label_values(&["invalid_argument"])
                .inc();
            (
                StatusCode::BAD_REQUEST,
                Json(ErrorBody {
                    error: ErrorDetail {
                        code: "INVALID_ARGUMENT",
                        message: invalid.0,
                    },
                }),
            )
                .into_response()
        }
        Err(transient) => {
            state
                .metrics
                .payments_requests_total
                .with_label_values(&["transient"])
                .inc();
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ErrorBody {
                    error: ErrorDetail {
                        code: "UNAVAILABLE",
                        message: transient.reason,
                    },
                }),
            )
                .into_response()
        }
    }
}
