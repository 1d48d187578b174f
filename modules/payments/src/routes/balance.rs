//! `GetAccountBalance`: `{account_id, available_cents, pending_cents,
//! currency}` or 404.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde::Serialize;

use crate::routes::AppState;
use crate::storage::Storage;

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub account_id: String,
    pub available_cents: i64,
    pub pending_cents: i64,
    pub currency: String,
}

pub async fn get_account_balance<S: Storage + Clone + 'static>(
    State(state): State<AppState<S>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.storage.get_account_balance(&id).await {
        Ok(Some(balance)) => (
            StatusCode::OK,
            Json(BalanceResponse {
                account_id: balance.account_id,
                available_cents: balance.available_minor,
                pending_cents: balance.pending_minor,
                currency: balance.currency,
            }),
        )
            .into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}
