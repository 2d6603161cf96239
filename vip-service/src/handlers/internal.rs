//! Operator endpoints behind the admin token.

use crate::dtos::WithdrawalResponse;
use crate::middleware::AdminToken;
use crate::services::reconciliation::{ReconcileOutcome, Trigger};
use crate::startup::AppState;
use crate::workers::SyncStats;
use axum::{
    extract::{Path, State},
    Json,
};
use service_core::error::AppError;

pub async fn approve_withdrawal(
    State(state): State<AppState>,
    _admin: AdminToken,
    Path(id): Path<i64>,
) -> Result<Json<WithdrawalResponse>, AppError> {
    let withdrawal = state.withdrawals.approve(id).await?;
    Ok(Json(withdrawal.into()))
}

pub async fn reject_withdrawal(
    State(state): State<AppState>,
    _admin: AdminToken,
    Path(id): Path<i64>,
) -> Result<Json<WithdrawalResponse>, AppError> {
    let withdrawal = state.withdrawals.reject(id).await?;
    Ok(Json(withdrawal.into()))
}

pub async fn sync_stats(State(state): State<AppState>, _admin: AdminToken) -> Json<SyncStats> {
    Json(state.sync.stats())
}

/// Re-check a single payment against the gateway right now.
pub async fn sync_payment(
    State(state): State<AppState>,
    _admin: AdminToken,
    Path(transaction_id): Path<String>,
) -> Result<Json<ReconcileOutcome>, AppError> {
    let payment = state
        .db
        .get_payment_by_transaction_id(&transaction_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Payment not found")))?;

    tracing::info!(payment_id = payment.id, transaction_id = %transaction_id, "Manual payment sync");

    let outcome = state
        .coordinator
        .reconcile_from_gateway(&payment, Trigger::Manual)
        .await?;

    Ok(Json(outcome))
}
