//! Commission withdrawal requests from users.

use crate::dtos::{WithdrawalRequest, WithdrawalResponse};
use crate::middleware::TelegramUser;
use crate::models::NewWithdrawal;
use crate::startup::AppState;
use axum::{extract::State, http::StatusCode, Json};
use service_core::error::AppError;
use validator::Validate;

pub async fn request_withdrawal(
    State(state): State<AppState>,
    user: TelegramUser,
    Json(req): Json<WithdrawalRequest>,
) -> Result<(StatusCode, Json<WithdrawalResponse>), AppError> {
    req.validate()?;

    let withdrawal = state
        .withdrawals
        .request(&NewWithdrawal {
            telegram_id: user.telegram_id,
            amount: req.amount,
            payment_method: req.payment_method,
            account_number: req.account_number,
            account_name: req.account_name,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(withdrawal.into())))
}

pub async fn list_withdrawals(
    State(state): State<AppState>,
    user: TelegramUser,
) -> Result<Json<Vec<WithdrawalResponse>>, AppError> {
    let withdrawals = state.db.list_user_withdrawals(&user.telegram_id).await?;
    Ok(Json(withdrawals.into_iter().map(Into::into).collect()))
}
