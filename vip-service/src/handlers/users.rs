//! User registration, VIP status and referral summary.

use crate::dtos::{RegisterUserRequest, UserResponse};
use crate::middleware::TelegramUser;
use crate::models::{ReferralStats, VipStatus};
use crate::services::vip;
use crate::startup::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use service_core::error::AppError;
use validator::Validate;

fn ensure_self(user: &TelegramUser, telegram_id: &str) -> Result<(), AppError> {
    if user.telegram_id != telegram_id {
        return Err(AppError::Forbidden(anyhow::anyhow!(
            "Cannot access another user's data"
        )));
    }
    Ok(())
}

/// Idempotent registration; a referral code only counts on first creation.
pub async fn register_user(
    State(state): State<AppState>,
    user: TelegramUser,
    body: Option<Json<RegisterUserRequest>>,
) -> Result<(StatusCode, Json<UserResponse>), AppError> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    req.validate()?;

    let (account, created) = state
        .db
        .register_user(
            &user.telegram_id,
            user.username.as_deref(),
            req.referral_code.as_deref(),
        )
        .await?;

    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(UserResponse::new(account, created))))
}

pub async fn get_vip_status(
    State(state): State<AppState>,
    user: TelegramUser,
    Path(telegram_id): Path<String>,
) -> Result<Json<VipStatus>, AppError> {
    ensure_self(&user, &telegram_id)?;

    let status = vip::vip_status(state.db.pool(), &telegram_id, chrono::Utc::now())
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("User not found")))?;

    Ok(Json(status))
}

pub async fn get_referral_stats(
    State(state): State<AppState>,
    user: TelegramUser,
    Path(telegram_id): Path<String>,
) -> Result<Json<ReferralStats>, AppError> {
    ensure_self(&user, &telegram_id)?;

    let stats = state
        .db
        .referral_stats(&telegram_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("User not found")))?;

    Ok(Json(stats))
}
