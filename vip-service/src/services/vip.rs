//! VIP expiry arithmetic.
//!
//! Expiry is always extended with one conditional UPDATE so concurrent grants
//! for the same user compose instead of overwriting each other.

use crate::models::VipStatus;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use sqlx::{PgConnection, PgPool};
use tracing::{info, instrument};

/// Add `days` of VIP to a user row, starting from `now` if the current
/// expiry is null or elapsed, otherwise from the current expiry.
///
/// A missing user row is an error so the surrounding transaction rolls back.
#[instrument(skip(conn))]
pub async fn extend_vip(
    conn: &mut PgConnection,
    user_id: i64,
    days: i32,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, AppError> {
    if days <= 0 {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "VIP extension must be positive, got {} days",
            days
        )));
    }

    let new_expiry = sqlx::query_scalar::<_, DateTime<Utc>>(
        r#"
        UPDATE users
        SET is_vip = TRUE,
            vip_expires_at = CASE
                WHEN vip_expires_at IS NULL OR vip_expires_at <= $2
                    THEN $2 + ($3::int * INTERVAL '1 day')
                ELSE vip_expires_at + ($3::int * INTERVAL '1 day')
            END,
            updated_at = $2
        WHERE id = $1
        RETURNING vip_expires_at
        "#,
    )
    .bind(user_id)
    .bind(now)
    .bind(days)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to extend VIP: {}", e)))?
    .ok_or_else(|| {
        AppError::NotFound(anyhow::anyhow!(
            "User row {} vanished during VIP extension",
            user_id
        ))
    })?;

    info!(
        user_id = user_id,
        days = days,
        vip_expires_at = %new_expiry,
        "VIP extended"
    );

    Ok(new_expiry)
}

/// Clear a stale VIP flag for one user. Returns whether a row changed.
#[instrument(skip(pool))]
pub async fn expire_stale_vip(
    pool: &PgPool,
    telegram_id: &str,
    now: DateTime<Utc>,
) -> Result<bool, AppError> {
    let result = sqlx::query(
        r#"
        UPDATE users
        SET is_vip = FALSE, updated_at = $2
        WHERE telegram_id = $1
          AND is_vip
          AND (vip_expires_at IS NULL OR vip_expires_at <= $2)
        "#,
    )
    .bind(telegram_id)
    .bind(now)
    .execute(pool)
    .await?;

    if result.rows_affected() > 0 {
        info!(telegram_id = %telegram_id, "Stale VIP flag cleared");
    }

    Ok(result.rows_affected() > 0)
}

/// Clear every stale VIP flag. Returns the number of users corrected.
#[instrument(skip(pool))]
pub async fn expire_all_stale_vip(pool: &PgPool, now: DateTime<Utc>) -> Result<u64, AppError> {
    let result = sqlx::query(
        r#"
        UPDATE users
        SET is_vip = FALSE, updated_at = $1
        WHERE is_vip AND (vip_expires_at IS NULL OR vip_expires_at <= $1)
        "#,
    )
    .bind(now)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// VIP status of a live user, correcting a stale flag first.
#[instrument(skip(pool))]
pub async fn vip_status(
    pool: &PgPool,
    telegram_id: &str,
    now: DateTime<Utc>,
) -> Result<Option<VipStatus>, AppError> {
    expire_stale_vip(pool, telegram_id, now).await?;

    let row = sqlx::query_as::<_, (bool, Option<DateTime<Utc>>)>(
        "SELECT is_vip, vip_expires_at FROM users WHERE telegram_id = $1 AND deleted_at IS NULL",
    )
    .bind(telegram_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|(is_vip, vip_expires_at)| VipStatus {
        telegram_id: telegram_id.to_string(),
        is_vip,
        vip_expires_at,
    }))
}
