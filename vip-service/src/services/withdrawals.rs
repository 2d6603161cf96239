//! Commission withdrawals: request, approve, reject.
//!
//! Requests do not reserve balance; approval deducts it with a conditional
//! update so a balance can never go negative even if two approvals race.

use crate::models::{NewWithdrawal, Withdrawal, WithdrawalStatus};
use crate::services::database::{Database, WITHDRAWAL_COLUMNS};
use crate::services::notifier::format_rupiah;
use chrono::Utc;
use service_core::error::AppError;
use sqlx::PgConnection;
use std::sync::Arc;
use tracing::{info, instrument};

#[derive(Clone)]
pub struct WithdrawalService {
    db: Arc<Database>,
    min_withdrawal: i64,
}

impl WithdrawalService {
    pub fn new(db: Arc<Database>, min_withdrawal: i64) -> Self {
        Self { db, min_withdrawal }
    }

    pub fn min_withdrawal(&self) -> i64 {
        self.min_withdrawal
    }

    /// Validate and record a withdrawal request in `pending`.
    #[instrument(skip(self, input), fields(telegram_id = %input.telegram_id, amount = input.amount))]
    pub async fn request(&self, input: &NewWithdrawal) -> Result<Withdrawal, AppError> {
        if input.amount < self.min_withdrawal {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Minimum withdrawal is {}",
                format_rupiah(self.min_withdrawal)
            )));
        }

        let mut tx = self.db.pool().begin().await?;

        let balance = sqlx::query_scalar::<_, i64>(
            "SELECT commission_balance FROM users \
             WHERE telegram_id = $1 AND deleted_at IS NULL FOR UPDATE",
        )
        .bind(&input.telegram_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("User not found")))?;

        if input.amount > balance {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Insufficient balance: available {}, requested {}",
                format_rupiah(balance),
                format_rupiah(input.amount)
            )));
        }

        let withdrawal = sqlx::query_as::<_, Withdrawal>(&format!(
            "INSERT INTO withdrawals (telegram_id, amount, payment_method, account_number, account_name) \
             VALUES ($1, $2, $3, $4, $5) \
             RETURNING {WITHDRAWAL_COLUMNS}"
        ))
        .bind(&input.telegram_id)
        .bind(input.amount)
        .bind(&input.payment_method)
        .bind(&input.account_number)
        .bind(&input.account_name)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                AppError::Conflict(anyhow::anyhow!(
                    "A pending withdrawal already exists; wait until it is processed"
                ))
            }
            _ => AppError::DatabaseError(anyhow::anyhow!("Failed to create withdrawal: {}", e)),
        })?;

        tx.commit().await?;

        info!(withdrawal_id = withdrawal.id, "Withdrawal requested");
        Ok(withdrawal)
    }

    /// Approve a pending withdrawal and deduct the balance.
    #[instrument(skip(self))]
    pub async fn approve(&self, withdrawal_id: i64) -> Result<Withdrawal, AppError> {
        let mut tx = self.db.pool().begin().await?;
        let withdrawal = lock_pending(&mut tx, withdrawal_id).await?;

        let deducted = sqlx::query(
            r#"
            UPDATE users
            SET commission_balance = commission_balance - $2, updated_at = NOW()
            WHERE telegram_id = $1 AND deleted_at IS NULL AND commission_balance >= $2
            "#,
        )
        .bind(&withdrawal.telegram_id)
        .bind(withdrawal.amount)
        .execute(&mut *tx)
        .await?;

        if deducted.rows_affected() == 0 {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Insufficient balance to approve withdrawal {}",
                withdrawal_id
            )));
        }

        let approved = finish(&mut tx, withdrawal_id, WithdrawalStatus::Approved).await?;
        tx.commit().await?;

        info!(
            withdrawal_id = approved.id,
            telegram_id = %approved.telegram_id,
            amount = approved.amount,
            "Withdrawal approved"
        );
        Ok(approved)
    }

    /// Reject a pending withdrawal; the balance is left untouched.
    #[instrument(skip(self))]
    pub async fn reject(&self, withdrawal_id: i64) -> Result<Withdrawal, AppError> {
        let mut tx = self.db.pool().begin().await?;
        lock_pending(&mut tx, withdrawal_id).await?;
        let rejected = finish(&mut tx, withdrawal_id, WithdrawalStatus::Rejected).await?;
        tx.commit().await?;

        info!(
            withdrawal_id = rejected.id,
            telegram_id = %rejected.telegram_id,
            "Withdrawal rejected"
        );
        Ok(rejected)
    }
}

async fn lock_pending(conn: &mut PgConnection, withdrawal_id: i64) -> Result<Withdrawal, AppError> {
    let withdrawal = sqlx::query_as::<_, Withdrawal>(&format!(
        "SELECT {WITHDRAWAL_COLUMNS} FROM withdrawals WHERE id = $1 FOR UPDATE"
    ))
    .bind(withdrawal_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Withdrawal {} not found", withdrawal_id)))?;

    if withdrawal.status() != WithdrawalStatus::Pending {
        return Err(AppError::Conflict(anyhow::anyhow!(
            "Withdrawal {} is already {}",
            withdrawal_id,
            withdrawal.status
        )));
    }

    Ok(withdrawal)
}

async fn finish(
    conn: &mut PgConnection,
    withdrawal_id: i64,
    status: WithdrawalStatus,
) -> Result<Withdrawal, AppError> {
    let withdrawal = sqlx::query_as::<_, Withdrawal>(&format!(
        "UPDATE withdrawals SET status = $2, processed_at = $3 WHERE id = $1 \
         RETURNING {WITHDRAWAL_COLUMNS}"
    ))
    .bind(withdrawal_id)
    .bind(status.as_str())
    .bind(Utc::now())
    .fetch_one(&mut *conn)
    .await?;

    Ok(withdrawal)
}
