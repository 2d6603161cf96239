//! Referral commission ledger.
//!
//! Every successful payment gets exactly one `payment_commissions` row: either
//! the commission actually credited, or a zero-amount marker saying the
//! payment was checked and nothing was due. The unique constraint
//! `uq_payment_commissions_payment` is what makes this hold under concurrent
//! reconciliation; a violation means another trigger already decided, and its
//! decision is returned.

use crate::models::{CommissionEntry, CommissionOutcome, Payment, User};
use crate::services::database::USER_COLUMNS;
use crate::services::metrics::record_commission;
use service_core::error::AppError;
use sqlx::{Connection, FromRow, PgConnection};
use tracing::{info, instrument, warn};

const ENTRY_COLUMNS: &str =
    "id, payment_id, referrer_telegram_id, commission_amount, referred_telegram_id, created_at";

/// Commission for `amount` at `rate_bps` basis points, rounded down.
pub fn compute_commission(amount: i64, rate_bps: i64) -> i64 {
    if amount <= 0 || rate_bps <= 0 {
        return 0;
    }
    ((amount as i128 * rate_bps as i128) / 10_000) as i64
}

/// Why a payment earned no commission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoReferrer,
    NotFirstPayment,
    ReferrerNotFound,
    ZeroAmount,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoReferrer => "no_referrer",
            Self::NotFirstPayment => "not_first_payment",
            Self::ReferrerNotFound => "referrer_not_found",
            Self::ZeroAmount => "zero_amount",
        }
    }
}

#[derive(Debug, FromRow)]
struct LedgerWrite {
    #[sqlx(flatten)]
    entry: CommissionEntry,
    credited: i64,
}

/// Ledger entry for a payment, if one was recorded.
pub async fn find_entry(
    conn: &mut PgConnection,
    payment_id: i64,
) -> Result<Option<CommissionEntry>, AppError> {
    let entry = sqlx::query_as::<_, CommissionEntry>(&format!(
        "SELECT {ENTRY_COLUMNS} FROM payment_commissions WHERE payment_id = $1"
    ))
    .bind(payment_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(entry)
}

/// Decide and record the commission for a payment that has just been marked
/// successful, inside the caller's transaction.
///
/// `rate_bps` is the commission rate in basis points.
#[instrument(skip(conn, payment, user), fields(payment_id = payment.id, telegram_id = %user.telegram_id))]
pub async fn process_commission(
    conn: &mut PgConnection,
    payment: &Payment,
    user: &User,
    rate_bps: i64,
) -> Result<CommissionOutcome, AppError> {
    // Replay must be answered before any balance mutation.
    if let Some(existing) = find_entry(conn, payment.id).await? {
        warn!(
            commission_amount = existing.commission_amount,
            "Commission already recorded for payment, returning recorded outcome"
        );
        record_commission("replayed");
        return Ok(CommissionOutcome::from(&existing));
    }

    let Some(code) = user.referred_by_code.as_deref() else {
        return record_skip(conn, payment, SkipReason::NoReferrer).await;
    };

    let has_prior_success = sqlx::query_scalar::<_, bool>(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM payments
            WHERE telegram_id = $1 AND status = 'success' AND id <> $2
        )
        "#,
    )
    .bind(&payment.telegram_id)
    .bind(payment.id)
    .fetch_one(&mut *conn)
    .await?;

    if has_prior_success {
        return record_skip(conn, payment, SkipReason::NotFirstPayment).await;
    }

    let referrer = sqlx::query_as::<_, User>(&format!(
        "SELECT {USER_COLUMNS} FROM users WHERE ref_code = $1 AND deleted_at IS NULL"
    ))
    .bind(code)
    .fetch_optional(&mut *conn)
    .await?
    .filter(|r| r.telegram_id != user.telegram_id);

    let Some(referrer) = referrer else {
        warn!(referred_by_code = %code, "Referrer not found or self-referral");
        return record_skip(conn, payment, SkipReason::ReferrerNotFound).await;
    };

    let commission = compute_commission(payment.amount, rate_bps);
    if commission == 0 {
        return record_skip(conn, payment, SkipReason::ZeroAmount).await;
    }

    let outcome = write_entry(conn, payment, Some(&referrer.telegram_id), commission).await?;

    if outcome.paid {
        info!(
            referrer_telegram_id = %referrer.telegram_id,
            commission_amount = commission,
            payment_amount = payment.amount,
            "Referral commission credited"
        );
    }

    Ok(outcome)
}

async fn record_skip(
    conn: &mut PgConnection,
    payment: &Payment,
    reason: SkipReason,
) -> Result<CommissionOutcome, AppError> {
    info!(reason = reason.as_str(), "No commission due, recording marker");
    let outcome = write_entry(conn, payment, None, 0).await?;
    if !outcome.paid {
        record_commission(reason.as_str());
    }
    Ok(outcome)
}

/// Insert the ledger row and credit the referrer in one statement, inside a
/// savepoint. A unique violation rolls back only the savepoint and yields the
/// entry written by whoever got there first.
async fn write_entry(
    conn: &mut PgConnection,
    payment: &Payment,
    referrer_telegram_id: Option<&str>,
    amount: i64,
) -> Result<CommissionOutcome, AppError> {
    let mut savepoint = conn.begin().await?;

    let result = sqlx::query_as::<_, LedgerWrite>(
        r#"
        WITH entry AS (
            INSERT INTO payment_commissions
                (payment_id, referrer_telegram_id, commission_amount, referred_telegram_id)
            VALUES ($1, $2, $3, $4)
            RETURNING id, payment_id, referrer_telegram_id, commission_amount,
                      referred_telegram_id, created_at
        ),
        credit AS (
            UPDATE users
            SET commission_balance = commission_balance + $3, updated_at = NOW()
            WHERE $2::TEXT IS NOT NULL
              AND $3 > 0
              AND telegram_id = $2
              AND deleted_at IS NULL
            RETURNING id
        )
        SELECT entry.*, (SELECT COUNT(*) FROM credit) AS credited
        FROM entry
        "#,
    )
    .bind(payment.id)
    .bind(referrer_telegram_id)
    .bind(amount)
    .bind(&payment.telegram_id)
    .fetch_one(&mut *savepoint)
    .await;

    match result {
        Ok(write) => {
            let expected = i64::from(referrer_telegram_id.is_some() && amount > 0);
            if write.credited != expected {
                savepoint.rollback().await?;
                return Err(AppError::Conflict(anyhow::anyhow!(
                    "Referrer {:?} could not be credited for payment {}",
                    referrer_telegram_id,
                    payment.id
                )));
            }
            savepoint.commit().await?;

            let outcome = CommissionOutcome::from(&write.entry);
            if outcome.paid {
                record_commission("paid");
            }
            Ok(outcome)
        }
        Err(sqlx::Error::Database(ref db_err)) if db_err.is_unique_violation() => {
            // Another trigger recorded this payment first: its decision stands.
            savepoint.rollback().await?;
            warn!(payment_id = payment.id, "Concurrent commission write detected");
            record_commission("concurrent");

            let existing = find_entry(conn, payment.id).await?.ok_or_else(|| {
                AppError::InternalError(anyhow::anyhow!(
                    "Commission entry for payment {} missing after unique violation",
                    payment.id
                ))
            })?;
            Ok(CommissionOutcome::from(&existing))
        }
        Err(e) => Err(AppError::DatabaseError(anyhow::anyhow!(
            "Failed to record commission: {}",
            e
        ))),
    }
}
