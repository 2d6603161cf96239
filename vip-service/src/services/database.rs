//! Database service for vip-service.
//!
//! Plain reads and single-statement writes live here. Multi-step
//! transactional procedures (reconciliation, commission, withdrawals) take a
//! connection from [`Database::pool`] and run in their own modules.

use crate::models::{NewPayment, Payment, ReferralStats, User, Withdrawal};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument, warn};

pub(crate) const USER_COLUMNS: &str = "id, telegram_id, username, ref_code, referred_by_code, is_vip, \
     vip_expires_at, commission_balance, total_referrals, created_at, updated_at, deleted_at";

pub(crate) const PAYMENT_COLUMNS: &str = "id, telegram_id, order_id, transaction_id, package_name, amount, \
     status, qris_string, failure_reason, created_at, paid_at, updated_at";

pub(crate) const WITHDRAWAL_COLUMNS: &str = "id, telegram_id, amount, payment_method, account_number, \
     account_name, status, created_at, processed_at";

const REF_CODE_ATTEMPTS: usize = 5;

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "vip-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Wrap an existing pool (tests build one lazily).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // User Operations
    // -------------------------------------------------------------------------

    /// Live (not soft-deleted) user by Telegram id.
    #[instrument(skip(self))]
    pub async fn get_user(&self, telegram_id: &str) -> Result<Option<User>, AppError> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE telegram_id = $1 AND deleted_at IS NULL"
        ))
        .bind(telegram_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get user: {}", e)))?;

        Ok(user)
    }

    /// Register a user if absent. Returns the user and whether it was created.
    ///
    /// `referral_code` only takes effect on creation and only when it resolves
    /// to another live user, whose `total_referrals` is bumped in the same
    /// transaction. An existing user's referrer is never changed.
    #[instrument(skip(self, username))]
    pub async fn register_user(
        &self,
        telegram_id: &str,
        username: Option<&str>,
        referral_code: Option<&str>,
    ) -> Result<(User, bool), AppError> {
        if let Some(existing) = self.get_user(telegram_id).await? {
            return Ok((existing, false));
        }

        for attempt in 1..=REF_CODE_ATTEMPTS {
            let mut tx = self.pool.begin().await?;

            let referrer = match referral_code.map(str::trim).filter(|c| !c.is_empty()) {
                Some(code) => {
                    sqlx::query_as::<_, User>(&format!(
                        "SELECT {USER_COLUMNS} FROM users \
                         WHERE ref_code = $1 AND deleted_at IS NULL AND telegram_id <> $2"
                    ))
                    .bind(code)
                    .bind(telegram_id)
                    .fetch_optional(&mut *tx)
                    .await?
                }
                None => None,
            };

            if referral_code.is_some() && referrer.is_none() {
                warn!(telegram_id = %telegram_id, "Referral code did not resolve to a live user, ignoring");
            }

            let ref_code = generate_ref_code(telegram_id);
            let inserted = sqlx::query_as::<_, User>(&format!(
                "INSERT INTO users (telegram_id, username, ref_code, referred_by_code) \
                 VALUES ($1, $2, $3, $4) \
                 ON CONFLICT DO NOTHING \
                 RETURNING {USER_COLUMNS}"
            ))
            .bind(telegram_id)
            .bind(username)
            .bind(&ref_code)
            .bind(referrer.as_ref().map(|r| r.ref_code.as_str()))
            .fetch_optional(&mut *tx)
            .await?;

            let Some(user) = inserted else {
                tx.rollback().await.ok();
                // Either a concurrent registration won, or the ref code collided.
                if let Some(existing) = self.get_user(telegram_id).await? {
                    return Ok((existing, false));
                }
                warn!(attempt = attempt, "Referral code collision, regenerating");
                continue;
            };

            if let Some(referrer) = &referrer {
                sqlx::query(
                    "UPDATE users SET total_referrals = total_referrals + 1, updated_at = NOW() \
                     WHERE id = $1",
                )
                .bind(referrer.id)
                .execute(&mut *tx)
                .await?;
            }

            tx.commit().await?;

            info!(
                telegram_id = %user.telegram_id,
                ref_code = %user.ref_code,
                referred_by = ?user.referred_by_code,
                "User registered"
            );
            return Ok((user, true));
        }

        Err(AppError::InternalError(anyhow::anyhow!(
            "Could not allocate a unique referral code for user {}",
            telegram_id
        )))
    }

    /// Referral summary for a user.
    #[instrument(skip(self))]
    pub async fn referral_stats(&self, telegram_id: &str) -> Result<Option<ReferralStats>, AppError> {
        let stats = sqlx::query_as::<_, ReferralStats>(
            r#"
            SELECT u.telegram_id,
                   u.ref_code,
                   u.commission_balance,
                   u.total_referrals,
                   COALESCE(SUM(pc.commission_amount), 0)::BIGINT AS total_commission_earned,
                   COUNT(pc.id) FILTER (WHERE pc.commission_amount > 0) AS commissions_count
            FROM users u
            LEFT JOIN payment_commissions pc ON pc.referrer_telegram_id = u.telegram_id
            WHERE u.telegram_id = $1 AND u.deleted_at IS NULL
            GROUP BY u.id
            "#,
        )
        .bind(telegram_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get referral stats: {}", e)))?;

        Ok(stats)
    }

    // -------------------------------------------------------------------------
    // Payment Operations
    // -------------------------------------------------------------------------

    #[instrument(skip(self))]
    pub async fn get_payment_by_transaction_id(
        &self,
        transaction_id: &str,
    ) -> Result<Option<Payment>, AppError> {
        let payment = sqlx::query_as::<_, Payment>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE transaction_id = $1"
        ))
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(payment)
    }

    #[instrument(skip(self))]
    pub async fn get_payment_by_order_id(&self, order_id: &str) -> Result<Option<Payment>, AppError> {
        let payment = sqlx::query_as::<_, Payment>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE order_id = $1"
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(payment)
    }

    /// Insert a freshly created QRIS payment in `pending`.
    #[instrument(skip(self, input), fields(order_id = %input.order_id, transaction_id = %input.transaction_id))]
    pub async fn insert_payment(&self, input: &NewPayment) -> Result<Payment, AppError> {
        let payment = sqlx::query_as::<_, Payment>(&format!(
            "INSERT INTO payments (telegram_id, order_id, transaction_id, package_name, amount, qris_string) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             RETURNING {PAYMENT_COLUMNS}"
        ))
        .bind(&input.telegram_id)
        .bind(&input.order_id)
        .bind(&input.transaction_id)
        .bind(&input.package_name)
        .bind(input.amount)
        .bind(&input.qris_string)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                AppError::Conflict(anyhow::anyhow!(
                    "Payment with order '{}' or transaction '{}' already exists",
                    input.order_id,
                    input.transaction_id
                ))
            }
            _ => AppError::DatabaseError(anyhow::anyhow!("Failed to create payment: {}", e)),
        })?;

        info!(
            payment_id = payment.id,
            amount = payment.amount,
            package_name = %payment.package_name,
            "Payment created"
        );

        Ok(payment)
    }

    #[instrument(skip(self))]
    pub async fn list_user_payments(
        &self,
        telegram_id: &str,
        limit: i64,
    ) -> Result<Vec<Payment>, AppError> {
        let payments = sqlx::query_as::<_, Payment>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE telegram_id = $1 \
             ORDER BY created_at DESC LIMIT $2"
        ))
        .bind(telegram_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(payments)
    }

    /// Pending payments with a gateway transaction, created inside the
    /// lookback window, newest first.
    #[instrument(skip(self))]
    pub async fn pending_payments_for_sync(
        &self,
        now: DateTime<Utc>,
        lookback_hours: i64,
        limit: i64,
    ) -> Result<Vec<Payment>, AppError> {
        let cutoff = now - ChronoDuration::hours(lookback_hours);
        let payments = sqlx::query_as::<_, Payment>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments \
             WHERE status = 'pending' AND created_at >= $1 AND transaction_id IS NOT NULL \
             ORDER BY created_at DESC LIMIT $2"
        ))
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(payments)
    }

    // -------------------------------------------------------------------------
    // Withdrawal Operations
    // -------------------------------------------------------------------------

    #[instrument(skip(self))]
    pub async fn list_user_withdrawals(&self, telegram_id: &str) -> Result<Vec<Withdrawal>, AppError> {
        let withdrawals = sqlx::query_as::<_, Withdrawal>(&format!(
            "SELECT {WITHDRAWAL_COLUMNS} FROM withdrawals WHERE telegram_id = $1 \
             ORDER BY created_at DESC"
        ))
        .bind(telegram_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(withdrawals)
    }
}

/// First five characters of the Telegram id followed by four random
/// alphanumerics.
pub fn generate_ref_code(telegram_id: &str) -> String {
    let prefix: String = telegram_id.chars().take(5).collect();
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(4)
        .map(char::from)
        .collect();
    format!("{prefix}{suffix}")
}
