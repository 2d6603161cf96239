//! Payment reconciliation coordinator.
//!
//! Webhook deliveries, client polls, the background sync worker and manual
//! admin syncs all end up in [`ReconciliationCoordinator::reconcile`]. The
//! payment row lock plus the `pending` guard decide which caller wins; every
//! loser observes `AlreadyProcessed`. Gateway and Telegram I/O never happens
//! while the lock is held.

use crate::models::{CommissionOutcome, Payment, PaymentStatus, User};
use crate::services::commission;
use crate::services::database::{Database, PAYMENT_COLUMNS, USER_COLUMNS};
use crate::services::gateway::{GatewayObservation, GatewayStatus, PaymentGateway};
use crate::services::metrics::{record_gateway_check, record_notification, record_reconciliation};
use crate::services::notifier::{payment_success_message, referrer_commission_message, Notifier};
use crate::services::packages::VipPackage;
use crate::services::vip;
use chrono::{DateTime, Utc};
use serde::Serialize;
use service_core::error::AppError;
use sqlx::PgConnection;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Which path observed the gateway state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Webhook,
    Poll,
    SyncWorker,
    Manual,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Webhook => "webhook",
            Self::Poll => "poll",
            Self::SyncWorker => "sync_worker",
            Self::Manual => "manual",
        }
    }
}

/// How to find the payment row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentLookup {
    Id(i64),
    TransactionId(String),
    OrderId(String),
}

impl std::fmt::Display for PaymentLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Id(id) => write!(f, "id={}", id),
            Self::TransactionId(t) => write!(f, "transaction_id={}", t),
            Self::OrderId(o) => write!(f, "order_id={}", o),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Activation {
    pub payment_id: i64,
    pub telegram_id: String,
    pub package_name: String,
    pub vip_days: i32,
    pub vip_expires_at: DateTime<Utc>,
    pub commission: CommissionOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// This call moved the payment to `success` and granted VIP.
    Activated(Activation),
    /// The payment had already left `pending`; nothing was changed.
    AlreadyProcessed { payment_id: i64, status: PaymentStatus },
    /// Paid, but the data failed validation; parked for a human.
    ManualReview { payment_id: i64, reason: String },
    /// Gateway reported a terminal non-paid state.
    Closed { payment_id: i64, status: PaymentStatus },
    /// Nothing decisive yet (gateway pending, unknown or unreachable).
    StillPending { payment_id: i64 },
}

impl ReconcileOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Activated(_) => "activated",
            Self::AlreadyProcessed { .. } => "already_processed",
            Self::ManualReview { .. } => "manual_review",
            Self::Closed { .. } => "closed",
            Self::StillPending { .. } => "still_pending",
        }
    }

    /// Payment status after this call.
    pub fn payment_status(&self) -> PaymentStatus {
        match self {
            Self::Activated(_) => PaymentStatus::Success,
            Self::AlreadyProcessed { status, .. } | Self::Closed { status, .. } => *status,
            Self::ManualReview { .. } => PaymentStatus::ManualReview,
            Self::StillPending { .. } => PaymentStatus::Pending,
        }
    }

    pub fn payment_id(&self) -> i64 {
        match self {
            Self::Activated(a) => a.payment_id,
            Self::AlreadyProcessed { payment_id, .. }
            | Self::ManualReview { payment_id, .. }
            | Self::Closed { payment_id, .. }
            | Self::StillPending { payment_id } => *payment_id,
        }
    }
}

#[derive(Clone)]
pub struct ReconciliationCoordinator {
    db: Arc<Database>,
    gateway: Arc<dyn PaymentGateway>,
    notifier: Arc<dyn Notifier>,
    commission_rate_bps: i64,
    reject_amount_mismatch: bool,
}

impl ReconciliationCoordinator {
    pub fn new(
        db: Arc<Database>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn Notifier>,
        commission_rate_bps: i64,
    ) -> Self {
        Self {
            db,
            gateway,
            notifier,
            commission_rate_bps,
            reject_amount_mismatch: false,
        }
    }

    /// Send paid payments with a mismatched amount to `manual_review`.
    /// Off by default: a mismatch is only logged.
    pub fn with_amount_check(mut self, enabled: bool) -> Self {
        self.reject_amount_mismatch = enabled;
        self
    }

    pub fn gateway(&self) -> &Arc<dyn PaymentGateway> {
        &self.gateway
    }

    /// Query the gateway for `payment` (no lock held) and feed the answer
    /// through [`Self::reconcile`]. Gateway failures leave the payment
    /// untouched and report `StillPending`.
    #[instrument(skip_all, fields(payment_id = payment.id, trigger = trigger.as_str()))]
    pub async fn reconcile_from_gateway(
        &self,
        payment: &Payment,
        trigger: Trigger,
    ) -> Result<ReconcileOutcome, AppError> {
        if payment.status().is_terminal() {
            return Ok(ReconcileOutcome::AlreadyProcessed {
                payment_id: payment.id,
                status: payment.status(),
            });
        }

        let Some(transaction_id) = payment.transaction_id.as_deref() else {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Payment {} has no gateway transaction",
                payment.id
            )));
        };

        let observation = match self.gateway.check_payment(transaction_id).await {
            Ok(observation) => {
                record_gateway_check(observation.status.as_str());
                observation
            }
            Err(e) => {
                record_gateway_check(e.kind());
                warn!(
                    transaction_id = %transaction_id,
                    error = %e,
                    "Gateway check failed, leaving payment pending"
                );
                record_reconciliation(trigger.as_str(), "gateway_error");
                return Ok(ReconcileOutcome::StillPending {
                    payment_id: payment.id,
                });
            }
        };

        self.reconcile(&PaymentLookup::Id(payment.id), &observation, trigger)
            .await
    }

    /// Apply an authoritative observation to a payment exactly once.
    #[instrument(skip_all, fields(lookup = %lookup, status = observation.status.as_str(), trigger = trigger.as_str()))]
    pub async fn reconcile(
        &self,
        lookup: &PaymentLookup,
        observation: &GatewayObservation,
        trigger: Trigger,
    ) -> Result<ReconcileOutcome, AppError> {
        let now = Utc::now();
        let mut tx = self.db.pool().begin().await?;

        let payment = lock_payment(&mut tx, lookup)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Payment {} not found", lookup)))?;

        if payment.status() != PaymentStatus::Pending {
            tx.rollback().await?;
            info!(
                payment_id = payment.id,
                status = %payment.status(),
                "Payment already processed, skipping"
            );
            let outcome = ReconcileOutcome::AlreadyProcessed {
                payment_id: payment.id,
                status: payment.status(),
            };
            record_reconciliation(trigger.as_str(), outcome.label());
            return Ok(outcome);
        }

        let outcome = match observation.status {
            GatewayStatus::Paid => self.activate(&mut tx, &payment, observation, now).await?,
            GatewayStatus::Expired => {
                close_payment(&mut tx, &payment, PaymentStatus::Expired, None, now).await?;
                ReconcileOutcome::Closed {
                    payment_id: payment.id,
                    status: PaymentStatus::Expired,
                }
            }
            GatewayStatus::Failed | GatewayStatus::Cancelled => {
                let reason = format!("gateway reported {}", observation.status.as_str());
                close_payment(&mut tx, &payment, PaymentStatus::Failed, Some(&reason), now).await?;
                ReconcileOutcome::Closed {
                    payment_id: payment.id,
                    status: PaymentStatus::Failed,
                }
            }
            GatewayStatus::Pending | GatewayStatus::Unknown => {
                if observation.status == GatewayStatus::Unknown {
                    warn!(payment_id = payment.id, "Unrecognized gateway status, leaving pending");
                }
                tx.rollback().await?;
                let outcome = ReconcileOutcome::StillPending {
                    payment_id: payment.id,
                };
                record_reconciliation(trigger.as_str(), outcome.label());
                return Ok(outcome);
            }
        };

        tx.commit().await?;

        info!(
            payment_id = payment.id,
            order_id = %payment.order_id,
            outcome = outcome.label(),
            "Payment reconciled"
        );
        record_reconciliation(trigger.as_str(), outcome.label());

        if let ReconcileOutcome::Activated(activation) = &outcome {
            self.notify_activation(activation).await;
        }

        Ok(outcome)
    }

    async fn activate(
        &self,
        conn: &mut PgConnection,
        payment: &Payment,
        observation: &GatewayObservation,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, AppError> {
        if let Some(reported) = observation.amount.filter(|a| *a != payment.amount) {
            if self.reject_amount_mismatch {
                let reason = format!(
                    "amount mismatch: gateway reported {}, expected {}",
                    reported, payment.amount
                );
                warn!(payment_id = payment.id, %reason, "Parking payment for manual review");
                return park_for_review(conn, payment, reason, now).await;
            }
            warn!(
                payment_id = payment.id,
                reported_amount = reported,
                expected_amount = payment.amount,
                "Gateway reported a different amount, activating anyway"
            );
        }

        let package = match VipPackage::parse(&payment.package_name) {
            Ok(package) => package,
            Err(e) => {
                warn!(
                    payment_id = payment.id,
                    package_name = %payment.package_name,
                    "Invalid package on paid payment, parking for manual review"
                );
                return park_for_review(conn, payment, e.to_string(), now).await;
            }
        };

        let paid_at = observation.paid_at.unwrap_or(now);
        sqlx::query(
            r#"
            UPDATE payments
            SET status = 'success', paid_at = $2, updated_at = $3
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(payment.id)
        .bind(paid_at)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users \
             WHERE telegram_id = $1 AND deleted_at IS NULL FOR UPDATE"
        ))
        .bind(&payment.telegram_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!(
                "User {} for payment {} not found",
                payment.telegram_id,
                payment.id
            ))
        })?;

        let days = package.duration_days();
        let vip_expires_at = vip::extend_vip(conn, user.id, days, now).await?;

        let commission =
            commission::process_commission(conn, payment, &user, self.commission_rate_bps).await?;

        Ok(ReconcileOutcome::Activated(Activation {
            payment_id: payment.id,
            telegram_id: user.telegram_id,
            package_name: package.name().to_string(),
            vip_days: days,
            vip_expires_at,
            commission,
        }))
    }

    async fn notify_activation(&self, activation: &Activation) {
        if !self.notifier.is_enabled() {
            return;
        }

        if activation.commission.paid {
            if let (Some(referrer), Some(amount)) = (
                activation.commission.referrer_id.as_deref(),
                activation.commission.amount,
            ) {
                let text = referrer_commission_message(&activation.telegram_id, amount);
                match self.notifier.send_message(referrer, &text).await {
                    Ok(()) => record_notification("referrer_commission", "sent"),
                    Err(e) => {
                        record_notification("referrer_commission", "failed");
                        warn!(referrer = %referrer, error = %e, "Failed to notify referrer");
                    }
                }
            }
        }

        let text = payment_success_message(&activation.package_name, activation.vip_expires_at);
        match self.notifier.send_message(&activation.telegram_id, &text).await {
            Ok(()) => record_notification("payment_success", "sent"),
            Err(e) => {
                record_notification("payment_success", "failed");
                warn!(
                    telegram_id = %activation.telegram_id,
                    error = %e,
                    "Failed to notify user of activation"
                );
            }
        }
    }
}

/// Fetch and row-lock the payment for the rest of the transaction.
async fn lock_payment(
    conn: &mut PgConnection,
    lookup: &PaymentLookup,
) -> Result<Option<Payment>, AppError> {
    let sql = |column: &str| {
        format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE {column} = $1 FOR UPDATE")
    };

    let payment = match lookup {
        PaymentLookup::Id(id) => {
            sqlx::query_as::<_, Payment>(&sql("id"))
                .bind(*id)
                .fetch_optional(&mut *conn)
                .await?
        }
        PaymentLookup::TransactionId(transaction_id) => {
            sqlx::query_as::<_, Payment>(&sql("transaction_id"))
                .bind(transaction_id)
                .fetch_optional(&mut *conn)
                .await?
        }
        PaymentLookup::OrderId(order_id) => {
            sqlx::query_as::<_, Payment>(&sql("order_id"))
                .bind(order_id)
                .fetch_optional(&mut *conn)
                .await?
        }
    };

    Ok(payment)
}

async fn close_payment(
    conn: &mut PgConnection,
    payment: &Payment,
    status: PaymentStatus,
    reason: Option<&str>,
    now: DateTime<Utc>,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        UPDATE payments
        SET status = $2, failure_reason = COALESCE($3, failure_reason), updated_at = $4
        WHERE id = $1 AND status = 'pending'
        "#,
    )
    .bind(payment.id)
    .bind(status.as_str())
    .bind(reason)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    info!(payment_id = payment.id, status = %status, "Payment closed");
    Ok(())
}

async fn park_for_review(
    conn: &mut PgConnection,
    payment: &Payment,
    reason: String,
    now: DateTime<Utc>,
) -> Result<ReconcileOutcome, AppError> {
    close_payment(conn, payment, PaymentStatus::ManualReview, Some(&reason), now).await?;
    Ok(ReconcileOutcome::ManualReview {
        payment_id: payment.id,
        reason,
    })
}
