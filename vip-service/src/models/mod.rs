//! Domain models for vip-service.

#![allow(clippy::should_implement_trait)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ============================================================================
// User Models
// ============================================================================

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct User {
    pub id: i64,
    pub telegram_id: String,
    pub username: Option<String>,
    pub ref_code: String,
    pub referred_by_code: Option<String>,
    pub is_vip: bool,
    pub vip_expires_at: Option<DateTime<Utc>>,
    pub commission_balance: i64,
    pub total_referrals: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl User {
    /// VIP is active only when the flag is set and the expiry lies in the future.
    pub fn has_active_vip(&self, now: DateTime<Utc>) -> bool {
        self.is_vip && self.vip_expires_at.is_some_and(|exp| exp > now)
    }

    /// Flag set with a null or elapsed expiry.
    pub fn has_stale_vip_flag(&self, now: DateTime<Utc>) -> bool {
        self.is_vip && !self.has_active_vip(now)
    }
}

/// Snapshot of a user's VIP state after stale-flag correction.
#[derive(Debug, Clone, Serialize)]
pub struct VipStatus {
    pub telegram_id: String,
    pub is_vip: bool,
    pub vip_expires_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Payment Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Success,
    Failed,
    Expired,
    ManualReview,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Expired => "expired",
            Self::ManualReview => "manual_review",
        }
    }

    /// Unknown values map to `ManualReview` so they are never treated as
    /// processable.
    pub fn from_str(s: &str) -> Self {
        match s {
            "pending" => Self::Pending,
            "success" | "paid" => Self::Success,
            "failed" => Self::Failed,
            "expired" => Self::Expired,
            _ => Self::ManualReview,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Payment {
    pub id: i64,
    pub telegram_id: String,
    pub order_id: String,
    pub transaction_id: Option<String>,
    pub package_name: String,
    pub amount: i64,
    pub status: String,
    pub qris_string: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    pub fn status(&self) -> PaymentStatus {
        PaymentStatus::from_str(&self.status)
    }
}

/// Fields for inserting a freshly created QRIS payment.
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub telegram_id: String,
    pub order_id: String,
    pub transaction_id: String,
    pub package_name: String,
    pub amount: i64,
    pub qris_string: Option<String>,
}

// ============================================================================
// Commission Ledger Models
// ============================================================================

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct CommissionEntry {
    pub id: i64,
    pub payment_id: i64,
    pub referrer_telegram_id: Option<String>,
    pub commission_amount: i64,
    pub referred_telegram_id: String,
    pub created_at: DateTime<Utc>,
}

/// Result of the commission decision for one payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommissionOutcome {
    pub paid: bool,
    pub amount: Option<i64>,
    pub referrer_id: Option<String>,
}

impl CommissionOutcome {
    pub fn not_paid() -> Self {
        Self {
            paid: false,
            amount: None,
            referrer_id: None,
        }
    }
}

impl From<&CommissionEntry> for CommissionOutcome {
    fn from(entry: &CommissionEntry) -> Self {
        match &entry.referrer_telegram_id {
            Some(referrer) if entry.commission_amount > 0 => Self {
                paid: true,
                amount: Some(entry.commission_amount),
                referrer_id: Some(referrer.clone()),
            },
            _ => Self::not_paid(),
        }
    }
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ReferralStats {
    pub telegram_id: String,
    pub ref_code: String,
    pub commission_balance: i64,
    pub total_referrals: i32,
    pub total_commission_earned: i64,
    pub commissions_count: i64,
}

// ============================================================================
// Withdrawal Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalStatus {
    Pending,
    Approved,
    Rejected,
}

impl WithdrawalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "approved" => Self::Approved,
            "rejected" => Self::Rejected,
            _ => Self::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Withdrawal {
    pub id: i64,
    pub telegram_id: String,
    pub amount: i64,
    pub payment_method: String,
    pub account_number: String,
    pub account_name: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl Withdrawal {
    pub fn status(&self) -> WithdrawalStatus {
        WithdrawalStatus::from_str(&self.status)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewWithdrawal {
    pub telegram_id: String,
    pub amount: i64,
    pub payment_method: String,
    pub account_number: String,
    pub account_name: String,
}
