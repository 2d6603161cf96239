//! Request and response bodies for the HTTP API.

use crate::models::{Payment, User, Withdrawal};
use crate::services::reconciliation::ReconcileOutcome;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

// ============================================================================
// Payments
// ============================================================================

#[derive(Debug, Deserialize, Validate)]
pub struct CreateVipPaymentRequest {
    #[validate(length(min = 1, max = 64, message = "Package name is required"))]
    pub package_name: String,
}

#[derive(Debug, Serialize)]
pub struct PaymentResponse {
    pub order_id: String,
    pub transaction_id: Option<String>,
    pub package_name: String,
    pub amount: i64,
    pub status: String,
    pub qris_string: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
}

impl From<Payment> for PaymentResponse {
    fn from(p: Payment) -> Self {
        Self {
            order_id: p.order_id,
            transaction_id: p.transaction_id,
            package_name: p.package_name,
            amount: p.amount,
            status: p.status,
            qris_string: p.qris_string,
            expires_at: None,
            created_at: p.created_at,
            paid_at: p.paid_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
}

/// Reply to a client poll.
#[derive(Debug, Serialize)]
pub struct PaymentStatusResponse {
    pub transaction_id: String,
    pub status: String,
    /// True while the payment is still waiting on the gateway.
    pub processing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vip_expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<&'static str>,
}

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub received: bool,
    pub result: ReconcileOutcome,
}

// ============================================================================
// Users
// ============================================================================

#[derive(Debug, Default, Deserialize, Validate)]
pub struct RegisterUserRequest {
    #[validate(length(min = 1, max = 32, message = "Referral code must be 1-32 characters"))]
    pub referral_code: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub telegram_id: String,
    pub username: Option<String>,
    pub ref_code: String,
    pub referred_by_code: Option<String>,
    pub is_vip: bool,
    pub vip_expires_at: Option<DateTime<Utc>>,
    pub commission_balance: i64,
    pub total_referrals: i32,
    pub created: bool,
}

impl UserResponse {
    pub fn new(user: User, created: bool) -> Self {
        Self {
            telegram_id: user.telegram_id,
            username: user.username,
            ref_code: user.ref_code,
            referred_by_code: user.referred_by_code,
            is_vip: user.is_vip,
            vip_expires_at: user.vip_expires_at,
            commission_balance: user.commission_balance,
            total_referrals: user.total_referrals,
            created,
        }
    }
}

// ============================================================================
// Withdrawals
// ============================================================================

#[derive(Debug, Deserialize, Validate)]
pub struct WithdrawalRequest {
    #[validate(range(min = 1, message = "Amount must be positive"))]
    pub amount: i64,
    #[validate(length(min = 1, max = 32, message = "Payment method is required"))]
    pub payment_method: String,
    #[validate(length(min = 1, max = 64, message = "Account number is required"))]
    pub account_number: String,
    #[validate(length(min = 1, max = 128, message = "Account name is required"))]
    pub account_name: String,
}

#[derive(Debug, Serialize)]
pub struct WithdrawalResponse {
    pub id: i64,
    pub amount: i64,
    pub payment_method: String,
    pub account_number: String,
    pub account_name: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl From<Withdrawal> for WithdrawalResponse {
    fn from(w: Withdrawal) -> Self {
        Self {
            id: w.id,
            amount: w.amount,
            payment_method: w.payment_method,
            account_number: w.account_number,
            account_name: w.account_name,
            status: w.status,
            created_at: w.created_at,
            processed_at: w.processed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_withdrawal_request_validation() {
        let ok = WithdrawalRequest {
            amount: 50_000,
            payment_method: "DANA".to_string(),
            account_number: "08123456789".to_string(),
            account_name: "Budi".to_string(),
        };
        assert!(ok.validate().is_ok());

        let bad = WithdrawalRequest {
            amount: 0,
            payment_method: String::new(),
            ..ok
        };
        let errors = bad.validate().unwrap_err();
        let fields = errors.field_errors();
        assert!(fields.contains_key("amount"));
        assert!(fields.contains_key("payment_method"));
    }

    #[test]
    fn test_register_request_optional_code() {
        assert!(RegisterUserRequest::default().validate().is_ok());
        let empty = RegisterUserRequest {
            referral_code: Some(String::new()),
        };
        assert!(empty.validate().is_err());
    }
}
