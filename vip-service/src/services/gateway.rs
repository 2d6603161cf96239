//! QRIS payment gateway client.
//!
//! Every failure here is transient from the reconciliation point of view: a
//! payment is never failed because the gateway could not be reached or
//! answered garbage. It stays `pending` and a later trigger retries.

use crate::config::GatewayConfig;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Payment status as reported by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayStatus {
    Paid,
    Pending,
    Expired,
    Failed,
    Cancelled,
    Unknown,
}

impl GatewayStatus {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "paid" => Self::Paid,
            "pending" => Self::Pending,
            "expired" => Self::Expired,
            "failed" => Self::Failed,
            "cancelled" | "canceled" => Self::Cancelled,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Paid => "paid",
            Self::Pending => "pending",
            Self::Expired => "expired",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
        }
    }
}

/// Authoritative view of a payment from one trigger source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayObservation {
    pub status: GatewayStatus,
    pub amount: Option<i64>,
    pub paid_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Gateway credentials not configured")]
    NotConfigured,

    #[error("Gateway request timed out")]
    Timeout,

    #[error("Gateway request failed: {0}")]
    Transport(reqwest::Error),

    #[error("Gateway returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Malformed gateway response: {0}")]
    Malformed(String),

    #[error("Gateway reported failure: {0}")]
    Rejected(String),
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::Timeout
        } else {
            GatewayError::Transport(err)
        }
    }
}

impl GatewayError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotConfigured => "not_configured",
            Self::Timeout => "timeout",
            Self::Transport(_) => "transport",
            Self::Status { .. } => "http_status",
            Self::Malformed(_) => "malformed",
            Self::Rejected(_) => "rejected",
        }
    }
}

/// Request to open a QRIS transaction.
#[derive(Debug, Clone, Serialize)]
pub struct CreatePaymentRequest {
    pub order_id: String,
    pub amount: i64,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
}

/// QRIS transaction opened by the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedPayment {
    pub transaction_id: String,
    pub qris_string: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn is_configured(&self) -> bool;

    async fn check_payment(&self, transaction_id: &str)
        -> Result<GatewayObservation, GatewayError>;

    async fn create_payment(
        &self,
        request: &CreatePaymentRequest,
    ) -> Result<CreatedPayment, GatewayError>;
}

#[derive(Debug, Deserialize)]
struct CheckPaymentResponse {
    #[serde(default)]
    success: bool,
    status: Option<String>,
    amount: Option<Value>,
    paid_at: Option<String>,
    error: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreatePaymentResponse {
    #[serde(default)]
    success: bool,
    transaction_id: Option<String>,
    qris_string: Option<String>,
    expires_at: Option<String>,
    error: Option<String>,
    message: Option<String>,
}

/// reqwest-backed client for the QRIS gateway HTTP API.
#[derive(Clone)]
pub struct QrisGatewayClient {
    client: Client,
    config: GatewayConfig,
}

impl QrisGatewayClient {
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(GatewayError::Transport)?;
        Ok(Self { client, config })
    }

    async fn read_body(response: reqwest::Response) -> Result<String, GatewayError> {
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(GatewayError::Status {
                status: status.as_u16(),
                body: truncate(&body, 256),
            });
        }

        Ok(body)
    }
}

#[async_trait]
impl PaymentGateway for QrisGatewayClient {
    fn is_configured(&self) -> bool {
        self.config.is_configured()
    }

    async fn check_payment(
        &self,
        transaction_id: &str,
    ) -> Result<GatewayObservation, GatewayError> {
        if !self.is_configured() {
            return Err(GatewayError::NotConfigured);
        }

        let url = format!("{}/check-payment.php", self.config.api_url);

        let response = self
            .client
            .get(&url)
            .query(&[("transaction_id", transaction_id)])
            .header("X-API-Key", &self.config.api_key)
            .header("X-API-Secret", self.config.api_secret.expose_secret())
            .send()
            .await?;

        let body = Self::read_body(response).await?;
        tracing::debug!(transaction_id = %transaction_id, body = %body, "Gateway check-payment response");

        let parsed: CheckPaymentResponse =
            serde_json::from_str(&body).map_err(|e| GatewayError::Malformed(e.to_string()))?;

        if !parsed.success {
            return Err(GatewayError::Rejected(
                parsed
                    .error
                    .or(parsed.message)
                    .unwrap_or_else(|| "success=false".to_string()),
            ));
        }

        let status = parsed
            .status
            .as_deref()
            .map(GatewayStatus::parse)
            .ok_or_else(|| GatewayError::Malformed("missing status".to_string()))?;

        Ok(GatewayObservation {
            status,
            amount: parsed.amount.as_ref().and_then(parse_amount),
            paid_at: parsed.paid_at.as_deref().and_then(parse_timestamp),
        })
    }

    async fn create_payment(
        &self,
        request: &CreatePaymentRequest,
    ) -> Result<CreatedPayment, GatewayError> {
        if !self.is_configured() {
            return Err(GatewayError::NotConfigured);
        }

        let url = format!("{}/create-payment.php", self.config.api_url);

        let response = self
            .client
            .post(&url)
            .header("X-API-Key", &self.config.api_key)
            .header("X-API-Secret", self.config.api_secret.expose_secret())
            .json(request)
            .send()
            .await?;

        let body = Self::read_body(response).await?;
        let parsed: CreatePaymentResponse =
            serde_json::from_str(&body).map_err(|e| GatewayError::Malformed(e.to_string()))?;

        if !parsed.success {
            return Err(GatewayError::Rejected(
                parsed
                    .error
                    .or(parsed.message)
                    .unwrap_or_else(|| "success=false".to_string()),
            ));
        }

        let transaction_id = parsed
            .transaction_id
            .filter(|t| !t.is_empty())
            .ok_or_else(|| GatewayError::Malformed("missing transaction_id".to_string()))?;

        tracing::info!(
            order_id = %request.order_id,
            transaction_id = %transaction_id,
            amount = request.amount,
            "QRIS transaction created"
        );

        Ok(CreatedPayment {
            transaction_id,
            qris_string: parsed.qris_string,
            expires_at: parsed.expires_at.as_deref().and_then(parse_timestamp),
        })
    }
}

/// Amounts arrive as integers, floats with no fraction, or strings of either.
pub fn parse_amount(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.is_finite())
                .map(|f| f as i64)
        }),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>().ok().or_else(|| {
                s.parse::<f64>()
                    .ok()
                    .filter(|f| f.fract() == 0.0 && f.is_finite())
                    .map(|f| f as i64)
            })
        }
        _ => None,
    }
}

/// RFC 3339, or `YYYY-MM-DD HH:MM:SS` taken as UTC.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .ok()
                .map(|naive| naive.and_utc())
        })
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_status_parsing() {
        assert_eq!(GatewayStatus::parse("paid"), GatewayStatus::Paid);
        assert_eq!(GatewayStatus::parse(" PAID "), GatewayStatus::Paid);
        assert_eq!(GatewayStatus::parse("expired"), GatewayStatus::Expired);
        assert_eq!(GatewayStatus::parse("canceled"), GatewayStatus::Cancelled);
        assert_eq!(GatewayStatus::parse("settled"), GatewayStatus::Unknown);
    }

    #[test]
    fn test_amount_parsing() {
        assert_eq!(parse_amount(&json!(10000)), Some(10000));
        assert_eq!(parse_amount(&json!(10000.0)), Some(10000));
        assert_eq!(parse_amount(&json!("10000")), Some(10000));
        assert_eq!(parse_amount(&json!("10000.00")), Some(10000));
        assert_eq!(parse_amount(&json!(10000.5)), None);
        assert_eq!(parse_amount(&json!(null)), None);
    }

    #[test]
    fn test_timestamp_parsing() {
        let expected = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        assert_eq!(parse_timestamp("2024-05-01T10:00:00Z"), Some(expected));
        assert_eq!(parse_timestamp("2024-05-01T17:00:00+07:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-05-01 10:00:00"), Some(expected));
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("ééé", 3), "é...");
    }
}
