//! QRIS gateway webhook.
//!
//! The payload is trusted only after its HMAC signature checks out; nothing
//! touches the database before that.

use crate::dtos::WebhookResponse;
use crate::models::Payment;
use crate::services::gateway::{parse_amount, parse_timestamp, GatewayObservation, GatewayStatus};
use crate::services::reconciliation::{PaymentLookup, Trigger};
use crate::startup::AppState;
use axum::{extract::State, Json};
use secrecy::ExposeSecret;
use serde_json::Value;
use service_core::error::AppError;
use service_core::utils::signature::verify_json_signature;

fn str_field<'a>(payload: &'a Value, key: &str) -> Option<&'a str> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Build the gateway observation carried by a verified webhook payload.
pub fn observation_from_payload(payload: &Value) -> Result<GatewayObservation, AppError> {
    let status = str_field(payload, "status")
        .ok_or_else(|| AppError::BadRequest(anyhow::anyhow!("Webhook payload missing status")))?;

    Ok(GatewayObservation {
        status: GatewayStatus::parse(status),
        amount: payload.get("amount").and_then(parse_amount),
        paid_at: str_field(payload, "paid_at").and_then(parse_timestamp),
    })
}

pub async fn qris_webhook(
    State(state): State<AppState>,
    body: String,
) -> Result<Json<WebhookResponse>, AppError> {
    let payload: Value = serde_json::from_str(&body).map_err(|e| {
        tracing::warn!(error = %e, "Webhook body is not valid JSON");
        AppError::BadRequest(anyhow::anyhow!("Invalid webhook payload"))
    })?;

    let is_valid = verify_json_signature(
        state.config.gateway.webhook_secret.expose_secret(),
        &payload,
    )
    .map_err(|e| {
        tracing::error!(error = %e, "Webhook signature verification error");
        AppError::InternalError(anyhow::anyhow!("Webhook verification failed"))
    })?;

    if !is_valid {
        tracing::warn!("Invalid webhook signature");
        return Err(AppError::Unauthorized(anyhow::anyhow!(
            "Invalid webhook signature"
        )));
    }

    let observation = observation_from_payload(&payload)?;
    let transaction_id = str_field(&payload, "transaction_id");
    let order_id = str_field(&payload, "order_id");

    tracing::info!(
        transaction_id = ?transaction_id,
        order_id = ?order_id,
        status = observation.status.as_str(),
        "Processing QRIS webhook"
    );

    let payment = find_payment(&state, transaction_id, order_id)
        .await?
        .ok_or_else(|| {
            tracing::warn!(transaction_id = ?transaction_id, order_id = ?order_id, "Webhook for unknown payment");
            AppError::NotFound(anyhow::anyhow!("Payment not found"))
        })?;

    let outcome = state
        .coordinator
        .reconcile(&PaymentLookup::Id(payment.id), &observation, Trigger::Webhook)
        .await?;

    Ok(Json(WebhookResponse {
        received: true,
        result: outcome,
    }))
}

async fn find_payment(
    state: &AppState,
    transaction_id: Option<&str>,
    order_id: Option<&str>,
) -> Result<Option<Payment>, AppError> {
    if transaction_id.is_none() && order_id.is_none() {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Webhook payload missing transaction_id and order_id"
        )));
    }

    if let Some(transaction_id) = transaction_id {
        if let Some(payment) = state.db.get_payment_by_transaction_id(transaction_id).await? {
            return Ok(Some(payment));
        }
    }

    match order_id {
        Some(order_id) => state.db.get_payment_by_order_id(order_id).await,
        None => Ok(None),
    }
}
