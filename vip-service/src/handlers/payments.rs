//! VIP package listing, QRIS payment creation and client polling.

use crate::dtos::{CreateVipPaymentRequest, HistoryQuery, PaymentResponse, PaymentStatusResponse};
use crate::middleware::TelegramUser;
use crate::models::{NewPayment, PaymentStatus};
use crate::services::gateway::CreatePaymentRequest;
use crate::services::packages::{list_packages as package_list, PackageInfo, VipPackage};
use crate::services::reconciliation::{ReconcileOutcome, Trigger};
use crate::startup::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

const DEFAULT_HISTORY_LIMIT: i64 = 20;
const MAX_HISTORY_LIMIT: i64 = 100;

pub async fn list_packages() -> Json<Vec<PackageInfo>> {
    Json(package_list())
}

/// Open a QRIS transaction for a VIP package.
///
/// The payment row is only written once the gateway has accepted the
/// transaction, so a gateway failure leaves nothing behind.
pub async fn create_payment(
    State(state): State<AppState>,
    user: TelegramUser,
    Json(req): Json<CreateVipPaymentRequest>,
) -> Result<(StatusCode, Json<PaymentResponse>), AppError> {
    req.validate()?;

    let package = VipPackage::parse(&req.package_name).map_err(|e| {
        tracing::warn!(package_name = %req.package_name, "Rejected unknown package");
        AppError::BadRequest(anyhow::anyhow!(e))
    })?;

    let gateway = state.coordinator.gateway();
    if !gateway.is_configured() {
        tracing::error!("Payment requested but gateway credentials are missing");
        return Err(AppError::ServiceUnavailable);
    }

    let (account, _) = state
        .db
        .register_user(&user.telegram_id, user.username.as_deref(), None)
        .await?;

    let order_id = format!("VIP-{}-{}", account.telegram_id, Uuid::new_v4().simple());
    let request = CreatePaymentRequest {
        order_id: order_id.clone(),
        amount: package.price(),
        description: format!("{} - {}", package.name(), account.telegram_id),
        callback_url: state.config.gateway.callback_url.clone(),
    };

    let created = gateway.create_payment(&request).await.map_err(|e| {
        tracing::error!(order_id = %order_id, error = %e, "Gateway failed to create payment");
        AppError::BadGateway(format!("Payment gateway error: {}", e))
    })?;

    let payment = state
        .db
        .insert_payment(&NewPayment {
            telegram_id: account.telegram_id.clone(),
            order_id,
            transaction_id: created.transaction_id,
            package_name: package.name().to_string(),
            amount: package.price(),
            qris_string: created.qris_string,
        })
        .await?;

    tracing::info!(
        payment_id = payment.id,
        order_id = %payment.order_id,
        telegram_id = %payment.telegram_id,
        package_name = %payment.package_name,
        amount = payment.amount,
        "Payment created"
    );

    let mut response = PaymentResponse::from(payment);
    response.expires_at = created.expires_at;
    Ok((StatusCode::CREATED, Json(response)))
}

pub async fn payment_history(
    State(state): State<AppState>,
    user: TelegramUser,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<PaymentResponse>>, AppError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);

    let payments = state.db.list_user_payments(&user.telegram_id, limit).await?;
    Ok(Json(payments.into_iter().map(PaymentResponse::from).collect()))
}

/// Client poll. Terminal payments answer from the database; pending ones
/// ask the gateway and go through the coordinator.
pub async fn payment_status(
    State(state): State<AppState>,
    user: TelegramUser,
    Path(transaction_id): Path<String>,
) -> Result<Json<PaymentStatusResponse>, AppError> {
    let payment = state
        .db
        .get_payment_by_transaction_id(&transaction_id)
        .await?
        .filter(|p| p.telegram_id == user.telegram_id)
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Payment not found")))?;

    if payment.status().is_terminal() {
        let vip_expires_at = if payment.status() == PaymentStatus::Success {
            state
                .db
                .get_user(&payment.telegram_id)
                .await?
                .and_then(|u| u.vip_expires_at)
        } else {
            None
        };

        return Ok(Json(PaymentStatusResponse {
            transaction_id,
            status: payment.status().as_str().to_string(),
            processing: false,
            vip_expires_at,
            outcome: None,
        }));
    }

    let outcome = state
        .coordinator
        .reconcile_from_gateway(&payment, Trigger::Poll)
        .await?;

    let vip_expires_at = match &outcome {
        ReconcileOutcome::Activated(activation) => Some(activation.vip_expires_at),
        _ => None,
    };

    Ok(Json(PaymentStatusResponse {
        transaction_id,
        status: outcome.payment_status().as_str().to_string(),
        processing: matches!(outcome, ReconcileOutcome::StillPending { .. }),
        vip_expires_at,
        outcome: Some(outcome.label()),
    }))
}
