//! Guard for `/internal` routes.

use crate::startup::AppState;
use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use secrecy::ExposeSecret;
use service_core::error::AppError;
use service_core::utils::signature::secure_compare;

pub const ADMIN_TOKEN_HEADER: &str = "X-Admin-Token";

/// Proof that the request carried the configured admin token.
#[derive(Debug, Clone, Copy)]
pub struct AdminToken;

#[async_trait]
impl FromRequestParts<AppState> for AdminToken {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let expected = state.config.admin.api_token.expose_secret();
        if expected.is_empty() {
            return Err(AppError::Forbidden(anyhow::anyhow!("Admin API is disabled")));
        }

        let provided = parts
            .headers
            .get(ADMIN_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();

        if !secure_compare(expected, provided) {
            tracing::warn!("Rejected admin request with invalid token");
            return Err(AppError::Unauthorized(anyhow::anyhow!("Invalid admin token")));
        }

        Ok(AdminToken)
    }
}
