//! Telegram WebApp authentication.
//!
//! The Mini App sends its raw `initData` query string in the
//! `X-Telegram-Init-Data` header. It is trusted only when its `hash` matches
//! `HMAC_SHA256(HMAC_SHA256("WebAppData", bot_token), data_check_string)`
//! and `auth_date` is recent.

use crate::startup::AppState;
use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use secrecy::ExposeSecret;
use serde::Deserialize;
use service_core::error::AppError;
use service_core::utils::signature::{hmac_sha256, secure_compare};
use thiserror::Error;

pub const INIT_DATA_HEADER: &str = "X-Telegram-Init-Data";
pub const DEV_USER_HEADER: &str = "X-Telegram-User-Id";

/// Tolerated clock skew for `auth_date` in the future.
const MAX_CLOCK_SKEW_SECS: i64 = 60;

/// Authenticated Telegram user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelegramUser {
    pub telegram_id: String,
    pub username: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InitDataError {
    #[error("initData could not be parsed")]
    Malformed,
    #[error("initData hash missing")]
    MissingHash,
    #[error("initData auth_date missing or invalid")]
    InvalidAuthDate,
    #[error("initData signature invalid")]
    BadSignature,
    #[error("initData expired")]
    Expired,
    #[error("initData user missing or invalid")]
    InvalidUser,
}

#[derive(Debug, Deserialize)]
struct WebAppUser {
    id: i64,
    username: Option<String>,
}

fn compute_hash(pairs: &[(String, String)], bot_token: &str) -> Result<String, anyhow::Error> {
    let mut sorted: Vec<&(String, String)> = pairs.iter().filter(|(k, _)| k != "hash").collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    let data_check_string = sorted
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("\n");

    let secret_key = hmac_sha256(b"WebAppData", bot_token.as_bytes())?;
    let hash = hmac_sha256(&secret_key, data_check_string.as_bytes())?;
    Ok(hex::encode(hash))
}

/// Validate raw initData at unix time `now`.
pub fn validate_init_data(
    init_data: &str,
    bot_token: &str,
    max_age_secs: i64,
    now: i64,
) -> Result<TelegramUser, InitDataError> {
    let pairs: Vec<(String, String)> =
        serde_urlencoded::from_str(init_data).map_err(|_| InitDataError::Malformed)?;

    let received_hash = pairs
        .iter()
        .find(|(k, _)| k == "hash")
        .map(|(_, v)| v.to_ascii_lowercase())
        .ok_or(InitDataError::MissingHash)?;

    let auth_date: i64 = pairs
        .iter()
        .find(|(k, _)| k == "auth_date")
        .and_then(|(_, v)| v.parse().ok())
        .ok_or(InitDataError::InvalidAuthDate)?;

    let expected = compute_hash(&pairs, bot_token).map_err(|_| InitDataError::BadSignature)?;
    if !secure_compare(&expected, &received_hash) {
        return Err(InitDataError::BadSignature);
    }

    let age = now - auth_date;
    if age < -MAX_CLOCK_SKEW_SECS || age > max_age_secs {
        return Err(InitDataError::Expired);
    }

    let user: WebAppUser = pairs
        .iter()
        .find(|(k, _)| k == "user")
        .and_then(|(_, v)| serde_json::from_str(v).ok())
        .ok_or(InitDataError::InvalidUser)?;

    Ok(TelegramUser {
        telegram_id: user.id.to_string(),
        username: user.username,
    })
}

#[async_trait]
impl FromRequestParts<AppState> for TelegramUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let telegram = &state.config.telegram;

        if let Some(init_data) = parts
            .headers
            .get(INIT_DATA_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            if !telegram.has_bot_token() {
                return Err(AppError::ServiceUnavailable);
            }

            let user = validate_init_data(
                init_data,
                telegram.bot_token.expose_secret(),
                telegram.auth_max_age_secs,
                chrono::Utc::now().timestamp(),
            )
            .map_err(|e| {
                tracing::warn!(error = %e, "Rejected Telegram initData");
                AppError::Unauthorized(anyhow::anyhow!(e))
            })?;

            return Ok(user);
        }

        if telegram.allow_dev_user_header {
            if let Some(id) = parts
                .headers
                .get(DEV_USER_HEADER)
                .and_then(|v| v.to_str().ok())
                .filter(|id| !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()))
            {
                tracing::debug!(telegram_id = %id, "Using development user header");
                return Ok(TelegramUser {
                    telegram_id: id.to_string(),
                    username: None,
                });
            }
        }

        Err(AppError::Unauthorized(anyhow::anyhow!(
            "Missing {} header",
            INIT_DATA_HEADER
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOT_TOKEN: &str = "123456:TEST-TOKEN";

    fn signed_init_data(auth_date: i64, user_json: &str) -> String {
        let pairs = vec![
            ("auth_date".to_string(), auth_date.to_string()),
            ("query_id".to_string(), "AAHdF6IQAAAAAN0XohDhrOrc".to_string()),
            ("user".to_string(), user_json.to_string()),
        ];
        let hash = compute_hash(&pairs, BOT_TOKEN).unwrap();
        let mut all = pairs;
        all.push(("hash".to_string(), hash));
        serde_urlencoded::to_string(&all).unwrap()
    }

    #[test]
    fn test_valid_init_data() {
        let now = 1_714_557_600;
        let init = signed_init_data(now - 30, r#"{"id":987654321,"username":"budi"}"#);
        let user = validate_init_data(&init, BOT_TOKEN, 86_400, now).unwrap();
        assert_eq!(user.telegram_id, "987654321");
        assert_eq!(user.username.as_deref(), Some("budi"));
    }

    #[test]
    fn test_wrong_bot_token_rejected() {
        let now = 1_714_557_600;
        let init = signed_init_data(now, r#"{"id":1}"#);
        assert_eq!(
            validate_init_data(&init, "999:OTHER", 86_400, now),
            Err(InitDataError::BadSignature)
        );
    }

    #[test]
    fn test_tampered_user_rejected() {
        let now = 1_714_557_600;
        let init = signed_init_data(now, r#"{"id":1}"#).replace("%3A1%7D", "%3A2%7D");
        assert_eq!(
            validate_init_data(&init, BOT_TOKEN, 86_400, now),
            Err(InitDataError::BadSignature)
        );
    }

    #[test]
    fn test_stale_and_future_auth_date_rejected() {
        let now = 1_714_557_600;
        let stale = signed_init_data(now - 86_401, r#"{"id":1}"#);
        assert_eq!(
            validate_init_data(&stale, BOT_TOKEN, 86_400, now),
            Err(InitDataError::Expired)
        );

        let future = signed_init_data(now + 3_600, r#"{"id":1}"#);
        assert_eq!(
            validate_init_data(&future, BOT_TOKEN, 86_400, now),
            Err(InitDataError::Expired)
        );
    }

    #[test]
    fn test_missing_fields() {
        assert_eq!(
            validate_init_data("auth_date=1&user=%7B%7D", BOT_TOKEN, 86_400, 1),
            Err(InitDataError::MissingHash)
        );
        assert_eq!(
            validate_init_data("hash=abc&user=%7B%7D", BOT_TOKEN, 86_400, 1),
            Err(InitDataError::InvalidAuthDate)
        );
    }
}
