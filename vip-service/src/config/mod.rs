//! Configuration module for vip-service.

use secrecy::{ExposeSecret, Secret};
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct VipConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub gateway: GatewayConfig,
    pub telegram: TelegramConfig,
    pub sync: SyncConfig,
    pub referral: ReferralConfig,
    pub admin: AdminConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

/// QRIS gateway credentials and endpoints.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub api_url: String,
    pub api_key: String,
    pub api_secret: Secret<String>,
    pub webhook_secret: Secret<String>,
    pub timeout_secs: u64,
    pub callback_url: Option<String>,
    /// Park paid payments whose reported amount differs from the stored one
    /// instead of activating them.
    pub reject_amount_mismatch: bool,
}

impl GatewayConfig {
    pub fn is_configured(&self) -> bool {
        !self.api_key.is_empty() && !self.api_secret.expose_secret().is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: Secret<String>,
    pub api_url: String,
    pub auth_max_age_secs: i64,
    /// Accept a bare `X-Telegram-User-Id` header instead of signed initData.
    /// Development only.
    pub allow_dev_user_header: bool,
    /// Origins allowed to call the API from the Mini App. Empty disables CORS.
    pub allowed_origins: Vec<String>,
}

impl TelegramConfig {
    pub fn has_bot_token(&self) -> bool {
        !self.bot_token.expose_secret().is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub lookback_hours: i64,
    pub batch_size: i64,
    pub startup_delay_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
            lookback_hours: 24,
            batch_size: 50,
            startup_delay_secs: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReferralConfig {
    /// Commission rate in basis points of the payment amount.
    pub commission_rate_bps: i64,
    pub min_withdrawal: i64,
}

impl Default for ReferralConfig {
    fn default() -> Self {
        Self {
            commission_rate_bps: 2500,
            min_withdrawal: 50_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AdminConfig {
    /// Token for `/internal` routes. Empty disables them.
    pub api_token: Secret<String>,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn secret_env(key: &str) -> Secret<String> {
    Secret::new(env::var(key).unwrap_or_default())
}

impl VipConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;
        let sync_defaults = SyncConfig::default();
        let referral_defaults = ReferralConfig::default();

        let referral = ReferralConfig {
            commission_rate_bps: env_or(
                "COMMISSION_RATE_BPS",
                referral_defaults.commission_rate_bps,
            ),
            min_withdrawal: env_or("MIN_WITHDRAWAL", referral_defaults.min_withdrawal),
        };
        if !(0..=10_000).contains(&referral.commission_rate_bps) {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "COMMISSION_RATE_BPS must be between 0 and 10000, got {}",
                referral.commission_rate_bps
            )));
        }

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME").unwrap_or_else(|_| "vip-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|s| !s.is_empty()),
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: env_or("DATABASE_MAX_CONNECTIONS", 10),
                min_connections: env_or("DATABASE_MIN_CONNECTIONS", 2),
            },
            gateway: GatewayConfig {
                api_url: env::var("QRIS_API_URL")
                    .unwrap_or_else(|_| "https://qris.pw/api".to_string())
                    .trim_end_matches('/')
                    .to_string(),
                api_key: env::var("QRIS_API_KEY").unwrap_or_default(),
                api_secret: secret_env("QRIS_API_SECRET"),
                webhook_secret: secret_env("QRIS_WEBHOOK_SECRET"),
                timeout_secs: env_or("QRIS_TIMEOUT_SECS", 10),
                callback_url: env::var("QRIS_CALLBACK_URL").ok().filter(|s| !s.is_empty()),
                reject_amount_mismatch: env_or("QRIS_REJECT_AMOUNT_MISMATCH", false),
            },
            telegram: TelegramConfig {
                bot_token: secret_env("TELEGRAM_BOT_TOKEN"),
                api_url: env::var("TELEGRAM_API_URL")
                    .unwrap_or_else(|_| "https://api.telegram.org".to_string())
                    .trim_end_matches('/')
                    .to_string(),
                auth_max_age_secs: env_or("TELEGRAM_AUTH_MAX_AGE_SECS", 86_400),
                allow_dev_user_header: env_or("ALLOW_DEV_USER_HEADER", false),
                allowed_origins: env::var("WEBAPP_ALLOWED_ORIGINS")
                    .unwrap_or_default()
                    .split(',')
                    .map(|o| o.trim().to_string())
                    .filter(|o| !o.is_empty())
                    .collect(),
            },
            sync: SyncConfig {
                enabled: env_or("SYNC_ENABLED", sync_defaults.enabled),
                interval_secs: env_or("SYNC_INTERVAL_SECS", sync_defaults.interval_secs).max(1),
                lookback_hours: env_or("SYNC_LOOKBACK_HOURS", sync_defaults.lookback_hours),
                batch_size: env_or("SYNC_BATCH_SIZE", sync_defaults.batch_size),
                startup_delay_secs: env_or(
                    "SYNC_STARTUP_DELAY_SECS",
                    sync_defaults.startup_delay_secs,
                ),
            },
            referral,
            admin: AdminConfig {
                api_token: secret_env("ADMIN_API_TOKEN"),
            },
        })
    }
}
