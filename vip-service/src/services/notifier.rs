//! Telegram notifications.
//!
//! Delivery is best effort: callers log failures and move on. Nothing here
//! is ever retried or allowed to affect committed payment state.

use crate::config::TelegramConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Notifications are disabled")]
    Disabled,

    #[error("Notification transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Telegram API rejected message: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    fn is_enabled(&self) -> bool;

    /// Send an HTML-formatted message to a Telegram chat.
    async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), NotifyError>;
}

/// Sends messages through the Telegram Bot API `sendMessage` method.
pub struct TelegramNotifier {
    client: Client,
    api_url: String,
    bot_token: Secret<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramResponse {
    ok: bool,
    description: Option<String>,
}

impl TelegramNotifier {
    pub fn new(config: &TelegramConfig) -> Result<Self, NotifyError> {
        let client = Client::builder().timeout(Duration::from_secs(5)).build()?;
        Ok(Self {
            client,
            api_url: config.api_url.clone(),
            bot_token: config.bot_token.clone(),
        })
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    fn is_enabled(&self) -> bool {
        !self.bot_token.expose_secret().is_empty()
    }

    async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), NotifyError> {
        if !self.is_enabled() {
            return Err(NotifyError::Disabled);
        }

        let url = format!(
            "{}/bot{}/sendMessage",
            self.api_url,
            self.bot_token.expose_secret()
        );

        let response = self
            .client
            .post(&url)
            .json(&json!({
                "chat_id": chat_id,
                "text": text,
                "parse_mode": "HTML",
            }))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        let parsed: Option<TelegramResponse> = serde_json::from_str(&body).ok();

        match parsed {
            Some(r) if status.is_success() && r.ok => Ok(()),
            Some(r) => Err(NotifyError::Rejected(
                r.description.unwrap_or_else(|| format!("HTTP {}", status)),
            )),
            None => Err(NotifyError::Rejected(format!("HTTP {}", status))),
        }
    }
}

/// Used when no bot token is configured.
#[derive(Debug, Default)]
pub struct DisabledNotifier;

#[async_trait]
impl Notifier for DisabledNotifier {
    fn is_enabled(&self) -> bool {
        false
    }

    async fn send_message(&self, chat_id: &str, _text: &str) -> Result<(), NotifyError> {
        tracing::debug!(chat_id = %chat_id, "Notification skipped, notifier disabled");
        Err(NotifyError::Disabled)
    }
}

/// `Rp 2.500` style formatting with dot thousands separators.
pub fn format_rupiah(amount: i64) -> String {
    let digits = amount.unsigned_abs().to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push('.');
        }
        grouped.push(ch);
    }
    if amount < 0 {
        format!("-Rp {}", grouped)
    } else {
        format!("Rp {}", grouped)
    }
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

pub fn payment_success_message(package_name: &str, vip_expires_at: DateTime<Utc>) -> String {
    format!(
        "✅ <b>Pembayaran Berhasil!</b>\n\n\
         Paket: {}\n\
         Status VIP kamu sudah aktif sampai {} UTC.\n\n\
         Selamat menonton! 🎬",
        escape_html(package_name),
        vip_expires_at.format("%d-%m-%Y %H:%M")
    )
}

pub fn referrer_commission_message(referred_telegram_id: &str, amount: i64) -> String {
    format!(
        "💰 <b>Komisi Referral Diterima!</b>\n\n\
         Pengguna dengan ID <code>{}</code> telah membeli VIP membership.\n\n\
         💵 <b>Komisi: {}</b>\n\n\
         Komisi ini sekarang ditambahkan ke saldo withdraw Anda.",
        escape_html(referred_telegram_id),
        format_rupiah(amount)
    )
}
