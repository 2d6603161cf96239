//! Common test utilities for vip-service integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::Secret;
use service_core::config::Config as CommonConfig;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use uuid::Uuid;
use vip_service::config::{
    AdminConfig, DatabaseConfig, GatewayConfig, ReferralConfig, SyncConfig, TelegramConfig,
    VipConfig,
};
use vip_service::models::{NewPayment, Payment, User};
use vip_service::services::gateway::{CreatePaymentRequest, CreatedPayment};
use vip_service::services::{
    Database, GatewayError, GatewayObservation, GatewayStatus, Notifier, NotifyError,
    PaymentGateway, ReconciliationCoordinator,
};

static INIT: Once = Once::new();

pub const WEBHOOK_SECRET: &str = "test-webhook-secret";
pub const ADMIN_TOKEN: &str = "test-admin-token";
pub const COMMISSION_RATE_BPS: i64 = 2500;

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,vip_service=debug,sqlx=warn")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub fn database_url() -> String {
    std::env::var("TEST_DATABASE_URL")
        .expect("TEST_DATABASE_URL must be set to run database tests")
}

/// Configuration for tests. Gateway credentials are set so the gateway
/// reports itself configured; the sync worker is disabled.
pub fn test_config(database_url: &str) -> VipConfig {
    VipConfig {
        common: CommonConfig { port: 0 },
        service_name: "vip-service-test".to_string(),
        service_version: "test".to_string(),
        log_level: "debug".to_string(),
        otlp_endpoint: None,
        database: DatabaseConfig {
            url: database_url.to_string(),
            max_connections: 10,
            min_connections: 1,
        },
        gateway: GatewayConfig {
            api_url: "http://127.0.0.1:9".to_string(),
            api_key: "test-key".to_string(),
            api_secret: Secret::new("test-secret".to_string()),
            webhook_secret: Secret::new(WEBHOOK_SECRET.to_string()),
            timeout_secs: 2,
            callback_url: None,
            reject_amount_mismatch: false,
        },
        telegram: TelegramConfig {
            bot_token: Secret::new(String::new()),
            api_url: "http://127.0.0.1:9".to_string(),
            auth_max_age_secs: 86_400,
            allow_dev_user_header: true,
            allowed_origins: Vec::new(),
        },
        sync: SyncConfig {
            enabled: false,
            ..SyncConfig::default()
        },
        referral: ReferralConfig::default(),
        admin: AdminConfig {
            api_token: Secret::new(ADMIN_TOKEN.to_string()),
        },
    }
}

/// Connect to the test database and apply migrations.
pub async fn test_db() -> Arc<Database> {
    init_tracing();
    let db = Database::new(&database_url(), 10, 1)
        .await
        .expect("Failed to connect to test database");
    db.run_migrations().await.expect("Failed to run migrations");
    Arc::new(db)
}

/// A numeric Telegram id unlikely to collide across test runs.
pub fn unique_telegram_id() -> String {
    format!("7{:011}", Uuid::new_v4().as_u128() % 100_000_000_000)
}

pub async fn seed_user(db: &Database, referral_code: Option<&str>) -> User {
    let (user, created) = db
        .register_user(&unique_telegram_id(), Some("tester"), referral_code)
        .await
        .expect("Failed to register user");
    assert!(created);
    user
}

pub async fn seed_payment(db: &Database, telegram_id: &str, package: &str, amount: i64) -> Payment {
    let suffix = Uuid::new_v4().simple().to_string();
    db.insert_payment(&NewPayment {
        telegram_id: telegram_id.to_string(),
        order_id: format!("VIP-{}-{}", telegram_id, suffix),
        transaction_id: format!("QR-{}", suffix),
        package_name: package.to_string(),
        amount,
        qris_string: Some("00020101021226".to_string()),
    })
    .await
    .expect("Failed to insert payment")
}

pub async fn reload_user(db: &Database, telegram_id: &str) -> User {
    db.get_user(telegram_id)
        .await
        .expect("Failed to load user")
        .expect("User missing")
}

pub async fn reload_payment(db: &Database, payment: &Payment) -> Payment {
    db.get_payment_by_order_id(&payment.order_id)
        .await
        .expect("Failed to load payment")
        .expect("Payment missing")
}

pub async fn commission_rows(db: &Database, payment_id: i64) -> i64 {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM payment_commissions WHERE payment_id = $1")
        .bind(payment_id)
        .fetch_one(db.pool())
        .await
        .expect("Failed to count commission rows")
}

pub fn paid(amount: i64) -> GatewayObservation {
    GatewayObservation {
        status: GatewayStatus::Paid,
        amount: Some(amount),
        paid_at: None,
    }
}

pub fn observed(status: GatewayStatus) -> GatewayObservation {
    GatewayObservation {
        status,
        amount: None,
        paid_at: None,
    }
}

/// Gateway double answering checks with a fixed observation, or a timeout
/// when none is set or the transaction is not the one it answers for.
#[derive(Default)]
pub struct MockGateway {
    observation: Mutex<Option<GatewayObservation>>,
    only_transaction: Option<String>,
    created: Mutex<Option<CreatedPayment>>,
    pub checks: AtomicUsize,
}

impl MockGateway {
    pub fn answering(observation: GatewayObservation) -> Arc<Self> {
        let gateway = Self::default();
        *gateway.observation.lock().unwrap() = Some(observation);
        Arc::new(gateway)
    }

    /// Answer for one transaction only; every other check times out.
    pub fn answering_only(transaction_id: &str, observation: GatewayObservation) -> Arc<Self> {
        let gateway = Self {
            only_transaction: Some(transaction_id.to_string()),
            ..Self::default()
        };
        *gateway.observation.lock().unwrap() = Some(observation);
        Arc::new(gateway)
    }

    pub fn unreachable() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn creating(transaction_id: &str) -> Arc<Self> {
        let gateway = Self::default();
        *gateway.created.lock().unwrap() = Some(CreatedPayment {
            transaction_id: transaction_id.to_string(),
            qris_string: Some("00020101021226".to_string()),
            expires_at: None,
        });
        Arc::new(gateway)
    }

    pub fn check_count(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    fn is_configured(&self) -> bool {
        true
    }

    async fn check_payment(
        &self,
        transaction_id: &str,
    ) -> Result<GatewayObservation, GatewayError> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        if let Some(only) = &self.only_transaction {
            if only != transaction_id {
                return Err(GatewayError::Timeout);
            }
        }
        self.observation
            .lock()
            .unwrap()
            .clone()
            .ok_or(GatewayError::Timeout)
    }

    async fn create_payment(
        &self,
        _request: &CreatePaymentRequest,
    ) -> Result<CreatedPayment, GatewayError> {
        self.created
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| GatewayError::Rejected("mock gateway refused".to_string()))
    }
}

/// Notifier that records every message instead of sending it.
#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    pub fn messages_to(&self, chat_id: &str) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == chat_id)
            .map(|(_, text)| text.clone())
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    fn is_enabled(&self) -> bool {
        true
    }

    async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), NotifyError> {
        self.sent
            .lock()
            .unwrap()
            .push((chat_id.to_string(), text.to_string()));
        Ok(())
    }
}

pub fn coordinator(
    db: Arc<Database>,
    gateway: Arc<dyn PaymentGateway>,
    notifier: Arc<dyn Notifier>,
) -> ReconciliationCoordinator {
    ReconciliationCoordinator::new(db, gateway, notifier, COMMISSION_RATE_BPS)
}

pub fn assert_close(actual: DateTime<Utc>, expected: DateTime<Utc>) {
    let drift = (actual - expected).num_seconds().abs();
    assert!(
        drift <= 5,
        "expected {} to be within 5s of {}",
        actual,
        expected
    );
}
