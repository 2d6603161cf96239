//! Application startup and lifecycle management.

use crate::config::VipConfig;
use crate::handlers;
use crate::services::{
    get_metrics, init_metrics, Database, DisabledNotifier, Notifier, PaymentGateway,
    QrisGatewayClient, ReconciliationCoordinator, TelegramNotifier, WithdrawalService,
};
use crate::workers::{PaymentSyncWorker, SyncWorkerHandle};
use axum::{
    extract::State,
    http::{HeaderValue, Method, StatusCode},
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use service_core::error::AppError;
use service_core::middleware::metrics::metrics_middleware;
use service_core::middleware::tracing::request_id_middleware;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: VipConfig,
    pub db: Arc<Database>,
    pub coordinator: ReconciliationCoordinator,
    pub withdrawals: WithdrawalService,
    pub sync: SyncWorkerHandle,
}

impl AppState {
    /// Wire services around an existing database. The sync worker is
    /// returned unstarted; its handle is already in the state.
    pub fn assemble(
        config: VipConfig,
        db: Arc<Database>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn Notifier>,
    ) -> (Self, PaymentSyncWorker) {
        let coordinator = ReconciliationCoordinator::new(
            db.clone(),
            gateway,
            notifier,
            config.referral.commission_rate_bps,
        )
        .with_amount_check(config.gateway.reject_amount_mismatch);
        let withdrawals = WithdrawalService::new(db.clone(), config.referral.min_withdrawal);
        let worker = PaymentSyncWorker::new(config.sync.clone(), db.clone(), coordinator.clone());

        let state = Self {
            config,
            db,
            coordinator,
            withdrawals,
            sync: worker.handle(),
        };
        (state, worker)
    }
}

/// Health check endpoint for Docker/K8s liveness probes.
async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "service": "vip-service",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

/// Readiness check endpoint for K8s readiness probes.
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.db.health_check().await {
        Ok(_) => (StatusCode::OK, Json(json!({ "status": "ready" }))),
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed - database unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unavailable", "error": e.to_string() })),
            )
        }
    }
}

/// Metrics endpoint for Prometheus scraping.
async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        get_metrics(),
    )
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match o.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::error!(origin = %o, error = %e, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::HeaderName::from_static("x-telegram-init-data"),
        ])
}

/// Full HTTP router for the given state.
pub fn app_router(state: AppState) -> Router {
    let cors = (!state.config.telegram.allowed_origins.is_empty())
        .then(|| cors_layer(&state.config.telegram.allowed_origins));

    let router = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics_handler))
        .route("/packages", get(handlers::payments::list_packages))
        // Gateway callbacks (HMAC-signed)
        .route("/webhooks/qris", post(handlers::webhook::qris_webhook))
        // Mini App endpoints (Telegram initData)
        .route("/payments", post(handlers::payments::create_payment))
        .route("/payments/history", get(handlers::payments::payment_history))
        .route(
            "/payments/:transaction_id/status",
            get(handlers::payments::payment_status),
        )
        .route("/users", post(handlers::users::register_user))
        .route(
            "/users/:telegram_id/vip",
            get(handlers::users::get_vip_status),
        )
        .route(
            "/users/:telegram_id/referrals",
            get(handlers::users::get_referral_stats),
        )
        .route(
            "/withdrawals",
            post(handlers::withdrawals::request_withdrawal)
                .get(handlers::withdrawals::list_withdrawals),
        )
        // Operator endpoints (admin token)
        .route(
            "/internal/withdrawals/:id/approve",
            post(handlers::internal::approve_withdrawal),
        )
        .route(
            "/internal/withdrawals/:id/reject",
            post(handlers::internal::reject_withdrawal),
        )
        .route("/internal/sync/stats", get(handlers::internal::sync_stats))
        .route(
            "/internal/sync/:transaction_id",
            post(handlers::internal::sync_payment),
        )
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(request_id_middleware));

    let router = match cors {
        Some(cors) => router.layer(cors),
        None => router,
    };

    router.with_state(state)
}

/// Application container for managing server lifecycle.
pub struct Application {
    http_port: u16,
    http_listener: TcpListener,
    state: AppState,
    worker: PaymentSyncWorker,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: VipConfig) -> Result<Self, AppError> {
        Self::build_internal(config, true).await
    }

    /// Build the application without running migrations.
    /// Use this in tests when migrations are already applied by the test harness.
    pub async fn build_without_migrations(config: VipConfig) -> Result<Self, AppError> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(config: VipConfig, run_migrations: bool) -> Result<Self, AppError> {
        init_metrics();

        let db = Database::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;

        if run_migrations {
            db.run_migrations().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to run migrations");
                e
            })?;
        }

        let db = Arc::new(db);

        let gateway = QrisGatewayClient::new(config.gateway.clone()).map_err(|e| {
            tracing::error!(error = %e, "Failed to create gateway client");
            AppError::InternalError(anyhow::anyhow!("Failed to create gateway client: {}", e))
        })?;
        if gateway.is_configured() {
            tracing::info!(api_url = %config.gateway.api_url, "QRIS gateway client initialized");
        } else {
            tracing::warn!("QRIS credentials not configured - payments and sync are disabled");
        }

        let notifier: Arc<dyn Notifier> = if config.telegram.has_bot_token() {
            let notifier = TelegramNotifier::new(&config.telegram).map_err(|e| {
                tracing::error!(error = %e, "Failed to create Telegram notifier");
                AppError::InternalError(anyhow::anyhow!("Failed to create notifier: {}", e))
            })?;
            Arc::new(notifier)
        } else {
            tracing::warn!("TELEGRAM_BOT_TOKEN not set - user notifications are disabled");
            Arc::new(DisabledNotifier)
        };

        let (state, worker) = AppState::assemble(config.clone(), db, Arc::new(gateway), notifier);

        let http_addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let http_listener = TcpListener::bind(http_addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %http_addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let http_port = http_listener.local_addr()?.port();

        tracing::info!(http_port = http_port, "VIP service listener bound");

        Ok(Self {
            http_port,
            http_listener,
            state,
            worker,
        })
    }

    /// Get the HTTP port the server is listening on.
    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    /// Get a reference to the database.
    pub fn db(&self) -> &Database {
        &self.state.db
    }

    /// Handle for reading sync stats and stopping the worker.
    pub fn sync_handle(&self) -> SyncWorkerHandle {
        self.state.sync.clone()
    }

    /// Start the sync worker and serve HTTP until the server stops.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let sync = self.state.sync.clone();
        let worker_task = self.worker.start();

        let router = app_router(self.state);
        let result = axum::serve(self.http_listener, router).await;

        sync.shutdown();
        if let Some(task) = worker_task {
            task.await.ok();
        }

        result.map_err(|e| {
            tracing::error!(error = %e, "HTTP server error");
            std::io::Error::other(format!("HTTP server error: {}", e))
        })
    }
}
