//! Background payment sync.
//!
//! Safety net for missed webhooks: every interval, re-query the gateway for
//! recent payments still `pending` and push the answers through the
//! reconciliation coordinator. The worker takes no locks of its own; the
//! coordinator's row lock and `pending` guard make it safe to run alongside
//! webhook and poll traffic.

use crate::config::SyncConfig;
use crate::services::metrics::record_sync_tick;
use crate::services::reconciliation::{ReconcileOutcome, ReconciliationCoordinator, Trigger};
use crate::services::{vip, Database};
use chrono::{DateTime, Utc};
use serde::Serialize;
use service_core::error::AppError;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Point-in-time view of the worker.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStats {
    pub running: bool,
    pub sync_count: u64,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub payments_synced: u64,
    pub payments_activated: u64,
    pub stale_vip_cleared: u64,
    pub interval_secs: u64,
    pub lookback_hours: i64,
    pub batch_size: i64,
}

/// Result of one sync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickSummary {
    pub selected: usize,
    pub activated: usize,
    pub closed: usize,
    pub manual_review: usize,
    pub still_pending: usize,
    pub errors: usize,
    pub stale_vip_cleared: u64,
}

#[derive(Default)]
struct SyncState {
    running: AtomicBool,
    sync_count: AtomicU64,
    payments_synced: AtomicU64,
    payments_activated: AtomicU64,
    stale_vip_cleared: AtomicU64,
    last_sync_time: RwLock<Option<DateTime<Utc>>>,
}

/// Cloneable handle for reading stats and stopping the worker.
#[derive(Clone)]
pub struct SyncWorkerHandle {
    state: Arc<SyncState>,
    shutdown_token: CancellationToken,
    config: SyncConfig,
}

impl SyncWorkerHandle {
    fn new(config: SyncConfig) -> Self {
        Self {
            state: Arc::new(SyncState::default()),
            shutdown_token: CancellationToken::new(),
            config,
        }
    }

    pub fn stats(&self) -> SyncStats {
        let last_sync_time = self
            .state
            .last_sync_time
            .read()
            .map(|guard| *guard)
            .unwrap_or(None);

        SyncStats {
            running: self.state.running.load(Ordering::Relaxed),
            sync_count: self.state.sync_count.load(Ordering::Relaxed),
            last_sync_time,
            payments_synced: self.state.payments_synced.load(Ordering::Relaxed),
            payments_activated: self.state.payments_activated.load(Ordering::Relaxed),
            stale_vip_cleared: self.state.stale_vip_cleared.load(Ordering::Relaxed),
            interval_secs: self.config.interval_secs,
            lookback_hours: self.config.lookback_hours,
            batch_size: self.config.batch_size,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::Relaxed)
    }

    pub fn shutdown(&self) {
        tracing::info!("Initiating payment sync worker shutdown");
        self.shutdown_token.cancel();
    }

    fn record_tick(&self, summary: &TickSummary, at: DateTime<Utc>) {
        self.state.sync_count.fetch_add(1, Ordering::Relaxed);
        self.state
            .payments_synced
            .fetch_add(summary.selected as u64, Ordering::Relaxed);
        self.state
            .payments_activated
            .fetch_add(summary.activated as u64, Ordering::Relaxed);
        self.state
            .stale_vip_cleared
            .fetch_add(summary.stale_vip_cleared, Ordering::Relaxed);
        if let Ok(mut guard) = self.state.last_sync_time.write() {
            *guard = Some(at);
        }
    }
}

pub struct PaymentSyncWorker {
    config: SyncConfig,
    db: Arc<Database>,
    coordinator: ReconciliationCoordinator,
    handle: SyncWorkerHandle,
}

impl PaymentSyncWorker {
    pub fn new(
        config: SyncConfig,
        db: Arc<Database>,
        coordinator: ReconciliationCoordinator,
    ) -> Self {
        let handle = SyncWorkerHandle::new(config.clone());
        Self {
            config,
            db,
            coordinator,
            handle,
        }
    }

    pub fn handle(&self) -> SyncWorkerHandle {
        self.handle.clone()
    }

    /// Spawn the sync loop. Returns `None` when disabled by configuration or
    /// when the gateway has no credentials.
    pub fn start(self) -> Option<JoinHandle<()>> {
        if !self.config.enabled {
            tracing::info!("Payment sync worker disabled by configuration");
            return None;
        }
        if !self.coordinator.gateway().is_configured() {
            tracing::warn!("Payment sync worker not started: gateway credentials missing");
            return None;
        }

        Some(tokio::spawn(async move { self.run().await }))
    }

    async fn run(self) {
        let shutdown = self.handle.shutdown_token.clone();
        self.handle.state.running.store(true, Ordering::Relaxed);

        tracing::info!(
            interval_secs = self.config.interval_secs,
            lookback_hours = self.config.lookback_hours,
            batch_size = self.config.batch_size,
            startup_delay_secs = self.config.startup_delay_secs,
            "Payment sync worker started"
        );

        tokio::select! {
            _ = shutdown.cancelled() => {
                self.handle.state.running.store(false, Ordering::Relaxed);
                tracing::info!("Payment sync worker stopped before first tick");
                return;
            }
            _ = tokio::time::sleep(Duration::from_secs(self.config.startup_delay_secs)) => {}
        }

        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Payment sync worker shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        tracing::error!(error = %e, "Payment sync tick failed");
                    }
                }
            }
        }

        self.handle.state.running.store(false, Ordering::Relaxed);
    }

    /// One sync pass. A failure on one payment is logged and does not stop
    /// the rest of the batch.
    pub async fn run_once(&self) -> Result<TickSummary, AppError> {
        let start = Instant::now();
        let now = Utc::now();
        let mut summary = TickSummary {
            stale_vip_cleared: vip::expire_all_stale_vip(self.db.pool(), now).await?,
            ..Default::default()
        };

        let payments = self
            .db
            .pending_payments_for_sync(now, self.config.lookback_hours, self.config.batch_size)
            .await?;
        summary.selected = payments.len();

        for payment in &payments {
            match self
                .coordinator
                .reconcile_from_gateway(payment, Trigger::SyncWorker)
                .await
            {
                Ok(ReconcileOutcome::Activated(activation)) => {
                    summary.activated += 1;
                    tracing::info!(
                        payment_id = activation.payment_id,
                        telegram_id = %activation.telegram_id,
                        "Payment activated by sync worker"
                    );
                }
                Ok(ReconcileOutcome::Closed { .. }) => summary.closed += 1,
                Ok(ReconcileOutcome::ManualReview { .. }) => summary.manual_review += 1,
                Ok(ReconcileOutcome::StillPending { .. })
                | Ok(ReconcileOutcome::AlreadyProcessed { .. }) => summary.still_pending += 1,
                Err(e) => {
                    summary.errors += 1;
                    tracing::error!(
                        payment_id = payment.id,
                        order_id = %payment.order_id,
                        error = %e,
                        "Failed to sync payment"
                    );
                }
            }
        }

        self.handle.record_tick(&summary, now);
        record_sync_tick(summary.selected, start.elapsed().as_secs_f64());

        if summary.selected > 0 || summary.stale_vip_cleared > 0 {
            tracing::info!(
                selected = summary.selected,
                activated = summary.activated,
                closed = summary.closed,
                manual_review = summary.manual_review,
                errors = summary.errors,
                stale_vip_cleared = summary.stale_vip_cleared,
                "Payment sync tick completed"
            );
        }

        Ok(summary)
    }
}
