//! Prometheus metrics for vip-service.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder. Safe to call more than once; only the
/// first call installs.
pub fn init_metrics() {
    METRICS_HANDLE.get_or_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Prometheus recorder already installed, using a detached handle");
                PrometheusBuilder::new().build_recorder().handle()
            })
    });
}

pub fn get_metrics() -> String {
    METRICS_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_else(|| "# Metrics recorder not initialized\n".to_string())
}

pub fn record_reconciliation(trigger: &str, outcome: &str) {
    metrics::counter!(
        "vip_reconciliations_total",
        "trigger" => trigger.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

pub fn record_commission(outcome: &str) {
    metrics::counter!("vip_commissions_total", "outcome" => outcome.to_string()).increment(1);
}

pub fn record_gateway_check(result: &str) {
    metrics::counter!("vip_gateway_checks_total", "result" => result.to_string()).increment(1);
}

pub fn record_notification(kind: &str, result: &str) {
    metrics::counter!(
        "vip_notifications_total",
        "kind" => kind.to_string(),
        "result" => result.to_string()
    )
    .increment(1);
}

pub fn record_sync_tick(selected: usize, duration_secs: f64) {
    metrics::counter!("vip_sync_ticks_total").increment(1);
    metrics::histogram!("vip_sync_batch_size").record(selected as f64);
    metrics::histogram!("vip_sync_tick_duration_seconds").record(duration_secs);
}
