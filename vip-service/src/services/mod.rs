//! Services module for vip-service.

pub mod commission;
pub mod database;
pub mod gateway;
pub mod metrics;
pub mod notifier;
pub mod packages;
pub mod reconciliation;
pub mod vip;
pub mod withdrawals;

pub use database::Database;
pub use gateway::{
    GatewayError, GatewayObservation, GatewayStatus, PaymentGateway, QrisGatewayClient,
};
pub use metrics::{get_metrics, init_metrics};
pub use notifier::{DisabledNotifier, Notifier, NotifyError, TelegramNotifier};
pub use packages::{validate_package_name, VipPackage};
pub use reconciliation::{
    Activation, PaymentLookup, ReconcileOutcome, ReconciliationCoordinator, Trigger,
};
pub use withdrawals::WithdrawalService;
