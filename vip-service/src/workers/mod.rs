pub mod sync;

pub use sync::{PaymentSyncWorker, SyncStats, SyncWorkerHandle, TickSummary};
