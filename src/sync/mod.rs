//! Offline sync: client mutation replay and server-side reconciliation.

pub mod offline_queue;
pub mod reconciler;

pub use offline_queue::{DeadLetter, DrainReport, OfflineQueue, QueuedOperation};
pub use reconciler::{ClientOperation, OpOutcome, OpStatus, SyncReconciler};
