//! Coordination of transaction watches
//!
//! The coordination layer:
//! 1. Records submitted extrinsics as pending
//! 2. Runs one confirmation watch per transaction
//! 3. Applies watch results and cascades them through nonce slots
//! 4. Normalizes stale records after a restart

pub mod engine;
pub mod reconciler;

pub use engine::{WatchCoordinator, WatchOptions};
pub use reconciler::{ApplyOutcome, RestartSummary, StatusReconciler};
