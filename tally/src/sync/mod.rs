//! Sync layer
//!
//! Write path, retry queue, reconciliation and recurring materialization,
//! tied together by the [`SyncManager`].

pub mod connectivity;
pub mod manager;
pub mod pull;
pub mod queue;
pub mod recurring;
pub mod status;
pub mod write_path;

pub use connectivity::Connectivity;
pub use manager::{SyncManager, SyncReport, SyncSkip};
pub use pull::{PullMode, PullReport, Reconciler};
pub use queue::{DrainReport, DrainSkip, RetryQueue};
pub use recurring::{MaterializeReport, RecurringMaterializer};
pub use status::{Subscription, SyncErrorEntry, SyncStatus, SyncStatusHub};
pub use write_path::WritePath;
