//! Services module
//!
//! Application services around the sync layer: persisted settings and the
//! periodic sync scheduler.

pub mod scheduler;
pub mod settings;

pub use scheduler::{run_cycle, SyncFrequency, SyncScheduler, Trigger};
pub use settings::{AppSettings, SettingsService};
