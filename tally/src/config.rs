//! Application configuration constants
//!
//! Central location for sync limits, timings and validation boundaries
//! used throughout the data layer.

use std::time::Duration;

// ===== Retry Queue =====

/// Number of failed replays after which a queued operation is dropped
/// and moved to the failure log.
pub const MAX_ATTEMPTS: i64 = 5;

/// Delay between an offline→online transition and the drain it triggers.
/// Flaky reconnects that drop again within this window never drain.
pub const ONLINE_SETTLE_DELAY: Duration = Duration::from_secs(2);

/// How often the remote is pinged while the client believes it is offline
pub const REACHABILITY_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Debounce window for `schedule_push`.
pub const PUSH_DEBOUNCE: Duration = Duration::from_millis(1500);

// ===== Reconciliation =====

/// Rows requested per page during bulk and delta pulls.
pub const PULL_PAGE_SIZE: usize = 1000;

/// `sync_meta` key holding the timestamp of the last completed sync.
pub const META_LAST_SYNC_AT: &str = "last_sync_at";

// ===== Import =====

/// Default maximum edit distance for a fuzzy name match.
pub const DEFAULT_MATCH_THRESHOLD: usize = 2;

/// Upper bound accepted for a configured match threshold.
/// Larger values start merging unrelated short names.
pub const MAX_MATCH_THRESHOLD: usize = 10;

/// Name of the category transactions fall back to when their source
/// category cannot be resolved.
pub const FALLBACK_CATEGORY_NAME: &str = "Uncategorized";

// ===== Remote =====

/// Default request timeout for the HTTP remote, in seconds.
pub const DEFAULT_REMOTE_TIMEOUT_SECS: u64 = 20;

/// Minimum accepted request timeout in seconds
pub const MIN_REMOTE_TIMEOUT_SECS: u64 = 1;

/// Maximum accepted request timeout in seconds
pub const MAX_REMOTE_TIMEOUT_SECS: u64 = 120;

// ===== User Settings Defaults =====

/// Currency used when the remote settings row has none.
pub const DEFAULT_CURRENCY: &str = "EUR";

/// Language used when the remote settings row has none.
pub const DEFAULT_LANGUAGE: &str = "en";
