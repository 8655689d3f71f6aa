//! Tally library
//!
//! Local-first data layer of the Tally budgeting client: a SQLite mirror of
//! the remote store, an offline retry queue, reconciliation, recurring
//! transaction materialization and import conflict resolution.

pub mod app;
pub mod config;
pub mod database;
pub mod error;
pub mod import;
pub mod remote;
pub mod services;
pub mod session;
pub mod sync;
