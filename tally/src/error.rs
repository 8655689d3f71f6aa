//! Error types for Tally
//!
//! All errors use thiserror for structured error handling.
//! These errors can be serialized to the UI layer.

use crate::database::Table;
use crate::remote::RemoteError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A terminal or transient failure reported by the remote store.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("Record not found: {table}/{id}")]
    NotFound { table: Table, id: String },

    #[error("No authenticated actor")]
    NotAuthenticated,

    #[error("Invalid record for {table}: {reason}")]
    InvalidRecord { table: Table, reason: String },

    #[error("Import error: {0}")]
    Import(String),

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("{0}")]
    Generic(String),
}

impl AppError {
    pub fn not_found(table: Table, id: impl Into<String>) -> Self {
        Self::NotFound {
            table,
            id: id.into(),
        }
    }

    pub fn invalid(table: Table, reason: impl Into<String>) -> Self {
        Self::InvalidRecord {
            table,
            reason: reason.into(),
        }
    }
}

impl serde::Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
