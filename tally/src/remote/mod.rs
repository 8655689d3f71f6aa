//! Remote store contract
//!
//! The remote is an opaque networked CRUD service. Rows travel as JSON
//! objects keyed by [`Table`]; every failure is a tagged [`RemoteError`].

pub mod error;
pub mod http;
pub mod memory;

pub use error::{RemoteError, RemoteResult};
pub use http::HttpRemote;
pub use memory::InMemoryRemote;

use crate::database::Table;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

/// One page of a collection ordered by `updated_at`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub offset: usize,
    pub limit: usize,
    pub ascending: bool,
    /// Only rows with `updated_at` strictly after this instant
    pub updated_after: Option<DateTime<Utc>>,
}

impl PageRequest {
    pub fn first(limit: usize) -> Self {
        Self {
            offset: 0,
            limit,
            ascending: true,
            updated_after: None,
        }
    }

    pub fn since(mut self, updated_after: Option<DateTime<Utc>>) -> Self {
        self.updated_after = updated_after;
        self
    }

    pub fn next(&self) -> Self {
        Self {
            offset: self.offset + self.limit,
            ..self.clone()
        }
    }
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Insert a row and return the stored representation
    async fn insert(&self, table: Table, row: &Value) -> RemoteResult<Value>;

    /// Apply a partial update and return the stored representation
    async fn update(&self, table: Table, id: &str, patch: &Value) -> RemoteResult<Value>;

    /// Stamp `deleted_at` on a row
    async fn soft_delete(&self, table: Table, id: &str, deleted_at: DateTime<Utc>)
        -> RemoteResult<()>;

    async fn list(&self, table: Table, page: &PageRequest) -> RemoteResult<Vec<Value>>;

    async fn get_one(&self, table: Table, id: &str) -> RemoteResult<Option<Value>>;

    /// Succeeds whenever the remote answers at all, whatever the status
    async fn ping(&self) -> RemoteResult<()>;
}
