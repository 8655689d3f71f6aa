//! Database models
//!
//! Rust structs representing synchronized entities and sync bookkeeping.
//! Entity rows live in the local mirror as JSON; these structs are the
//! typed view over them.

use super::table::Table;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A typed entity stored in exactly one [`Table`].
pub trait SyncRecord: Serialize + DeserializeOwned + Send + Sync {
    const TABLE: Table;

    fn id(&self) -> &str;
}

macro_rules! sync_record {
    ($ty:ty, $table:expr) => {
        impl SyncRecord for $ty {
            const TABLE: Table = $table;

            fn id(&self) -> &str {
                &self.id
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Income,
    Expense,
}

impl TransactionType {
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionType::Income => "income",
            TransactionType::Expense => "expense",
        }
    }
}

/// A concrete money movement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub user_id: String,
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub paid_by: Option<String>,
    #[serde(default)]
    pub category_id: Option<String>,
    #[serde(default)]
    pub context_id: Option<String>,
    /// Template this transaction was materialized from, if any
    #[serde(default)]
    pub recurring_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: TransactionType,
    /// Unsigned magnitude; direction lives in `kind`
    pub amount: Decimal,
    #[serde(default)]
    pub description: String,
    pub date: NaiveDate,
    /// Local-only `YYYY-MM` partition derived from `date`
    #[serde(default)]
    pub year_month: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sync_token: Option<String>,
    #[serde(default)]
    pub pending_sync: bool,
}

/// Spending or income category, optionally nested under a parent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub id: String,
    pub user_id: String,
    #[serde(default)]
    pub group_id: Option<String>,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: TransactionType,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sync_token: Option<String>,
    #[serde(default)]
    pub pending_sync: bool,
}

/// Free-form tag such as a trip or project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Context {
    pub id: String,
    pub user_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sync_token: Option<String>,
    #[serde(default)]
    pub pending_sync: bool,
}

/// Shared budget between several users
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub name: String,
    pub created_by: String,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sync_token: Option<String>,
    #[serde(default)]
    pub pending_sync: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMember {
    pub id: String,
    pub group_id: String,
    pub user_id: String,
    #[serde(default)]
    pub role: Option<String>,
    /// Fraction of shared expenses carried by this member
    #[serde(default)]
    pub share: Option<Decimal>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sync_token: Option<String>,
    #[serde(default)]
    pub pending_sync: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShoppingItem {
    pub id: String,
    pub added_by: String,
    #[serde(default)]
    pub group_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub quantity: Option<Decimal>,
    #[serde(default)]
    pub checked: bool,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sync_token: Option<String>,
    #[serde(default)]
    pub pending_sync: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl FromStr for Frequency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "daily" => Ok(Frequency::Daily),
            "weekly" => Ok(Frequency::Weekly),
            "monthly" => Ok(Frequency::Monthly),
            "yearly" | "annual" | "annually" => Ok(Frequency::Yearly),
            other => Err(format!("Unknown frequency: {}", other)),
        }
    }
}

/// Template expanded into concrete transactions by the materializer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurringTransaction {
    pub id: String,
    pub user_id: String,
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub category_id: Option<String>,
    #[serde(default)]
    pub context_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: TransactionType,
    pub amount: Decimal,
    #[serde(default)]
    pub description: String,
    pub frequency: Frequency,
    pub start_date: NaiveDate,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub last_generated: Option<NaiveDate>,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sync_token: Option<String>,
    #[serde(default)]
    pub pending_sync: bool,
}

/// Per-user preferences, one row keyed by the user id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSettings {
    pub id: String,
    pub currency: String,
    pub language: String,
    #[serde(default)]
    pub default_group_id: Option<String>,
    /// Day of month the budgeting period starts on (1-28)
    pub month_start_day: u32,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

sync_record!(Transaction, Table::Transactions);
sync_record!(Category, Table::Categories);
sync_record!(Context, Table::Contexts);
sync_record!(Group, Table::Groups);
sync_record!(GroupMember, Table::GroupMembers);
sync_record!(ShoppingItem, Table::ShoppingItems);
sync_record!(RecurringTransaction, Table::RecurringTransactions);
sync_record!(UserSettings, Table::UserSettings);

fn default_true() -> bool {
    true
}

// ===== Sync bookkeeping =====

/// Kind of remote call a queued operation replays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueOperation {
    Insert,
    Update,
    Delete,
}

impl QueueOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueOperation::Insert => "insert",
            QueueOperation::Update => "update",
            QueueOperation::Delete => "delete",
        }
    }
}

impl fmt::Display for QueueOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "insert" => Ok(QueueOperation::Insert),
            "update" => Ok(QueueOperation::Update),
            "delete" => Ok(QueueOperation::Delete),
            other => Err(format!("Unknown queue operation: {}", other)),
        }
    }
}

/// A failed remote mutation waiting to be replayed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOperation {
    pub id: i64,
    pub table: Table,
    pub operation: QueueOperation,
    pub record_id: String,
    /// Remote-bound payload snapshot
    pub data: Option<serde_json::Value>,
    pub attempts: i64,
    pub queued_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// A queued operation that exhausted its attempts and was dropped
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncFailure {
    pub id: i64,
    pub table: Table,
    pub operation: QueueOperation,
    pub record_id: String,
    pub data: Option<serde_json::Value>,
    pub attempts: i64,
    pub queued_at: DateTime<Utc>,
    pub failed_at: DateTime<Utc>,
    pub last_error: Option<String>,
}
