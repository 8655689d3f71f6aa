//! Table identifiers
//!
//! Every synchronized entity type is one variant of [`Table`]. The enum
//! carries the per-table rules (local-only fields, owner column, boolean
//! flags) so the store, queue and pull code stay table-agnostic.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Bookkeeping flag set on rows written optimistically while offline.
pub const PENDING_SYNC_FIELD: &str = "pending_sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Transactions,
    Categories,
    Contexts,
    Groups,
    GroupMembers,
    ShoppingItems,
    RecurringTransactions,
    UserSettings,
}

impl Table {
    pub const ALL: [Table; 8] = [
        Table::Transactions,
        Table::Categories,
        Table::Contexts,
        Table::Groups,
        Table::GroupMembers,
        Table::ShoppingItems,
        Table::RecurringTransactions,
        Table::UserSettings,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Table::Transactions => "transactions",
            Table::Categories => "categories",
            Table::Contexts => "contexts",
            Table::Groups => "groups",
            Table::GroupMembers => "group_members",
            Table::ShoppingItems => "shopping_items",
            Table::RecurringTransactions => "recurring_transactions",
            Table::UserSettings => "user_settings",
        }
    }

    /// Fields that exist only in the local mirror and are never sent remotely.
    pub fn local_only_fields(self) -> &'static [&'static str] {
        match self {
            Table::Transactions => &[PENDING_SYNC_FIELD, "year_month"],
            _ => &[PENDING_SYNC_FIELD],
        }
    }

    /// Column stamped with the acting user's id on insert, if the table has one.
    pub fn owner_field(self) -> Option<&'static str> {
        match self {
            Table::Transactions
            | Table::Categories
            | Table::Contexts
            | Table::RecurringTransactions => Some("user_id"),
            Table::Groups => Some("created_by"),
            Table::ShoppingItems => Some("added_by"),
            Table::GroupMembers | Table::UserSettings => None,
        }
    }

    /// Boolean-like flags and the value used when the source sends null.
    fn flag_fields(self) -> &'static [(&'static str, bool)] {
        match self {
            Table::Categories | Table::Contexts | Table::RecurringTransactions => {
                &[("active", true)]
            }
            Table::ShoppingItems => &[("checked", false)],
            _ => &[],
        }
    }

    /// Bring a row into its canonical local shape.
    ///
    /// Derives local-only partition fields and coerces boolean-like flags.
    /// Non-object values are left untouched.
    pub fn normalize(self, row: &mut Value) {
        let Some(obj) = row.as_object_mut() else {
            return;
        };

        for (field, default) in self.flag_fields() {
            if let Some(value) = obj.get(*field) {
                let coerced = coerce_flag(value).unwrap_or(*default);
                obj.insert((*field).to_string(), Value::Bool(coerced));
            }
        }

        if self == Table::Transactions {
            let year_month = obj
                .get("date")
                .and_then(Value::as_str)
                .and_then(|date| date.get(..10))
                .and_then(|date| NaiveDate::parse_from_str(date, "%Y-%m-%d").ok())
                .map(|date| date.format("%Y-%m").to_string());
            if let Some(year_month) = year_month {
                obj.insert("year_month".to_string(), Value::String(year_month));
            }
        }
    }

    /// Remove local-only fields, producing the remote-bound shape.
    pub fn strip_local_only(self, row: &mut Value) {
        if let Some(obj) = row.as_object_mut() {
            for field in self.local_only_fields() {
                obj.remove(*field);
            }
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Table {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Table::ALL
            .into_iter()
            .find(|table| table.as_str() == s)
            .ok_or_else(|| format!("Unknown table: {}", s))
    }
}

/// Interpret a boolean-like JSON value. `None` means "use the default".
fn coerce_flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "t" | "yes" => Some(true),
            "false" | "0" | "f" | "no" | "" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Shallow-merge the fields of `patch` over `base`.
///
/// Both values must be JSON objects; anything else replaces `base` wholesale.
pub fn merge_json(base: &mut Value, patch: &Value) {
    match (base.as_object_mut(), patch.as_object()) {
        (Some(base_obj), Some(patch_obj)) => {
            for (key, value) in patch_obj {
                base_obj.insert(key.clone(), value.clone());
            }
        }
        _ => *base = patch.clone(),
    }
}

/// Borrow a row as an object or build an empty one.
pub fn object_mut(row: &mut Value) -> &mut Map<String, Value> {
    if !row.is_object() {
        *row = Value::Object(Map::new());
    }
    match row {
        Value::Object(obj) => obj,
        _ => unreachable!("row was just replaced with an object"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_table_round_trips_through_str() {
        for table in Table::ALL {
            assert_eq!(table.as_str().parse::<Table>().unwrap(), table);
        }
        assert!("budgets".parse::<Table>().is_err());
    }

    #[test]
    fn test_normalize_derives_year_month() {
        let mut row = json!({"id": "t1", "date": "2024-03-17", "amount": 12.5});
        Table::Transactions.normalize(&mut row);
        assert_eq!(row["year_month"], "2024-03");
    }

    #[test]
    fn test_normalize_skips_unparseable_dates() {
        for date in ["2024-0é-01", "é", "2024-13-01", "yesterday"] {
            let mut row = json!({"id": "t1", "date": date});
            Table::Transactions.normalize(&mut row);
            assert!(row.get("year_month").is_none(), "{}", date);
        }

        let mut row = json!({"id": "t1", "date": "2024-02-29T10:00:00Z"});
        Table::Transactions.normalize(&mut row);
        assert_eq!(row["year_month"], "2024-02");
    }

    #[test]
    fn test_normalize_coerces_flags() {
        let mut row = json!({"id": "c1", "active": 0});
        Table::Categories.normalize(&mut row);
        assert_eq!(row["active"], false);

        let mut row = json!({"id": "c2", "active": "TRUE"});
        Table::Categories.normalize(&mut row);
        assert_eq!(row["active"], true);

        let mut row = json!({"id": "c3", "active": null});
        Table::Categories.normalize(&mut row);
        assert_eq!(row["active"], true);

        let mut row = json!({"id": "s1", "checked": null});
        Table::ShoppingItems.normalize(&mut row);
        assert_eq!(row["checked"], false);
    }

    #[test]
    fn test_strip_local_only() {
        let mut row = json!({"id": "t1", "year_month": "2024-03", "pending_sync": true, "amount": 3});
        Table::Transactions.strip_local_only(&mut row);
        assert_eq!(row, json!({"id": "t1", "amount": 3}));
    }

    #[test]
    fn test_merge_json_overrides_fields() {
        let mut base = json!({"id": "a", "name": "Old", "color": "red"});
        merge_json(&mut base, &json!({"name": "New"}));
        assert_eq!(base, json!({"id": "a", "name": "New", "color": "red"}));
    }
}
