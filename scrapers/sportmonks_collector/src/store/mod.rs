//! Destination datastore abstraction.
//!
//! The collector needs few operations from its destination: filtered reads,
//! keyed upserts, update-only flag writes and counts. `PgDatastore` implements them over sqlx,
//! `MemoryDatastore` over in-process maps for dry runs and tests.

pub mod memory;
pub mod postgres;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{cmp::Ordering, fmt, str::FromStr, sync::OnceLock};

use crate::error::{CollectorError, Result};
use crate::types::{EntityId, NormalizedRow, Row};

pub use memory::MemoryDatastore;
pub use postgres::PgDatastore;

/// How an upsert treats nulls in the incoming row.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UpsertMode {
    /// Every column present in the row is written, nulls included.
    #[default]
    Overwrite,
    /// An incoming null never replaces a stored non-null value.
    PreserveNulls,
}

impl FromStr for UpsertMode {
    type Err = CollectorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "overwrite" => Ok(Self::Overwrite),
            "preserve_nulls" | "preserve" => Ok(Self::PreserveNulls),
            other => Err(CollectorError::Config(format!(
                "Unknown upsert mode '{}', expected 'overwrite' or 'preserve_nulls'",
                other
            ))),
        }
    }
}

/// Per-row result of an upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowOutcome {
    Inserted,
    Updated,
    /// Key already present with identical values.
    Unchanged,
    Failed(String),
}

impl fmt::Display for RowOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowOutcome::Inserted => f.write_str("inserted"),
            RowOutcome::Updated => f.write_str("updated"),
            RowOutcome::Unchanged => f.write_str("unchanged"),
            RowOutcome::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(String, Value),
    IsNull(String),
    NotNull(String),
    Gt(String, Value),
}

impl Condition {
    pub fn column(&self) -> &str {
        match self {
            Condition::Eq(column, _)
            | Condition::IsNull(column)
            | Condition::NotNull(column)
            | Condition::Gt(column, _) => column,
        }
    }

    fn matches(&self, row: &Row) -> bool {
        let value = row.get(self.column()).unwrap_or(&Value::Null);
        match self {
            Condition::Eq(_, expected) => compare_values(value, expected) == Some(Ordering::Equal),
            Condition::IsNull(_) => value.is_null(),
            Condition::NotNull(_) => !value.is_null(),
            Condition::Gt(_, bound) => compare_values(value, bound) == Some(Ordering::Greater),
        }
    }
}

/// Conjunction of conditions with optional ordering and limit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub conditions: Vec<Condition>,
    pub order_by: Option<String>,
    pub limit: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::Eq(column.to_string(), value.into()));
        self
    }

    pub fn is_null(mut self, column: &str) -> Self {
        self.conditions.push(Condition::IsNull(column.to_string()));
        self
    }

    pub fn not_null(mut self, column: &str) -> Self {
        self.conditions.push(Condition::NotNull(column.to_string()));
        self
    }

    pub fn gt(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::Gt(column.to_string(), value.into()));
        self
    }

    pub fn order_by(mut self, column: &str) -> Self {
        self.order_by = Some(column.to_string());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, row: &Row) -> bool {
        self.conditions.iter().all(|condition| condition.matches(row))
    }
}

/// Orders two JSON scalars; `None` when they are not comparable (nulls,
/// mismatched types, containers).
pub fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => Some(a.cmp(&b)),
            _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
        },
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// The destination operations the collector relies on.
#[allow(async_fn_in_trait)]
pub trait Datastore {
    async fn select(&self, table: &str, filter: &Filter) -> Result<Vec<Row>>;

    /// Upserts `rows` keyed by `conflict_key`, returning one outcome per row
    /// in input order. An `Err` means the whole batch failed.
    async fn upsert(
        &self,
        table: &str,
        rows: &[NormalizedRow],
        conflict_key: &str,
        mode: UpsertMode,
    ) -> Result<Vec<RowOutcome>>;

    async fn count(&self, table: &str, filter: &Filter) -> Result<u64>;

    /// Sets `column = value` on the existing rows whose `key_column` is in
    /// `keys`. Never inserts. Returns how many rows matched.
    async fn set_flag(
        &self,
        table: &str,
        key_column: &str,
        keys: &[EntityId],
        column: &str,
        value: bool,
    ) -> Result<u64>;

    /// Rows of `child` whose non-null `foreign_key` has no `parent` row with
    /// that `parent_key`.
    async fn count_orphans(&self, child: &str, foreign_key: &str, parent: &str, parent_key: &str) -> Result<u64>;
}

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern is valid"))
}

/// Validates and double-quotes a table or column name. A single
/// `schema.table` prefix is allowed.
pub fn quote_identifier(name: &str) -> Result<String> {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.is_empty() || parts.len() > 2 || !parts.iter().all(|part| identifier_pattern().is_match(part)) {
        return Err(CollectorError::InvalidIdentifier(name.to_string()));
    }
    Ok(parts
        .iter()
        .map(|part| format!("\"{}\"", part))
        .collect::<Vec<_>>()
        .join("."))
}

/// Applies `incoming` on top of `existing` under `mode`. Columns absent from
/// `incoming` keep their stored values.
pub fn merge_row(existing: Option<&Row>, incoming: &Row, mode: UpsertMode) -> (Row, RowOutcome) {
    let Some(existing) = existing else {
        return (incoming.clone(), RowOutcome::Inserted);
    };

    let mut merged = existing.clone();
    for (column, value) in incoming {
        if mode == UpsertMode::PreserveNulls && value.is_null() {
            continue;
        }
        merged.insert(column.clone(), value.clone());
    }

    let outcome = if &merged == existing {
        RowOutcome::Unchanged
    } else {
        RowOutcome::Updated
    };
    (merged, outcome)
}
