use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Mutex, MutexGuard},
};

use serde_json::Value;

use super::{compare_values, merge_row, quote_identifier, Datastore, Filter, RowOutcome, UpsertMode};
use crate::error::Result;
use crate::types::{EntityId, NormalizedRow, Row};

type Table = BTreeMap<String, Row>;

/// Process-local datastore with the same upsert semantics as Postgres.
/// Rows are keyed by the JSON text of their conflict column.
#[derive(Debug, Default)]
pub struct MemoryDatastore {
    tables: Mutex<HashMap<String, Table>>,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads rows as-is, replacing any stored row with the same key.
    pub fn seed(&self, table: &str, key_column: &str, rows: impl IntoIterator<Item = Row>) {
        let mut tables = self.lock();
        let stored = tables.entry(table.to_string()).or_default();
        for row in rows {
            let key = row.get(key_column).unwrap_or(&Value::Null).to_string();
            stored.insert(key, row);
        }
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.lock()
            .get(table)
            .map(|stored| stored.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, table: &str, key: impl Into<Value>) -> Option<Row> {
        self.lock().get(table)?.get(&key.into().to_string()).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Table>> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn filtered(&self, table: &str, filter: &Filter) -> Result<Vec<Row>> {
        quote_identifier(table)?;
        for condition in &filter.conditions {
            quote_identifier(condition.column())?;
        }

        let tables = self.lock();
        let mut rows: Vec<Row> = tables
            .get(table)
            .map(|stored| stored.values().filter(|row| filter.matches(row)).cloned().collect())
            .unwrap_or_default();
        drop(tables);

        if let Some(column) = &filter.order_by {
            quote_identifier(column)?;
            rows.sort_by(|a, b| {
                let left = a.get(column).unwrap_or(&Value::Null);
                let right = b.get(column).unwrap_or(&Value::Null);
                // Nulls sort last, as in Postgres ascending order.
                match (left.is_null(), right.is_null()) {
                    (true, true) => std::cmp::Ordering::Equal,
                    (true, false) => std::cmp::Ordering::Greater,
                    (false, true) => std::cmp::Ordering::Less,
                    (false, false) => compare_values(left, right).unwrap_or(std::cmp::Ordering::Equal),
                }
            });
        }
        if let Some(limit) = filter.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }
}

impl Datastore for MemoryDatastore {
    async fn select(&self, table: &str, filter: &Filter) -> Result<Vec<Row>> {
        self.filtered(table, filter)
    }

    async fn upsert(
        &self,
        table: &str,
        rows: &[NormalizedRow],
        conflict_key: &str,
        mode: UpsertMode,
    ) -> Result<Vec<RowOutcome>> {
        quote_identifier(table)?;
        quote_identifier(conflict_key)?;

        let mut tables = self.lock();
        let stored = tables.entry(table.to_string()).or_default();

        let outcomes = rows
            .iter()
            .map(|row| {
                if let Some(column) = row.fields.keys().find(|column| quote_identifier(column).is_err()) {
                    return RowOutcome::Failed(format!("invalid column name '{}'", column));
                }
                let Some(key_value) = row.fields.get(conflict_key).filter(|v| !v.is_null()) else {
                    return RowOutcome::Failed(format!("missing conflict key '{}'", conflict_key));
                };
                let key = key_value.to_string();
                let (merged, outcome) = merge_row(stored.get(&key), &row.fields, mode);
                stored.insert(key, merged);
                outcome
            })
            .collect();

        Ok(outcomes)
    }

    async fn count(&self, table: &str, filter: &Filter) -> Result<u64> {
        let unlimited = Filter {
            order_by: None,
            ..filter.clone()
        };
        let matching = self.filtered(table, &unlimited)?.len();
        Ok(match filter.limit {
            Some(limit) => matching.min(limit) as u64,
            None => matching as u64,
        })
    }

    async fn set_flag(
        &self,
        table: &str,
        key_column: &str,
        keys: &[EntityId],
        column: &str,
        value: bool,
    ) -> Result<u64> {
        quote_identifier(table)?;
        quote_identifier(key_column)?;
        quote_identifier(column)?;

        let mut tables = self.lock();
        let Some(stored) = tables.get_mut(table) else {
            return Ok(0);
        };
        let mut matched = 0;
        for key in keys {
            if let Some(row) = stored.get_mut(&Value::from(*key).to_string()) {
                row.insert(column.to_string(), Value::Bool(value));
                matched += 1;
            }
        }
        Ok(matched)
    }

    async fn count_orphans(&self, child: &str, foreign_key: &str, parent: &str, parent_key: &str) -> Result<u64> {
        for name in [child, foreign_key, parent, parent_key] {
            quote_identifier(name)?;
        }

        let tables = self.lock();
        let parent_keys: HashSet<String> = tables
            .get(parent)
            .map(|rows| {
                rows.values()
                    .filter_map(|row| row.get(parent_key).filter(|v| !v.is_null()))
                    .map(Value::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let orphans = tables
            .get(child)
            .map(|rows| {
                rows.values()
                    .filter_map(|row| row.get(foreign_key).filter(|v| !v.is_null()))
                    .filter(|fk| !parent_keys.contains(&fk.to_string()))
                    .count()
            })
            .unwrap_or(0);
        Ok(orphans as u64)
    }
}
