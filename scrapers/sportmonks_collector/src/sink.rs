use serde::Serialize;
use std::{collections::HashMap, ops::AddAssign};
use tracing::{debug, warn};

use crate::error::Result;
use crate::store::{Datastore, RowOutcome, UpsertMode};
use crate::types::{NormalizedRow, NATURAL_KEY};

/// Counts for one batch (or, summed, for a run).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub inserted: u64,
    pub updated: u64,
    pub skipped_existing: u64,
    pub errored: u64,
}

impl BatchReport {
    pub fn saved(&self) -> u64 {
        self.inserted + self.updated
    }

    pub fn total(&self) -> u64 {
        self.saved() + self.skipped_existing + self.errored
    }

    pub fn record(&mut self, outcome: &RowOutcome) {
        match outcome {
            RowOutcome::Inserted => self.inserted += 1,
            RowOutcome::Updated => self.updated += 1,
            RowOutcome::Unchanged => self.skipped_existing += 1,
            RowOutcome::Failed(_) => self.errored += 1,
        }
    }
}

impl AddAssign for BatchReport {
    fn add_assign(&mut self, other: Self) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.skipped_existing += other.skipped_existing;
        self.errored += other.errored;
    }
}

/// Keeps the last occurrence of each natural key, in first-seen order.
pub fn dedup_by_key(rows: Vec<NormalizedRow>) -> Vec<NormalizedRow> {
    let mut positions: HashMap<i64, usize> = HashMap::with_capacity(rows.len());
    let mut unique: Vec<NormalizedRow> = Vec::with_capacity(rows.len());
    for row in rows {
        match positions.get(&row.natural_key) {
            Some(&index) => unique[index] = row,
            None => {
                positions.insert(row.natural_key, unique.len());
                unique.push(row);
            }
        }
    }
    unique
}

/// Writes normalized rows to a datastore and tallies the outcomes.
pub struct UpsertSink<'a, D> {
    store: &'a D,
    mode: UpsertMode,
}

impl<'a, D: Datastore> UpsertSink<'a, D> {
    pub fn new(store: &'a D, mode: UpsertMode) -> Self {
        Self { store, mode }
    }

    pub fn store(&self) -> &'a D {
        self.store
    }

    /// Upserts `rows` into `table`. Row-level failures are counted in the
    /// report; an `Err` means the datastore rejected the whole batch.
    pub async fn write(&self, table: &str, rows: Vec<NormalizedRow>) -> Result<BatchReport> {
        let mut report = BatchReport::default();
        if rows.is_empty() {
            return Ok(report);
        }

        let before = rows.len();
        let rows = dedup_by_key(rows);
        if rows.len() < before {
            debug!("Collapsed {} duplicate rows for {}", before - rows.len(), table);
        }

        let outcomes = self.store.upsert(table, &rows, NATURAL_KEY, self.mode).await?;
        for (row, outcome) in rows.iter().zip(&outcomes) {
            if let RowOutcome::Failed(reason) = outcome {
                warn!("Failed to upsert {} row {}: {}", table, row.natural_key, reason);
            }
            report.record(outcome);
        }
        // A store that returns fewer outcomes than rows lost the rest.
        if outcomes.len() < rows.len() {
            report.errored += (rows.len() - outcomes.len()) as u64;
        }

        debug!(
            "{}: {} inserted, {} updated, {} unchanged, {} errored",
            table, report.inserted, report.updated, report.skipped_existing, report.errored
        );
        Ok(report)
    }
}
