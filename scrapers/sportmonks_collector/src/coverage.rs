use serde::Serialize;
use std::io::Write;
use tracing::info;

use crate::error::Result;
use crate::store::{Datastore, Filter};
use crate::types::{EntityType, Source, NATURAL_KEY};

/// Share of a reference population that has a dependent attribute.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoverageStat {
    pub label: String,
    pub reference: u64,
    pub dependent: u64,
    pub percentage: f64,
}

/// `dependent / reference * 100`, or 0 for an empty reference.
pub fn coverage_percentage(dependent: u64, reference: u64) -> f64 {
    if reference == 0 {
        0.0
    } else {
        dependent as f64 / reference as f64 * 100.0
    }
}

/// Counts coverage straight from the datastore; nothing is cached between
/// calls.
pub struct CoverageAuditor<'a, D> {
    store: &'a D,
}

impl<'a, D: Datastore> CoverageAuditor<'a, D> {
    pub fn new(store: &'a D) -> Self {
        Self { store }
    }

    pub async fn measure(
        &self,
        label: &str,
        reference: (&str, &Filter),
        dependent: (&str, &Filter),
    ) -> Result<CoverageStat> {
        let reference_count = self.store.count(reference.0, reference.1).await?;
        let dependent_count = self.store.count(dependent.0, dependent.1).await?;
        Ok(CoverageStat {
            label: label.to_string(),
            reference: reference_count,
            dependent: dependent_count,
            percentage: coverage_percentage(dependent_count, reference_count),
        })
    }

    /// Events, statistics and lineups coverage over stored fixtures,
    /// optionally restricted to one league.
    pub async fn fixture_coverage(&self, league_id: Option<i64>) -> Result<Vec<CoverageStat>> {
        let fixtures = EntityType::Fixture.table();
        let base = match league_id {
            Some(id) => Filter::new().eq("league_id", id),
            None => Filter::new(),
        };

        let mut stats = Vec::new();
        for entity in [EntityType::Event, EntityType::Statistic, EntityType::Lineup] {
            let Source::Embedded { parent_flag, .. } = entity.source() else {
                continue;
            };
            let label = match league_id {
                Some(id) => format!("league {} {}", id, parent_flag),
                None => parent_flag.to_string(),
            };
            let flagged = base.clone().eq(parent_flag, true);
            stats.push(self.measure(&label, (fixtures, &base), (fixtures, &flagged)).await?);
        }
        Ok(stats)
    }

    /// `fixture_coverage` for every stored league.
    pub async fn league_report(&self) -> Result<Vec<CoverageStat>> {
        let leagues = self
            .store
            .select(EntityType::League.table(), &Filter::new().order_by(NATURAL_KEY))
            .await?;

        let mut stats = Vec::new();
        for league in leagues {
            let Some(league_id) = league.get(NATURAL_KEY).and_then(|v| v.as_i64()) else {
                continue;
            };
            stats.extend(self.fixture_coverage(Some(league_id)).await?);
        }
        info!("Computed coverage for {} stats", stats.len());
        Ok(stats)
    }
}

/// Writes `rows` (coverage stats or quality checks) as CSV with a header row.
pub fn write_csv<T: Serialize, W: Write>(rows: &[T], writer: W) -> Result<()> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    for row in rows {
        csv_writer.serialize(row)?;
    }
    csv_writer.flush()?;
    Ok(())
}
