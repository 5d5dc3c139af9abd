//! Data-quality audit over the stored tables: required columns must be
//! non-null and foreign keys must point at stored parents. Uniqueness is
//! already enforced by the `sportmonks_id` primary key.

use serde::Serialize;
use std::fmt;
use tracing::{info, warn};

use crate::coverage::coverage_percentage;
use crate::error::Result;
use crate::store::{Datastore, Filter};
use crate::types::{EntityType, NATURAL_KEY};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    RequiredField,
    ReferentialIntegrity,
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckKind::RequiredField => f.write_str("required_field"),
            CheckKind::ReferentialIntegrity => f.write_str("referential_integrity"),
        }
    }
}

/// Columns one table must fill, and the foreign keys it must honor.
#[derive(Debug, Clone, Copy)]
pub struct QualityRule {
    pub entity: EntityType,
    pub required: &'static [&'static str],
    /// `(foreign key column, referenced entity)`; the reference is always
    /// the parent's `sportmonks_id`.
    pub references: &'static [(&'static str, EntityType)],
}

pub const QUALITY_RULES: &[QualityRule] = &[
    QualityRule {
        entity: EntityType::League,
        required: &["name"],
        references: &[],
    },
    QualityRule {
        entity: EntityType::Season,
        required: &["name", "league_id"],
        references: &[("league_id", EntityType::League)],
    },
    QualityRule {
        entity: EntityType::Team,
        required: &["name"],
        references: &[],
    },
    QualityRule {
        entity: EntityType::Fixture,
        required: &["league_id", "season_id", "starting_at"],
        references: &[
            ("league_id", EntityType::League),
            ("season_id", EntityType::Season),
            ("home_team_id", EntityType::Team),
            ("away_team_id", EntityType::Team),
        ],
    },
    QualityRule {
        entity: EntityType::Event,
        required: &["fixture_id", "type_id"],
        references: &[("fixture_id", EntityType::Fixture)],
    },
    QualityRule {
        entity: EntityType::Statistic,
        required: &["fixture_id", "type_id"],
        references: &[("fixture_id", EntityType::Fixture)],
    },
    QualityRule {
        entity: EntityType::Lineup,
        required: &["fixture_id", "player_id"],
        references: &[("fixture_id", EntityType::Fixture)],
    },
];

pub fn rule_for(entity: EntityType) -> Option<&'static QualityRule> {
    QUALITY_RULES.iter().find(|rule| rule.entity == entity)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityCheck {
    pub table: String,
    pub kind: CheckKind,
    /// The column checked, or `column -> table` for references.
    pub check: String,
    /// Rows violating the check.
    pub affected: u64,
    pub total: u64,
    pub passed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QualityReport {
    pub checks: Vec<QualityCheck>,
}

impl QualityReport {
    pub fn passed(&self) -> usize {
        self.checks.iter().filter(|check| check.passed).count()
    }

    pub fn failed(&self) -> usize {
        self.checks.len() - self.passed()
    }

    /// Share of passing checks; an empty report scores 100.
    pub fn score(&self) -> f64 {
        if self.checks.is_empty() {
            100.0
        } else {
            coverage_percentage(self.passed() as u64, self.checks.len() as u64)
        }
    }

    pub fn log(&self) {
        for check in self.checks.iter().filter(|check| !check.passed) {
            warn!(
                "{} {} {}: {} of {} rows",
                check.table, check.kind, check.check, check.affected, check.total
            );
        }
        info!(
            "Quality: {}/{} checks passed ({:.1}%)",
            self.passed(),
            self.checks.len(),
            self.score()
        );
    }
}

pub struct QualityAuditor<'a, D> {
    store: &'a D,
}

impl<'a, D: Datastore> QualityAuditor<'a, D> {
    pub fn new(store: &'a D) -> Self {
        Self { store }
    }

    pub async fn check_rule(&self, rule: &QualityRule) -> Result<Vec<QualityCheck>> {
        let table = rule.entity.table();
        let total = self.store.count(table, &Filter::new()).await?;
        let mut checks = Vec::with_capacity(rule.required.len() + rule.references.len());

        for column in rule.required {
            let affected = self.store.count(table, &Filter::new().is_null(column)).await?;
            checks.push(QualityCheck {
                table: table.to_string(),
                kind: CheckKind::RequiredField,
                check: column.to_string(),
                affected,
                total,
                passed: affected == 0,
            });
        }

        for (column, parent) in rule.references {
            let affected = self
                .store
                .count_orphans(table, column, parent.table(), NATURAL_KEY)
                .await?;
            checks.push(QualityCheck {
                table: table.to_string(),
                kind: CheckKind::ReferentialIntegrity,
                check: format!("{} -> {}", column, parent.table()),
                affected,
                total,
                passed: affected == 0,
            });
        }
        Ok(checks)
    }

    /// Runs the rules for `entities`, or every rule when empty.
    pub async fn audit(&self, entities: &[EntityType]) -> Result<QualityReport> {
        let mut report = QualityReport::default();
        for rule in QUALITY_RULES {
            if entities.is_empty() || entities.contains(&rule.entity) {
                report.checks.extend(self.check_rule(rule).await?);
            }
        }
        Ok(report)
    }
}
