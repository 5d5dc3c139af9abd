use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{fmt, str::FromStr};

use crate::error::CollectorError;

pub type EntityId = i64;

/// Destination row: column name -> JSON value.
pub type Row = Map<String, Value>;

pub const NATURAL_KEY: &str = "sportmonks_id";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    League,
    Season,
    Team,
    Fixture,
    Event,
    Statistic,
    Lineup,
}

/// Where records of an entity type come from upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// A paginated list resource, e.g. `leagues`.
    Paged { resource: &'static str },
    /// Embedded in fixtures through an `include`, fetched in id batches.
    Embedded {
        parent: EntityType,
        include: &'static str,
        parent_flag: &'static str,
    },
}

impl EntityType {
    pub const ALL: [EntityType; 7] = [
        EntityType::League,
        EntityType::Season,
        EntityType::Team,
        EntityType::Fixture,
        EntityType::Event,
        EntityType::Statistic,
        EntityType::Lineup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::League => "league",
            EntityType::Season => "season",
            EntityType::Team => "team",
            EntityType::Fixture => "fixture",
            EntityType::Event => "event",
            EntityType::Statistic => "statistic",
            EntityType::Lineup => "lineup",
        }
    }

    pub fn table(&self) -> &'static str {
        match self {
            EntityType::League => "leagues",
            EntityType::Season => "seasons",
            EntityType::Team => "teams",
            EntityType::Fixture => "fixtures",
            EntityType::Event => "fixture_events",
            EntityType::Statistic => "fixture_statistics",
            EntityType::Lineup => "fixture_lineups",
        }
    }

    pub fn conflict_key(&self) -> &'static str {
        NATURAL_KEY
    }

    pub fn source(&self) -> Source {
        match self {
            EntityType::League => Source::Paged { resource: "leagues" },
            EntityType::Season => Source::Paged { resource: "seasons" },
            EntityType::Team => Source::Paged { resource: "teams" },
            EntityType::Fixture => Source::Paged { resource: "fixtures" },
            EntityType::Event => Source::Embedded {
                parent: EntityType::Fixture,
                include: "events",
                parent_flag: "has_events",
            },
            EntityType::Statistic => Source::Embedded {
                parent: EntityType::Fixture,
                include: "statistics",
                parent_flag: "has_statistics",
            },
            EntityType::Lineup => Source::Embedded {
                parent: EntityType::Fixture,
                include: "lineups",
                parent_flag: "has_lineups",
            },
        }
    }

    pub fn is_embedded(&self) -> bool {
        matches!(self.source(), Source::Embedded { .. })
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = CollectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        let normalized = normalized.strip_suffix('s').unwrap_or(&normalized);
        EntityType::ALL
            .into_iter()
            .find(|entity| entity.as_str() == normalized || entity.table() == s.trim())
            .ok_or_else(|| CollectorError::Config(format!("Unknown entity type '{}'", s)))
    }
}

/// Raw upstream payload for one entity. Discarded after normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedRecord {
    pub id: EntityId,
    pub payload: Value,
}

impl FetchedRecord {
    /// Records without a numeric `id` cannot be keyed and yield `None`.
    pub fn from_value(payload: Value) -> Option<Self> {
        let id = payload.get("id").and_then(Value::as_i64)?;
        Some(Self { id, payload })
    }
}

/// Destination record carrying the upstream id as its natural key.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRow {
    pub natural_key: EntityId,
    pub fields: Row,
}

impl NormalizedRow {
    pub fn new(natural_key: EntityId) -> Self {
        let mut fields = Row::new();
        fields.insert(NATURAL_KEY.to_string(), Value::from(natural_key));
        Self { natural_key, fields }
    }

    pub fn set(&mut self, column: &str, value: impl Into<Value>) -> &mut Self {
        self.fields.insert(column.to_string(), value.into());
        self
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.fields.get(column)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub has_more: bool,
    pub next_page: Option<u32>,
}

/// One page (or one batch) of upstream records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub records: Vec<FetchedRecord>,
    pub pagination: Pagination,
    /// Upstream records dropped because they had no usable `id`.
    pub rejected: u64,
}

impl Page {
    /// Page to request after `current`, or `None` when upstream is exhausted.
    pub fn next_page_after(&self, current: u32) -> Option<u32> {
        if !self.pagination.has_more {
            return None;
        }
        match self.pagination.next_page {
            Some(next) if next > current => Some(next),
            _ => Some(current + 1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entity_type_parsing() {
        assert_eq!("fixtures".parse::<EntityType>().unwrap(), EntityType::Fixture);
        assert_eq!("Event".parse::<EntityType>().unwrap(), EntityType::Event);
        assert_eq!("fixture_lineups".parse::<EntityType>().unwrap(), EntityType::Lineup);
        assert_eq!("statistics".parse::<EntityType>().unwrap(), EntityType::Statistic);
        assert!("referee".parse::<EntityType>().is_err());
    }

    #[test]
    fn test_embedded_sources_point_at_fixtures() {
        for entity in [EntityType::Event, EntityType::Statistic, EntityType::Lineup] {
            match entity.source() {
                Source::Embedded { parent, .. } => assert_eq!(parent, EntityType::Fixture),
                Source::Paged { .. } => panic!("{} should be embedded", entity),
            }
        }
        assert!(!EntityType::League.is_embedded());
    }

    #[test]
    fn test_fetched_record_requires_id() {
        assert!(FetchedRecord::from_value(json!({"name": "no id"})).is_none());
        let record = FetchedRecord::from_value(json!({"id": 42, "name": "x"})).unwrap();
        assert_eq!(record.id, 42);
    }

    #[test]
    fn test_next_page_after() {
        let page = Page {
            records: vec![],
            pagination: Pagination {
                has_more: true,
                next_page: None,
            },
            rejected: 0,
        };
        assert_eq!(page.next_page_after(3), Some(4));

        let page = Page {
            records: vec![],
            pagination: Pagination {
                has_more: true,
                next_page: Some(7),
            },
            rejected: 0,
        };
        assert_eq!(page.next_page_after(3), Some(7));

        assert_eq!(Page::default().next_page_after(3), None);
    }
}
