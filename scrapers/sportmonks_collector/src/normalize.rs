//! Sportmonks v3 payloads to destination rows.
//!
//! Each entity type has a column map of `(column, source path)`. Plain
//! sources are always emitted (null when absent). Dotted paths read from an
//! include, and are emitted only when that include is in the payload, so a
//! sync without the include never clears the column.

use serde_json::Value;
use tracing::warn;

use crate::error::{CollectorError, Result};
use crate::types::{EntityId, EntityType, FetchedRecord, NormalizedRow, Source};

type ColumnMap = &'static [(&'static str, &'static str)];

const LEAGUE_COLUMNS: ColumnMap = &[
    ("sport_id", "sport_id"),
    ("country_id", "country_id"),
    ("name", "name"),
    ("active", "active"),
    ("short_code", "short_code"),
    ("image_path", "image_path"),
    ("type", "type"),
    ("sub_type", "sub_type"),
    ("last_played_at", "last_played_at"),
    ("category", "category"),
    ("has_jerseys", "has_jerseys"),
    ("country_name", "country.name"),
];

const SEASON_COLUMNS: ColumnMap = &[
    ("sport_id", "sport_id"),
    ("league_id", "league_id"),
    ("name", "name"),
    ("finished", "finished"),
    ("pending", "pending"),
    ("is_current", "is_current"),
    ("starting_at", "starting_at"),
    ("ending_at", "ending_at"),
    ("standings_recalculated_at", "standings_recalculated_at"),
    ("games_in_current_week", "games_in_current_week"),
];

const TEAM_COLUMNS: ColumnMap = &[
    ("sport_id", "sport_id"),
    ("country_id", "country_id"),
    ("venue_id", "venue_id"),
    ("gender", "gender"),
    ("name", "name"),
    ("short_code", "short_code"),
    ("image_path", "image_path"),
    ("founded", "founded"),
    ("type", "type"),
    ("placeholder", "placeholder"),
    ("last_played_at", "last_played_at"),
    ("venue_name", "venue.name"),
];

const FIXTURE_COLUMNS: ColumnMap = &[
    ("league_id", "league_id"),
    ("season_id", "season_id"),
    ("stage_id", "stage_id"),
    ("round_id", "round_id"),
    ("venue_id", "venue_id"),
    ("state_id", "state_id"),
    ("name", "name"),
    ("starting_at", "starting_at"),
    ("result_info", "result_info"),
    ("length", "length"),
    ("has_odds", "has_odds"),
    ("status", "state.short_name"),
    ("venue_name", "venue.name"),
];

const EVENT_COLUMNS: ColumnMap = &[
    ("fixture_id", "fixture_id"),
    ("period_id", "period_id"),
    ("participant_id", "participant_id"),
    ("type_id", "type_id"),
    ("player_id", "player_id"),
    ("related_player_id", "related_player_id"),
    ("player_name", "player_name"),
    ("related_player_name", "related_player_name"),
    ("result", "result"),
    ("info", "info"),
    ("addition", "addition"),
    ("minute", "minute"),
    ("extra_minute", "extra_minute"),
    ("injured", "injured"),
    ("on_bench", "on_bench"),
    ("sort_order", "sort_order"),
];

const STATISTIC_COLUMNS: ColumnMap = &[
    ("fixture_id", "fixture_id"),
    ("type_id", "type_id"),
    ("participant_id", "participant_id"),
    ("location", "location"),
    ("value", "data.value"),
];

const LINEUP_COLUMNS: ColumnMap = &[
    ("fixture_id", "fixture_id"),
    ("team_id", "team_id"),
    ("player_id", "player_id"),
    ("player_name", "player_name"),
    ("type_id", "type_id"),
    ("position_id", "position_id"),
    ("formation_field", "formation_field"),
    ("formation_position", "formation_position"),
    ("jersey_number", "jersey_number"),
];

fn columns_for(entity: EntityType) -> ColumnMap {
    match entity {
        EntityType::League => LEAGUE_COLUMNS,
        EntityType::Season => SEASON_COLUMNS,
        EntityType::Team => TEAM_COLUMNS,
        EntityType::Fixture => FIXTURE_COLUMNS,
        EntityType::Event => EVENT_COLUMNS,
        EntityType::Statistic => STATISTIC_COLUMNS,
        EntityType::Lineup => LINEUP_COLUMNS,
    }
}

fn pluck<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(payload, |value, key| value.get(key))
}

fn present(payload: &Value, key: &str) -> bool {
    payload.get(key).is_some_and(|value| !value.is_null())
}

/// Home/away team ids from the `participants` include.
fn fixture_participants(payload: &Value, row: &mut NormalizedRow) {
    let Some(participants) = payload.get("participants").and_then(Value::as_array) else {
        return;
    };
    for location in ["home", "away"] {
        let team_id = participants
            .iter()
            .find(|p| pluck(p, "meta.location").and_then(Value::as_str) == Some(location))
            .and_then(|p| p.get("id"))
            .cloned()
            .unwrap_or(Value::Null);
        row.set(&format!("{}_team_id", location), team_id);
    }
}

/// Current home/away goals from the `scores` include.
fn fixture_scores(payload: &Value, row: &mut NormalizedRow) {
    let Some(scores) = payload.get("scores").and_then(Value::as_array) else {
        return;
    };
    for location in ["home", "away"] {
        let goals = scores
            .iter()
            .filter(|s| s.get("description").and_then(Value::as_str) == Some("CURRENT"))
            .find(|s| pluck(s, "score.participant").and_then(Value::as_str) == Some(location))
            .and_then(|s| pluck(s, "score.goals"))
            .cloned()
            .unwrap_or(Value::Null);
        row.set(&format!("{}_score", location), goals);
    }
}

/// Maps one fetched record to its destination row.
pub fn normalize(entity: EntityType, record: &FetchedRecord) -> Result<NormalizedRow> {
    let payload = &record.payload;
    if !payload.is_object() {
        return Err(CollectorError::Normalize {
            entity: entity.to_string(),
            message: format!("record {} is not a JSON object", record.id),
        });
    }

    let mut row = NormalizedRow::new(record.id);
    for (column, path) in columns_for(entity) {
        match path.split_once('.') {
            Some((include, _)) if !present(payload, include) => {}
            _ => {
                row.set(column, pluck(payload, path).cloned().unwrap_or(Value::Null));
            }
        }
    }

    if entity == EntityType::Fixture {
        fixture_participants(payload, &mut row);
        fixture_scores(payload, &mut row);
    }

    Ok(row)
}

/// Rows that normalized, plus how many records did not.
#[derive(Debug, Default)]
pub struct NormalizedBatch {
    pub rows: Vec<NormalizedRow>,
    pub errored: u64,
}

pub fn normalize_all(entity: EntityType, records: &[FetchedRecord]) -> NormalizedBatch {
    let mut batch = NormalizedBatch::default();
    for record in records {
        match normalize(entity, record) {
            Ok(row) => batch.rows.push(row),
            Err(e) => {
                warn!("{}", e);
                batch.errored += 1;
            }
        }
    }
    batch
}

/// Child rows pulled out of parent records, and the parent flags to set.
#[derive(Debug, Default)]
pub struct EmbeddedBatch {
    pub rows: Vec<NormalizedRow>,
    /// Parent id and whether it had any children.
    pub flags: Vec<(EntityId, bool)>,
    pub returned_parents: Vec<EntityId>,
    pub errored: u64,
}

/// Extracts the `entity` include from each parent (fixture) record.
///
/// Children inherit `fixture_id` from their parent when they lack one. Each
/// parent gets a flag (`has_events` etc.) saying whether it had any children.
pub fn extract_embedded(entity: EntityType, parents: &[FetchedRecord]) -> Result<EmbeddedBatch> {
    let Source::Embedded { include, .. } = entity.source() else {
        return Err(CollectorError::Normalize {
            entity: entity.to_string(),
            message: "entity is not embedded in a parent resource".to_string(),
        });
    };

    let mut batch = EmbeddedBatch::default();
    for parent in parents {
        batch.returned_parents.push(parent.id);

        let children = match parent.payload.get(include) {
            Some(Value::Array(children)) => children.as_slice(),
            None | Some(Value::Null) => &[],
            Some(_) => {
                warn!("Fixture {} has a malformed '{}' include", parent.id, include);
                batch.errored += 1;
                continue;
            }
        };

        for child in children {
            let mut child = child.clone();
            if let Some(object) = child.as_object_mut() {
                if !object.get("fixture_id").is_some_and(|v| !v.is_null()) {
                    object.insert("fixture_id".to_string(), Value::from(parent.id));
                }
            }
            let Some(record) = FetchedRecord::from_value(child) else {
                warn!("Skipping {} without id in fixture {}", entity, parent.id);
                batch.errored += 1;
                continue;
            };
            match normalize(entity, &record) {
                Ok(row) => batch.rows.push(row),
                Err(e) => {
                    warn!("{}", e);
                    batch.errored += 1;
                }
            }
        }

        batch.flags.push((parent.id, !children.is_empty()));
    }

    Ok(batch)
}
