use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgPool, types::Json, Row as _};
use std::{
    collections::HashMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Mutex,
};
use tokio::{fs, io::AsyncWriteExt};
use tracing::{debug, warn};

use crate::error::{CollectorError, Result};
use crate::types::{EntityId, EntityType};

/// Resume position within one entity type's sweep.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Cursor {
    /// Next page to request.
    Page(u32),
    /// Highest id whose batch has been committed. Id lists are processed in
    /// ascending order, so everything `<=` this is done.
    AfterId(EntityId),
}

/// Builds a checkpoint scope from the parts that select a sweep's records.
/// Anything outside `[A-Za-z0-9_-]` becomes `-` so the scope is safe in a
/// file name. No parts gives the empty (unfiltered) scope.
pub fn scope_of<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    parts
        .into_iter()
        .map(|part| {
            part.as_ref()
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '-' })
                .collect::<String>()
        })
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(".")
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub entity_type: EntityType,
    /// Which sweep of the entity type this is, see [`scope_of`]. Runs with
    /// different filters never share a cursor.
    #[serde(default)]
    pub scope: String,
    pub cursor: Cursor,
    /// Set once a sweep finishes; the next run then starts over.
    #[serde(default)]
    pub completed: bool,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(entity_type: EntityType, scope: &str, cursor: Cursor) -> Self {
        Self {
            entity_type,
            scope: scope.to_string(),
            cursor,
            completed: false,
            updated_at: Utc::now(),
        }
    }

    pub fn finished(entity_type: EntityType, scope: &str, cursor: Cursor) -> Self {
        Self {
            completed: true,
            ..Self::new(entity_type, scope, cursor)
        }
    }

    /// Cursor to resume from, or `None` if the last sweep completed.
    pub fn resume_cursor(&self) -> Option<Cursor> {
        (!self.completed).then_some(self.cursor)
    }
}

#[allow(async_fn_in_trait)]
pub trait CheckpointStore {
    async fn load(&self, entity_type: EntityType, scope: &str) -> Result<Option<Checkpoint>>;

    /// Every scope's checkpoint for the entity type.
    async fn list(&self, entity_type: EntityType) -> Result<Vec<Checkpoint>>;

    /// Overwrites any previous checkpoint for the same entity type and scope.
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()>;

    async fn clear(&self, entity_type: EntityType, scope: &str) -> Result<()>;
}

fn checkpoint_error(action: &str, entity_type: EntityType, err: impl std::fmt::Display) -> CollectorError {
    CollectorError::Checkpoint(format!("failed to {} checkpoint for {}: {}", action, entity_type, err))
}

/// One JSON file per entity type and scope, replaced atomically via rename.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, entity_type: EntityType, scope: &str) -> PathBuf {
        if scope.is_empty() {
            self.dir.join(format!("{}.json", entity_type))
        } else {
            self.dir.join(format!("{}.{}.json", entity_type, scope_of([scope])))
        }
    }
}

impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, entity_type: EntityType, scope: &str) -> Result<Option<Checkpoint>> {
        let path = self.path_for(entity_type, scope);
        let contents = match fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(checkpoint_error("read", entity_type, e)),
        };

        match serde_json::from_str::<Checkpoint>(&contents) {
            Ok(checkpoint) if checkpoint.entity_type == entity_type && checkpoint.scope == scope => {
                Ok(Some(checkpoint))
            }
            Ok(checkpoint) => {
                warn!(
                    "Checkpoint file {} belongs to {} scope {:?}, ignoring",
                    path.display(),
                    checkpoint.entity_type,
                    checkpoint.scope
                );
                Ok(None)
            }
            Err(e) => {
                // Upserts are idempotent, so a fresh sweep is always safe.
                warn!("Unreadable checkpoint {}, starting fresh: {}", path.display(), e);
                Ok(None)
            }
        }
    }

    async fn list(&self, entity_type: EntityType) -> Result<Vec<Checkpoint>> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(checkpoint_error("list", entity_type, e)),
        };

        let prefix = format!("{}.", entity_type);
        let mut checkpoints = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| checkpoint_error("list", entity_type, e))?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(&prefix) || !name.ends_with(".json") {
                continue;
            }
            let Ok(contents) = fs::read_to_string(entry.path()).await else {
                continue;
            };
            match serde_json::from_str::<Checkpoint>(&contents) {
                Ok(checkpoint) if checkpoint.entity_type == entity_type => checkpoints.push(checkpoint),
                Ok(_) => {}
                Err(e) => warn!("Unreadable checkpoint {}: {}", entry.path().display(), e),
            }
        }
        checkpoints.sort_by(|a, b| a.scope.cmp(&b.scope));
        Ok(checkpoints)
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let entity_type = checkpoint.entity_type;
        let path = self.path_for(entity_type, &checkpoint.scope);
        let tmp = path.with_extension("json.tmp");

        let contents =
            serde_json::to_string_pretty(checkpoint).map_err(|e| checkpoint_error("encode", entity_type, e))?;
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| checkpoint_error("create directory for", entity_type, e))?;

        // The new contents must be on disk before the rename makes them visible.
        let mut file = fs::File::create(&tmp)
            .await
            .map_err(|e| checkpoint_error("write", entity_type, e))?;
        file.write_all(contents.as_bytes())
            .await
            .map_err(|e| checkpoint_error("write", entity_type, e))?;
        file.sync_all()
            .await
            .map_err(|e| checkpoint_error("sync", entity_type, e))?;
        drop(file);

        fs::rename(&tmp, &path)
            .await
            .map_err(|e| checkpoint_error("replace", entity_type, e))?;

        debug!(
            "Saved checkpoint {:?} for {} scope {:?}",
            checkpoint.cursor, entity_type, checkpoint.scope
        );
        Ok(())
    }

    async fn clear(&self, entity_type: EntityType, scope: &str) -> Result<()> {
        match fs::remove_file(self.path_for(entity_type, scope)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(checkpoint_error("clear", entity_type, e)),
        }
    }
}

/// Checkpoints in the `collector_checkpoints` table.
#[derive(Clone)]
pub struct PgCheckpointStore {
    pool: PgPool,
}

impl PgCheckpointStore {
    pub async fn new(pool: PgPool) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS collector_checkpoints (
                entity_type TEXT NOT NULL,
                scope TEXT NOT NULL DEFAULT '',
                cursor JSONB NOT NULL,
                completed BOOLEAN NOT NULL DEFAULT FALSE,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (entity_type, scope)
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(|e| CollectorError::Checkpoint(format!("failed to create checkpoint table: {}", e)))?;

        Ok(Self { pool })
    }
}

fn decode_checkpoint(entity_type: EntityType, record: &sqlx::postgres::PgRow) -> Result<Checkpoint> {
    let decode = |e: sqlx::Error| checkpoint_error("decode", entity_type, e);
    let Json(cursor): Json<Cursor> = record.try_get("cursor").map_err(decode)?;
    Ok(Checkpoint {
        entity_type,
        scope: record.try_get("scope").map_err(decode)?,
        cursor,
        completed: record.try_get("completed").map_err(decode)?,
        updated_at: record.try_get("updated_at").map_err(decode)?,
    })
}

impl CheckpointStore for PgCheckpointStore {
    async fn load(&self, entity_type: EntityType, scope: &str) -> Result<Option<Checkpoint>> {
        let record = sqlx::query(
            "SELECT scope, cursor, completed, updated_at FROM collector_checkpoints \
             WHERE entity_type = $1 AND scope = $2",
        )
        .bind(entity_type.as_str())
        .bind(scope)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| checkpoint_error("load", entity_type, e))?;

        record.map(|record| decode_checkpoint(entity_type, &record)).transpose()
    }

    async fn list(&self, entity_type: EntityType) -> Result<Vec<Checkpoint>> {
        let records = sqlx::query(
            "SELECT scope, cursor, completed, updated_at FROM collector_checkpoints \
             WHERE entity_type = $1 ORDER BY scope",
        )
        .bind(entity_type.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| checkpoint_error("list", entity_type, e))?;

        records
            .iter()
            .map(|record| decode_checkpoint(entity_type, record))
            .collect()
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO collector_checkpoints (entity_type, scope, cursor, completed, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (entity_type, scope) DO UPDATE SET
                cursor = EXCLUDED.cursor,
                completed = EXCLUDED.completed,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(checkpoint.entity_type.as_str())
        .bind(&checkpoint.scope)
        .bind(Json(checkpoint.cursor))
        .bind(checkpoint.completed)
        .bind(checkpoint.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| checkpoint_error("save", checkpoint.entity_type, e))?;
        Ok(())
    }

    async fn clear(&self, entity_type: EntityType, scope: &str) -> Result<()> {
        sqlx::query("DELETE FROM collector_checkpoints WHERE entity_type = $1 AND scope = $2")
            .bind(entity_type.as_str())
            .bind(scope)
            .execute(&self.pool)
            .await
            .map_err(|e| checkpoint_error("clear", entity_type, e))?;
        Ok(())
    }
}

/// Process-local checkpoints, for dry runs.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: Mutex<HashMap<(EntityType, String), Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(EntityType, String), Checkpoint>> {
        self.checkpoints.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, entity_type: EntityType, scope: &str) -> Result<Option<Checkpoint>> {
        Ok(self.lock().get(&(entity_type, scope.to_string())).cloned())
    }

    async fn list(&self, entity_type: EntityType) -> Result<Vec<Checkpoint>> {
        let mut checkpoints: Vec<Checkpoint> = self
            .lock()
            .values()
            .filter(|checkpoint| checkpoint.entity_type == entity_type)
            .cloned()
            .collect();
        checkpoints.sort_by(|a, b| a.scope.cmp(&b.scope));
        Ok(checkpoints)
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.lock().insert(
            (checkpoint.entity_type, checkpoint.scope.clone()),
            checkpoint.clone(),
        );
        Ok(())
    }

    async fn clear(&self, entity_type: EntityType, scope: &str) -> Result<()> {
        self.lock().remove(&(entity_type, scope.to_string()));
        Ok(())
    }
}

/// Either backend, picked from configuration at startup.
pub enum AnyCheckpointStore {
    File(FileCheckpointStore),
    Postgres(PgCheckpointStore),
}

impl CheckpointStore for AnyCheckpointStore {
    async fn load(&self, entity_type: EntityType, scope: &str) -> Result<Option<Checkpoint>> {
        match self {
            Self::File(store) => store.load(entity_type, scope).await,
            Self::Postgres(store) => store.load(entity_type, scope).await,
        }
    }

    async fn list(&self, entity_type: EntityType) -> Result<Vec<Checkpoint>> {
        match self {
            Self::File(store) => store.list(entity_type).await,
            Self::Postgres(store) => store.list(entity_type).await,
        }
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        match self {
            Self::File(store) => store.save(checkpoint).await,
            Self::Postgres(store) => store.save(checkpoint).await,
        }
    }

    async fn clear(&self, entity_type: EntityType, scope: &str) -> Result<()> {
        match self {
            Self::File(store) => store.clear(entity_type, scope).await,
            Self::Postgres(store) => store.clear(entity_type, scope).await,
        }
    }
}
