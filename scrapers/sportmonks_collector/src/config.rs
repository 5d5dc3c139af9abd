use nonzero_ext::nonzero;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, env, num::NonZeroUsize, path::PathBuf, str::FromStr, time::Duration};
use tracing::warn;

use crate::error::{CollectorError, Result};
use crate::store::UpsertMode;
use crate::types::EntityType;

const DEFAULT_BATCH_SIZE: NonZeroUsize = nonzero!(25usize);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiConfig {
    pub base_url: String,
    pub api_token: String,
    pub user_agent: String,
    pub request_timeout_secs: u64,
    pub per_page: u32,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.sportmonks.com/v3/football".to_string(),
            api_token: String::new(),
            user_agent: "Mozilla/5.0 (compatible; SportmonksCollector/1.0)".to_string(),
            request_timeout_secs: 30,
            per_page: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimits {
    pub requests_per_second: u32,
    /// Sleep after an HTTP 429 when the response carries no `Retry-After`.
    pub rate_limit_backoff_ms: u64,
    /// `None` keeps waiting on 429 for as long as upstream throttles.
    pub rate_limit_max_waits: Option<u32>,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            requests_per_second: 5,
            rate_limit_backoff_ms: 60_000,
            rate_limit_max_waits: None,
            max_retries: 3,
            retry_delay_ms: 1_000,
        }
    }
}

impl RateLimits {
    pub fn rate_limit_backoff(&self) -> Duration {
        Duration::from_millis(self.rate_limit_backoff_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchConfig {
    pub default_size: usize,
    pub per_entity: HashMap<EntityType, usize>,
    pub upsert_mode: UpsertMode,
    pub max_consecutive_failures: u32,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            default_size: DEFAULT_BATCH_SIZE.get(),
            per_entity: HashMap::new(),
            upsert_mode: UpsertMode::Overwrite,
            max_consecutive_failures: 3,
        }
    }
}

impl BatchConfig {
    pub fn batch_size(&self, entity: EntityType) -> NonZeroUsize {
        let size = self
            .per_entity
            .get(&entity)
            .copied()
            .unwrap_or(self.default_size);
        NonZeroUsize::new(size).unwrap_or(DEFAULT_BATCH_SIZE)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointBackend {
    File,
    Postgres,
}

impl FromStr for CheckpointBackend {
    type Err = CollectorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(Self::File),
            "postgres" | "pg" => Ok(Self::Postgres),
            other => Err(CollectorError::Config(format!(
                "Unknown checkpoint backend '{}', expected 'file' or 'postgres'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckpointConfig {
    pub backend: CheckpointBackend,
    pub dir: PathBuf,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            backend: CheckpointBackend::File,
            dir: PathBuf::from("checkpoints"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CollectorConfig {
    pub api: ApiConfig,
    pub rate_limits: RateLimits,
    pub database: DatabaseConfig,
    pub batch: BatchConfig,
    pub checkpoint: CheckpointConfig,
    pub show_progress: bool,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            rate_limits: RateLimits::default(),
            database: DatabaseConfig::default(),
            batch: BatchConfig::default(),
            checkpoint: CheckpointConfig::default(),
            show_progress: true,
        }
    }
}

fn parse_var<T: FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring invalid value for {}: {:?}", name, raw);
            None
        }
    }
}

impl CollectorConfig {
    /// Defaults overlaid with whatever the environment sets. Invalid values are
    /// logged and ignored; `validate` decides whether the result is usable.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(token) = env::var("SPORTMONKS_API_TOKEN").or_else(|_| env::var("SPORTMONKS_API_KEY")) {
            config.api.api_token = token;
        }
        if let Ok(base_url) = env::var("SPORTMONKS_BASE_URL") {
            config.api.base_url = base_url.trim_end_matches('/').to_string();
        }
        if let Ok(user_agent) = env::var("SCRAPER_USER_AGENT") {
            config.api.user_agent = user_agent;
        }
        if let Some(timeout) = parse_var("REQUEST_TIMEOUT_SECS") {
            config.api.request_timeout_secs = timeout;
        }
        if let Some(per_page) = parse_var("PER_PAGE") {
            config.api.per_page = per_page;
        }

        if let Some(rps) = parse_var("RATE_LIMIT_RPS") {
            config.rate_limits.requests_per_second = rps;
        }
        if let Some(secs) = parse_var::<u64>("RATE_LIMIT_BACKOFF_SECS") {
            config.rate_limits.rate_limit_backoff_ms = secs.saturating_mul(1_000);
        }
        if let Some(waits) = parse_var("RATE_LIMIT_MAX_WAITS") {
            config.rate_limits.rate_limit_max_waits = Some(waits);
        }
        if let Some(retries) = parse_var("MAX_RETRIES") {
            config.rate_limits.max_retries = retries;
        }
        if let Some(delay) = parse_var("RETRY_DELAY_MS") {
            config.rate_limits.retry_delay_ms = delay;
        }

        if let Ok(url) = env::var("DATABASE_URL") {
            config.database.url = Some(url);
        }
        if let Some(max) = parse_var("DATABASE_MAX_CONNECTIONS") {
            config.database.max_connections = max;
        }

        if let Some(size) = parse_var("BATCH_SIZE") {
            config.batch.default_size = size;
        }
        for entity in EntityType::ALL {
            let name = format!("BATCH_SIZE_{}", entity.as_str().to_ascii_uppercase());
            if let Some(size) = parse_var(&name) {
                config.batch.per_entity.insert(entity, size);
            }
        }
        if let Some(mode) = parse_var("UPSERT_MODE") {
            config.batch.upsert_mode = mode;
        }
        if let Some(max) = parse_var("MAX_CONSECUTIVE_FAILURES") {
            config.batch.max_consecutive_failures = max;
        }

        if let Some(backend) = parse_var("CHECKPOINT_BACKEND") {
            config.checkpoint.backend = backend;
        }
        if let Ok(dir) = env::var("CHECKPOINT_DIR") {
            config.checkpoint.dir = PathBuf::from(dir);
        }
        if let Some(show) = parse_var("SHOW_PROGRESS") {
            config.show_progress = show;
        }

        config
    }

    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.api.api_token.trim().is_empty() {
            problems.push("SPORTMONKS_API_TOKEN is not set".to_string());
        }
        if self.rate_limits.requests_per_second == 0 {
            problems.push("RATE_LIMIT_RPS must be positive".to_string());
        }
        if self.api.per_page == 0 {
            problems.push("PER_PAGE must be positive".to_string());
        }
        if self.batch.default_size == 0 || self.batch.per_entity.values().any(|size| *size == 0) {
            problems.push("batch sizes must be positive".to_string());
        }
        if self.checkpoint.backend == CheckpointBackend::Postgres && self.database.url.is_none() {
            problems.push("CHECKPOINT_BACKEND=postgres requires DATABASE_URL".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(CollectorError::Config(problems.join("; ")))
        }
    }
}
