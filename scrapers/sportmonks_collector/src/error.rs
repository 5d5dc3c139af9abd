use std::time::Duration;

// Error taxonomy for a collection run. Only `Auth` and `Checkpoint` end a run;
// everything else is contained at batch (or row) granularity.
#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error("Authentication rejected by upstream (HTTP {status}): {message}")]
    Auth { status: u16, message: String },
    #[error("Rate limited by upstream after {waits} waits")]
    RateLimited { waits: u32, last_backoff: Duration },
    #[error("Transient upstream failure after {attempts} attempts: {message}")]
    Transient { attempts: u32, message: String },
    #[error("Upstream rejected request (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("Failed to decode upstream response: {0}")]
    Decode(String),
    #[error("Failed to normalize {entity} record: {message}")]
    Normalize { entity: String, message: String },
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Invalid SQL identifier: {0}")]
    InvalidIdentifier(String),
}

impl CollectorError {
    /// Errors that terminate the whole run rather than a single batch.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth { .. } | Self::Checkpoint(_))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::RateLimited { .. })
    }
}

pub type Result<T, E = CollectorError> = std::result::Result<T, E>;
