//! Incremental batch collector for the Sportmonks football API.
//!
//! Pages through list resources or enriches stored fixtures in id batches,
//! checkpoints progress per entity type and upserts normalized rows keyed by
//! `sportmonks_id`.

pub mod checkpoint;
pub mod client;
pub mod config;
pub mod coverage;
pub mod error;
pub mod jobs;
pub mod metrics;
pub mod normalize;
pub mod partition;
pub mod pipeline;
pub mod quality;
pub mod sink;
pub mod store;
pub mod types;

pub use checkpoint::{Checkpoint, CheckpointStore, Cursor};
pub use client::{ApiClient, PageFetcher, PageRequest};
pub use config::CollectorConfig;
pub use error::{CollectorError, Result};
pub use pipeline::{CancelFlag, Pipeline, PipelineOptions, RunState, RunSummary};
pub use sink::{BatchReport, UpsertSink};
pub use store::{Datastore, Filter, UpsertMode};
pub use types::{EntityId, EntityType, NormalizedRow};
