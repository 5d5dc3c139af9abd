use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::future::join_all;
use serde_json::{json, Value};
use sqlx::postgres::PgPool;
use std::{fs::File, num::NonZeroUsize, path::PathBuf};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sportmonks_collector::{
    checkpoint::{AnyCheckpointStore, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore, PgCheckpointStore},
    client::{ApiClient, PageRequest},
    config::{CheckpointBackend, CollectorConfig},
    coverage::{write_csv, CoverageAuditor},
    jobs::{JobLog, JobRecord, MemoryJobLog, PgJobLog},
    pipeline::{CancelFlag, Candidates, EnrichmentJob, PagedJob, Pipeline, PipelineOptions, RunSummary},
    quality::QualityAuditor,
    store::{Datastore, MemoryDatastore, PgDatastore},
    types::{EntityId, EntityType, Source},
};

#[derive(Debug, Parser)]
#[command(author, version, about = "Incremental Sportmonks football collector", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Page through list resources (leagues, seasons, teams, fixtures)
    Sync {
        /// Entity types to sync; several run concurrently
        #[arg(required = true)]
        entities: Vec<EntityType>,
        /// Override the upstream resource path (single entity only)
        #[arg(long)]
        resource: Option<String>,
        /// Includes, separated by ';'
        #[arg(long)]
        include: Option<String>,
        /// Extra query parameter as key=value, repeatable
        #[arg(long = "filter", value_name = "KEY=VALUE")]
        filters: Vec<String>,
        #[arg(long)]
        per_page: Option<u32>,
        /// Stop after this many pages
        #[arg(long)]
        max_pages: Option<u32>,
        /// Ignore any checkpoint and start from page 1
        #[arg(long)]
        restart: bool,
        /// Fetch and normalize without touching the database
        #[arg(long)]
        dry_run: bool,
    },
    /// Enrich stored fixtures with events, statistics or lineups
    Enrich {
        entity: EntityType,
        #[arg(long)]
        league_id: Option<i64>,
        #[arg(long)]
        season_id: Option<i64>,
        /// Explicit fixture ids instead of querying stored fixtures
        #[arg(long, value_delimiter = ',')]
        ids: Vec<EntityId>,
        /// Only fixtures whose flag has never been set
        #[arg(long)]
        only_missing: bool,
        #[arg(long)]
        batch_size: Option<NonZeroUsize>,
        /// Process at most this many fixtures
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        restart: bool,
        #[arg(long)]
        dry_run: bool,
    },
    /// Report fixture coverage of events, statistics and lineups
    Coverage {
        #[arg(long)]
        league_id: Option<i64>,
        /// One set of stats per stored league
        #[arg(long)]
        per_league: bool,
        /// Also write the stats to this CSV file
        #[arg(long)]
        csv: Option<PathBuf>,
    },
    /// Check required columns and foreign keys of the stored tables
    Quality {
        /// Entity types to check; all when omitted
        entities: Vec<EntityType>,
        /// Also write the checks to this CSV file
        #[arg(long)]
        csv: Option<PathBuf>,
    },
    /// Inspect or reset checkpoints
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },
}

#[derive(Debug, Subcommand)]
enum CheckpointAction {
    /// Every scope's checkpoint for the entity type
    Show { entity: EntityType },
    Reset {
        entity: EntityType,
        /// Only this scope ("" is the unfiltered sweep); every scope when omitted
        #[arg(long)]
        scope: Option<String>,
    },
}

async fn open_checkpoints(config: &CollectorConfig, pool: Option<&PgPool>) -> Result<AnyCheckpointStore> {
    Ok(match (config.checkpoint.backend, pool) {
        (CheckpointBackend::Postgres, Some(pool)) => {
            AnyCheckpointStore::Postgres(PgCheckpointStore::new(pool.clone()).await?)
        }
        (CheckpointBackend::Postgres, None) => bail!("CHECKPOINT_BACKEND=postgres requires DATABASE_URL"),
        (CheckpointBackend::File, _) => AnyCheckpointStore::File(FileCheckpointStore::new(&config.checkpoint.dir)),
    })
}

fn install_cancel_handler() -> Result<CancelFlag> {
    let cancel = CancelFlag::new();
    let handler_flag = cancel.clone();
    ctrlc::set_handler(move || {
        warn!("Interrupt received, stopping after the current batch");
        handler_flag.cancel();
    })
    .context("Failed to install Ctrl-C handler")?;
    Ok(cancel)
}

#[allow(clippy::too_many_arguments)]
fn paged_jobs(
    config: &CollectorConfig,
    entities: &[EntityType],
    resource: Option<String>,
    include: Option<String>,
    filters: &[String],
    per_page: Option<u32>,
    max_pages: Option<u32>,
    restart: bool,
) -> Result<Vec<PagedJob>> {
    if resource.is_some() && entities.len() > 1 {
        bail!("--resource can only be used with a single entity type");
    }
    let include: Vec<String> = include
        .map(|raw| raw.split([';', ',']).map(str::trim).filter(|s| !s.is_empty()).map(String::from).collect())
        .unwrap_or_default();

    let mut jobs = Vec::with_capacity(entities.len());
    for &entity in entities {
        let default_resource = match entity.source() {
            Source::Paged { resource } => resource,
            Source::Embedded { .. } => bail!("{} is embedded in fixtures, use `enrich {}`", entity, entity),
        };
        let mut request = PageRequest::new(
            resource.clone().unwrap_or_else(|| default_resource.to_string()),
            per_page.unwrap_or(config.api.per_page),
        )
        .with_include(&include);
        for filter in filters {
            let Some((key, value)) = filter.split_once('=') else {
                bail!("Invalid --filter '{}', expected key=value", filter);
            };
            request = request.with_param(key.trim(), value.trim());
        }

        jobs.push(PagedJob {
            entity_type: entity,
            request,
            max_pages,
            restart,
        });
    }
    Ok(jobs)
}

async fn run_sync<D: Datastore, C: CheckpointStore>(
    client: &ApiClient,
    store: &D,
    checkpoints: &C,
    options: PipelineOptions,
    cancel: CancelFlag,
    jobs: &[PagedJob],
) -> Vec<RunSummary> {
    let pipeline = Pipeline::new(client, store, checkpoints, options).with_cancel(cancel);
    join_all(jobs.iter().map(|job| pipeline.run_paged(job))).await
}

async fn run_enrich<D: Datastore, C: CheckpointStore>(
    client: &ApiClient,
    store: &D,
    checkpoints: &C,
    options: PipelineOptions,
    cancel: CancelFlag,
    job: &EnrichmentJob,
) -> RunSummary {
    Pipeline::new(client, store, checkpoints, options)
        .with_cancel(cancel)
        .run_enrichment(job)
        .await
}

fn sync_parameters(job: &PagedJob) -> Value {
    json!({
        "resource": job.request.resource,
        "include": job.request.include,
        "params": job.request.params,
        "per_page": job.request.per_page,
        "max_pages": job.max_pages,
        "restart": job.restart,
        "scope": job.scope(),
    })
}

fn enrich_parameters(job: &EnrichmentJob) -> Value {
    let candidates = match &job.candidates {
        Candidates::Ids(ids) => json!({ "ids": ids }),
        Candidates::Stored {
            league_id,
            season_id,
            only_missing,
        } => json!({ "league_id": league_id, "season_id": season_id, "only_missing": only_missing }),
    };
    json!({
        "candidates": candidates,
        "batch_size": job.batch_size.get(),
        "limit": job.limit,
        "restart": job.restart,
        "scope": job.scope(),
    })
}

/// Records one job per run. A failed write is logged, never fatal.
async fn record_jobs<L: JobLog>(log: &L, job_type: &str, runs: &[(RunSummary, Value)]) {
    for (summary, parameters) in runs {
        let job = JobRecord::from_summary(job_type, summary, parameters.clone());
        if let Err(e) = log.record(&job).await {
            warn!("Failed to record {} job: {}", job.job_name, e);
        }
    }
}

fn report(client: &ApiClient, summaries: &[RunSummary]) -> bool {
    for summary in summaries {
        summary.log();
    }
    client.metrics().log_summary();
    summaries.iter().any(RunSummary::is_failure)
}

async fn connect(config: &CollectorConfig) -> Result<PgDatastore> {
    PgDatastore::connect(&config.database)
        .await
        .context("Failed to connect to the database")
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = CollectorConfig::from_env();
    let options = PipelineOptions::from_config(&config);

    let failed = match cli.command {
        Commands::Sync {
            entities,
            resource,
            include,
            filters,
            per_page,
            max_pages,
            restart,
            dry_run,
        } => {
            config.validate()?;
            let jobs = paged_jobs(&config, &entities, resource, include, &filters, per_page, max_pages, restart)?;
            let client = ApiClient::new(&config)?;
            let cancel = install_cancel_handler()?;

            let summaries = if dry_run {
                info!("Dry run: nothing is written to the database");
                let summaries =
                    run_sync(&client, &MemoryDatastore::new(), &MemoryCheckpointStore::new(), options, cancel, &jobs)
                        .await;
                let runs: Vec<_> = summaries.iter().cloned().zip(jobs.iter().map(sync_parameters)).collect();
                record_jobs(&MemoryJobLog::new(), "sync", &runs).await;
                summaries
            } else {
                let store = connect(&config).await?;
                let checkpoints = open_checkpoints(&config, Some(store.pool())).await?;
                let summaries = run_sync(&client, &store, &checkpoints, options, cancel, &jobs).await;
                let runs: Vec<_> = summaries.iter().cloned().zip(jobs.iter().map(sync_parameters)).collect();
                match PgJobLog::new(store.pool().clone()).await {
                    Ok(log) => record_jobs(&log, "sync", &runs).await,
                    Err(e) => warn!("Job log unavailable: {}", e),
                }
                summaries
            };
            report(&client, &summaries)
        }
        Commands::Enrich {
            entity,
            league_id,
            season_id,
            ids,
            only_missing,
            batch_size,
            limit,
            restart,
            dry_run,
        } => {
            config.validate()?;
            if !entity.is_embedded() {
                bail!("{} is a list resource, use `sync {}`", entity, entity);
            }
            let candidates = if ids.is_empty() {
                Candidates::Stored {
                    league_id,
                    season_id,
                    only_missing,
                }
            } else {
                Candidates::Ids(ids)
            };
            let job = EnrichmentJob {
                entity_type: entity,
                candidates,
                batch_size: batch_size.unwrap_or_else(|| config.batch.batch_size(entity)),
                limit,
                restart,
            };
            let client = ApiClient::new(&config)?;
            let cancel = install_cancel_handler()?;

            let summary = if dry_run {
                info!("Dry run: nothing is written to the database");
                let summary =
                    run_enrich(&client, &MemoryDatastore::new(), &MemoryCheckpointStore::new(), options, cancel, &job)
                        .await;
                record_jobs(&MemoryJobLog::new(), "enrich", &[(summary.clone(), enrich_parameters(&job))]).await;
                summary
            } else {
                let store = connect(&config).await?;
                let checkpoints = open_checkpoints(&config, Some(store.pool())).await?;
                let summary = run_enrich(&client, &store, &checkpoints, options, cancel, &job).await;
                match PgJobLog::new(store.pool().clone()).await {
                    Ok(log) => record_jobs(&log, "enrich", &[(summary.clone(), enrich_parameters(&job))]).await,
                    Err(e) => warn!("Job log unavailable: {}", e),
                }
                summary
            };
            report(&client, &[summary])
        }
        Commands::Coverage {
            league_id,
            per_league,
            csv,
        } => {
            let store = connect(&config).await?;
            let auditor = CoverageAuditor::new(&store);
            let stats = if per_league {
                auditor.league_report().await?
            } else {
                auditor.fixture_coverage(league_id).await?
            };

            for stat in &stats {
                info!(
                    "{}: {}/{} ({:.1}%)",
                    stat.label, stat.dependent, stat.reference, stat.percentage
                );
            }
            if let Some(path) = csv {
                let file = File::create(&path).with_context(|| format!("Failed to create {}", path.display()))?;
                write_csv(&stats, file)?;
                info!("Wrote {} coverage rows to {}", stats.len(), path.display());
            }
            false
        }
        Commands::Checkpoint { action } => {
            let store = match config.checkpoint.backend {
                CheckpointBackend::Postgres => Some(connect(&config).await?),
                CheckpointBackend::File => None,
            };
            let checkpoints = open_checkpoints(&config, store.as_ref().map(PgDatastore::pool)).await?;
            match action {
                CheckpointAction::Show { entity } => {
                    let saved = checkpoints.list(entity).await?;
                    if saved.is_empty() {
                        println!("No checkpoint for {}", entity);
                    }
                    for checkpoint in saved {
                        println!("{}", serde_json::to_string_pretty(&checkpoint)?);
                    }
                }
                CheckpointAction::Reset { entity, scope } => {
                    let scopes = match scope {
                        Some(scope) => vec![scope],
                        None => checkpoints.list(entity).await?.into_iter().map(|c| c.scope).collect(),
                    };
                    for scope in &scopes {
                        checkpoints.clear(entity, scope).await?;
                        info!("Cleared checkpoint for {} scope {:?}", entity, scope);
                    }
                }
            }
            false
        }
        Commands::Quality { entities, csv } => {
            let store = connect(&config).await?;
            let report = QualityAuditor::new(&store).audit(&entities).await?;
            report.log();
            if let Some(path) = csv {
                let file = File::create(&path).with_context(|| format!("Failed to create {}", path.display()))?;
                write_csv(&report.checks, file)?;
                info!("Wrote {} quality checks to {}", report.checks.len(), path.display());
            }
            report.failed() > 0
        }
    };

    if failed {
        std::process::exit(1);
    }
    Ok(())
}
