//! Run state machine for one entity type.
//!
//! ```text
//! INIT -> FETCHING -> DONE
//!           |  ^
//!           +--+  one batch per iteration, checkpoint after each commit
//! any -> ABORTED      auth failure or checkpoint persistence failure
//! FETCHING -> INTERRUPTED  cancellation between batches
//! ```

use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::{
    collections::HashSet,
    fmt,
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tracing::{debug, error, info, warn};

use crate::checkpoint::{scope_of, Checkpoint, CheckpointStore, Cursor};
use crate::client::{PageFetcher, PageRequest};
use crate::config::CollectorConfig;
use crate::error::CollectorError;
use crate::normalize::{extract_embedded, normalize_all};
use crate::partition::BatchPlan;
use crate::sink::{BatchReport, UpsertSink};
use crate::store::{Datastore, Filter, UpsertMode};
use crate::types::{EntityId, EntityType, Source, NATURAL_KEY};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Init,
    Fetching,
    Done,
    Aborted,
    Interrupted,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Init => "INIT",
            RunState::Fetching => "FETCHING",
            RunState::Done => "DONE",
            RunState::Aborted => "ABORTED",
            RunState::Interrupted => "INTERRUPTED",
        };
        f.write_str(name)
    }
}

/// Shared cancellation signal, checked between batches.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub entity_type: EntityType,
    pub state: RunState,
    pub batches_attempted: u64,
    pub batches_succeeded: u64,
    pub batches_errored: u64,
    pub report: BatchReport,
    pub pages_fetched: u64,
    pub records_fetched: u64,
    pub ids_not_returned: u64,
    pub parents_flagged: u64,
    /// Returned parents with no stored row to flag.
    pub parents_not_stored: u64,
    /// Whether the sweep reached its end (and was checkpointed as completed).
    pub completed: bool,
    pub abort_reason: Option<String>,
    #[serde(skip)]
    pub elapsed: Duration,
}

impl RunSummary {
    fn new(entity_type: EntityType) -> Self {
        Self {
            entity_type,
            state: RunState::Init,
            batches_attempted: 0,
            batches_succeeded: 0,
            batches_errored: 0,
            report: BatchReport::default(),
            pages_fetched: 0,
            records_fetched: 0,
            ids_not_returned: 0,
            parents_flagged: 0,
            parents_not_stored: 0,
            completed: false,
            abort_reason: None,
            elapsed: Duration::ZERO,
        }
    }

    /// Aborted, or batches were attempted and none succeeded. A run with
    /// nothing to do is not a failure.
    pub fn is_failure(&self) -> bool {
        self.state == RunState::Aborted || (self.batches_attempted > 0 && self.batches_succeeded == 0)
    }

    fn abort(&mut self, err: &CollectorError) {
        error!("{} run aborted: {}", self.entity_type, err);
        self.state = RunState::Aborted;
        self.abort_reason = Some(err.to_string());
    }

    fn batch_failed(&mut self, what: &str, err: &CollectorError) {
        self.batches_errored += 1;
        error!("{} {} failed: {}", self.entity_type, what, err);
    }

    pub fn log(&self) {
        info!(
            "{} finished in {:.1}s with state {}: {}/{} batches ok, {} errored; {} inserted, {} updated, {} skipped, {} rows errored",
            self.entity_type,
            self.elapsed.as_secs_f64(),
            self.state,
            self.batches_succeeded,
            self.batches_attempted,
            self.batches_errored,
            self.report.inserted,
            self.report.updated,
            self.report.skipped_existing,
            self.report.errored
        );
        if self.ids_not_returned > 0 {
            warn!("{}: {} requested ids were not returned upstream", self.entity_type, self.ids_not_returned);
        }
        if self.parents_not_stored > 0 {
            warn!(
                "{}: {} returned parents are not stored and were not flagged",
                self.entity_type, self.parents_not_stored
            );
        }
        if let Some(reason) = &self.abort_reason {
            error!("{}: abort reason: {}", self.entity_type, reason);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineOptions {
    pub upsert_mode: UpsertMode,
    pub max_consecutive_failures: u32,
    pub show_progress: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            upsert_mode: UpsertMode::Overwrite,
            max_consecutive_failures: 3,
            show_progress: false,
        }
    }
}

impl PipelineOptions {
    pub fn from_config(config: &CollectorConfig) -> Self {
        Self {
            upsert_mode: config.batch.upsert_mode,
            max_consecutive_failures: config.batch.max_consecutive_failures,
            show_progress: config.show_progress,
        }
    }
}

/// Paginated sync of one list resource.
#[derive(Debug, Clone)]
pub struct PagedJob {
    pub entity_type: EntityType,
    pub request: PageRequest,
    pub max_pages: Option<u32>,
    pub restart: bool,
}

impl PagedJob {
    pub fn new(entity_type: EntityType, request: PageRequest) -> Self {
        Self {
            entity_type,
            request,
            max_pages: None,
            restart: false,
        }
    }

    /// Checkpoint scope. A non-default resource, the query params and the
    /// page size each change what a page number points at.
    pub fn scope(&self) -> String {
        let mut parts = Vec::new();
        let own_resource = match self.entity_type.source() {
            Source::Paged { resource } => resource == self.request.resource,
            Source::Embedded { .. } => false,
        };
        if !own_resource {
            parts.push(self.request.resource.clone());
        }
        let mut params: Vec<String> = self
            .request
            .params
            .iter()
            .map(|(key, value)| format!("{}-{}", key, value))
            .collect();
        params.sort();
        parts.extend(params);
        parts.push(format!("per_page-{}", self.request.per_page));
        scope_of(parts)
    }
}

/// Where enrichment gets its fixture ids from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Candidates {
    Ids(Vec<EntityId>),
    /// Stored fixtures, optionally filtered; `only_missing` keeps fixtures
    /// whose flag has never been set.
    Stored {
        league_id: Option<i64>,
        season_id: Option<i64>,
        only_missing: bool,
    },
}

/// Batch enrichment of fixtures with one embedded entity type.
#[derive(Debug, Clone)]
pub struct EnrichmentJob {
    pub entity_type: EntityType,
    pub candidates: Candidates,
    pub batch_size: NonZeroUsize,
    pub limit: Option<usize>,
    pub restart: bool,
}

impl EnrichmentJob {
    /// Checkpoint scope for stored candidates; `None` for explicit ids,
    /// which are never checkpointed.
    pub fn scope(&self) -> Option<String> {
        match &self.candidates {
            Candidates::Ids(_) => None,
            Candidates::Stored {
                league_id,
                season_id,
                only_missing,
            } => {
                let mut parts = Vec::new();
                if let Some(id) = league_id {
                    parts.push(format!("league-{}", id));
                }
                if let Some(id) = season_id {
                    parts.push(format!("season-{}", id));
                }
                if *only_missing {
                    parts.push("missing".to_string());
                }
                Some(scope_of(parts))
            }
        }
    }
}

fn progress_bar(show: bool, len: Option<u64>, unit: &str) -> ProgressBar {
    if !show {
        return ProgressBar::hidden();
    }
    match len {
        Some(len) => {
            let pb = ProgressBar::new(len);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template(&format!(
                        "[{{elapsed_precise}}] {{bar:40.cyan/blue}} {{pos}}/{{len}} {} ({{eta}}) {{msg}}",
                        unit
                    ))
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("##-"),
            );
            pb
        }
        None => {
            let pb = ProgressBar::new_spinner();
            pb.set_style(
                ProgressStyle::default_spinner()
                    .template(&format!("[{{elapsed_precise}}] {{spinner}} {{pos}} {} {{msg}}", unit))
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            pb
        }
    }
}

pub struct Pipeline<'a, F, D, C> {
    fetcher: &'a F,
    store: &'a D,
    checkpoints: &'a C,
    options: PipelineOptions,
    cancel: CancelFlag,
}

impl<'a, F, D, C> Pipeline<'a, F, D, C>
where
    F: PageFetcher,
    D: Datastore,
    C: CheckpointStore,
{
    pub fn new(fetcher: &'a F, store: &'a D, checkpoints: &'a C, options: PipelineOptions) -> Self {
        Self {
            fetcher,
            store,
            checkpoints,
            options,
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Clears (on restart) and loads the checkpoint for `scope`. Without a
    /// scope the run is not checkpointed. `Err` has already been recorded as
    /// an abort on `summary`.
    async fn resume_cursor(
        &self,
        restart: bool,
        scope: Option<&str>,
        summary: &mut RunSummary,
    ) -> Result<Option<Cursor>, ()> {
        let entity = summary.entity_type;
        let Some(scope) = scope else {
            debug!("{}: explicit id list, checkpoints untouched", entity);
            return Ok(None);
        };
        if restart {
            if let Err(e) = self.checkpoints.clear(entity, scope).await {
                summary.abort(&e);
                return Err(());
            }
            info!("{}: checkpoint {:?} cleared, starting a fresh sweep", entity, scope);
        }

        match self.checkpoints.load(entity, scope).await {
            Ok(Some(checkpoint)) => {
                let cursor = checkpoint.resume_cursor();
                match cursor {
                    Some(cursor) => info!("{}: resuming from {:?}", entity, cursor),
                    None => info!("{}: previous sweep completed, starting over", entity),
                }
                Ok(cursor)
            }
            Ok(None) => Ok(None),
            Err(e) => {
                summary.abort(&e);
                Err(())
            }
        }
    }

    async fn save_checkpoint(&self, checkpoint: Checkpoint, summary: &mut RunSummary) -> bool {
        match self.checkpoints.save(&checkpoint).await {
            Ok(()) => true,
            Err(e) => {
                summary.abort(&e);
                false
            }
        }
    }

    /// Sets `flag` on the stored parents, never creating rows. Returns how
    /// many parents were matched.
    async fn write_flags(
        &self,
        parent: EntityType,
        flag: &str,
        flags: &[(EntityId, bool)],
    ) -> Result<u64, CollectorError> {
        let mut matched = 0;
        for value in [true, false] {
            let ids: Vec<EntityId> = flags.iter().filter(|(_, has)| *has == value).map(|(id, _)| *id).collect();
            if !ids.is_empty() {
                matched += self
                    .store
                    .set_flag(parent.table(), parent.conflict_key(), &ids, flag, value)
                    .await?;
            }
        }
        Ok(matched)
    }

    /// Walks a paginated resource from the checkpointed page to the end.
    pub async fn run_paged(&self, job: &PagedJob) -> RunSummary {
        let started = Instant::now();
        let entity = job.entity_type;
        let mut summary = RunSummary::new(entity);
        let scope = job.scope();

        let Ok(cursor) = self.resume_cursor(job.restart, Some(&scope), &mut summary).await else {
            summary.elapsed = started.elapsed();
            return summary;
        };
        let mut page = match cursor {
            Some(Cursor::Page(page)) => page.max(1),
            Some(Cursor::AfterId(id)) => {
                warn!("{}: ignoring id checkpoint {} for a paged sync", entity, id);
                1
            }
            None => 1,
        };

        summary.state = RunState::Fetching;
        let sink = UpsertSink::new(self.store, self.options.upsert_mode);
        let pb = progress_bar(self.options.show_progress, None, "pages");
        let mut consecutive_failures = 0u32;
        // Set after a failed page: later pages still run, but the
        // checkpoint must not move past the gap.
        let mut frontier_blocked = false;

        loop {
            if self.cancel.is_cancelled() {
                info!("{}: cancellation requested, stopping before page {}", entity, page);
                summary.state = RunState::Interrupted;
                break;
            }
            if job.max_pages.is_some_and(|max| summary.batches_attempted >= u64::from(max)) {
                info!("{}: reached page limit, next page {}", entity, page);
                break;
            }

            summary.batches_attempted += 1;
            pb.set_message(format!("{} page {}", entity, page));
            let result = self.fetcher.fetch_page(&job.request.at_page(page)).await;

            let fetched = match result {
                Ok(fetched) => fetched,
                Err(e) if e.is_fatal() => {
                    summary.abort(&e);
                    break;
                }
                Err(e) => {
                    summary.batch_failed(&format!("page {}", page), &e);
                    frontier_blocked = true;
                    consecutive_failures += 1;
                    if consecutive_failures >= self.options.max_consecutive_failures {
                        warn!("{}: {} consecutive failed pages, ending sweep", entity, consecutive_failures);
                        break;
                    }
                    page += 1;
                    continue;
                }
            };

            summary.pages_fetched += 1;
            summary.records_fetched += fetched.records.len() as u64;
            if fetched.rejected > 0 {
                warn!("{} page {}: {} records without an id", entity, page, fetched.rejected);
                summary.report.errored += fetched.rejected;
            }
            let next = fetched.next_page_after(page);
            let normalized = normalize_all(entity, &fetched.records);

            match sink.write(entity.table(), normalized.rows).await {
                Ok(mut report) => {
                    report.errored += normalized.errored;
                    summary.report += report;
                    summary.batches_succeeded += 1;
                    consecutive_failures = 0;
                    info!(
                        "{} page {}: {} saved, {} skipped, {} errored",
                        entity,
                        page,
                        report.saved(),
                        report.skipped_existing,
                        report.errored
                    );

                    if !frontier_blocked {
                        let checkpoint = match next {
                            Some(next) => Checkpoint::new(entity, &scope, Cursor::Page(next)),
                            None => Checkpoint::finished(entity, &scope, Cursor::Page(page)),
                        };
                        if !self.save_checkpoint(checkpoint, &mut summary).await {
                            break;
                        }
                    }
                }
                Err(e) => {
                    summary.batch_failed(&format!("upsert of page {}", page), &e);
                    frontier_blocked = true;
                    consecutive_failures += 1;
                    if consecutive_failures >= self.options.max_consecutive_failures {
                        warn!("{}: {} consecutive failed pages, ending sweep", entity, consecutive_failures);
                        break;
                    }
                }
            }
            pb.inc(1);

            match next {
                Some(next) => page = next,
                None => {
                    summary.completed = !frontier_blocked;
                    break;
                }
            }
        }

        if summary.state == RunState::Fetching {
            summary.state = RunState::Done;
        }
        pb.finish_and_clear();
        summary.elapsed = started.elapsed();
        summary
    }

    async fn candidate_ids(
        &self,
        entity: EntityType,
        parent: EntityType,
        parent_flag: &str,
        candidates: &Candidates,
    ) -> Result<Vec<EntityId>, CollectorError> {
        let (league_id, season_id, only_missing) = match candidates {
            Candidates::Ids(ids) => return Ok(ids.clone()),
            Candidates::Stored {
                league_id,
                season_id,
                only_missing,
            } => (*league_id, *season_id, *only_missing),
        };

        let mut filter = Filter::new().order_by(NATURAL_KEY);
        if let Some(id) = league_id {
            filter = filter.eq("league_id", id);
        }
        if let Some(id) = season_id {
            filter = filter.eq("season_id", id);
        }
        if only_missing {
            filter = filter.is_null(parent_flag);
        }

        let rows = self.store.select(parent.table(), &filter).await?;
        let ids: Vec<EntityId> = rows
            .iter()
            .filter_map(|row| row.get(NATURAL_KEY).and_then(|v| v.as_i64()))
            .collect();
        debug!("{}: {} candidate {} ids", entity, ids.len(), parent);
        Ok(ids)
    }

    /// Fetches `job.entity_type` for fixtures in id windows through the
    /// parent's multi endpoint, writes the children and flags each returned
    /// fixture.
    pub async fn run_enrichment(&self, job: &EnrichmentJob) -> RunSummary {
        let started = Instant::now();
        let entity = job.entity_type;
        let mut summary = RunSummary::new(entity);

        let (parent, include, parent_flag) = match entity.source() {
            Source::Embedded {
                parent,
                include,
                parent_flag,
            } => (parent, include, parent_flag),
            Source::Paged { .. } => {
                summary.abort(&CollectorError::Config(format!(
                    "{} is not enriched through fixtures, use a paged sync",
                    entity
                )));
                return summary;
            }
        };
        let Source::Paged { resource } = parent.source() else {
            summary.abort(&CollectorError::Config(format!("{} has no list resource", parent)));
            return summary;
        };

        let scope = job.scope();
        let Ok(cursor) = self.resume_cursor(job.restart, scope.as_deref(), &mut summary).await else {
            summary.elapsed = started.elapsed();
            return summary;
        };
        let resume_after = match cursor {
            Some(Cursor::AfterId(id)) => Some(id),
            Some(Cursor::Page(page)) => {
                warn!("{}: ignoring page checkpoint {} for a batch run", entity, page);
                None
            }
            None => None,
        };

        let ids = match self.candidate_ids(entity, parent, parent_flag, &job.candidates).await {
            Ok(ids) => ids,
            Err(e) => {
                summary.abort(&e);
                summary.elapsed = started.elapsed();
                return summary;
            }
        };

        let mut plan = BatchPlan::new(ids, job.batch_size);
        if let Some(after) = resume_after {
            plan = plan.resume_after(after);
        }
        let truncated = job.limit.is_some_and(|limit| plan.len() > limit);
        if let Some(limit) = job.limit {
            plan = plan.truncate(limit);
        }
        info!(
            "{}: {} fixtures to enrich in {} batches of up to {}",
            entity,
            plan.len(),
            plan.window_count(),
            plan.batch_size()
        );

        summary.state = RunState::Fetching;
        let sink = UpsertSink::new(self.store, self.options.upsert_mode);
        let include = [include.to_string()];
        let pb = progress_bar(self.options.show_progress, Some(plan.window_count() as u64), "batches");
        let total = plan.window_count();
        let mut frontier_blocked = false;

        for (index, window) in plan.windows().enumerate() {
            if self.cancel.is_cancelled() {
                info!("{}: cancellation requested, {} batches left", entity, total - index);
                summary.state = RunState::Interrupted;
                break;
            }

            summary.batches_attempted += 1;
            let batch_label = format!("batch {}/{}", index + 1, total);
            let fetched = match self.fetcher.fetch_many(resource, window, &include).await {
                Ok(fetched) => fetched,
                Err(e) if e.is_fatal() => {
                    summary.abort(&e);
                    break;
                }
                Err(e) => {
                    summary.batch_failed(&batch_label, &e);
                    frontier_blocked = true;
                    pb.inc(1);
                    continue;
                }
            };
            summary.records_fetched += fetched.records.len() as u64;
            summary.report.errored += fetched.rejected;

            let extracted = match extract_embedded(entity, &fetched.records) {
                Ok(extracted) => extracted,
                Err(e) => {
                    summary.batch_failed(&batch_label, &e);
                    frontier_blocked = true;
                    pb.inc(1);
                    continue;
                }
            };

            let returned: HashSet<EntityId> = extracted.returned_parents.iter().copied().collect();
            let missing: Vec<EntityId> = window.iter().copied().filter(|id| !returned.contains(id)).collect();
            if !missing.is_empty() {
                warn!("{} {}: {} ids not returned: {:?}", entity, batch_label, missing.len(), missing);
                summary.ids_not_returned += missing.len() as u64;
            }

            let mut report = match sink.write(entity.table(), extracted.rows).await {
                Ok(report) => report,
                Err(e) => {
                    summary.batch_failed(&batch_label, &e);
                    frontier_blocked = true;
                    pb.inc(1);
                    continue;
                }
            };
            report.errored += extracted.errored;

            match self.write_flags(parent, parent_flag, &extracted.flags).await {
                Ok(matched) => {
                    summary.parents_flagged += matched;
                    let unmatched = (extracted.flags.len() as u64).saturating_sub(matched);
                    if unmatched > 0 {
                        warn!("{} {}: {} fixtures not stored, left unflagged", entity, batch_label, unmatched);
                        summary.parents_not_stored += unmatched;
                    }
                }
                Err(e) => {
                    summary.report += report;
                    summary.batch_failed(&format!("{} {} flags", batch_label, parent_flag), &e);
                    frontier_blocked = true;
                    pb.inc(1);
                    continue;
                }
            }

            summary.report += report;
            summary.batches_succeeded += 1;
            info!(
                "{} {}: {} saved, {} skipped, {} errored",
                entity,
                batch_label,
                report.saved(),
                report.skipped_existing,
                report.errored
            );

            if let (false, Some(scope), Some(&last)) = (frontier_blocked, &scope, window.last()) {
                if !self
                    .save_checkpoint(Checkpoint::new(entity, scope, Cursor::AfterId(last)), &mut summary)
                    .await
                {
                    break;
                }
            }
            pb.inc(1);
        }

        if summary.state == RunState::Fetching {
            summary.state = RunState::Done;
            if !frontier_blocked && !truncated {
                let last = plan.ids().last().copied().or(resume_after).unwrap_or(0);
                let completed = match &scope {
                    Some(scope) => {
                        self.save_checkpoint(Checkpoint::finished(entity, scope, Cursor::AfterId(last)), &mut summary)
                            .await
                    }
                    None => true,
                };
                summary.completed = completed;
            }
        }
        pb.finish_and_clear();
        summary.elapsed = started.elapsed();
        summary
    }
}
