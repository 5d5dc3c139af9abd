#![allow(dead_code)]

use serde_json::{json, Value};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use sportmonks_collector::{
    checkpoint::{Checkpoint, CheckpointStore, MemoryCheckpointStore},
    client::{PageFetcher, PageRequest},
    error::{CollectorError, Result},
    pipeline::CancelFlag,
    store::{Datastore, Filter, MemoryDatastore, RowOutcome, UpsertMode},
    types::{EntityId, EntityType, FetchedRecord, NormalizedRow, Page, Pagination, Row},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fail {
    Auth,
    Transient,
    Rejected,
}

impl Fail {
    fn error(self) -> CollectorError {
        match self {
            Fail::Auth => CollectorError::Auth {
                status: 401,
                message: "invalid api token".to_string(),
            },
            Fail::Transient => CollectorError::Transient {
                attempts: 4,
                message: "HTTP 503".to_string(),
            },
            Fail::Rejected => CollectorError::Rejected {
                status: 422,
                body: "bad include".to_string(),
            },
        }
    }
}

/// Serves canned pages and fixtures, with failures scripted per page number
/// or per `fetch_many` call index.
#[derive(Default)]
pub struct ScriptedFetcher {
    pages: HashMap<u32, Page>,
    page_failures: Mutex<HashMap<u32, VecDeque<Fail>>>,
    fixtures: HashMap<EntityId, Value>,
    batch_failures: HashMap<usize, Fail>,
    batch_calls: AtomicUsize,
    cancel_after_batches: Option<(usize, CancelFlag)>,
    pub requested_pages: Mutex<Vec<u32>>,
    pub requested_batches: Mutex<Vec<Vec<EntityId>>>,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// `count` pages of `per_page` leagues each, linked through `next_page`.
    pub fn with_league_pages(mut self, count: u32, per_page: i64) -> Self {
        for page in 1..=count {
            let first = i64::from(page - 1) * per_page + 1;
            let records = (first..first + per_page)
                .map(|id| record(json!({"id": id, "name": format!("League {}", id), "active": true})))
                .collect();
            self.pages.insert(
                page,
                Page {
                    records,
                    pagination: Pagination {
                        has_more: page < count,
                        next_page: (page < count).then_some(page + 1),
                    },
                    rejected: 0,
                },
            );
        }
        self
    }

    /// Marks `count` id-less records as dropped from `page`.
    pub fn with_rejected(mut self, page: u32, count: u64) -> Self {
        self.pages.entry(page).or_default().rejected = count;
        self
    }

    pub fn fail_page(self, page: u32, fail: Fail, times: usize) -> Self {
        self.page_failures
            .lock()
            .unwrap()
            .entry(page)
            .or_default()
            .extend(std::iter::repeat(fail).take(times));
        self
    }

    /// Fixtures `ids`, each with `events_per_fixture` events.
    pub fn with_fixture_events(mut self, ids: impl IntoIterator<Item = EntityId>, events_per_fixture: i64) -> Self {
        for id in ids {
            let events: Vec<Value> = (0..events_per_fixture)
                .map(|n| json!({"id": id * 100 + n, "type_id": 14, "minute": 10 + n}))
                .collect();
            self.fixtures.insert(id, json!({"id": id, "events": events}));
        }
        self
    }

    pub fn fail_batch(mut self, call_index: usize, fail: Fail) -> Self {
        self.batch_failures.insert(call_index, fail);
        self
    }

    pub fn cancel_after_batches(mut self, batches: usize, flag: CancelFlag) -> Self {
        self.cancel_after_batches = Some((batches, flag));
        self
    }

    pub fn batch_call_count(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }

    pub fn pages_requested(&self) -> Vec<u32> {
        self.requested_pages.lock().unwrap().clone()
    }

    pub fn batches_requested(&self) -> Vec<Vec<EntityId>> {
        self.requested_batches.lock().unwrap().clone()
    }
}

pub fn record(value: Value) -> FetchedRecord {
    FetchedRecord::from_value(value).unwrap()
}

impl PageFetcher for ScriptedFetcher {
    async fn fetch_page(&self, request: &PageRequest) -> Result<Page> {
        self.requested_pages.lock().unwrap().push(request.page);
        let scripted = self
            .page_failures
            .lock()
            .unwrap()
            .get_mut(&request.page)
            .and_then(VecDeque::pop_front);
        if let Some(fail) = scripted {
            return Err(fail.error());
        }
        Ok(self.pages.get(&request.page).cloned().unwrap_or_default())
    }

    async fn fetch_many(&self, _resource: &str, ids: &[EntityId], _include: &[String]) -> Result<Page> {
        let call = self.batch_calls.fetch_add(1, Ordering::SeqCst);
        self.requested_batches.lock().unwrap().push(ids.to_vec());
        if let Some((after, flag)) = &self.cancel_after_batches {
            if call + 1 >= *after {
                flag.cancel();
            }
        }
        if let Some(fail) = self.batch_failures.get(&call) {
            return Err(fail.error());
        }
        let records = ids
            .iter()
            .filter_map(|id| self.fixtures.get(id))
            .map(|payload| record(payload.clone()))
            .collect();
        Ok(Page {
            records,
            pagination: Pagination::default(),
            rejected: 0,
        })
    }
}

/// Memory datastore that can fail whole upsert or flag calls, or reject
/// given keys.
#[derive(Default)]
pub struct FlakyDatastore {
    pub inner: MemoryDatastore,
    failing_calls: HashSet<usize>,
    failing_flag_calls: HashSet<usize>,
    rejected_keys: HashSet<EntityId>,
    calls: AtomicUsize,
    flag_calls: AtomicUsize,
}

impl FlakyDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_upsert_call(mut self, call_index: usize) -> Self {
        self.failing_calls.insert(call_index);
        self
    }

    pub fn fail_flag_call(mut self, call_index: usize) -> Self {
        self.failing_flag_calls.insert(call_index);
        self
    }

    pub fn reject_key(mut self, key: EntityId) -> Self {
        self.rejected_keys.insert(key);
        self
    }
}

impl Datastore for FlakyDatastore {
    async fn select(&self, table: &str, filter: &Filter) -> Result<Vec<Row>> {
        self.inner.select(table, filter).await
    }

    async fn upsert(
        &self,
        table: &str,
        rows: &[NormalizedRow],
        conflict_key: &str,
        mode: UpsertMode,
    ) -> Result<Vec<RowOutcome>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_calls.contains(&call) {
            return Err(CollectorError::Database(sqlx::Error::PoolTimedOut));
        }

        let accepted: Vec<NormalizedRow> = rows
            .iter()
            .filter(|row| !self.rejected_keys.contains(&row.natural_key))
            .cloned()
            .collect();
        let mut stored = self.inner.upsert(table, &accepted, conflict_key, mode).await?.into_iter();

        Ok(rows
            .iter()
            .map(|row| {
                if self.rejected_keys.contains(&row.natural_key) {
                    RowOutcome::Failed("violates check constraint".to_string())
                } else {
                    stored.next().unwrap_or(RowOutcome::Failed("missing outcome".to_string()))
                }
            })
            .collect())
    }

    async fn count(&self, table: &str, filter: &Filter) -> Result<u64> {
        self.inner.count(table, filter).await
    }

    async fn set_flag(
        &self,
        table: &str,
        key_column: &str,
        keys: &[EntityId],
        column: &str,
        value: bool,
    ) -> Result<u64> {
        let call = self.flag_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_flag_calls.contains(&call) {
            return Err(CollectorError::Database(sqlx::Error::PoolTimedOut));
        }
        self.inner.set_flag(table, key_column, keys, column, value).await
    }

    async fn count_orphans(&self, child: &str, foreign_key: &str, parent: &str, parent_key: &str) -> Result<u64> {
        self.inner.count_orphans(child, foreign_key, parent, parent_key).await
    }
}

/// Memory checkpoints whose saves start failing after `ok_saves` successes.
pub struct FailingCheckpointStore<'a> {
    pub inner: &'a MemoryCheckpointStore,
    ok_saves: usize,
    saves: AtomicUsize,
}

impl<'a> FailingCheckpointStore<'a> {
    pub fn new(inner: &'a MemoryCheckpointStore, ok_saves: usize) -> Self {
        Self {
            inner,
            ok_saves,
            saves: AtomicUsize::new(0),
        }
    }
}

impl CheckpointStore for FailingCheckpointStore<'_> {
    async fn load(&self, entity_type: EntityType, scope: &str) -> Result<Option<Checkpoint>> {
        self.inner.load(entity_type, scope).await
    }

    async fn list(&self, entity_type: EntityType) -> Result<Vec<Checkpoint>> {
        self.inner.list(entity_type).await
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        if self.saves.fetch_add(1, Ordering::SeqCst) >= self.ok_saves {
            return Err(CollectorError::Checkpoint("disk full".to_string()));
        }
        self.inner.save(checkpoint).await
    }

    async fn clear(&self, entity_type: EntityType, scope: &str) -> Result<()> {
        self.inner.clear(entity_type, scope).await
    }
}

pub fn fixture_row(id: EntityId, league_id: i64, has_events: Value) -> Row {
    json!({"sportmonks_id": id, "league_id": league_id, "has_events": has_events})
        .as_object()
        .cloned()
        .unwrap()
}

/// Seeds `fixtures` with unflagged rows of league `league_id`.
pub fn seed_fixtures(store: &MemoryDatastore, ids: impl IntoIterator<Item = EntityId>, league_id: i64) {
    store.seed(
        "fixtures",
        "sportmonks_id",
        ids.into_iter().map(|id| fixture_row(id, league_id, Value::Null)),
    );
}

pub fn sorted_rows(store: &MemoryDatastore, table: &str) -> Vec<Row> {
    let mut rows = store.rows(table);
    rows.sort_by_key(|row| row["sportmonks_id"].as_i64());
    rows
}

pub const FAST: Duration = Duration::from_millis(1);
