mod common;

use common::{fixture_row, seed_fixtures, sorted_rows, Fail, FailingCheckpointStore, FlakyDatastore, ScriptedFetcher};
use nonzero_ext::nonzero;
use pretty_assertions::assert_eq;
use serde_json::json;

use sportmonks_collector::{
    checkpoint::{Checkpoint, CheckpointStore, Cursor, MemoryCheckpointStore},
    client::PageRequest,
    pipeline::{CancelFlag, Candidates, EnrichmentJob, PagedJob, Pipeline, PipelineOptions, RunState},
    store::MemoryDatastore,
    types::{EntityId, EntityType, NATURAL_KEY},
};

fn leagues_job() -> PagedJob {
    PagedJob::new(EntityType::League, PageRequest::new("leagues", 2))
}

fn leagues_scope() -> String {
    leagues_job().scope()
}

/// Explicit ids: never checkpointed.
fn events_job(ids: impl IntoIterator<Item = EntityId>) -> EnrichmentJob {
    EnrichmentJob {
        entity_type: EntityType::Event,
        candidates: Candidates::Ids(ids.into_iter().collect()),
        batch_size: nonzero!(3usize),
        limit: None,
        restart: false,
    }
}

/// Every stored fixture, checkpointed under the unfiltered scope.
fn stored_events_job() -> EnrichmentJob {
    EnrichmentJob {
        candidates: Candidates::Stored {
            league_id: None,
            season_id: None,
            only_missing: false,
        },
        ..events_job([])
    }
}

async fn events_checkpoint(checkpoints: &impl CheckpointStore) -> Option<Checkpoint> {
    checkpoints.load(EntityType::Event, "").await.unwrap()
}

#[test_log::test(tokio::test)]
async fn test_paged_sync_follows_next_page_and_completes() {
    let fetcher = ScriptedFetcher::new().with_league_pages(3, 2);
    let store = MemoryDatastore::new();
    let checkpoints = MemoryCheckpointStore::new();

    let summary = Pipeline::new(&fetcher, &store, &checkpoints, PipelineOptions::default())
        .run_paged(&leagues_job())
        .await;

    assert_eq!(summary.state, RunState::Done);
    assert!(summary.completed);
    assert!(!summary.is_failure());
    assert_eq!(fetcher.pages_requested(), vec![1, 2, 3]);
    assert_eq!(summary.report.inserted, 6);
    assert_eq!(store.rows("leagues").len(), 6);

    let checkpoint = checkpoints.load(EntityType::League, &leagues_scope()).await.unwrap().unwrap();
    assert!(checkpoint.completed);
    assert_eq!(checkpoint.resume_cursor(), None);
}

#[test_log::test(tokio::test)]
async fn test_paged_sync_resumes_from_checkpoint() {
    let fetcher = ScriptedFetcher::new().with_league_pages(4, 2);
    let store = MemoryDatastore::new();
    let checkpoints = MemoryCheckpointStore::new();
    checkpoints
        .save(&Checkpoint::new(EntityType::League, &leagues_scope(), Cursor::Page(3)))
        .await
        .unwrap();

    let summary = Pipeline::new(&fetcher, &store, &checkpoints, PipelineOptions::default())
        .run_paged(&leagues_job())
        .await;

    assert_eq!(fetcher.pages_requested(), vec![3, 4]);
    assert_eq!(summary.pages_fetched, 2);
    assert_eq!(store.rows("leagues").len(), 4);
}

#[test_log::test(tokio::test)]
async fn test_restart_ignores_checkpoint() {
    let fetcher = ScriptedFetcher::new().with_league_pages(2, 2);
    let store = MemoryDatastore::new();
    let checkpoints = MemoryCheckpointStore::new();
    checkpoints
        .save(&Checkpoint::new(EntityType::League, &leagues_scope(), Cursor::Page(2)))
        .await
        .unwrap();

    let job = PagedJob {
        restart: true,
        ..leagues_job()
    };
    Pipeline::new(&fetcher, &store, &checkpoints, PipelineOptions::default())
        .run_paged(&job)
        .await;

    assert_eq!(fetcher.pages_requested(), vec![1, 2]);
}

#[test_log::test(tokio::test)]
async fn test_auth_failure_aborts_without_advancing_checkpoint() {
    let fetcher = ScriptedFetcher::new()
        .with_league_pages(3, 2)
        .fail_page(2, Fail::Auth, 1);
    let store = MemoryDatastore::new();
    let checkpoints = MemoryCheckpointStore::new();

    let summary = Pipeline::new(&fetcher, &store, &checkpoints, PipelineOptions::default())
        .run_paged(&leagues_job())
        .await;

    assert_eq!(summary.state, RunState::Aborted);
    assert!(summary.is_failure());
    assert_eq!(fetcher.pages_requested(), vec![1, 2]);
    let checkpoint = checkpoints.load(EntityType::League, &leagues_scope()).await.unwrap().unwrap();
    assert_eq!(checkpoint.cursor, Cursor::Page(2));
    assert!(summary.abort_reason.unwrap().contains("401"));
}

#[test_log::test(tokio::test)]
async fn test_failed_page_does_not_stop_the_sweep() {
    let fetcher = ScriptedFetcher::new()
        .with_league_pages(3, 2)
        .fail_page(2, Fail::Transient, 1);
    let store = MemoryDatastore::new();
    let checkpoints = MemoryCheckpointStore::new();

    let summary = Pipeline::new(&fetcher, &store, &checkpoints, PipelineOptions::default())
        .run_paged(&leagues_job())
        .await;

    assert_eq!(summary.state, RunState::Done);
    assert!(!summary.is_failure());
    assert!(!summary.completed);
    assert_eq!(summary.batches_errored, 1);
    assert_eq!(summary.batches_succeeded, 2);
    assert_eq!(fetcher.pages_requested(), vec![1, 2, 3]);
    // Checkpoint stays at the failed page so the next run retries it.
    let checkpoint = checkpoints.load(EntityType::League, &leagues_scope()).await.unwrap().unwrap();
    assert_eq!(checkpoint.cursor, Cursor::Page(2));
    assert!(!checkpoint.completed);
}

#[test_log::test(tokio::test)]
async fn test_consecutive_failures_end_the_sweep() {
    let fetcher = ScriptedFetcher::new()
        .with_league_pages(10, 2)
        .fail_page(1, Fail::Transient, 1)
        .fail_page(2, Fail::Rejected, 1)
        .fail_page(3, Fail::Transient, 1);
    let store = MemoryDatastore::new();
    let checkpoints = MemoryCheckpointStore::new();

    let summary = Pipeline::new(&fetcher, &store, &checkpoints, PipelineOptions::default())
        .run_paged(&leagues_job())
        .await;

    assert_eq!(fetcher.pages_requested(), vec![1, 2, 3]);
    assert_eq!(summary.batches_attempted, 3);
    assert!(summary.is_failure());
    assert_eq!(checkpoints.load(EntityType::League, &leagues_scope()).await.unwrap(), None);
}

#[test_log::test(tokio::test)]
async fn test_max_pages_bounds_the_run() {
    let fetcher = ScriptedFetcher::new().with_league_pages(5, 2);
    let store = MemoryDatastore::new();
    let checkpoints = MemoryCheckpointStore::new();

    let job = PagedJob {
        max_pages: Some(2),
        ..leagues_job()
    };
    let summary = Pipeline::new(&fetcher, &store, &checkpoints, PipelineOptions::default())
        .run_paged(&job)
        .await;

    assert_eq!(summary.pages_fetched, 2);
    assert!(!summary.completed);
    let checkpoint = checkpoints.load(EntityType::League, &leagues_scope()).await.unwrap().unwrap();
    assert_eq!(checkpoint.resume_cursor(), Some(Cursor::Page(3)));
}

#[test_log::test(tokio::test)]
async fn test_paged_scopes_do_not_share_a_cursor() {
    let fetcher = ScriptedFetcher::new().with_league_pages(3, 2);
    let store = MemoryDatastore::new();
    let checkpoints = MemoryCheckpointStore::new();
    // A sweep with a different page size stopped at page 3.
    checkpoints
        .save(&Checkpoint::new(EntityType::League, "per_page-50", Cursor::Page(3)))
        .await
        .unwrap();

    Pipeline::new(&fetcher, &store, &checkpoints, PipelineOptions::default())
        .run_paged(&leagues_job())
        .await;

    assert_eq!(fetcher.pages_requested(), vec![1, 2, 3]);
    let other = checkpoints.load(EntityType::League, "per_page-50").await.unwrap().unwrap();
    assert_eq!(other.resume_cursor(), Some(Cursor::Page(3)));
}

#[test_log::test(tokio::test)]
async fn test_records_without_id_count_as_errored() {
    let fetcher = ScriptedFetcher::new().with_league_pages(2, 2).with_rejected(1, 3);
    let store = MemoryDatastore::new();
    let checkpoints = MemoryCheckpointStore::new();

    let summary = Pipeline::new(&fetcher, &store, &checkpoints, PipelineOptions::default())
        .run_paged(&leagues_job())
        .await;

    assert_eq!(summary.report.inserted, 4);
    assert_eq!(summary.report.errored, 3);
    assert_eq!(summary.records_fetched, 4);
    assert!(summary.completed);
}

#[test_log::test(tokio::test)]
async fn test_enrichment_writes_children_and_flags() {
    let fetcher = ScriptedFetcher::new().with_fixture_events(1..=7, 2);
    let store = MemoryDatastore::new();
    seed_fixtures(&store, 1..=7, 8);
    let checkpoints = MemoryCheckpointStore::new();

    let summary = Pipeline::new(&fetcher, &store, &checkpoints, PipelineOptions::default())
        .run_enrichment(&stored_events_job())
        .await;

    assert_eq!(summary.state, RunState::Done);
    assert!(summary.completed);
    assert_eq!(summary.batches_attempted, 3);
    assert_eq!(summary.report.inserted, 14);
    assert_eq!(summary.parents_flagged, 7);
    assert_eq!(summary.parents_not_stored, 0);
    assert_eq!(
        fetcher.batches_requested(),
        vec![vec![1, 2, 3], vec![4, 5, 6], vec![7]]
    );

    let events = store.rows("fixture_events");
    assert_eq!(events.len(), 14);
    assert!(events.iter().all(|e| e["fixture_id"].is_i64()));
    assert_eq!(store.get("fixtures", 7).unwrap()["has_events"], json!(true));
    assert_eq!(store.get("fixtures", 7).unwrap()["league_id"], json!(8));

    let checkpoint = events_checkpoint(&checkpoints).await.unwrap();
    assert_eq!(checkpoint.cursor, Cursor::AfterId(7));
    assert!(checkpoint.completed);
}

#[test_log::test(tokio::test)]
async fn test_flags_never_create_fixtures() {
    let fetcher = ScriptedFetcher::new().with_fixture_events([1, 2], 1);
    let store = MemoryDatastore::new();
    seed_fixtures(&store, [1], 8);
    let checkpoints = MemoryCheckpointStore::new();

    let summary = Pipeline::new(&fetcher, &store, &checkpoints, PipelineOptions::default())
        .run_enrichment(&events_job([1, 2]))
        .await;

    assert_eq!(summary.batches_succeeded, 1);
    assert_eq!(summary.parents_flagged, 1);
    assert_eq!(summary.parents_not_stored, 1);
    assert_eq!(store.rows("fixtures").len(), 1);
    assert!(store.get("fixtures", 2).is_none());
    assert_eq!(store.get("fixtures", 1).unwrap()["has_events"], json!(true));
}

#[test_log::test(tokio::test)]
async fn test_flag_failure_fails_the_batch() {
    let fetcher = ScriptedFetcher::new().with_fixture_events(1..=6, 1);
    let store = FlakyDatastore::new().fail_flag_call(0);
    seed_fixtures(&store.inner, 1..=6, 8);
    let checkpoints = MemoryCheckpointStore::new();

    let summary = Pipeline::new(&fetcher, &store, &checkpoints, PipelineOptions::default())
        .run_enrichment(&stored_events_job())
        .await;

    assert_eq!(summary.batches_errored, 1);
    assert_eq!(summary.batches_succeeded, 1);
    assert!(!summary.completed);
    assert!(store.inner.get("fixtures", 1).unwrap()["has_events"].is_null());
    assert_eq!(store.inner.get("fixtures", 4).unwrap()["has_events"], json!(true));
    // Batch 1 never committed, so nothing is checkpointed.
    assert_eq!(events_checkpoint(&checkpoints).await, None);
}

#[test_log::test(tokio::test)]
async fn test_explicit_ids_ignore_stale_checkpoint() {
    let fetcher = ScriptedFetcher::new().with_fixture_events([10, 20], 1);
    let store = MemoryDatastore::new();
    seed_fixtures(&store, [10, 20], 8);
    let checkpoints = MemoryCheckpointStore::new();
    let stale = Checkpoint::new(EntityType::Event, "", Cursor::AfterId(5000));
    checkpoints.save(&stale).await.unwrap();

    let summary = Pipeline::new(&fetcher, &store, &checkpoints, PipelineOptions::default())
        .run_enrichment(&events_job([20, 10]))
        .await;

    assert_eq!(fetcher.batches_requested(), vec![vec![10, 20]]);
    assert_eq!(summary.parents_flagged, 2);
    assert!(summary.completed);
    // The stored sweep's frontier is left exactly as it was.
    assert_eq!(events_checkpoint(&checkpoints).await, Some(stale));
    assert_eq!(checkpoints.list(EntityType::Event).await.unwrap().len(), 1);
}

#[test_log::test(tokio::test)]
async fn test_filtered_sweep_has_its_own_checkpoint() {
    let fetcher = ScriptedFetcher::new().with_fixture_events(1..=4, 1);
    let store = MemoryDatastore::new();
    seed_fixtures(&store, [1, 2], 8);
    seed_fixtures(&store, [3, 4], 564);
    let checkpoints = MemoryCheckpointStore::new();
    let unfiltered = Checkpoint::new(EntityType::Event, "", Cursor::AfterId(5000));
    checkpoints.save(&unfiltered).await.unwrap();

    let job = EnrichmentJob {
        candidates: Candidates::Stored {
            league_id: Some(8),
            season_id: None,
            only_missing: false,
        },
        ..events_job([])
    };
    let summary = Pipeline::new(&fetcher, &store, &checkpoints, PipelineOptions::default())
        .run_enrichment(&job)
        .await;

    assert_eq!(fetcher.batches_requested(), vec![vec![1, 2]]);
    assert!(summary.completed);
    let scoped = checkpoints.load(EntityType::Event, "league-8").await.unwrap().unwrap();
    assert!(scoped.completed);
    assert_eq!(scoped.cursor, Cursor::AfterId(2));
    assert_eq!(events_checkpoint(&checkpoints).await, Some(unfiltered));
}

#[test_log::test(tokio::test)]
async fn test_transient_batch_failure_keeps_going_but_holds_checkpoint() {
    let fetcher = ScriptedFetcher::new()
        .with_fixture_events(1..=10, 1)
        .fail_batch(1, Fail::Transient);
    let store = MemoryDatastore::new();
    seed_fixtures(&store, 1..=10, 8);
    let checkpoints = MemoryCheckpointStore::new();
    let pipeline = Pipeline::new(&fetcher, &store, &checkpoints, PipelineOptions::default());

    let summary = pipeline.run_enrichment(&stored_events_job()).await;

    assert_eq!(summary.state, RunState::Done);
    assert_eq!(summary.batches_attempted, 4);
    assert_eq!(summary.batches_errored, 1);
    assert_eq!(summary.batches_succeeded, 3);
    assert!(!summary.is_failure());
    // Fixtures 7..=10 were still enriched.
    assert_eq!(store.get("fixtures", 10).unwrap()["has_events"], json!(true));
    assert!(store.get("fixtures", 5).unwrap()["has_events"].is_null());

    let checkpoint = events_checkpoint(&checkpoints).await.unwrap();
    assert_eq!(checkpoint.cursor, Cursor::AfterId(3));
    assert!(!checkpoint.completed);

    // The next run picks up the failed batch.
    let summary = pipeline.run_enrichment(&stored_events_job()).await;
    assert_eq!(summary.batches_errored, 0);
    assert_eq!(fetcher.batches_requested()[4], vec![4, 5, 6]);
    assert_eq!(store.rows("fixture_events").len(), 10);
}

#[test_log::test(tokio::test)]
async fn test_auth_failure_in_enrichment_aborts() {
    let fetcher = ScriptedFetcher::new()
        .with_fixture_events(1..=9, 1)
        .fail_batch(1, Fail::Auth);
    let store = MemoryDatastore::new();
    seed_fixtures(&store, 1..=9, 8);
    let checkpoints = MemoryCheckpointStore::new();

    let summary = Pipeline::new(&fetcher, &store, &checkpoints, PipelineOptions::default())
        .run_enrichment(&stored_events_job())
        .await;

    assert_eq!(summary.state, RunState::Aborted);
    assert!(summary.is_failure());
    assert_eq!(fetcher.batch_call_count(), 2);
    let checkpoint = events_checkpoint(&checkpoints).await.unwrap();
    assert_eq!(checkpoint.cursor, Cursor::AfterId(3));
}

#[test_log::test(tokio::test)]
async fn test_checkpoint_failure_aborts_and_resume_is_idempotent() {
    let ids = 1..=9;

    // Reference: one clean run.
    let clean_store = MemoryDatastore::new();
    seed_fixtures(&clean_store, ids.clone(), 8);
    let clean_fetcher = ScriptedFetcher::new().with_fixture_events(ids.clone(), 2);
    Pipeline::new(&clean_fetcher, &clean_store, &MemoryCheckpointStore::new(), PipelineOptions::default())
        .run_enrichment(&stored_events_job())
        .await;

    // Crash after batch 2 is written but before its checkpoint lands.
    let store = MemoryDatastore::new();
    seed_fixtures(&store, ids.clone(), 8);
    let fetcher = ScriptedFetcher::new().with_fixture_events(ids.clone(), 2);
    let durable = MemoryCheckpointStore::new();
    let failing = FailingCheckpointStore::new(&durable, 1);

    let crashed = Pipeline::new(&fetcher, &store, &failing, PipelineOptions::default())
        .run_enrichment(&stored_events_job())
        .await;
    assert_eq!(crashed.state, RunState::Aborted);
    assert!(crashed.abort_reason.unwrap().contains("disk full"));
    assert_eq!(fetcher.batch_call_count(), 2);
    assert_eq!(events_checkpoint(&durable).await.unwrap().cursor, Cursor::AfterId(3));

    // Resume with a working store: batch 2 is redone, batch 1 is not.
    let resumed = Pipeline::new(&fetcher, &store, &durable, PipelineOptions::default())
        .run_enrichment(&stored_events_job())
        .await;
    assert_eq!(resumed.state, RunState::Done);
    assert_eq!(resumed.report.skipped_existing, 6);
    assert_eq!(resumed.report.inserted, 6);
    assert_eq!(fetcher.batches_requested()[2], vec![4, 5, 6]);

    assert_eq!(sorted_rows(&store, "fixture_events"), sorted_rows(&clean_store, "fixture_events"));
    assert_eq!(sorted_rows(&store, "fixtures"), sorted_rows(&clean_store, "fixtures"));
}

#[test_log::test(tokio::test)]
async fn test_cancellation_interrupts_between_batches() {
    let cancel = CancelFlag::new();
    let fetcher = ScriptedFetcher::new()
        .with_fixture_events(1..=9, 1)
        .cancel_after_batches(1, cancel.clone());
    let store = MemoryDatastore::new();
    seed_fixtures(&store, 1..=9, 8);
    let checkpoints = MemoryCheckpointStore::new();

    let summary = Pipeline::new(&fetcher, &store, &checkpoints, PipelineOptions::default())
        .with_cancel(cancel)
        .run_enrichment(&stored_events_job())
        .await;

    assert_eq!(summary.state, RunState::Interrupted);
    assert!(!summary.is_failure());
    assert_eq!(summary.batches_succeeded, 1);
    let checkpoint = events_checkpoint(&checkpoints).await.unwrap();
    assert_eq!(checkpoint.resume_cursor(), Some(Cursor::AfterId(3)));

    let fresh = ScriptedFetcher::new().with_fixture_events(1..=9, 1);
    Pipeline::new(&fresh, &store, &checkpoints, PipelineOptions::default())
        .run_enrichment(&stored_events_job())
        .await;
    assert_eq!(fresh.batches_requested(), vec![vec![4, 5, 6], vec![7, 8, 9]]);
}

#[test_log::test(tokio::test)]
async fn test_missing_ids_are_counted() {
    let fetcher = ScriptedFetcher::new().with_fixture_events([1, 2, 4], 1);
    let store = MemoryDatastore::new();
    seed_fixtures(&store, 1..=4, 8);
    let checkpoints = MemoryCheckpointStore::new();

    let summary = Pipeline::new(&fetcher, &store, &checkpoints, PipelineOptions::default())
        .run_enrichment(&events_job([1, 2, 3, 4]))
        .await;

    assert_eq!(summary.ids_not_returned, 1);
    assert_eq!(summary.batches_succeeded, 2);
    assert_eq!(summary.parents_flagged, 3);
    assert!(store.get("fixtures", 3).unwrap()["has_events"].is_null());
}

#[test_log::test(tokio::test)]
async fn test_empty_run_is_not_a_failure() {
    let fetcher = ScriptedFetcher::new();
    let store = MemoryDatastore::new();
    let checkpoints = MemoryCheckpointStore::new();

    let summary = Pipeline::new(&fetcher, &store, &checkpoints, PipelineOptions::default())
        .run_enrichment(&events_job([]))
        .await;

    assert_eq!(summary.state, RunState::Done);
    assert_eq!(summary.batches_attempted, 0);
    assert!(!summary.is_failure());
}

#[test_log::test(tokio::test)]
async fn test_stored_candidates_only_missing() {
    let fetcher = ScriptedFetcher::new().with_fixture_events(1..=6, 1);
    let store = MemoryDatastore::new();
    store.seed(
        "fixtures",
        NATURAL_KEY,
        [
            fixture_row(1, 8, json!(true)),
            fixture_row(2, 8, json!(null)),
            fixture_row(3, 8, json!(false)),
            fixture_row(4, 564, json!(null)),
            fixture_row(5, 8, json!(null)),
        ],
    );
    let checkpoints = MemoryCheckpointStore::new();

    let job = EnrichmentJob {
        candidates: Candidates::Stored {
            league_id: Some(8),
            season_id: None,
            only_missing: true,
        },
        ..events_job([])
    };
    let summary = Pipeline::new(&fetcher, &store, &checkpoints, PipelineOptions::default())
        .run_enrichment(&job)
        .await;

    assert_eq!(fetcher.batches_requested(), vec![vec![2, 5]]);
    assert_eq!(summary.parents_flagged, 2);
    // Flags only touch the flag column.
    assert_eq!(store.get("fixtures", 2).unwrap()["league_id"], json!(8));
    assert_eq!(store.get("fixtures", 2).unwrap()["has_events"], json!(true));
    assert!(checkpoints.load(EntityType::Event, "league-8.missing").await.unwrap().is_some());
}

#[test_log::test(tokio::test)]
async fn test_row_failure_is_counted_and_others_saved() {
    let fetcher = ScriptedFetcher::new().with_fixture_events([1], 3);
    // Event ids are fixture_id * 100 + n.
    let store = FlakyDatastore::new().reject_key(101);
    seed_fixtures(&store.inner, [1], 8);
    let checkpoints = MemoryCheckpointStore::new();

    let summary = Pipeline::new(&fetcher, &store, &checkpoints, PipelineOptions::default())
        .run_enrichment(&events_job([1]))
        .await;

    assert_eq!(summary.batches_succeeded, 1);
    assert_eq!(summary.report.errored, 1);
    assert_eq!(summary.report.inserted, 2);
    assert_eq!(store.inner.rows("fixture_events").len(), 2);
}

#[test_log::test(tokio::test)]
async fn test_datastore_failure_errors_only_that_batch() {
    let fetcher = ScriptedFetcher::new().with_fixture_events(1..=6, 1);
    // Upsert call 0 is batch 1's events, call 1 batch 2's.
    let store = FlakyDatastore::new().fail_upsert_call(1);
    seed_fixtures(&store.inner, 1..=6, 8);
    let checkpoints = MemoryCheckpointStore::new();

    let summary = Pipeline::new(&fetcher, &store, &checkpoints, PipelineOptions::default())
        .run_enrichment(&stored_events_job())
        .await;

    assert_eq!(summary.batches_errored, 1);
    assert_eq!(summary.batches_succeeded, 1);
    assert_eq!(summary.state, RunState::Done);
    assert_eq!(events_checkpoint(&checkpoints).await.unwrap().cursor, Cursor::AfterId(3));
}

#[test_log::test(tokio::test)]
async fn test_paged_entity_cannot_be_enriched() {
    let fetcher = ScriptedFetcher::new();
    let store = MemoryDatastore::new();
    let checkpoints = MemoryCheckpointStore::new();

    let job = EnrichmentJob {
        entity_type: EntityType::Team,
        ..events_job([1])
    };
    let summary = Pipeline::new(&fetcher, &store, &checkpoints, PipelineOptions::default())
        .run_enrichment(&job)
        .await;
    assert_eq!(summary.state, RunState::Aborted);
    assert_eq!(fetcher.batch_call_count(), 0);
}
