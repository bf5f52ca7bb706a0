//! End-to-end ingestion scenarios against an in-memory store
//!
//! Each test runs the full pipeline: CSV file, mapper, bulk ingestor and
//! tracker, with [`common::ScriptedStore`] standing in for Elasticsearch.

mod common;

use common::{csv_file, handle, people_csv, settings, ScriptedStore};
use esload::{ExpectedTotal, FailureCause, IngestConfig, IngestError, Pipeline, RecordSource, StaticHost};
use proptest::prelude::*;
use std::io::{Cursor, Read};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn config(path: &std::path::Path, batch_size: usize, concurrency: usize) -> IngestConfig {
    let mut config = IngestConfig::new(path, "people");
    config.bulk = settings(batch_size, concurrency);
    config
}

// ============================================================================
// Happy Path
// ============================================================================

#[tokio::test]
async fn test_five_good_rows_all_succeed() {
    let file = csv_file(&people_csv(5));
    let store = Arc::new(ScriptedStore::accepting());

    let summary = Pipeline::new(config(file.path(), 2, 2))
        .run_with(handle(store.clone()).await)
        .await
        .unwrap();

    assert_eq!(summary.attempted, 5);
    assert_eq!(summary.succeeded, 5);
    assert_eq!(summary.failed, 0);
    assert!(summary.failures.is_empty());
    assert_eq!(store.accepted_lines(), vec![2, 3, 4, 5, 6]);
    assert_eq!(store.calls(), 3);
}

#[tokio::test]
async fn test_header_only_file_produces_empty_summary() {
    let file = csv_file("id,name,city\n");
    let store = Arc::new(ScriptedStore::accepting());

    let summary = Pipeline::new(config(file.path(), 10, 1))
        .run_with(handle(store.clone()).await)
        .await
        .unwrap();

    assert_eq!(summary.attempted, 0);
    assert_eq!(summary.succeeded, 0);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.expected.known(), Some(0));
    assert_eq!(store.calls(), 0);
}

// ============================================================================
// Fatal Errors
// ============================================================================

#[tokio::test]
async fn test_unreachable_store_fails_before_any_action() {
    let file = csv_file(&people_csv(3));
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let mut config = config(file.path(), 10, 1);
    config.connection.port = port;
    config.connection.connect_timeout = Duration::from_secs(2);

    let err = Pipeline::new(config)
        .run(StaticHost::new("127.0.0.1"))
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::ConnectionUnavailable(_)), "got {err}");
}

#[tokio::test]
async fn test_missing_source_is_fatal() {
    let store = Arc::new(ScriptedStore::accepting());
    let err = Pipeline::new(IngestConfig::new("/no/such/people.csv", "people"))
        .run_with(handle(store.clone()).await)
        .await
        .unwrap_err();

    assert!(matches!(err, IngestError::SourceNotFound { .. }));
    assert_eq!(store.calls(), 0);
}

// ============================================================================
// Per-Document Failures
// ============================================================================

#[tokio::test]
async fn test_short_row_fails_alone() {
    let file = csv_file("id,name,city\n1,a,x\n2,b,y\n3,c\n4,d,z\n5,e,w\n");
    let store = Arc::new(ScriptedStore::accepting());

    let summary = Pipeline::new(config(file.path(), 10, 1))
        .run_with(handle(store.clone()).await)
        .await
        .unwrap();

    assert_eq!(summary.attempted, 5);
    assert_eq!(summary.succeeded, 4);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].line, 4);
    assert_eq!(summary.failures[0].action.record().get("id"), Some("3"));
    assert_eq!(
        summary.failures[0].cause,
        FailureCause::RowShapeMismatch {
            expected: 3,
            found: 2
        }
    );
    // the defective row is never sent
    assert_eq!(store.submitted(), 4);
}

#[tokio::test]
async fn test_permanent_rejection_does_not_stop_the_run() {
    let file = csv_file(&people_csv(6));
    let store = Arc::new(ScriptedStore::accepting().reject_lines([3]));

    let summary = Pipeline::new(config(file.path(), 2, 2))
        .run_with(handle(store.clone()).await)
        .await
        .unwrap();

    assert_eq!(summary.succeeded, 5);
    assert_eq!(summary.failed, 1);
    assert!(matches!(
        summary.failures[0].cause,
        FailureCause::WriteRejected {
            status: Some(400),
            retryable: false,
            attempts: 1,
            ..
        }
    ));
}

// ============================================================================
// Retries
// ============================================================================

#[tokio::test]
async fn test_retryable_rejection_then_success() {
    let file = csv_file(&people_csv(3));
    let store = Arc::new(ScriptedStore::accepting().throttle_first(1));

    let summary = Pipeline::new(config(file.path(), 10, 1))
        .run_with(handle(store.clone()).await)
        .await
        .unwrap();

    assert_eq!(summary.succeeded, 3);
    assert_eq!(summary.failed, 0);
    assert_eq!(store.calls(), 2);
    assert_eq!(store.submitted(), 6);
}

#[tokio::test]
async fn test_persistent_retryable_rejection_exhausts_budget() {
    let file = csv_file(&people_csv(2));
    let store = Arc::new(ScriptedStore::accepting().throttle_first(usize::MAX));

    let summary = Pipeline::new(config(file.path(), 10, 1))
        .run_with(handle(store.clone()).await)
        .await
        .unwrap();

    assert_eq!(summary.attempted, 2);
    assert_eq!(summary.failed, 2);
    // one attempt plus max_retries (2)
    assert_eq!(store.calls(), 3);
    for failure in &summary.failures {
        assert!(matches!(
            failure.cause,
            FailureCause::WriteRejected {
                status: Some(429),
                retryable: true,
                attempts: 3,
                ..
            }
        ));
    }
}

#[tokio::test]
async fn test_cancellation_during_backoff_rejects_waiting_actions() {
    let file = csv_file(&people_csv(3));
    let cancel = CancellationToken::new();
    let store = Arc::new(
        ScriptedStore::accepting()
            .throttle_first(usize::MAX)
            .cancel_on_first_call(cancel.clone()),
    );

    let mut config = config(file.path(), 10, 1);
    config.bulk.max_retries = 5;
    config.bulk.initial_backoff = Duration::from_secs(60);
    config.bulk.max_backoff = Duration::from_secs(60);

    let summary = Pipeline::new(config)
        .with_cancellation(cancel)
        .run_with(handle(store.clone()).await)
        .await
        .unwrap();

    assert_eq!(store.calls(), 1);
    assert_eq!(summary.attempted, 3);
    assert_eq!(summary.failed, 3);
    for failure in &summary.failures {
        assert!(matches!(
            failure.cause,
            FailureCause::WriteRejected {
                status: Some(429),
                retryable: true,
                attempts: 1,
                ..
            }
        ));
    }
    // every action was sent once, so none resolved as cancelled
    assert!(!summary.cancelled);
}

// ============================================================================
// Connection Loss and Cancellation
// ============================================================================

#[tokio::test]
async fn test_connection_loss_fails_remaining_actions() {
    let file = csv_file(&people_csv(5));
    let store = Arc::new(ScriptedStore::accepting().unreachable_from(2));

    let summary = Pipeline::new(config(file.path(), 1, 1))
        .run_with(handle(store.clone()).await)
        .await
        .unwrap();

    assert_eq!(summary.attempted, 5);
    assert_eq!(summary.succeeded, 2);
    assert!(summary.failed >= 3);
    assert_eq!(store.accepted_lines(), vec![2, 3]);
    assert!(summary
        .failures
        .iter()
        .all(|f| matches!(f.cause, FailureCause::ConnectionLost { .. })));
    // no batch is started after the loss is seen
    assert_eq!(store.calls(), 3);
}

#[tokio::test]
async fn test_cancellation_after_first_batch() {
    let file = csv_file(&people_csv(6));
    let cancel = CancellationToken::new();
    let store = Arc::new(ScriptedStore::accepting().cancel_on_first_call(cancel.clone()));

    let summary = Pipeline::new(config(file.path(), 2, 1))
        .with_cancellation(cancel)
        .run_with(handle(store.clone()).await)
        .await
        .unwrap();

    assert!(summary.cancelled);
    assert_eq!(summary.attempted, 6);
    assert_eq!(summary.succeeded, 2);
    assert_eq!(store.accepted_lines(), vec![2, 3]);
    assert_eq!(store.calls(), 1);

    let cancelled_lines: Vec<u64> = summary.failures.iter().map(|f| f.line).collect();
    assert_eq!(cancelled_lines.len(), 4);
    assert!(summary
        .failures
        .iter()
        .all(|f| f.cause == FailureCause::Cancelled));
}

#[tokio::test]
async fn test_cancel_after_last_batch_leaves_run_uncancelled() {
    let file = csv_file(&people_csv(2));
    let cancel = CancellationToken::new();
    let store = Arc::new(ScriptedStore::accepting().cancel_on_first_call(cancel.clone()));

    let summary = Pipeline::new(config(file.path(), 10, 1))
        .with_cancellation(cancel.clone())
        .run_with(handle(store.clone()).await)
        .await
        .unwrap();

    assert!(cancel.is_cancelled());
    assert!(!summary.cancelled);
    assert_eq!(summary.succeeded, 2);
    assert!(summary.is_clean());
}

#[tokio::test]
async fn test_cancelled_token_with_nothing_to_send() {
    let file = csv_file("id,name,city\n");
    let cancel = CancellationToken::new();
    cancel.cancel();

    let summary = Pipeline::new(config(file.path(), 10, 1))
        .with_cancellation(cancel)
        .run_with(handle(Arc::new(ScriptedStore::accepting())).await)
        .await
        .unwrap();

    assert_eq!(summary.attempted, 0);
    assert!(!summary.cancelled);
}

#[tokio::test]
async fn test_panicking_store_fails_the_rest_of_the_run() {
    let file = csv_file(&people_csv(5));
    let store = Arc::new(ScriptedStore::accepting().panic_on(1));

    let summary = Pipeline::new(config(file.path(), 1, 1))
        .run_with(handle(store.clone()).await)
        .await
        .unwrap();

    assert_eq!(summary.attempted, 5);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 4);
    assert_eq!(summary.unresolved, 0);
    assert!(!summary.is_clean());
    assert_eq!(store.calls(), 2);
    for failure in &summary.failures {
        match &failure.cause {
            FailureCause::ConnectionLost { detail } => {
                assert_eq!(detail, "bulk writer panicked: scripted store failure")
            },
            other => panic!("expected connection loss, got {other}"),
        }
    }
}

// ============================================================================
// Source Read Errors
// ============================================================================

/// Serves `data`, then fails every read
struct FailsAfter(Cursor<Vec<u8>>);

impl Read for FailsAfter {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self.0.read(buf)? {
            0 => Err(std::io::Error::other("device went away")),
            n => Ok(n),
        }
    }
}

#[tokio::test]
async fn test_read_error_ends_source_and_is_recorded() {
    let input = FailsAfter(Cursor::new(people_csv(2).into_bytes()));
    let source = RecordSource::from_reader("people.csv", input).unwrap();
    let store = Arc::new(ScriptedStore::accepting());

    let summary = Pipeline::new(config(std::path::Path::new("people.csv"), 10, 1))
        .run_source(handle(store.clone()).await, source, ExpectedTotal::Unknown)
        .await
        .unwrap();

    assert_eq!(summary.attempted, 2);
    assert_eq!(summary.succeeded, 2);
    assert_eq!(store.accepted_lines(), vec![2, 3]);
    let error = summary.source_error.as_deref().unwrap();
    assert!(error.contains("device went away"), "got {error}");
    assert!(!summary.is_clean());
}

// ============================================================================
// Counting Invariant
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_every_row_is_accounted_for(
        rows in 0usize..60,
        batch_size in 1usize..8,
        concurrency in 1usize..4,
        short_every in 2usize..9,
        reject_every in 3u64..11,
    ) {
        let mut csv = String::from("id,name,city\n");
        for i in 1..=rows {
            if i % short_every == 0 {
                csv.push_str(&format!("{i},short\n"));
            } else {
                csv.push_str(&format!("{i},person {i},city {i}\n"));
            }
        }
        let file = csv_file(&csv);
        let rejected = (2..rows as u64 + 2).filter(|line| line % reject_every == 0);
        let store = Arc::new(ScriptedStore::accepting().reject_lines(rejected));

        let runtime = tokio::runtime::Runtime::new().unwrap();
        let summary = runtime.block_on(async {
            Pipeline::new(config(file.path(), batch_size, concurrency))
                .run_with(handle(store.clone()).await)
                .await
                .unwrap()
        });

        prop_assert_eq!(summary.attempted, rows as u64);
        prop_assert_eq!(summary.succeeded + summary.failed, summary.attempted);
        prop_assert_eq!(summary.failures.len() as u64, summary.failed);
        prop_assert_eq!(store.accepted_lines().len() as u64, summary.succeeded);
    }
}
