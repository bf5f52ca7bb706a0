//! Shared helpers for esload integration tests
//!
//! [`ScriptedStore`] is an in-memory [`BulkStore`] whose behaviour is set up
//! per test through its builder methods.

#![allow(dead_code)]

use async_trait::async_trait;
use esload::{Action, BulkSettings, BulkStore, ConnectionHandle, ItemStatus, StoreError};
use std::collections::HashSet;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
pub struct ScriptedStore {
    calls: AtomicUsize,
    submitted: AtomicUsize,
    accepted_lines: Mutex<Vec<u64>>,
    throttled_calls: usize,
    unreachable_from_call: Option<usize>,
    rejected_lines: HashSet<u64>,
    cancel_on_first_call: Option<CancellationToken>,
    panic_on_call: Option<usize>,
}

impl ScriptedStore {
    /// Accepts everything
    pub fn accepting() -> Self {
        Self::default()
    }

    /// Every item of the first `calls` requests is rejected with a retryable 429
    pub fn throttle_first(mut self, calls: usize) -> Self {
        self.throttled_calls = calls;
        self
    }

    /// Requests from call number `call` (0-based) on fail as unreachable
    pub fn unreachable_from(mut self, call: usize) -> Self {
        self.unreachable_from_call = Some(call);
        self
    }

    /// Documents from these source lines are rejected permanently
    pub fn reject_lines(mut self, lines: impl IntoIterator<Item = u64>) -> Self {
        self.rejected_lines = lines.into_iter().collect();
        self
    }

    /// Cancel `token` while the first request is in flight
    pub fn cancel_on_first_call(mut self, token: CancellationToken) -> Self {
        self.cancel_on_first_call = Some(token);
        self
    }

    /// Panic inside request number `call` (0-based)
    pub fn panic_on(mut self, call: usize) -> Self {
        self.panic_on_call = Some(call);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Documents submitted across all requests, retries included
    pub fn submitted(&self) -> usize {
        self.submitted.load(Ordering::SeqCst)
    }

    pub fn accepted_lines(&self) -> Vec<u64> {
        let mut lines = self.accepted_lines.lock().unwrap().clone();
        lines.sort_unstable();
        lines
    }
}

#[async_trait]
impl BulkStore for ScriptedStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn bulk(&self, actions: &[Action]) -> Result<Vec<ItemStatus>, StoreError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.submitted.fetch_add(actions.len(), Ordering::SeqCst);
        if self.panic_on_call == Some(call) {
            panic!("scripted store failure");
        }

        if call == 0 {
            if let Some(token) = &self.cancel_on_first_call {
                token.cancel();
            }
        }
        if matches!(self.unreachable_from_call, Some(from) if call >= from) {
            return Err(StoreError::Unreachable("connection refused".to_string()));
        }

        let statuses: Vec<ItemStatus> = actions
            .iter()
            .map(|action| {
                if call < self.throttled_calls {
                    ItemStatus::rejected(Some(429), "es_rejected_execution_exception", true)
                } else if self.rejected_lines.contains(&action.line()) {
                    ItemStatus::rejected(Some(400), "mapper_parsing_exception", false)
                } else {
                    ItemStatus::Accepted
                }
            })
            .collect();

        let mut accepted = self.accepted_lines.lock().unwrap();
        for (action, status) in actions.iter().zip(&statuses) {
            if *status == ItemStatus::Accepted {
                accepted.push(action.line());
            }
        }
        Ok(statuses)
    }

    fn endpoint(&self) -> String {
        "mem://scripted".to_string()
    }
}

pub async fn handle(store: Arc<ScriptedStore>) -> ConnectionHandle {
    ConnectionHandle::probe(store, Duration::from_secs(1)).await.unwrap()
}

/// Small batches and millisecond backoff
pub fn settings(batch_size: usize, concurrency: usize) -> BulkSettings {
    BulkSettings {
        batch_size,
        concurrency,
        max_retries: 2,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(4),
        ..BulkSettings::default()
    }
}

pub fn csv_file(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

/// Header `id,name,city` followed by `rows` well-formed rows
pub fn people_csv(rows: usize) -> String {
    let mut csv = String::from("id,name,city\n");
    for i in 1..=rows {
        csv.push_str(&format!("{i},person {i},city {i}\n"));
    }
    csv
}
