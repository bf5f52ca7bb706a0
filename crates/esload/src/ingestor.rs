//! Bulk ingestor
//!
//! Drains a stream of [`Action`]s into the store in batches and yields exactly
//! one [`Outcome`] per action. One dispatcher task assembles the next batch
//! while up to `concurrency` batch writers are in flight; both the action
//! input and the outcome output are bounded channels, so memory stays bounded
//! no matter how long the source is.
//!
//! Outcomes arrive in completion order, not source order.

use futures::stream::{FuturesUnordered, Stream, StreamExt};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::action::Action;
use crate::config::BulkSettings;
use crate::connection::ConnectionHandle;
use crate::error::FailureCause;
use crate::source::RowDefect;
use crate::store::{BulkStore, ItemStatus, StoreError};

/// Resolved result of one action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success(Action),
    Failure { action: Action, cause: FailureCause },
}

impl Outcome {
    pub fn action(&self) -> &Action {
        match self {
            Outcome::Success(action) | Outcome::Failure { action, .. } => action,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn cause(&self) -> Option<&FailureCause> {
        match self {
            Outcome::Success(_) => None,
            Outcome::Failure { cause, .. } => Some(cause),
        }
    }

    fn failed(action: Action, cause: FailureCause) -> Self {
        Outcome::Failure { action, cause }
    }
}

/// Batched, retrying writer bound to one connection for one run
#[derive(Debug)]
pub struct BulkIngestor {
    store: Arc<dyn BulkStore>,
    settings: BulkSettings,
    cancel: CancellationToken,
}

impl BulkIngestor {
    pub fn new(handle: ConnectionHandle, settings: BulkSettings) -> Self {
        Self {
            store: handle.into_store(),
            settings,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop starting new batches once `token` is cancelled
    ///
    /// Requests already in flight complete; actions that were never sent
    /// resolve as [`FailureCause::Cancelled`].
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Start draining `actions`; must be called inside a tokio runtime
    ///
    /// Dropping the returned stream stops the dispatcher: no new batch is
    /// started, and requests already in flight run to completion with their
    /// outcomes discarded. A writer that panics fails its whole batch as a
    /// connection loss and halts the run like one.
    pub fn ingest<S>(self, actions: S) -> ReceiverStream<Outcome>
    where
        S: Stream<Item = Action> + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::channel(self.settings.batch_size.max(1));
        tokio::spawn(dispatch(self, actions, tx));
        ReceiverStream::new(rx)
    }
}

async fn dispatch<S>(ingestor: BulkIngestor, actions: S, tx: mpsc::Sender<Outcome>)
where
    S: Stream<Item = Action> + Send + Unpin,
{
    let BulkIngestor {
        store,
        settings,
        cancel,
    } = ingestor;

    info!(
        batch_size = settings.batch_size,
        max_batch_bytes = settings.max_batch_bytes,
        concurrency = settings.concurrency,
        max_retries = settings.max_retries,
        "Starting bulk ingestion"
    );

    let concurrency = settings.concurrency.max(1);
    let mut batcher = Batcher::new(actions, settings.batch_size, settings.max_batch_bytes);
    let writer = Arc::new(BatchWriter {
        store,
        settings,
        cancel: cancel.clone(),
    });

    let mut in_flight = FuturesUnordered::new();
    let mut halt: Option<FailureCause> = None;
    let mut exhausted = false;
    let mut closed = false;
    let mut started = 0u64;

    loop {
        let can_start = halt.is_none() && !exhausted && in_flight.len() < concurrency;
        if in_flight.is_empty() && !can_start {
            break;
        }

        tokio::select! {
            biased;

            Some(report) = in_flight.next(), if !in_flight.is_empty() => {
                let BatchReport { outcomes, lost } = report;
                if let Some(detail) = lost {
                    if halt.is_none() {
                        warn!(error = %detail, "Connection lost; no further batches will be sent");
                        halt = Some(FailureCause::connection_lost(detail));
                    }
                }
                if !forward(&tx, outcomes).await {
                    closed = true;
                    break;
                }
            }

            _ = cancel.cancelled(), if can_start => {
                info!(batches = started, "Cancellation requested; no further batches will be sent");
                halt = Some(FailureCause::Cancelled);
            }

            batch = batcher.next_batch(), if can_start => {
                match batch {
                    None => exhausted = true,
                    Some(batch) => {
                        started += 1;
                        debug!(batch = started, actions = batch.len(), "Dispatching batch");
                        let writer = Arc::clone(&writer);
                        let number = started;
                        let fallback = batch.clone();
                        in_flight.push(async move {
                            AssertUnwindSafe(writer.write(number, batch))
                                .catch_unwind()
                                .await
                                .unwrap_or_else(|panic| BatchReport::panicked(number, fallback, &*panic))
                        });
                    }
                }
            }
        }
    }

    if closed {
        if !in_flight.is_empty() {
            debug!(batches = in_flight.len(), "Finishing in-flight batches");
        }
        while in_flight.next().await.is_some() {}
        return;
    }

    if let Some(cause) = halt {
        let mut unsent = 0u64;
        while let Some(batch) = batcher.next_batch().await {
            unsent += batch.len() as u64;
            let outcomes = batch
                .into_iter()
                .map(|action| Outcome::failed(action, cause.clone()))
                .collect();
            if !forward(&tx, outcomes).await {
                return;
            }
        }
        if unsent > 0 {
            warn!(actions = unsent, cause = %cause, "Actions resolved without being sent");
        }
    }

    info!(batches = started, "Bulk ingestion finished");
}

/// Send outcomes downstream; false once the receiver is gone
async fn forward(tx: &mpsc::Sender<Outcome>, outcomes: Vec<Outcome>) -> bool {
    for outcome in outcomes {
        if tx.send(outcome).await.is_err() {
            debug!("Outcome receiver dropped; stopping dispatcher");
            return false;
        }
    }
    true
}

/// Groups actions into batches bounded by count and estimated bytes
///
/// All state lives in the struct, so dropping a pending `next_batch` future
/// loses nothing.
struct Batcher<S> {
    actions: S,
    batch_size: usize,
    max_bytes: usize,
    pending: Vec<Action>,
    pending_bytes: usize,
    carry: Option<Action>,
    exhausted: bool,
}

impl<S> Batcher<S>
where
    S: Stream<Item = Action> + Unpin,
{
    fn new(actions: S, batch_size: usize, max_bytes: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            actions,
            batch_size,
            max_bytes,
            pending: Vec::with_capacity(batch_size),
            pending_bytes: 0,
            carry: None,
            exhausted: false,
        }
    }

    fn push(&mut self, action: Action, size: usize) {
        self.pending_bytes += size;
        self.pending.push(action);
    }

    fn take(&mut self) -> Vec<Action> {
        self.pending_bytes = 0;
        std::mem::replace(&mut self.pending, Vec::with_capacity(self.batch_size))
    }

    async fn next_batch(&mut self) -> Option<Vec<Action>> {
        if let Some(action) = self.carry.take() {
            let size = action.estimated_size();
            self.push(action, size);
        }

        loop {
            if self.pending.len() >= self.batch_size || self.pending_bytes >= self.max_bytes {
                return Some(self.take());
            }
            if self.exhausted {
                return (!self.pending.is_empty()).then(|| self.take());
            }

            match self.actions.next().await {
                None => self.exhausted = true,
                Some(action) => {
                    let size = action.estimated_size();
                    if !self.pending.is_empty() && self.pending_bytes + size > self.max_bytes {
                        // oversized actions end up alone in their own batch
                        self.carry = Some(action);
                        return Some(self.take());
                    }
                    self.push(action, size);
                },
            }
        }
    }
}

struct BatchReport {
    outcomes: Vec<Outcome>,
    /// Set when the store became unusable during this batch
    lost: Option<String>,
}

impl BatchReport {
    /// Resolve a batch whose writer panicked
    ///
    /// Whatever the writer had resolved before panicking is lost with it, so
    /// every sendable action of the batch fails as a connection loss.
    fn panicked(number: u64, batch: Vec<Action>, panic: &(dyn Any + Send)) -> Self {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_string());
        let detail = format!("bulk writer panicked: {message}");
        error!(batch = number, error = %detail, "Bulk writer panicked");

        let outcomes = batch
            .into_iter()
            .map(|action| {
                let cause = match action.defect() {
                    Some(RowDefect { expected, found }) => FailureCause::RowShapeMismatch { expected, found },
                    None => FailureCause::connection_lost(detail.clone()),
                };
                Outcome::failed(action, cause)
            })
            .collect();
        BatchReport {
            outcomes,
            lost: Some(detail),
        }
    }
}

#[derive(Debug)]
struct BatchWriter {
    store: Arc<dyn BulkStore>,
    settings: BulkSettings,
    cancel: CancellationToken,
}

impl BatchWriter {
    async fn write(&self, number: u64, batch: Vec<Action>) -> BatchReport {
        let mut outcomes = Vec::with_capacity(batch.len());
        let mut pending = Vec::with_capacity(batch.len());
        for action in batch {
            match action.defect() {
                Some(RowDefect { expected, found }) => outcomes.push(Outcome::failed(
                    action,
                    FailureCause::RowShapeMismatch { expected, found },
                )),
                None => pending.push(action),
            }
        }

        let mut attempt = 0u32;
        while !pending.is_empty() {
            attempt += 1;

            let statuses = match self.send(&pending).await {
                Ok(statuses) => statuses,
                Err(err) if err.is_connection_loss() => {
                    let detail = err.to_string();
                    warn!(batch = number, error = %detail, "Bulk request failed");
                    outcomes.extend(
                        pending
                            .drain(..)
                            .map(|action| Outcome::failed(action, FailureCause::connection_lost(detail.clone()))),
                    );
                    return BatchReport {
                        outcomes,
                        lost: Some(detail),
                    };
                },
                Err(err) => {
                    warn!(batch = number, error = %err, "Bulk request rejected");
                    let cause = FailureCause::WriteRejected {
                        status: rejected_status(&err),
                        reason: err.to_string(),
                        retryable: false,
                        attempts: attempt,
                    };
                    outcomes.extend(pending.drain(..).map(|action| Outcome::failed(action, cause.clone())));
                    break;
                },
            };

            let mut retry = Vec::new();
            for (action, status) in pending.drain(..).zip(statuses) {
                match status {
                    ItemStatus::Accepted => outcomes.push(Outcome::Success(action)),
                    ItemStatus::Rejected {
                        status,
                        reason,
                        retryable: true,
                    } if attempt <= self.settings.max_retries => retry.push((action, status, reason)),
                    ItemStatus::Rejected {
                        status,
                        reason,
                        retryable,
                    } => outcomes.push(Outcome::failed(
                        action,
                        FailureCause::WriteRejected {
                            status,
                            reason,
                            retryable,
                            attempts: attempt,
                        },
                    )),
                }
            }
            if retry.is_empty() {
                break;
            }

            let delay = self.settings.backoff(attempt);
            debug!(
                batch = number,
                actions = retry.len(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Retrying rejected actions"
            );

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    outcomes.extend(retry.into_iter().map(|(action, status, reason)| {
                        Outcome::failed(
                            action,
                            FailureCause::WriteRejected {
                                status,
                                reason,
                                retryable: true,
                                attempts: attempt,
                            },
                        )
                    }));
                    break;
                }
                _ = tokio::time::sleep(delay) => {
                    pending = retry.into_iter().map(|(action, _, _)| action).collect();
                }
            }
        }

        BatchReport {
            outcomes,
            lost: None,
        }
    }

    /// One bulk request bounded by the request timeout
    async fn send(&self, actions: &[Action]) -> Result<Vec<ItemStatus>, StoreError> {
        let timeout = self.settings.request_timeout;
        let statuses = tokio::time::timeout(timeout, self.store.bulk(actions))
            .await
            .map_err(|_| StoreError::Timeout { after: timeout })??;

        if statuses.len() != actions.len() {
            return Err(StoreError::Protocol(format!(
                "store returned {} statuses for {} actions",
                statuses.len(),
                actions.len()
            )));
        }
        Ok(statuses)
    }
}

fn rejected_status(err: &StoreError) -> Option<u16> {
    match err {
        StoreError::Status { status, .. } | StoreError::Unhealthy { status } => Some(*status),
        _ => None,
    }
}
