//! One ingestion run, end to end
//!
//! ```text
//! RecordSource ──(blocking thread)──► ActionMapper ──mpsc──► BulkIngestor ──► ProgressTracker
//! ```
//!
//! The source is read on a blocking thread feeding a bounded channel, so a
//! slow store throttles reading instead of growing memory.

use std::io::Read;
use std::path::Path;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::action::{Action, ActionMapper};
use crate::config::IngestConfig;
use crate::connection::{ConnectionHandle, ConnectionManager, HostResolver};
use crate::error::{IngestError, Result};
use crate::ingestor::BulkIngestor;
use crate::source::{estimate_rows, ExpectedTotal, RecordSource};
use crate::tracker::{ProgressTracker, RunSummary};

/// Configured ingestion run
#[derive(Debug, Clone)]
pub struct Pipeline {
    config: IngestConfig,
    cancel: CancellationToken,
    show_progress: bool,
}

impl Pipeline {
    pub fn new(config: IngestConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
            show_progress: false,
        }
    }

    /// Cancelling `token` stops new batches from starting
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Draw a progress indicator on stderr
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Connect through `resolver`, then run
    ///
    /// Nothing is read from the source unless the connection succeeds.
    pub async fn run<R: HostResolver>(&self, resolver: R) -> Result<RunSummary> {
        self.config.validate()?;

        let manager = ConnectionManager::new(
            self.config.connection.clone(),
            resolver,
            self.config.bulk.request_timeout,
        );
        let handle = manager.connect().await?;
        self.run_with(handle).await
    }

    /// Run over an already established connection
    pub async fn run_with(&self, handle: ConnectionHandle) -> Result<RunSummary> {
        self.config.validate()?;

        let source = RecordSource::open(&self.config.source_path)?;

        let estimate_path = self.config.source_path.clone();
        let expected = tokio::task::spawn_blocking(move || estimate_rows(estimate_path))
            .await
            .unwrap_or_default();
        info!(expected = %expected, "Estimated row count");

        self.run_source(handle, source, expected).await
    }

    /// Run an already opened source; the configured source path is not read
    #[instrument(
        skip_all,
        fields(
            source = %source.path().display(),
            destination = %self.config.destination,
            endpoint = %handle.endpoint(),
        )
    )]
    pub async fn run_source<R>(
        &self,
        handle: ConnectionHandle,
        source: RecordSource<R>,
        expected: ExpectedTotal,
    ) -> Result<RunSummary>
    where
        R: Read + Send + 'static,
    {
        self.config.validate()?;

        if self.config.create_destination {
            match handle.ensure_destination(&self.config.destination).await {
                Ok(true) => info!(index = %self.config.destination, "Created destination index"),
                Ok(false) => debug!(index = %self.config.destination, "Destination index already exists"),
                Err(err) => {
                    warn!(index = %self.config.destination, error = %err, "Could not create destination index")
                },
            }
        }

        let tracker = if self.show_progress {
            ProgressTracker::new(expected)
        } else {
            ProgressTracker::hidden(expected)
        };

        let (tx, rx) = mpsc::channel(self.config.bulk.batch_size.max(1));
        let mapper = ActionMapper::new(self.config.destination.as_str());
        let feeder = tokio::task::spawn_blocking(move || feed(source, mapper, tx));

        let outcomes = BulkIngestor::new(handle, self.config.bulk.clone())
            .with_cancellation(self.cancel.clone())
            .ingest(ReceiverStream::new(rx));

        let mut summary = tracker.consume(outcomes).await;

        let fed = match feeder.await {
            Ok(fed) => fed,
            Err(err) => FeedReport {
                sent: summary.attempted,
                error: Some(format!("source reader stopped unexpectedly: {err}")),
            },
        };
        summary.source_error = fed.error;
        summary.unresolved = fed.sent.saturating_sub(summary.attempted);
        if summary.unresolved > 0 {
            error!(
                sent = fed.sent,
                resolved = summary.attempted,
                "Ingestor stopped before resolving every action"
            );
        }

        Ok(summary)
    }
}

/// What the feeder thread handed to the ingestor
#[derive(Debug)]
struct FeedReport {
    sent: u64,
    /// The read error that ended the source, if any
    error: Option<String>,
}

/// Map every record onto the channel until the source ends or the ingestor stops taking actions
fn feed<R: Read>(source: RecordSource<R>, mapper: ActionMapper, tx: mpsc::Sender<Action>) -> FeedReport {
    let mut sent = 0u64;
    for item in source {
        match item {
            Ok(record) => {
                if tx.blocking_send(mapper.map(record)).is_err() {
                    debug!(sent, "Ingestor stopped accepting actions");
                    break;
                }
                sent += 1;
            },
            Err(err) => {
                warn!(line = err.line, error = %err.message, "Source stopped early");
                return FeedReport {
                    sent,
                    error: Some(err.to_string()),
                };
            },
        }
    }
    FeedReport { sent, error: None }
}

/// Write `summary` as pretty JSON to `path`
pub fn write_report(summary: &RunSummary, path: &Path) -> Result<()> {
    let report_error = |source| IngestError::Report {
        path: path.to_path_buf(),
        source,
    };

    let json = serde_json::to_vec_pretty(summary).map_err(|e| report_error(std::io::Error::other(e)))?;
    std::fs::write(path, json).map_err(report_error)?;

    info!(path = %path.display(), "Wrote run report");
    Ok(())
}
