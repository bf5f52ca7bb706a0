//! Progress and result tracking
//!
//! The tracker is the only place counts are updated. It ticks the progress
//! indicator once per outcome, logs failures as they happen and folds
//! everything into a [`RunSummary`].

use chrono::{DateTime, Utc};
use futures::stream::{Stream, StreamExt};
use indicatif::ProgressBar;
use serde::{Serialize, Serializer};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

use crate::action::Action;
use crate::error::FailureCause;
use crate::ingestor::Outcome;
use crate::progress::{create_progress_bar, create_spinner};
use crate::source::ExpectedTotal;

/// Failures listed by the `Display` impl before eliding the rest
const MAX_DISPLAYED_FAILURES: usize = 20;

/// One document that did not make it into the index
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedAction {
    /// Source line of the row
    pub line: u64,
    pub action: Action,
    pub cause: FailureCause,
}

/// Final accounting for one run
///
/// `attempted == succeeded + failed` holds at every point of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub expected: ExpectedTotal,
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// In the order outcomes arrived
    pub failures: Vec<FailedAction>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(rename = "elapsed_secs", serialize_with = "serialize_secs")]
    pub elapsed: Duration,
    /// Cancellation kept at least one document from being sent
    pub cancelled: bool,
    /// Set when the source stopped early on a read error
    pub source_error: Option<String>,
    /// Actions handed to the ingestor that never produced an outcome
    pub unresolved: u64,
}

fn serialize_secs<S: Serializer>(elapsed: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(elapsed.as_secs_f64())
}

impl RunSummary {
    fn new(expected: ExpectedTotal) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            expected,
            attempted: 0,
            succeeded: 0,
            failed: 0,
            failures: Vec::new(),
            started_at: now,
            finished_at: now,
            elapsed: Duration::ZERO,
            cancelled: false,
            source_error: None,
            unresolved: 0,
        }
    }

    /// True when every attempted document was indexed and nothing cut the run short
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && !self.cancelled && self.source_error.is_none() && self.unresolved == 0
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Indexed {}/{} documents ({} failed, expected {}) in {:.2}s",
            self.succeeded,
            self.attempted,
            self.failed,
            self.expected,
            self.elapsed.as_secs_f64()
        )?;
        if self.cancelled {
            writeln!(f, "Run was cancelled before the source was exhausted")?;
        }
        if let Some(error) = &self.source_error {
            writeln!(f, "Source stopped early: {error}")?;
        }
        if self.unresolved > 0 {
            writeln!(f, "{} documents were read but never resolved", self.unresolved)?;
        }
        for failure in self.failures.iter().take(MAX_DISPLAYED_FAILURES) {
            writeln!(f, "  line {}: {}", failure.line, failure.cause)?;
        }
        if self.failures.len() > MAX_DISPLAYED_FAILURES {
            writeln!(
                f,
                "  ... and {} more",
                self.failures.len() - MAX_DISPLAYED_FAILURES
            )?;
        }
        Ok(())
    }
}

/// Consumes outcomes and produces the [`RunSummary`]
pub struct ProgressTracker {
    bar: ProgressBar,
    summary: RunSummary,
    started: Instant,
}

impl ProgressTracker {
    /// Tracker with a terminal progress indicator
    pub fn new(expected: ExpectedTotal) -> Self {
        let bar = match expected {
            ExpectedTotal::Known(total) => create_progress_bar(total, "Indexing documents"),
            ExpectedTotal::Unknown => create_spinner("documents indexed (total unknown)"),
        };
        Self::with_bar(bar, expected)
    }

    /// Tracker that draws nothing
    pub fn hidden(expected: ExpectedTotal) -> Self {
        let bar = ProgressBar::hidden();
        if let ExpectedTotal::Known(total) = expected {
            bar.set_length(total);
        }
        Self::with_bar(bar, expected)
    }

    fn with_bar(bar: ProgressBar, expected: ExpectedTotal) -> Self {
        Self {
            bar,
            summary: RunSummary::new(expected),
            started: Instant::now(),
        }
    }

    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }

    /// Account for one outcome
    pub fn record(&mut self, outcome: Outcome) {
        self.summary.attempted += 1;
        match outcome {
            Outcome::Success(_) => self.summary.succeeded += 1,
            Outcome::Failure { action, cause } => {
                self.summary.failed += 1;
                if matches!(cause, FailureCause::Cancelled) {
                    self.summary.cancelled = true;
                }
                self.bar.suspend(|| {
                    warn!(
                        line = action.line(),
                        destination = action.destination(),
                        cause = %cause,
                        "Document failed"
                    )
                });
                self.summary.failures.push(FailedAction {
                    line: action.line(),
                    action,
                    cause,
                });
            },
        }

        self.bar.inc(1);
        // the estimate is advisory; grow the bar rather than overflow it
        if let Some(len) = self.bar.length() {
            if self.bar.position() > len {
                self.bar.set_length(self.bar.position());
            }
        }
    }

    /// Drain `outcomes` and return the final summary
    pub async fn consume<S>(mut self, mut outcomes: S) -> RunSummary
    where
        S: Stream<Item = Outcome> + Unpin,
    {
        while let Some(outcome) = outcomes.next().await {
            self.record(outcome);
        }
        self.finish()
    }

    pub fn finish(mut self) -> RunSummary {
        self.summary.finished_at = Utc::now();
        self.summary.elapsed = self.started.elapsed();
        self.bar.finish_with_message(format!(
            "{} indexed, {} failed",
            self.summary.succeeded, self.summary.failed
        ));

        info!(
            run_id = %self.summary.run_id,
            attempted = self.summary.attempted,
            succeeded = self.summary.succeeded,
            failed = self.summary.failed,
            elapsed_secs = self.summary.elapsed.as_secs_f64(),
            "Run finished"
        );
        self.summary
    }
}

impl fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("summary", &self.summary)
            .finish_non_exhaustive()
    }
}
