//! Error types for esload
//!
//! Two families live here and they never mix:
//!
//! - [`IngestError`]: fatal conditions detected before any document is
//!   submitted. They abort the run and reach the caller as `Err`.
//! - [`FailureCause`]: per-document conditions. They are data carried by
//!   [`crate::Outcome::Failure`] and never abort a run.

use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

use crate::connection::Unavailable;

/// Result type alias for esload operations
pub type Result<T> = std::result::Result<T, IngestError>;

/// Fatal, pre-run errors
#[derive(Error, Debug)]
pub enum IngestError {
    /// The source path does not resolve to a readable file
    #[error("Source file not found: '{}'. Verify the path exists and is readable.", .path.display())]
    SourceNotFound {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The header line is missing or unusable
    #[error("Malformed source '{}': {reason}", .path.display())]
    MalformedSource { path: PathBuf, reason: String },

    /// No connection handle could be obtained
    #[error("Search engine unavailable: {0}. Check the host, port and credentials.")]
    ConnectionUnavailable(#[from] Unavailable),

    /// Configuration is missing or invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// The run report could not be written
    #[error("Failed to write report to '{}': {source}", .path.display())]
    Report {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl IngestError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub(crate) fn malformed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::MalformedSource {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Why a single document did not make it into the index
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureCause {
    /// The row's field count differs from the header's
    #[error("row has {found} fields, header has {expected}")]
    RowShapeMismatch { expected: usize, found: usize },

    /// The store refused the write
    #[error("{}", describe_rejection(.status, .reason, .attempts))]
    WriteRejected {
        /// HTTP-style status reported for the item, if any
        status: Option<u16>,
        reason: String,
        /// Whether the last rejection was of a retryable kind
        retryable: bool,
        /// Number of write attempts made for this document
        attempts: u32,
    },

    /// The store became unusable before this document was confirmed
    #[error("connection lost: {detail}")]
    ConnectionLost { detail: String },

    /// The run was cancelled before this document was attempted
    #[error("cancelled before the document was sent")]
    Cancelled,
}

fn describe_rejection(status: &Option<u16>, reason: &str, attempts: &u32) -> String {
    let attempts = if *attempts == 1 {
        "1 attempt".to_string()
    } else {
        format!("{attempts} attempts")
    };
    match status {
        Some(status) => format!("rejected with status {status} after {attempts}: {reason}"),
        None => format!("rejected after {attempts}: {reason}"),
    }
}

impl FailureCause {
    pub(crate) fn connection_lost(detail: impl Into<String>) -> Self {
        Self::ConnectionLost {
            detail: detail.into(),
        }
    }
}
