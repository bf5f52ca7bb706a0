//! esload
//!
//! Streaming bulk ingestion of CSV files into Elasticsearch.
//!
//! # Overview
//!
//! - **Record source** ([`source`]): lazy CSV reader plus a cheap row-count estimate
//! - **Action mapping** ([`action`]): record to index-write action
//! - **Connection management** ([`connection`]): host resolution and a health-checked handle
//! - **Bulk ingestion** ([`ingestor`]): batching, bounded concurrency, per-document retry
//! - **Tracking** ([`tracker`]): progress display and the final [`RunSummary`]
//! - **Pipeline** ([`pipeline`]): wires the above together for one run
//!
//! # Example
//!
//! ```no_run
//! use esload::{IngestConfig, Pipeline, StaticHost};
//!
//! # async fn example() -> esload::Result<()> {
//! let config = IngestConfig::new("people.csv", "people");
//! let summary = Pipeline::new(config).run(StaticHost::new("localhost")).await?;
//! println!("{summary}");
//! # Ok(())
//! # }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod action;
pub mod cli;
pub mod config;
pub mod connection;
pub mod error;
pub mod ingestor;
pub mod pipeline;
pub mod progress;
pub mod source;
pub mod store;
pub mod tracker;

// Re-export commonly used types
pub use action::{Action, ActionMapper};
pub use cli::Cli;
pub use config::{BulkSettings, ConnectionConfig, Credentials, IngestConfig, Scheme};
pub use connection::{ConnectionHandle, ConnectionManager, HostResolver, LocalHostname, StaticHost, Unavailable};
pub use error::{FailureCause, IngestError, Result};
pub use ingestor::{BulkIngestor, Outcome};
pub use pipeline::{write_report, Pipeline};
pub use source::{estimate_rows, ExpectedTotal, Record, RecordSource, RowDefect};
pub use store::{BulkStore, ElasticsearchStore, ItemStatus, StoreError};
pub use tracker::{FailedAction, ProgressTracker, RunSummary};
