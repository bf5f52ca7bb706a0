//! Configuration for an ingestion run
//!
//! Everything a run needs is carried in one [`IngestConfig`] value that is
//! built once (by the CLI, or directly by library users) and passed down.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{IngestError, Result};

// ============================================================================
// Configuration Constants
// ============================================================================

/// Default search engine host.
pub const DEFAULT_HOST: &str = "localhost";

/// Default Elasticsearch HTTP port.
pub const DEFAULT_PORT: u16 = 9200;

/// Suffix appended to the machine hostname when discovering the host
/// (e.g. a WSL2 guest reaching the Windows side as `<hostname>.local`).
pub const DEFAULT_HOSTNAME_SUFFIX: &str = ".local";

/// Default timeout for the liveness probe, in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default timeout for each bulk request, in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

/// Default number of actions per bulk request.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Default byte budget per bulk request (100 MiB).
pub const DEFAULT_MAX_BATCH_BYTES: usize = 100 * 1024 * 1024;

/// Default number of retries after the first attempt for retryable rejections.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Default number of bulk requests in flight.
pub const DEFAULT_CONCURRENCY: usize = 2;

/// Default delay before the first retry, in milliseconds.
pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 2_000;

/// Default cap on retry delay, in milliseconds.
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 600_000;

/// Characters Elasticsearch does not allow in index names.
const FORBIDDEN_INDEX_CHARS: &[char] = &['\\', '/', '*', '?', '"', '<', '>', '|', ' ', ',', '#', ':'];

/// HTTP scheme used to reach the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    #[default]
    Http,
    Https,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        })
    }
}

/// Basic-auth credentials; the password never appears in `Debug` output or reports
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    #[serde(skip_serializing)]
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// How to reach the store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub port: u16,
    pub scheme: Scheme,
    pub credentials: Option<Credentials>,
    /// Bound on the liveness probe
    pub connect_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            scheme: Scheme::Http,
            credentials: None,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }
}

impl ConnectionConfig {
    /// Base URL for a resolved host
    pub fn base_url(&self, host: &str) -> String {
        format!("{}://{}:{}", self.scheme, host, self.port)
    }
}

/// Batching, retry and concurrency knobs for the bulk ingestor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkSettings {
    /// Maximum actions per bulk request
    pub batch_size: usize,
    /// Maximum estimated bytes per bulk request
    pub max_batch_bytes: usize,
    /// Retries after the first attempt for retryable rejections
    pub max_retries: u32,
    /// Bulk requests in flight at once
    pub concurrency: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Bound on each bulk request
    pub request_timeout: Duration,
}

impl Default for BulkSettings {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_batch_bytes: DEFAULT_MAX_BATCH_BYTES,
            max_retries: DEFAULT_MAX_RETRIES,
            concurrency: DEFAULT_CONCURRENCY,
            initial_backoff: Duration::from_millis(DEFAULT_INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(DEFAULT_MAX_BACKOFF_MS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }
}

impl BulkSettings {
    /// Delay before retry number `retry` (1-based), doubling up to `max_backoff`
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(IngestError::config("batch size must be greater than 0"));
        }
        if self.max_batch_bytes == 0 {
            return Err(IngestError::config("max batch bytes must be greater than 0"));
        }
        if self.concurrency == 0 {
            return Err(IngestError::config("concurrency must be greater than 0"));
        }
        if self.request_timeout.is_zero() {
            return Err(IngestError::config("request timeout must be greater than 0"));
        }
        if self.initial_backoff > self.max_backoff {
            return Err(IngestError::config(format!(
                "initial backoff ({:?}) cannot exceed max backoff ({:?})",
                self.initial_backoff, self.max_backoff
            )));
        }
        Ok(())
    }
}

/// Complete configuration for one ingestion run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// CSV file to read
    pub source_path: PathBuf,
    /// Destination index
    pub destination: String,
    pub connection: ConnectionConfig,
    pub bulk: BulkSettings,
    /// Create the destination index before the run if it is missing
    #[serde(default)]
    pub create_destination: bool,
    /// Where to write the JSON run report, if anywhere
    #[serde(default)]
    pub report_path: Option<PathBuf>,
}

impl IngestConfig {
    pub fn new(source_path: impl Into<PathBuf>, destination: impl Into<String>) -> Self {
        Self {
            source_path: source_path.into(),
            destination: destination.into(),
            connection: ConnectionConfig::default(),
            bulk: BulkSettings::default(),
            create_destination: false,
            report_path: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.source_path.as_os_str().is_empty() {
            return Err(IngestError::config("source path cannot be empty"));
        }
        validate_index_name(&self.destination)?;
        if self.connection.port == 0 {
            return Err(IngestError::config("port must be greater than 0"));
        }
        if self.connection.connect_timeout.is_zero() {
            return Err(IngestError::config("connect timeout must be greater than 0"));
        }
        if let Some(credentials) = &self.connection.credentials {
            if credentials.username.is_empty() {
                return Err(IngestError::config("username cannot be empty when a password is set"));
            }
        }
        self.bulk.validate()
    }
}

/// Check `name` against Elasticsearch index naming rules
pub fn validate_index_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(IngestError::config("index name cannot be empty"));
    }
    if name == "." || name == ".." {
        return Err(IngestError::config(format!("index name cannot be '{name}'")));
    }
    if name.len() > 255 {
        return Err(IngestError::config("index name cannot be longer than 255 bytes"));
    }
    if name.starts_with(&['-', '_', '+'][..]) {
        return Err(IngestError::config(format!(
            "index name '{name}' cannot start with '-', '_' or '+'"
        )));
    }
    if name.chars().any(|c| c.is_uppercase()) {
        return Err(IngestError::config(format!("index name '{name}' must be lowercase")));
    }
    if let Some(c) = name.chars().find(|c| FORBIDDEN_INDEX_CHARS.contains(c)) {
        return Err(IngestError::config(format!(
            "index name '{name}' cannot contain '{c}'"
        )));
    }
    Ok(())
}
