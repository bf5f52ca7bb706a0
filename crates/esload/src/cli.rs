//! Command-line interface
//!
//! Every option can also come from an `ESLOAD_*` environment variable, and a
//! `.env` file in the working directory is loaded first by the binary.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{
    BulkSettings, ConnectionConfig, Credentials, IngestConfig, Scheme, DEFAULT_BATCH_SIZE,
    DEFAULT_CONCURRENCY, DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_HOST, DEFAULT_HOSTNAME_SUFFIX,
    DEFAULT_INITIAL_BACKOFF_MS, DEFAULT_MAX_BACKOFF_MS, DEFAULT_MAX_BATCH_BYTES, DEFAULT_MAX_RETRIES,
    DEFAULT_PORT, DEFAULT_REQUEST_TIMEOUT_SECS,
};
use crate::connection::{HostResolver, LocalHostname, StaticHost};

/// esload - stream a CSV file into an Elasticsearch index
#[derive(Parser, Debug)]
#[command(name = "esload")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// CSV file to ingest (first line is the header)
    #[arg(env = "ESLOAD_SOURCE")]
    pub source: PathBuf,

    /// Destination index
    #[arg(short, long, env = "ESLOAD_INDEX")]
    pub index: String,

    /// Search engine host
    #[arg(long, env = "ESLOAD_HOST", conflicts_with = "local_hostname")]
    pub host: Option<String>,

    /// Use this machine's hostname plus --hostname-suffix as the host
    #[arg(long, env = "ESLOAD_LOCAL_HOSTNAME")]
    pub local_hostname: bool,

    /// Suffix appended to the hostname with --local-hostname
    #[arg(long, env = "ESLOAD_HOSTNAME_SUFFIX", default_value = DEFAULT_HOSTNAME_SUFFIX)]
    pub hostname_suffix: String,

    #[arg(short, long, env = "ESLOAD_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    #[arg(long, env = "ESLOAD_SCHEME", value_enum, default_value_t = Scheme::Http)]
    pub scheme: Scheme,

    /// Basic-auth user name
    #[arg(short, long, env = "ESLOAD_USERNAME")]
    pub username: Option<String>,

    /// Basic-auth password
    #[arg(long, env = "ESLOAD_PASSWORD", hide_env_values = true, requires = "username")]
    pub password: Option<String>,

    /// Maximum documents per bulk request
    #[arg(long, env = "ESLOAD_BATCH_SIZE", default_value_t = DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,

    /// Maximum estimated bytes per bulk request
    #[arg(long, env = "ESLOAD_MAX_BATCH_BYTES", default_value_t = DEFAULT_MAX_BATCH_BYTES)]
    pub max_batch_bytes: usize,

    /// Retries per document after a retryable rejection
    #[arg(long, env = "ESLOAD_MAX_RETRIES", default_value_t = DEFAULT_MAX_RETRIES)]
    pub max_retries: u32,

    /// Bulk requests in flight at once
    #[arg(long, env = "ESLOAD_CONCURRENCY", default_value_t = DEFAULT_CONCURRENCY)]
    pub concurrency: usize,

    #[arg(long, env = "ESLOAD_CONNECT_TIMEOUT_SECS", default_value_t = DEFAULT_CONNECT_TIMEOUT_SECS)]
    pub connect_timeout_secs: u64,

    #[arg(long, env = "ESLOAD_REQUEST_TIMEOUT_SECS", default_value_t = DEFAULT_REQUEST_TIMEOUT_SECS)]
    pub request_timeout_secs: u64,

    /// Delay before the first retry
    #[arg(long, env = "ESLOAD_INITIAL_BACKOFF_MS", default_value_t = DEFAULT_INITIAL_BACKOFF_MS)]
    pub initial_backoff_ms: u64,

    #[arg(long, env = "ESLOAD_MAX_BACKOFF_MS", default_value_t = DEFAULT_MAX_BACKOFF_MS)]
    pub max_backoff_ms: u64,

    /// Create the index first if it does not exist
    #[arg(long, env = "ESLOAD_CREATE_INDEX")]
    pub create_index: bool,

    /// Write the run summary as JSON to this file
    #[arg(long, env = "ESLOAD_REPORT")]
    pub report: Option<PathBuf>,

    /// Do not draw a progress bar
    #[arg(long)]
    pub no_progress: bool,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    /// Build the run configuration; call `validate()` on the result before use
    pub fn to_config(&self) -> IngestConfig {
        let credentials = self
            .username
            .as_ref()
            .map(|user| Credentials::new(user.as_str(), self.password.clone().unwrap_or_default()));

        IngestConfig {
            source_path: self.source.clone(),
            destination: self.index.clone(),
            connection: ConnectionConfig {
                port: self.port,
                scheme: self.scheme,
                credentials,
                connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            },
            bulk: BulkSettings {
                batch_size: self.batch_size,
                max_batch_bytes: self.max_batch_bytes,
                max_retries: self.max_retries,
                concurrency: self.concurrency,
                initial_backoff: Duration::from_millis(self.initial_backoff_ms),
                max_backoff: Duration::from_millis(self.max_backoff_ms),
                request_timeout: Duration::from_secs(self.request_timeout_secs),
            },
            create_destination: self.create_index,
            report_path: self.report.clone(),
        }
    }

    /// How the host is found for this invocation
    pub fn resolver(&self) -> Box<dyn HostResolver> {
        if self.local_hostname {
            Box::new(LocalHostname::new(self.hostname_suffix.as_str()))
        } else {
            Box::new(StaticHost::new(self.host.as_deref().unwrap_or(DEFAULT_HOST)))
        }
    }
}
