//! Connection management
//!
//! [`ConnectionManager::connect`] makes exactly one attempt: resolve the host,
//! build a client, probe it within the configured timeout. The result is either
//! a [`ConnectionHandle`] or a typed [`Unavailable`] reason; retrying is up to
//! the caller.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{ConnectionConfig, DEFAULT_HOSTNAME_SUFFIX};
use crate::store::{BulkStore, ElasticsearchStore, StoreError};

/// Why no connection could be established
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Unavailable {
    #[error("could not determine host: {0}")]
    HostResolution(String),

    #[error("could not create client: {0}")]
    Client(String),

    #[error("{endpoint} is unreachable ({reason})")]
    Unreachable { endpoint: String, reason: String },

    #[error("{endpoint} rejected the credentials (HTTP {status})")]
    AuthRejected { endpoint: String, status: u16 },

    #[error("{endpoint} did not answer within {after:?}")]
    Timeout { endpoint: String, after: Duration },

    #[error("{endpoint} answered the health check with HTTP {status}")]
    Unhealthy { endpoint: String, status: u16 },
}

impl Unavailable {
    fn from_probe(endpoint: String, err: StoreError) -> Self {
        match err {
            StoreError::Timeout { after } => Unavailable::Timeout { endpoint, after },
            StoreError::AuthRejected { status } => Unavailable::AuthRejected { endpoint, status },
            StoreError::Unhealthy { status } | StoreError::Status { status, .. } => {
                Unavailable::Unhealthy { endpoint, status }
            },
            StoreError::Unreachable(reason) | StoreError::Protocol(reason) => {
                Unavailable::Unreachable { endpoint, reason }
            },
        }
    }
}

/// Supplies the host name to connect to
pub trait HostResolver: Send + Sync {
    fn resolve(&self) -> Result<String, Unavailable>;
}

impl<T: HostResolver + ?Sized> HostResolver for Box<T> {
    fn resolve(&self) -> Result<String, Unavailable> {
        (**self).resolve()
    }
}

/// A fixed, configured host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticHost(pub String);

impl StaticHost {
    pub fn new(host: impl Into<String>) -> Self {
        Self(host.into())
    }
}

impl HostResolver for StaticHost {
    fn resolve(&self) -> Result<String, Unavailable> {
        let host = self.0.trim();
        if host.is_empty() {
            return Err(Unavailable::HostResolution("host is empty".to_string()));
        }
        Ok(host.to_string())
    }
}

/// This machine's hostname plus a suffix, e.g. `DESKTOP-42.local`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalHostname {
    suffix: String,
}

impl LocalHostname {
    pub fn new(suffix: impl Into<String>) -> Self {
        Self {
            suffix: suffix.into(),
        }
    }

    fn with_suffix(&self, hostname: &str) -> String {
        format!("{}{}", hostname.trim(), self.suffix)
    }
}

impl Default for LocalHostname {
    fn default() -> Self {
        Self::new(DEFAULT_HOSTNAME_SUFFIX)
    }
}

impl HostResolver for LocalHostname {
    fn resolve(&self) -> Result<String, Unavailable> {
        let hostname = hostname::get()
            .map_err(|e| Unavailable::HostResolution(e.to_string()))?
            .into_string()
            .map_err(|_| Unavailable::HostResolution("hostname is not valid UTF-8".to_string()))?;
        if hostname.trim().is_empty() {
            return Err(Unavailable::HostResolution("hostname is empty".to_string()));
        }
        Ok(self.with_suffix(&hostname))
    }
}

/// A live, health-checked link to the store
///
/// Only obtainable through a successful probe. It is moved into the bulk
/// ingestor for one run.
#[derive(Debug)]
pub struct ConnectionHandle {
    store: Arc<dyn BulkStore>,
    endpoint: String,
}

impl ConnectionHandle {
    /// Ping `store` within `timeout` and wrap it on success
    pub async fn probe(store: Arc<dyn BulkStore>, timeout: Duration) -> Result<Self, Unavailable> {
        let endpoint = store.endpoint();
        match tokio::time::timeout(timeout, store.ping()).await {
            Ok(Ok(())) => Ok(Self { store, endpoint }),
            Ok(Err(err)) => Err(Unavailable::from_probe(endpoint, err)),
            Err(_) => Err(Unavailable::Timeout {
                endpoint,
                after: timeout,
            }),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Create the destination index if it is missing
    pub async fn ensure_destination(&self, destination: &str) -> Result<bool, StoreError> {
        self.store.ensure_destination(destination).await
    }

    pub(crate) fn into_store(self) -> Arc<dyn BulkStore> {
        self.store
    }
}

/// Establishes connections to an Elasticsearch endpoint
pub struct ConnectionManager<R: HostResolver> {
    config: ConnectionConfig,
    resolver: R,
    request_timeout: Duration,
}

impl<R: HostResolver> ConnectionManager<R> {
    /// `request_timeout` bounds every request made through the resulting handle
    pub fn new(config: ConnectionConfig, resolver: R, request_timeout: Duration) -> Self {
        Self {
            config,
            resolver,
            request_timeout,
        }
    }

    /// One connection attempt
    pub async fn connect(&self) -> Result<ConnectionHandle, Unavailable> {
        let host = self.resolver.resolve()?;
        let base_url = self.config.base_url(&host);

        let store = ElasticsearchStore::new(
            base_url.clone(),
            self.config.credentials.clone(),
            self.request_timeout,
        )
        .map_err(|e| Unavailable::Client(e.to_string()))?;

        match ConnectionHandle::probe(Arc::new(store), self.config.connect_timeout).await {
            Ok(handle) => {
                info!(endpoint = %base_url, "Connected to search engine");
                Ok(handle)
            },
            Err(err) => {
                warn!(endpoint = %base_url, error = %err, "Could not connect to search engine");
                Err(err)
            },
        }
    }
}
