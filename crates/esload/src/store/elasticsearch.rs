//! Elasticsearch client for the `_bulk` and health endpoints
//!
//! Bulk bodies are NDJSON: an `{"index":{"_index":..}}` line followed by the
//! document line, per action. Item statuses come back in request order.

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use super::{BulkStore, ItemStatus, StoreError};
use crate::action::Action;
use crate::config::Credentials;

// ============================================================================
// Protocol Constants
// ============================================================================

/// Content type required by the `_bulk` endpoint.
pub const BULK_CONTENT_TYPE: &str = "application/x-ndjson";

/// Whole-request statuses after which every item may be retried.
const RETRYABLE_REQUEST_STATUSES: [u16; 4] = [429, 502, 503, 504];

/// Item status Elasticsearch uses for back-pressure rejections.
const RETRYABLE_ITEM_STATUS: u16 = 429;

/// Longest error body kept in a [`StoreError::Status`] message.
const MAX_ERROR_BODY: usize = 512;

/// HTTP client bound to one Elasticsearch endpoint
#[derive(Clone)]
pub struct ElasticsearchStore {
    client: Client,
    base_url: String,
    credentials: Option<Credentials>,
    timeout: Duration,
}

impl ElasticsearchStore {
    /// Build a client for `base_url` (e.g. `http://localhost:9200`)
    ///
    /// `timeout` bounds every request, including connection setup.
    pub fn new(
        base_url: impl Into<String>,
        credentials: Option<Credentials>,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| StoreError::Protocol(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.client.request(method, format!("{}{}", self.base_url, path));
        match &self.credentials {
            Some(credentials) => {
                builder.basic_auth(&credentials.username, Some(credentials.password()))
            },
            None => builder,
        }
    }

    fn transport_error(&self, err: reqwest::Error) -> StoreError {
        if err.is_timeout() {
            StoreError::Timeout { after: self.timeout }
        } else {
            StoreError::Unreachable(format!("{}: {}", self.base_url, error_chain(&err)))
        }
    }

    async fn status_error(&self, response: reqwest::Response) -> StoreError {
        let status = response.status().as_u16();
        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        StoreError::Status { status, body }
    }
}

impl std::fmt::Debug for ElasticsearchStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElasticsearchStore")
            .field("base_url", &self.base_url)
            .field("credentials", &self.credentials)
            .field("timeout", &self.timeout)
            .finish()
    }
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

fn is_auth_status(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
}

#[derive(Serialize)]
struct BulkMeta<'a> {
    index: IndexTarget<'a>,
}

#[derive(Serialize)]
struct IndexTarget<'a> {
    #[serde(rename = "_index")]
    index: &'a str,
}

/// Render actions as an NDJSON `_bulk` body
pub fn encode_bulk_body(actions: &[Action]) -> Result<Vec<u8>, serde_json::Error> {
    let mut body = Vec::with_capacity(actions.iter().map(Action::estimated_size).sum());
    for action in actions {
        serde_json::to_writer(
            &mut body,
            &BulkMeta {
                index: IndexTarget {
                    index: action.destination(),
                },
            },
        )?;
        body.push(b'\n');
        serde_json::to_writer(&mut body, action.record())?;
        body.push(b'\n');
    }
    Ok(body)
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
    items: Vec<HashMap<String, BulkItem>>,
}

#[derive(Debug, Deserialize)]
struct BulkItem {
    status: u16,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

fn describe_item_error(error: Option<&serde_json::Value>) -> String {
    match error {
        Some(serde_json::Value::Object(fields)) => {
            let kind = fields.get("type").and_then(|v| v.as_str()).unwrap_or("error");
            match fields.get("reason").and_then(|v| v.as_str()) {
                Some(reason) => format!("{kind}: {reason}"),
                None => kind.to_string(),
            }
        },
        Some(serde_json::Value::String(reason)) => reason.clone(),
        Some(other) => other.to_string(),
        None => "no error details".to_string(),
    }
}

fn item_status(item: BulkItem) -> ItemStatus {
    if (200..300).contains(&item.status) {
        ItemStatus::Accepted
    } else {
        ItemStatus::rejected(
            Some(item.status),
            describe_item_error(item.error.as_ref()),
            item.status == RETRYABLE_ITEM_STATUS,
        )
    }
}

#[async_trait]
impl BulkStore for ElasticsearchStore {
    async fn ping(&self) -> Result<(), StoreError> {
        let response = self
            .request(Method::GET, "/")
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if is_auth_status(status) {
            Err(StoreError::AuthRejected {
                status: status.as_u16(),
            })
        } else {
            Err(StoreError::Unhealthy {
                status: status.as_u16(),
            })
        }
    }

    async fn bulk(&self, actions: &[Action]) -> Result<Vec<ItemStatus>, StoreError> {
        if actions.is_empty() {
            return Ok(Vec::new());
        }

        let body = encode_bulk_body(actions)
            .map_err(|e| StoreError::Protocol(format!("failed to encode bulk body: {e}")))?;

        let response = self
            .request(Method::POST, "/_bulk")
            .header(CONTENT_TYPE, BULK_CONTENT_TYPE)
            .body(body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if is_auth_status(status) {
            return Err(StoreError::AuthRejected {
                status: status.as_u16(),
            });
        }
        if RETRYABLE_REQUEST_STATUSES.contains(&status.as_u16()) {
            let reason = format!("bulk request returned HTTP {}", status.as_u16());
            return Ok(vec![
                ItemStatus::rejected(Some(status.as_u16()), reason, true);
                actions.len()
            ]);
        }
        if !status.is_success() {
            return Err(self.status_error(response).await);
        }

        let bytes = response.bytes().await.map_err(|e| self.transport_error(e))?;
        let parsed: BulkResponse = serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::Protocol(format!("invalid bulk response: {e}")))?;

        if parsed.items.len() != actions.len() {
            return Err(StoreError::Protocol(format!(
                "bulk response has {} items for {} actions",
                parsed.items.len(),
                actions.len()
            )));
        }

        debug!(
            items = parsed.items.len(),
            errors = parsed.errors,
            "Bulk request completed"
        );

        parsed
            .items
            .into_iter()
            .map(|item| {
                item.into_values()
                    .next()
                    .map(item_status)
                    .ok_or_else(|| StoreError::Protocol("empty bulk response item".to_string()))
            })
            .collect()
    }

    async fn ensure_destination(&self, destination: &str) -> Result<bool, StoreError> {
        let path = format!("/{destination}");

        let response = self
            .request(Method::HEAD, &path)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        match response.status() {
            status if status.is_success() => return Ok(false),
            status if is_auth_status(status) => {
                return Err(StoreError::AuthRejected {
                    status: status.as_u16(),
                })
            },
            StatusCode::NOT_FOUND => {},
            _ => return Err(self.status_error(response).await),
        }

        let response = self
            .request(Method::PUT, &path)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        if response.status().is_success() {
            return Ok(true);
        }
        match self.status_error(response).await {
            // lost a race with another writer creating the same index
            StoreError::Status { status: 400, body } if body.contains("resource_already_exists_exception") => {
                Ok(false)
            },
            other => Err(other),
        }
    }

    fn endpoint(&self) -> String {
        self.base_url.clone()
    }
}
