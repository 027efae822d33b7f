//! HTTP client for the pharmacy server.
//!
//! One `reqwest` client backs the three outbound concerns of the offline
//! subsystem: sale submission (`/sales/new`, `/sales/sync`), plain asset and
//! page fetches for the request cache, and the lightweight health probe that
//! drives connectivity state.

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Instant;
use tracing::{debug, warn};

use crate::cache::{CacheRequest, CachedResponse, Fetcher};
use crate::config::{self, OfflineConfig};
use crate::connectivity::HealthProbe;
use crate::sales::SalePayload;
use crate::sync::{RemoteResponse, SaleEndpoint, SaleTransport};

/// A request that produced no usable response.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("cannot reach server at {url}: {reason}")]
    Unreachable { url: String, reason: String },
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("invalid request URL: {0}")]
    InvalidUrl(String),
    #[error("failed to read response body: {0}")]
    Body(String),
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn transport_error(url: &str, err: &reqwest::Error) -> TransportError {
    if err.is_timeout() {
        return TransportError::Timeout {
            url: url.to_string(),
        };
    }
    if err.is_builder() {
        return TransportError::InvalidUrl(url.to_string());
    }
    if err.is_connect() {
        return TransportError::Unreachable {
            url: url.to_string(),
            reason: "connection failed".to_string(),
        };
    }
    TransportError::Unreachable {
        url: url.to_string(),
        reason: err.to_string(),
    }
}

/// Decode a response body: JSON when possible, otherwise the raw text as a
/// JSON string, and `null` for an empty body.
fn decode_body(text: &str) -> Value {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string()))
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct ServerClient {
    base_url: String,
    health_path: String,
    client: Client,
    probe_client: Client,
}

impl ServerClient {
    pub fn new(config: &OfflineConfig) -> Result<Self, TransportError> {
        let base_url = config::normalize_server_url(&config.server_url);
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| TransportError::InvalidUrl(format!("{base_url}: {e}")))?;
        let probe_client = Client::builder()
            .timeout(config.probe_timeout())
            .build()
            .map_err(|e| TransportError::InvalidUrl(format!("{base_url}: {e}")))?;
        Ok(Self {
            base_url,
            health_path: config.health_path.clone(),
            client,
            probe_client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url_for(&self, path: &str) -> String {
        config::resolve_against(&self.base_url, path)
    }

    /// HEAD against the health path; any success status counts as online.
    pub async fn check_health(&self) -> bool {
        let url = self.url_for(&self.health_path);
        let start = Instant::now();
        match self.probe_client.head(&url).send().await {
            Ok(resp) => {
                let ok = resp.status().is_success();
                debug!(
                    status = resp.status().as_u16(),
                    latency_ms = start.elapsed().as_millis() as u64,
                    "health probe"
                );
                ok
            }
            Err(e) => {
                debug!(error = %transport_error(&url, &e), "health probe failed");
                false
            }
        }
    }
}

#[async_trait]
impl SaleTransport for ServerClient {
    async fn submit(
        &self,
        endpoint: SaleEndpoint,
        sale: &SalePayload,
    ) -> Result<RemoteResponse, TransportError> {
        let url = self.url_for(endpoint.path());
        let resp = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .json(sale)
            .send()
            .await
            .map_err(|e| transport_error(&url, &e))?;

        let status = resp.status();
        if !status.is_success() {
            warn!(
                endpoint = endpoint.path(),
                status = status.as_u16(),
                reason = status.canonical_reason().unwrap_or(""),
                "Server rejected sale"
            );
        }

        // The status line is the server's verdict; a broken body after it
        // must not turn an accepted sale into a transport failure.
        let body = match resp.text().await {
            Ok(text) => decode_body(&text),
            Err(e) => {
                warn!(
                    endpoint = endpoint.path(),
                    status = status.as_u16(),
                    error = %TransportError::Body(e.to_string()),
                    "Response body unreadable, keeping status"
                );
                Value::Null
            }
        };

        Ok(RemoteResponse {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl Fetcher for ServerClient {
    async fn fetch(&self, request: &CacheRequest) -> Result<CachedResponse, TransportError> {
        let mut req = self
            .client
            .request(request.method.clone(), request.url.as_str());
        if let Some(accept) = &request.accept {
            req = req.header(ACCEPT, accept);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| transport_error(&request.url, &e))?;

        let status = resp.status();
        let headers = resp
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = resp
            .bytes()
            .await
            .map_err(|e| TransportError::Body(e.to_string()))?;

        if status != StatusCode::OK {
            debug!(url = %request.url, status = status.as_u16(), "non-200 fetch");
        }

        Ok(CachedResponse {
            status: status.as_u16(),
            headers,
            body: body.to_vec(),
        })
    }
}

#[async_trait]
impl HealthProbe for ServerClient {
    async fn check_health(&self) -> bool {
        ServerClient::check_health(self).await
    }
}
