//! Forwarding to the upstream messages API.
//!
//! The forwarder makes exactly one attempt per inbound request. Only the credential, the API
//! version and a fixed JSON content type are passed on; every other inbound header stays at the
//! proxy. The body bytes are sent as received.
//!
//! Whatever status the upstream answers with is returned to the caller as an [`UpstreamResponse`].
//! Only a failure to obtain a complete response at all (connection error, timeout, body read
//! error) is an [`UpstreamError`].

use anyhow::Context;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use bytes::Bytes;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::config::UpstreamConfig;

pub const API_KEY_HEADER: &str = "x-api-key";
pub const VERSION_HEADER: &str = "anthropic-version";

/// Response headers that describe the upstream connection rather than the payload.
///
/// The proxy re-frames the body on its own connection, so these are not relayed.
const HOP_BY_HOP_HEADERS: [&str; 7] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
    "te",
    "trailer",
];

/// A complete upstream response, of any status.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Wall clock time from sending the request to having the whole body
    pub elapsed: Duration,
}

/// The upstream exchange could not be completed.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct UpstreamError {
    message: String,
    /// Time spent before the exchange failed
    pub elapsed: Duration,
}

impl UpstreamError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            elapsed: Duration::ZERO,
        }
    }

    fn from_transport(err: reqwest::Error, elapsed: Duration) -> Self {
        // Alternate formatting renders the whole source chain, e.g. the io error under a timeout
        Self {
            message: format!("{:#}", anyhow::Error::from(err)),
            elapsed,
        }
    }
}

/// Sends inbound requests to `{base_url}/v1/messages`.
#[derive(Debug, Clone)]
pub struct Forwarder {
    client: reqwest::Client,
    messages_url: String,
    default_version: HeaderValue,
}

impl Forwarder {
    /// Build the upstream client.
    ///
    /// reqwest is built without a default TLS provider, so the aws-lc-rs provider is installed
    /// here unless the process already chose one.
    pub fn new(config: &UpstreamConfig) -> anyhow::Result<Self> {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("Failed to build upstream HTTP client")?;
        let default_version = HeaderValue::from_str(&config.default_version)
            .with_context(|| format!("Invalid default anthropic-version '{}'", config.default_version))?;

        Ok(Self {
            client,
            messages_url: config.messages_url(),
            default_version,
        })
    }

    pub fn messages_url(&self) -> &str {
        &self.messages_url
    }

    /// Forward one request and collect the full response.
    #[instrument(skip_all, fields(method = %method, url = %self.messages_url))]
    pub async fn forward(&self, method: Method, inbound: &HeaderMap, body: Bytes) -> Result<UpstreamResponse, UpstreamError> {
        let started = Instant::now();

        let response = self
            .client
            .request(method, &self.messages_url)
            .headers(self.outbound_headers(inbound))
            .body(body)
            .send()
            .await
            .map_err(|e| UpstreamError::from_transport(e, started.elapsed()))?;

        let status = response.status();
        let headers = relay_headers(response.headers());
        let body = response
            .bytes()
            .await
            .map_err(|e| UpstreamError::from_transport(e, started.elapsed()))?;
        let elapsed = started.elapsed();

        debug!(status = status.as_u16(), bytes = body.len(), elapsed_ms = elapsed.as_millis() as u64, "Upstream responded");

        Ok(UpstreamResponse {
            status,
            headers,
            body,
            elapsed,
        })
    }

    /// The headers sent upstream: credential, API version and a JSON content type.
    fn outbound_headers(&self, inbound: &HeaderMap) -> HeaderMap {
        let mut headers = HeaderMap::with_capacity(3);
        if let Some(key) = inbound.get(API_KEY_HEADER) {
            headers.insert(HeaderName::from_static(API_KEY_HEADER), key.clone());
        }
        let version = inbound.get(VERSION_HEADER).cloned().unwrap_or_else(|| self.default_version.clone());
        headers.insert(HeaderName::from_static(VERSION_HEADER), version);
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers
    }
}

/// Copy upstream response headers, dropping hop-by-hop ones.
fn relay_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut relayed = HeaderMap::with_capacity(upstream.len());
    for (name, value) in upstream {
        if !HOP_BY_HOP_HEADERS.contains(&name.as_str()) {
            relayed.append(name.clone(), value.clone());
        }
    }
    relayed
}
