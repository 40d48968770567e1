// SPDX-License-Identifier: Apache-2.0

//! Forwarder: drains batches in order and delivers them over HTTPS.
//!
//! Delivery is at-least-once. Transient failures (network errors, 5xx) are
//! retried with exponential backoff and jitter for as long as it takes, so
//! a flaky endpoint never causes data loss; the retry loop blocks the next
//! batch, which keeps committed offsets monotonic per source. A 4xx response
//! usually means bad credentials or a malformed request that will recur, so
//! it terminates this source's pipeline instead of being silently dropped.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use bytes::Bytes;
use http::{header, Method, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use tokio_util::sync::CancellationToken;
use tower::BoxError;
use tracing::{debug, error, info, warn};

use crate::batch::Batch;
use crate::bounded_channel::BoundedReceiver;
use crate::state::StateStore;

pub type HttpsClient = HyperClient<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Header carrying the base64-encoded metadata envelope.
pub const METADATA_HEADER: &str = "Timber-Metadata-Override";

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    pub endpoint: String,
    pub api_key: String,
    /// Serialized metadata envelope, attached out-of-band as a header.
    pub metadata: Option<Vec<u8>>,
    pub request_timeout: Duration,
    pub retry: RetryConfig,
}

impl ForwarderConfig {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            metadata: None,
            request_timeout: Duration::from_secs(10),
            retry: RetryConfig::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: Vec<u8>) -> Self {
        if !metadata.is_empty() {
            self.metadata = Some(metadata);
        }
        self
    }
}

/// Shared HTTPS-or-HTTP client. Connection pooling and retry counters are
/// per-request, so one client serves every forwarder.
pub fn build_client() -> Result<HttpsClient, BoxError> {
    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_native_roots()?
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .build();

    let client = HyperClient::builder(TokioExecutor::new())
        .pool_idle_timeout(Duration::from_secs(30))
        .timer(TokioTimer::new())
        .build::<_, Full<Bytes>>(https);

    Ok(client)
}

pub struct Forwarder {
    client: HttpsClient,
    config: ForwarderConfig,
    store: Arc<StateStore>,
    authorization: String,
    metadata_header: Option<String>,
    user_agent: String,
}

impl Forwarder {
    pub fn new(client: HttpsClient, config: ForwarderConfig, store: Arc<StateStore>) -> Self {
        let authorization = format!("Basic {}", BASE64_STANDARD.encode(&config.api_key));
        let metadata_header = config
            .metadata
            .as_ref()
            .map(|metadata| BASE64_STANDARD.encode(metadata));

        Self {
            client,
            config,
            store,
            authorization,
            metadata_header,
            user_agent: crate::user_agent(),
        }
    }

    /// Drain batches until the input closes or `quit` fires. Returns an
    /// error only for a non-retryable (4xx) response, which ends this
    /// source's pipeline; upstream stages close by backpressure.
    pub async fn run(
        &self,
        mut batches: BoundedReceiver<Batch>,
        quit: CancellationToken,
    ) -> Result<(), BoxError> {
        loop {
            let batch = tokio::select! {
                _ = quit.cancelled() => return Ok(()),
                batch = batches.next() => match batch {
                    Some(batch) => batch,
                    None => return Ok(()),
                },
            };

            if !self.deliver(&batch, &quit).await? {
                // Shutdown interrupted the retry loop. The batch was not
                // acknowledged, so its offset stays uncommitted and the
                // next run re-sends it.
                return Ok(());
            }

            if batch.tail_position != 0 {
                // Committed in memory only; the store's flush ticker
                // persists within a second.
                if let Err(e) = self
                    .store
                    .update_offset(&batch.filename, batch.tail_position)
                {
                    debug!(file = %batch.filename, error = %e, "Unable to record offset");
                }
            }
        }
    }

    /// Deliver one batch, retrying transient failures indefinitely.
    /// Ok(true) means the endpoint accepted it; Ok(false) means `quit`
    /// fired first.
    async fn deliver(&self, batch: &Batch, quit: &CancellationToken) -> Result<bool, BoxError> {
        let mut backoff = self.config.retry.initial_backoff;
        let mut attempts: u32 = 0;

        loop {
            match self.attempt(&batch.payload).await {
                Ok((status, _body)) if status.is_success() => {
                    info!(status = status.as_u16(), "Flushed buffer");
                    return Ok(true);
                }
                Ok((status, body)) if status.is_client_error() => {
                    error!(
                        status = status.as_u16(),
                        body = %String::from_utf8_lossy(&body),
                        "Endpoint rejected payload"
                    );
                    return Err(crate::error::Error::Rejected {
                        status: status.as_u16(),
                        body: String::from_utf8_lossy(&body).to_string(),
                    }
                    .into());
                }
                Ok((status, _body)) => {
                    warn!(status = status.as_u16(), "Endpoint returned server error");
                }
                Err(e) => {
                    warn!(error = %e, "Request failed");
                }
            }

            attempts += 1;

            let backoff_ms = backoff.as_millis() as i64;
            let mut v = backoff_ms / 2;
            if v == 0 {
                v = 1;
            }
            // Exponential backoff with jitter
            let jitter = (rand::random::<i64>() % v) - (v / 2);
            let mut sleep_ms = backoff_ms + jitter;
            if sleep_ms < 0 {
                sleep_ms = 1;
            }
            let delay = Duration::from_millis(sleep_ms as u64);

            info!(
                attempt = attempts,
                delay = ?delay,
                "Delivery failed, will retry after delay"
            );

            tokio::select! {
                _ = quit.cancelled() => return Ok(false),
                _ = tokio::time::sleep(delay) => {}
            }

            backoff = std::cmp::min(backoff * 2, self.config.retry.max_backoff);
        }
    }

    async fn attempt(&self, payload: &Bytes) -> Result<(StatusCode, Bytes), BoxError> {
        let mut builder = http::Request::builder()
            .method(Method::POST)
            .uri(self.config.endpoint.as_str())
            .header(header::CONTENT_TYPE, "text/plain")
            .header(header::AUTHORIZATION, &self.authorization)
            .header(header::USER_AGENT, &self.user_agent);

        if let Some(metadata) = &self.metadata_header {
            builder = builder.header(METADATA_HEADER, metadata);
        }

        let request = builder.body(Full::new(payload.clone()))?;

        let response = tokio::time::timeout(self.config.request_timeout, self.client.request(request))
            .await
            .map_err(|_| -> BoxError { "request timed out".into() })??;

        let status = response.status();
        let body = response.into_body().collect().await?.to_bytes();
        Ok((status, body))
    }
}
