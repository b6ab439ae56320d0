//! Engine backed by `reqwest`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;

use crate::body::{OutgoingContent, ResponseBody};
use crate::cache::{ResourceCache, DEFAULT_RESOURCE_CACHE_SIZE};
use crate::engine::{EngineCapability, EngineConfig, HttpClientEngine};
use crate::error::{Error, Result};
use crate::features::timeout::HttpTimeout;
use crate::request::HttpRequestData;
use crate::response::HttpResponseData;

const CAPABILITIES: &[EngineCapability] = &[EngineCapability::ConnectTimeout, EngineCapability::RequestTimeout];

/// Connection settings that require a dedicated `reqwest` client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeoutSettings {
    /// Connect timeout, `None` meaning unbounded
    pub connect_timeout: Option<Duration>,
}

/// Engine performing exchanges with a pooled `reqwest` client
///
/// Requests carrying a connect timeout that differs from the engine-wide one
/// are sent through a sub-client built for that timeout. Sub-clients are kept
/// in a bounded LRU cache and dropped when evicted or when the engine closes.
pub struct ReqwestEngine {
    config: EngineConfig,
    client: ::reqwest::Client,
    clients: ResourceCache<TimeoutSettings, ::reqwest::Client>,
}

impl ReqwestEngine {
    /// Create an engine with the default configuration
    pub fn new() -> Result<Self> {
        Self::with_config(EngineConfig::default())
    }

    /// Create an engine from `config`
    pub fn with_config(config: EngineConfig) -> Result<Self> {
        let client = build_client(&config, config.connect_timeout)?;
        let supplier_config = config.clone();
        let clients = ResourceCache::new(
            DEFAULT_RESOURCE_CACHE_SIZE,
            move |settings: &TimeoutSettings| build_client(&supplier_config, settings.connect_timeout),
            |client: ::reqwest::Client| drop(client),
        )?;
        Ok(Self { config, client, clients })
    }

    /// Number of sub-clients currently cached
    pub fn cached_clients(&self) -> usize {
        self.clients.len()
    }

    fn client_for(&self, connect_timeout: Option<Duration>) -> Result<::reqwest::Client> {
        if connect_timeout == self.config.connect_timeout {
            return Ok(self.client.clone());
        }
        self.clients.get(&TimeoutSettings { connect_timeout })
    }
}

#[async_trait]
impl HttpClientEngine for ReqwestEngine {
    fn name(&self) -> &str {
        "reqwest"
    }

    fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn supported_capabilities(&self) -> &[EngineCapability] {
        CAPABILITIES
    }

    async fn execute(&self, data: HttpRequestData) -> Result<HttpResponseData> {
        let timeouts = data.attributes().get(HttpTimeout::ATTRIBUTE_KEY).copied();
        let connect_timeout = match timeouts.and_then(|t| t.connect_timeout()) {
            Some(timeout) => finite(timeout),
            None => self.config.connect_timeout,
        };
        let request_timeout = match timeouts.and_then(|t| t.request_timeout()) {
            Some(timeout) => finite(timeout),
            None => self.config.request_timeout,
        };

        let client = self.client_for(connect_timeout)?;
        let mut builder = client
            .request(data.method().clone(), data.url().clone())
            .headers(data.headers().clone());
        if let Some(timeout) = request_timeout {
            builder = builder.timeout(timeout);
        }
        match data.body() {
            OutgoingContent::NoContent => {}
            body => {
                if let Some(content_type) = body.content_type() {
                    if !data.headers().contains_key(http::header::CONTENT_TYPE) {
                        builder = builder.header(http::header::CONTENT_TYPE, content_type);
                    }
                }
                builder = match body {
                    OutgoingContent::ByteArray { bytes, .. } => builder.body(bytes.clone()),
                    streamed => {
                        if let Some(length) = streamed.content_length() {
                            if !data.headers().contains_key(http::header::CONTENT_LENGTH) {
                                builder = builder.header(http::header::CONTENT_LENGTH, length);
                            }
                        }
                        builder.body(::reqwest::Body::wrap_stream(streamed.to_shared_stream()))
                    }
                };
            }
        }

        let url = data.url().to_string();
        let request_time = Utc::now();
        let response = builder
            .send()
            .await
            .map_err(|e| map_error(e, &url, connect_timeout, request_timeout))?;

        let status = response.status();
        let version = response.version();
        let headers = response.headers().clone();
        let body = response
            .bytes_stream()
            .map(move |chunk| chunk.map_err(|e| map_error(e, &url, connect_timeout, request_timeout)));

        Ok(HttpResponseData::new(
            status,
            version,
            headers,
            ResponseBody::from_stream(body),
            request_time,
        ))
    }

    async fn close(&self) {
        tracing::debug!(cached = self.clients.len(), "releasing reqwest clients");
        self.clients.clear();
    }
}

impl std::fmt::Debug for ReqwestEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqwestEngine")
            .field("config", &self.config)
            .field("clients", &self.clients)
            .finish()
    }
}

fn finite(timeout: Duration) -> Option<Duration> {
    if timeout.is_zero() {
        None
    } else {
        Some(timeout)
    }
}

fn build_client(config: &EngineConfig, connect_timeout: Option<Duration>) -> Result<::reqwest::Client> {
    let mut builder = ::reqwest::Client::builder()
        .redirect(::reqwest::redirect::Policy::none())
        .pool_idle_timeout(config.pool_idle_timeout)
        .pool_max_idle_per_host(config.pool_max_idle_per_host);
    if let Some(timeout) = connect_timeout {
        builder = builder.connect_timeout(timeout);
    }
    builder
        .build()
        .map_err(|e| Error::config(format!("Failed to build reqwest client: {}", e)))
}

fn map_error(
    err: ::reqwest::Error,
    url: &str,
    connect_timeout: Option<Duration>,
    request_timeout: Option<Duration>,
) -> Error {
    if err.is_timeout() {
        if let Some(timeout) = timeout_error(err.is_connect(), url, connect_timeout, request_timeout) {
            return timeout;
        }
    }
    Error::network(err.to_string())
}

/// Map a timed out exchange to the timeout that was actually configured
///
/// Socket timeouts are never handed to `reqwest`, so anything else is
/// reported as a network error by the caller.
fn timeout_error(
    connect: bool,
    url: &str,
    connect_timeout: Option<Duration>,
    request_timeout: Option<Duration>,
) -> Option<Error> {
    match (connect, connect_timeout, request_timeout) {
        (true, Some(timeout), _) => Some(Error::connect_timeout(timeout)),
        (_, _, Some(timeout)) => Some(Error::request_timeout(url, timeout)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_error_reports_configured_timeout() {
        let connect = timeout_error(true, "http://localhost/", Some(Duration::from_secs(2)), None);
        assert!(matches!(connect, Some(Error::ConnectTimeout { timeout }) if timeout == Duration::from_secs(2)));

        let request = timeout_error(false, "http://localhost/", None, Some(Duration::from_millis(300)));
        assert!(matches!(request, Some(Error::RequestTimeout { timeout, .. }) if timeout == Duration::from_millis(300)));

        assert!(timeout_error(false, "http://localhost/", Some(Duration::from_secs(2)), None).is_none());
        assert!(timeout_error(true, "http://localhost/", None, None).is_none());
    }

    #[test]
    fn test_declared_capabilities() {
        let engine = ReqwestEngine::new().unwrap();
        assert!(engine.supported_capabilities().contains(&EngineCapability::ConnectTimeout));
        assert!(engine.supported_capabilities().contains(&EngineCapability::RequestTimeout));
        assert!(!engine.supported_capabilities().contains(&EngineCapability::SocketTimeout));
    }

    #[test]
    fn test_sub_clients_are_cached_per_timeout() {
        let engine = ReqwestEngine::new().unwrap();
        engine.client_for(None).unwrap();
        assert_eq!(engine.cached_clients(), 0);

        engine.client_for(Some(Duration::from_millis(100))).unwrap();
        engine.client_for(Some(Duration::from_millis(100))).unwrap();
        engine.client_for(Some(Duration::from_millis(200))).unwrap();
        assert_eq!(engine.cached_clients(), 2);
    }

    #[tokio::test]
    async fn test_close_releases_sub_clients() {
        let engine = ReqwestEngine::new().unwrap();
        engine.client_for(Some(Duration::from_millis(100))).unwrap();
        engine.close().await;
        assert_eq!(engine.cached_clients(), 0);
    }

    #[test]
    fn test_zero_means_unbounded() {
        assert_eq!(finite(Duration::ZERO), None);
        assert_eq!(finite(Duration::from_secs(1)), Some(Duration::from_secs(1)));
    }
}
