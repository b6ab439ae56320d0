//! Request, connect and socket timeouts.
//!
//! Values are resolved per request in this order: the request's
//! [`HttpTimeoutAttributes`], the feature configuration, then the engine
//! configuration. A resolved value of zero means unbounded. Connect and socket
//! timeouts are enforced here only when the engine does not handle them
//! natively.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;

use crate::attributes::AttributeKey;
use crate::body::{ByteStream, OutgoingContent, ResponseBody};
use crate::engine::{EngineCapability, EngineConfig};
use crate::error::{Error, Result};
use crate::feature::{ClientSetup, HttpClientFeature};
use crate::pipeline::{Interceptor, PipelineContext};
use crate::pipelines::{HttpReceivePhase, HttpRequestPhase, HttpSendPhase, ReceiveContext, RequestContext};
use crate::response::HttpResponse;
use crate::scope::CancelCause;

/// Timeout configuration in milliseconds
///
/// `None` defers to the engine configuration and `Some(0)` disables the
/// timeout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HttpTimeoutConfig {
    /// Bound on the whole call, body included
    pub request_timeout_millis: Option<i64>,
    /// Bound on connection establishment
    pub connect_timeout_millis: Option<i64>,
    /// Bound on inactivity between two body chunks
    pub socket_timeout_millis: Option<i64>,
}

impl HttpTimeoutConfig {
    /// Short timeouts for quick interactive calls
    pub fn quick() -> Self {
        Self {
            request_timeout_millis: Some(5_000),
            connect_timeout_millis: Some(2_000),
            socket_timeout_millis: Some(3_000),
        }
    }

    /// Long timeouts for slow endpoints
    pub fn long() -> Self {
        Self {
            request_timeout_millis: Some(300_000),
            connect_timeout_millis: Some(30_000),
            socket_timeout_millis: Some(270_000),
        }
    }

    /// Disable every timeout
    pub fn unlimited() -> Self {
        Self {
            request_timeout_millis: Some(0),
            connect_timeout_millis: Some(0),
            socket_timeout_millis: Some(0),
        }
    }

    /// No overall deadline but bounded inactivity, for long-lived streams
    pub fn streaming() -> Self {
        Self {
            request_timeout_millis: Some(0),
            connect_timeout_millis: Some(10_000),
            socket_timeout_millis: Some(60_000),
        }
    }
}

/// Per-request timeout overrides
///
/// Stored under [`HttpTimeout::ATTRIBUTE_KEY`]. After the request pipeline's
/// `Before` phase the attribute holds the effective values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HttpTimeoutAttributes {
    request_timeout: Option<Duration>,
    connect_timeout: Option<Duration>,
    socket_timeout: Option<Duration>,
}

impl HttpTimeoutAttributes {
    /// Create attributes deferring every value to the client defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the request timeout
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }

    /// Get the connect timeout
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout
    }

    /// Get the socket timeout
    pub fn socket_timeout(&self) -> Option<Duration> {
        self.socket_timeout
    }

    /// Set the request timeout
    pub fn set_request_timeout(&mut self, timeout: Option<Duration>) {
        self.request_timeout = timeout;
    }

    /// Set the connect timeout
    pub fn set_connect_timeout(&mut self, timeout: Option<Duration>) {
        self.connect_timeout = timeout;
    }

    /// Set the socket timeout
    pub fn set_socket_timeout(&mut self, timeout: Option<Duration>) {
        self.socket_timeout = timeout;
    }

    /// Set the request timeout in milliseconds
    pub fn set_request_timeout_millis(&mut self, millis: Option<i64>) -> Result<()> {
        self.request_timeout = to_duration(millis, "request")?;
        Ok(())
    }

    /// Set the connect timeout in milliseconds
    pub fn set_connect_timeout_millis(&mut self, millis: Option<i64>) -> Result<()> {
        self.connect_timeout = to_duration(millis, "connect")?;
        Ok(())
    }

    /// Set the socket timeout in milliseconds
    pub fn set_socket_timeout_millis(&mut self, millis: Option<i64>) -> Result<()> {
        self.socket_timeout = to_duration(millis, "socket")?;
        Ok(())
    }

    fn or(self, fallback: HttpTimeoutAttributes) -> Self {
        Self {
            request_timeout: self.request_timeout.or(fallback.request_timeout),
            connect_timeout: self.connect_timeout.or(fallback.connect_timeout),
            socket_timeout: self.socket_timeout.or(fallback.socket_timeout),
        }
    }
}

fn to_duration(millis: Option<i64>, kind: &str) -> Result<Option<Duration>> {
    match millis {
        None => Ok(None),
        Some(millis) if millis < 0 => Err(Error::config(format!(
            "{} timeout must be non-negative, got {}ms",
            kind, millis
        ))),
        Some(millis) => Ok(Some(Duration::from_millis(millis as u64))),
    }
}

fn finite(timeout: Option<Duration>) -> Option<Duration> {
    timeout.filter(|timeout| !timeout.is_zero())
}

/// Timeout feature
#[derive(Debug)]
pub struct HttpTimeout {
    defaults: HttpTimeoutAttributes,
}

impl HttpTimeout {
    /// Key of the per-request [`HttpTimeoutAttributes`]
    pub const ATTRIBUTE_KEY: AttributeKey<HttpTimeoutAttributes> = AttributeKey::new("TimeoutAttributes");

    /// Get the configured request timeout
    pub fn request_timeout(&self) -> Option<Duration> {
        self.defaults.request_timeout
    }

    /// Get the configured connect timeout
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.defaults.connect_timeout
    }

    /// Get the configured socket timeout
    pub fn socket_timeout(&self) -> Option<Duration> {
        self.defaults.socket_timeout
    }
}

impl HttpClientFeature for HttpTimeout {
    type Config = HttpTimeoutConfig;
    const KEY: AttributeKey<Self> = AttributeKey::new("HttpTimeout");

    fn prepare(config: HttpTimeoutConfig) -> Result<Self> {
        let mut defaults = HttpTimeoutAttributes::new();
        defaults.set_request_timeout_millis(config.request_timeout_millis)?;
        defaults.set_connect_timeout_millis(config.connect_timeout_millis)?;
        defaults.set_socket_timeout_millis(config.socket_timeout_millis)?;
        Ok(Self { defaults })
    }

    fn install(feature: Arc<Self>, setup: &mut ClientSetup) -> Result<()> {
        let engine_defaults = engine_defaults(setup.engine_config());
        setup.request_pipeline().intercept(
            HttpRequestPhase::BEFORE,
            ResolveTimeouts {
                defaults: feature.defaults.or(engine_defaults),
            },
        )?;

        if !setup.engine_supports(EngineCapability::ConnectTimeout) {
            setup
                .send_pipeline()
                .intercept(HttpSendPhase::MONITORING, ConnectDeadline)?;
        }
        if !setup.engine_supports(EngineCapability::SocketTimeout) {
            setup
                .receive_pipeline()
                .intercept(HttpReceivePhase::BEFORE, SocketInactivity)?;
        }
        Ok(())
    }
}

fn engine_defaults(config: &EngineConfig) -> HttpTimeoutAttributes {
    HttpTimeoutAttributes {
        request_timeout: config.request_timeout,
        connect_timeout: config.connect_timeout,
        socket_timeout: config.socket_timeout,
    }
}

/// Writes the effective timeouts into the request and arms the request deadline
struct ResolveTimeouts {
    defaults: HttpTimeoutAttributes,
}

#[async_trait]
impl Interceptor<OutgoingContent, RequestContext> for ResolveTimeouts {
    async fn intercept(&self, ctx: &mut PipelineContext<OutgoingContent, RequestContext>) -> Result<()> {
        let context = ctx.context_mut();
        let requested = context
            .request
            .attributes()
            .get(HttpTimeout::ATTRIBUTE_KEY)
            .copied()
            .unwrap_or_default();
        let resolved = requested.or(self.defaults);
        context
            .request
            .attributes_mut()
            .put(HttpTimeout::ATTRIBUTE_KEY, resolved);

        if let Some(timeout) = finite(resolved.request_timeout) {
            let execution = context.execution.clone();
            let url = context.request.url().to_string();
            tokio::spawn(async move {
                tokio::select! {
                    biased;
                    _ = execution.cancelled_owned() => {}
                    _ = tokio::time::sleep(timeout) => {
                        tracing::debug!(url = %url, timeout_ms = timeout.as_millis() as u64, "request timeout expired");
                        execution.cancel(CancelCause::RequestTimeout { url, timeout });
                    }
                }
            });
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "ResolveTimeouts"
    }
}

/// Hands the connect timeout to the engine exchange when the engine cannot
/// enforce it
struct ConnectDeadline;

#[async_trait]
impl Interceptor<OutgoingContent, RequestContext> for ConnectDeadline {
    async fn intercept(&self, ctx: &mut PipelineContext<OutgoingContent, RequestContext>) -> Result<()> {
        let context = ctx.context_mut();
        context.connect_deadline = context
            .request
            .attributes()
            .get(HttpTimeout::ATTRIBUTE_KEY)
            .and_then(|timeouts| finite(timeouts.connect_timeout));
        Ok(())
    }

    fn name(&self) -> &str {
        "ConnectDeadline"
    }
}

/// Bounds inactivity on the response body when the engine cannot
struct SocketInactivity;

#[async_trait]
impl Interceptor<HttpResponse, ReceiveContext> for SocketInactivity {
    async fn intercept(&self, ctx: &mut PipelineContext<HttpResponse, ReceiveContext>) -> Result<()> {
        let timeout = ctx
            .context()
            .request
            .attributes()
            .get(HttpTimeout::ATTRIBUTE_KEY)
            .and_then(|timeouts| finite(timeouts.socket_timeout));

        if let Some(timeout) = timeout {
            let response = ctx.subject_mut();
            let body = match response.take_body()? {
                ResponseBody::Stream(stream) => ResponseBody::Stream(with_inactivity_timeout(stream, timeout)),
                buffered => buffered,
            };
            response.set_body(body);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "SocketInactivity"
    }
}

/// Fail a stream with a socket timeout when no chunk arrives within `timeout`
pub fn with_inactivity_timeout(stream: ByteStream, timeout: Duration) -> ByteStream {
    futures::stream::unfold(Some(stream), move |state| async move {
        let mut stream = state?;
        match tokio::time::timeout(timeout, stream.next()).await {
            Ok(Some(item)) => Some((item, Some(stream))),
            Ok(None) => None,
            Err(_) => Some((Err(Error::socket_timeout(timeout)), None)),
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::HttpClient;
    use crate::engine::mock::{headers_of, respond, respond_ok};
    use crate::engine::{MockEngine, MockEngineConfig};
    use crate::features::cache::HttpCache;
    use bytes::Bytes;
    use http::StatusCode;

    #[test]
    fn test_negative_millis_are_rejected() {
        let mut attributes = HttpTimeoutAttributes::new();
        assert!(attributes.set_request_timeout_millis(Some(-1)).unwrap_err().is_config());
        attributes.set_socket_timeout_millis(Some(0)).unwrap();
        assert_eq!(attributes.socket_timeout(), Some(Duration::ZERO));

        let config = HttpTimeoutConfig {
            connect_timeout_millis: Some(-5),
            ..Default::default()
        };
        assert!(HttpTimeout::prepare(config).unwrap_err().is_config());
    }

    #[test]
    fn test_presets() {
        let quick = HttpTimeout::prepare(HttpTimeoutConfig::quick()).unwrap();
        assert_eq!(quick.request_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(quick.connect_timeout(), Some(Duration::from_secs(2)));

        let streaming = HttpTimeout::prepare(HttpTimeoutConfig::streaming()).unwrap();
        assert_eq!(finite(streaming.request_timeout()), None);
        assert_eq!(streaming.socket_timeout(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_config_deserialize() {
        let config: HttpTimeoutConfig = serde_json::from_str(r#"{"request_timeout_millis": 250}"#).unwrap();
        assert_eq!(config.request_timeout_millis, Some(250));
        assert_eq!(config.socket_timeout_millis, None);
    }

    #[test]
    fn test_request_attribute_wins() {
        let mut requested = HttpTimeoutAttributes::new();
        requested.set_request_timeout(Some(Duration::from_millis(10)));
        let mut defaults = HttpTimeoutAttributes::new();
        defaults.set_request_timeout(Some(Duration::from_secs(1)));
        defaults.set_socket_timeout(Some(Duration::from_secs(2)));

        let resolved = requested.or(defaults);
        assert_eq!(resolved.request_timeout(), Some(Duration::from_millis(10)));
        assert_eq!(resolved.socket_timeout(), Some(Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn test_request_timeout_cancels_call() {
        let engine = Arc::new(MockEngine::with_handler(|_| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(respond_ok("late"))
        }));
        let client = HttpClient::builder(engine)
            .install::<HttpTimeout, _>(|_| {})
            .build()
            .unwrap();

        let started = std::time::Instant::now();
        let err = client
            .get("http://localhost/slow")
            .timeout(Duration::from_millis(10))
            .send()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RequestTimeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_connect_deadline_fallback() {
        let engine = Arc::new(MockEngine::with_handler(|_| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(respond_ok("late"))
        }));
        let client = HttpClient::builder(engine)
            .install::<HttpTimeout, _>(|cfg| cfg.connect_timeout_millis = Some(20))
            .build()
            .unwrap();

        let err = client.get("http://localhost/").send().await.unwrap_err();
        assert!(matches!(err, Error::ConnectTimeout { .. }));
    }

    #[tokio::test]
    async fn test_connect_deadline_excludes_body_download() {
        let engine = Arc::new(MockEngine::with_handler(|_| async {
            let chunks = futures::stream::iter(0..5).then(|_| async {
                tokio::time::sleep(Duration::from_millis(40)).await;
                Ok(Bytes::from("chunk"))
            });
            let headers = headers_of(&[("cache-control", "max-age=60")])?;
            Ok(respond(StatusCode::OK, headers, ResponseBody::from_stream(chunks)))
        }));
        let client = HttpClient::builder(engine)
            .install::<HttpTimeout, _>(|cfg| {
                cfg.connect_timeout_millis = Some(100);
                cfg.socket_timeout_millis = Some(1_000);
                cfg.request_timeout_millis = Some(5_000);
            })
            .install::<HttpCache, _>(|_| {})
            .build()
            .unwrap();

        let text = client.get("http://localhost/slow-body").send_text().await.unwrap();
        assert_eq!(text, "chunk".repeat(5));
    }

    #[tokio::test]
    async fn test_native_connect_timeout_is_not_wrapped() {
        let engine = Arc::new(MockEngine::new(
            MockEngineConfig::new()
                .capability(EngineCapability::ConnectTimeout)
                .add_handler(|_| async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(respond_ok("slow but fine"))
                }),
        ));
        let client = HttpClient::builder(engine)
            .install::<HttpTimeout, _>(|cfg| cfg.connect_timeout_millis = Some(10))
            .build()
            .unwrap();

        assert_eq!(client.get("http://localhost/").send_text().await.unwrap(), "slow but fine");
    }

    #[tokio::test]
    async fn test_inactivity_timeout() {
        let stream = futures::stream::once(async { Ok(Bytes::from("a")) })
            .chain(futures::stream::once(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(Bytes::from("b"))
            }))
            .boxed();

        let mut wrapped = with_inactivity_timeout(stream, Duration::from_millis(20));
        assert_eq!(wrapped.next().await.unwrap().unwrap(), Bytes::from("a"));
        assert!(matches!(wrapped.next().await, Some(Err(Error::SocketTimeout { .. }))));
        assert!(wrapped.next().await.is_none());
    }
}
