//! Handler-driven engine for tests and embedding.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::StreamExt;
use http::header::{HeaderName, LOCATION};
use http::{HeaderMap, HeaderValue, StatusCode, Version};

use crate::body::{ByteStream, ResponseBody};
use crate::engine::{EngineCapability, EngineConfig, HttpClientEngine};
use crate::error::{Error, Result};
use crate::request::HttpRequestData;
use crate::response::HttpResponseData;

/// Handler answering one request
pub type MockRequestHandler =
    Arc<dyn Fn(HttpRequestData) -> BoxFuture<'static, Result<HttpResponseData>> + Send + Sync>;

/// Configuration of a [`MockEngine`]
#[derive(Clone, Default)]
pub struct MockEngineConfig {
    handlers: Vec<MockRequestHandler>,
    capabilities: Vec<EngineCapability>,
    engine: EngineConfig,
}

impl MockEngineConfig {
    /// Create an empty configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a handler; the last queued handler answers every further request
    pub fn add_handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(HttpRequestData) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HttpResponseData>> + Send + 'static,
    {
        self.handlers.push(Arc::new(
            move |request| -> BoxFuture<'static, Result<HttpResponseData>> { Box::pin(handler(request)) },
        ));
        self
    }

    /// Declare a natively supported capability
    pub fn capability(mut self, capability: EngineCapability) -> Self {
        if !self.capabilities.contains(&capability) {
            self.capabilities.push(capability);
        }
        self
    }

    /// Set the engine configuration
    pub fn engine_config(mut self, config: EngineConfig) -> Self {
        self.engine = config;
        self
    }
}

/// Engine answering requests with queued handlers
///
/// Every response body is tracked as an engine resource until the body
/// stream is dropped, which makes leaked calls observable through
/// [`MockEngine::active_resources`].
pub struct MockEngine {
    config: EngineConfig,
    capabilities: Vec<EngineCapability>,
    handlers: Vec<MockRequestHandler>,
    invocations: AtomicUsize,
    requests: Mutex<Vec<HttpRequestData>>,
    active: Arc<AtomicUsize>,
}

impl MockEngine {
    /// Create an engine from a configuration
    pub fn new(config: MockEngineConfig) -> Self {
        Self {
            config: config.engine,
            capabilities: config.capabilities,
            handlers: config.handlers,
            invocations: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Create an engine answering every request with `handler`
    pub fn with_handler<F, Fut>(handler: F) -> Self
    where
        F: Fn(HttpRequestData) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HttpResponseData>> + Send + 'static,
    {
        Self::new(MockEngineConfig::new().add_handler(handler))
    }

    /// Requests received so far
    pub fn requests(&self) -> Vec<HttpRequestData> {
        self.requests.lock().map(|requests| requests.clone()).unwrap_or_default()
    }

    /// Number of requests received so far
    pub fn request_count(&self) -> usize {
        self.invocations.load(Ordering::Acquire)
    }

    /// Response bodies not yet released
    pub fn active_resources(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

#[async_trait]
impl HttpClientEngine for MockEngine {
    fn name(&self) -> &str {
        "mock"
    }

    fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn supported_capabilities(&self) -> &[EngineCapability] {
        &self.capabilities
    }

    async fn execute(&self, data: HttpRequestData) -> Result<HttpResponseData> {
        let index = self.invocations.fetch_add(1, Ordering::AcqRel);
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(data.clone());
        }

        let handler = self
            .handlers
            .get(index)
            .or_else(|| self.handlers.last())
            .cloned()
            .ok_or_else(|| Error::custom(format!("Unhandled {} {}", data.method(), data.url())))?;

        let response = handler(data).await?;
        let resource = Resource::acquire(self.active.clone());
        Ok(response.map_body(move |body| ResponseBody::Stream(track(body.into_stream(), resource))))
    }
}

impl std::fmt::Debug for MockEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockEngine")
            .field("handlers", &self.handlers.len())
            .field("requests", &self.request_count())
            .field("active_resources", &self.active_resources())
            .finish()
    }
}

struct Resource(Arc<AtomicUsize>);

impl Resource {
    fn acquire(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for Resource {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

fn track(stream: ByteStream, resource: Resource) -> ByteStream {
    futures::stream::unfold((stream, resource), |(mut stream, resource)| async move {
        let item = stream.next().await?;
        Some((item, (stream, resource)))
    })
    .boxed()
}

/// Build response data for a mock handler
pub fn respond(status: StatusCode, headers: HeaderMap, body: impl Into<ResponseBody>) -> HttpResponseData {
    HttpResponseData::new(status, Version::HTTP_11, headers, body.into(), Utc::now())
}

/// Build a `200 OK` response with `body`
pub fn respond_ok(body: impl Into<ResponseBody>) -> HttpResponseData {
    respond(StatusCode::OK, HeaderMap::new(), body)
}

/// Build an empty response with `status`
pub fn respond_error(status: StatusCode) -> HttpResponseData {
    respond(status, HeaderMap::new(), Bytes::new())
}

/// Build a redirect to `location`
pub fn respond_redirect(status: StatusCode, location: &str) -> Result<HttpResponseData> {
    let mut headers = HeaderMap::new();
    headers.insert(LOCATION, HeaderValue::from_str(location)?);
    Ok(respond(status, headers, Bytes::new()))
}

/// Build a header map from name/value pairs
pub fn headers_of(pairs: &[(&str, &str)]) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for (name, value) in pairs {
        headers.append(name.parse::<HeaderName>()?, HeaderValue::from_str(value)?);
    }
    Ok(headers)
}
