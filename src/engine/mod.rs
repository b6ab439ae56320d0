//! Engine abstraction and the handle the client drives engines through.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use tokio::sync::Semaphore;

use crate::body::{self, ResponseBody};
use crate::error::{Error, Result};
use crate::request::HttpRequestData;
use crate::response::HttpResponseData;
use crate::scope::{CallScope, CancelCause};

pub mod mock;
pub mod reqwest;

pub use self::mock::{MockEngine, MockEngineConfig};
pub use self::reqwest::ReqwestEngine;

/// Optional behavior an engine implements natively
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineCapability {
    /// Bounds the time to establish a connection
    ConnectTimeout,
    /// Bounds inactivity while reading or writing
    SocketTimeout,
    /// Bounds the whole exchange
    RequestTimeout,
}

/// Engine trait for performing HTTP exchanges
///
/// This trait abstracts the network layer. An engine performs exactly one
/// exchange per [`HttpClientEngine::execute`]; it never retries and never
/// follows redirects.
#[async_trait]
pub trait HttpClientEngine: Send + Sync {
    /// Get the engine name
    fn name(&self) -> &str;

    /// Get the engine configuration
    fn config(&self) -> &EngineConfig;

    /// Capabilities handled by the engine itself
    fn supported_capabilities(&self) -> &[EngineCapability] {
        &[]
    }

    /// Perform one exchange
    async fn execute(&self, data: HttpRequestData) -> Result<HttpResponseData>;

    /// Release pooled resources
    async fn close(&self) {}
}

/// Engine configuration
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker threads the engine is sized for
    pub threads_count: usize,
    /// In-flight exchange budget, four per thread when unset
    pub max_concurrent_requests: Option<usize>,
    /// Engine-wide connect timeout
    #[serde(rename = "connect_timeout_ms", deserialize_with = "deserialize_millis")]
    pub connect_timeout: Option<Duration>,
    /// Engine-wide socket timeout
    #[serde(rename = "socket_timeout_ms", deserialize_with = "deserialize_millis")]
    pub socket_timeout: Option<Duration>,
    /// Engine-wide request timeout
    #[serde(rename = "request_timeout_ms", deserialize_with = "deserialize_millis")]
    pub request_timeout: Option<Duration>,
    /// Keep-alive timeout for idle pooled connections
    #[serde(rename = "pool_idle_timeout_ms", deserialize_with = "deserialize_millis")]
    pub pool_idle_timeout: Option<Duration>,
    /// Maximum idle connections kept per host
    pub pool_max_idle_per_host: usize,
}

impl EngineConfig {
    /// Create a configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the thread count
    pub fn threads_count(mut self, threads: usize) -> Self {
        self.threads_count = threads;
        self
    }

    /// Set the in-flight exchange budget
    pub fn max_concurrent_requests(mut self, max: usize) -> Self {
        self.max_concurrent_requests = Some(max);
        self
    }

    /// Set the engine-wide connect timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Set the engine-wide socket timeout
    pub fn socket_timeout(mut self, timeout: Duration) -> Self {
        self.socket_timeout = Some(timeout);
        self
    }

    /// Set the engine-wide request timeout
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Set the pool idle timeout
    pub fn pool_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.pool_idle_timeout = timeout;
        self
    }

    /// Set the maximum idle connections per host
    pub fn pool_max_idle_per_host(mut self, max: usize) -> Self {
        self.pool_max_idle_per_host = max;
        self
    }

    /// Get the effective in-flight exchange budget
    pub fn concurrency_limit(&self) -> usize {
        self.max_concurrent_requests
            .unwrap_or(self.threads_count * 4)
            .max(1)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            threads_count: 4,
            max_concurrent_requests: None,
            connect_timeout: None,
            socket_timeout: None,
            request_timeout: None,
            pool_idle_timeout: Some(Duration::from_secs(90)),
            pool_max_idle_per_host: usize::MAX,
        }
    }
}

fn deserialize_millis<'de, D>(deserializer: D) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
}

/// Client-owned wrapper enforcing the in-flight budget and close semantics
pub struct EngineHandle {
    engine: Arc<dyn HttpClientEngine>,
    permits: Arc<Semaphore>,
    root: CallScope,
    closed: AtomicBool,
}

impl EngineHandle {
    /// Wrap `engine`; every call scope must descend from `root`
    pub fn new(engine: Arc<dyn HttpClientEngine>, root: CallScope) -> Self {
        let permits = Arc::new(Semaphore::new(engine.config().concurrency_limit()));
        Self {
            engine,
            permits,
            root,
            closed: AtomicBool::new(false),
        }
    }

    /// Get the wrapped engine
    pub fn engine(&self) -> &Arc<dyn HttpClientEngine> {
        &self.engine
    }

    /// Check whether the engine handles `capability` natively
    pub fn supports(&self, capability: EngineCapability) -> bool {
        self.engine.supported_capabilities().contains(&capability)
    }

    /// Get the number of exchanges that can start without queueing
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Check if the handle was closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Perform one exchange within the request data's scope
    ///
    /// The in-flight permit is held until the scope ends, so a streaming
    /// body keeps its slot until it is consumed or cancelled.
    pub async fn execute(&self, data: HttpRequestData) -> Result<HttpResponseData> {
        if self.is_closed() {
            return Err(Error::EngineClosed);
        }

        let scope = data.scope().clone();
        let guard = CancelOnDrop(Some(scope.clone()));

        let permit = scope
            .run(async {
                self.permits
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| Error::EngineClosed)
            })
            .await;
        let permit = match permit {
            Ok(permit) => permit,
            Err(err) => return Err(fail(&scope, err)),
        };
        let released = scope.cancelled_owned();
        tokio::spawn(async move {
            released.await;
            drop(permit);
        });

        tracing::debug!(engine = self.engine.name(), method = %data.method(), url = %data.url(), "executing request");

        let result = scope.run(self.engine.execute(data)).await;
        guard.disarm();

        match result {
            Ok(response) => Ok(response.map_body(|body| match body {
                ResponseBody::Stream(stream) => ResponseBody::Stream(body::pump(stream, scope.clone())),
                buffered => buffered,
            })),
            Err(err) => Err(fail(&scope, err)),
        }
    }

    /// Close the engine
    ///
    /// In-flight calls are cancelled, queued calls fail with
    /// [`Error::EngineClosed`], and the engine releases its pools. Closing
    /// twice is a no-op.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(engine = self.engine.name(), "closing engine");
        self.root.cancel(CancelCause::ClientClosed);
        self.permits.close();
        self.engine.close().await;
    }
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("engine", &self.engine.name())
            .field("available_permits", &self.available_permits())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn fail(scope: &CallScope, err: Error) -> Error {
    scope.cancel(CancelCause::Cancelled(err.to_string()));
    err
}

/// Cancels a scope whose exchange future was dropped before finishing
struct CancelOnDrop(Option<CallScope>);

impl CancelOnDrop {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(scope) = self.0.take() {
            scope.cancel(CancelCause::Cancelled("exchange was abandoned".to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::OutgoingContent;
    use crate::request::HttpRequestBuilder;
    use http::{HeaderMap, Method, StatusCode, Version};
    use std::sync::atomic::AtomicUsize;

    struct CountingEngine {
        config: EngineConfig,
        closed: AtomicUsize,
    }

    #[async_trait]
    impl HttpClientEngine for CountingEngine {
        fn name(&self) -> &str {
            "counting"
        }

        fn config(&self) -> &EngineConfig {
            &self.config
        }

        async fn execute(&self, _data: HttpRequestData) -> Result<HttpResponseData> {
            Ok(HttpResponseData::new(
                StatusCode::OK,
                Version::HTTP_11,
                HeaderMap::new(),
                ResponseBody::from("ok"),
                chrono::Utc::now(),
            ))
        }

        async fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn handle(max_concurrent: usize) -> (EngineHandle, Arc<CountingEngine>, CallScope) {
        let engine = Arc::new(CountingEngine {
            config: EngineConfig::new().max_concurrent_requests(max_concurrent),
            closed: AtomicUsize::new(0),
        });
        let root = CallScope::root();
        (EngineHandle::new(engine.clone(), root.clone()), engine, root)
    }

    fn request(scope: CallScope) -> HttpRequestData {
        let mut builder = HttpRequestBuilder::new(Method::GET, "http://localhost/".parse().unwrap());
        builder.set_body(OutgoingContent::NoContent);
        builder.build(scope)
    }

    #[test]
    fn test_engine_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.threads_count, 4);
        assert_eq!(config.concurrency_limit(), 16);
        assert_eq!(EngineConfig::new().threads_count(2).concurrency_limit(), 8);
        assert_eq!(EngineConfig::new().max_concurrent_requests(0).concurrency_limit(), 1);
    }

    #[test]
    fn test_engine_config_deserialize() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"threads_count": 2, "connect_timeout_ms": 1500}"#).unwrap();
        assert_eq!(config.threads_count, 2);
        assert_eq!(config.connect_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(config.pool_idle_timeout, Some(Duration::from_secs(90)));
    }

    #[tokio::test]
    async fn test_permit_held_until_scope_ends() {
        let (handle, _engine, root) = handle(1);
        let scope = root.child();

        handle.execute(request(scope.clone())).await.unwrap();
        assert_eq!(handle.available_permits(), 0);

        scope.complete();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(handle.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_queues() {
        let (handle, _engine, root) = handle(1);
        let first = root.child();
        handle.execute(request(first.clone())).await.unwrap();

        let queued = tokio::time::timeout(Duration::from_millis(50), handle.execute(request(root.child()))).await;
        assert!(queued.is_err());

        first.complete();
        let second = tokio::time::timeout(Duration::from_secs(1), handle.execute(request(root.child()))).await;
        assert!(second.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_fails_later_calls() {
        let (handle, engine, root) = handle(4);
        let in_flight = root.child();

        handle.close().await;
        handle.close().await;

        assert_eq!(engine.closed.load(Ordering::SeqCst), 1);
        assert!(in_flight.is_cancelled());
        assert!(matches!(in_flight.error(), Error::EngineClosed));
        let err = handle.execute(request(root.child())).await.unwrap_err();
        assert!(matches!(err, Error::EngineClosed));
    }

    #[tokio::test]
    async fn test_queued_call_fails_on_close() {
        let (handle, _engine, root) = handle(1);
        let handle = Arc::new(handle);
        handle.execute(request(root.child())).await.unwrap();

        let queued = {
            let handle = handle.clone();
            let scope = root.child();
            tokio::spawn(async move { handle.execute(request(scope)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.close().await;

        let err = queued.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::EngineClosed));
    }
}
