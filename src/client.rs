use std::sync::Arc;

use cookie::Cookie;
use http::Method;
use url::Url;

use crate::attributes::Attributes;
use crate::call::HttpClientCall;
use crate::engine::{EngineHandle, HttpClientEngine, ReqwestEngine};
use crate::error::{Error, Result};
use crate::feature::{ClientSetup, HttpClientFeature};
use crate::features::cookies::HttpCookies;
use crate::features::default_request::DefaultRequest;
use crate::features::redirect::HttpRedirect;
use crate::features::send::{HttpSend, SendInterceptor};
use crate::features::validation::HttpResponseValidator;
use crate::pipelines::{ClientPipelines, RequestContext};
use crate::request::{invalid_url, HttpRequestBuilder, RequestBuilder};
use crate::scope::{CallScope, CancelCause};

/// Main HTTP client
///
/// A client owns an engine, the request/send/receive pipelines and the
/// installed features. Cloning is cheap and every clone shares the same
/// engine and feature state.
///
/// # Examples
///
/// ```rust,no_run
/// use rusttpx_core::HttpClient;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let client = HttpClient::reqwest()?;
///     let response = client.get("https://httpbin.org/json").send().await?;
///     println!("Status: {}", response.status());
///     client.close().await;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct HttpClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    engine: EngineHandle,
    pipelines: ClientPipelines,
    send_interceptors: Vec<Arc<dyn SendInterceptor>>,
    features: Attributes,
    root: CallScope,
}

impl HttpClient {
    /// Create a client builder over `engine`
    pub fn builder(engine: Arc<dyn HttpClientEngine>) -> HttpClientBuilder {
        HttpClientBuilder::new(engine)
    }

    /// Create a client with default features over `engine`
    pub fn new(engine: Arc<dyn HttpClientEngine>) -> Result<Self> {
        Self::builder(engine).build()
    }

    /// Create a client with default features over a [`ReqwestEngine`]
    pub fn reqwest() -> Result<Self> {
        Self::new(Arc::new(ReqwestEngine::new()?))
    }

    /// Create a GET request
    pub fn get(&self, url: impl AsRef<str>) -> RequestBuilder {
        self.request(Method::GET, url)
    }

    /// Create a POST request
    pub fn post(&self, url: impl AsRef<str>) -> RequestBuilder {
        self.request(Method::POST, url)
    }

    /// Create a PUT request
    pub fn put(&self, url: impl AsRef<str>) -> RequestBuilder {
        self.request(Method::PUT, url)
    }

    /// Create a DELETE request
    pub fn delete(&self, url: impl AsRef<str>) -> RequestBuilder {
        self.request(Method::DELETE, url)
    }

    /// Create a PATCH request
    pub fn patch(&self, url: impl AsRef<str>) -> RequestBuilder {
        self.request(Method::PATCH, url)
    }

    /// Create a HEAD request
    pub fn head(&self, url: impl AsRef<str>) -> RequestBuilder {
        self.request(Method::HEAD, url)
    }

    /// Create a request with a custom method
    ///
    /// Relative URLs are resolved against the [`DefaultRequest`] base URL
    /// when that feature is installed.
    pub fn request(&self, method: Method, url: impl AsRef<str>) -> RequestBuilder {
        let url = url.as_ref();
        let parsed = match self.feature::<DefaultRequest>() {
            Some(defaults) => defaults.resolve(url),
            None => Url::parse(url).map_err(|err| invalid_url(url, err)),
        };
        RequestBuilder::new(self.clone(), parsed.map(|url| HttpRequestBuilder::new(method, url)))
    }

    /// Run one logical call and return it unbuffered
    ///
    /// The caller owns the streaming response: reading it to the end or
    /// dropping it releases the engine resources.
    pub async fn execute(&self, request: HttpRequestBuilder) -> Result<HttpClientCall> {
        if self.is_closed() {
            return Err(Error::EngineClosed);
        }

        let execution = self.inner.root.child();
        let body = request.body().clone();
        let context = RequestContext::new(self.clone(), request, execution.clone());
        let result = execution
            .run(self.inner.pipelines.request.execute_with_context(context, body))
            .await;

        let call = match result {
            Ok((_, context)) => context
                .call
                .ok_or_else(|| Error::custom("Request pipeline finished without producing a call")),
            Err(err) => Err(err),
        };
        match call {
            Ok(mut call) => {
                call.response_mut().bind_owner(execution);
                Ok(call)
            }
            Err(err) => {
                tracing::debug!(error = %err, "call failed");
                execution.cancel(CancelCause::Cancelled(err.to_string()));
                Err(err)
            }
        }
    }

    pub(crate) async fn execute_send_pipeline(
        &self,
        request: HttpRequestBuilder,
        execution: CallScope,
    ) -> Result<HttpClientCall> {
        let body = request.body().clone();
        let context = RequestContext::new(self.clone(), request, execution);
        let (_, context) = self.inner.pipelines.send.execute_with_context(context, body).await?;
        context
            .call
            .ok_or_else(|| Error::custom("Send pipeline finished without producing a call"))
    }

    /// Get the engine handle
    pub fn engine(&self) -> &EngineHandle {
        &self.inner.engine
    }

    /// Get the client pipelines
    pub fn pipelines(&self) -> &ClientPipelines {
        &self.inner.pipelines
    }

    /// Get the send interceptors in registration order
    pub fn send_interceptors(&self) -> &[Arc<dyn SendInterceptor>] {
        &self.inner.send_interceptors
    }

    /// Get an installed feature
    pub fn feature<F: HttpClientFeature>(&self) -> Option<Arc<F>> {
        self.inner.features.get_arc(F::KEY)
    }

    /// Cookies the [`HttpCookies`] feature would send to `url`
    pub async fn cookies(&self, url: &Url) -> Vec<Cookie<'static>> {
        match self.feature::<HttpCookies>() {
            Some(cookies) => cookies.get(url).await,
            None => Vec::new(),
        }
    }

    /// Check if the client was closed
    pub fn is_closed(&self) -> bool {
        self.inner.engine.is_closed()
    }

    /// Close the client
    ///
    /// In-flight calls fail, later calls fail with [`Error::EngineClosed`].
    /// Closing twice is a no-op.
    pub async fn close(&self) {
        if self.is_closed() {
            return;
        }
        self.inner.engine.close().await;
        if let Some(cookies) = self.feature::<HttpCookies>() {
            cookies.close().await;
        }
    }
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("engine", &self.inner.engine)
            .field("features", &self.inner.features.key_names())
            .field("send_interceptors", &self.inner.send_interceptors.len())
            .finish()
    }
}

type Installer = Box<dyn FnOnce(&mut ClientSetup) -> Result<()>>;

/// Builder for creating HTTP clients
///
/// Features are installed in a fixed order when the client is built:
/// [`HttpSend`], then [`HttpRedirect`], then the send interceptors and
/// features added here in call order, and finally the default
/// [`HttpResponseValidator`] when `expect_success` is set.
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
/// use rusttpx_core::engine::mock::respond_ok;
/// use rusttpx_core::engine::MockEngine;
/// use rusttpx_core::features::timeout::HttpTimeout;
/// use rusttpx_core::HttpClient;
///
/// let engine = Arc::new(MockEngine::with_handler(|_| async { Ok(respond_ok("hi")) }));
/// let client = HttpClient::builder(engine)
///     .install::<HttpTimeout, _>(|cfg| cfg.request_timeout_millis = Some(30_000))
///     .expect_success(true)
///     .build()
///     .unwrap();
/// assert!(client.feature::<HttpTimeout>().is_some());
/// ```
pub struct HttpClientBuilder {
    engine: Arc<dyn HttpClientEngine>,
    installers: Vec<(&'static str, Installer)>,
    send_interceptors: Vec<Arc<dyn SendInterceptor>>,
    follow_redirects: bool,
    expect_success: bool,
}

impl HttpClientBuilder {
    /// Create a builder over `engine`
    pub fn new(engine: Arc<dyn HttpClientEngine>) -> Self {
        Self {
            engine,
            installers: Vec::new(),
            send_interceptors: Vec::new(),
            follow_redirects: true,
            expect_success: false,
        }
    }

    /// Install feature `F`, configured by `configure`
    ///
    /// Installing the same feature twice makes [`HttpClientBuilder::build`]
    /// fail with a configuration error.
    pub fn install<F, C>(mut self, configure: C) -> Self
    where
        F: HttpClientFeature,
        C: FnOnce(&mut F::Config) + 'static,
    {
        let installer: Installer = Box::new(move |setup: &mut ClientSetup| setup.install::<F, C>(configure).map(|_| ()));
        self.installers.push((F::KEY.name(), installer));
        self
    }

    /// Register a send interceptor
    pub fn send_interceptor(mut self, interceptor: Arc<dyn SendInterceptor>) -> Self {
        self.send_interceptors.push(interceptor);
        self
    }

    /// Follow redirects with the default [`HttpRedirect`] settings
    pub fn follow_redirects(mut self, follow: bool) -> Self {
        self.follow_redirects = follow;
        self
    }

    /// Fail calls whose final status is 300 or above
    pub fn expect_success(mut self, expect: bool) -> Self {
        self.expect_success = expect;
        self
    }

    /// Build the client
    pub fn build(self) -> Result<HttpClient> {
        let mut setup = ClientSetup::new(
            self.engine.supported_capabilities().to_vec(),
            self.engine.config().clone(),
        )?;
        let mut installers = self.installers;

        match take_installer(&mut installers, HttpSend::KEY.name()) {
            Some(install) => install(&mut setup)?,
            None => setup.install::<HttpSend, _>(|_| {}).map(|_| ())?,
        }
        match take_installer(&mut installers, HttpRedirect::KEY.name()) {
            Some(install) => install(&mut setup)?,
            None if self.follow_redirects => setup.install::<HttpRedirect, _>(|_| {}).map(|_| ())?,
            None => {}
        }
        for interceptor in self.send_interceptors {
            setup.add_send_interceptor(interceptor);
        }
        for (_, install) in installers {
            install(&mut setup)?;
        }
        if self.expect_success && !setup.is_installed::<HttpResponseValidator>() {
            setup.install::<HttpResponseValidator, _>(|_| {})?;
        }

        let root = CallScope::root();
        let engine = EngineHandle::new(self.engine, root.clone());
        let (pipelines, send_interceptors, features) = setup.into_parts();
        tracing::debug!(engine = engine.engine().name(), features = ?features.key_names(), "client built");

        Ok(HttpClient {
            inner: Arc::new(ClientInner {
                engine,
                pipelines,
                send_interceptors,
                features,
                root,
            }),
        })
    }
}

impl std::fmt::Debug for HttpClientBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let features: Vec<&str> = self.installers.iter().map(|(name, _)| *name).collect();
        f.debug_struct("HttpClientBuilder")
            .field("engine", &self.engine.name())
            .field("features", &features)
            .field("follow_redirects", &self.follow_redirects)
            .field("expect_success", &self.expect_success)
            .finish()
    }
}

/// Remove the first installer registered under `name`
fn take_installer(installers: &mut Vec<(&'static str, Installer)>, name: &str) -> Option<Installer> {
    let index = installers.iter().position(|(key, _)| *key == name)?;
    Some(installers.remove(index).1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::respond_ok;
    use crate::engine::MockEngine;
    use crate::features::timeout::HttpTimeout;
    use futures::StreamExt;
    use std::time::Duration;

    fn engine() -> Arc<MockEngine> {
        Arc::new(MockEngine::with_handler(|_| async { Ok(respond_ok("hello")) }))
    }

    #[test]
    fn test_default_features() {
        let client = HttpClient::new(engine()).unwrap();
        assert!(client.feature::<HttpSend>().is_some());
        assert!(client.feature::<HttpRedirect>().is_some());
        assert!(client.feature::<HttpResponseValidator>().is_none());
        assert!(client.feature::<HttpTimeout>().is_none());
        assert_eq!(client.send_interceptors().len(), 1);
    }

    #[test]
    fn test_duplicate_install_fails() {
        let err = HttpClient::builder(engine())
            .install::<HttpTimeout, _>(|_| {})
            .install::<HttpTimeout, _>(|_| {})
            .build()
            .unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_explicit_send_config_is_used() {
        let client = HttpClient::builder(engine())
            .install::<HttpSend, _>(|cfg| cfg.max_send_count = 5)
            .follow_redirects(false)
            .build()
            .unwrap();
        assert_eq!(client.feature::<HttpSend>().unwrap().max_send_count(), 5);
        assert!(client.send_interceptors().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_url_is_reported_on_send() {
        let client = HttpClient::new(engine()).unwrap();
        let err = client.get("not a url").send().await.unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_execute_returns_streaming_call() {
        let engine = engine();
        let client = HttpClient::new(engine.clone()).unwrap();
        let request = client.get("http://localhost/stream").build().unwrap();

        let call = client.execute(request).await.unwrap();
        assert!(!call.response().is_buffered());
        assert_eq!(engine.active_resources(), 1);

        let mut stream = call.into_response().bytes_stream().unwrap();
        while let Some(chunk) = stream.next().await {
            chunk.unwrap();
        }
        drop(stream);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(engine.active_resources(), 0);
    }

    #[tokio::test]
    async fn test_closed_client_rejects_calls() {
        let client = HttpClient::new(engine()).unwrap();
        client.close().await;
        client.close().await;
        assert!(client.is_closed());

        let err = client.get("http://localhost/").send().await.unwrap_err();
        assert!(matches!(err, Error::EngineClosed));
    }

    #[tokio::test]
    async fn test_close_cancels_in_flight_calls() {
        let engine = Arc::new(MockEngine::with_handler(|_| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(respond_ok("late"))
        }));
        let client = HttpClient::new(engine).unwrap();

        let pending = {
            let client = client.clone();
            tokio::spawn(async move { client.get("http://localhost/slow").send().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.close().await;

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::EngineClosed));
    }
}
