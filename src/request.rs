use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderName, ACCEPT, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use http::{HeaderMap, HeaderValue, Method};
use url::Url;

use crate::attributes::{AttributeKey, Attributes};
use crate::body::{BodyWriter, ByteStream, OutgoingContent};
use crate::client::HttpClient;
use crate::error::{Error, Result};
use crate::features::timeout::{HttpTimeout, HttpTimeoutAttributes};
use crate::response::HttpResponse;
use crate::scope::CallScope;
use crate::statement::HttpStatement;

/// Mutable request description passed through the request and send pipelines
#[derive(Clone, Debug)]
pub struct HttpRequestBuilder {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: OutgoingContent,
    attributes: Attributes,
}

impl HttpRequestBuilder {
    /// Create a request without headers or body
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: OutgoingContent::NoContent,
            attributes: Attributes::new(),
        }
    }

    /// Create a builder repeating an already sent request
    pub fn from_request(request: &HttpRequest) -> Self {
        Self {
            method: request.method.clone(),
            url: request.url.clone(),
            headers: request.headers.clone(),
            body: request.content.clone(),
            attributes: request.attributes.clone(),
        }
    }

    /// Get the HTTP method
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Set the HTTP method
    pub fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    /// Get the URL
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Get mutable access to the URL
    pub fn url_mut(&mut self) -> &mut Url {
        &mut self.url
    }

    /// Set the URL
    pub fn set_url(&mut self, url: Url) {
        self.url = url;
    }

    /// Get the headers
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Get mutable access to headers
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Parse and append a header value
    pub fn append_header(&mut self, name: &str, value: &str) -> Result<()> {
        let name = name.parse::<HeaderName>()?;
        let value = value.parse::<HeaderValue>()?;
        self.headers.append(name, value);
        Ok(())
    }

    /// Get the body
    pub fn body(&self) -> &OutgoingContent {
        &self.body
    }

    /// Set the body
    pub fn set_body(&mut self, body: OutgoingContent) {
        self.body = body;
    }

    /// Get the attributes
    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// Get mutable access to the attributes
    pub fn attributes_mut(&mut self) -> &mut Attributes {
        &mut self.attributes
    }

    /// Copy every property of `other` into this builder
    pub fn take_from(&mut self, other: &HttpRequestBuilder) -> &mut Self {
        self.method = other.method.clone();
        self.url = other.url.clone();
        self.headers = other.headers.clone();
        self.body = other.body.clone();
        self.attributes.put_all(&other.attributes);
        self
    }

    /// Freeze the request for one physical exchange bound to `scope`
    pub fn build(&self, scope: CallScope) -> HttpRequestData {
        HttpRequestData {
            method: self.method.clone(),
            url: self.url.clone(),
            headers: self.headers.clone(),
            body: self.body.clone(),
            attributes: self.attributes.clone(),
            scope,
        }
    }
}

/// Immutable request handed to an engine
#[derive(Clone, Debug)]
pub struct HttpRequestData {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: OutgoingContent,
    attributes: Attributes,
    scope: CallScope,
}

impl HttpRequestData {
    /// Get the HTTP method
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Get the URL
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Get the headers
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Get the body
    pub fn body(&self) -> &OutgoingContent {
        &self.body
    }

    /// Get the attributes
    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// Get the scope of the exchange
    pub fn scope(&self) -> &CallScope {
        &self.scope
    }
}

/// Request as attached to a finished call
#[derive(Clone, Debug)]
pub struct HttpRequest {
    method: Method,
    url: Url,
    headers: HeaderMap,
    content: OutgoingContent,
    attributes: Attributes,
}

impl HttpRequest {
    /// Get the HTTP method
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Get the URL
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Get the headers
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Get a specific header value
    pub fn header(&self, name: &str) -> Option<&HeaderValue> {
        self.headers.get(name)
    }

    /// Get the body that was sent
    pub fn content(&self) -> &OutgoingContent {
        &self.content
    }

    /// Get the attributes
    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }
}

impl From<&HttpRequestData> for HttpRequest {
    fn from(data: &HttpRequestData) -> Self {
        Self {
            method: data.method.clone(),
            url: data.url.clone(),
            headers: data.headers.clone(),
            content: data.body.clone(),
            attributes: data.attributes.clone(),
        }
    }
}

impl From<&HttpRequestBuilder> for HttpRequest {
    fn from(builder: &HttpRequestBuilder) -> Self {
        Self {
            method: builder.method.clone(),
            url: builder.url.clone(),
            headers: builder.headers.clone(),
            content: builder.body.clone(),
            attributes: builder.attributes.clone(),
        }
    }
}

/// Builder for creating HTTP requests bound to a client
///
/// This provides a fluent interface for building requests with various
/// configurations, headers, and body types. URL errors are reported when
/// the request is sent.
pub struct RequestBuilder {
    client: HttpClient,
    inner: Result<HttpRequestBuilder>,
}

impl RequestBuilder {
    pub(crate) fn new(client: HttpClient, inner: Result<HttpRequestBuilder>) -> Self {
        Self { client, inner }
    }

    /// Get the HTTP method
    pub fn method(&self) -> Option<&Method> {
        self.inner.as_ref().ok().map(HttpRequestBuilder::method)
    }

    /// Get the URL
    pub fn url(&self) -> Option<&Url> {
        self.inner.as_ref().ok().map(HttpRequestBuilder::url)
    }

    /// Set a header
    pub fn header(self, name: &str, value: &str) -> Result<Self> {
        let mut inner = self.inner?;
        let name = name.parse::<HeaderName>()?;
        let value = value.parse::<HeaderValue>()?;
        inner.headers_mut().insert(name, value);
        Ok(Self {
            client: self.client,
            inner: Ok(inner),
        })
    }

    /// Append multiple headers
    pub fn headers(self, headers: HeaderMap) -> Self {
        self.map(|request| {
            for (name, value) in headers.iter() {
                request.headers_mut().append(name.clone(), value.clone());
            }
        })
    }

    /// Set the content type
    pub fn content_type(self, content_type: &str) -> Result<Self> {
        self.header(CONTENT_TYPE.as_str(), content_type)
    }

    /// Set the user agent
    pub fn user_agent(self, user_agent: &str) -> Result<Self> {
        self.header(USER_AGENT.as_str(), user_agent)
    }

    /// Set the accept header
    pub fn accept(self, accept: &str) -> Result<Self> {
        self.header(ACCEPT.as_str(), accept)
    }

    /// Set bearer token authentication
    pub fn bearer_auth(self, token: &str) -> Result<Self> {
        self.header(AUTHORIZATION.as_str(), &format!("Bearer {}", token))
    }

    /// Set the body
    pub fn body(self, body: OutgoingContent) -> Self {
        self.map(|request| request.set_body(body))
    }

    /// Set bytes body
    pub fn bytes(self, body: impl Into<Bytes>) -> Self {
        self.body(OutgoingContent::bytes(body))
    }

    /// Set text body
    pub fn text(self, body: impl Into<String>) -> Self {
        self.body(OutgoingContent::text(body))
    }

    /// Set a body read from a fresh stream on every send
    pub fn body_stream<F>(self, factory: F) -> Self
    where
        F: Fn() -> ByteStream + Send + Sync + 'static,
    {
        self.body(OutgoingContent::from_stream(factory))
    }

    /// Set a body written by `producer` on every send
    pub fn body_writer<F, Fut>(self, producer: F) -> Self
    where
        F: Fn(BodyWriter) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.body(OutgoingContent::from_writer(producer))
    }

    /// Store a request attribute
    pub fn attribute<T: Send + Sync + 'static>(self, key: AttributeKey<T>, value: T) -> Self {
        self.map(|request| request.attributes_mut().put(key, value))
    }

    /// Set the request timeout, zero meaning unbounded
    pub fn timeout(self, timeout: Duration) -> Self {
        self.update_timeouts(|timeouts| timeouts.set_request_timeout(Some(timeout)))
    }

    /// Set the connect timeout, zero meaning unbounded
    pub fn connect_timeout(self, timeout: Duration) -> Self {
        self.update_timeouts(|timeouts| timeouts.set_connect_timeout(Some(timeout)))
    }

    /// Set the socket timeout, zero meaning unbounded
    pub fn socket_timeout(self, timeout: Duration) -> Self {
        self.update_timeouts(|timeouts| timeouts.set_socket_timeout(Some(timeout)))
    }

    /// Build the request
    pub fn build(self) -> Result<HttpRequestBuilder> {
        self.inner
    }

    /// Prepare a statement that can be executed any number of times
    pub fn statement(self) -> Result<HttpStatement> {
        Ok(HttpStatement::new(self.inner?, self.client))
    }

    /// Send the request and return the fully buffered response
    pub async fn send(self) -> Result<HttpResponse> {
        self.statement()?.fetch().await
    }

    /// Send the request and return text response
    pub async fn send_text(self) -> Result<String> {
        let response = self.send().await?;
        response.text().await
    }

    /// Send the request and return bytes response
    pub async fn send_bytes(self) -> Result<Bytes> {
        let response = self.send().await?;
        response.bytes().await
    }

    /// Send the request and hand the streaming response to `block`
    ///
    /// The response is released once `block` completes.
    pub async fn execute<F, Fut, T>(self, block: F) -> Result<T>
    where
        F: FnOnce(HttpResponse) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.statement()?.execute(block).await
    }

    fn map(mut self, update: impl FnOnce(&mut HttpRequestBuilder)) -> Self {
        if let Ok(request) = self.inner.as_mut() {
            update(request);
        }
        self
    }

    fn update_timeouts(self, update: impl FnOnce(&mut HttpTimeoutAttributes)) -> Self {
        self.map(|request| {
            let mut timeouts = request
                .attributes()
                .get(HttpTimeout::ATTRIBUTE_KEY)
                .copied()
                .unwrap_or_default();
            update(&mut timeouts);
            request.attributes_mut().put(HttpTimeout::ATTRIBUTE_KEY, timeouts);
        })
    }
}

impl std::fmt::Debug for RequestBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            Ok(request) => f.debug_tuple("RequestBuilder").field(request).finish(),
            Err(err) => f.debug_tuple("RequestBuilder").field(&err.to_string()).finish(),
        }
    }
}

pub(crate) fn invalid_url(url: &str, err: url::ParseError) -> Error {
    Error::invalid_request(format!("Invalid URL '{}': {}", url, err))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRACE_ID: AttributeKey<String> = AttributeKey::new("TraceId");

    #[test]
    fn test_request_builder_creation() {
        let url = "https://httpbin.org/get".parse().unwrap();
        let request = HttpRequestBuilder::new(Method::GET, url);
        assert_eq!(request.method(), &Method::GET);
        assert!(request.body().is_empty());
    }

    #[test]
    fn test_take_from_copies_everything() {
        let mut source = HttpRequestBuilder::new(Method::POST, "http://localhost/a".parse().unwrap());
        source.append_header("X-Test", "1").unwrap();
        source.set_body(OutgoingContent::text("payload"));
        source.attributes_mut().put(TRACE_ID, "abc".to_string());

        let mut target = HttpRequestBuilder::new(Method::GET, "http://localhost/b".parse().unwrap());
        target.take_from(&source);

        assert_eq!(target.method(), &Method::POST);
        assert_eq!(target.url().path(), "/a");
        assert_eq!(target.headers()["x-test"], "1");
        assert_eq!(target.body().content_length(), Some(7));
        assert_eq!(target.attributes().get(TRACE_ID).map(String::as_str), Some("abc"));
    }

    #[test]
    fn test_build_and_replay() {
        let mut builder = HttpRequestBuilder::new(Method::PUT, "http://localhost/x".parse().unwrap());
        builder.append_header("Accept", "text/plain").unwrap();

        let data = builder.build(CallScope::root());
        let request = HttpRequest::from(&data);
        let replay = HttpRequestBuilder::from_request(&request);

        assert_eq!(replay.method(), &Method::PUT);
        assert_eq!(replay.url(), data.url());
        assert_eq!(replay.headers()["accept"], "text/plain");
    }

    #[test]
    fn test_invalid_header_is_rejected() {
        let mut builder = HttpRequestBuilder::new(Method::GET, "http://localhost/".parse().unwrap());
        let err = builder.append_header("bad header", "x").unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }
}
