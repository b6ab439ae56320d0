use std::pin::Pin;
use std::sync::{Mutex, PoisonError};
use std::task::{Context, Poll};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue, StatusCode, Version};
use url::Url;

use crate::body::{self, ByteStream, ResponseBody};
use crate::error::{Error, Result};
use crate::scope::CallScope;

/// Response head and body as produced by an engine
#[derive(Debug)]
pub struct HttpResponseData {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    body: ResponseBody,
    request_time: DateTime<Utc>,
    response_time: DateTime<Utc>,
}

impl HttpResponseData {
    /// Create response data, stamping the response time now
    pub fn new(
        status: StatusCode,
        version: Version,
        headers: HeaderMap,
        body: ResponseBody,
        request_time: DateTime<Utc>,
    ) -> Self {
        Self {
            status,
            version,
            headers,
            body,
            request_time,
            response_time: Utc::now(),
        }
    }

    /// Get the HTTP status code
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Get the HTTP version
    pub fn version(&self) -> Version {
        self.version
    }

    /// Get the response headers
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Get the body
    pub fn body(&self) -> &ResponseBody {
        &self.body
    }

    /// Take the body
    pub fn into_body(self) -> ResponseBody {
        self.body
    }

    /// Replace the body
    pub fn map_body(mut self, update: impl FnOnce(ResponseBody) -> ResponseBody) -> Self {
        self.body = update(self.body);
        self
    }

    /// Get the time the request was started
    pub fn request_time(&self) -> DateTime<Utc> {
        self.request_time
    }

    /// Get the time the response head was received
    pub fn response_time(&self) -> DateTime<Utc> {
        self.response_time
    }
}

/// Completes the scopes a response is responsible for when dropped
#[derive(Debug)]
struct CompletionGuard {
    scopes: Vec<CallScope>,
}

impl CompletionGuard {
    fn complete(&self) {
        for scope in &self.scopes {
            scope.complete();
        }
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.complete();
    }
}

/// HTTP response representation
///
/// The body is either already in memory or a live stream bound to the
/// call's scope. Reading the body to the end, or dropping the response,
/// completes the call and releases its engine resources.
#[derive(Debug)]
pub struct HttpResponse {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    body: Mutex<Option<ResponseBody>>,
    url: Url,
    request_time: DateTime<Utc>,
    response_time: DateTime<Utc>,
    scope: CallScope,
    guard: CompletionGuard,
}

impl HttpResponse {
    /// Create a response for the request sent to `url` within `scope`
    pub fn new(data: HttpResponseData, url: Url, scope: CallScope) -> Self {
        Self {
            status: data.status,
            version: data.version,
            headers: data.headers,
            body: Mutex::new(Some(data.body)),
            url,
            request_time: data.request_time,
            response_time: data.response_time,
            guard: CompletionGuard {
                scopes: vec![scope.clone()],
            },
            scope,
        }
    }

    /// Get the HTTP status code
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Get the HTTP version
    pub fn version(&self) -> Version {
        self.version
    }

    /// Get the response headers
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Get mutable access to the response headers
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Get a specific header value
    pub fn header(&self, name: &str) -> Option<&HeaderValue> {
        self.headers.get(name)
    }

    /// Get the content type
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
    }

    /// Get the content length
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse().ok())
    }

    /// Get the URL that was requested
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Get the time the request was started
    pub fn request_time(&self) -> DateTime<Utc> {
        self.request_time
    }

    /// Get the time the response head was received
    pub fn response_time(&self) -> DateTime<Utc> {
        self.response_time
    }

    /// Get the scope of the call that produced this response
    pub fn scope(&self) -> &CallScope {
        &self.scope
    }

    /// Check if the response is successful (2xx status code)
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Check if the response is a client error (4xx status code)
    pub fn is_client_error(&self) -> bool {
        self.status.is_client_error()
    }

    /// Check if the response is a server error (5xx status code)
    pub fn is_server_error(&self) -> bool {
        self.status.is_server_error()
    }

    /// Check if the response indicates a redirect
    pub fn is_redirect(&self) -> bool {
        self.status.is_redirection()
    }

    /// Check if the body is already in memory
    pub fn is_buffered(&self) -> bool {
        self.body
            .lock()
            .map(|body| matches!(body.as_ref(), Some(ResponseBody::Bytes(_))))
            .unwrap_or(false)
    }

    /// Take the body out of the response, leaving it empty
    pub fn take_body(&mut self) -> Result<ResponseBody> {
        self.body_slot()
            .take()
            .ok_or_else(|| Error::invalid_request("Response body has already been consumed"))
    }

    /// Replace the body
    pub fn set_body(&mut self, body: ResponseBody) {
        *self.body_slot() = Some(body);
    }

    /// Also complete `scope` when this response is released
    pub(crate) fn bind_owner(&mut self, scope: CallScope) {
        self.guard.scopes.push(scope);
    }

    /// Scopes completed when this response is released
    pub(crate) fn owned_scopes(&self) -> Vec<CallScope> {
        self.guard.scopes.clone()
    }

    /// Read the whole body into memory and release the call
    ///
    /// The returned response keeps every header and can be read any number
    /// of times.
    pub async fn buffered(mut self) -> Result<HttpResponse> {
        let body = self.take_body()?.collect().await?;
        self.set_body(ResponseBody::Bytes(body));
        self.guard.complete();
        Ok(self)
    }

    /// Get the response body as bytes
    pub async fn bytes(mut self) -> Result<Bytes> {
        let bytes = self.take_body()?.collect().await?;
        self.guard.complete();
        Ok(bytes)
    }

    /// Get the response body as text
    pub async fn text(self) -> Result<String> {
        let bytes = self.bytes().await?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::custom(format!("Response body is not valid UTF-8: {}", e)))
    }

    /// Get a copy of a buffered body without consuming the response
    pub fn buffered_bytes(&self) -> Option<Bytes> {
        match self.body.lock().ok()?.as_ref()? {
            ResponseBody::Bytes(bytes) => Some(bytes.clone()),
            ResponseBody::Stream(_) => None,
        }
    }

    /// Get the response body as a stream of chunks
    ///
    /// The call is completed once the stream ends or is dropped.
    pub fn bytes_stream(mut self) -> Result<ByteStream> {
        let inner = self.take_body()?.into_stream();
        let guard = CompletionGuard {
            scopes: std::mem::take(&mut self.guard.scopes),
        };
        Ok(Box::pin(GuardedStream {
            inner,
            guard: Some(guard),
        }))
    }

    /// Copy the response body to a writer
    pub async fn copy_to<W>(mut self, writer: &mut W) -> Result<u64>
    where
        W: tokio::io::AsyncWrite + Unpin,
    {
        let stream = self.take_body()?.into_stream();
        let written = body::write_to(stream, writer).await?;
        self.guard.complete();
        Ok(written)
    }

    fn body_slot(&mut self) -> &mut Option<ResponseBody> {
        self.body.get_mut().unwrap_or_else(PoisonError::into_inner)
    }
}

struct GuardedStream {
    inner: ByteStream,
    guard: Option<CompletionGuard>,
}

impl Stream for GuardedStream {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let next = self.inner.as_mut().poll_next(cx);
        if let Poll::Ready(None) = next {
            self.guard.take();
        }
        next
    }
}
