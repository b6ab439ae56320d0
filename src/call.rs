use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Result;
use crate::request::HttpRequest;
use crate::response::HttpResponse;
use crate::scope::{CallScope, CancelCause};

static NEXT_CALL_ID: AtomicU64 = AtomicU64::new(1);

/// One request/response pair produced by a physical send
///
/// Every call gets a process-unique id; send interceptors compare ids to tell
/// whether they replaced a call.
#[derive(Debug)]
pub struct HttpClientCall {
    id: u64,
    request: HttpRequest,
    response: HttpResponse,
}

impl HttpClientCall {
    /// Pair a request with its response
    pub fn new(request: HttpRequest, response: HttpResponse) -> Self {
        Self {
            id: NEXT_CALL_ID.fetch_add(1, Ordering::Relaxed),
            request,
            response,
        }
    }

    /// Get the call identity
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Get the request
    pub fn request(&self) -> &HttpRequest {
        &self.request
    }

    /// Get the response
    pub fn response(&self) -> &HttpResponse {
        &self.response
    }

    /// Get mutable access to the response
    pub fn response_mut(&mut self) -> &mut HttpResponse {
        &mut self.response
    }

    /// Get the call scope
    pub fn scope(&self) -> &CallScope {
        self.response.scope()
    }

    /// Cancel the call, releasing its engine resources
    pub fn cancel(&self, cause: CancelCause) -> bool {
        self.scope().cancel(cause)
    }

    /// Read the whole response body and release the engine resources
    ///
    /// The identity of the call is kept.
    pub async fn buffered(self) -> Result<HttpClientCall> {
        let response = self.response.buffered().await?;
        Ok(Self {
            id: self.id,
            request: self.request,
            response,
        })
    }

    /// Split into request and response
    pub fn into_parts(self) -> (HttpRequest, HttpResponse) {
        (self.request, self.response)
    }

    /// Take the response, dropping the request
    pub fn into_response(self) -> HttpResponse {
        self.response
    }
}
