use std::future::Future;

use crate::client::HttpClient;
use crate::error::Result;
use crate::request::HttpRequestBuilder;
use crate::response::HttpResponse;

/// Prepared request that can be executed any number of times
///
/// Every execution is a new logical call with its own sends, timeouts and
/// resources.
#[derive(Debug, Clone)]
pub struct HttpStatement {
    builder: HttpRequestBuilder,
    client: HttpClient,
}

impl HttpStatement {
    /// Prepare `builder` for execution on `client`
    pub fn new(builder: HttpRequestBuilder, client: HttpClient) -> Self {
        Self { builder, client }
    }

    /// Get the prepared request
    pub fn request(&self) -> &HttpRequestBuilder {
        &self.builder
    }

    /// Get the client the statement runs on
    pub fn client(&self) -> &HttpClient {
        &self.client
    }

    /// Execute and hand the streaming response to `block`
    ///
    /// The call is completed once `block` returns, whether or not it read
    /// the body, so the response must not escape the block.
    pub async fn execute<F, Fut, T>(&self, block: F) -> Result<T>
    where
        F: FnOnce(HttpResponse) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let response = self.client.execute(self.builder.clone()).await?.into_response();
        let scopes = response.owned_scopes();
        let result = block(response).await;
        for scope in scopes {
            scope.complete();
        }
        result
    }

    /// Execute and return the response with its body read into memory
    pub async fn fetch(&self) -> Result<HttpResponse> {
        let call = self.client.execute(self.builder.clone()).await?;
        call.into_response().buffered().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::respond_ok;
    use crate::engine::MockEngine;
    use futures::StreamExt;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_statement_is_reusable() {
        let engine = Arc::new(MockEngine::with_handler(|_| async { Ok(respond_ok("again")) }));
        let client = HttpClient::new(engine.clone()).unwrap();
        let statement = client.get("http://localhost/").statement().unwrap();

        assert_eq!(statement.fetch().await.unwrap().text().await.unwrap(), "again");
        assert_eq!(statement.fetch().await.unwrap().text().await.unwrap(), "again");
        assert_eq!(engine.request_count(), 2);
    }

    #[tokio::test]
    async fn test_fetch_releases_resources() {
        let engine = Arc::new(MockEngine::with_handler(|_| async { Ok(respond_ok("buffered")) }));
        let client = HttpClient::new(engine.clone()).unwrap();

        let response = client.get("http://localhost/").send().await.unwrap();
        assert!(response.is_buffered());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(engine.active_resources(), 0);
        assert_eq!(response.buffered_bytes().unwrap(), "buffered");
    }

    #[tokio::test]
    async fn test_execute_completes_unread_body() {
        let engine = Arc::new(MockEngine::with_handler(|_| async { Ok(respond_ok("ignored")) }));
        let client = HttpClient::new(engine.clone()).unwrap();

        let status = client
            .get("http://localhost/")
            .execute(|response| async move {
                let status = response.status();
                std::mem::forget(response);
                Ok(status)
            })
            .await
            .unwrap();
        assert!(status.is_success());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(engine.active_resources(), 0);
    }

    #[tokio::test]
    async fn test_execute_streams_body() {
        let engine = Arc::new(MockEngine::with_handler(|_| async { Ok(respond_ok("chunked body")) }));
        let client = HttpClient::new(engine).unwrap();

        let length = client
            .get("http://localhost/")
            .execute(|response| async move {
                let mut stream = response.bytes_stream()?;
                let mut total = 0;
                while let Some(chunk) = stream.next().await {
                    total += chunk?.len();
                }
                Ok(total)
            })
            .await
            .unwrap();
        assert_eq!(length, "chunked body".len());
    }
}
