use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use rusttpx_core::engine::mock::{headers_of, respond, respond_ok, respond_redirect};
use rusttpx_core::engine::{MockEngine, MockEngineConfig, ReqwestEngine};
use rusttpx_core::features::cookies::HttpCookies;
use rusttpx_core::features::logging::HttpLogging;
use rusttpx_core::features::timeout::{HttpTimeout, HttpTimeoutConfig};
use rusttpx_core::{HttpClient, StatusCode, Url};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    println!("=== Redirects and Cookies (mock engine) ===");

    let engine = Arc::new(MockEngine::new(
        MockEngineConfig::new()
            .add_handler(|_| async {
                let headers = headers_of(&[("location", "/welcome"), ("set-cookie", "session=demo; Path=/")])?;
                Ok(respond(StatusCode::FOUND, headers, ""))
            })
            .add_handler(|request| async move {
                let cookie = request
                    .headers()
                    .get("cookie")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("none")
                    .to_string();
                Ok(respond_ok(format!("welcome back, cookies: {}", cookie)))
            }),
    ));
    let client = HttpClient::builder(engine.clone())
        .install::<HttpCookies, _>(|_| {})
        .install::<HttpLogging, _>(|cfg| cfg.include_headers = true)
        .build()?;

    let text = client.get("http://demo.local/login").send_text().await?;
    println!("Body: {}", text);
    println!("Physical sends: {}", engine.request_count());
    println!("Stored cookies: {:?}", client.cookies(&Url::parse("http://demo.local/")?).await);

    println!("\n=== Send Limit ===");

    let looping = Arc::new(MockEngine::with_handler(|_| async {
        respond_redirect(StatusCode::FOUND, "/again")
    }));
    let client = HttpClient::new(looping)?;
    match client.get("http://demo.local/again").send().await {
        Ok(_) => println!("Unexpected: loop completed"),
        Err(e) => println!("Expected error: {}", e),
    }

    println!("\n=== Request Timeout ===");

    let slow = Arc::new(MockEngine::with_handler(|_| async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(respond_ok("too late"))
    }));
    let client = HttpClient::builder(slow)
        .install::<HttpTimeout, _>(|cfg| *cfg = HttpTimeoutConfig::quick())
        .build()?;
    match client
        .get("http://demo.local/slow")
        .timeout(Duration::from_millis(100))
        .send()
        .await
    {
        Ok(_) => println!("Unexpected: request completed"),
        Err(e) => println!("Expected timeout error: {} (timeout: {})", e, e.is_timeout()),
    }

    println!("\n=== Streaming Response (reqwest engine) ===");

    let client = HttpClient::builder(Arc::new(ReqwestEngine::new()?))
        .install::<HttpTimeout, _>(|cfg| cfg.request_timeout_millis = Some(10_000))
        .build()?;
    let result = client
        .get("https://httpbin.org/stream/3")
        .execute(|response| async move {
            println!("Status: {}", response.status());
            let mut stream = response.bytes_stream()?;
            let mut chunks = 0;
            while let Some(chunk) = stream.next().await {
                chunks += 1;
                println!("Chunk {}: {} bytes", chunks, chunk?.len());
            }
            Ok(chunks)
        })
        .await;
    match result {
        Ok(chunks) => println!("Received {} chunks", chunks),
        Err(e) => println!("Streaming failed (offline?): {}", e),
    }

    client.close().await;
    Ok(())
}
