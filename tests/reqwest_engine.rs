use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use rusttpx_core::engine::{EngineConfig, ReqwestEngine};
use rusttpx_core::features::cookies::HttpCookies;
use rusttpx_core::features::timeout::HttpTimeout;
use rusttpx_core::pipelines::HttpReceivePhase;
use rusttpx_core::{Error, HttpClient, StatusCode};
use wiremock::matchers::{body_string, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client() -> (Arc<ReqwestEngine>, HttpClient) {
    let engine = Arc::new(ReqwestEngine::new().unwrap());
    let client = HttpClient::new(engine.clone()).unwrap();
    (engine, client)
}

#[tokio::test]
async fn test_status_and_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/hello"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-served-by", "wiremock")
                .set_body_string("hello world"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (_, client) = client();
    let response = client.get(format!("{}/hello", server.uri())).send().await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.header("x-served-by").unwrap(), "wiremock");
    assert_eq!(response.text().await.unwrap(), "hello world");
}

#[tokio::test]
async fn test_request_body_is_sent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/items"))
        .and(header("content-type", "text/plain; charset=utf-8"))
        .and(body_string("payload"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let (_, client) = client();
    let response = client
        .post(format!("{}/items", server.uri()))
        .text("payload")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn test_streamed_request_bodies_are_uploaded() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/upload"))
        .and(body_string("part1;part2;part3;"))
        .respond_with(ResponseTemplate::new(204))
        .expect(2)
        .mount(&server)
        .await;

    let (_, client) = client();
    let url = format!("{}/upload", server.uri());

    let response = client
        .put(&url)
        .body_writer(|mut writer| async move {
            for part in 1..=3 {
                writer.write(format!("part{};", part)).await?;
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            Ok(())
        })
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = client
        .put(&url)
        .body_stream(|| {
            futures::stream::iter(["part1;", "part2;", "part3;"].map(|part| Ok(Bytes::from(part)))).boxed()
        })
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_redirects_are_followed_by_the_client() {
    let server = MockServer::start().await;
    Mock::given(path("/old"))
        .respond_with(ResponseTemplate::new(302).insert_header("location", "/new"))
        .mount(&server)
        .await;
    Mock::given(path("/new"))
        .respond_with(ResponseTemplate::new(200).set_body_string("moved"))
        .mount(&server)
        .await;

    let (_, client) = client();
    let text = client.get(format!("{}/old", server.uri())).send_text().await.unwrap();
    assert_eq!(text, "moved");

    let engine = Arc::new(ReqwestEngine::new().unwrap());
    let manual = HttpClient::builder(engine).follow_redirects(false).build().unwrap();
    let response = manual.get(format!("{}/old", server.uri())).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::FOUND);
}

#[tokio::test]
async fn test_native_request_timeout_is_mapped() {
    let server = MockServer::start().await;
    Mock::given(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let (_, client) = client();
    let err = client
        .get(format!("{}/slow", server.uri()))
        .timeout(Duration::from_millis(100))
        .send()
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RequestTimeout { .. }), "unexpected error: {}", err);
}

#[tokio::test]
async fn test_sub_clients_are_reused() {
    let server = MockServer::start().await;
    Mock::given(path("/ping"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let (engine, client) = client();
    let url = format!("{}/ping", server.uri());
    for _ in 0..3 {
        client
            .get(&url)
            .connect_timeout(Duration::from_secs(3))
            .send()
            .await
            .unwrap();
    }
    assert_eq!(engine.cached_clients(), 1);

    client
        .get(&url)
        .connect_timeout(Duration::from_secs(4))
        .send()
        .await
        .unwrap();
    assert_eq!(engine.cached_clients(), 2);

    client.get(&url).send().await.unwrap();
    assert_eq!(engine.cached_clients(), 2);

    client.close().await;
    assert_eq!(engine.cached_clients(), 0);
}

#[tokio::test]
async fn test_socket_timeout_falls_back_to_feature() {
    let server = MockServer::start().await;
    Mock::given(path("/data"))
        .respond_with(ResponseTemplate::new(200).set_body_string("data"))
        .mount(&server)
        .await;

    let config = EngineConfig::new().connect_timeout(Duration::from_secs(5));
    let engine = Arc::new(ReqwestEngine::with_config(config).unwrap());
    let client = HttpClient::builder(engine)
        .install::<HttpTimeout, _>(|cfg| cfg.socket_timeout_millis = Some(1_000))
        .build()
        .unwrap();

    assert_eq!(
        client.pipelines().receive.interceptor_names(HttpReceivePhase::BEFORE),
        vec!["SocketInactivity"]
    );
    let text = client.get(format!("{}/data", server.uri())).send_text().await.unwrap();
    assert_eq!(text, "data");
}

#[tokio::test]
async fn test_connection_refused_is_a_network_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let (_, client) = client();
    let err = client
        .get(format!("http://127.0.0.1:{}/", port))
        .send()
        .await
        .unwrap_err();
    assert!(err.is_network(), "unexpected error: {}", err);
}

#[tokio::test]
async fn test_cookies_are_sent_back() {
    let server = MockServer::start().await;
    Mock::given(path("/login"))
        .respond_with(ResponseTemplate::new(200).insert_header("set-cookie", "token=xyz; Path=/"))
        .mount(&server)
        .await;
    Mock::given(path("/profile"))
        .and(header("cookie", "token=xyz"))
        .respond_with(ResponseTemplate::new(200).set_body_string("welcome"))
        .expect(1)
        .mount(&server)
        .await;

    let engine = Arc::new(ReqwestEngine::new().unwrap());
    let client = HttpClient::builder(engine)
        .install::<HttpCookies, _>(|_| {})
        .expect_success(true)
        .build()
        .unwrap();

    client.get(format!("{}/login", server.uri())).send().await.unwrap();
    let text = client
        .get(format!("{}/profile", server.uri()))
        .send_text()
        .await
        .unwrap();
    assert_eq!(text, "welcome");
}

#[tokio::test]
async fn test_error_status_is_validated() {
    let server = MockServer::start().await;
    Mock::given(path("/missing"))
        .respond_with(ResponseTemplate::new(404).set_body_string("no such thing"))
        .mount(&server)
        .await;

    let engine = Arc::new(ReqwestEngine::new().unwrap());
    let client = HttpClient::builder(engine).expect_success(true).build().unwrap();

    let err = client
        .get(format!("{}/missing", server.uri()))
        .send()
        .await
        .unwrap_err();
    let status = err.as_status_error().unwrap();
    assert_eq!(status.status(), StatusCode::NOT_FOUND);
    assert_eq!(status.body(), "no such thing");
}
