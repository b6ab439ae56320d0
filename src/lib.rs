//! RustTPX core - the pipeline-based engine behind the RustTPX HTTP client
//!
//! Requests travel through three pipelines of named phases. The request
//! pipeline runs once per logical call and ends in the send coordinator,
//! which runs the send pipeline once per physical exchange. The send
//! pipeline hands the request to a pluggable engine and runs the receive
//! pipeline over the response. Timeouts, redirects, cookies, caching,
//! validation and logging are features that hook into those pipelines.
//!
//! ## Features
//!
//! - **Pluggable engines**: a `reqwest` engine and a handler-driven mock engine
//! - **Send/resend coordination** with a bounded send count
//! - **Request, connect and socket timeouts** with engine fallbacks
//! - **Redirects**, **cookies** and an **HTTP cache** as installable features
//! - **Streaming responses** whose resources are released on completion or cancellation
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rusttpx_core::features::timeout::HttpTimeout;
//! use rusttpx_core::engine::ReqwestEngine;
//! use rusttpx_core::HttpClient;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = HttpClient::builder(Arc::new(ReqwestEngine::new()?))
//!         .install::<HttpTimeout, _>(|cfg| cfg.request_timeout_millis = Some(10_000))
//!         .build()?;
//!
//!     let response = client.get("https://httpbin.org/json").send().await?;
//!     println!("Status: {}", response.status());
//!     println!("Body: {}", response.text().await?);
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```

pub mod attributes;
pub mod body;
pub mod cache;
pub mod call;
pub mod client;
pub mod engine;
pub mod error;
pub mod feature;
pub mod features;
pub mod pipeline;
pub mod pipelines;
pub mod request;
pub mod response;
pub mod scope;
pub mod statement;

// Re-export main types for convenience
pub use attributes::{AttributeKey, Attributes};
pub use body::{ByteStream, OutgoingContent, ResponseBody};
pub use call::HttpClientCall;
pub use client::{HttpClient, HttpClientBuilder};
pub use engine::{EngineCapability, EngineConfig, HttpClientEngine};
pub use error::{Error, ResponseStatusError, Result};
pub use feature::{ClientSetup, HttpClientFeature};
pub use pipeline::{Interceptor, Pipeline, PipelineContext, PipelinePhase};
pub use request::{HttpRequest, HttpRequestBuilder, HttpRequestData, RequestBuilder};
pub use response::{HttpResponse, HttpResponseData};
pub use scope::{CallScope, CancelCause};
pub use statement::HttpStatement;

// Re-export common HTTP types
pub use http::{HeaderMap, HeaderValue, Method, StatusCode, Version};

// Re-export URL types
pub use url::Url;

// Re-export time types
pub use std::time::Duration;

// Re-export common traits
pub use async_trait::async_trait;
