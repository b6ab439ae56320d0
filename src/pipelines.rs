//! The three pipelines every client runs.
//!
//! A logical call runs the request pipeline once. Its `Send` phase drives the
//! send pipeline once per physical exchange, and the terminal `Engine` phase
//! of the send pipeline hands the request to the engine and runs the receive
//! pipeline over the response.

use std::time::Duration;

use async_trait::async_trait;

use crate::body::OutgoingContent;
use crate::call::HttpClientCall;
use crate::client::HttpClient;
use crate::error::{Error, Result};
use crate::pipeline::{Interceptor, Pipeline, PipelineContext, PipelinePhase};
use crate::request::{HttpRequest, HttpRequestBuilder};
use crate::response::HttpResponse;
use crate::scope::{CallScope, CancelCause};

/// Phases of the request pipeline
pub struct HttpRequestPhase;

impl HttpRequestPhase {
    /// Attribute defaults and timeouts
    pub const BEFORE: PipelinePhase = PipelinePhase::new("Before");
    /// Body encoding
    pub const TRANSFORM: PipelinePhase = PipelinePhase::new("Transform");
    /// Cross-cutting request state
    pub const STATE: PipelinePhase = PipelinePhase::new("State");
    /// Send coordination and response validation
    pub const SEND: PipelinePhase = PipelinePhase::new("Send");
}

/// Phases of the send pipeline
pub struct HttpSendPhase;

impl HttpSendPhase {
    /// First phase of every physical send
    pub const BEFORE: PipelinePhase = PipelinePhase::new("Before");
    /// Per-send state such as cookies and cache lookups
    pub const STATE: PipelinePhase = PipelinePhase::new("State");
    /// Deadlines and logging around the exchange
    pub const MONITORING: PipelinePhase = PipelinePhase::new("Monitoring");
    /// Hand-off to the engine
    pub const ENGINE: PipelinePhase = PipelinePhase::new("Engine");
}

/// Phases of the receive pipeline
pub struct HttpReceivePhase;

impl HttpReceivePhase {
    /// Body wrapping
    pub const BEFORE: PipelinePhase = PipelinePhase::new("Before");
    /// Cookie and cache stores
    pub const STATE: PipelinePhase = PipelinePhase::new("State");
    /// Logging
    pub const AFTER: PipelinePhase = PipelinePhase::new("After");
}

/// Context shared by the request and send pipelines
///
/// Interceptors of the `Send` and `Engine` phases produce or replace
/// [`RequestContext::call`].
#[derive(Debug)]
pub struct RequestContext {
    /// Client running the pipeline
    pub client: HttpClient,
    /// Request being built
    pub request: HttpRequestBuilder,
    /// Call produced so far
    pub call: Option<HttpClientCall>,
    /// Scope of the logical execution
    pub execution: CallScope,
    /// Deadline for the engine to produce the response head
    pub connect_deadline: Option<Duration>,
}

impl RequestContext {
    /// Create a context without a call
    pub fn new(client: HttpClient, request: HttpRequestBuilder, execution: CallScope) -> Self {
        Self {
            client,
            request,
            call: None,
            execution,
            connect_deadline: None,
        }
    }
}

/// Context of the receive pipeline
#[derive(Debug)]
pub struct ReceiveContext {
    /// Client running the pipeline
    pub client: HttpClient,
    /// Request the response answers
    pub request: HttpRequest,
}

/// Pipeline run once per logical call
pub type HttpRequestPipeline = Pipeline<OutgoingContent, RequestContext>;

/// Pipeline run once per physical send
pub type HttpSendPipeline = Pipeline<OutgoingContent, RequestContext>;

/// Pipeline run over every response the engine produces
pub type HttpReceivePipeline = Pipeline<HttpResponse, ReceiveContext>;

/// Pipelines owned by a client
#[derive(Debug)]
pub struct ClientPipelines {
    /// Request pipeline
    pub request: HttpRequestPipeline,
    /// Send pipeline
    pub send: HttpSendPipeline,
    /// Receive pipeline
    pub receive: HttpReceivePipeline,
}

impl ClientPipelines {
    /// Create the three pipelines with their standard phases
    pub fn new() -> Result<Self> {
        Ok(Self {
            request: request_pipeline()?,
            send: send_pipeline()?,
            receive: receive_pipeline()?,
        })
    }
}

/// Create an empty request pipeline
pub fn request_pipeline() -> Result<HttpRequestPipeline> {
    Pipeline::new(&[
        HttpRequestPhase::BEFORE,
        HttpRequestPhase::TRANSFORM,
        HttpRequestPhase::STATE,
        HttpRequestPhase::SEND,
    ])
}

/// Create a send pipeline ending in the engine exchange
pub fn send_pipeline() -> Result<HttpSendPipeline> {
    let mut pipeline = Pipeline::new(&[
        HttpSendPhase::BEFORE,
        HttpSendPhase::STATE,
        HttpSendPhase::MONITORING,
        HttpSendPhase::ENGINE,
    ])?;
    pipeline.intercept(HttpSendPhase::ENGINE, EngineExchange)?;
    Ok(pipeline)
}

/// Create an empty receive pipeline
pub fn receive_pipeline() -> Result<HttpReceivePipeline> {
    Pipeline::new(&[HttpReceivePhase::BEFORE, HttpReceivePhase::STATE, HttpReceivePhase::AFTER])
}

/// Terminal interceptor performing the physical exchange
///
/// Does nothing when an earlier interceptor already produced the call. The
/// connect deadline bounds the engine exchange only, never the receive
/// pipeline.
struct EngineExchange;

#[async_trait]
impl Interceptor<OutgoingContent, RequestContext> for EngineExchange {
    async fn intercept(&self, ctx: &mut PipelineContext<OutgoingContent, RequestContext>) -> Result<()> {
        if ctx.context().call.is_some() {
            return Ok(());
        }

        let body = ctx.subject().clone();
        let context = ctx.context_mut();
        context.request.set_body(body);

        let scope = context.execution.child();
        let data = context.request.build(scope.clone());
        let request = HttpRequest::from(&data);
        let url = data.url().clone();

        let exchange = context.client.engine().execute(data);
        let response = match context.connect_deadline {
            Some(timeout) => match tokio::time::timeout(timeout, exchange).await {
                Ok(result) => result?,
                Err(_) => {
                    tracing::debug!(url = %url, timeout_ms = timeout.as_millis() as u64, "connect deadline expired");
                    scope.cancel(CancelCause::Cancelled("connect deadline expired".into()));
                    return Err(Error::connect_timeout(timeout));
                }
            },
            None => exchange.await?,
        };
        let response = HttpResponse::new(response, url, scope.clone());

        let receive = ReceiveContext {
            client: context.client.clone(),
            request: request.clone(),
        };
        let response = match context.client.pipelines().receive.execute(receive, response).await {
            Ok(response) => response,
            Err(err) => {
                scope.cancel(CancelCause::Cancelled(err.to_string()));
                return Err(err);
            }
        };

        context.call = Some(HttpClientCall::new(request, response));
        Ok(())
    }

    fn name(&self) -> &str {
        "EngineExchange"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_phase_order() {
        let pipelines = ClientPipelines::new().unwrap();
        assert_eq!(
            pipelines.request.phases(),
            vec![
                HttpRequestPhase::BEFORE,
                HttpRequestPhase::TRANSFORM,
                HttpRequestPhase::STATE,
                HttpRequestPhase::SEND
            ]
        );
        assert_eq!(pipelines.send.phases().last(), Some(&HttpSendPhase::ENGINE));
        assert_eq!(pipelines.receive.phases().len(), 3);
    }

    #[test]
    fn test_send_pipeline_ends_with_engine_exchange() {
        let pipeline = send_pipeline().unwrap();
        assert_eq!(pipeline.interceptor_names(HttpSendPhase::ENGINE), vec!["EngineExchange"]);
        assert!(request_pipeline().unwrap().is_empty());
    }
}
