//! Send coordination: drives the physical sends of one logical call.

use std::sync::Arc;

use async_trait::async_trait;

use crate::attributes::AttributeKey;
use crate::body::OutgoingContent;
use crate::call::HttpClientCall;
use crate::client::HttpClient;
use crate::error::{Error, Result};
use crate::feature::{ClientSetup, HttpClientFeature};
use crate::pipeline::{Interceptor, PipelineContext};
use crate::pipelines::{HttpRequestPhase, RequestContext};
use crate::request::HttpRequestBuilder;
use crate::scope::{CallScope, CancelCause};

/// Default limit of physical sends per logical call
pub const DEFAULT_MAX_SEND_COUNT: usize = 20;

/// Performs physical sends on behalf of send interceptors
#[async_trait]
pub trait Sender: Send {
    /// Run the send pipeline for `request`
    async fn execute(&mut self, request: HttpRequestBuilder) -> Result<HttpClientCall>;
}

/// Inspects every produced call and may replace it with a new one
///
/// Returning a call with a different [`HttpClientCall::id`] makes the
/// coordinator run every interceptor again over the new call.
#[async_trait]
pub trait SendInterceptor: Send + Sync {
    /// Process a call, sending again through `sender` when needed
    async fn intercept(&self, sender: &mut dyn Sender, call: HttpClientCall) -> Result<HttpClientCall>;

    /// Get the name of this interceptor
    fn name(&self) -> &str {
        "Unknown"
    }
}

/// Configuration for [`HttpSend`]
#[derive(Debug, Clone)]
pub struct HttpSendConfig {
    /// Maximum physical sends per logical call
    pub max_send_count: usize,
}

impl Default for HttpSendConfig {
    fn default() -> Self {
        Self {
            max_send_count: DEFAULT_MAX_SEND_COUNT,
        }
    }
}

/// Feature coordinating sends and resends
///
/// Always installed. It terminates the request pipeline: the first send runs
/// the send pipeline, then every registered [`SendInterceptor`] gets a chance
/// to replace the call until a full pass leaves it unchanged.
#[derive(Debug)]
pub struct HttpSend {
    max_send_count: usize,
}

impl HttpSend {
    /// Get the send limit
    pub fn max_send_count(&self) -> usize {
        self.max_send_count
    }
}

impl HttpClientFeature for HttpSend {
    type Config = HttpSendConfig;
    const KEY: AttributeKey<Self> = AttributeKey::new("HttpSend");

    fn prepare(config: HttpSendConfig) -> Result<Self> {
        if config.max_send_count == 0 {
            return Err(Error::config("Max send count must be greater than zero"));
        }
        Ok(Self {
            max_send_count: config.max_send_count,
        })
    }

    fn install(feature: Arc<Self>, setup: &mut ClientSetup) -> Result<()> {
        setup
            .request_pipeline()
            .intercept(HttpRequestPhase::SEND, SendCoordinator { feature })
    }
}

/// Sender running the client's send pipeline within one execution
pub struct DefaultSender {
    client: HttpClient,
    execution: CallScope,
    max_send_count: usize,
    sent_count: usize,
    previous: Option<CallScope>,
}

impl DefaultSender {
    /// Create a sender bound to `execution`
    pub fn new(client: HttpClient, execution: CallScope, max_send_count: usize) -> Self {
        Self {
            client,
            execution,
            max_send_count,
            sent_count: 0,
            previous: None,
        }
    }

    /// Number of sends performed so far
    pub fn sent_count(&self) -> usize {
        self.sent_count
    }
}

#[async_trait]
impl Sender for DefaultSender {
    async fn execute(&mut self, request: HttpRequestBuilder) -> Result<HttpClientCall> {
        if let Some(previous) = self.previous.take() {
            previous.cancel(CancelCause::Superseded);
        }
        if self.sent_count >= self.max_send_count {
            return Err(Error::SendCountExceeded {
                max_send_count: self.max_send_count,
            });
        }
        self.sent_count += 1;
        tracing::trace!(sent = self.sent_count, url = %request.url(), "sending request");

        let call = self
            .client
            .execute_send_pipeline(request, self.execution.clone())
            .await?;
        self.previous = Some(call.scope().clone());
        Ok(call)
    }
}

impl std::fmt::Debug for DefaultSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefaultSender")
            .field("max_send_count", &self.max_send_count)
            .field("sent_count", &self.sent_count)
            .finish()
    }
}

struct SendCoordinator {
    feature: Arc<HttpSend>,
}

#[async_trait]
impl Interceptor<OutgoingContent, RequestContext> for SendCoordinator {
    async fn intercept(&self, ctx: &mut PipelineContext<OutgoingContent, RequestContext>) -> Result<()> {
        let body = ctx.subject().clone();
        let context = ctx.context_mut();
        context.request.set_body(body);

        let client = context.client.clone();
        let mut sender = DefaultSender::new(client.clone(), context.execution.clone(), self.feature.max_send_count);
        let mut call = sender.execute(context.request.clone()).await?;

        let interceptors = client.send_interceptors();
        'pass: loop {
            for interceptor in interceptors {
                let id = call.id();
                call = interceptor.intercept(&mut sender, call).await?;
                if call.id() != id {
                    tracing::trace!(interceptor = interceptor.name(), "call replaced");
                    continue 'pass;
                }
            }
            break;
        }

        context.call = Some(call);
        Ok(())
    }

    fn name(&self) -> &str {
        "SendCoordinator"
    }
}
