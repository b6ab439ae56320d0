//! Request and response logging through the `log` facade.

use std::sync::Arc;

use async_trait::async_trait;
use http::header::{HeaderName, AUTHORIZATION, COOKIE, PROXY_AUTHORIZATION, SET_COOKIE};
use http::HeaderMap;

use crate::attributes::AttributeKey;
use crate::body::OutgoingContent;
use crate::error::Result;
use crate::feature::{ClientSetup, HttpClientFeature};
use crate::pipeline::{Interceptor, PipelineContext};
use crate::pipelines::{HttpReceivePhase, HttpSendPhase, ReceiveContext, RequestContext};
use crate::response::HttpResponse;

const REDACTED: &str = "***";

/// Configuration for [`HttpLogging`]
#[derive(Debug, Clone)]
pub struct HttpLoggingConfig {
    /// Level every line is logged at
    pub level: log::Level,
    /// Log request and response headers
    pub include_headers: bool,
    /// Headers whose values are replaced with `***`
    pub sanitized_headers: Vec<HeaderName>,
}

impl HttpLoggingConfig {
    /// Also redact `name`
    pub fn sanitize(&mut self, name: HeaderName) -> &mut Self {
        if !self.sanitized_headers.contains(&name) {
            self.sanitized_headers.push(name);
        }
        self
    }
}

impl Default for HttpLoggingConfig {
    fn default() -> Self {
        Self {
            level: log::Level::Info,
            include_headers: false,
            sanitized_headers: vec![AUTHORIZATION, PROXY_AUTHORIZATION, COOKIE, SET_COOKIE],
        }
    }
}

/// Logging feature
///
/// Every physical send is logged, so redirects and retries show up as
/// separate exchanges.
#[derive(Debug)]
pub struct HttpLogging {
    level: log::Level,
    include_headers: bool,
    sanitized_headers: Vec<HeaderName>,
}

impl HttpLogging {
    /// Get the log level
    pub fn level(&self) -> log::Level {
        self.level
    }

    /// Render headers as `name: value` lines, redacting sanitized ones
    pub fn render_headers(&self, headers: &HeaderMap) -> Vec<String> {
        headers
            .iter()
            .map(|(name, value)| {
                let value = if self.sanitized_headers.contains(name) {
                    REDACTED
                } else {
                    value.to_str().unwrap_or("<binary>")
                };
                format!("{}: {}", name, value)
            })
            .collect()
    }

    fn log_headers(&self, headers: &HeaderMap) {
        if !self.include_headers {
            return;
        }
        for line in self.render_headers(headers) {
            log::log!(self.level, "  {}", line);
        }
    }
}

impl HttpClientFeature for HttpLogging {
    type Config = HttpLoggingConfig;
    const KEY: AttributeKey<Self> = AttributeKey::new("HttpLogging");

    fn prepare(config: HttpLoggingConfig) -> Result<Self> {
        Ok(Self {
            level: config.level,
            include_headers: config.include_headers,
            sanitized_headers: config.sanitized_headers,
        })
    }

    fn install(feature: Arc<Self>, setup: &mut ClientSetup) -> Result<()> {
        setup
            .send_pipeline()
            .intercept(HttpSendPhase::MONITORING, LogRequest { feature: feature.clone() })?;
        setup
            .receive_pipeline()
            .intercept(HttpReceivePhase::AFTER, LogResponse { feature })
    }
}

struct LogRequest {
    feature: Arc<HttpLogging>,
}

#[async_trait]
impl Interceptor<OutgoingContent, RequestContext> for LogRequest {
    async fn intercept(&self, ctx: &mut PipelineContext<OutgoingContent, RequestContext>) -> Result<()> {
        let request = &ctx.context().request;
        log::log!(self.feature.level, "REQUEST: {} {}", request.method(), request.url());
        self.feature.log_headers(request.headers());
        if let Some(content_type) = ctx.subject().content_type() {
            log::log!(self.feature.level, "  body: {}", content_type);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "LogRequest"
    }
}

struct LogResponse {
    feature: Arc<HttpLogging>,
}

#[async_trait]
impl Interceptor<HttpResponse, ReceiveContext> for LogResponse {
    async fn intercept(&self, ctx: &mut PipelineContext<HttpResponse, ReceiveContext>) -> Result<()> {
        let response = ctx.subject();
        let elapsed = response.response_time() - response.request_time();
        log::log!(
            self.feature.level,
            "RESPONSE: {} {} ({}ms)",
            response.status(),
            ctx.context().request.url(),
            elapsed.num_milliseconds()
        );
        self.feature.log_headers(response.headers());
        Ok(())
    }

    fn name(&self) -> &str {
        "LogResponse"
    }
}
