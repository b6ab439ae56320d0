//! Defaults applied to every request of a client.

use std::sync::Arc;

use async_trait::async_trait;
use http::header::HeaderName;
use http::{HeaderMap, HeaderValue};
use url::Url;

use crate::attributes::AttributeKey;
use crate::body::OutgoingContent;
use crate::error::{Error, Result};
use crate::feature::{ClientSetup, HttpClientFeature};
use crate::pipeline::{Interceptor, PipelineContext};
use crate::pipelines::{HttpRequestPhase, RequestContext};
use crate::request::invalid_url;

/// Configuration for [`DefaultRequest`]
#[derive(Debug, Clone, Default)]
pub struct DefaultRequestConfig {
    /// URL relative request URLs are resolved against
    pub base_url: Option<String>,
    headers: Vec<(String, String)>,
}

impl DefaultRequestConfig {
    /// Add a header sent when the request does not set it
    pub fn header(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Feature applying a base URL and default headers
///
/// Headers already present on a request win over the defaults.
#[derive(Debug)]
pub struct DefaultRequest {
    base_url: Option<Url>,
    headers: HeaderMap,
}

impl DefaultRequest {
    /// Get the base URL
    pub fn base_url(&self) -> Option<&Url> {
        self.base_url.as_ref()
    }

    /// Get the default headers
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Parse `url`, resolving it against the base URL when it is relative
    pub fn resolve(&self, url: &str) -> Result<Url> {
        match (Url::parse(url), &self.base_url) {
            (Ok(url), _) => Ok(url),
            (Err(url::ParseError::RelativeUrlWithoutBase), Some(base)) => {
                base.join(url).map_err(|err| invalid_url(url, err))
            }
            (Err(err), _) => Err(invalid_url(url, err)),
        }
    }

    /// Copy every default header missing from `headers`
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        for name in self.headers.keys() {
            if headers.contains_key(name) {
                continue;
            }
            for value in self.headers.get_all(name) {
                headers.append(name.clone(), value.clone());
            }
        }
    }
}

impl HttpClientFeature for DefaultRequest {
    type Config = DefaultRequestConfig;
    const KEY: AttributeKey<Self> = AttributeKey::new("DefaultRequest");

    fn prepare(config: DefaultRequestConfig) -> Result<Self> {
        let base_url = match config.base_url {
            Some(base) => Some(
                Url::parse(&base).map_err(|err| Error::config(format!("Invalid base URL '{}': {}", base, err)))?,
            ),
            None => None,
        };

        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let name = name
                .parse::<HeaderName>()
                .map_err(|err| Error::config(format!("Invalid default header name '{}': {}", name, err)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|err| Error::config(format!("Invalid default header value for {}: {}", name, err)))?;
            headers.append(name, value);
        }

        Ok(Self { base_url, headers })
    }

    fn install(feature: Arc<Self>, setup: &mut ClientSetup) -> Result<()> {
        setup
            .request_pipeline()
            .intercept(HttpRequestPhase::BEFORE, ApplyDefaults { feature })
    }
}

struct ApplyDefaults {
    feature: Arc<DefaultRequest>,
}

#[async_trait]
impl Interceptor<OutgoingContent, RequestContext> for ApplyDefaults {
    async fn intercept(&self, ctx: &mut PipelineContext<OutgoingContent, RequestContext>) -> Result<()> {
        self.feature.apply_headers(ctx.context_mut().request.headers_mut());
        Ok(())
    }

    fn name(&self) -> &str {
        "ApplyDefaults"
    }
}
