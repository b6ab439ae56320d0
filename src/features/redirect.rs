//! Redirect following as a send interceptor.

use std::sync::Arc;

use async_trait::async_trait;
use http::header::LOCATION;
use http::{Method, StatusCode};

use crate::attributes::AttributeKey;
use crate::body::OutgoingContent;
use crate::call::HttpClientCall;
use crate::error::Result;
use crate::feature::{ClientSetup, HttpClientFeature};
use crate::features::send::{SendInterceptor, Sender};
use crate::request::HttpRequestBuilder;

/// Configuration for [`HttpRedirect`]
#[derive(Debug, Clone)]
pub struct HttpRedirectConfig {
    /// Only follow redirects of `GET` and `HEAD` requests
    pub check_http_method: bool,
    /// Follow redirects from `https` to `http`
    pub allow_https_downgrade: bool,
}

impl Default for HttpRedirectConfig {
    fn default() -> Self {
        Self {
            check_http_method: true,
            allow_https_downgrade: false,
        }
    }
}

/// Feature following `Location` redirects
///
/// Every redirect is a new physical send, so chains are bounded by
/// [`HttpSend`](crate::features::send::HttpSend)'s send limit.
#[derive(Debug)]
pub struct HttpRedirect {
    check_http_method: bool,
    allow_https_downgrade: bool,
}

impl HttpRedirect {
    /// Check whether the redirect of a `method` request is followed
    pub fn follows(&self, method: &Method) -> bool {
        !self.check_http_method || *method == Method::GET || *method == Method::HEAD
    }

    /// Compute the request following `call`, if any
    pub fn next_request(&self, call: &HttpClientCall) -> Option<HttpRequestBuilder> {
        let status = call.response().status();
        if !is_redirect_status(status) || !self.follows(call.request().method()) {
            return None;
        }
        let location = call.response().header(LOCATION.as_str())?.to_str().ok()?;
        let current = call.request().url();
        let target = match current.join(location) {
            Ok(target) => target,
            Err(err) => {
                tracing::warn!(location, error = %err, "ignoring malformed redirect location");
                return None;
            }
        };
        if current.scheme() == "https" && target.scheme() == "http" && !self.allow_https_downgrade {
            tracing::debug!(from = %current, to = %target, "refusing https downgrade");
            return None;
        }

        let mut next = HttpRequestBuilder::from_request(call.request());
        next.set_url(target);
        if status == StatusCode::SEE_OTHER {
            next.set_method(Method::GET);
            next.set_body(OutgoingContent::NoContent);
        }
        Some(next)
    }
}

impl HttpClientFeature for HttpRedirect {
    type Config = HttpRedirectConfig;
    const KEY: AttributeKey<Self> = AttributeKey::new("HttpRedirect");

    fn prepare(config: HttpRedirectConfig) -> Result<Self> {
        Ok(Self {
            check_http_method: config.check_http_method,
            allow_https_downgrade: config.allow_https_downgrade,
        })
    }

    fn install(feature: Arc<Self>, setup: &mut ClientSetup) -> Result<()> {
        setup.add_send_interceptor(Arc::new(FollowRedirects { feature }));
        Ok(())
    }
}

fn is_redirect_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

struct FollowRedirects {
    feature: Arc<HttpRedirect>,
}

#[async_trait]
impl SendInterceptor for FollowRedirects {
    async fn intercept(&self, sender: &mut dyn Sender, call: HttpClientCall) -> Result<HttpClientCall> {
        match self.feature.next_request(&call) {
            Some(next) => {
                tracing::debug!(status = %call.response().status(), to = %next.url(), "following redirect");
                sender.execute(next).await
            }
            None => Ok(call),
        }
    }

    fn name(&self) -> &str {
        "FollowRedirects"
    }
}
