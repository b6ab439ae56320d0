//! Response validation.

use std::sync::Arc;

use async_trait::async_trait;

use crate::attributes::AttributeKey;
use crate::body::OutgoingContent;
use crate::error::{Error, ResponseStatusError, Result};
use crate::feature::{ClientSetup, HttpClientFeature};
use crate::pipeline::{Interceptor, PipelineContext};
use crate::pipelines::{HttpRequestPhase, RequestContext};
use crate::response::HttpResponse;

/// Check applied to the final response of every call
#[async_trait]
pub trait ResponseValidator: Send + Sync {
    /// Fail the call by returning an error
    async fn validate(&self, response: &HttpResponse) -> Result<()>;

    /// Get the name of this validator
    fn name(&self) -> &str {
        "Unknown"
    }
}

struct FnValidator<F>(F);

#[async_trait]
impl<F> ResponseValidator for FnValidator<F>
where
    F: Fn(&HttpResponse) -> Result<()> + Send + Sync,
{
    async fn validate(&self, response: &HttpResponse) -> Result<()> {
        (self.0)(response)
    }
}

/// Configuration for [`HttpResponseValidator`]
#[derive(Clone)]
pub struct HttpResponseValidatorConfig {
    /// Fail calls whose final status is 300 or above
    pub expect_success: bool,
    validators: Vec<Arc<dyn ResponseValidator>>,
}

impl HttpResponseValidatorConfig {
    /// Add a validator; validators run in registration order
    pub fn validator<V: ResponseValidator + 'static>(&mut self, validator: V) -> &mut Self {
        self.validators.push(Arc::new(validator));
        self
    }

    /// Add a synchronous validation function
    pub fn validate_with<F>(&mut self, check: F) -> &mut Self
    where
        F: Fn(&HttpResponse) -> Result<()> + Send + Sync + 'static,
    {
        self.validator(FnValidator(check))
    }
}

impl Default for HttpResponseValidatorConfig {
    fn default() -> Self {
        Self {
            expect_success: true,
            validators: Vec::new(),
        }
    }
}

impl std::fmt::Debug for HttpResponseValidatorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpResponseValidatorConfig")
            .field("expect_success", &self.expect_success)
            .field("validators", &self.validators.len())
            .finish()
    }
}

/// Feature validating the response a call settles on
///
/// Runs after redirects and retries, so only the final response is checked.
/// With `expect_success` the body of a failed response is read into the
/// returned [`ResponseStatusError`].
pub struct HttpResponseValidator {
    expect_success: bool,
    validators: Vec<Arc<dyn ResponseValidator>>,
}

impl HttpResponseValidator {
    /// Check whether non-success statuses fail the call
    pub fn expect_success(&self) -> bool {
        self.expect_success
    }

    /// Run user validators over `response`
    pub async fn validate(&self, response: &HttpResponse) -> Result<()> {
        for validator in &self.validators {
            validator.validate(response).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for HttpResponseValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpResponseValidator")
            .field("expect_success", &self.expect_success)
            .field("validators", &self.validators.len())
            .finish()
    }
}

impl HttpClientFeature for HttpResponseValidator {
    type Config = HttpResponseValidatorConfig;
    const KEY: AttributeKey<Self> = AttributeKey::new("HttpResponseValidator");

    fn prepare(config: HttpResponseValidatorConfig) -> Result<Self> {
        Ok(Self {
            expect_success: config.expect_success,
            validators: config.validators,
        })
    }

    fn install(feature: Arc<Self>, setup: &mut ClientSetup) -> Result<()> {
        setup
            .request_pipeline()
            .intercept(HttpRequestPhase::SEND, ValidateResponse { feature })
    }
}

struct ValidateResponse {
    feature: Arc<HttpResponseValidator>,
}

#[async_trait]
impl Interceptor<OutgoingContent, RequestContext> for ValidateResponse {
    async fn intercept(&self, ctx: &mut PipelineContext<OutgoingContent, RequestContext>) -> Result<()> {
        let call = match ctx.context_mut().call.take() {
            Some(call) => call,
            None => return Ok(()),
        };

        self.feature.validate(call.response()).await?;

        let status = call.response().status();
        if !self.feature.expect_success || status.as_u16() < 300 {
            ctx.context_mut().call = Some(call);
            return Ok(());
        }

        let url = call.request().url().clone();
        let body = call.into_response().bytes().await?;
        let body = String::from_utf8_lossy(&body).into_owned();
        tracing::debug!(status = %status, url = %url, "response failed validation");
        Err(Error::ResponseStatus(ResponseStatusError::from_status(status, url, body)))
    }

    fn name(&self) -> &str {
        "ValidateResponse"
    }
}
