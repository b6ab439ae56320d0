//! Installable client features.

use std::sync::Arc;

use crate::attributes::{AttributeKey, Attributes};
use crate::engine::{EngineCapability, EngineConfig};
use crate::error::{Error, Result};
use crate::features::send::SendInterceptor;
use crate::pipelines::{ClientPipelines, HttpReceivePipeline, HttpRequestPipeline, HttpSendPipeline};

/// Cross-cutting extension installed into a client's pipelines
///
/// A feature is configured through its [`HttpClientFeature::Config`],
/// validated by [`HttpClientFeature::prepare`] and then registers its
/// interceptors in [`HttpClientFeature::install`]. A client holds at most one
/// instance of every feature, retrievable with
/// [`HttpClient::feature`](crate::client::HttpClient::feature).
pub trait HttpClientFeature: Send + Sync + Sized + 'static {
    /// Feature configuration
    type Config: Default;

    /// Key the installed feature is stored under
    const KEY: AttributeKey<Self>;

    /// Validate the configuration and create the feature
    fn prepare(config: Self::Config) -> Result<Self>;

    /// Register interceptors
    fn install(feature: Arc<Self>, setup: &mut ClientSetup) -> Result<()>;
}

/// Everything a feature can touch while it is installed
pub struct ClientSetup {
    pipelines: ClientPipelines,
    send_interceptors: Vec<Arc<dyn SendInterceptor>>,
    capabilities: Vec<EngineCapability>,
    engine_config: EngineConfig,
    features: Attributes,
}

impl ClientSetup {
    pub(crate) fn new(capabilities: Vec<EngineCapability>, engine_config: EngineConfig) -> Result<Self> {
        Ok(Self {
            pipelines: ClientPipelines::new()?,
            send_interceptors: Vec::new(),
            capabilities,
            engine_config,
            features: Attributes::new(),
        })
    }

    /// Get the request pipeline
    pub fn request_pipeline(&mut self) -> &mut HttpRequestPipeline {
        &mut self.pipelines.request
    }

    /// Get the send pipeline
    pub fn send_pipeline(&mut self) -> &mut HttpSendPipeline {
        &mut self.pipelines.send
    }

    /// Get the receive pipeline
    pub fn receive_pipeline(&mut self) -> &mut HttpReceivePipeline {
        &mut self.pipelines.receive
    }

    /// Register a send interceptor after the already registered ones
    pub fn add_send_interceptor(&mut self, interceptor: Arc<dyn SendInterceptor>) {
        self.send_interceptors.push(interceptor);
    }

    /// Check whether the engine handles `capability` natively
    pub fn engine_supports(&self, capability: EngineCapability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Get the engine configuration
    pub fn engine_config(&self) -> &EngineConfig {
        &self.engine_config
    }

    /// Check whether feature `F` is already installed
    pub fn is_installed<F: HttpClientFeature>(&self) -> bool {
        self.features.contains(F::KEY)
    }

    /// Prepare and install feature `F`
    pub fn install<F, C>(&mut self, configure: C) -> Result<Arc<F>>
    where
        F: HttpClientFeature,
        C: FnOnce(&mut F::Config),
    {
        if self.is_installed::<F>() {
            return Err(Error::config(format!("Feature {} is already installed", F::KEY.name())));
        }
        let mut config = F::Config::default();
        configure(&mut config);
        let feature = Arc::new(F::prepare(config)?);
        F::install(feature.clone(), self)?;
        self.features.put_arc(F::KEY, feature.clone());
        tracing::debug!(feature = F::KEY.name(), "installed feature");
        Ok(feature)
    }

    pub(crate) fn into_parts(self) -> (ClientPipelines, Vec<Arc<dyn SendInterceptor>>, Attributes) {
        (self.pipelines, self.send_interceptors, self.features)
    }
}

impl std::fmt::Debug for ClientSetup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSetup")
            .field("pipelines", &self.pipelines)
            .field("send_interceptors", &self.send_interceptors.len())
            .field("features", &self.features.key_names())
            .finish()
    }
}
