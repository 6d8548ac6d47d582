use std::{collections::HashMap, sync::Arc, time::Duration};

use serde_json::Value;

use crate::{
    cache::{FeatureCache, InMemoryFeatureCache},
    eval::EvalOptions,
    refresh::{RefreshConfig, RefreshStrategy},
    repository::DEFAULT_CACHE_TTL,
    source::{ConfigSource, HttpConfigSource},
    sticky_bucket::StickyBucketService,
    tracking::{NoopTrackingCallback, TrackingCallback},
    Client,
};

/// Configuration for [`Client`].
///
/// # Examples
/// ```
/// # use splitkit::{ClientConfig, Experiment, ExperimentResult, InMemoryStickyBucketService};
/// let client = ClientConfig::from_client_key("sdk-key")
///     .tracking_callback(|experiment: &Experiment, result: &ExperimentResult| {
///         println!("{} -> {}", experiment.key, result.key);
///     })
///     .sticky_bucket_service(InMemoryStickyBucketService::new())
///     .to_client();
/// ```
pub struct ClientConfig<'a> {
    pub(crate) client_key: String,
    pub(crate) api_host: String,
    pub(crate) tracking_callback: Box<dyn TrackingCallback + Send + Sync + 'a>,
    pub(crate) sticky_bucket_service: Option<Box<dyn StickyBucketService + Send + Sync + 'a>>,
    pub(crate) cache: Arc<dyn FeatureCache>,
    pub(crate) cache_ttl: Duration,
    pub(crate) config_source: Arc<dyn ConfigSource>,
    pub(crate) refresh: RefreshConfig,
    pub(crate) options: EvalOptions,
    pub(crate) features: Option<Value>,
}

impl<'a> ClientConfig<'a> {
    /// Create a default configuration using the specified client key.
    ///
    /// ```
    /// # use splitkit::ClientConfig;
    /// ClientConfig::from_client_key("sdk-key");
    /// ```
    pub fn from_client_key(client_key: impl Into<String>) -> Self {
        ClientConfig {
            client_key: client_key.into(),
            api_host: ClientConfig::DEFAULT_API_HOST.to_owned(),
            tracking_callback: Box::new(NoopTrackingCallback),
            sticky_bucket_service: None,
            cache: Arc::new(InMemoryFeatureCache::new()),
            cache_ttl: DEFAULT_CACHE_TTL,
            config_source: Arc::new(HttpConfigSource::new()),
            refresh: RefreshConfig::default(),
            options: EvalOptions::default(),
            features: None,
        }
    }

    /// Default API host.
    pub const DEFAULT_API_HOST: &'static str = "https://cdn.growthbook.io";

    /// Override the API host features are fetched from.
    pub fn api_host(mut self, api_host: impl Into<String>) -> Self {
        self.api_host = api_host.into();
        self
    }

    /// Set the callback that receives experiment exposures.
    pub fn tracking_callback(
        mut self,
        tracking_callback: impl TrackingCallback + Send + Sync + 'a,
    ) -> Self {
        self.tracking_callback = Box::new(tracking_callback);
        self
    }

    /// Enable sticky bucketing backed by `service`.
    pub fn sticky_bucket_service(
        mut self,
        service: impl StickyBucketService + Send + Sync + 'a,
    ) -> Self {
        self.sticky_bucket_service = Some(Box::new(service));
        self
    }

    /// Use `cache` for fetched payloads. Caches can be shared between clients.
    pub fn cache(mut self, cache: Arc<dyn FeatureCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Time-to-live of cached payloads. Defaults to 60 seconds.
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Replace the HTTP config source, e.g. to read features from a file or a different
    /// transport.
    pub fn config_source(mut self, source: impl ConfigSource + 'static) -> Self {
        self.config_source = Arc::new(source);
        self
    }

    /// Set the refresh strategy used by [`Client::start_refresh`].
    pub fn refresh_strategy(mut self, strategy: RefreshStrategy) -> Self {
        self.refresh.strategy = strategy;
        self
    }

    /// Set the full refresh thread configuration.
    pub fn refresh_config(mut self, refresh: RefreshConfig) -> Self {
        self.refresh = refresh;
        self
    }

    /// Kill-switch. A disabled client serves default values and runs no experiments.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.options.enabled = enabled;
        self
    }

    /// QA mode disables hash-based experiment assignment.
    pub fn qa_mode(mut self, qa_mode: bool) -> Self {
        self.options.qa_mode = qa_mode;
        self
    }

    /// Force experiments (by key) into the given variation index.
    pub fn forced_variations(mut self, forced_variations: HashMap<String, usize>) -> Self {
        self.options.forced_variations = forced_variations;
        self
    }

    /// Start with a locally supplied features payload.
    pub fn features(mut self, payload: Value) -> Self {
        self.features = Some(payload);
        self
    }

    /// Create a new [`Client`] using the specified configuration.
    ///
    /// ```
    /// # use splitkit::{ClientConfig, Client};
    /// let client: Client = ClientConfig::from_client_key("sdk-key").to_client();
    /// ```
    pub fn to_client(self) -> Client<'a> {
        Client::new(self)
    }
}
