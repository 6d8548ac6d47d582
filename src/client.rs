use std::{
    collections::HashSet,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex},
};

use serde_json::Value;

#[cfg(doc)]
use crate::Error;
use crate::{
    configuration::FeatureSet,
    configuration_store::ConfigurationStore,
    eval::Evaluation,
    refresh::RefreshThread,
    repository::FeatureRepository,
    sticky_bucket::StickyBuckets,
    Attributes, ClientConfig, Experiment, ExperimentResult, FeatureResult, Result,
};

/// A feature flag and experimentation client.
///
/// In order to create a client instance, first create [`ClientConfig`].
///
/// # Loading features
///
/// Features can be supplied locally with [`ClientConfig::features`] or
/// [`Client::set_features_json`], loaded once with [`Client::load_features`], or kept up to date
/// by a background thread started with [`Client::start_refresh`]. Until features are available,
/// every feature evaluates to [`FeatureSource::UnknownFeature`](crate::FeatureSource).
///
/// # Examples
/// ```no_run
/// # use splitkit::{Attributes, Client, ClientConfig};
/// let client = Client::new(ClientConfig::from_client_key("sdk-key"));
/// let refresh = client.start_refresh().unwrap();
/// refresh.wait_for_configuration().unwrap();
///
/// let attributes: Attributes =
///     serde_json::from_value(serde_json::json!({ "id": "user-1" })).unwrap();
/// if client.is_on("new-checkout", &attributes) {
///     // ...
/// }
/// ```
pub struct Client<'a> {
    configuration_store: Arc<ConfigurationStore>,
    repository: Arc<FeatureRepository>,
    config: ClientConfig<'a>,
    /// `(experiment key, hash attribute, hash value)` of exposures already tracked.
    tracked: Mutex<HashSet<(String, String, String)>>,
}

impl<'a> Client<'a> {
    /// Create a new `Client` using the specified configuration.
    ///
    /// ```
    /// # use splitkit::{ClientConfig, Client};
    /// let client = Client::new(ClientConfig::from_client_key("sdk-key"));
    /// ```
    pub fn new(config: ClientConfig<'a>) -> Self {
        Client::new_with_configuration_store(config, Arc::new(ConfigurationStore::new()))
    }

    fn new_with_configuration_store(
        mut config: ClientConfig<'a>,
        configuration_store: Arc<ConfigurationStore>,
    ) -> Self {
        let repository = Arc::new(FeatureRepository::new(
            config.config_source.clone(),
            config.cache.clone(),
            config.cache_ttl,
        ));

        if let Some(payload) = config.features.take() {
            match FeatureSet::from_json(payload) {
                Ok(features) => {
                    configuration_store.set_features(Arc::new(features));
                }
                Err(err) => {
                    log::warn!(target: "splitkit", "ignoring invalid initial features: {err}");
                }
            }
        }

        Client {
            configuration_store,
            repository,
            config,
            tracked: Mutex::new(HashSet::new()),
        }
    }

    /// Evaluate feature `key` for a user with `attributes`.
    ///
    /// Evaluation never fails. Unknown features resolve to `null` with
    /// [`FeatureSource::UnknownFeature`](crate::FeatureSource::UnknownFeature).
    ///
    /// # Examples
    ///
    /// ```
    /// # use splitkit::{Attributes, ClientConfig, FeatureSource};
    /// let client = ClientConfig::from_client_key("sdk-key")
    ///     .features(serde_json::json!({
    ///         "features": {
    ///             "banner": {
    ///                 "defaultValue": "hidden",
    ///                 "rules": [{ "condition": { "country": "US" }, "force": "shown" }]
    ///             }
    ///         }
    ///     }))
    ///     .to_client();
    ///
    /// let attributes: Attributes =
    ///     serde_json::from_value(serde_json::json!({ "country": "US" })).unwrap();
    /// let result = client.eval_feature("banner", &attributes);
    /// assert_eq!(result.value, "shown");
    /// assert_eq!(result.source, FeatureSource::Force);
    /// ```
    pub fn eval_feature(&self, key: &str, attributes: &Attributes) -> FeatureResult {
        self.evaluate(attributes, &[], |evaluation| evaluation.eval_feature(key))
    }

    /// Returns `true` if feature `key` evaluates to a truthy value.
    pub fn is_on(&self, key: &str, attributes: &Attributes) -> bool {
        self.eval_feature(key, attributes).on
    }

    /// Returns `true` if feature `key` evaluates to a falsy value.
    pub fn is_off(&self, key: &str, attributes: &Attributes) -> bool {
        !self.is_on(key, attributes)
    }

    /// Value of feature `key`, or `fallback` if it evaluates to `null`.
    pub fn get_feature_value(&self, key: &str, attributes: &Attributes, fallback: Value) -> Value {
        match self.eval_feature(key, attributes).value {
            Value::Null => fallback,
            value => value,
        }
    }

    /// Run an experiment outside of any feature.
    pub fn run(&self, experiment: &Experiment, attributes: &Attributes) -> ExperimentResult {
        let identifiers: Vec<&str> = std::iter::once(experiment.hash_attribute())
            .chain(experiment.fallback_attribute.as_deref())
            .collect();
        self.evaluate(attributes, &identifiers, |evaluation| evaluation.run(experiment))
    }

    /// Current feature set, if any has been loaded.
    pub fn features(&self) -> Option<Arc<FeatureSet>> {
        self.configuration_store.get_features()
    }

    /// Replace the current feature set.
    pub fn set_features(&self, features: FeatureSet) {
        self.configuration_store.set_features(Arc::new(features));
    }

    /// Decode `payload` and make it the current feature set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigurationParse`] if `payload` is not a features payload. The current
    /// feature set is kept in that case.
    pub fn set_features_json(&self, payload: Value) -> Result<()> {
        self.set_features(FeatureSet::from_json(payload)?);
        Ok(())
    }

    /// Load features through the cache (fetching them if the cached payload is missing or
    /// expired) and make them current.
    ///
    /// # Errors
    ///
    /// Returns the fetch error. The current feature set is kept in that case.
    pub fn load_features(&self) -> Result<()> {
        let features = self
            .repository
            .load_features(&self.config.api_host, &self.config.client_key)?;
        self.configuration_store.set_features(features);
        Ok(())
    }

    /// Start a background thread that keeps features up to date using the configured refresh
    /// strategy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the thread failed to start.
    pub fn start_refresh(&self) -> Result<RefreshThread> {
        let thread = RefreshThread::start(
            self.repository.clone(),
            self.configuration_store.clone(),
            self.config.api_host.clone(),
            self.config.client_key.clone(),
            self.config.refresh.clone(),
        )?;
        Ok(thread)
    }

    /// Run `f` over an evaluation of the current snapshot, then persist sticky bucket updates and
    /// deliver tracking events.
    fn evaluate<T>(
        &self,
        attributes: &Attributes,
        identifiers: &[&str],
        f: impl FnOnce(&mut Evaluation<'_>) -> T,
    ) -> T {
        let features = self.configuration_store.get_features();

        let sticky_service = self.config.sticky_bucket_service.as_deref();
        let sticky_buckets = sticky_service.map(|service| {
            let names = features
                .as_deref()
                .map(FeatureSet::sticky_bucket_attributes)
                .unwrap_or_default()
                .iter()
                .map(String::as_str)
                .chain(identifiers.iter().copied());
            StickyBuckets::load(service, names, attributes)
        });

        let mut evaluation = Evaluation::new(
            features.as_deref(),
            attributes,
            &self.config.options,
            sticky_buckets,
        );
        let value = f(&mut evaluation);
        let effects = evaluation.into_effects();

        if let Some(service) = sticky_service {
            for (key, document) in effects.sticky_updates {
                if let Err(err) = service.save_assignments(document) {
                    log::warn!(target: "splitkit",
                               document:display = key;
                               "failed to save sticky bucket assignments: {err}");
                }
            }
        }

        for (experiment, result) in effects.tracks {
            self.track(&experiment, &result);
        }

        value
    }

    fn track(&self, experiment: &Experiment, result: &ExperimentResult) {
        let key = (
            experiment.key.clone(),
            result.hash_attribute.clone(),
            result.hash_value.clone(),
        );
        let is_new = self
            .tracked
            .lock()
            .map(|mut tracked| tracked.insert(key))
            .unwrap_or(true);
        if !is_new {
            return;
        }

        let delivered = std::panic::catch_unwind(AssertUnwindSafe(|| {
            self.config
                .tracking_callback
                .on_experiment_viewed(experiment, result)
        }));
        if delivered.is_err() {
            log::warn!(target: "splitkit",
                       experiment_key:display = experiment.key;
                       "tracking callback panicked");
        }
    }
}
