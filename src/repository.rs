//! Loading feature sets through the cache, with de-duplication of concurrent fetches.
use std::{
    collections::HashMap,
    sync::{Arc, Condvar, Mutex},
    time::Duration,
};

use serde_json::Value;

use crate::{
    cache::FeatureCache,
    configuration::FeatureSet,
    source::{CloseSignal, ConfigSource, FetchResult, Updates},
    Error, Result,
};

/// Default time-to-live of cached payloads.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);

/// A fetch in progress. Every caller that arrives while it runs waits for and receives the same
/// result.
#[derive(Default)]
struct InFlight {
    result: Mutex<Option<Result<Arc<FeatureSet>>>>,
    done: Condvar,
}

impl InFlight {
    fn complete(&self, result: Result<Arc<FeatureSet>>) {
        let mut slot = self
            .result
            .lock()
            .expect("thread holding fetch result lock should not panic");
        *slot = Some(result);
        self.done.notify_all();
    }

    fn wait(&self) -> Result<Arc<FeatureSet>> {
        let mut slot = self
            .result
            .lock()
            .expect("thread holding fetch result lock should not panic");
        loop {
            if let Some(result) = &*slot {
                return result.clone();
            }
            slot = self
                .done
                .wait(slot)
                .expect("thread holding fetch result lock should not panic");
        }
    }
}

/// The leader's claim on an in-flight fetch.
///
/// Completing or dropping it releases the cache key. If the leader unwinds before completing,
/// waiters receive [`Error::FetchPanicked`].
struct Lead<'r> {
    repository: &'r FeatureRepository,
    key: &'r str,
    flight: Arc<InFlight>,
    completed: bool,
}

impl Lead<'_> {
    fn complete(mut self, result: Result<Arc<FeatureSet>>) {
        self.flight.complete(result);
        self.completed = true;
    }
}

impl Drop for Lead<'_> {
    fn drop(&mut self) {
        if !self.completed {
            log::warn!(target: "splitkit",
                       key:display = self.key;
                       "config source panicked while fetching features");
            self.flight.complete(Err(Error::FetchPanicked));
        }
        if let Ok(mut in_flight) = self.repository.in_flight.lock() {
            in_flight.remove(self.key);
        }
    }
}

/// Loads feature sets from a [`ConfigSource`] through a [`FeatureCache`].
///
/// Payloads are cached under `"{api_host}::{client_key}"`. At most one fetch per cache key is in
/// flight at any time.
pub struct FeatureRepository {
    source: Arc<dyn ConfigSource>,
    cache: Arc<dyn FeatureCache>,
    ttl: Duration,
    etags: Mutex<HashMap<String, String>>,
    in_flight: Mutex<HashMap<String, Arc<InFlight>>>,
}

impl FeatureRepository {
    /// Create a repository.
    pub fn new(
        source: Arc<dyn ConfigSource>,
        cache: Arc<dyn FeatureCache>,
        ttl: Duration,
    ) -> FeatureRepository {
        FeatureRepository {
            source,
            cache,
            ttl,
            etags: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Cache key of the payload for `client_key` on `api_host`.
    pub fn cache_key(api_host: &str, client_key: &str) -> String {
        format!("{api_host}::{client_key}")
    }

    /// Return the cached feature set if it is fresh. Otherwise fetch, decode and cache it.
    ///
    /// # Errors
    ///
    /// Returns the fetch or decode error. Concurrent callers waiting on the same fetch receive the
    /// same error.
    pub fn load_features(&self, api_host: &str, client_key: &str) -> Result<Arc<FeatureSet>> {
        self.load(api_host, client_key, false)
    }

    /// Fetch the feature set regardless of the cached payload's age.
    pub fn refresh_features(&self, api_host: &str, client_key: &str) -> Result<Arc<FeatureSet>> {
        self.load(api_host, client_key, true)
    }

    /// Subscribe to live payload updates from the underlying source. The stream ends once `close`
    /// is closed.
    pub fn subscribe(
        &self,
        api_host: &str,
        client_key: &str,
        close: CloseSignal,
    ) -> Result<Updates> {
        self.source.subscribe(api_host, client_key, close)
    }

    /// Decode a payload received out of band (e.g., from a live update stream) and cache it.
    pub fn store_payload(
        &self,
        api_host: &str,
        client_key: &str,
        payload: Value,
    ) -> Result<Arc<FeatureSet>> {
        let features = FeatureSet::from_json(payload.clone())?;
        self.cache
            .set(&Self::cache_key(api_host, client_key), payload, self.ttl);
        Ok(Arc::new(features))
    }

    fn load(&self, api_host: &str, client_key: &str, force: bool) -> Result<Arc<FeatureSet>> {
        let key = Self::cache_key(api_host, client_key);

        if !force {
            if let Some(payload) = self.cache.get(&key) {
                log::trace!(target: "splitkit", key:display = key; "serving features from cache");
                return Ok(Arc::new(FeatureSet::from_json(payload)?));
            }
        }

        let (flight, leader) = {
            let mut in_flight = self
                .in_flight
                .lock()
                .expect("thread holding in-flight lock should not panic");
            match in_flight.get(&key) {
                Some(flight) => (flight.clone(), false),
                None => {
                    let flight = Arc::new(InFlight::default());
                    in_flight.insert(key.clone(), flight.clone());
                    (flight, true)
                }
            }
        };

        if !leader {
            log::trace!(target: "splitkit", key:display = key; "waiting for in-flight fetch");
            return flight.wait();
        }

        let lead = Lead {
            repository: self,
            key: &key,
            flight,
            completed: false,
        };

        // Another leader may have filled the cache between our cache check and taking the lead.
        let result = match self.cache.get(&key).filter(|_| !force) {
            Some(payload) => FeatureSet::from_json(payload).map(Arc::new),
            None => self.fetch(&key, api_host, client_key),
        };

        lead.complete(result.clone());
        result
    }

    fn fetch(&self, key: &str, api_host: &str, client_key: &str) -> Result<Arc<FeatureSet>> {
        let etag = self
            .etags
            .lock()
            .expect("thread holding etag lock should not panic")
            .get(key)
            .cloned();

        let payload = match self.source.fetch(api_host, client_key, etag.as_deref())? {
            FetchResult::Fetched { payload, etag } => {
                self.remember_etag(key, etag);
                payload
            }
            FetchResult::NotModified => match self.cache.get_stale(key) {
                Some(payload) => payload,
                None => {
                    // Lost the payload the entity tag refers to. Fetch it again unconditionally.
                    self.remember_etag(key, None);
                    match self.source.fetch(api_host, client_key, None)? {
                        FetchResult::Fetched { payload, etag } => {
                            self.remember_etag(key, etag);
                            payload
                        }
                        FetchResult::NotModified => {
                            log::warn!(target: "splitkit",
                                       key;
                                       "unconditional fetch returned not modified");
                            Value::Object(Default::default())
                        }
                    }
                }
            },
        };

        // Payloads that fail to decode are never cached.
        let features = FeatureSet::from_json(payload.clone())?;
        self.cache.set(key, payload, self.ttl);

        log::debug!(target: "splitkit",
                    key,
                    features = features.features.len();
                    "loaded features");

        Ok(Arc::new(features))
    }

    fn remember_etag(&self, key: &str, etag: Option<String>) {
        let mut etags = self
            .etags
            .lock()
            .expect("thread holding etag lock should not panic");
        match etag {
            Some(etag) => etags.insert(key.to_owned(), etag),
            None => etags.remove(key),
        };
    }
}
