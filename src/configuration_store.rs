use std::sync::{Arc, RwLock};

use crate::configuration::FeatureSet;

/// `ConfigurationStore` provides a Sync storage for the current feature set that allows
/// concurrent access for readers and writers.
///
/// Readers receive an `Arc` snapshot, so a feature set swapped in by a refresh never affects
/// evaluations already in progress.
#[derive(Default)]
pub struct ConfigurationStore {
    features: RwLock<Option<Arc<FeatureSet>>>,
}

impl ConfigurationStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current feature set, or `None` if no features have been loaded yet.
    pub fn get_features(&self) -> Option<Arc<FeatureSet>> {
        // self.features.read() should always return Ok(). Err() is possible only if the lock is
        // poisoned (writer panicked while holding the lock), which should never happen. Still,
        // using .ok()? here to not crash the app.
        let features = self.features.read().ok()?;
        features.clone()
    }

    /// Set a new feature set, returning the previous one.
    pub fn set_features(&self, features: Arc<FeatureSet>) -> Option<Arc<FeatureSet>> {
        let mut slot = self.features.write().ok()?;
        std::mem::replace(&mut slot, Some(features))
    }
}
