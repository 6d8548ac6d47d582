use std::sync::Arc;

use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by the client and its collaborators.
///
/// Evaluation itself never fails: targeting mismatches and broken rules resolve to defaults.
/// Errors are only returned for misuse (e.g., constructing an experiment without variations) and
/// from the configuration loading machinery.
///
/// `Error` is `Clone` so that a single failed fetch can be handed to every caller waiting on it.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// An experiment was defined without variations.
    #[error("experiment {0:?} has no variations")]
    InvalidExperiment(String),

    /// Invalid api_host configuration.
    #[error("invalid api_host configuration")]
    InvalidApiHost(#[source] url::ParseError),

    /// The config source rejected the client key.
    #[error("unauthorized, client_key is likely invalid")]
    Unauthorized,

    /// Features payload could not be decoded.
    #[error("error parsing features payload")]
    ConfigurationParse(#[source] Arc<serde_json::Error>),

    /// The config source does not provide a live update stream.
    #[error("config source does not support streaming")]
    StreamingUnsupported,

    /// Sticky bucket service failed to load or persist assignments.
    #[error("sticky bucket service error: {0}")]
    StickyBucket(String),

    /// The config source panicked while fetching features. Callers waiting on the same fetch
    /// receive this error instead.
    #[error("config source panicked while fetching features")]
    FetchPanicked,

    /// Indicates that the refresh thread panicked. This should normally never happen.
    #[error("refresh thread panicked")]
    RefreshThreadPanicked,

    /// An I/O error.
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    #[error(transparent)]
    Io(Arc<std::io::Error>),

    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Self::Network(Arc::new(value.without_url()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::ConfigurationParse(Arc::new(value))
    }
}
