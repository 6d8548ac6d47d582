//! A client-side feature flag and experimentation evaluator.
//!
//! # Overview
//!
//! The crate revolves around a [`Client`] that evaluates features for users described by
//! [`Attributes`]. Feature definitions are fetched from a remote [`ConfigSource`] (or supplied
//! locally), decoded once into an immutable [`FeatureSet`] and evaluated in memory, so evaluating a
//! feature never waits on the network.
//!
//! Each feature has a default value and an ordered list of rules. A rule can force a value for
//! users matching a targeting [`Condition`], or run an [`Experiment`] that deterministically
//! assigns users to variations by hashing one of their attributes. Hashing is compatible with
//! other implementations of the same algorithms, so a user lands in the same variation on every
//! platform.
//!
//! A [`TrackingCallback`] receives experiment exposures, and a [`StickyBucketService`] can persist
//! assignments so users keep their variation when targeting or traffic allocation changes.
//!
//! # Error Handling
//!
//! Evaluation never fails: unknown features, broken rules and targeting mismatches resolve to
//! default values. Errors are represented by the [`Error`] enum and are only returned while loading
//! features and for misuse, such as creating an experiment without variations.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging messages, with
//! `target: "splitkit"`. Consider integrating a `log`-compatible logger implementation for better
//! visibility into client operations.
//!
//! # Examples
//!
//! A runnable example can be found in the `demos/simple` directory of the crate repository.

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

mod attributes;
mod bucket;
mod cache;
mod client;
mod condition;
mod config;
mod configuration;
mod configuration_store;
mod error;
mod eval;
mod models;
mod refresh;
mod repository;
mod source;
mod sticky_bucket;
mod tracking;

pub use attributes::Attributes;
pub use bucket::{bucket_ranges, choose_variation, hash, in_namespace};
pub use cache::{CacheEntry, FeatureCache, InMemoryFeatureCache};
pub use client::Client;
pub use condition::{matches, Condition};
pub use config::ClientConfig;
pub use configuration::FeatureSet;
pub use configuration_store::ConfigurationStore;
pub use error::{Error, Result};
pub use eval::{EvalOptions, ExperimentResult, FeatureResult, FeatureSource};
pub use models::{
    BucketRange, Experiment, Feature, FeatureRule, FeaturesPayload, Filter, Namespace,
    ParentCondition, TryParse, VariationMeta,
};
pub use refresh::{RefreshConfig, RefreshStrategy, RefreshThread};
pub use repository::{FeatureRepository, DEFAULT_CACHE_TTL};
pub use source::{CloseSignal, ConfigSource, FetchResult, HttpConfigSource, Updates};
pub use sticky_bucket::{InMemoryStickyBucketService, StickyBucketDocument, StickyBucketService};
pub use tracking::{ChannelTracker, TrackingCallback, TrackingEvent};
