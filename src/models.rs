//! Wire model of the features payload.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{condition::Condition, Error, Result};

/// Features payload. This is the response format of the features endpoint and the format of
/// locally supplied feature definitions.
#[derive(Debug, Default, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct FeaturesPayload {
    /// Feature definitions by key.
    ///
    /// Value is wrapped in `TryParse` so that if we fail to parse one feature (e.g., new server
    /// format), we can still serve other features.
    #[serde(default)]
    pub features: HashMap<String, TryParse<Feature>>,
    /// Saved groups referenced by `$inGroup`/`$notInGroup` conditions.
    #[serde(default)]
    pub saved_groups: HashMap<String, Vec<Value>>,
    /// When the payload was last updated on the server.
    #[serde(default)]
    pub date_updated: Option<String>,
}

/// `TryParse` allows the subfield to fail parsing without failing the parsing of the whole
/// structure.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(untagged)]
pub enum TryParse<T> {
    /// Successfully parsed.
    Parsed(T),
    /// Parsing failed.
    ParseFailed(Value),
}

impl<T> TryParse<T> {
    /// Return the parsed value, if any.
    pub fn parsed(&self) -> Option<&T> {
        match self {
            TryParse::Parsed(v) => Some(v),
            TryParse::ParseFailed(_) => None,
        }
    }
}

impl<T> From<TryParse<T>> for Option<T> {
    fn from(value: TryParse<T>) -> Self {
        match value {
            TryParse::Parsed(v) => Some(v),
            TryParse::ParseFailed(_) => None,
        }
    }
}

/// A feature definition.
#[derive(Debug, Default, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Feature {
    /// Value served when no rule matches.
    #[serde(default)]
    pub default_value: Value,
    /// Rules are evaluated in order; the first matching rule wins.
    #[serde(default)]
    pub rules: Vec<TryParse<FeatureRule>>,
}

impl Feature {
    /// Iterate over successfully-parsed rules.
    pub(crate) fn parsed_rules(&self) -> impl Iterator<Item = &FeatureRule> {
        self.rules.iter().filter_map(TryParse::parsed)
    }
}

/// A single feature rule: either a force rule (`force` is set) or an experiment rule
/// (`variations` is set).
#[derive(Debug, Default, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct FeatureRule {
    pub id: Option<String>,
    pub condition: Option<Condition>,
    #[serde(default)]
    pub parent_conditions: Vec<ParentCondition>,
    pub force: Option<Value>,
    pub variations: Option<Vec<Value>>,
    pub weights: Option<Vec<f64>>,
    pub key: Option<String>,
    pub hash_attribute: Option<String>,
    pub fallback_attribute: Option<String>,
    pub hash_version: Option<u32>,
    /// Rollout range for force rules.
    pub range: Option<BucketRange>,
    pub coverage: Option<f64>,
    pub namespace: Option<Namespace>,
    pub ranges: Option<Vec<BucketRange>>,
    pub meta: Option<Vec<VariationMeta>>,
    pub filters: Option<Vec<Filter>>,
    pub seed: Option<String>,
    pub name: Option<String>,
    pub phase: Option<String>,
    #[serde(default)]
    pub disable_sticky_bucketing: bool,
    #[serde(default)]
    pub bucket_version: u32,
    #[serde(default)]
    pub min_bucket_version: u32,
}

/// Half-open range `[start, end)` over the bucket space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketRange(pub f64, pub f64);

impl BucketRange {
    /// Return `true` if `n` falls into the range.
    pub fn contains(&self, n: f64) -> bool {
        self.0 <= n && n < self.1
    }
}

/// Namespace as `(name, rangeStart, rangeEnd)`. Serialized as a 3-element array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Namespace(pub String, pub f64, pub f64);

/// Hash-based audience filter. Users whose hash falls in none of `ranges` are filtered out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct Filter {
    pub attribute: Option<String>,
    #[serde(default)]
    pub seed: String,
    pub hash_version: Option<u32>,
    pub ranges: Vec<BucketRange>,
}

/// Per-variation metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct VariationMeta {
    pub key: Option<String>,
    pub name: Option<String>,
    /// Passthrough variations assign the user but fall through to the next rule.
    #[serde(default)]
    pub passthrough: bool,
}

/// A prerequisite on another feature's evaluated value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentCondition {
    /// Parent feature key.
    pub id: String,
    /// Condition evaluated against `{"value": <parent value>}`.
    pub condition: Condition,
    /// A failing gate blocks the whole feature instead of skipping the rule.
    #[serde(default)]
    pub gate: bool,
}

/// An experiment: an assignment of users into one of several variations.
///
/// Experiments are usually derived from feature rules, but can also be run directly with
/// [`Client::run`](crate::Client::run).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct Experiment {
    pub key: String,
    pub variations: Vec<Value>,
    pub weights: Option<Vec<f64>>,
    #[serde(default = "default_active")]
    pub active: bool,
    pub coverage: Option<f64>,
    pub ranges: Option<Vec<BucketRange>>,
    pub condition: Option<Condition>,
    #[serde(default)]
    pub parent_conditions: Vec<ParentCondition>,
    pub namespace: Option<Namespace>,
    /// Force all included users into the variation at this index.
    pub force: Option<usize>,
    pub hash_attribute: Option<String>,
    pub fallback_attribute: Option<String>,
    pub hash_version: Option<u32>,
    pub meta: Option<Vec<VariationMeta>>,
    pub filters: Option<Vec<Filter>>,
    pub seed: Option<String>,
    pub name: Option<String>,
    pub phase: Option<String>,
    #[serde(default)]
    pub disable_sticky_bucketing: bool,
    #[serde(default)]
    pub bucket_version: u32,
    #[serde(default)]
    pub min_bucket_version: u32,
}

fn default_active() -> bool {
    true
}

impl Experiment {
    /// Create an experiment with even weights and full coverage.
    ///
    /// ```
    /// # use splitkit::Experiment;
    /// let experiment =
    ///     Experiment::new("button-color", vec!["red".into(), "blue".into()]).unwrap();
    /// assert!(Experiment::new("empty", vec![]).is_err());
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidExperiment`] if `variations` is empty.
    pub fn new(key: impl Into<String>, variations: Vec<Value>) -> Result<Experiment> {
        let key = key.into();
        if variations.is_empty() {
            return Err(Error::InvalidExperiment(key));
        }
        Ok(Experiment {
            key,
            variations,
            weights: None,
            active: true,
            coverage: None,
            ranges: None,
            condition: None,
            parent_conditions: Vec::new(),
            namespace: None,
            force: None,
            hash_attribute: None,
            fallback_attribute: None,
            hash_version: None,
            meta: None,
            filters: None,
            seed: None,
            name: None,
            phase: None,
            disable_sticky_bucketing: false,
            bucket_version: 0,
            min_bucket_version: 0,
        })
    }

    /// Set variation weights.
    pub fn with_weights(mut self, weights: Vec<f64>) -> Experiment {
        self.weights = Some(weights);
        self
    }

    /// Set the fraction of eligible users included in the experiment.
    pub fn with_coverage(mut self, coverage: f64) -> Experiment {
        self.coverage = Some(coverage);
        self
    }

    /// Set the targeting condition.
    pub fn with_condition(mut self, condition: Condition) -> Experiment {
        self.condition = Some(condition);
        self
    }

    /// Restrict the experiment to a namespace range.
    pub fn with_namespace(mut self, namespace: Namespace) -> Experiment {
        self.namespace = Some(namespace);
        self
    }

    /// Set the attribute used for bucketing (defaults to `"id"`).
    pub fn with_hash_attribute(mut self, attribute: impl Into<String>) -> Experiment {
        self.hash_attribute = Some(attribute.into());
        self
    }

    /// Set the hashing algorithm version.
    pub fn with_hash_version(mut self, version: u32) -> Experiment {
        self.hash_version = Some(version);
        self
    }

    /// Set per-variation metadata. Variation keys are required for sticky bucketing.
    pub fn with_meta(mut self, meta: Vec<VariationMeta>) -> Experiment {
        self.meta = Some(meta);
        self
    }

    /// Force included users into the variation at `index`.
    pub fn with_force(mut self, index: usize) -> Experiment {
        self.force = Some(index);
        self
    }

    /// Build an experiment out of an experiment rule of feature `feature_key`.
    ///
    /// Returns `None` if the rule is not an experiment rule.
    pub(crate) fn from_rule(feature_key: &str, rule: &FeatureRule) -> Option<Experiment> {
        let variations = rule.variations.clone()?;
        Some(Experiment {
            key: rule.key.clone().unwrap_or_else(|| feature_key.to_owned()),
            variations,
            weights: rule.weights.clone(),
            active: true,
            coverage: rule.coverage,
            ranges: rule.ranges.clone(),
            condition: rule.condition.clone(),
            // Parent conditions of a rule are checked by the feature evaluator.
            parent_conditions: Vec::new(),
            namespace: rule.namespace.clone(),
            force: None,
            hash_attribute: rule.hash_attribute.clone(),
            fallback_attribute: rule.fallback_attribute.clone(),
            hash_version: rule.hash_version,
            meta: rule.meta.clone(),
            filters: rule.filters.clone(),
            seed: rule.seed.clone(),
            name: rule.name.clone(),
            phase: rule.phase.clone(),
            disable_sticky_bucketing: rule.disable_sticky_bucketing,
            bucket_version: rule.bucket_version,
            min_bucket_version: rule.min_bucket_version,
        })
    }

    pub(crate) fn hash_attribute(&self) -> &str {
        self.hash_attribute.as_deref().unwrap_or("id")
    }

    pub(crate) fn seed(&self) -> &str {
        self.seed.as_deref().unwrap_or(&self.key)
    }

    pub(crate) fn hash_version(&self) -> u32 {
        self.hash_version.unwrap_or(1)
    }

    pub(crate) fn variation_meta(&self, index: usize) -> Option<&VariationMeta> {
        self.meta.as_ref()?.get(index)
    }

    /// Variation key at `index`: the meta key if present, otherwise the stringified index.
    pub(crate) fn variation_key(&self, index: usize) -> String {
        self.variation_meta(index)
            .and_then(|meta| meta.key.clone())
            .unwrap_or_else(|| index.to_string())
    }
}
