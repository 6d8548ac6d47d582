use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    attributes::hash_value,
    bucket::{
        bucket_ranges, choose_variation, hash, in_namespace, is_filtered_out,
        is_included_in_rollout,
    },
    condition::SavedGroups,
    configuration::FeatureSet,
    models::{Feature, ParentCondition},
    sticky_bucket::{StickyBucketDocument, StickyBuckets},
    Attributes, Experiment,
};

/// How the value of a feature was determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FeatureSource {
    /// The feature is not present in the current feature set.
    UnknownFeature,
    /// No rule matched.
    DefaultValue,
    /// A force rule matched, or a forced variation override was applied.
    Force,
    /// The user was assigned a variation of an experiment rule.
    Experiment,
    /// A gating prerequisite feature failed.
    Prerequisite,
    /// Prerequisite features form a cycle.
    CyclicPrerequisite,
}

/// Result of evaluating a feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureResult {
    /// Resolved value.
    pub value: Value,
    /// Truthiness of `value`.
    pub on: bool,
    /// How `value` was determined.
    pub source: FeatureSource,
    /// Id of the rule that determined `value`, if any.
    pub rule_id: Option<String>,
    /// Experiment that determined `value`, if any.
    pub experiment: Option<Experiment>,
    /// Assignment into `experiment`.
    pub experiment_result: Option<ExperimentResult>,
}

impl FeatureResult {
    /// Returns `true` if the value is truthy.
    pub fn is_on(&self) -> bool {
        self.on
    }

    /// Returns `true` if the value is falsy.
    pub fn is_off(&self) -> bool {
        !self.on
    }
}

/// Result of running an experiment for a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentResult {
    /// Value of the assigned variation (or of the first variation if not in the experiment).
    pub value: Value,
    /// Index of the assigned variation.
    pub variation_id: usize,
    /// Variation key from `meta`, or the stringified index.
    pub key: String,
    /// Variation name from `meta`.
    pub name: Option<String>,
    /// Whether the user is part of the experiment.
    pub in_experiment: bool,
    /// Whether the assignment came from hashing.
    pub hash_used: bool,
    /// Attribute the user was identified by.
    pub hash_attribute: String,
    /// Value of `hash_attribute`, empty if missing.
    pub hash_value: String,
    /// Feature the experiment was run for.
    pub feature_id: Option<String>,
    /// Computed bucket in `[0, 1)`.
    pub bucket: Option<f64>,
    /// The assigned variation is a passthrough variation.
    pub passthrough: bool,
    /// The assignment came from (or was blocked by) a sticky bucket document.
    pub sticky_bucket_used: bool,
}

/// Options applied to every evaluation of a client.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalOptions {
    /// Kill-switch. When `false`, every feature resolves to its default value and no experiments
    /// run.
    pub enabled: bool,
    /// QA mode suppresses hash-based assignment. Force rules, experiment `force` indices and
    /// `forced_variations` still apply.
    pub qa_mode: bool,
    /// Experiment key to variation index overrides.
    pub forced_variations: HashMap<String, usize>,
}

impl Default for EvalOptions {
    fn default() -> Self {
        EvalOptions {
            enabled: true,
            qa_mode: false,
            forced_variations: HashMap::new(),
        }
    }
}

struct Assignment {
    result: ExperimentResult,
    forced: bool,
}

enum ParentCheck {
    Pass,
    Skip,
    Block(FeatureResult),
}

/// A single evaluation pass over one feature set snapshot for one user.
///
/// Evaluation itself never performs I/O. Sticky bucket updates and tracking events are collected
/// and handed back to the caller through [`Evaluation::into_effects`].
pub(crate) struct Evaluation<'a> {
    features: Option<&'a FeatureSet>,
    attributes: &'a Attributes,
    options: &'a EvalOptions,
    sticky_buckets: Option<StickyBuckets>,
    stack: Vec<String>,
    sticky_updates: HashMap<String, StickyBucketDocument>,
    tracks: Vec<(Experiment, ExperimentResult)>,
    empty_groups: SavedGroups,
}

/// Side effects of an evaluation.
#[derive(Debug, Default)]
pub(crate) struct Effects {
    /// Changed sticky bucket documents by document key.
    pub sticky_updates: HashMap<String, StickyBucketDocument>,
    /// Experiments the user was assigned into by hashing.
    pub tracks: Vec<(Experiment, ExperimentResult)>,
}

impl<'a> Evaluation<'a> {
    /// `sticky_buckets` is `Some` if and only if a sticky bucket service is configured.
    pub fn new(
        features: Option<&'a FeatureSet>,
        attributes: &'a Attributes,
        options: &'a EvalOptions,
        sticky_buckets: Option<StickyBuckets>,
    ) -> Evaluation<'a> {
        Evaluation {
            features,
            attributes,
            options,
            sticky_buckets,
            stack: Vec::new(),
            sticky_updates: HashMap::new(),
            tracks: Vec::new(),
            empty_groups: SavedGroups::new(),
        }
    }

    pub fn into_effects(self) -> Effects {
        Effects {
            sticky_updates: self.sticky_updates,
            tracks: self.tracks,
        }
    }

    fn saved_groups(&self) -> &SavedGroups {
        self.features
            .map_or(&self.empty_groups, |features| &features.saved_groups)
    }

    pub fn eval_feature(&mut self, key: &str) -> FeatureResult {
        let Some(feature) = self.features.and_then(|features| features.features.get(key)) else {
            log::trace!(target: "splitkit", feature_key = key; "unknown feature");
            return feature_result(Value::Null, FeatureSource::UnknownFeature, None);
        };

        if !self.options.enabled {
            return feature_result(feature.default_value.clone(), FeatureSource::DefaultValue, None);
        }

        if self.stack.iter().any(|k| k == key) {
            log::warn!(target: "splitkit",
                       feature_key = key,
                       stack:? = self.stack;
                       "cyclic prerequisite detected");
            return feature_result(Value::Null, FeatureSource::CyclicPrerequisite, None);
        }

        self.stack.push(key.to_owned());
        let result = self.eval_rules(key, feature);
        self.stack.pop();

        log::trace!(target: "splitkit",
                    feature_key = key,
                    value:% = result.value,
                    source:? = result.source;
                    "evaluated feature");
        result
    }

    fn eval_rules(&mut self, key: &str, feature: &'a Feature) -> FeatureResult {
        for rule in feature.parsed_rules() {
            match self.check_parents(&rule.parent_conditions) {
                ParentCheck::Pass => {}
                ParentCheck::Skip => continue,
                ParentCheck::Block(result) => return result,
            }

            if let Some(filters) = &rule.filters {
                if is_filtered_out(filters, self.attributes) {
                    continue;
                }
            }

            if let Some(force) = &rule.force {
                if let Some(condition) = &rule.condition {
                    if !condition.matches_with_groups(self.attributes, self.saved_groups()) {
                        continue;
                    }
                }

                let (_, hash_value) = self.hash_identity(
                    rule.hash_attribute.as_deref().unwrap_or("id"),
                    rule.fallback_attribute.as_deref(),
                );
                if !is_included_in_rollout(
                    hash_value.as_deref(),
                    rule.seed.as_deref().unwrap_or(key),
                    rule.range,
                    rule.coverage,
                    rule.hash_version.unwrap_or(1),
                ) {
                    continue;
                }

                return feature_result(force.clone(), FeatureSource::Force, rule.id.clone());
            }

            let Some(experiment) = Experiment::from_rule(key, rule) else {
                continue;
            };

            let Assignment { result, forced } = self.assign(&experiment, Some(key));
            if !result.in_experiment || result.passthrough {
                continue;
            }

            let source = if forced {
                FeatureSource::Force
            } else {
                FeatureSource::Experiment
            };
            let mut feature_result = feature_result(result.value.clone(), source, rule.id.clone());
            feature_result.experiment = Some(experiment);
            feature_result.experiment_result = Some(result);
            return feature_result;
        }

        feature_result(feature.default_value.clone(), FeatureSource::DefaultValue, None)
    }

    fn check_parents(&mut self, parents: &[ParentCondition]) -> ParentCheck {
        for parent in parents {
            let parent_result = self.eval_feature(&parent.id);
            if parent_result.source == FeatureSource::CyclicPrerequisite {
                return ParentCheck::Block(feature_result(
                    Value::Null,
                    FeatureSource::CyclicPrerequisite,
                    None,
                ));
            }

            let mut subject = Attributes::new();
            subject.insert("value".to_owned(), parent_result.value);
            if !parent
                .condition
                .matches_with_groups(&subject, self.saved_groups())
            {
                if parent.gate {
                    log::trace!(target: "splitkit",
                                parent:display = parent.id;
                                "feature blocked by prerequisite");
                    return ParentCheck::Block(feature_result(
                        Value::Null,
                        FeatureSource::Prerequisite,
                        None,
                    ));
                }
                return ParentCheck::Skip;
            }
        }
        ParentCheck::Pass
    }

    /// Run `experiment` outside of any feature.
    pub fn run(&mut self, experiment: &Experiment) -> ExperimentResult {
        self.assign(experiment, None).result
    }

    fn assign(&mut self, experiment: &Experiment, feature_id: Option<&str>) -> Assignment {
        let (hash_attribute, hash_value) = self.hash_identity(
            experiment.hash_attribute(),
            experiment.fallback_attribute.as_deref(),
        );
        let identity = Identity {
            hash_attribute: &hash_attribute,
            hash_value: hash_value.as_deref(),
            feature_id,
        };
        let excluded = |sticky_bucket_used| Assignment {
            result: experiment_result(experiment, None, &identity, None, false, sticky_bucket_used),
            forced: false,
        };

        if experiment.variations.len() < 2 || !self.options.enabled {
            return excluded(false);
        }

        if let Some(&index) = self.options.forced_variations.get(&experiment.key) {
            log::trace!(target: "splitkit",
                        experiment_key:display = experiment.key,
                        index;
                        "forced variation");
            return Assignment {
                result: experiment_result(experiment, Some(index), &identity, None, false, false),
                forced: true,
            };
        }

        if !experiment.active {
            return excluded(false);
        }

        let Some(hash_value) = identity.hash_value else {
            log::trace!(target: "splitkit",
                        experiment_key:display = experiment.key,
                        hash_attribute:display = hash_attribute;
                        "missing hash attribute");
            return excluded(false);
        };

        let use_sticky = self.sticky_buckets.is_some() && !experiment.disable_sticky_bucketing;
        let sticky = match &self.sticky_buckets {
            Some(buckets) if use_sticky => buckets.resolve(experiment, self.attributes),
            _ => Default::default(),
        };

        if sticky.version_blocked {
            return excluded(true);
        }

        let (assigned, bucket) = match sticky.variation {
            Some(variation) => (variation, None),
            None => {
                if let Some(filters) = &experiment.filters {
                    if is_filtered_out(filters, self.attributes) {
                        return excluded(false);
                    }
                } else if let Some(namespace) = &experiment.namespace {
                    if !in_namespace(hash_value, namespace) {
                        return excluded(false);
                    }
                }

                if let Some(condition) = &experiment.condition {
                    if !condition.matches_with_groups(self.attributes, self.saved_groups()) {
                        return excluded(false);
                    }
                }

                if !matches!(
                    self.check_parents(&experiment.parent_conditions),
                    ParentCheck::Pass
                ) {
                    return excluded(false);
                }

                let Some(n) = hash(experiment.seed(), hash_value, experiment.hash_version())
                else {
                    log::warn!(target: "splitkit",
                               experiment_key:display = experiment.key,
                               hash_version = experiment.hash_version();
                               "unsupported hash version");
                    return excluded(false);
                };

                let ranges = match &experiment.ranges {
                    Some(ranges) => ranges.clone(),
                    None => bucket_ranges(
                        experiment.variations.len(),
                        experiment.coverage.unwrap_or(1.0),
                        experiment.weights.as_deref(),
                    ),
                };
                let Some(assigned) = choose_variation(n, &ranges) else {
                    return excluded(false);
                };
                (assigned, Some(n))
            }
        };

        if let Some(force) = experiment.force {
            return Assignment {
                result: experiment_result(experiment, Some(force), &identity, None, false, false),
                forced: false,
            };
        }

        if self.options.qa_mode {
            return excluded(false);
        }

        let sticky_bucket_used = sticky.variation.is_some();
        let result = experiment_result(
            experiment,
            Some(assigned),
            &identity,
            bucket,
            !sticky_bucket_used,
            sticky_bucket_used,
        );

        if use_sticky {
            if let Some(buckets) = &mut self.sticky_buckets {
                if let Some(document) = buckets.assign(
                    &result.hash_attribute,
                    &result.hash_value,
                    experiment,
                    experiment.variation_key(assigned),
                ) {
                    self.sticky_updates.insert(document.key(), document);
                }
            }
        }

        log::trace!(target: "splitkit",
                    experiment_key:display = experiment.key,
                    variation = assigned,
                    sticky_bucket_used;
                    "assigned experiment variation");
        self.tracks.push((experiment.clone(), result.clone()));

        Assignment {
            result,
            forced: false,
        }
    }

    /// Resolve the identifier used for hashing. The fallback attribute is only used when sticky
    /// bucketing is enabled.
    fn hash_identity(&self, attribute: &str, fallback: Option<&str>) -> (String, Option<String>) {
        if let Some(value) = hash_value(self.attributes, attribute) {
            return (attribute.to_owned(), Some(value));
        }
        if self.sticky_buckets.is_some() {
            if let Some(fallback) = fallback {
                if let Some(value) = hash_value(self.attributes, fallback) {
                    return (fallback.to_owned(), Some(value));
                }
            }
        }
        (attribute.to_owned(), None)
    }
}

struct Identity<'i> {
    hash_attribute: &'i str,
    hash_value: Option<&'i str>,
    feature_id: Option<&'i str>,
}

fn experiment_result(
    experiment: &Experiment,
    variation: Option<usize>,
    identity: &Identity,
    bucket: Option<f64>,
    hash_used: bool,
    sticky_bucket_used: bool,
) -> ExperimentResult {
    let (variation_id, in_experiment) = match variation {
        Some(index) if index < experiment.variations.len() => (index, true),
        _ => (0, false),
    };
    let meta = experiment.variation_meta(variation_id);

    ExperimentResult {
        value: experiment
            .variations
            .get(variation_id)
            .cloned()
            .unwrap_or(Value::Null),
        variation_id,
        key: experiment.variation_key(variation_id),
        name: meta.and_then(|meta| meta.name.clone()),
        in_experiment,
        hash_used,
        hash_attribute: identity.hash_attribute.to_owned(),
        hash_value: identity.hash_value.unwrap_or_default().to_owned(),
        feature_id: identity.feature_id.map(str::to_owned),
        bucket,
        passthrough: meta.is_some_and(|meta| meta.passthrough),
        sticky_bucket_used,
    }
}

fn feature_result(value: Value, source: FeatureSource, rule_id: Option<String>) -> FeatureResult {
    FeatureResult {
        on: is_truthy(&value),
        value,
        source,
        rule_id,
        experiment: None,
        experiment_result: None,
    }
}

/// `null`, `false`, `0`, `""` and empty arrays and objects are off.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        models::{Namespace, VariationMeta},
        sticky_bucket::StickyBucketDocument,
    };

    fn features(payload: Value) -> FeatureSet {
        FeatureSet::from_json(payload).unwrap()
    }

    fn attributes(value: Value) -> Attributes {
        serde_json::from_value(value).unwrap()
    }

    fn eval(features: &FeatureSet, attributes: &Attributes, key: &str) -> FeatureResult {
        let options = EvalOptions::default();
        Evaluation::new(Some(features), attributes, &options, None).eval_feature(key)
    }

    fn keyed_meta(keys: &[&str]) -> Vec<VariationMeta> {
        keys.iter()
            .map(|key| VariationMeta {
                key: Some((*key).to_owned()),
                ..Default::default()
            })
            .collect()
    }

    #[test]
    fn unknown_feature() {
        let result = eval(&FeatureSet::default(), &Attributes::new(), "missing");
        assert_eq!(result.source, FeatureSource::UnknownFeature);
        assert_eq!(result.value, Value::Null);
        assert!(result.is_off());

        let options = EvalOptions::default();
        let result = Evaluation::new(None, &Attributes::new(), &options, None).eval_feature("any");
        assert_eq!(result.source, FeatureSource::UnknownFeature);
    }

    #[test]
    fn force_rule_with_condition() {
        let features = features(json!({
            "features": {
                "f": {
                    "defaultValue": "default",
                    "rules": [{ "id": "r1", "condition": { "country": "US" }, "force": "us" }]
                }
            }
        }));

        let us = eval(&features, &attributes(json!({ "country": "US" })), "f");
        assert_eq!(us.value, json!("us"));
        assert_eq!(us.source, FeatureSource::Force);
        assert_eq!(us.rule_id.as_deref(), Some("r1"));

        let ca = eval(&features, &attributes(json!({ "country": "CA" })), "f");
        assert_eq!(ca.value, json!("default"));
        assert_eq!(ca.source, FeatureSource::DefaultValue);
    }

    #[test]
    fn force_rule_rollout() {
        let features = features(json!({
            "features": {
                "f": {
                    "defaultValue": false,
                    "rules": [{ "force": true, "coverage": 0.5, "hashAttribute": "id" }]
                }
            }
        }));

        let on = (0..1_000)
            .filter(|i| eval(&features, &attributes(json!({ "id": i.to_string() })), "f").on)
            .count();
        assert!((400..600).contains(&on), "{on} users rolled out");

        let anonymous = eval(&features, &Attributes::new(), "f");
        assert_eq!(anonymous.source, FeatureSource::DefaultValue);
    }

    #[test]
    fn experiment_rule_assigns_by_hash() {
        let features = features(json!({
            "features": {
                "f": {
                    "defaultValue": "control",
                    "rules": [{ "variations": ["a", "b"], "key": "exp", "seed": "exp" }]
                }
            }
        }));

        let user = attributes(json!({ "id": "123" }));
        let result = eval(&features, &user, "f");
        assert_eq!(result.source, FeatureSource::Experiment);

        let experiment_result = result.experiment_result.unwrap();
        let n = hash("exp", "123", 1).unwrap();
        assert_eq!(experiment_result.bucket, Some(n));
        assert_eq!(experiment_result.variation_id, usize::from(n >= 0.5));
        assert!(experiment_result.hash_used);
        assert_eq!(experiment_result.hash_attribute, "id");
        assert_eq!(experiment_result.hash_value, "123");
        assert_eq!(experiment_result.feature_id.as_deref(), Some("f"));
        assert_eq!(result.experiment.unwrap().key, "exp");
    }

    #[test]
    fn experiment_rule_skipped_without_hash_value() {
        let features = features(json!({
            "features": {
                "f": {
                    "defaultValue": 0,
                    "rules": [{ "variations": [1, 2] }]
                }
            }
        }));
        let result = eval(&features, &Attributes::new(), "f");
        assert_eq!(result.source, FeatureSource::DefaultValue);
        assert_eq!(result.value, json!(0));
    }

    #[test]
    fn passthrough_variation_falls_through() {
        let features = features(json!({
            "features": {
                "f": {
                    "defaultValue": "default",
                    "rules": [
                        {
                            "variations": ["holdout", "holdout"],
                            "meta": [{ "passthrough": true }, { "passthrough": true }]
                        },
                        { "force": "next" }
                    ]
                }
            }
        }));
        let options = EvalOptions::default();
        let user = attributes(json!({ "id": "1" }));
        let mut evaluation = Evaluation::new(Some(&features), &user, &options, None);
        let result = evaluation.eval_feature("f");
        assert_eq!(result.value, json!("next"));
        // The holdout assignment is still tracked.
        assert_eq!(evaluation.into_effects().tracks.len(), 1);
    }

    #[test]
    fn kill_switch_returns_default_without_tracking() {
        let features = features(json!({
            "features": {
                "f": {
                    "defaultValue": "default",
                    "rules": [{ "force": "forced" }, { "variations": ["a", "b"] }]
                }
            }
        }));
        let options = EvalOptions {
            enabled: false,
            ..Default::default()
        };
        let user = attributes(json!({ "id": "1" }));
        let mut evaluation = Evaluation::new(Some(&features), &user, &options, None);
        let result = evaluation.eval_feature("f");
        assert_eq!(result.value, json!("default"));
        assert_eq!(result.source, FeatureSource::DefaultValue);
        assert!(evaluation.into_effects().tracks.is_empty());
    }

    #[test]
    fn forced_variation_is_reported_as_force() {
        let features = features(json!({
            "features": {
                "f": { "rules": [{ "variations": ["a", "b", "c"], "key": "exp" }] }
            }
        }));
        let options = EvalOptions {
            forced_variations: HashMap::from([("exp".to_owned(), 2)]),
            ..Default::default()
        };
        // Works without a hash attribute too.
        let user = Attributes::new();
        let mut evaluation = Evaluation::new(Some(&features), &user, &options, None);
        let result = evaluation.eval_feature("f");

        assert_eq!(result.value, json!("c"));
        assert_eq!(result.source, FeatureSource::Force);
        assert!(!result.experiment_result.unwrap().hash_used);
        assert!(evaluation.into_effects().tracks.is_empty());
    }

    #[test]
    fn qa_mode_suppresses_hash_assignment() {
        let features = features(json!({
            "features": {
                "exp": { "defaultValue": "default", "rules": [{ "variations": ["a", "b"] }] },
                "forced": { "defaultValue": "default", "rules": [{ "force": "forced" }] }
            }
        }));
        let options = EvalOptions {
            qa_mode: true,
            ..Default::default()
        };
        let user = attributes(json!({ "id": "1" }));
        let mut evaluation = Evaluation::new(Some(&features), &user, &options, None);

        assert_eq!(evaluation.eval_feature("exp").value, json!("default"));
        assert_eq!(evaluation.eval_feature("forced").value, json!("forced"));

        let experiment = Experiment::new("direct", vec![json!(0), json!(1)])
            .unwrap()
            .with_force(1);
        let result = evaluation.run(&experiment);
        assert!(result.in_experiment);
        assert_eq!(result.value, json!(1));
        assert!(evaluation.into_effects().tracks.is_empty());
    }

    #[test]
    fn run_excludes_invalid_experiments() {
        let options = EvalOptions::default();
        let user = attributes(json!({ "id": "1" }));
        let mut evaluation = Evaluation::new(None, &user, &options, None);

        let single = Experiment::new("single", vec![json!("only")]).unwrap();
        let result = evaluation.run(&single);
        assert!(!result.in_experiment);
        assert_eq!(result.value, json!("only"));

        let mut inactive = Experiment::new("inactive", vec![json!(0), json!(1)]).unwrap();
        inactive.active = false;
        assert!(!evaluation.run(&inactive).in_experiment);

        let unsupported = Experiment::new("v3", vec![json!(0), json!(1)])
            .unwrap()
            .with_hash_version(3);
        assert!(!evaluation.run(&unsupported).in_experiment);

        let uncovered = Experiment::new("uncovered", vec![json!(0), json!(1)])
            .unwrap()
            .with_coverage(0.0);
        assert!(!evaluation.run(&uncovered).in_experiment);

        assert!(evaluation.into_effects().tracks.is_empty());
    }

    #[test]
    fn run_applies_condition() {
        let options = EvalOptions::default();
        let experiment = Experiment::new("exp", vec![json!(0), json!(1)])
            .unwrap()
            .with_condition(json!({ "plan": "pro" }).into());

        let pro = attributes(json!({ "id": "1", "plan": "pro" }));
        assert!(Evaluation::new(None, &pro, &options, None).run(&experiment).in_experiment);

        let free = attributes(json!({ "id": "1", "plan": "free" }));
        assert!(!Evaluation::new(None, &free, &options, None).run(&experiment).in_experiment);
    }

    #[test]
    fn namespaces_exclude_each_other() {
        let options = EvalOptions::default();
        let first = Experiment::new("first", vec![json!(0), json!(1)])
            .unwrap()
            .with_namespace(Namespace("ns".into(), 0.0, 0.5));
        let second = Experiment::new("second", vec![json!(0), json!(1)])
            .unwrap()
            .with_namespace(Namespace("ns".into(), 0.5, 1.0));

        for i in 0..200 {
            let user = attributes(json!({ "id": format!("user-{i}") }));
            let mut evaluation = Evaluation::new(None, &user, &options, None);
            let in_first = evaluation.run(&first).in_experiment;
            let in_second = evaluation.run(&second).in_experiment;
            assert!(in_first != in_second);
        }
    }

    #[test]
    fn prerequisites() {
        let features = features(json!({
            "features": {
                "parent": { "defaultValue": true },
                "off_parent": { "defaultValue": false },
                "gated": {
                    "defaultValue": "default",
                    "rules": [{
                        "parentConditions": [{
                            "id": "off_parent",
                            "condition": { "value": true },
                            "gate": true
                        }],
                        "force": "forced"
                    }]
                },
                "skipped": {
                    "defaultValue": "default",
                    "rules": [
                        {
                            "parentConditions": [
                                { "id": "off_parent", "condition": { "value": true } }
                            ],
                            "force": "first"
                        },
                        {
                            "parentConditions": [
                                { "id": "parent", "condition": { "value": true } }
                            ],
                            "force": "second"
                        }
                    ]
                },
                "a": {
                    "rules": [{
                        "parentConditions": [{ "id": "b", "condition": { "value": true } }],
                        "force": 1
                    }]
                },
                "b": {
                    "rules": [{
                        "parentConditions": [{ "id": "a", "condition": { "value": true } }],
                        "force": 1
                    }]
                }
            }
        }));
        let user = Attributes::new();

        let gated = eval(&features, &user, "gated");
        assert_eq!(gated.source, FeatureSource::Prerequisite);
        assert_eq!(gated.value, Value::Null);

        assert_eq!(eval(&features, &user, "skipped").value, json!("second"));

        assert_eq!(
            eval(&features, &user, "a").source,
            FeatureSource::CyclicPrerequisite
        );
    }

    #[test]
    fn saved_groups_in_conditions() {
        let features = features(json!({
            "features": {
                "f": {
                    "defaultValue": false,
                    "rules": [{ "condition": { "id": { "$inGroup": "beta" } }, "force": true }]
                }
            },
            "savedGroups": { "beta": ["1", "2"] }
        }));
        assert!(eval(&features, &attributes(json!({ "id": "2" })), "f").on);
        assert!(!eval(&features, &attributes(json!({ "id": "3" })), "f").on);
    }

    #[test]
    fn sticky_bucket_assignment_is_reused() {
        let experiment = Experiment::new("exp", vec![json!("a"), json!("b")])
            .unwrap()
            .with_meta(keyed_meta(&["control", "treatment"]))
            .with_condition(json!({ "country": "US" }).into());

        let options = EvalOptions::default();
        let user = attributes(json!({ "id": "1", "country": "US" }));
        let mut evaluation = Evaluation::new(None, &user, &options, Some(StickyBuckets::default()));
        let first = evaluation.run(&experiment);
        assert!(first.in_experiment && first.hash_used);

        let effects = evaluation.into_effects();
        let document = effects.sticky_updates.get("id||1").unwrap();
        assert_eq!(
            document.assignments.get("exp__0").map(String::as_str),
            Some(first.key.as_str())
        );

        // The stored assignment wins even though the condition no longer matches.
        let moved = attributes(json!({ "id": "1", "country": "CA" }));
        let buckets = StickyBuckets::new(effects.sticky_updates);
        let mut evaluation = Evaluation::new(None, &moved, &options, Some(buckets));
        let second = evaluation.run(&experiment);
        assert!(second.in_experiment);
        assert!(second.sticky_bucket_used);
        assert!(!second.hash_used);
        assert_eq!(second.variation_id, first.variation_id);

        let effects = evaluation.into_effects();
        assert!(effects.sticky_updates.is_empty());
        assert_eq!(effects.tracks.len(), 1);
    }

    #[test]
    fn sticky_bucket_version_blocks_user() {
        let mut experiment = Experiment::new("exp", vec![json!("a"), json!("b")])
            .unwrap()
            .with_meta(keyed_meta(&["control", "treatment"]));
        experiment.bucket_version = 2;
        experiment.min_bucket_version = 2;

        let buckets = StickyBuckets::new(HashMap::from([(
            "id||1".to_owned(),
            StickyBucketDocument {
                attribute_name: "id".into(),
                attribute_value: "1".into(),
                assignments: HashMap::from([("exp__1".to_owned(), "control".to_owned())]),
            },
        )]));

        let options = EvalOptions::default();
        let user = attributes(json!({ "id": "1" }));
        let result = Evaluation::new(None, &user, &options, Some(buckets)).run(&experiment);
        assert!(!result.in_experiment);
        assert!(result.sticky_bucket_used);
    }

    #[test]
    fn fallback_attribute_requires_sticky_bucketing() {
        let mut experiment = Experiment::new("exp", vec![json!(0), json!(1)]).unwrap();
        experiment.fallback_attribute = Some("deviceId".into());

        let options = EvalOptions::default();
        let user = attributes(json!({ "deviceId": "d-1" }));

        let result = Evaluation::new(None, &user, &options, None).run(&experiment);
        assert!(!result.in_experiment);

        let result =
            Evaluation::new(None, &user, &options, Some(StickyBuckets::default())).run(&experiment);
        assert!(result.in_experiment);
        assert_eq!(result.hash_attribute, "deviceId");
        assert_eq!(result.hash_value, "d-1");
    }

    #[test]
    fn truthiness() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!([])));
        assert!(!is_truthy(&json!({})));
        assert!(is_truthy(&json!("off")));
        assert!(is_truthy(&json!(0.5)));
        assert!(is_truthy(&json!([0])));
    }
}
