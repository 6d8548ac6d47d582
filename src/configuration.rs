use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::{
    models::{Feature, FeaturesPayload, TryParse},
    Result,
};

/// An immutable, fully decoded snapshot of feature definitions.
///
/// A `FeatureSet` is never modified after construction. Refreshes build a new `FeatureSet` and
/// swap it in as a whole, so an evaluation always sees one consistent set of rules.
#[derive(Debug, Default)]
pub struct FeatureSet {
    /// When the feature set was built.
    pub fetched_at: DateTime<Utc>,
    /// Server-side update timestamp of the payload, if provided.
    pub date_updated: Option<String>,
    /// Feature definitions. Features that failed to parse are not included.
    pub features: HashMap<String, Feature>,
    /// Saved groups referenced by `$inGroup` conditions.
    pub saved_groups: HashMap<String, Vec<Value>>,
    /// Identifier attributes used by sticky-bucketed experiments.
    sticky_bucket_attributes: Vec<String>,
}

impl FeatureSet {
    /// Build a feature set from a decoded payload. Features and rules that failed to parse are
    /// logged and skipped.
    pub fn from_payload(payload: FeaturesPayload) -> FeatureSet {
        let mut features = HashMap::with_capacity(payload.features.len());
        for (key, feature) in payload.features {
            match feature {
                TryParse::Parsed(feature) => {
                    let failed_rules = feature
                        .rules
                        .iter()
                        .filter(|rule| matches!(rule, TryParse::ParseFailed(_)))
                        .count();
                    if failed_rules > 0 {
                        log::warn!(target: "splitkit",
                                   feature_key:display = key,
                                   failed_rules;
                                   "skipping feature rules that failed to parse");
                    }
                    features.insert(key, feature);
                }
                TryParse::ParseFailed(_) => {
                    log::warn!(target: "splitkit",
                               feature_key:display = key;
                               "skipping feature that failed to parse");
                }
            }
        }

        let sticky_bucket_attributes = collect_sticky_bucket_attributes(&features);

        FeatureSet {
            fetched_at: Utc::now(),
            date_updated: payload.date_updated,
            features,
            saved_groups: payload.saved_groups,
            sticky_bucket_attributes,
        }
    }

    /// Decode a raw JSON payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigurationParse`](crate::Error::ConfigurationParse) if the payload is
    /// not a features payload at all (e.g., not an object). Individual broken features don't fail
    /// the whole payload.
    pub fn from_json(payload: Value) -> Result<FeatureSet> {
        let payload: FeaturesPayload = serde_json::from_value(payload)?;
        Ok(FeatureSet::from_payload(payload))
    }

    /// Get a set of all available feature keys.
    pub fn feature_keys(&self) -> HashSet<String> {
        self.features.keys().cloned().collect()
    }

    /// Identifier attributes that sticky bucket documents need to be loaded for.
    pub(crate) fn sticky_bucket_attributes(&self) -> &[String] {
        &self.sticky_bucket_attributes
    }
}

fn collect_sticky_bucket_attributes(features: &HashMap<String, Feature>) -> Vec<String> {
    let mut attributes = BTreeSet::new();
    for rule in features.values().flat_map(Feature::parsed_rules) {
        if rule.variations.is_none() || rule.disable_sticky_bucketing {
            continue;
        }
        attributes.insert(rule.hash_attribute.as_deref().unwrap_or("id").to_owned());
        if let Some(fallback) = &rule.fallback_attribute {
            attributes.insert(fallback.clone());
        }
    }
    attributes.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn skips_broken_features() {
        let features = FeatureSet::from_json(json!({
            "features": {
                "good": { "defaultValue": 1 },
                "bad": { "defaultValue": 1, "rules": 5 }
            },
            "dateUpdated": "2024-05-01T00:00:00Z"
        }))
        .unwrap();

        assert_eq!(features.feature_keys(), HashSet::from(["good".to_owned()]));
        assert_eq!(features.date_updated.as_deref(), Some("2024-05-01T00:00:00Z"));
    }

    #[test]
    fn rejects_non_payloads() {
        assert!(FeatureSet::from_json(json!([1, 2, 3])).is_err());
        assert!(FeatureSet::from_json(json!({ "features": [] })).is_err());
    }

    #[test]
    fn collects_sticky_bucket_attributes() {
        let features = FeatureSet::from_json(json!({
            "features": {
                "a": { "rules": [
                    { "variations": [0, 1] },
                    {
                        "variations": [0, 1],
                        "hashAttribute": "company",
                        "fallbackAttribute": "deviceId"
                    },
                    {
                        "variations": [0, 1],
                        "hashAttribute": "ignored",
                        "disableStickyBucketing": true
                    },
                    { "force": 1, "hashAttribute": "forced" }
                ] }
            }
        }))
        .unwrap();

        assert_eq!(
            features.sticky_bucket_attributes(),
            ["company", "deviceId", "id"]
        );
    }
}
