//! Sticky bucketing: persisting experiment assignments so that later changes to targeting or
//! traffic allocation don't move users between variations.
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use serde::{Deserialize, Serialize};

use crate::{attributes::hash_value, Attributes, Error, Experiment, Result};

/// Persisted assignments for one identifier, e.g. `("id", "user-123")`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StickyBucketDocument {
    /// Identifier attribute name.
    pub attribute_name: String,
    /// Identifier attribute value.
    pub attribute_value: String,
    /// `"{experimentKey}__{bucketVersion}"` → variation key.
    pub assignments: HashMap<String, String>,
}

impl StickyBucketDocument {
    /// Storage key of the document.
    pub fn key(&self) -> String {
        document_key(&self.attribute_name, &self.attribute_value)
    }
}

pub(crate) fn document_key(attribute_name: &str, attribute_value: &str) -> String {
    format!("{attribute_name}||{attribute_value}")
}

pub(crate) fn assignment_key(experiment_key: &str, bucket_version: u32) -> String {
    format!("{experiment_key}__{bucket_version}")
}

/// A storage for sticky bucket documents.
///
/// Implementations must be safe for concurrent use: the client reads documents before evaluating
/// and writes updated documents after. Last write wins.
///
/// # Examples
///
/// ```no_run
/// # use splitkit::{StickyBucketDocument, StickyBucketService, Result};
/// struct RedisStickyBucketService;
///
/// impl StickyBucketService for RedisStickyBucketService {
///     fn get_assignments(
///         &self,
///         attribute_name: &str,
///         attribute_value: &str,
///     ) -> Result<Option<StickyBucketDocument>> {
///         // Load document here
///         Ok(None)
///     }
///
///     fn save_assignments(&self, document: StickyBucketDocument) -> Result<()> {
///         // Persist document here
///         Ok(())
///     }
/// }
/// ```
pub trait StickyBucketService {
    /// Load the document for the given identifier.
    fn get_assignments(
        &self,
        attribute_name: &str,
        attribute_value: &str,
    ) -> Result<Option<StickyBucketDocument>>;

    /// Store `document`, replacing a previously stored document with the same key.
    fn save_assignments(&self, document: StickyBucketDocument) -> Result<()>;

    /// Load documents for all identifiers in `attributes` (attribute name → value), keyed by
    /// [`StickyBucketDocument::key`].
    ///
    /// The default implementation calls [`StickyBucketService::get_assignments`] for every entry.
    /// Implementations backed by remote storage may want to batch the lookups.
    fn get_all_assignments(
        &self,
        attributes: &HashMap<String, String>,
    ) -> Result<HashMap<String, StickyBucketDocument>> {
        let mut documents = HashMap::new();
        for (name, value) in attributes {
            if let Some(document) = self.get_assignments(name, value)? {
                documents.insert(document.key(), document);
            }
        }
        Ok(documents)
    }
}

impl<T: StickyBucketService + ?Sized> StickyBucketService for Arc<T> {
    fn get_assignments(
        &self,
        attribute_name: &str,
        attribute_value: &str,
    ) -> Result<Option<StickyBucketDocument>> {
        (**self).get_assignments(attribute_name, attribute_value)
    }

    fn save_assignments(&self, document: StickyBucketDocument) -> Result<()> {
        (**self).save_assignments(document)
    }

    fn get_all_assignments(
        &self,
        attributes: &HashMap<String, String>,
    ) -> Result<HashMap<String, StickyBucketDocument>> {
        (**self).get_all_assignments(attributes)
    }
}

/// Process-local [`StickyBucketService`].
#[derive(Debug, Default)]
pub struct InMemoryStickyBucketService {
    documents: RwLock<HashMap<String, StickyBucketDocument>>,
}

impl InMemoryStickyBucketService {
    /// Create an empty store.
    pub fn new() -> InMemoryStickyBucketService {
        InMemoryStickyBucketService::default()
    }
}

impl StickyBucketService for InMemoryStickyBucketService {
    fn get_assignments(
        &self,
        attribute_name: &str,
        attribute_value: &str,
    ) -> Result<Option<StickyBucketDocument>> {
        let documents = self
            .documents
            .read()
            .map_err(|_| Error::StickyBucket("sticky bucket lock poisoned".to_owned()))?;
        Ok(documents
            .get(&document_key(attribute_name, attribute_value))
            .cloned())
    }

    fn save_assignments(&self, document: StickyBucketDocument) -> Result<()> {
        let mut documents = self
            .documents
            .write()
            .map_err(|_| Error::StickyBucket("sticky bucket lock poisoned".to_owned()))?;
        documents.insert(document.key(), document);
        Ok(())
    }
}

/// Outcome of a sticky bucket lookup for one experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct StickyLookup {
    /// Previously stored variation index.
    pub variation: Option<usize>,
    /// The user has an assignment from a bucket version below `minBucketVersion`.
    pub version_blocked: bool,
}

/// Request-scoped view of the sticky bucket documents of one user.
///
/// Documents are loaded once before evaluation. Assignments made during evaluation update the
/// working copy, so later experiments in the same call see them, and are returned for persistence.
#[derive(Debug, Default)]
pub(crate) struct StickyBuckets {
    documents: HashMap<String, StickyBucketDocument>,
}

impl StickyBuckets {
    pub fn new(documents: HashMap<String, StickyBucketDocument>) -> StickyBuckets {
        StickyBuckets { documents }
    }

    /// Load documents for every identifier attribute in `attribute_names` that `attributes` has a
    /// value for. Service failures are logged and result in no stored assignments.
    pub fn load<'n>(
        service: &dyn StickyBucketService,
        attribute_names: impl IntoIterator<Item = &'n str>,
        attributes: &Attributes,
    ) -> StickyBuckets {
        let identifiers: HashMap<String, String> = attribute_names
            .into_iter()
            .filter_map(|name| Some((name.to_owned(), hash_value(attributes, name)?)))
            .collect();

        if identifiers.is_empty() {
            return StickyBuckets::default();
        }

        match service.get_all_assignments(&identifiers) {
            Ok(documents) => StickyBuckets::new(documents),
            Err(err) => {
                log::warn!(target: "splitkit", "failed to load sticky bucket assignments: {err}");
                StickyBuckets::default()
            }
        }
    }

    /// Merged assignments of the primary and fallback identifiers. Primary assignments win.
    fn assignments(
        &self,
        attributes: &Attributes,
        hash_attribute: &str,
        fallback_attribute: Option<&str>,
    ) -> HashMap<&str, &str> {
        let mut merged = HashMap::new();
        let identifiers = std::iter::once(hash_attribute).chain(fallback_attribute);
        for name in identifiers {
            let Some(value) = hash_value(attributes, name) else {
                continue;
            };
            let Some(document) = self.documents.get(&document_key(name, &value)) else {
                continue;
            };
            for (key, variation) in &document.assignments {
                merged.entry(key.as_str()).or_insert(variation.as_str());
            }
        }
        merged
    }

    /// Look up a stored assignment for `experiment`.
    ///
    /// A stored variation key is only honored if it still names one of the experiment's variations.
    pub fn resolve(&self, experiment: &Experiment, attributes: &Attributes) -> StickyLookup {
        let assignments = self.assignments(
            attributes,
            experiment.hash_attribute(),
            experiment.fallback_attribute.as_deref(),
        );

        let version_blocked = (0..experiment.min_bucket_version).any(|version| {
            assignments.contains_key(assignment_key(&experiment.key, version).as_str())
        });
        if version_blocked {
            return StickyLookup {
                variation: None,
                version_blocked: true,
            };
        }

        let variation = assignments
            .get(assignment_key(&experiment.key, experiment.bucket_version).as_str())
            .and_then(|variation_key| {
                (0..experiment.variations.len())
                    .position(|index| experiment.variation_key(index) == *variation_key)
            });

        StickyLookup {
            variation,
            version_blocked: false,
        }
    }

    /// Record `variation_key` for `experiment` under the given identifier.
    ///
    /// Returns the updated document if it changed and needs to be persisted.
    pub fn assign(
        &mut self,
        attribute_name: &str,
        attribute_value: &str,
        experiment: &Experiment,
        variation_key: String,
    ) -> Option<StickyBucketDocument> {
        let document = self
            .documents
            .entry(document_key(attribute_name, attribute_value))
            .or_insert_with(|| StickyBucketDocument {
                attribute_name: attribute_name.to_owned(),
                attribute_value: attribute_value.to_owned(),
                assignments: HashMap::new(),
            });

        let key = assignment_key(&experiment.key, experiment.bucket_version);
        if document.assignments.get(&key) == Some(&variation_key) {
            return None;
        }
        document.assignments.insert(key, variation_key);
        Some(document.clone())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::models::VariationMeta;

    fn experiment() -> Experiment {
        Experiment::new("exp", vec![json!("a"), json!("b")])
            .unwrap()
            .with_meta(vec![
                VariationMeta {
                    key: Some("control".into()),
                    ..Default::default()
                },
                VariationMeta {
                    key: Some("treatment".into()),
                    ..Default::default()
                },
            ])
    }

    fn attributes(value: serde_json::Value) -> Attributes {
        serde_json::from_value(value).unwrap()
    }

    fn document(name: &str, value: &str, assignments: &[(&str, &str)]) -> StickyBucketDocument {
        StickyBucketDocument {
            attribute_name: name.into(),
            attribute_value: value.into(),
            assignments: assignments
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn in_memory_service_round_trip() {
        let service = InMemoryStickyBucketService::new();
        assert_eq!(service.get_assignments("id", "1").unwrap(), None);

        let doc = document("id", "1", &[("exp__0", "control")]);
        service.save_assignments(doc.clone()).unwrap();
        assert_eq!(service.get_assignments("id", "1").unwrap(), Some(doc.clone()));

        let all = service
            .get_all_assignments(&HashMap::from([
                ("id".to_owned(), "1".to_owned()),
                ("deviceId".to_owned(), "d".to_owned()),
            ]))
            .unwrap();
        assert_eq!(all, HashMap::from([("id||1".to_owned(), doc)]));
    }

    #[test]
    fn resolves_stored_variation() {
        let buckets = StickyBuckets::new(HashMap::from([(
            "id||1".to_owned(),
            document("id", "1", &[("exp__0", "treatment")]),
        )]));
        let lookup = buckets.resolve(&experiment(), &attributes(json!({ "id": "1" })));
        assert_eq!(lookup.variation, Some(1));
        assert!(!lookup.version_blocked);

        let other = buckets.resolve(&experiment(), &attributes(json!({ "id": "2" })));
        assert_eq!(other, StickyLookup::default());
    }

    #[test]
    fn ignores_unknown_variation_keys_and_other_bucket_versions() {
        let buckets = StickyBuckets::new(HashMap::from([(
            "id||1".to_owned(),
            document("id", "1", &[("exp__0", "removed"), ("exp__1", "control")]),
        )]));
        let attrs = attributes(json!({ "id": "1" }));
        assert_eq!(buckets.resolve(&experiment(), &attrs).variation, None);

        let mut bumped = experiment();
        bumped.bucket_version = 1;
        assert_eq!(buckets.resolve(&bumped, &attrs).variation, Some(0));
    }

    #[test]
    fn blocks_old_bucket_versions() {
        let buckets = StickyBuckets::new(HashMap::from([(
            "id||1".to_owned(),
            document("id", "1", &[("exp__0", "control")]),
        )]));
        let mut experiment = experiment();
        experiment.bucket_version = 1;
        experiment.min_bucket_version = 1;

        let lookup = buckets.resolve(&experiment, &attributes(json!({ "id": "1" })));
        assert!(lookup.version_blocked);
        assert_eq!(lookup.variation, None);
    }

    #[test]
    fn merges_fallback_assignments() {
        let buckets = StickyBuckets::new(HashMap::from([
            (
                "id||1".to_owned(),
                document("id", "1", &[("other__0", "x")]),
            ),
            (
                "deviceId||d".to_owned(),
                document("deviceId", "d", &[("exp__0", "treatment"), ("other__0", "y")]),
            ),
        ]));
        let mut experiment = experiment();
        experiment.fallback_attribute = Some("deviceId".into());

        let attrs = attributes(json!({ "id": "1", "deviceId": "d" }));
        let merged = buckets.assignments(&attrs, "id", Some("deviceId"));
        assert_eq!(merged.get("other__0"), Some(&"x"));
        assert_eq!(buckets.resolve(&experiment, &attrs).variation, Some(1));
    }

    #[test]
    fn assign_merges_and_reports_changes() {
        let mut buckets = StickyBuckets::new(HashMap::from([(
            "id||1".to_owned(),
            document("id", "1", &[("other__0", "x")]),
        )]));

        let updated = buckets
            .assign("id", "1", &experiment(), "control".into())
            .unwrap();
        assert_eq!(
            updated,
            document("id", "1", &[("other__0", "x"), ("exp__0", "control")])
        );

        // Same assignment again is not a change.
        assert_eq!(buckets.assign("id", "1", &experiment(), "control".into()), None);

        let created = buckets
            .assign("id", "2", &experiment(), "treatment".into())
            .unwrap();
        assert_eq!(created, document("id", "2", &[("exp__0", "treatment")]));
    }

    struct FailingService;

    impl StickyBucketService for FailingService {
        fn get_assignments(&self, _: &str, _: &str) -> Result<Option<StickyBucketDocument>> {
            Err(Error::StickyBucket("unavailable".into()))
        }

        fn save_assignments(&self, _: StickyBucketDocument) -> Result<()> {
            Err(Error::StickyBucket("unavailable".into()))
        }
    }

    #[test]
    fn load_swallows_service_errors() {
        let user = attributes(json!({ "id": "1" }));
        let buckets = StickyBuckets::load(&FailingService, ["id"], &user);
        assert!(buckets.documents.is_empty());
    }

    #[test]
    fn load_skips_missing_identifiers() {
        let service = InMemoryStickyBucketService::new();
        service
            .save_assignments(document("id", "1", &[("exp__0", "control")]))
            .unwrap();

        let buckets = StickyBuckets::load(
            &service,
            ["id", "deviceId"],
            &attributes(json!({ "id": "1" })),
        );
        assert_eq!(buckets.documents.len(), 1);
    }
}
