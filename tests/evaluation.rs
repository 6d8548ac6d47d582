use std::fs;

use serde::Deserialize;
use serde_json::Value;

use splitkit::{Attributes, ChannelTracker, ClientConfig, FeatureSource};

#[derive(Debug, Deserialize)]
struct TestCase {
    feature: String,
    subjects: Vec<TestSubject>,
}

#[derive(Debug, Deserialize)]
struct TestSubject {
    attributes: Attributes,
    value: Value,
    source: FeatureSource,
}

fn load_features() -> Value {
    serde_json::from_slice(&fs::read("tests/data/features.json").unwrap()).unwrap()
}

#[test]
fn evaluate_test_cases() {
    let client = ClientConfig::from_client_key("test")
        .features(load_features())
        .to_client();

    let cases: Vec<TestCase> =
        serde_json::from_slice(&fs::read("tests/data/cases.json").unwrap()).unwrap();

    for case in cases {
        println!("Processing feature: {:?}", case.feature);
        for subject in case.subjects {
            let result = client.eval_feature(&case.feature, &subject.attributes);
            assert_eq!(
                (&result.value, result.source),
                (&subject.value, subject.source),
                "feature {:?} with attributes {:?}",
                case.feature,
                subject.attributes
            );
        }
    }
}

#[test]
fn experiment_exposures_are_tracked_once() {
    let (tracker, events) = ChannelTracker::new();
    let client = ClientConfig::from_client_key("test")
        .features(load_features())
        .tracking_callback(tracker)
        .to_client();

    let alice: Attributes = serde_json::from_value(serde_json::json!({ "id": "alice" })).unwrap();
    let bob: Attributes = serde_json::from_value(serde_json::json!({ "id": "bob" })).unwrap();

    client.eval_feature("checkout-layout", &alice);
    client.eval_feature("checkout-layout", &alice);
    client.eval_feature("checkout-layout", &bob);
    // Force rules are not exposures.
    client.eval_feature("dark-mode", &alice);

    let events: Vec<_> = events.try_iter().collect();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].experiment.key, "checkout-layout");
    assert_eq!(events[0].result.key, "compact");
    assert_eq!(events[0].result.hash_value, "alice");
    assert_eq!(events[1].result.key, "control");
    assert_eq!(events[1].result.hash_value, "bob");
}

#[test]
fn disabled_client_serves_defaults() {
    let client = ClientConfig::from_client_key("test")
        .features(load_features())
        .enabled(false)
        .to_client();

    let alice: Attributes =
        serde_json::from_value(serde_json::json!({ "id": "alice", "country": "US" })).unwrap();

    assert!(client.is_off("dark-mode", &alice));
    assert_eq!(
        client.get_feature_value("checkout-layout", &alice, Value::Null),
        "classic"
    );
}
