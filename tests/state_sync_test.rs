mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{wait_for, FakeApi};
use fluidfeatures::assign::Attributes;
use fluidfeatures::cache::FeatureCache;
use fluidfeatures::state::{FetchOutcome, StateSync};
use fluidfeatures::store::{FeatureStore, NullFeatures, SledFeatures};
use fluidfeatures::UserId;

const SNAPSHOT: &str = r#"{
    "Checkout": {
        "num_parts": 2,
        "versions": {
            "a": { "parts": [1] },
            "b": { "parts": [2], "enabled": { "attributes": { "company": ["acme"] } } }
        }
    }
}"#;

fn sync_with(store: Arc<dyn FeatureStore>) -> (Arc<FakeApi>, StateSync) {
    let api = Arc::new(FakeApi::new());
    let cache = Arc::new(FeatureCache::new(store));
    let sync = StateSync::new(api.clone(), cache, Duration::from_secs(30));
    (api, sync)
}

#[test]
fn test_cold_start_fetches_once_then_polls() {
    let (api, sync) = sync_with(Arc::new(NullFeatures));
    api.push_features(SNAPSHOT);

    assert!(!sync.is_running());
    let features = sync.features();
    assert!(features.contains_key("Checkout"));
    assert!(sync.is_running());

    sync.features();
    let calls = api.feature_calls();
    assert_eq!(calls[0], (None, false));
    assert_eq!(
        calls.iter().filter(|c| **c == (None, false)).count(),
        1,
        "only one unconditional fetch"
    );

    assert!(wait_for(Duration::from_secs(5), || api.feature_calls().len() > 1));
    assert_eq!(api.feature_calls()[1], (Some(Duration::from_secs(30)), true));
    sync.stop(true);
    assert!(!sync.is_running());
}

#[test]
fn test_cold_start_prefers_persisted_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn FeatureStore> = Arc::new(SledFeatures::open(dir.path()).unwrap());
    store.replace(&serde_json::from_str(SNAPSHOT).unwrap());

    let (api, sync) = sync_with(store);
    assert!(sync.features().contains_key("Checkout"));
    sync.stop(true);
    assert!(!api.feature_calls().contains(&(None, false)));
}

#[test]
fn test_failed_cold_start_still_starts_the_loop() {
    let (api, sync) = sync_with(Arc::new(NullFeatures));
    api.push_failure();
    assert!(sync.features().is_empty());
    assert!(sync.is_running());

    api.push_features(SNAPSHOT);
    assert!(wait_for(Duration::from_secs(5), || sync
        .cache()
        .read()
        .contains_key("Checkout")));
    sync.stop(true);
}

#[test]
fn test_load_state_outcomes() {
    let (api, sync) = sync_with(Arc::new(NullFeatures));

    api.push_features(SNAPSHOT);
    assert_eq!(sync.load_state(), FetchOutcome::Updated);
    assert_eq!(sync.load_state(), FetchOutcome::NoChange);

    api.push_failure();
    assert_eq!(sync.load_state(), FetchOutcome::Failed);
    assert!(sync.cache().read().contains_key("Checkout"));

    // an empty snapshot never clears a good one
    api.push_features("{}");
    assert_eq!(sync.load_state(), FetchOutcome::NoChange);
    assert!(sync.cache().read().contains_key("Checkout"));

    assert!(api
        .feature_calls()
        .iter()
        .all(|c| *c == (Some(Duration::from_secs(30)), true)));
    assert!(!sync.is_running());
}

#[test]
fn test_feature_version_enabled_for_user() {
    let (api, sync) = sync_with(Arc::new(NullFeatures));
    api.push_features(SNAPSHOT);
    let none = Attributes::new();

    let one = UserId::Int(1);
    let two = UserId::Int(2);
    assert!(sync
        .feature_version_enabled_for_user("Checkout", Some("a"), &one, &none)
        .unwrap());
    assert!(!sync
        .feature_version_enabled_for_user("Checkout", Some("b"), &one, &none)
        .unwrap());
    assert!(sync
        .feature_version_enabled_for_user("Checkout", Some("b"), &two, &none)
        .unwrap());

    let acme = Attributes::from([("company".to_string(), "acme".to_string())]);
    assert!(sync
        .feature_version_enabled_for_user("Checkout", Some("b"), &one, &acme)
        .unwrap());
    assert!(!sync
        .feature_version_enabled_for_user("Checkout", Some("a"), &one, &acme)
        .unwrap());

    assert!(!sync
        .feature_version_enabled_for_user("Missing", None, &one, &none)
        .unwrap());
    assert!(sync
        .feature_version_enabled_for_user("", None, &one, &none)
        .is_err());
    sync.stop(true);
}
