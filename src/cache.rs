use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::features::{merge_unknown, FeatureSnapshot, UnknownFeatures};
use crate::store::FeatureStore;

/// Last-known feature snapshot plus the registry of features queried but not
/// yet known to the remote authority. Both are mirrored to the store on every
/// change so a restarted process can pick up where it left off.
pub struct FeatureCache {
    features: RwLock<Arc<FeatureSnapshot>>,
    unknown: Mutex<UnknownFeatures>,
    store: Arc<dyn FeatureStore>,
}

impl FeatureCache {
    /// An empty cache. The unknown-feature registry is restored from `store`;
    /// the snapshot is loaded lazily, see [`FeatureCache::load_persisted`].
    pub fn new(store: Arc<dyn FeatureStore>) -> Self {
        let unknown = store.list_unknown();
        Self {
            features: RwLock::new(Arc::new(FeatureSnapshot::new())),
            unknown: Mutex::new(unknown),
            store,
        }
    }

    /// The current snapshot. Never blocks on I/O.
    pub fn read(&self) -> Arc<FeatureSnapshot> {
        Arc::clone(&self.features.read())
    }

    pub fn is_empty(&self) -> bool {
        self.features.read().is_empty()
    }

    /// Publishes `snapshot` and persists it. An empty snapshot never replaces
    /// the current one; returns whether the swap happened.
    pub fn replace(&self, snapshot: FeatureSnapshot) -> bool {
        if snapshot.is_empty() {
            debug!("ignoring empty feature snapshot");
            return false;
        }
        let snapshot = Arc::new(snapshot);
        *self.features.write() = Arc::clone(&snapshot);
        if !self.store.replace(&snapshot) {
            debug!("feature snapshot not persisted");
        }
        info!("feature snapshot replaced ({} features)", snapshot.len());
        true
    }

    /// Publishes whatever the store holds, if anything. Returns whether a
    /// snapshot was loaded.
    pub fn load_persisted(&self) -> bool {
        let persisted = self.store.list();
        if persisted.is_empty() {
            return false;
        }
        *self.features.write() = Arc::new(persisted);
        true
    }

    /// Records unknown features, keeping the first default seen for each
    /// feature/version pair, and persists the registry.
    pub fn merge_unknown(&self, incoming: &UnknownFeatures) {
        if incoming.is_empty() {
            return;
        }
        let mut unknown = self.unknown.lock();
        merge_unknown(&mut unknown, incoming);
        self.store.replace_unknown(&unknown);
    }

    /// Takes the registry, leaving it empty. The persisted copy is left alone
    /// until the taken registry has been delivered.
    pub fn take_unknown(&self) -> UnknownFeatures {
        std::mem::take(&mut *self.unknown.lock())
    }

    /// Writes the live registry to the store.
    pub fn persist_unknown(&self) -> bool {
        let unknown = self.unknown.lock();
        self.store.replace_unknown(&unknown)
    }

    pub fn unknown(&self) -> UnknownFeatures {
        self.unknown.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{NullFeatures, SledFeatures};
    use std::collections::HashMap;

    fn snapshot(json: &str) -> FeatureSnapshot {
        serde_json::from_str(json).unwrap()
    }

    fn unknown(feature: &str, version: &str, default: bool) -> UnknownFeatures {
        HashMap::from([(
            feature.to_string(),
            HashMap::from([(version.to_string(), default)]),
        )])
    }

    #[test]
    fn test_replace_ignores_empty_snapshot() {
        let cache = FeatureCache::new(Arc::new(NullFeatures));
        assert!(cache.is_empty());
        let good = snapshot(r#"{"F": {"num_parts": 2, "versions": {}}}"#);
        assert!(cache.replace(good.clone()));
        assert!(!cache.replace(FeatureSnapshot::new()));
        assert_eq!(*cache.read(), good);
    }

    #[test]
    fn test_readers_keep_their_snapshot() {
        let cache = FeatureCache::new(Arc::new(NullFeatures));
        cache.replace(snapshot(r#"{"A": {"num_parts": 1}}"#));
        let before = cache.read();
        cache.replace(snapshot(r#"{"B": {"num_parts": 1}}"#));
        assert!(before.contains_key("A"));
        assert!(cache.read().contains_key("B"));
    }

    #[test]
    fn test_snapshot_and_registry_are_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn FeatureStore> = Arc::new(SledFeatures::open(dir.path()).unwrap());
        let cache = FeatureCache::new(Arc::clone(&store));
        let features = snapshot(r#"{"F": {"num_parts": 5, "versions": {"a": {"parts": [1]}}}}"#);
        cache.replace(features.clone());
        cache.merge_unknown(&unknown("New", "default", true));
        drop(cache);

        let restored = FeatureCache::new(store);
        assert!(restored.is_empty());
        assert!(restored.load_persisted());
        assert_eq!(*restored.read(), features);
        assert_eq!(restored.unknown(), unknown("New", "default", true));
    }

    #[test]
    fn test_unknown_first_default_wins() {
        let cache = FeatureCache::new(Arc::new(NullFeatures));
        cache.merge_unknown(&unknown("F", "V", true));
        cache.merge_unknown(&unknown("F", "V", false));
        assert_eq!(cache.unknown()["F"]["V"], true);

        let taken = cache.take_unknown();
        assert!(cache.unknown().is_empty());
        cache.merge_unknown(&unknown("F", "V", false));
        cache.merge_unknown(&taken);
        // a default recorded while the taken registry was out stays put
        assert_eq!(cache.unknown()["F"]["V"], false);
    }
}
