use crate::features::{FeatureSnapshot, UnknownFeatures};
use crate::payload::Bucket;

use super::{BucketStore, FeatureStore};

/// Bucket store used when persistence is off. Nothing is ever kept.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullBuckets;

impl BucketStore for NullBuckets {
    fn fetch(&self, _n: usize) -> Vec<Bucket> {
        Vec::new()
    }

    fn append(&self, _buckets: &[Bucket]) -> bool {
        false
    }

    fn append_one(&self, _bucket: &Bucket) -> bool {
        false
    }

    fn is_empty(&self) -> bool {
        true
    }

    fn sizes(&self) -> Vec<usize> {
        Vec::new()
    }
}

/// Feature store used when persistence is off.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullFeatures;

impl FeatureStore for NullFeatures {
    fn list(&self) -> FeatureSnapshot {
        FeatureSnapshot::new()
    }

    fn replace(&self, _features: &FeatureSnapshot) -> bool {
        false
    }

    fn list_unknown(&self) -> UnknownFeatures {
        UnknownFeatures::new()
    }

    fn replace_unknown(&self, _unknown: &UnknownFeatures) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_buckets_do_nothing() {
        let store = NullBuckets;
        assert!(store.fetch(10).is_empty());
        assert!(!store.append(&[Vec::new(), Vec::new()]));
        assert!(!store.append_one(&Vec::new()));
        assert!(store.is_empty());
    }

    #[test]
    fn test_null_features_do_nothing() {
        let store = NullFeatures;
        assert!(store.list().is_empty());
        assert!(store.list_unknown().is_empty());
        assert!(!store.replace(&FeatureSnapshot::new()));
        assert!(!store.replace_unknown(&UnknownFeatures::new()));
    }
}
