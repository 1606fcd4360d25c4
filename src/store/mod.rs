//! Local persistence for the reporting backlog and the last-known features.
//!
//! Both stores swallow their own failures: a mutation that could not be
//! committed returns `false`, a read that failed returns the empty value.
//! Callers decide what to do with data that could not be persisted.

pub mod null;
pub mod sled_store;

use std::sync::Arc;

use tracing::warn;

use crate::config::CacheConfig;
use crate::features::{FeatureSnapshot, UnknownFeatures};
use crate::payload::Bucket;

pub use null::{NullBuckets, NullFeatures};
pub use sled_store::{SledBuckets, SledFeatures};

/// Tree holding one entry per stored bucket.
pub const BUCKETS_KEY: &str = "buckets";
/// Key holding the last published feature snapshot.
pub const FEATURES_KEY: &str = "features";
/// Key holding the unknown-feature registry.
pub const UNKNOWN_FEATURES_KEY: &str = "unknown_features";

/// Ordered overflow storage for transaction buckets. Implementations must be
/// thread-safe.
pub trait BucketStore: Send + Sync {
    /// Removes and returns up to `n` of the oldest buckets, oldest first.
    fn fetch(&self, n: usize) -> Vec<Bucket>;

    /// Appends `buckets` after everything already stored.
    fn append(&self, buckets: &[Bucket]) -> bool;

    /// Appends a single bucket after everything already stored.
    fn append_one(&self, bucket: &Bucket) -> bool;

    fn is_empty(&self) -> bool;

    /// Transaction counts of the stored buckets, oldest first. Leaves the
    /// store untouched.
    fn sizes(&self) -> Vec<usize>;
}

/// Key-value storage for the feature snapshot and unknown-feature registry.
pub trait FeatureStore: Send + Sync {
    fn list(&self) -> FeatureSnapshot;

    fn replace(&self, features: &FeatureSnapshot) -> bool;

    fn list_unknown(&self) -> UnknownFeatures;

    fn replace_unknown(&self, unknown: &UnknownFeatures) -> bool;
}

/// Opens the bucket store described by `config`, or a [`NullBuckets`] when
/// caching is disabled, unconfigured, has no size limit, or cannot be opened.
pub fn buckets(config: Option<&CacheConfig>) -> Arc<dyn BucketStore> {
    let Some(config) = config.filter(|c| c.enable && c.limit > 0) else {
        return Arc::new(NullBuckets);
    };
    match SledBuckets::open(&config.dir, config.limit) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            warn!("failed to open bucket store in {}: {}", config.dir.display(), e);
            Arc::new(NullBuckets)
        }
    }
}

/// Opens the feature store described by `config`, or a [`NullFeatures`] when
/// caching is disabled, unconfigured, or cannot be opened.
pub fn features(config: Option<&CacheConfig>) -> Arc<dyn FeatureStore> {
    let Some(config) = config.filter(|c| c.enable) else {
        return Arc::new(NullFeatures);
    };
    match SledFeatures::open(&config.dir) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            warn!("failed to open feature store in {}: {}", config.dir.display(), e);
            Arc::new(NullFeatures)
        }
    }
}
