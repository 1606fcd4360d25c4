use std::path::Path;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use tracing::{debug, warn};

use super::{BucketStore, FeatureStore, BUCKETS_KEY, FEATURES_KEY, UNKNOWN_FEATURES_KEY};
use crate::error::{Error, Result};
use crate::features::{FeatureSnapshot, UnknownFeatures};
use crate::payload::Bucket;

/// Bucket backlog persisted in a sled database under `<dir>/buckets`.
///
/// Every bucket is its own entry in the [`BUCKETS_KEY`] tree, keyed by a
/// big-endian id from [`sled::Db::generate_id`], so iteration order is
/// insertion order. The limit applies to the summed size of the stored
/// values, not to the database files.
pub struct SledBuckets {
    db: sled::Db,
    tree: sled::Tree,
    limit: u64,
    stored: Mutex<u64>,
}

/// Feature snapshot and unknown-feature registry persisted in a sled database
/// under `<dir>/features`.
pub struct SledFeatures {
    db: sled::Db,
}

impl SledBuckets {
    pub fn new(db: sled::Db, limit: u64) -> Result<Self> {
        let tree = db.open_tree(BUCKETS_KEY)?;
        let mut stored = 0;
        for entry in tree.iter() {
            let (_, value) = entry?;
            stored += value.len() as u64;
        }
        Ok(Self {
            db,
            tree,
            limit,
            stored: Mutex::new(stored),
        })
    }

    /// Open (creating if needed) the bucket database inside `dir`. Appends
    /// are refused once the stored buckets would take more than `limit`
    /// bytes.
    pub fn open(dir: &Path, limit: u64) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let db = sled::open(dir.join("buckets"))?;
        Self::new(db, limit)
    }

    /// Bytes currently held by stored buckets.
    pub fn stored_bytes(&self) -> u64 {
        *self.stored.lock()
    }

    fn try_fetch(&self, n: usize) -> Result<Vec<Bucket>> {
        let mut stored = self.stored.lock();
        let mut batch = sled::Batch::default();
        let mut fetched = Vec::new();
        let mut freed = 0;
        for entry in self.tree.iter().take(n) {
            let (key, value) = entry?;
            batch.remove(key.clone());
            freed += value.len() as u64;
            match serde_json::from_slice(&value) {
                Ok(bucket) => fetched.push(bucket),
                Err(e) => warn!("dropping unreadable stored bucket {:?}: {}", key, e),
            }
        }
        if freed == 0 {
            return Ok(fetched);
        }
        self.tree.apply_batch(batch)?;
        self.tree.flush()?;
        *stored = stored.saturating_sub(freed);
        Ok(fetched)
    }

    fn try_append(&self, buckets: &[Bucket]) -> Result<()> {
        let encoded = buckets
            .iter()
            .map(serde_json::to_vec)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let incoming: u64 = encoded.iter().map(|v| v.len() as u64).sum();

        let mut stored = self.stored.lock();
        if *stored + incoming > self.limit {
            return Err(Error::StoreFull {
                stored: *stored,
                limit: self.limit,
            });
        }
        let mut batch = sled::Batch::default();
        for value in encoded {
            batch.insert(self.db.generate_id()?.to_be_bytes().to_vec(), value);
        }
        self.tree.apply_batch(batch)?;
        self.tree.flush()?;
        *stored += incoming;
        Ok(())
    }

    fn try_is_empty(&self) -> Result<bool> {
        Ok(self.tree.first()?.is_none())
    }

    fn try_sizes(&self) -> Result<Vec<usize>> {
        let mut sizes = Vec::new();
        for value in self.tree.iter().values() {
            let bucket: Bucket = serde_json::from_slice(&value?)?;
            sizes.push(bucket.len());
        }
        Ok(sizes)
    }
}

impl BucketStore for SledBuckets {
    fn fetch(&self, n: usize) -> Vec<Bucket> {
        self.try_fetch(n).unwrap_or_else(|e| {
            debug!("bucket store fetch failed: {}", e);
            Vec::new()
        })
    }

    fn append(&self, buckets: &[Bucket]) -> bool {
        match self.try_append(buckets) {
            Ok(()) => true,
            Err(e) => {
                debug!("bucket store append failed: {}", e);
                false
            }
        }
    }

    fn append_one(&self, bucket: &Bucket) -> bool {
        self.append(std::slice::from_ref(bucket))
    }

    fn is_empty(&self) -> bool {
        self.try_is_empty().unwrap_or_else(|e| {
            debug!("bucket store read failed: {}", e);
            true
        })
    }

    fn sizes(&self) -> Vec<usize> {
        self.try_sizes().unwrap_or_else(|e| {
            debug!("bucket store read failed: {}", e);
            Vec::new()
        })
    }
}

impl SledFeatures {
    pub fn new(db: sled::Db) -> Self {
        Self { db }
    }

    /// Open (creating if needed) the feature database inside `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let db = sled::open(dir.join("features"))?;
        Ok(Self::new(db))
    }
}

impl FeatureStore for SledFeatures {
    fn list(&self) -> FeatureSnapshot {
        read(&self.db, FEATURES_KEY)
            .unwrap_or_else(|e| {
                debug!("feature store read failed: {}", e);
                None
            })
            .unwrap_or_default()
    }

    fn replace(&self, features: &FeatureSnapshot) -> bool {
        match write(&self.db, FEATURES_KEY, features) {
            Ok(()) => true,
            Err(e) => {
                debug!("feature store write failed: {}", e);
                false
            }
        }
    }

    fn list_unknown(&self) -> UnknownFeatures {
        read(&self.db, UNKNOWN_FEATURES_KEY)
            .unwrap_or_else(|e| {
                debug!("feature store read failed: {}", e);
                None
            })
            .unwrap_or_default()
    }

    fn replace_unknown(&self, unknown: &UnknownFeatures) -> bool {
        match write(&self.db, UNKNOWN_FEATURES_KEY, unknown) {
            Ok(()) => true,
            Err(e) => {
                debug!("feature store write failed: {}", e);
                false
            }
        }
    }
}

fn read<T: DeserializeOwned>(db: &sled::Db, key: &str) -> Result<Option<T>> {
    match db.get(key)? {
        Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
        None => Ok(None),
    }
}

fn write<T: Serialize>(db: &sled::Db, key: &str, value: &T) -> Result<()> {
    let encoded = serde_json::to_vec(value)?;
    db.transaction(|tx| {
        tx.insert(key, encoded.as_slice())?;
        Ok::<(), ConflictableTransactionError<serde_json::Error>>(())
    })
    .map_err(from_transaction)?;
    db.flush()?;
    Ok(())
}

fn from_transaction(e: TransactionError<serde_json::Error>) -> Error {
    match e {
        TransactionError::Abort(e) => Error::Json(e),
        TransactionError::Storage(e) => Error::Storage(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{Hits, PayloadUser, TransactionPayload, TransactionStats};

    const LIMIT: u64 = crate::config::DEFAULT_CACHE_LIMIT;

    fn full_bucket(n: usize) -> Bucket {
        (0..100)
            .map(|i| payload(&format!("/orders/{:06}/items/{:03}?ref=newsletter-autumn", n, i)))
            .collect()
    }

    fn payload(url: &str) -> TransactionPayload {
        TransactionPayload {
            url: url.to_string(),
            user: PayloadUser {
                id: "user".into(),
                name: None,
                anonymous: None,
                unique: None,
                cohorts: None,
            },
            hits: Hits::default(),
            stats: TransactionStats { duration: 0.1 },
        }
    }

    #[test]
    fn test_append_then_fetch_keeps_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledBuckets::open(dir.path(), LIMIT).unwrap();
        assert!(store.is_empty());

        let buckets = vec![vec![payload("/1")], vec![payload("/2"), payload("/3")]];
        assert!(store.append(&buckets));
        assert!(store.append_one(&vec![payload("/4")]));
        assert!(!store.is_empty());
        assert_eq!(store.sizes(), vec![1, 2, 1]);

        assert_eq!(store.fetch(2), buckets);
        assert_eq!(store.fetch(5), vec![vec![payload("/4")]]);
        assert!(store.fetch(1).is_empty());
        assert!(store.is_empty());
    }

    #[test]
    fn test_fetch_removes_items() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledBuckets::open(dir.path(), LIMIT).unwrap();
        assert!(store.append(&[vec![payload("/a")], vec![payload("/b")]]));
        let first = store.fetch(1);
        let second = store.fetch(1);
        assert_eq!(first, vec![vec![payload("/a")]]);
        assert_eq!(second, vec![vec![payload("/b")]]);
    }

    #[test]
    fn test_limit_rejects_append_without_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledBuckets::open(dir.path(), 1).unwrap();
        assert!(!store.append_one(&vec![payload("/a")]));
        assert!(!store.append(&[vec![payload("/b")]]));
        assert!(store.is_empty());
        assert!(store.fetch(10).is_empty());
    }

    #[test]
    fn test_fill_drain_refill_at_default_limit() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledBuckets::open(dir.path(), LIMIT).unwrap();
        let bucket_bytes = serde_json::to_vec(&full_bucket(0)).unwrap().len() as u64;

        let mut appended = 0;
        while store.append_one(&full_bucket(appended)) {
            appended += 1;
        }
        // refusal happens at the logical limit, not at some fraction of it
        assert_eq!(appended as u64, LIMIT / bucket_bytes);
        assert!(store.stored_bytes() <= LIMIT);
        assert!(store.stored_bytes() + bucket_bytes > LIMIT);

        let mut drained = Vec::new();
        while !store.is_empty() {
            drained.extend(store.fetch(10));
        }
        assert_eq!(drained.len(), appended);
        assert_eq!(drained[0], full_bucket(0));
        assert_eq!(drained[appended - 1], full_bucket(appended - 1));
        assert_eq!(store.stored_bytes(), 0);

        assert!(store.append_one(&full_bucket(1000)));
        drop(store);

        let store = SledBuckets::open(dir.path(), LIMIT).unwrap();
        assert_eq!(store.stored_bytes(), bucket_bytes);
        assert!(store.append_one(&full_bucket(1001)));
        assert_eq!(store.sizes(), vec![100, 100]);
        assert_eq!(store.fetch(1), vec![full_bucket(1000)]);
    }

    #[test]
    fn test_backlog_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SledBuckets::open(dir.path(), LIMIT).unwrap();
            assert!(store.append_one(&vec![payload("/kept")]));
        }
        let store = SledBuckets::open(dir.path(), LIMIT).unwrap();
        assert_eq!(store.fetch(1), vec![vec![payload("/kept")]]);
    }

    #[test]
    fn test_features_replace_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledFeatures::open(dir.path()).unwrap();
        assert!(store.list().is_empty());
        assert!(store.list_unknown().is_empty());

        let features: FeatureSnapshot =
            serde_json::from_str(r#"{"F": {"num_parts": 4, "versions": {"a": {"parts": [1]}}}}"#)
                .unwrap();
        assert!(store.replace(&features));
        assert_eq!(store.list(), features);

        let unknown = UnknownFeatures::from([(
            "G".to_string(),
            std::collections::HashMap::from([("default".to_string(), true)]),
        )]);
        assert!(store.replace_unknown(&unknown));
        assert_eq!(store.list_unknown(), unknown);
        assert!(store.replace_unknown(&UnknownFeatures::new()));
        assert!(store.list_unknown().is_empty());
        // the snapshot key is independent of the registry key
        assert_eq!(store.list(), features);
    }
}
