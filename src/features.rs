use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// Version name used when the caller does not name one.
pub const DEFAULT_VERSION_NAME: &str = "default";

/// Last-known rollout state, keyed by feature name. Published whole and never
/// mutated afterwards.
pub type FeatureSnapshot = HashMap<String, Feature>;

/// Feature name -> version name -> default-enabled flag, for features the
/// remote authority has not told us about yet.
pub type UnknownFeatures = HashMap<String, HashMap<String, bool>>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    #[serde(default)]
    pub num_parts: u64,
    #[serde(default)]
    pub versions: BTreeMap<String, Version>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Version {
    /// Rollout buckets this version is enabled for. Values above the owning
    /// feature's `num_parts` are kept as sent; they can never match.
    #[serde(default, deserialize_with = "parts_from_list")]
    pub parts: HashSet<u64>,
    #[serde(default)]
    pub enabled: Option<EnabledFor>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnabledFor {
    /// Attribute key -> values that force this version on.
    #[serde(default)]
    pub attributes: BTreeMap<String, HashSet<String>>,
}

impl Version {
    pub fn attributes(&self) -> Option<&BTreeMap<String, HashSet<String>>> {
        self.enabled.as_ref().map(|e| &e.attributes)
    }
}

// The remote authority sends `parts` as a plain list, occasionally `null`.
fn parts_from_list<'de, D>(deserializer: D) -> Result<HashSet<u64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let parts: Option<Vec<u64>> = Option::deserialize(deserializer)?;
    Ok(parts.unwrap_or_default().into_iter().collect())
}

/// Records `default_enabled` for every pair in `incoming` that `into` has not
/// seen yet. An existing default is never overwritten.
pub fn merge_unknown(into: &mut UnknownFeatures, incoming: &UnknownFeatures) {
    for (feature_name, versions) in incoming {
        let known = into.entry(feature_name.clone()).or_default();
        for (version_name, default_enabled) in versions {
            known
                .entry(version_name.clone())
                .or_insert(*default_enabled);
        }
    }
}
