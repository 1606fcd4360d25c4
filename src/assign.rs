//! Deterministic user-to-version assignment against a feature snapshot.
//!
//! Every user maps to one of `num_parts` numbered buckets of a feature. A
//! version is on for the user when that bucket is one of the version's
//! `parts`, unless an attribute override says otherwise.

use std::collections::HashMap;

use sha1::{Digest, Sha1};

use crate::error::{Error, Result};
use crate::features::{FeatureSnapshot, DEFAULT_VERSION_NAME};
use crate::payload::UserId;

/// Attribute key -> attribute id, as compared against a version's
/// `enabled.attributes`.
pub type Attributes = HashMap<String, String>;

/// Attribute key under which the user id itself is always checked.
pub const USER_ATTRIBUTE: &str = "user";

/// Returns whether `version_name` of `feature_name` is enabled for the user.
///
/// Features or versions missing from the snapshot are never enabled here;
/// applying a default for them is up to the caller.
///
/// Overrides are resolved by walking the feature's versions in name order and,
/// for each, the user's attributes. The first version carrying a matching
/// attribute value decides: `true` if it is the queried version, `false`
/// otherwise.
pub fn is_enabled(
    snapshot: &FeatureSnapshot,
    feature_name: &str,
    version_name: Option<&str>,
    user_id: &UserId,
    attributes: &Attributes,
) -> Result<bool> {
    if feature_name.is_empty() {
        return Err(Error::InvalidArgument("feature_name"));
    }
    let version_name = version_name.unwrap_or(DEFAULT_VERSION_NAME);
    if version_name.is_empty() {
        return Err(Error::InvalidArgument("version_name"));
    }

    let Some(feature) = snapshot.get(feature_name) else {
        return Ok(false);
    };
    let Some(version) = feature.versions.get(version_name) else {
        return Ok(false);
    };

    let enabled = bucket_for(user_id, feature.num_parts)
        .map(|bucket| version.parts.contains(&bucket))
        .unwrap_or(false);

    let user = user_id.to_string();
    for (other_name, other) in &feature.versions {
        let Some(version_attributes) = other.attributes() else {
            continue;
        };
        let user_attributes = attributes
            .iter()
            .filter(|(key, _)| key.as_str() != USER_ATTRIBUTE)
            .map(|(key, id)| (key.as_str(), id.as_str()))
            .chain(std::iter::once((USER_ATTRIBUTE, user.as_str())));
        for (key, id) in user_attributes {
            if version_attributes
                .get(key)
                .is_some_and(|ids| ids.contains(id))
            {
                return Ok(other_name == version_name);
            }
        }
    }

    Ok(enabled)
}

/// The 1-indexed bucket in `[1, num_parts]` the user falls into, computed as
/// `((hash - 1) mod num_parts) + 1` with floored modulo. `None` when the
/// feature has no parts at all.
pub fn bucket_for(user_id: &UserId, num_parts: u64) -> Option<u64> {
    if num_parts == 0 {
        return None;
    }
    let residue = user_hash_mod(user_id, num_parts) as u128;
    let n = num_parts as u128;
    Some(((residue + n - 1) % n + 1) as u64)
}

/// `hash(user_id) mod modulus`, where integer ids hash to themselves, digit
/// strings to their numeric value and anything else to the last 10 hex
/// digits of its SHA-1. Digit strings are reduced as they are read so ids of
/// any length work.
fn user_hash_mod(user_id: &UserId, modulus: u64) -> u64 {
    let m = modulus as u128;
    match user_id {
        UserId::Int(id) => (*id as i128).rem_euclid(m as i128) as u64,
        UserId::Str(id) if is_numeric(id) => id
            .bytes()
            .fold(0u128, |acc, digit| (acc * 10 + u128::from(digit - b'0')) % m)
            as u64,
        UserId::Str(id) => (sha1_tail(id) as u128 % m) as u64,
    }
}

fn is_numeric(id: &str) -> bool {
    !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit())
}

fn sha1_tail(id: &str) -> u64 {
    let mut hasher = Sha1::new();
    hasher.update(id.as_bytes());
    let hex = format!("{:x}", hasher.finalize());
    // 40 hex chars, so the last 10 always exist and fit in 40 bits.
    u64::from_str_radix(&hex[hex.len() - 10..], 16).unwrap_or(0)
}
