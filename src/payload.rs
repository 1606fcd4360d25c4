//! Wire structs for the reporting endpoint and the persisted bucket backlog.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::features::UnknownFeatures;

/// A user identifier as the application knows it. Integer ids take part in
/// bucketing directly, string ids are hashed unless they are all digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserId {
    Int(i64),
    Str(String),
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserId::Int(id) => write!(f, "{}", id),
            UserId::Str(id) => f.write_str(id),
        }
    }
}

impl From<i64> for UserId {
    fn from(id: i64) -> Self {
        UserId::Int(id)
    }
}

impl From<i32> for UserId {
    fn from(id: i32) -> Self {
        UserId::Int(i64::from(id))
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        UserId::Str(id.to_string())
    }
}

impl From<String> for UserId {
    fn from(id: String) -> Self {
        UserId::Str(id)
    }
}

/// Empty marker recorded for every feature or goal version that was hit.
/// Serializes as `{}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hit {}

/// Name -> version -> hit marker.
pub type HitMap = BTreeMap<String, BTreeMap<String, Hit>>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Hits {
    pub feature: HitMap,
    pub goal: HitMap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadUser {
    pub id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anonymous: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cohorts: Option<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionStats {
    /// Seconds between opening and ending the transaction.
    pub duration: f64,
}

/// One finished unit of work, as queued by the reporter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionPayload {
    pub url: String,
    pub user: PayloadUser,
    pub hits: Hits,
    pub stats: TransactionStats,
}

/// A bounded batch of transactions awaiting delivery.
pub type Bucket = Vec<TransactionPayload>;

/// Outcome of one call to the remote authority, kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiRequestRecord {
    pub method: String,
    pub path: String,
    pub status: Option<u16>,
    /// Seconds, absent when the request never got a response.
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub time: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReportStats {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ff_latency: Option<f64>,
    /// Sizes of the buckets still queued after this one.
    pub waiting_buckets: Vec<usize>,
}

/// Body of `POST /report/transactions`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportPayload {
    pub client_uuid: String,
    pub transactions: Bucket,
    pub stats: ReportStats,
    pub unknown_features: UnknownFeatures,
    pub api_request_log: Vec<ApiRequestRecord>,
}
