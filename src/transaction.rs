//! A unit of work, usually one request, that evaluates features against a
//! fixed snapshot and reports what it saw when it ends.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::app::User;
use crate::assign::{self, Attributes};
use crate::error::{Error, Result};
use crate::features::{FeatureSnapshot, UnknownFeatures, DEFAULT_VERSION_NAME};
use crate::payload::{Hit, HitMap, Hits, TransactionPayload, TransactionStats};
use crate::reporter::Reporter;

pub struct Transaction<'a> {
    reporter: &'a Reporter,
    features: Arc<FeatureSnapshot>,
    user: User,
    attributes: Attributes,
    url: String,
    features_hit: HitMap,
    goals_hit: HitMap,
    unknown_features: UnknownFeatures,
    started: Instant,
    ended: Option<Duration>,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(
        reporter: &'a Reporter,
        features: Arc<FeatureSnapshot>,
        user: User,
        url: String,
    ) -> Self {
        let attributes = user.attributes();
        Self {
            reporter,
            features,
            user,
            attributes,
            url,
            features_hit: HitMap::new(),
            goals_hit: HitMap::new(),
            unknown_features: UnknownFeatures::new(),
            started: Instant::now(),
            ended: None,
        }
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// The snapshot this transaction evaluates against, taken when it opened.
    pub fn features(&self) -> &FeatureSnapshot {
        &self.features
    }

    /// Whether `version` (or the default version) of `feature` is on for the
    /// user. A feature the snapshot does not know yet evaluates to
    /// `default_enabled` and is reported so it can be registered.
    pub fn feature_enabled(
        &mut self,
        feature_name: &str,
        version_name: Option<&str>,
        default_enabled: bool,
    ) -> Result<bool> {
        self.ensure_open()?;
        let version_name = checked_name(version_name, "version_name")?;
        if feature_name.is_empty() {
            return Err(Error::InvalidArgument("feature_name"));
        }

        let known = self
            .features
            .get(feature_name)
            .is_some_and(|f| f.versions.contains_key(version_name));
        let enabled = if known {
            assign::is_enabled(
                &self.features,
                feature_name,
                Some(version_name),
                self.user.unique_id(),
                &self.attributes,
            )?
        } else {
            debug!("unknown feature {}/{}", feature_name, version_name);
            self.unknown_features
                .entry(feature_name.to_string())
                .or_default()
                .entry(version_name.to_string())
                .or_insert(default_enabled);
            default_enabled
        };

        if enabled {
            record_hit(&mut self.features_hit, feature_name, version_name);
        }
        Ok(enabled)
    }

    /// Records that the user reached `goal_name`.
    pub fn goal_hit(&mut self, goal_name: &str, goal_version_name: Option<&str>) -> Result<()> {
        self.ensure_open()?;
        if goal_name.is_empty() {
            return Err(Error::InvalidArgument("goal_name"));
        }
        let goal_version_name = checked_name(goal_version_name, "goal_version_name")?;
        record_hit(&mut self.goals_hit, goal_name, goal_version_name);
        Ok(())
    }

    /// Time since the transaction opened, frozen once it has ended.
    pub fn duration(&self) -> Duration {
        self.ended.unwrap_or_else(|| self.started.elapsed())
    }

    pub fn is_ended(&self) -> bool {
        self.ended.is_some()
    }

    /// Hands everything recorded to the reporter. Fails if the transaction
    /// has already ended.
    pub fn end_transaction(&mut self) -> Result<()> {
        self.ensure_open()?;
        let duration = self.started.elapsed();
        self.ended = Some(duration);

        let payload = TransactionPayload {
            url: self.url.clone(),
            user: self.user.payload_user(),
            hits: Hits {
                feature: std::mem::take(&mut self.features_hit),
                goal: std::mem::take(&mut self.goals_hit),
            },
            stats: TransactionStats {
                duration: duration.as_secs_f64(),
            },
        };
        let unknown_features = std::mem::take(&mut self.unknown_features);
        self.reporter.report_transaction(payload, &unknown_features);
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.ended.is_some() {
            return Err(Error::TransactionEnded);
        }
        Ok(())
    }
}

pub(crate) fn checked_name<'n>(name: Option<&'n str>, what: &'static str) -> Result<&'n str> {
    match name {
        None => Ok(DEFAULT_VERSION_NAME),
        Some("") => Err(Error::InvalidArgument(what)),
        Some(name) => Ok(name),
    }
}

fn record_hit(hits: &mut HitMap, name: &str, version_name: &str) {
    hits.entry(name.to_string())
        .or_insert_with(BTreeMap::new)
        .insert(version_name.to_string(), Hit {});
}
