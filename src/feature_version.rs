//! Remote control of a single feature version's rollout.

use crate::client::Api;
use crate::error::{Error, Result};
use crate::transaction::checked_name;

/// Handle on one version of one feature, used to change how much of the
/// user base sees it.
pub struct FeatureVersion<'a> {
    api: &'a dyn Api,
    feature_name: String,
    version_name: String,
}

impl<'a> FeatureVersion<'a> {
    /// `version_name` defaults to [`crate::DEFAULT_VERSION_NAME`]. Empty names
    /// are rejected.
    pub fn new(api: &'a dyn Api, feature_name: &str, version_name: Option<&str>) -> Result<Self> {
        if feature_name.is_empty() {
            return Err(Error::InvalidArgument("feature_name"));
        }
        let version_name = checked_name(version_name, "version_name")?;
        Ok(Self {
            api,
            feature_name: feature_name.to_string(),
            version_name: version_name.to_string(),
        })
    }

    pub fn feature_name(&self) -> &str {
        &self.feature_name
    }

    pub fn version_name(&self) -> &str {
        &self.version_name
    }

    /// Asks the remote authority to enable this version for `percent` of
    /// users. `percent` must lie within `0.0..=100.0`.
    pub fn set_enabled_percent(&self, percent: f64) -> Result<()> {
        if !(0.0..=100.0).contains(&percent) {
            return Err(Error::InvalidArgument("percent"));
        }
        self.api
            .put_enabled_percent(&self.feature_name, &self.version_name, percent)
    }
}
