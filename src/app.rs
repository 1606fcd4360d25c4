use std::sync::Arc;

use serde_json::{Map, Value};

use crate::assign::Attributes;
use crate::cache::FeatureCache;
use crate::client::{Api, HttpClient};
use crate::config::Config;
use crate::error::Result;
use crate::feature_version::FeatureVersion;
use crate::features::FeatureSnapshot;
use crate::payload::{PayloadUser, UserId};
use crate::reporter::Reporter;
use crate::state::StateSync;
use crate::store;
use crate::transaction::Transaction;

/// Attribute every user carries, `"true"` or `"false"`.
pub const ANONYMOUS_ATTRIBUTE: &str = "anonymous";

/// One application registered with the remote authority. Owns the feature
/// cache and both background loops; dropping it stops them.
pub struct App {
    config: Config,
    api: Arc<dyn Api>,
    state: StateSync,
    reporter: Reporter,
}

impl App {
    /// Connects to the remote authority over HTTP.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let api = Arc::new(HttpClient::new(&config)?);
        Ok(Self::with_api(config, api))
    }

    /// Builds an app around any [`Api`] implementation. Nothing touches the
    /// network until the first transaction.
    pub fn with_api(config: Config, api: Arc<dyn Api>) -> Self {
        let cache = Arc::new(FeatureCache::new(store::features(config.cache.as_ref())));
        let state = StateSync::new(Arc::clone(&api), Arc::clone(&cache), config.etag_wait());
        let reporter = Reporter::new(
            Arc::clone(&api),
            cache,
            store::buckets(config.cache.as_ref()),
        );
        Self {
            config,
            api,
            state,
            reporter,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn api(&self) -> &Arc<dyn Api> {
        &self.api
    }

    pub fn state(&self) -> &StateSync {
        &self.state
    }

    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    /// Every feature the remote authority knows about for this application.
    pub fn features(&self) -> Arc<FeatureSnapshot> {
        self.state.features()
    }

    /// Opens a transaction for `user`, scoped to one unit of work at `url`.
    pub fn transaction(&self, user: &User, url: impl Into<String>) -> Transaction<'_> {
        Transaction::new(&self.reporter, self.state.features(), user.clone(), url.into())
    }

    /// Handle for changing the rollout of one version of `feature`;
    /// `version` defaults to [`crate::DEFAULT_VERSION_NAME`].
    pub fn feature_version(&self, feature: &str, version: Option<&str>) -> Result<FeatureVersion<'_>> {
        FeatureVersion::new(self.api.as_ref(), feature, version)
    }

    /// Stops both background loops. They restart on demand.
    pub fn stop(&self, wait: bool) {
        self.state.stop(wait);
        self.reporter.stop(wait);
    }
}

/// A user as the application describes it.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    unique_id: UserId,
    display_name: Option<String>,
    anonymous: bool,
    unique_attrs: Option<Map<String, Value>>,
    cohort_attrs: Option<Map<String, Value>>,
}

impl User {
    pub fn new(unique_id: impl Into<UserId>) -> Self {
        Self {
            unique_id: unique_id.into(),
            display_name: None,
            anonymous: false,
            unique_attrs: None,
            cohort_attrs: None,
        }
    }

    /// An anonymous user. Without an id one is generated, so the same
    /// visitor should be given back the id it was first assigned.
    pub fn anonymous(unique_id: Option<UserId>) -> Self {
        let unique_id =
            unique_id.unwrap_or_else(|| UserId::Str(format!("anon-{}", uuid::Uuid::new_v4())));
        Self {
            anonymous: true,
            ..Self::new(unique_id)
        }
    }

    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Adds an attribute unique to this user, such as an email address.
    pub fn unique_attr(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.unique_attrs
            .get_or_insert_with(Map::new)
            .insert(key.into(), value.into());
        self
    }

    /// Adds an attribute shared with a cohort of users. An object value is
    /// matched on its `id` field.
    pub fn cohort_attr(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.cohort_attrs
            .get_or_insert_with(Map::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn unique_id(&self) -> &UserId {
        &self.unique_id
    }

    pub fn is_anonymous(&self) -> bool {
        self.anonymous
    }

    /// Attribute values matched against version overrides, all as strings.
    pub fn attributes(&self) -> Attributes {
        let mut attributes = Attributes::new();
        attributes.insert(ANONYMOUS_ATTRIBUTE.to_string(), self.anonymous.to_string());
        for attrs in [&self.unique_attrs, &self.cohort_attrs].into_iter().flatten() {
            for (key, value) in attrs {
                let id = match value {
                    Value::Object(object) => match object.get("id") {
                        Some(id) => id,
                        None => continue,
                    },
                    other => other,
                };
                attributes.insert(key.clone(), attribute_string(id));
            }
        }
        attributes
    }

    pub(crate) fn payload_user(&self) -> PayloadUser {
        PayloadUser {
            id: self.unique_id.clone(),
            name: self.display_name.clone(),
            anonymous: self.anonymous.then_some(true),
            unique: self.unique_attrs.clone(),
            cohorts: self.cohort_attrs.clone(),
        }
    }
}

fn attribute_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_anonymous_user_gets_an_id() {
        let user = User::anonymous(None);
        assert!(user.is_anonymous());
        match user.unique_id() {
            UserId::Str(id) => assert!(id.starts_with("anon-")),
            other => panic!("unexpected id {:?}", other),
        }
        assert_ne!(User::anonymous(None).unique_id(), user.unique_id());

        let known = User::anonymous(Some("anon-1".into()));
        assert_eq!(known.unique_id(), &UserId::from("anon-1"));
    }

    #[test]
    fn test_attributes_are_normalized() {
        let user = User::new(42)
            .unique_attr("email", "a@example.com")
            .unique_attr("beta", true)
            .cohort_attr("company", json!({"id": 17, "name": "Acme"}))
            .cohort_attr("team", json!({"name": "no id"}))
            .cohort_attr("level", 3);
        let attributes = user.attributes();
        assert_eq!(attributes["anonymous"], "false");
        assert_eq!(attributes["email"], "a@example.com");
        assert_eq!(attributes["beta"], "true");
        assert_eq!(attributes["company"], "17");
        assert_eq!(attributes["level"], "3");
        assert!(!attributes.contains_key("team"));
    }

    #[test]
    fn test_payload_user_skips_unset_fields() {
        let user = User::new("bob").display_name("Bob");
        let value = serde_json::to_value(user.payload_user()).unwrap();
        assert_eq!(value, json!({"id": "bob", "name": "Bob"}));

        let anon = User::anonymous(Some(UserId::Int(5)));
        let value = serde_json::to_value(anon.payload_user()).unwrap();
        assert_eq!(value, json!({"id": 5, "anonymous": true}));
    }
}
