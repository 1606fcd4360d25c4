use std::path::PathBuf;
use std::sync::Arc;

use crate::app::App;
use crate::client::Api;
use crate::config::{CacheConfig, Config};
use crate::error::Result;

pub struct AppBuilder {
    config_file: Option<(PathBuf, String)>,
    base_uri: Option<String>,
    app_id: Option<String>,
    secret: Option<String>,
    cache: Option<CacheConfig>,
    dev: Option<bool>,
    env_overrides: bool,
    api: Option<Arc<dyn Api>>,
}

pub fn create_builder() -> AppBuilder {
    AppBuilder {
        config_file: None,
        base_uri: None,
        app_id: None,
        secret: None,
        cache: None,
        dev: None,
        env_overrides: true,
        api: None,
    }
}

impl AppBuilder {
    /// Starts from the `environment` section of a TOML config file. Values
    /// set on the builder win over the file.
    pub fn config_file(mut self, path: impl Into<PathBuf>, environment: &str) -> Self {
        self.config_file = Some((path.into(), environment.to_string()));
        self
    }

    pub fn base_uri(mut self, uri: &str) -> Self {
        self.base_uri = Some(uri.to_string());
        self
    }

    pub fn app_id(mut self, app_id: &str) -> Self {
        self.app_id = Some(app_id.to_string());
        self
    }

    pub fn secret(mut self, secret: &str) -> Self {
        self.secret = Some(secret.to_string());
        self
    }

    /// Persists feature state and the reporting backlog under `dir`, keeping
    /// the backlog under `limit` bytes.
    pub fn cache(mut self, dir: impl Into<PathBuf>, limit: u64) -> Self {
        self.cache = Some(CacheConfig {
            enable: true,
            dir: dir.into(),
            limit,
        });
        self
    }

    pub fn dev(mut self, dev: bool) -> Self {
        self.dev = Some(dev);
        self
    }

    /// Whether `FLUIDFEATURES_*` environment variables are applied. On by
    /// default.
    pub fn env_overrides(mut self, enabled: bool) -> Self {
        self.env_overrides = enabled;
        self
    }

    /// Talks to the remote authority through `api` instead of HTTP.
    pub fn api(mut self, api: Arc<dyn Api>) -> Self {
        self.api = Some(api);
        self
    }

    /// The config the builder would build with: file, then environment, then
    /// builder values.
    pub fn config(&self) -> Result<Config> {
        let mut config = match &self.config_file {
            Some((path, environment)) => Config::load(path, environment)?,
            None => Config::new("", "", ""),
        };
        if self.env_overrides {
            config.apply_env_overrides();
        }
        if let Some(base_uri) = &self.base_uri {
            config.base_uri = base_uri.clone();
        }
        if let Some(app_id) = &self.app_id {
            config.app_id = app_id.clone();
        }
        if let Some(secret) = &self.secret {
            config.secret = secret.clone();
        }
        if let Some(cache) = &self.cache {
            config.cache = Some(cache.clone());
        }
        if let Some(dev) = self.dev {
            config.dev = dev;
        }
        Ok(config)
    }

    pub fn build(self) -> Result<App> {
        let config = self.config()?;
        match self.api {
            Some(api) => {
                config.validate()?;
                Ok(App::with_api(config, api))
            }
            None => App::new(config),
        }
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        create_builder()
    }
}
