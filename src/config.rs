use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::{Error, Result};

/// Long-poll hint sent to the remote authority in normal operation.
pub const ETAG_WAIT: Duration = Duration::from_secs(30);
/// Long-poll hint used in dev mode so flag edits show up quickly.
pub const DEV_ETAG_WAIT: Duration = Duration::from_secs(5);
/// Backlog ceiling used when only a cache dir is given.
pub const DEFAULT_CACHE_LIMIT: u64 = 2 * 1024 * 1024;

/// Client configuration.
///
/// A config file holds a `[common]` table and one table per environment;
/// the environment table is laid over `common` key by key:
///
/// ```toml
/// [common]
/// base_uri = "https://www.fluidfeatures.com/service"
/// cache = { enable = true, dir = "tmp/fluidfeatures", limit = "2mb" }
///
/// [production]
/// app_id = "1vu33ki6emqe3"
/// secret = "sssseeecrrreeetttt"
/// ```
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Config {
    pub base_uri: String,
    pub app_id: String,
    pub secret: String,
    #[serde(default)]
    pub cache: Option<CacheConfig>,
    /// Shortens the long-poll wait to [`DEV_ETAG_WAIT`].
    #[serde(default)]
    pub dev: bool,
    /// Transport timeout added on top of the long-poll wait.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct CacheConfig {
    #[serde(default)]
    pub enable: bool,
    pub dir: PathBuf,
    /// Size ceiling in bytes for the bucket backlog. Accepts `1024`, `"1024"`
    /// or strings such as `"2mb"`.
    #[serde(default, deserialize_with = "file_size")]
    pub limit: u64,
}

fn default_request_timeout_secs() -> u64 {
    10
}

impl Config {
    pub fn new(base_uri: &str, app_id: &str, secret: &str) -> Self {
        Self {
            base_uri: base_uri.to_string(),
            app_id: app_id.to_string(),
            secret: secret.to_string(),
            cache: None,
            dev: false,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }

    /// Load the `environment` section of a TOML config file, merged over its
    /// `common` section.
    pub fn load(path: impl AsRef<Path>, environment: &str) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| Error::ConfigFile {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content, environment)
    }

    pub fn from_toml_str(content: &str, environment: &str) -> Result<Self> {
        let mut environments: toml::Table = toml::from_str(content)?;
        let mut vars = match environments.remove("common") {
            Some(toml::Value::Table(common)) => common,
            Some(_) => return Err(Error::Config("[common] must be a table".to_string())),
            None => toml::Table::new(),
        };
        match environments.remove(environment) {
            Some(toml::Value::Table(overrides)) => vars.extend(overrides),
            Some(_) => {
                return Err(Error::Config(format!(
                    "[{}] must be a table",
                    environment
                )))
            }
            None => {}
        }
        let config: Config = toml::Value::Table(vars).try_into()?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("FLUIDFEATURES_BASE_URI") {
            self.base_uri = val;
        }
        if let Ok(val) = env::var("FLUIDFEATURES_APP_ID") {
            self.app_id = val;
        }
        if let Ok(val) = env::var("FLUIDFEATURES_SECRET") {
            self.secret = val;
        }
        if let Ok(val) = env::var("FLUIDFEATURES_CACHE_DIR") {
            match self.cache {
                Some(ref mut cache) => cache.dir = PathBuf::from(val),
                None => {
                    self.cache = Some(CacheConfig {
                        enable: true,
                        dir: PathBuf::from(val),
                        limit: DEFAULT_CACHE_LIMIT,
                    })
                }
            }
        }
        if let Ok(val) = env::var("FLUIDFEATURES_DEV") {
            self.dev = matches!(val.to_lowercase().as_str(), "1" | "true" | "yes");
        }
    }

    pub fn etag_wait(&self) -> Duration {
        if self.dev {
            DEV_ETAG_WAIT
        } else {
            ETAG_WAIT
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Checks that the credentials needed to reach the remote authority are set.
    pub fn validate(&self) -> Result<()> {
        if self.base_uri.is_empty() {
            return Err(Error::Config("base_uri is required".to_string()));
        }
        if self.app_id.is_empty() {
            return Err(Error::Config("app_id is required".to_string()));
        }
        if self.secret.is_empty() {
            return Err(Error::Config("secret is required".to_string()));
        }
        Ok(())
    }
}

/// Parses a human file size: a plain byte count, or digits followed by
/// `kb`, `mb` or `gb` in any case.
pub fn parse_file_size(size: &str) -> Result<u64> {
    let size = size.trim();
    if !size.is_empty() && size.bytes().all(|b| b.is_ascii_digit()) {
        return size
            .parse()
            .map_err(|_| Error::Config(format!("file size out of range: '{}'", size)));
    }
    let invalid = || Error::Config(format!("invalid file size: '{}'", size));
    let lower = size.to_ascii_lowercase();
    let number = lower.strip_suffix('b').ok_or_else(invalid)?;
    let (digits, exponent) = match number.char_indices().last() {
        Some((i, 'k')) => (&number[..i], 1),
        Some((i, 'm')) => (&number[..i], 2),
        Some((i, 'g')) => (&number[..i], 3),
        _ => return Err(invalid()),
    };
    let digits = digits.trim_end();
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let value: u64 = digits.parse().map_err(|_| invalid())?;
    value.checked_mul(1024u64.pow(exponent)).ok_or_else(invalid)
}

fn file_size<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Size {
        Bytes(u64),
        Text(String),
    }

    match Size::deserialize(deserializer)? {
        Size::Bytes(n) => Ok(n),
        Size::Text(s) => parse_file_size(&s).map_err(serde::de::Error::custom),
    }
}
