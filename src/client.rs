//! Transport to the remote authority.
//!
//! [`Api`] is the seam the synchronizer and reporter talk through;
//! [`HttpClient`] is the production implementation over blocking reqwest.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use reqwest::header::{ACCEPT, AUTHORIZATION, ETAG, IF_NONE_MATCH};
use reqwest::{Method, StatusCode};
use serde::Serialize;
use tracing::{debug, error};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::features::FeatureSnapshot;
use crate::payload::{ApiRequestRecord, ReportPayload};

/// Entries kept in the rolling request log between two reports.
pub const MAX_API_REQUEST_LOG: usize = 25;

const FEATURES_PATH: &str = "/features";
const REPORT_TRANSACTIONS_PATH: &str = "/report/transactions";

/// Result of a successful features request.
#[derive(Debug, Clone, PartialEq)]
pub enum FeaturesResponse {
    /// The remote authority sent a new snapshot.
    Changed(FeatureSnapshot),
    /// The conditional request matched the last ETag we saw.
    NotModified,
}

/// Calls the remote authority makes available to the client. Implementations
/// must be thread-safe and enforce their own timeouts.
pub trait Api: Send + Sync {
    /// `GET /features?verbose=true`. With `etag_wait` the authority may hold
    /// the request open until something changes. With `cached` the last ETag
    /// seen for the path is sent as `If-None-Match`.
    fn get_features(&self, etag_wait: Option<Duration>, cached: bool) -> Result<FeaturesResponse>;

    /// `POST /report/transactions`.
    fn post_transactions(&self, payload: &ReportPayload) -> Result<()>;

    /// `PUT /feature/<feature>/<version>/enabled/percent`. Callers check
    /// that `percent` lies within `0.0..=100.0`.
    fn put_enabled_percent(&self, feature: &str, version: &str, percent: f64) -> Result<()>;

    /// Stable identifier of this client instance.
    fn client_uuid(&self) -> &str;

    /// Seconds the last features request took, if one completed.
    fn last_fetch_duration(&self) -> Option<f64>;

    /// Drains the rolling log of recent request outcomes.
    fn siphon_api_request_log(&self) -> Vec<ApiRequestRecord>;
}

/// Blocking HTTP client scoped to one application on the remote authority.
pub struct HttpClient {
    http: reqwest::blocking::Client,
    app_uri: String,
    secret: String,
    uuid: String,
    request_timeout: Duration,
    etags: Mutex<HashMap<String, String>>,
    last_fetch_duration: Mutex<Option<f64>>,
    api_request_log: Mutex<VecDeque<ApiRequestRecord>>,
}

impl HttpClient {
    pub fn new(config: &Config) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .user_agent(concat!("fluidfeatures-rust/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            app_uri: format!(
                "{}/app/{}",
                config.base_uri.trim_end_matches('/'),
                config.app_id
            ),
            secret: config.secret.clone(),
            uuid: uuid::Uuid::new_v4().to_string(),
            request_timeout: config.request_timeout(),
            etags: Mutex::new(HashMap::new()),
            last_fetch_duration: Mutex::new(None),
            api_request_log: Mutex::new(VecDeque::new()),
        })
    }

    /// Sends `payload` as JSON with `PUT` to `path` under the app URI.
    pub fn put<T: Serialize + ?Sized>(&self, path: &str, payload: &T) -> Result<()> {
        self.send_json(Method::PUT, path, payload)
    }

    fn send_json<T: Serialize + ?Sized>(&self, method: Method, path: &str, payload: &T) -> Result<()> {
        let started = Instant::now();
        let response = self
            .http
            .request(method.clone(), format!("{}{}", self.app_uri, path))
            .header(ACCEPT, "application/json")
            .header(AUTHORIZATION, &self.secret)
            .timeout(self.request_timeout)
            .json(payload)
            .send();
        let duration = started.elapsed().as_secs_f64();

        match response {
            Ok(r) if r.status().is_success() => {
                self.record(
                    method.as_str(),
                    path,
                    Some(r.status().as_u16()),
                    Some(duration),
                    None,
                );
                Ok(())
            }
            Ok(r) => Err(self.unsuccessful(method.as_str(), path, r, duration)),
            Err(e) => Err(self.failed(method.as_str(), path, e, duration)),
        }
    }

    fn record(
        &self,
        method: &str,
        path: &str,
        status: Option<u16>,
        duration: Option<f64>,
        error: Option<String>,
    ) {
        let mut log = self.api_request_log.lock();
        while log.len() >= MAX_API_REQUEST_LOG {
            log.pop_front();
        }
        log.push_back(ApiRequestRecord {
            method: method.to_string(),
            path: path.to_string(),
            status,
            duration,
            error,
            time: chrono::Utc::now().to_rfc3339(),
        });
    }

    /// Turns a non-success response into an error, logging it and pulling
    /// the message out of an `{"error": "..."}` body when there is one.
    fn unsuccessful(
        &self,
        method: &str,
        path: &str,
        response: reqwest::blocking::Response,
        duration: f64,
    ) -> Error {
        let status = response.status().as_u16();
        let message = response.text().ok().and_then(|body| error_message(&body));
        error!(
            "request unsuccessful for {} {}: {} {}",
            method,
            path,
            status,
            message.as_deref().unwrap_or("")
        );
        self.record(method, path, Some(status), Some(duration), message.clone());
        Error::Status {
            path: path.to_string(),
            status,
            message,
        }
    }

    fn failed(&self, method: &str, path: &str, e: reqwest::Error, duration: f64) -> Error {
        error!("request failed for {} {}: {}", method, path, e);
        self.record(method, path, None, Some(duration), Some(e.to_string()));
        Error::Http(e)
    }
}

impl Api for HttpClient {
    fn get_features(&self, etag_wait: Option<Duration>, cached: bool) -> Result<FeaturesResponse> {
        let mut query = vec![("verbose", "true".to_string())];
        if let Some(wait) = etag_wait {
            query.push(("etag_wait", wait.as_secs().to_string()));
        }

        let mut request = self
            .http
            .get(format!("{}{}", self.app_uri, FEATURES_PATH))
            .query(&query)
            .header(ACCEPT, "application/json")
            .header(AUTHORIZATION, &self.secret)
            .timeout(self.request_timeout + etag_wait.unwrap_or_default());
        if cached {
            if let Some(etag) = self.etags.lock().get(FEATURES_PATH) {
                request = request.header(IF_NONE_MATCH, etag);
            }
        }

        let started = Instant::now();
        let response = request.send();
        let duration = started.elapsed().as_secs_f64();
        let response = match response {
            Ok(r) => r,
            Err(e) => return Err(self.failed("GET", FEATURES_PATH, e, duration)),
        };

        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            *self.last_fetch_duration.lock() = Some(duration);
            self.record("GET", FEATURES_PATH, Some(status.as_u16()), Some(duration), None);
            debug!("features not modified");
            return Ok(FeaturesResponse::NotModified);
        }
        if !status.is_success() {
            return Err(self.unsuccessful("GET", FEATURES_PATH, response, duration));
        }

        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let body = match response.text() {
            Ok(body) => body,
            Err(e) => return Err(self.failed("GET", FEATURES_PATH, e, duration)),
        };
        *self.last_fetch_duration.lock() = Some(duration);

        let snapshot: FeatureSnapshot = match serde_json::from_str(&body) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!("unexpected response body for GET {}: {}", FEATURES_PATH, e);
                self.record(
                    "GET",
                    FEATURES_PATH,
                    Some(status.as_u16()),
                    Some(duration),
                    Some(e.to_string()),
                );
                return Err(Error::Protocol {
                    path: FEATURES_PATH.to_string(),
                    reason: e.to_string(),
                });
            }
        };
        self.record("GET", FEATURES_PATH, Some(status.as_u16()), Some(duration), None);

        if cached {
            if let Some(etag) = etag {
                self.etags.lock().insert(FEATURES_PATH.to_string(), etag);
            }
        }
        Ok(FeaturesResponse::Changed(snapshot))
    }

    fn post_transactions(&self, payload: &ReportPayload) -> Result<()> {
        self.send_json(Method::POST, REPORT_TRANSACTIONS_PATH, payload)
    }

    fn put_enabled_percent(&self, feature: &str, version: &str, percent: f64) -> Result<()> {
        let path = format!("/feature/{}/{}/enabled/percent", feature, version);
        self.put(&path, &serde_json::json!({ "enabled": { "percent": percent } }))
    }

    fn client_uuid(&self) -> &str {
        &self.uuid
    }

    fn last_fetch_duration(&self) -> Option<f64> {
        *self.last_fetch_duration.lock()
    }

    fn siphon_api_request_log(&self) -> Vec<ApiRequestRecord> {
        self.api_request_log.lock().drain(..).collect()
    }
}

fn error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    match value.get("error")? {
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
