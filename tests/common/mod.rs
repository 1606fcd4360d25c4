#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use fluidfeatures::client::{Api, FeaturesResponse};
use fluidfeatures::payload::{ApiRequestRecord, ReportPayload};
use fluidfeatures::{Error, FeatureSnapshot, Result};
use parking_lot::Mutex;

/// Scripted stand-in for the remote authority.
///
/// Features requests pop scripted responses in order and answer
/// `NotModified` once the script runs out. Reports are recorded, or refused
/// while `fail_posts` is set.
#[derive(Default)]
pub struct FakeApi {
    pub feature_responses: Mutex<VecDeque<Result<FeaturesResponse>>>,
    pub feature_calls: Mutex<Vec<(Option<Duration>, bool)>>,
    pub posts: Mutex<Vec<ReportPayload>>,
    pub post_attempts: AtomicUsize,
    pub fail_posts: AtomicBool,
    pub post_delay: Mutex<Option<Duration>>,
    pub enabled_percents: Mutex<Vec<(String, String, f64)>>,
    pub request_log: Mutex<Vec<ApiRequestRecord>>,
}

impl FakeApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_features(&self, json: &str) {
        let snapshot: FeatureSnapshot = serde_json::from_str(json).unwrap();
        self.feature_responses
            .lock()
            .push_back(Ok(FeaturesResponse::Changed(snapshot)));
    }

    pub fn push_failure(&self) {
        self.feature_responses.lock().push_back(Err(unreachable()));
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_posts.store(failing, Ordering::SeqCst);
    }

    /// Makes every report take `delay` before it is answered.
    pub fn set_post_delay(&self, delay: Duration) {
        *self.post_delay.lock() = Some(delay);
    }

    pub fn posts(&self) -> Vec<ReportPayload> {
        self.posts.lock().clone()
    }

    pub fn feature_calls(&self) -> Vec<(Option<Duration>, bool)> {
        self.feature_calls.lock().clone()
    }
}

impl Api for FakeApi {
    fn get_features(&self, etag_wait: Option<Duration>, cached: bool) -> Result<FeaturesResponse> {
        self.feature_calls.lock().push((etag_wait, cached));
        self.feature_responses
            .lock()
            .pop_front()
            .unwrap_or(Ok(FeaturesResponse::NotModified))
    }

    fn post_transactions(&self, payload: &ReportPayload) -> Result<()> {
        self.post_attempts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.post_delay.lock();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        if self.fail_posts.load(Ordering::SeqCst) {
            return Err(unreachable());
        }
        self.posts.lock().push(payload.clone());
        Ok(())
    }

    fn put_enabled_percent(&self, feature: &str, version: &str, percent: f64) -> Result<()> {
        self.enabled_percents
            .lock()
            .push((feature.to_string(), version.to_string(), percent));
        Ok(())
    }

    fn client_uuid(&self) -> &str {
        "3f6c9a52-6c5e-4a55-9a3b-5d8c1f2e7b10"
    }

    fn last_fetch_duration(&self) -> Option<f64> {
        Some(0.25)
    }

    fn siphon_api_request_log(&self) -> Vec<ApiRequestRecord> {
        std::mem::take(&mut *self.request_log.lock())
    }
}

fn unreachable() -> Error {
    Error::Status {
        path: "/fake".to_string(),
        status: 503,
        message: Some("unavailable".to_string()),
    }
}

/// Polls `condition` until it holds or `timeout` passes.
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}
