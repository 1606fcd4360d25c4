//! Keeps the [`FeatureCache`] in step with the remote authority by
//! long-polling for feature state in a background loop.

use std::sync::{Arc, Once};
use std::time::Duration;

use tracing::{error, warn};

use crate::assign::{self, Attributes};
use crate::cache::FeatureCache;
use crate::client::{Api, FeaturesResponse};
use crate::error::Result;
use crate::features::FeatureSnapshot;
use crate::payload::UserId;
use crate::polling::PollingLoop;

/// Minimum pause between two features requests, capping them at 2/sec.
pub const WAIT_BETWEEN_FETCH_SUCCESS: Duration = Duration::from_millis(500);
/// Extra pause after a failed request.
pub const WAIT_BETWEEN_FETCH_FAILURES: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// A new snapshot was published.
    Updated,
    /// The remote authority had nothing new.
    NoChange,
    /// The request failed; the snapshot is untouched.
    Failed,
}

/// How long the loop waits after an iteration with `outcome`.
pub fn pause_after_fetch(outcome: FetchOutcome) -> Duration {
    match outcome {
        FetchOutcome::Updated | FetchOutcome::NoChange => WAIT_BETWEEN_FETCH_SUCCESS,
        FetchOutcome::Failed => WAIT_BETWEEN_FETCH_SUCCESS + WAIT_BETWEEN_FETCH_FAILURES,
    }
}

struct Fetcher {
    api: Arc<dyn Api>,
    cache: Arc<FeatureCache>,
    etag_wait: Duration,
}

impl Fetcher {
    fn load_state(&self) -> FetchOutcome {
        match self.api.get_features(Some(self.etag_wait), true) {
            Ok(FeaturesResponse::Changed(snapshot)) => {
                if self.cache.replace(snapshot) {
                    FetchOutcome::Updated
                } else {
                    FetchOutcome::NoChange
                }
            }
            Ok(FeaturesResponse::NotModified) => FetchOutcome::NoChange,
            Err(e) => {
                error!("failed to load feature state: {}", e);
                FetchOutcome::Failed
            }
        }
    }
}

/// Background synchronizer for one [`FeatureCache`].
pub struct StateSync {
    fetcher: Arc<Fetcher>,
    poller: PollingLoop,
    cold_start: Once,
}

impl StateSync {
    /// `etag_wait` is the long-poll hint sent with every conditional request.
    pub fn new(api: Arc<dyn Api>, cache: Arc<FeatureCache>, etag_wait: Duration) -> Self {
        Self {
            fetcher: Arc::new(Fetcher {
                api,
                cache,
                etag_wait,
            }),
            poller: PollingLoop::new("state"),
            cold_start: Once::new(),
        }
    }

    /// Starts the background loop. Does nothing if it is already running.
    pub fn start(&self) -> bool {
        let fetcher = Arc::clone(&self.fetcher);
        self.poller
            .start(pause_after_fetch(FetchOutcome::Failed), move || {
                pause_after_fetch(fetcher.load_state())
            })
    }

    pub fn stop(&self, wait: bool) {
        self.poller.stop(wait);
    }

    pub fn is_running(&self) -> bool {
        self.poller.is_running()
    }

    /// Runs a single conditional fetch, exactly as one loop iteration does.
    pub fn load_state(&self) -> FetchOutcome {
        self.fetcher.load_state()
    }

    pub fn cache(&self) -> &Arc<FeatureCache> {
        &self.fetcher.cache
    }

    /// The current snapshot.
    ///
    /// The first call fills an empty cache, from the persisted snapshot if
    /// there is one, otherwise with one blocking, unconditional fetch. It
    /// then starts the background loop. Concurrent first callers wait for
    /// that to finish; later calls never block on I/O.
    pub fn features(&self) -> Arc<FeatureSnapshot> {
        self.cold_start.call_once(|| {
            let cache = &self.fetcher.cache;
            if cache.is_empty() && !cache.load_persisted() {
                match self.fetcher.api.get_features(None, false) {
                    Ok(FeaturesResponse::Changed(snapshot)) => {
                        cache.replace(snapshot);
                    }
                    Ok(FeaturesResponse::NotModified) => {}
                    Err(e) => warn!("initial feature state load failed: {}", e),
                }
            }
            self.start();
        });
        self.fetcher.cache.read()
    }

    /// Whether the version of the feature is enabled for the user, decided
    /// against the current snapshot. See [`assign::is_enabled`].
    pub fn feature_version_enabled_for_user(
        &self,
        feature_name: &str,
        version_name: Option<&str>,
        user_id: &UserId,
        attributes: &Attributes,
    ) -> Result<bool> {
        assign::is_enabled(
            &self.features(),
            feature_name,
            version_name,
            user_id,
            attributes,
        )
    }
}
