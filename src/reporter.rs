//! Buffers finished transactions in bounded buckets and delivers them to the
//! remote authority from a background loop.
//!
//! Producers only ever touch the current bucket. Once it is full it is sealed
//! into the queue, and when the queue outgrows [`MAX_BUCKETS`] its oldest
//! bucket moves to the [`BucketStore`]. Transactions are dropped only when
//! the store refuses them too, and every drop is logged.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{error, warn};

use crate::cache::FeatureCache;
use crate::client::Api;
use crate::features::UnknownFeatures;
use crate::payload::{Bucket, ReportPayload, ReportStats, TransactionPayload};
use crate::polling::PollingLoop;
use crate::store::BucketStore;

/// Sealed buckets kept in memory before the oldest is offloaded.
pub const MAX_BUCKETS: usize = 10;
/// Transactions per bucket.
pub const MAX_BUCKET_SIZE: usize = 100;

/// Pause while there is nothing to send.
pub const WAIT_BETWEEN_QUEUE_EMPTY_CHECKS: Duration = Duration::from_millis(500);
/// Soft max of 1 req/sec while the backlog is drained.
pub const WAIT_BETWEEN_SEND_SUCCESS_NONE_WAITING: Duration = Duration::from_secs(1);
/// Hard max of 10 req/sec while more buckets are waiting.
pub const WAIT_BETWEEN_SEND_SUCCESS_NEXT_WAITING: Duration = Duration::from_millis(100);
/// Pause after the remote authority could not be reached.
pub const WAIT_BETWEEN_SEND_FAILURES: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Nothing was queued.
    Idle,
    /// A bucket was delivered; `remaining` buckets are still waiting.
    Sent { remaining: usize },
    /// Delivery failed and the bucket was put back.
    Failed,
}

/// How long the loop waits after an iteration with `outcome`.
pub fn pause_after_send(outcome: SendOutcome) -> Duration {
    match outcome {
        SendOutcome::Idle => WAIT_BETWEEN_QUEUE_EMPTY_CHECKS,
        SendOutcome::Sent { remaining } if remaining <= 1 => WAIT_BETWEEN_SEND_SUCCESS_NONE_WAITING,
        SendOutcome::Sent { .. } => WAIT_BETWEEN_SEND_SUCCESS_NEXT_WAITING,
        SendOutcome::Failed => WAIT_BETWEEN_SEND_FAILURES,
    }
}

struct Queue {
    api: Arc<dyn Api>,
    cache: Arc<FeatureCache>,
    store: Arc<dyn BucketStore>,
    buckets: Mutex<VecDeque<Bucket>>,
    current: Mutex<Bucket>,
}

impl Queue {
    fn queue_transaction_payload(&self, payload: TransactionPayload) {
        let sealed = {
            let mut current = self.current.lock();
            let sealed = if current.len() >= MAX_BUCKET_SIZE {
                Some(std::mem::replace(
                    &mut *current,
                    Vec::with_capacity(MAX_BUCKET_SIZE),
                ))
            } else {
                None
            };
            current.push(payload);
            sealed
        };
        if let Some(bucket) = sealed {
            self.seal(bucket);
        }
    }

    fn seal(&self, bucket: Bucket) {
        let overflow = {
            let mut buckets = self.buckets.lock();
            buckets.push_back(bucket);
            if buckets.len() > MAX_BUCKETS {
                buckets.pop_front()
            } else {
                None
            }
        };
        if let Some(oldest) = overflow {
            self.offload(oldest);
        }
    }

    /// Moves a bucket to the store, dropping it if the store refuses.
    fn offload(&self, bucket: Bucket) -> bool {
        if self.store.append_one(&bucket) {
            return true;
        }
        warn!(
            "Discarded {} transactions due to reporter backlog. These will not be reported.",
            bucket.len()
        );
        false
    }

    fn transactions_queued(&self) -> bool {
        if !self.buckets.lock().is_empty() {
            return true;
        }
        if !self.current.lock().is_empty() {
            return true;
        }
        !self.store.is_empty()
    }

    /// Takes the oldest bucket: a sealed one, else one restored from the
    /// store, else whatever the current bucket holds.
    fn remove_bucket(&self) -> Option<Bucket> {
        if self.buckets.lock().is_empty() && !self.store.is_empty() {
            let restored = self.store.fetch(MAX_BUCKETS);
            let overflow = {
                let mut buckets = self.buckets.lock();
                // restored buckets predate anything sealed since the check
                for bucket in restored.into_iter().rev() {
                    if !bucket.is_empty() {
                        buckets.push_front(bucket);
                    }
                }
                let keep = buckets.len().min(MAX_BUCKETS);
                buckets.split_off(keep)
            };
            for bucket in overflow {
                self.offload(bucket);
            }
        }

        let mut buckets = self.buckets.lock();
        if let Some(bucket) = buckets.pop_front() {
            return Some(bucket);
        }
        let mut current = self.current.lock();
        if current.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut *current))
        }
    }

    /// Puts an undelivered bucket back at the front of the queue, or into the
    /// store when the queue is full.
    fn unremove_bucket(&self, bucket: Bucket) -> bool {
        {
            let mut buckets = self.buckets.lock();
            if buckets.len() < MAX_BUCKETS {
                buckets.push_front(bucket);
                return true;
            }
        }
        self.offload(bucket)
    }

    fn waiting_buckets(&self) -> Vec<usize> {
        let mut sizes: Vec<usize> = self.buckets.lock().iter().map(Vec::len).collect();
        let current = self.current.lock().len();
        if current > 0 {
            sizes.push(current);
        }
        sizes
    }

    fn send_transactions(&self) -> SendOutcome {
        if !self.transactions_queued() {
            return SendOutcome::Idle;
        }
        let Some(bucket) = self.remove_bucket() else {
            return SendOutcome::Idle;
        };

        let unknown_features = self.cache.take_unknown();
        let payload = ReportPayload {
            client_uuid: self.api.client_uuid().to_string(),
            transactions: bucket,
            stats: ReportStats {
                ff_latency: self.api.last_fetch_duration(),
                waiting_buckets: self.waiting_buckets(),
            },
            unknown_features,
            api_request_log: self.api.siphon_api_request_log(),
        };

        match self.api.post_transactions(&payload) {
            Ok(()) => {
                self.cache.persist_unknown();
                let persisted = usize::from(!self.store.is_empty());
                SendOutcome::Sent {
                    remaining: payload.stats.waiting_buckets.len() + persisted,
                }
            }
            Err(e) => {
                error!("failed to report {} transactions: {}", payload.transactions.len(), e);
                let ReportPayload {
                    transactions,
                    unknown_features,
                    ..
                } = payload;
                self.unremove_bucket(transactions);
                self.cache.merge_unknown(&unknown_features);
                SendOutcome::Failed
            }
        }
    }
}

/// Telemetry reporter. The background loop starts with the first reported
/// transaction.
pub struct Reporter {
    queue: Arc<Queue>,
    poller: PollingLoop,
    autostart: bool,
}

impl Reporter {
    /// Creates a reporter, restoring up to [`MAX_BUCKETS`] buckets left in
    /// `store` by a previous process.
    pub fn new(api: Arc<dyn Api>, cache: Arc<FeatureCache>, store: Arc<dyn BucketStore>) -> Self {
        let restored: VecDeque<Bucket> = store
            .fetch(MAX_BUCKETS)
            .into_iter()
            .filter(|b| !b.is_empty())
            .collect();
        Self {
            queue: Arc::new(Queue {
                api,
                cache,
                store,
                buckets: Mutex::new(restored),
                current: Mutex::new(Vec::with_capacity(MAX_BUCKET_SIZE)),
            }),
            poller: PollingLoop::new("reporter"),
            autostart: true,
        }
    }

    /// Leaves the background loop alone when transactions are reported;
    /// delivery then only happens through [`Reporter::start`] or
    /// [`Reporter::send_transactions`].
    pub fn without_autostart(mut self) -> Self {
        self.autostart = false;
        self
    }

    /// Queues a finished transaction and records the unknown features it ran
    /// into. Only takes short-lived locks.
    pub fn report_transaction(&self, payload: TransactionPayload, unknown_features: &UnknownFeatures) {
        self.queue.queue_transaction_payload(payload);
        self.queue.cache.merge_unknown(unknown_features);
        if self.autostart {
            self.start();
        }
    }

    pub fn start(&self) -> bool {
        let queue = Arc::clone(&self.queue);
        self.poller.start(WAIT_BETWEEN_SEND_FAILURES, move || {
            pause_after_send(queue.send_transactions())
        })
    }

    pub fn stop(&self, wait: bool) {
        self.poller.stop(wait);
    }

    pub fn is_running(&self) -> bool {
        self.poller.is_running()
    }

    /// Runs a single delivery attempt, exactly as one loop iteration does.
    pub fn send_transactions(&self) -> SendOutcome {
        self.queue.send_transactions()
    }

    pub fn transactions_queued(&self) -> bool {
        self.queue.transactions_queued()
    }

    /// Sizes of the sealed buckets in memory, oldest first, followed by the
    /// current bucket if it holds anything.
    pub fn waiting_buckets(&self) -> Vec<usize> {
        self.queue.waiting_buckets()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::FeaturesResponse;
    use crate::error::{Error, Result};
    use crate::payload::{ApiRequestRecord, Hits, PayloadUser, TransactionStats, UserId};
    use crate::store::{NullBuckets, NullFeatures};
    use tracing_test::traced_test;

    struct Unreachable;

    impl Api for Unreachable {
        fn get_features(&self, _: Option<Duration>, _: bool) -> Result<FeaturesResponse> {
            Ok(FeaturesResponse::NotModified)
        }

        fn put_enabled_percent(&self, _: &str, _: &str, _: f64) -> Result<()> {
            Ok(())
        }

        fn post_transactions(&self, _: &ReportPayload) -> Result<()> {
            Err(Error::Protocol {
                path: "/report/transactions".into(),
                reason: "unreachable".into(),
            })
        }

        fn client_uuid(&self) -> &str {
            "test"
        }

        fn last_fetch_duration(&self) -> Option<f64> {
            None
        }

        fn siphon_api_request_log(&self) -> Vec<ApiRequestRecord> {
            Vec::new()
        }
    }

    fn reporter() -> Reporter {
        Reporter::new(
            Arc::new(Unreachable),
            Arc::new(FeatureCache::new(Arc::new(NullFeatures))),
            Arc::new(NullBuckets),
        )
        .without_autostart()
    }

    fn payload(i: usize) -> TransactionPayload {
        TransactionPayload {
            url: format!("/{}", i),
            user: PayloadUser {
                id: UserId::Int(i as i64),
                name: None,
                anonymous: None,
                unique: None,
                cohorts: None,
            },
            hits: Hits::default(),
            stats: TransactionStats::default(),
        }
    }

    #[test]
    #[traced_test]
    fn test_overflow_without_store_is_logged() {
        let reporter = reporter();
        for i in 0..((MAX_BUCKETS + 1) * MAX_BUCKET_SIZE + 1) {
            reporter.report_transaction(payload(i), &UnknownFeatures::new());
        }
        assert!(logs_contain("Discarded 100 transactions due to reporter backlog"));
        assert_eq!(reporter.waiting_buckets().len(), MAX_BUCKETS + 1);
    }

    #[test]
    #[traced_test]
    fn test_failed_send_with_full_queue_discards() {
        let reporter = reporter();
        for i in 0..(MAX_BUCKETS * MAX_BUCKET_SIZE + 1) {
            reporter.report_transaction(payload(i), &UnknownFeatures::new());
        }
        // the failed bucket cannot go back once the current one is sealed
        // into its place
        let queue = &reporter.queue;
        let bucket = queue.remove_bucket().unwrap();
        for i in 0..MAX_BUCKET_SIZE {
            queue.queue_transaction_payload(payload(i));
        }
        assert_eq!(queue.buckets.lock().len(), MAX_BUCKETS);
        assert!(!queue.unremove_bucket(bucket));
        assert!(logs_contain("Discarded 100 transactions"));
        assert_eq!(reporter.send_transactions(), SendOutcome::Failed);
        assert!(logs_contain("failed to report"));
    }

    #[test]
    fn test_pause_after_send() {
        assert_eq!(pause_after_send(SendOutcome::Idle), Duration::from_millis(500));
        assert_eq!(
            pause_after_send(SendOutcome::Sent { remaining: 0 }),
            Duration::from_secs(1)
        );
        assert_eq!(
            pause_after_send(SendOutcome::Sent { remaining: 1 }),
            Duration::from_secs(1)
        );
        assert_eq!(
            pause_after_send(SendOutcome::Sent { remaining: 2 }),
            Duration::from_millis(100)
        );
        assert_eq!(pause_after_send(SendOutcome::Failed), Duration::from_secs(5));
    }
}
