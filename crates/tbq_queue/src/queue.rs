//! The leasing store for buckets of one job.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::RwLock;
use tbq_utils::{
    illegal_state, log_assert,
    protocol::{
        bucket::{Bucket, BucketId, TestEntry, TestRetryMode},
        capabilities::WorkerCapabilities,
        entity::WorkerId,
        queue::{AcceptError, RunningQueueState, WorkerRejection},
        results::{SyntheticFailure, TestEntryResult, TestRunResult, TestingResult},
    },
    time::EpochMillis,
    vec_set::VecSet,
};
use thiserror::Error;

use crate::{
    aliveness::WorkerAlivenessTracker, history::TestHistoryTracker, splitter::BucketSplitter,
};

/// Host name attached to results the queue makes up on a worker's behalf.
const QUEUE_HOST_NAME: &str = "queue";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueuedBucket {
    pub bucket: Bucket,
    pub enqueue_timestamp: EpochMillis,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DequeuedBucket {
    pub enqueued_bucket: EnqueuedBucket,
    pub worker_id: WorkerId,
    pub dequeue_timestamp: EpochMillis,
}

impl DequeuedBucket {
    pub fn bucket(&self) -> &Bucket {
        &self.enqueued_bucket.bucket
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnqueueError {
    #[error("bucket {0} is already enqueued or dequeued")]
    DuplicateBucketId(BucketId),
}

/// The outcome of accepting a worker's result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedResult {
    /// The result with entries that were sent back for retry removed; what remains is final.
    pub testing_result: TestingResult,
    /// Buckets enqueued to retry failed entries of the accepted bucket.
    pub requeued_bucket_ids: Vec<BucketId>,
}

/// A bucket id is in at most one of `enqueued` and `dequeued`.
#[derive(Debug, Default)]
struct QueueState {
    enqueued: VecDeque<EnqueuedBucket>,
    dequeued: HashMap<BucketId, DequeuedBucket>,
}

impl QueueState {
    fn contains(&self, bucket_id: &BucketId) -> bool {
        self.dequeued.contains_key(bucket_id)
            || self
                .enqueued
                .iter()
                .any(|eb| eb.bucket.bucket_id() == bucket_id)
    }

    fn push_back(&mut self, bucket: Bucket) {
        log_assert!(
            !self.contains(bucket.bucket_id()),
            bucket_id=?bucket.bucket_id(),
            "bucket is already in the queue"
        );
        self.enqueued.push_back(EnqueuedBucket {
            bucket,
            enqueue_timestamp: EpochMillis::now(),
        });
    }
}

/// Thread-safe leasing store for one job's buckets.
///
/// Every mutation of the enqueued and dequeued sets happens under one write lock. Lock order is
/// queue state, then worker aliveness, then test history; the trackers never call back into
/// the queue.
pub struct BucketQueue {
    state: RwLock<QueueState>,
    aliveness: Arc<WorkerAlivenessTracker>,
    history: TestHistoryTracker,
    splitter: BucketSplitter,
}

impl BucketQueue {
    pub fn new(aliveness: Arc<WorkerAlivenessTracker>, splitter: BucketSplitter) -> Self {
        Self {
            state: Default::default(),
            aliveness,
            history: Default::default(),
            splitter,
        }
    }

    pub fn history(&self) -> &TestHistoryTracker {
        &self.history
    }

    /// Enqueues all buckets, or none of them if any id collides.
    pub fn enqueue(&self, buckets: Vec<Bucket>) -> Result<(), EnqueueError> {
        let mut state = self.state.write();

        for (i, bucket) in buckets.iter().enumerate() {
            let bucket_id = bucket.bucket_id();
            let duplicated_in_batch = buckets[..i].iter().any(|b| b.bucket_id() == bucket_id);
            if duplicated_in_batch || state.contains(bucket_id) {
                tracing::warn!(?bucket_id, "rejecting duplicate bucket");
                return Err(EnqueueError::DuplicateBucketId(bucket_id.clone()));
            }
        }

        for bucket in buckets {
            tracing::debug!(bucket_id=?bucket.bucket_id(), "enqueued bucket");
            self.history.track_bucket(&bucket);
            state.push_back(bucket);
        }

        Ok(())
    }

    /// Leases the earliest enqueued bucket the worker can run, if any.
    ///
    /// A bucket whose entries the worker already attempted is passed over while another alive,
    /// capable worker has not attempted them.
    pub fn dequeue_bucket(
        &self,
        worker_id: &WorkerId,
        capabilities: &WorkerCapabilities,
    ) -> Result<Option<DequeuedBucket>, WorkerRejection> {
        let mut state = self.state.write();

        self.aliveness.ensure_alive(worker_id).map_err(|rejection| {
            tracing::warn!(?worker_id, %rejection, "rejecting dequeue");
            rejection
        })?;
        self.aliveness.update_capabilities(worker_id, capabilities);

        let mut alive_workers = None;
        let position = state.enqueued.iter().position(|enqueued| {
            let bucket = &enqueued.bucket;
            if !capabilities.satisfy(bucket.capability_requirements()) {
                return false;
            }
            let alive = alive_workers.get_or_insert_with(|| self.aliveness.alive_workers());
            let candidates: Vec<_> = alive
                .iter()
                .filter(|(_, caps)| caps.satisfy(bucket.capability_requirements()))
                .map(|(id, _)| id.clone())
                .collect();
            !self.history.should_defer(bucket, worker_id, &candidates)
        });

        let enqueued = match position.and_then(|i| state.enqueued.remove(i)) {
            Some(enqueued) => enqueued,
            None => {
                tracing::debug!(?worker_id, "no eligible bucket for worker");
                return Ok(None);
            }
        };

        let bucket_id = enqueued.bucket.bucket_id().clone();
        let dequeued = DequeuedBucket {
            enqueued_bucket: enqueued,
            worker_id: worker_id.clone(),
            dequeue_timestamp: EpochMillis::now(),
        };
        state.dequeued.insert(bucket_id.clone(), dequeued.clone());
        self.aliveness.will_process(worker_id, &bucket_id);

        tracing::debug!(?worker_id, ?bucket_id, "leased bucket");
        Ok(Some(dequeued))
    }

    /// Whether the bucket is enqueued or leased in this queue.
    pub fn holds(&self, bucket_id: &BucketId) -> bool {
        self.state.read().contains(bucket_id)
    }

    /// Accepts a worker's result for a bucket leased to it.
    ///
    /// Entries of the bucket missing from the result count as failed. Failed entries with retries
    /// left are enqueued again in new buckets when the bucket retries through the queue; they are
    /// left out of the returned result.
    pub fn accept(
        &self,
        testing_result: TestingResult,
        worker_id: &WorkerId,
    ) -> Result<AcceptedResult, AcceptError> {
        let mut state = self.state.write();
        let bucket_id = testing_result.bucket_id.clone();

        let dequeued = match state.dequeued.remove(&bucket_id) {
            Some(dequeued) if &dequeued.worker_id == worker_id => dequeued,
            other => {
                let leased_to = other.as_ref().map(|d| d.worker_id.clone());
                if let Some(dequeued) = other {
                    state.dequeued.insert(bucket_id.clone(), dequeued);
                }
                tracing::warn!(
                    ?bucket_id,
                    ?worker_id,
                    ?leased_to,
                    "rejecting result for bucket not leased to worker"
                );
                return Err(AcceptError::UnexpectedBucketId {
                    bucket_id,
                    worker_id: worker_id.clone(),
                });
            }
        };
        self.aliveness.did_process(worker_id, &bucket_id);

        let bucket = dequeued.enqueued_bucket.bucket;
        let testing_result = complete_result(&bucket, testing_result, worker_id);
        let retry_mode = bucket.payload().test_execution_behavior().retry_mode;

        let mut to_retry: Vec<TestEntry> = Vec::new();
        for entry_result in &testing_result.unfiltered_results {
            let remaining = self
                .history
                .record_entry_result(&bucket, worker_id, entry_result);
            if !entry_result.succeeded() {
                if remaining > 0 && retry_mode == TestRetryMode::RetryThroughQueue {
                    to_retry.push(entry_result.test_entry.clone());
                } else {
                    tracing::info!(
                        ?bucket_id,
                        ?worker_id,
                        test_name=%entry_result.test_name(),
                        "test failed with no retries left"
                    );
                }
            }
        }

        let retry_buckets = self.splitter.resplit_for_retry(&bucket, to_retry.clone());
        let requeued_bucket_ids: Vec<_> = retry_buckets
            .iter()
            .map(|b| b.bucket_id().clone())
            .collect();
        for retry_bucket in retry_buckets {
            if state.contains(retry_bucket.bucket_id()) {
                illegal_state!(
                    "retry bucket id collides with a queued bucket",
                    bucket_id=?retry_bucket.bucket_id()
                );
                continue;
            }
            self.history.track_bucket(&retry_bucket);
            state.push_back(retry_bucket);
        }

        let testing_result =
            testing_result.filtered(|entry_result| !to_retry.contains(&entry_result.test_entry));

        tracing::info!(
            ?bucket_id,
            ?worker_id,
            succeeded = testing_result.successful_tests().count(),
            failed = testing_result.failed_tests().count(),
            retried = to_retry.len(),
            "accepted bucket result"
        );

        Ok(AcceptedResult {
            testing_result,
            requeued_bucket_ids,
        })
    }

    /// Moves the given buckets, if still leased to `worker_id`, to the back of the queue
    /// unchanged. Returns the requeued bucket ids.
    pub fn requeue_leases(&self, worker_id: &WorkerId, bucket_ids: &[BucketId]) -> Vec<BucketId> {
        if bucket_ids.is_empty() {
            return Vec::new();
        }

        let mut state = self.state.write();

        let mut requeued = Vec::with_capacity(bucket_ids.len());
        for bucket_id in bucket_ids {
            let leased_to_worker = matches!(
                state.dequeued.get(bucket_id),
                Some(dequeued) if &dequeued.worker_id == worker_id
            );
            if !leased_to_worker {
                continue;
            }
            if let Some(dequeued) = state.dequeued.remove(bucket_id) {
                tracing::info!(?bucket_id, ?worker_id, "requeueing leased bucket");
                self.aliveness.did_process(worker_id, bucket_id);
                state.push_back(dequeued.enqueued_bucket.bucket);
                requeued.push(bucket_id.clone());
            }
        }

        requeued
    }

    /// Drops every bucket, releasing all leases. Returns the buckets that were leased.
    pub fn remove_all(&self) -> Vec<DequeuedBucket> {
        let mut state = self.state.write();
        state.enqueued.clear();
        let dequeued: Vec<_> = state.dequeued.drain().map(|(_, d)| d).collect();
        for d in &dequeued {
            self.aliveness.did_process(&d.worker_id, d.bucket().bucket_id());
        }
        dequeued
    }

    pub fn running_queue_state(&self) -> RunningQueueState {
        let state = self.state.read();

        let mut running = RunningQueueState {
            enqueued_bucket_count: state.enqueued.len(),
            enqueued_tests: state
                .enqueued
                .iter()
                .flat_map(|eb| eb.bucket.test_entries())
                .map(|entry| entry.test_name.clone())
                .collect(),
            dequeued_bucket_count: state.dequeued.len(),
            dequeued_tests: Default::default(),
        };
        for dequeued in state.dequeued.values() {
            running
                .dequeued_tests
                .entry(dequeued.worker_id.clone())
                .or_default()
                .extend(dequeued.bucket().test_entries().iter().map(|e| e.test_name.clone()));
        }

        running
    }

    pub fn is_depleted(&self) -> bool {
        let state = self.state.read();
        state.enqueued.is_empty() && state.dequeued.is_empty()
    }
}

/// Restricts a result to the bucket's entries, making up failures for entries it lacks.
fn complete_result(bucket: &Bucket, result: TestingResult, worker_id: &WorkerId) -> TestingResult {
    let TestingResult {
        bucket_id,
        mut unfiltered_results,
    } = result;

    let mut seen = VecSet::with_capacity(unfiltered_results.len());
    unfiltered_results.retain(|entry_result| {
        let expected = bucket.test_entries().contains(&entry_result.test_entry);
        if !expected {
            tracing::warn!(
                ?bucket_id,
                ?worker_id,
                test_name=%entry_result.test_name(),
                "dropping result for entry not in bucket"
            );
            return false;
        }
        // Only the first result reported for an entry counts.
        let repeated = seen.insert(entry_result.test_entry.clone());
        if repeated {
            tracing::warn!(
                ?bucket_id,
                ?worker_id,
                test_name=%entry_result.test_name(),
                "dropping repeated result for entry"
            );
        }
        !repeated
    });

    for entry in bucket.test_entries() {
        let reported = unfiltered_results
            .iter()
            .any(|r| &r.test_entry == entry && !r.test_run_results.is_empty());
        if !reported {
            tracing::warn!(
                ?bucket_id,
                ?worker_id,
                test_name=%entry.test_name,
                "result is missing test entry"
            );
            let missing = TestRunResult::synthetic_failure(
                &SyntheticFailure::NoResult,
                QUEUE_HOST_NAME,
                EpochMillis::now(),
            );
            match unfiltered_results.iter_mut().find(|r| &r.test_entry == entry) {
                Some(existing) => existing.test_run_results.push(missing),
                None => unfiltered_results.push(TestEntryResult::new(entry.clone(), vec![missing])),
            }
        }
    }

    TestingResult::new(bucket_id, unfiltered_results)
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use tbq_test_utils::{
        all_passing, bucket, bucket_with_requirements, bucket_with_retries, entry_result,
        failing_run, passing_run, testing_result, worker,
    };
    use tbq_utils::protocol::{
        bucket::{BucketId, TestEntry, TestName, TestRetryMode},
        capabilities::{CapabilityRequirement, WorkerCapabilities},
        entity::WorkerId,
        queue::{AcceptError, WorkerRejection},
        results::{SyntheticFailure, TestingResult},
    };
    use tracing_test::traced_test;

    use super::{BucketQueue, EnqueueError};
    use crate::{
        aliveness::WorkerAlivenessTracker,
        history::TestEntryHistoryId,
        splitter::{BucketSplitInfo, BucketSplitter, ScheduleStrategy},
    };

    const SILENCE: Duration = Duration::from_secs(10);

    fn queue_with_workers(workers: &[&str]) -> (BucketQueue, Arc<WorkerAlivenessTracker>) {
        let aliveness = Arc::new(WorkerAlivenessTracker::new(SILENCE));
        for w in workers {
            aliveness
                .register(&worker(w), WorkerCapabilities::new(), None, Instant::now())
                .unwrap();
        }
        let splitter =
            BucketSplitter::new(ScheduleStrategy::Individual, BucketSplitInfo::default());
        (BucketQueue::new(aliveness.clone(), splitter), aliveness)
    }

    /// Requeues whatever the tracker reaps, as the service does across all of its queues.
    fn reap(
        queue: &BucketQueue,
        aliveness: &WorkerAlivenessTracker,
        now: Instant,
    ) -> Vec<BucketId> {
        aliveness
            .reap(now)
            .into_iter()
            .flat_map(|reaped| queue.requeue_leases(&reaped.worker_id, &reaped.bucket_ids))
            .collect()
    }

    fn no_caps() -> WorkerCapabilities {
        WorkerCapabilities::new()
    }

    fn dequeue_id(queue: &BucketQueue, w: &str) -> Option<BucketId> {
        queue
            .dequeue_bucket(&worker(w), &no_caps())
            .unwrap()
            .map(|d| d.bucket().bucket_id().clone())
    }

    #[test]
    fn dequeue_is_fifo() {
        let (queue, _) = queue_with_workers(&["w"]);
        queue
            .enqueue(vec![bucket("b1", &["a"]), bucket("b2", &["b"])])
            .unwrap();

        assert_eq!(dequeue_id(&queue, "w"), Some(BucketId::new("b1")));
        assert_eq!(dequeue_id(&queue, "w"), Some(BucketId::new("b2")));
        assert_eq!(dequeue_id(&queue, "w"), None);
    }

    #[test]
    fn enqueue_rejects_duplicates_atomically() {
        let (queue, _) = queue_with_workers(&["w"]);
        queue.enqueue(vec![bucket("b1", &["a"])]).unwrap();

        assert_eq!(
            queue.enqueue(vec![bucket("b2", &["b"]), bucket("b1", &["a"])]),
            Err(EnqueueError::DuplicateBucketId(BucketId::new("b1")))
        );
        assert_eq!(queue.running_queue_state().enqueued_bucket_count, 1);

        assert_eq!(
            queue.enqueue(vec![bucket("b3", &["c"]), bucket("b3", &["c"])]),
            Err(EnqueueError::DuplicateBucketId(BucketId::new("b3")))
        );
        assert_eq!(queue.running_queue_state().enqueued_bucket_count, 1);
    }

    #[test]
    fn enqueue_rejects_id_of_leased_bucket() {
        let (queue, _) = queue_with_workers(&["w"]);
        queue.enqueue(vec![bucket("b1", &["a"])]).unwrap();
        dequeue_id(&queue, "w").unwrap();

        assert_eq!(
            queue.enqueue(vec![bucket("b1", &["a"])]),
            Err(EnqueueError::DuplicateBucketId(BucketId::new("b1")))
        );
    }

    #[test]
    fn dequeue_by_unregistered_or_blocked_worker_is_rejected() {
        let (queue, aliveness) = queue_with_workers(&["blocked"]);
        queue.enqueue(vec![bucket("b1", &["a"])]).unwrap();
        aliveness.block(&worker("blocked"));

        assert_eq!(
            queue.dequeue_bucket(&worker("stranger"), &no_caps()),
            Err(WorkerRejection::WorkerNotRegistered(worker("stranger")))
        );
        assert_eq!(
            queue.dequeue_bucket(&worker("blocked"), &no_caps()),
            Err(WorkerRejection::WorkerBlocked(worker("blocked")))
        );
        assert_eq!(queue.running_queue_state().enqueued_bucket_count, 1);
    }

    #[test]
    fn capability_filtering_skips_ineligible_buckets_only() {
        let (queue, _) = queue_with_workers(&["cpu", "gpu"]);
        queue
            .enqueue(vec![
                bucket_with_requirements(
                    "needs-gpu",
                    &["a"],
                    vec![CapabilityRequirement::present("gpu")],
                ),
                bucket("any", &["b"]),
            ])
            .unwrap();

        assert_eq!(dequeue_id(&queue, "cpu"), Some(BucketId::new("any")));
        assert_eq!(dequeue_id(&queue, "cpu"), None);

        let gpu = queue
            .dequeue_bucket(&worker("gpu"), &WorkerCapabilities::new().with("gpu"))
            .unwrap()
            .unwrap();
        assert_eq!(gpu.bucket().bucket_id(), &BucketId::new("needs-gpu"));
    }

    #[test]
    fn bucket_is_never_in_both_sets() {
        let (queue, _) = queue_with_workers(&["w"]);
        queue.enqueue(vec![bucket("b1", &["a", "b"])]).unwrap();
        dequeue_id(&queue, "w").unwrap();

        let state = queue.running_queue_state();
        assert_eq!(state.enqueued_bucket_count, 0);
        assert_eq!(state.dequeued_bucket_count, 1);
        assert_eq!(
            state.dequeued_tests[&worker("w")],
            vec![TestName::from("a"), TestName::from("b")]
        );
        assert!(!queue.is_depleted());
    }

    #[test]
    fn accepting_passing_result_depletes_queue() {
        let (queue, aliveness) = queue_with_workers(&["w"]);
        queue.enqueue(vec![bucket("b1", &["a"])]).unwrap();
        dequeue_id(&queue, "w").unwrap();

        let accepted = queue
            .accept(
                testing_result("b1", vec![entry_result("a", vec![passing_run()])]),
                &worker("w"),
            )
            .unwrap();

        assert!(accepted.requeued_bucket_ids.is_empty());
        assert_eq!(accepted.testing_result.successful_tests().count(), 1);
        assert!(queue.is_depleted());
        assert!(aliveness.bucket_ids_being_processed_by(&worker("w")).is_empty());
    }

    #[test]
    #[traced_test]
    fn accept_from_wrong_worker_is_rejected() {
        let (queue, _) = queue_with_workers(&["w1", "w2"]);
        queue.enqueue(vec![bucket("b1", &["a"])]).unwrap();
        dequeue_id(&queue, "w1").unwrap();

        let result = queue.accept(
            testing_result("b1", vec![entry_result("a", vec![passing_run()])]),
            &worker("w2"),
        );
        assert_eq!(
            result,
            Err(AcceptError::UnexpectedBucketId {
                bucket_id: BucketId::new("b1"),
                worker_id: worker("w2"),
            })
        );
        assert_eq!(queue.running_queue_state().dequeued_bucket_count, 1);
        assert!(logs_contain("rejecting result for bucket not leased to worker"));
    }

    #[test]
    fn second_accept_is_rejected_without_recounting_history() {
        let (queue, _) = queue_with_workers(&["w"]);
        let b = bucket_with_retries("b1", &["a"], 0);
        queue.enqueue(vec![b.clone()]).unwrap();
        dequeue_id(&queue, "w").unwrap();

        let result = testing_result("b1", vec![entry_result("a", vec![failing_run("x")])]);
        queue.accept(result.clone(), &worker("w")).unwrap();
        assert!(matches!(
            queue.accept(result, &worker("w")),
            Err(AcceptError::UnexpectedBucketId { .. })
        ));

        let id = TestEntryHistoryId::new(&b, TestEntry::new("a"));
        assert_eq!(queue.history().attempts(&id).len(), 1);
    }

    #[test]
    fn failed_entries_with_budget_are_requeued() {
        let (queue, _) = queue_with_workers(&["w"]);
        queue
            .enqueue(vec![bucket_with_retries("b1", &["a", "b", "c"], 1)])
            .unwrap();
        dequeue_id(&queue, "w").unwrap();

        let accepted = queue
            .accept(
                testing_result(
                    "b1",
                    vec![
                        entry_result("a", vec![passing_run()]),
                        entry_result("b", vec![failing_run("flaky")]),
                        entry_result("c", vec![passing_run()]),
                    ],
                ),
                &worker("w"),
            )
            .unwrap();

        // The failure is not final yet.
        assert_eq!(accepted.testing_result.unfiltered_results.len(), 2);
        assert_eq!(accepted.testing_result.failed_tests().count(), 0);
        assert_eq!(accepted.requeued_bucket_ids.len(), 1);

        let state = queue.running_queue_state();
        assert_eq!(state.enqueued_tests, vec![TestName::from("b")]);

        // The only worker is reused for the retry.
        let retry = queue
            .dequeue_bucket(&worker("w"), &no_caps())
            .unwrap()
            .unwrap();
        assert_eq!(retry.bucket().lineage_id(), &BucketId::new("b1"));
        assert_eq!(retry.bucket().bucket_id(), &accepted.requeued_bucket_ids[0]);

        let retry_id = retry.bucket().bucket_id().clone();
        let accepted = queue
            .accept(
                TestingResult::new(retry_id, vec![entry_result("b", vec![failing_run("again")])]),
                &worker("w"),
            )
            .unwrap();

        // Budget exhausted: the failure is final.
        assert!(accepted.requeued_bucket_ids.is_empty());
        assert_eq!(accepted.testing_result.failed_tests().count(), 1);
        assert!(queue.is_depleted());
    }

    #[test]
    #[traced_test]
    fn repeated_entry_results_count_once() {
        let (queue, _) = queue_with_workers(&["w"]);
        let b = bucket_with_retries("b1", &["a"], 3);
        queue.enqueue(vec![b.clone()]).unwrap();
        dequeue_id(&queue, "w").unwrap();

        let accepted = queue
            .accept(
                testing_result(
                    "b1",
                    vec![
                        entry_result("a", vec![failing_run("first")]),
                        entry_result("a", vec![failing_run("second")]),
                    ],
                ),
                &worker("w"),
            )
            .unwrap();

        let id = TestEntryHistoryId::new(&b, TestEntry::new("a"));
        assert_eq!(queue.history().attempts(&id).len(), 1);
        assert_eq!(queue.history().remaining_retries(&id), 2);
        assert_eq!(accepted.requeued_bucket_ids.len(), 1);
        assert_eq!(queue.running_queue_state().enqueued_tests, vec![TestName::from("a")]);
        assert!(logs_contain("dropping repeated result for entry"));
    }

    #[test]
    fn failures_are_not_requeued_when_retrying_on_worker() {
        let (queue, _) = queue_with_workers(&["w"]);
        let mut b = bucket_with_retries("b1", &["a"], 3);
        b = tbq_test_utils::with_retry_mode(b, TestRetryMode::RetryOnWorker);
        queue.enqueue(vec![b]).unwrap();
        dequeue_id(&queue, "w").unwrap();

        let accepted = queue
            .accept(
                testing_result("b1", vec![entry_result("a", vec![failing_run("x")])]),
                &worker("w"),
            )
            .unwrap();
        assert!(accepted.requeued_bucket_ids.is_empty());
        assert_eq!(accepted.testing_result.failed_tests().count(), 1);
        assert!(queue.is_depleted());
    }

    #[test]
    #[traced_test]
    fn missing_entries_count_as_failed() {
        let (queue, _) = queue_with_workers(&["w"]);
        queue
            .enqueue(vec![bucket_with_retries("b1", &["a", "b"], 0)])
            .unwrap();
        dequeue_id(&queue, "w").unwrap();

        let accepted = queue
            .accept(
                testing_result(
                    "b1",
                    vec![
                        entry_result("a", vec![passing_run()]),
                        entry_result("stray", vec![passing_run()]),
                    ],
                ),
                &worker("w"),
            )
            .unwrap();

        let result = accepted.testing_result;
        assert_eq!(result.unfiltered_results.len(), 2);
        let missing = result.result_for(&TestName::from("b")).unwrap();
        assert!(!missing.succeeded());
        let run = missing.final_run_result().unwrap();
        assert!(run.is_synthetic());
        assert_eq!(run.exceptions[0].reason, SyntheticFailure::NoResult.to_string());
        assert!(logs_contain("result is missing test entry"));
        assert!(logs_contain("dropping result for entry not in bucket"));
    }

    #[test]
    fn retry_prefers_worker_that_has_not_tried() {
        let (queue, _) = queue_with_workers(&["a", "b"]);
        queue
            .enqueue(vec![bucket_with_retries("b1", &["t"], 2)])
            .unwrap();
        dequeue_id(&queue, "a").unwrap();
        queue
            .accept(
                testing_result("b1", vec![entry_result("t", vec![failing_run("x")])]),
                &worker("a"),
            )
            .unwrap();

        assert_eq!(dequeue_id(&queue, "a"), None);
        let retry = dequeue_id(&queue, "b").unwrap();
        assert_ne!(retry, BucketId::new("b1"));
    }

    #[test]
    fn retry_preference_ignores_workers_that_cannot_run_bucket() {
        let (queue, aliveness) = queue_with_workers(&["a"]);
        aliveness
            .register(&worker("b"), WorkerCapabilities::new(), None, Instant::now())
            .unwrap();
        let gpu = vec![CapabilityRequirement::present("gpu")];
        let mut b = bucket_with_requirements("b1", &["t"], gpu);
        b = tbq_test_utils::with_number_of_retries(b, 2);
        queue.enqueue(vec![b]).unwrap();

        let gpu_caps = WorkerCapabilities::new().with("gpu");
        queue.dequeue_bucket(&worker("a"), &gpu_caps).unwrap().unwrap();
        queue
            .accept(
                testing_result("b1", vec![entry_result("t", vec![failing_run("x")])]),
                &worker("a"),
            )
            .unwrap();

        // "b" is alive but lacks the capability, so "a" is reused.
        assert!(queue.dequeue_bucket(&worker("a"), &gpu_caps).unwrap().is_some());
    }

    #[test]
    fn reaping_requeues_buckets_of_silent_worker() {
        let (queue, aliveness) = queue_with_workers(&["dead", "alive"]);
        let b1 = bucket("b1", &["a"]);
        queue.enqueue(vec![b1.clone(), bucket("b2", &["b"])]).unwrap();
        dequeue_id(&queue, "dead").unwrap();
        dequeue_id(&queue, "alive").unwrap();

        let later = Instant::now() + SILENCE * 2;
        aliveness.heartbeat(&worker("alive"), later).unwrap();
        let requeued = reap(&queue, &aliveness, later);

        assert_eq!(requeued, vec![BucketId::new("b1")]);
        let state = queue.running_queue_state();
        assert_eq!(state.enqueued_bucket_count, 1);
        assert_eq!(state.dequeued_bucket_count, 1);
        assert!(state.dequeued_tests.contains_key(&worker("alive")));

        let again = queue
            .dequeue_bucket(&worker("alive"), &no_caps())
            .unwrap()
            .unwrap();
        assert_eq!(again.bucket(), &b1);
    }

    #[test]
    fn reaping_requeues_buckets_of_blocked_worker() {
        let (queue, aliveness) = queue_with_workers(&["w"]);
        queue.enqueue(vec![bucket("b1", &["a"])]).unwrap();
        dequeue_id(&queue, "w").unwrap();

        aliveness.block(&worker("w"));
        assert_eq!(
            reap(&queue, &aliveness, Instant::now()),
            vec![BucketId::new("b1")]
        );
        assert_eq!(queue.running_queue_state().enqueued_bucket_count, 1);
    }

    #[test]
    fn requeued_buckets_go_to_the_back() {
        let (queue, _) = queue_with_workers(&["w"]);
        queue.enqueue(vec![bucket("b1", &["a"])]).unwrap();
        dequeue_id(&queue, "w").unwrap();
        queue.enqueue(vec![bucket("b2", &["b"])]).unwrap();

        assert_eq!(
            queue.requeue_leases(&worker("w"), &[BucketId::new("b1"), BucketId::new("b2")]),
            vec![BucketId::new("b1")]
        );
        assert_eq!(
            queue.running_queue_state().enqueued_tests,
            vec![TestName::from("b"), TestName::from("a")]
        );
    }

    #[test]
    fn remove_all_releases_leases() {
        let (queue, aliveness) = queue_with_workers(&["w"]);
        queue
            .enqueue(vec![bucket("b1", &["a"]), bucket("b2", &["b"])])
            .unwrap();
        dequeue_id(&queue, "w").unwrap();

        let dropped = queue.remove_all();
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].worker_id, WorkerId::new("w"));
        assert!(queue.is_depleted());
        assert!(aliveness.bucket_ids_being_processed_by(&worker("w")).is_empty());
    }

    #[test]
    fn concurrent_leasing_keeps_sets_disjoint() {
        const WORKERS: [&str; 4] = ["w0", "w1", "w2", "w3"];
        const BUCKETS: usize = 200;

        let (queue, aliveness) = queue_with_workers(&WORKERS);
        let buckets: Vec<_> = (0..BUCKETS)
            .map(|i| bucket(&format!("b{i}"), &[format!("t{i}").as_str()]))
            .collect();
        queue.enqueue(buckets).unwrap();

        let done = AtomicBool::new(false);
        std::thread::scope(|scope| {
            let checker = scope.spawn(|| {
                let mut checks = 0usize;
                loop {
                    let finished = done.load(Ordering::Acquire);
                    let state = queue.state.read();
                    let mut enqueued = HashSet::new();
                    for eb in &state.enqueued {
                        let bucket_id = eb.bucket.bucket_id();
                        assert!(enqueued.insert(bucket_id.clone()), "{bucket_id:?} enqueued twice");
                        assert!(
                            !state.dequeued.contains_key(bucket_id),
                            "{bucket_id:?} is both enqueued and dequeued"
                        );
                    }
                    assert!(enqueued.len() + state.dequeued.len() <= BUCKETS);
                    checks += 1;
                    if finished {
                        return checks;
                    }
                }
            });

            let workers: Vec<_> = WORKERS
                .iter()
                .map(|w| {
                    let queue = &queue;
                    let worker_id = worker(w);
                    scope.spawn(move || {
                        let mut round = 0usize;
                        while !queue.is_depleted() {
                            round += 1;
                            let leased = match queue.dequeue_bucket(&worker_id, &no_caps()) {
                                Ok(Some(leased)) => leased,
                                Ok(None) => {
                                    std::thread::yield_now();
                                    continue;
                                }
                                Err(rejection) => panic!("{rejection}"),
                            };
                            let bucket_id = leased.bucket().bucket_id().clone();
                            if round % 3 == 0 {
                                let requeued = queue.requeue_leases(&worker_id, &[bucket_id]);
                                assert_eq!(requeued.len(), 1);
                            } else {
                                queue.accept(all_passing(leased.bucket()), &worker_id).unwrap();
                            }
                        }
                    })
                })
                .collect();

            let reaper = scope.spawn(|| {
                while !queue.is_depleted() {
                    // Nobody is silent yet; reaping must leave live leases alone.
                    assert!(reap(&queue, &aliveness, Instant::now()).is_empty());
                    std::thread::yield_now();
                }
            });

            for handle in workers {
                handle.join().unwrap();
            }
            reaper.join().unwrap();
            done.store(true, Ordering::Release);
            assert!(checker.join().unwrap() > 0);
        });

        assert!(queue.is_depleted());
        for w in WORKERS {
            assert!(aliveness.bucket_ids_being_processed_by(&worker(w)).is_empty());
        }
    }
}
