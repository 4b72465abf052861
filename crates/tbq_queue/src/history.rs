//! Per-test attempt history, used for retry budgeting and retry locality.

use std::collections::HashMap;

use parking_lot::Mutex;
use tbq_utils::{
    protocol::{
        bucket::{Bucket, BucketId, TestEntry},
        entity::WorkerId,
        results::TestEntryResult,
    },
    vec_set::VecSet,
};

/// A logical test entry: the entry itself plus the lineage of buckets it was scheduled in.
/// Stable across re-splits, so the retry budget is shared by every bucket the entry ends up in.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TestEntryHistoryId {
    pub lineage_id: BucketId,
    pub test_entry: TestEntry,
}

impl TestEntryHistoryId {
    pub fn new(bucket: &Bucket, test_entry: TestEntry) -> Self {
        Self {
            lineage_id: bucket.lineage_id().clone(),
            test_entry,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestAttempt {
    pub bucket_id: BucketId,
    pub worker_id: WorkerId,
    pub succeeded: bool,
}

#[derive(Debug)]
struct TestEntryHistory {
    max_retries: u32,
    attempts: Vec<TestAttempt>,
}

impl TestEntryHistory {
    fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            attempts: Vec::new(),
        }
    }

    /// The first attempt is free; every further attempt consumes one retry.
    fn remaining_retries(&self) -> u32 {
        let attempts = u32::try_from(self.attempts.len()).unwrap_or(u32::MAX);
        let granted = self.max_retries.saturating_add(1);
        granted.saturating_sub(attempts).min(self.max_retries)
    }

    fn workers_already_tried(&self) -> VecSet<WorkerId> {
        self.attempts.iter().map(|a| a.worker_id.clone()).collect()
    }
}

#[derive(Default)]
pub struct TestHistoryTracker {
    histories: Mutex<HashMap<TestEntryHistoryId, TestEntryHistory>>,
}

impl TestHistoryTracker {
    /// Starts tracking every entry of a bucket, if not already tracked through its lineage.
    ///
    /// The retry budget of an entry is fixed the first time its lineage is seen.
    pub fn track_bucket(&self, bucket: &Bucket) {
        let max_retries = bucket.payload().test_execution_behavior().number_of_retries;
        let mut histories = self.histories.lock();
        for entry in bucket.test_entries() {
            histories
                .entry(TestEntryHistoryId::new(bucket, entry.clone()))
                .or_insert_with(|| TestEntryHistory::new(max_retries));
        }
    }

    pub fn record_attempt(
        &self,
        bucket: &Bucket,
        test_entry: &TestEntry,
        worker_id: &WorkerId,
        succeeded: bool,
    ) {
        let max_retries = bucket.payload().test_execution_behavior().number_of_retries;
        self.histories
            .lock()
            .entry(TestEntryHistoryId::new(bucket, test_entry.clone()))
            .or_insert_with(|| TestEntryHistory::new(max_retries))
            .attempts
            .push(TestAttempt {
                bucket_id: bucket.bucket_id().clone(),
                worker_id: worker_id.clone(),
                succeeded,
            });
    }

    /// Records every run of an entry's result as one attempt, and returns the retries left.
    pub fn record_entry_result(
        &self,
        bucket: &Bucket,
        worker_id: &WorkerId,
        entry_result: &TestEntryResult,
    ) -> u32 {
        let max_retries = bucket.payload().test_execution_behavior().number_of_retries;
        let mut histories = self.histories.lock();
        let history = histories
            .entry(TestEntryHistoryId::new(bucket, entry_result.test_entry.clone()))
            .or_insert_with(|| TestEntryHistory::new(max_retries));

        history
            .attempts
            .extend(entry_result.test_run_results.iter().map(|run| TestAttempt {
                bucket_id: bucket.bucket_id().clone(),
                worker_id: worker_id.clone(),
                succeeded: run.succeeded,
            }));

        let remaining = history.remaining_retries();
        tracing::debug!(
            bucket_id=?bucket.bucket_id(),
            test_name=%entry_result.test_name(),
            attempts=history.attempts.len(),
            remaining,
            "recorded test attempts"
        );
        remaining
    }

    /// Untracked entries have no retries left.
    pub fn remaining_retries(&self, id: &TestEntryHistoryId) -> u32 {
        self.histories
            .lock()
            .get(id)
            .map(TestEntryHistory::remaining_retries)
            .unwrap_or(0)
    }

    pub fn workers_already_tried(&self, id: &TestEntryHistoryId) -> VecSet<WorkerId> {
        self.histories
            .lock()
            .get(id)
            .map(TestEntryHistory::workers_already_tried)
            .unwrap_or_default()
    }

    pub fn attempts(&self, id: &TestEntryHistoryId) -> Vec<TestAttempt> {
        self.histories
            .lock()
            .get(id)
            .map(|h| h.attempts.clone())
            .unwrap_or_default()
    }

    /// Whether `worker_id` should pass on `bucket` so that one of `candidates` gets it instead.
    ///
    /// True only if the worker already tried some entry of the bucket and a candidate other than
    /// the worker has tried none of them. If every eligible worker already tried, the worker is
    /// reused.
    pub fn should_defer(
        &self,
        bucket: &Bucket,
        worker_id: &WorkerId,
        candidates: &[WorkerId],
    ) -> bool {
        let histories = self.histories.lock();
        let mut tried = VecSet::default();
        for entry in bucket.test_entries() {
            let id = TestEntryHistoryId::new(bucket, entry.clone());
            if let Some(history) = histories.get(&id) {
                tried.extend(history.workers_already_tried());
            }
        }

        tried.contains(worker_id)
            && candidates
                .iter()
                .any(|candidate| candidate != worker_id && !tried.contains(candidate))
    }
}
