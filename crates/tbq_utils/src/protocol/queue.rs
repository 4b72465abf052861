//! The contract between the queue and the workers leasing from it.

use std::{collections::BTreeMap, num::NonZeroUsize, time::Duration};

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

use super::{
    bucket::{Bucket, BucketId, TestName},
    entity::WorkerId,
};

/// Configuration a worker receives when it registers with the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfiguration {
    /// How many buckets the worker may run at once.
    pub number_of_slots: NonZeroUsize,
    /// How often the worker must heartbeat to be considered alive.
    pub heartbeat_interval: Duration,
}

impl Default for WorkerConfiguration {
    fn default() -> Self {
        Self {
            number_of_slots: NonZeroUsize::MIN,
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

/// The answer to a worker asking for work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum BucketFetchResult {
    Bucket(Bucket),
    /// Every job queue is depleted; the worker can stop polling.
    QueueIsEmpty,
    /// No bucket is available for this worker right now, but more may appear (e.g. from retries
    /// or reaping). Ask again after the given interval.
    CheckAgainLater(Duration),
}

/// A worker request that was refused because of the worker's aliveness state.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerRejection {
    #[error("worker {0} is not registered")]
    WorkerNotRegistered(WorkerId),
    #[error("worker {0} is blocked")]
    WorkerBlocked(WorkerId),
}

impl WorkerRejection {
    /// Whether the worker can recover by registering again.
    pub fn should_reregister(&self) -> bool {
        matches!(self, WorkerRejection::WorkerNotRegistered(..))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcceptError {
    /// The bucket is not leased to the submitting worker; e.g. the worker was reaped and the
    /// bucket handed to someone else, or the result was already accepted.
    #[error("bucket {bucket_id} is not leased to worker {worker_id}")]
    UnexpectedBucketId {
        bucket_id: BucketId,
        worker_id: WorkerId,
    },
}

/// Point-in-time summary of queue occupancy, for progress reporting. Never a source of truth.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningQueueState {
    pub enqueued_bucket_count: usize,
    pub enqueued_tests: Vec<TestName>,
    pub dequeued_bucket_count: usize,
    pub dequeued_tests: BTreeMap<WorkerId, Vec<TestName>>,
}

impl RunningQueueState {
    pub fn is_depleted(&self) -> bool {
        self.enqueued_bucket_count == 0 && self.dequeued_bucket_count == 0
    }

    /// Merges the state of several queues, e.g. across all jobs.
    pub fn merged(states: impl IntoIterator<Item = RunningQueueState>) -> Self {
        let mut merged = Self::default();
        for state in states {
            merged.enqueued_bucket_count += state.enqueued_bucket_count;
            merged.enqueued_tests.extend(state.enqueued_tests);
            merged.dequeued_bucket_count += state.dequeued_bucket_count;
            for (worker_id, tests) in state.dequeued_tests {
                merged.dequeued_tests.entry(worker_id).or_default().extend(tests);
            }
        }
        merged
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum JobState {
    Running(RunningQueueState),
    Deleted,
}
