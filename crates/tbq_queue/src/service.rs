//! The worker-facing request layer. Owns one [BucketQueue] per job and the aliveness state
//! shared by all of them.

use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tbq_utils::protocol::{
    bucket::{BucketId, TestEntryConfiguration},
    capabilities::WorkerCapabilities,
    entity::{JobId, JobPriority, WorkerId},
    queue::{
        AcceptError, BucketFetchResult, JobState, RunningQueueState, WorkerConfiguration,
        WorkerRejection,
    },
    results::TestingResult,
};
use tbq_utils::shutdown::ShutdownReceiver;
use tbq_workers::client::{ClientError, QueueClient};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::{
    aliveness::{WorkerAliveness, WorkerAlivenessTracker},
    config::QueueServerConfiguration,
    queue::{BucketQueue, EnqueueError},
    reaper,
    splitter::BucketSplitter,
};

/// Completion events buffered per subscriber before the slowest one starts missing events.
const COMPLETION_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum QueueServiceError {
    #[error("job {0} does not exist")]
    JobNotFound(JobId),
    #[error("job {0} was deleted")]
    JobDeleted(JobId),
    #[error(transparent)]
    Enqueue(#[from] EnqueueError),
    #[error(transparent)]
    Rejected(#[from] WorkerRejection),
    #[error(transparent)]
    Accept(#[from] AcceptError),
}

/// Emitted for every bucket result the queue accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketCompletion {
    pub job_id: JobId,
    pub bucket_id: BucketId,
    pub worker_id: WorkerId,
    /// Final outcomes in the accepted result.
    pub succeeded: usize,
    pub failed: usize,
    /// Buckets enqueued to retry failures of this one.
    pub requeued_bucket_ids: Vec<BucketId>,
}

struct Job {
    job_id: JobId,
    priority: JobPriority,
    queue: BucketQueue,
    results: Mutex<Vec<TestingResult>>,
}

#[derive(Default)]
struct Jobs {
    /// Ordered by priority, highest first; jobs of equal priority by age, oldest first.
    active: Vec<Arc<Job>>,
    deleted: HashSet<JobId>,
}

impl Jobs {
    fn get(&self, job_id: &JobId) -> Option<&Arc<Job>> {
        self.active.iter().find(|job| &job.job_id == job_id)
    }

    fn missing(&self, job_id: &JobId) -> QueueServiceError {
        if self.deleted.contains(job_id) {
            QueueServiceError::JobDeleted(job_id.clone())
        } else {
            QueueServiceError::JobNotFound(job_id.clone())
        }
    }
}

pub struct QueueService {
    configuration: QueueServerConfiguration,
    aliveness: Arc<WorkerAlivenessTracker>,
    splitter: BucketSplitter,
    /// Held for reading by every per-job operation; for writing only to add or remove jobs.
    jobs: RwLock<Jobs>,
    completions: broadcast::Sender<BucketCompletion>,
}

impl QueueService {
    pub fn new(configuration: QueueServerConfiguration) -> Self {
        let aliveness = Arc::new(WorkerAlivenessTracker::new(
            configuration.worker_silence_timeout(),
        ));
        let splitter =
            BucketSplitter::new(configuration.schedule_strategy, configuration.split_info());
        let (completions, _) = broadcast::channel(COMPLETION_CHANNEL_CAPACITY);

        Self {
            configuration,
            aliveness,
            splitter,
            jobs: Default::default(),
            completions,
        }
    }

    pub fn configuration(&self) -> &QueueServerConfiguration {
        &self.configuration
    }

    /// Registers a worker, returning the configuration it should run with. Buckets the worker
    /// held from before are put back on the queue.
    pub fn register(
        &self,
        worker_id: &WorkerId,
        capabilities: WorkerCapabilities,
        address: Option<SocketAddr>,
    ) -> Result<WorkerConfiguration, WorkerRejection> {
        let registration = self
            .aliveness
            .register(worker_id, capabilities, address, Instant::now())?;

        if !registration.stale_bucket_ids.is_empty() {
            let jobs = self.jobs.read();
            let requeued: Vec<_> = jobs
                .active
                .iter()
                .flat_map(|job| job.queue.requeue_leases(worker_id, &registration.stale_bucket_ids))
                .collect();
            tracing::info!(?worker_id, ?requeued, "requeued buckets held before registration");
        }

        Ok(self.configuration.worker_configuration(worker_id))
    }

    /// Keeps the worker alive, and puts back on the queue every lease it has stopped reporting
    /// in `bucket_ids_in_flight`.
    pub fn heartbeat(
        &self,
        worker_id: &WorkerId,
        bucket_ids_in_flight: &[BucketId],
    ) -> Result<(), WorkerRejection> {
        self.aliveness.heartbeat(worker_id, Instant::now())?;
        tracing::debug!(?worker_id, in_flight = bucket_ids_in_flight.len(), "heartbeat");

        let lost = self.aliveness.reconcile_leases(worker_id, bucket_ids_in_flight);
        if !lost.is_empty() {
            let jobs = self.jobs.read();
            let requeued: Vec<_> = jobs
                .active
                .iter()
                .flat_map(|job| job.queue.requeue_leases(worker_id, &lost))
                .collect();
            tracing::info!(?worker_id, ?requeued, "requeued buckets the worker no longer reports");
        }

        Ok(())
    }

    /// Bans a worker, putting the buckets it holds back on the queue.
    pub fn block_worker(&self, worker_id: &WorkerId) -> Vec<BucketId> {
        self.aliveness.block(worker_id);
        self.reap_dead_workers()
    }

    /// Leases a bucket from the highest-priority job that has one the worker can run.
    pub fn fetch_bucket(
        &self,
        worker_id: &WorkerId,
        capabilities: &WorkerCapabilities,
    ) -> Result<BucketFetchResult, WorkerRejection> {
        self.aliveness.ensure_alive(worker_id)?;

        let jobs = self.jobs.read();
        for job in &jobs.active {
            if let Some(dequeued) = job.queue.dequeue_bucket(worker_id, capabilities)? {
                tracing::info!(
                    job_id=?job.job_id,
                    ?worker_id,
                    bucket_id=?dequeued.bucket().bucket_id(),
                    "handing out bucket"
                );
                return Ok(BucketFetchResult::Bucket(dequeued.enqueued_bucket.bucket));
            }
        }

        if jobs.active.iter().all(|job| job.queue.is_depleted()) {
            Ok(BucketFetchResult::QueueIsEmpty)
        } else {
            Ok(BucketFetchResult::CheckAgainLater(
                self.configuration.check_again_time_interval(),
            ))
        }
    }

    /// Accepts a worker's result, returning the id of the bucket it was accepted for.
    pub fn accept_result(
        &self,
        worker_id: &WorkerId,
        result: TestingResult,
    ) -> Result<BucketId, QueueServiceError> {
        let bucket_id = result.bucket_id.clone();
        let jobs = self.jobs.read();

        let job = match jobs.active.iter().find(|job| job.queue.holds(&bucket_id)) {
            Some(job) => job,
            None => {
                tracing::warn!(?bucket_id, ?worker_id, "result for bucket of no known job");
                return Err(AcceptError::UnexpectedBucketId {
                    bucket_id,
                    worker_id: worker_id.clone(),
                }
                .into());
            }
        };

        let accepted = job.queue.accept(result, worker_id)?;
        let completion = BucketCompletion {
            job_id: job.job_id.clone(),
            bucket_id: bucket_id.clone(),
            worker_id: worker_id.clone(),
            succeeded: accepted.testing_result.successful_tests().count(),
            failed: accepted.testing_result.failed_tests().count(),
            requeued_bucket_ids: accepted.requeued_bucket_ids,
        };
        job.results.lock().push(accepted.testing_result);

        // Nobody listening is fine.
        let _ = self.completions.send(completion);

        Ok(bucket_id)
    }

    /// Splits the entries into buckets and enqueues them for the job, creating the job if it is
    /// new. A job keeps the priority it was created with.
    pub fn schedule_tests(
        &self,
        job_id: &JobId,
        priority: JobPriority,
        configurations: Vec<TestEntryConfiguration>,
    ) -> Result<Vec<BucketId>, QueueServiceError> {
        let buckets = self.splitter.split(configurations);
        let bucket_ids: Vec<_> = buckets.iter().map(|b| b.bucket_id().clone()).collect();

        let mut jobs = self.jobs.write();
        if jobs.deleted.contains(job_id) {
            return Err(QueueServiceError::JobDeleted(job_id.clone()));
        }

        let job = match jobs.get(job_id) {
            Some(job) => Arc::clone(job),
            None => {
                let job = Arc::new(Job {
                    job_id: job_id.clone(),
                    priority,
                    queue: BucketQueue::new(Arc::clone(&self.aliveness), self.splitter),
                    results: Default::default(),
                });
                let position = jobs
                    .active
                    .iter()
                    .position(|existing| existing.priority < priority)
                    .unwrap_or(jobs.active.len());
                jobs.active.insert(position, Arc::clone(&job));
                tracing::info!(?job_id, ?priority, "created job");
                job
            }
        };

        job.queue.enqueue(buckets)?;
        tracing::info!(?job_id, buckets = bucket_ids.len(), "scheduled tests");
        Ok(bucket_ids)
    }

    pub fn job_state(&self, job_id: &JobId) -> Result<JobState, QueueServiceError> {
        let jobs = self.jobs.read();
        match jobs.get(job_id) {
            Some(job) => Ok(JobState::Running(job.queue.running_queue_state())),
            None if jobs.deleted.contains(job_id) => Ok(JobState::Deleted),
            None => Err(QueueServiceError::JobNotFound(job_id.clone())),
        }
    }

    /// Final results accepted for the job so far, in order of acceptance.
    pub fn job_results(&self, job_id: &JobId) -> Result<Vec<TestingResult>, QueueServiceError> {
        let jobs = self.jobs.read();
        match jobs.get(job_id) {
            Some(job) => Ok(job.results.lock().clone()),
            None => Err(jobs.missing(job_id)),
        }
    }

    /// Drops the job and all its buckets. Results submitted for them afterwards are rejected.
    pub fn delete_job(&self, job_id: &JobId) -> Result<(), QueueServiceError> {
        let mut jobs = self.jobs.write();
        let position = match jobs.active.iter().position(|job| &job.job_id == job_id) {
            Some(position) => position,
            None if jobs.deleted.contains(job_id) => return Ok(()),
            None => return Err(QueueServiceError::JobNotFound(job_id.clone())),
        };

        let job = jobs.active.remove(position);
        let released = job.queue.remove_all();
        jobs.deleted.insert(job_id.clone());

        tracing::info!(?job_id, leases_released = released.len(), "deleted job");
        Ok(())
    }

    /// The state of every running job, merged.
    pub fn running_queue_state(&self) -> RunningQueueState {
        RunningQueueState::merged(
            self.jobs
                .read()
                .active
                .iter()
                .map(|job| job.queue.running_queue_state()),
        )
    }

    pub fn is_depleted(&self) -> bool {
        self.jobs
            .read()
            .active
            .iter()
            .all(|job| job.queue.is_depleted())
    }

    pub fn aliveness_for_all_workers(&self) -> BTreeMap<WorkerId, WorkerAliveness> {
        self.aliveness.aliveness_for_all_workers()
    }

    pub fn reap_dead_workers(&self) -> Vec<BucketId> {
        self.reap_dead_workers_at(Instant::now())
    }

    /// Puts every bucket held by a silent or blocked worker back on its job's queue. Returns the
    /// requeued bucket ids.
    pub fn reap_dead_workers_at(&self, now: Instant) -> Vec<BucketId> {
        let reaped = self.aliveness.reap(now);
        if reaped.is_empty() {
            return Vec::new();
        }

        let jobs = self.jobs.read();
        let mut requeued = Vec::new();
        for worker in reaped {
            for job in &jobs.active {
                requeued.extend(job.queue.requeue_leases(&worker.worker_id, &worker.bucket_ids));
            }
        }
        requeued
    }

    /// Reaps dead workers every [reap interval][QueueServerConfiguration::reap_interval] until
    /// `shutdown` fires.
    pub fn spawn_reaper(self: &Arc<Self>, shutdown: ShutdownReceiver) -> JoinHandle<()> {
        reaper::spawn_reaper(Arc::clone(self), self.configuration.reap_interval(), shutdown)
    }

    pub fn subscribe_completions(&self) -> broadcast::Receiver<BucketCompletion> {
        self.completions.subscribe()
    }
}

/// Lets workers in the same process talk to the queue directly.
#[async_trait]
impl QueueClient for QueueService {
    async fn register(
        &self,
        worker_id: &WorkerId,
        capabilities: &WorkerCapabilities,
    ) -> Result<WorkerConfiguration, ClientError> {
        Ok(QueueService::register(self, worker_id, capabilities.clone(), None)?)
    }

    async fn heartbeat(
        &self,
        worker_id: &WorkerId,
        bucket_ids_in_flight: &[BucketId],
    ) -> Result<(), ClientError> {
        Ok(QueueService::heartbeat(self, worker_id, bucket_ids_in_flight)?)
    }

    async fn fetch_bucket(
        &self,
        worker_id: &WorkerId,
        capabilities: &WorkerCapabilities,
    ) -> Result<BucketFetchResult, ClientError> {
        Ok(QueueService::fetch_bucket(self, worker_id, capabilities)?)
    }

    async fn send_result(
        &self,
        worker_id: &WorkerId,
        result: TestingResult,
    ) -> Result<BucketId, ClientError> {
        self.accept_result(worker_id, result).map_err(|error| match error {
            QueueServiceError::Accept(error) => error.into(),
            QueueServiceError::Rejected(rejection) => rejection.into(),
            other => ClientError::Transport(other.to_string()),
        })
    }
}
