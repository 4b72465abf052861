//! A worker process's main loop: register with the queue, keep heartbeating, and run buckets
//! from the queue until it is empty.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tbq_utils::{
    decay::ExpDecay,
    protocol::{
        bucket::{Bucket, BucketId},
        capabilities::WorkerCapabilities,
        entity::WorkerId,
        queue::{BucketFetchResult, WorkerConfiguration},
        results::TestingResult,
    },
    retry::retry_with_backoff,
    shutdown::ShutdownManager,
    timeout_future::TimeoutFuture,
};
use thiserror::Error;

use crate::{
    client::{ClientError, QueueClient},
    executor::TestExecutor,
    processing::ProcessingTracker,
    scheduler::{Scheduler, SchedulerConfig, SchedulerDataSource, SchedulerDelegate},
};

#[derive(Debug, Clone)]
pub struct DistWorkerConfig {
    pub worker_id: WorkerId,
    pub capabilities: WorkerCapabilities,
    pub host_name: String,
    /// Bound on every single request to the queue.
    pub request_timeout: Duration,
    /// Backoff between attempts to reach a queue that is unreachable.
    pub reconnect_backoff: ExpDecay,
    /// Consecutive failures to fetch a bucket after which the worker gives up.
    pub max_fetch_failures: usize,
    pub registration_attempts: usize,
    pub result_submission_attempts: usize,
    pub result_submission_delay: Duration,
}

impl DistWorkerConfig {
    pub fn new(worker_id: WorkerId, capabilities: WorkerCapabilities) -> Self {
        Self {
            host_name: worker_id.to_string(),
            worker_id,
            capabilities,
            request_timeout: Duration::from_secs(30),
            reconnect_backoff: ExpDecay::quadratic(
                Duration::from_millis(500),
                Duration::from_secs(30),
            ),
            max_fetch_failures: 10,
            registration_attempts: 5,
            result_submission_attempts: 5,
            result_submission_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Error)]
pub enum DistWorkerError {
    #[error("failed to register with the queue: {0}")]
    Registration(#[source] ClientError),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DistWorkerExit {
    /// Buckets whose results the queue accepted.
    pub buckets_completed: usize,
    /// Buckets whose results could not be delivered, or were refused.
    pub buckets_unreported: usize,
}

pub struct DistWorker {
    config: DistWorkerConfig,
    client: Arc<dyn QueueClient>,
    executor: Arc<dyn TestExecutor>,
    processing: ProcessingTracker,
    shutdown: ShutdownManager,
    buckets_completed: AtomicUsize,
    buckets_unreported: AtomicUsize,
}

impl DistWorker {
    pub fn new(
        config: DistWorkerConfig,
        client: Arc<dyn QueueClient>,
        executor: Arc<dyn TestExecutor>,
    ) -> Self {
        Self {
            config,
            client,
            executor,
            processing: Default::default(),
            shutdown: Default::default(),
            buckets_completed: AtomicUsize::new(0),
            buckets_unreported: AtomicUsize::new(0),
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.config.worker_id
    }

    /// Stops fetching, and cancels every bucket in flight. Their results are not reported;
    /// the queue reclaims them once this worker goes silent.
    pub fn shutdown(&self) {
        self.shutdown.shutdown_immediately();
    }

    /// Buckets fetched but not yet reported.
    pub fn buckets_in_flight(&self) -> Vec<BucketId> {
        self.processing.bucket_ids()
    }

    /// Runs until the queue is empty, the worker is shut down or blocked, or the queue cannot be
    /// reached.
    pub async fn run(&self) -> Result<DistWorkerExit, DistWorkerError> {
        let configuration = self.register().await.map_err(DistWorkerError::Registration)?;
        tracing::info!(
            worker_id=?self.config.worker_id,
            slots=configuration.number_of_slots.get(),
            "worker registered"
        );

        let scheduler = Scheduler::new(
            Arc::clone(&self.executor),
            SchedulerConfig {
                number_of_slots: configuration.number_of_slots,
                host_name: self.config.host_name.clone(),
            },
        );
        let stop_heartbeat = ShutdownManager::default();

        let work = async {
            let running = scheduler.run(self, self);
            tokio::pin!(running);

            let mut shutdown = self.shutdown.add_receiver();
            tokio::select! {
                _ = &mut running => {}
                _ = shutdown.recv_shutdown() => {
                    let worker_id = &self.config.worker_id;
                    tracing::info!(?worker_id, "cancelling buckets in flight");
                    tokio::join!(scheduler.cancel(), &mut running);
                }
            }
            stop_heartbeat.shutdown_immediately();
        };

        tokio::join!(
            work,
            self.heartbeat_loop(configuration.heartbeat_interval, &stop_heartbeat)
        );

        let exit = DistWorkerExit {
            buckets_completed: self.buckets_completed.load(Ordering::SeqCst),
            buckets_unreported: self.buckets_unreported.load(Ordering::SeqCst),
        };
        tracing::info!(worker_id=?self.config.worker_id, ?exit, "worker finished");
        Ok(exit)
    }

    async fn register(&self) -> Result<WorkerConfiguration, ClientError> {
        let DistWorkerConfig {
            worker_id,
            capabilities,
            request_timeout,
            ..
        } = &self.config;

        retry_with_backoff(
            self.config.registration_attempts,
            self.config.reconnect_backoff,
            ClientError::is_transient,
            |_| async move {
                TimeoutFuture::new(self.client.register(worker_id, capabilities), *request_timeout)
                    .wait()
                    .await
                    .map_err(ClientError::from)
                    .and_then(|registered| registered)
            },
        )
        .await
    }

    /// Recovers from a rejection saying this worker is not registered. A worker that only went
    /// silent can come back with a heartbeat; one whose buckets were reclaimed must register.
    async fn recover_registration(&self) -> Result<(), ClientError> {
        if self.heartbeat().await.is_ok() {
            return Ok(());
        }
        tracing::warn!(worker_id=?self.config.worker_id, "registering again");
        self.register().await.map(|_| ())
    }

    async fn heartbeat(&self) -> Result<(), ClientError> {
        let in_flight = self.processing.bucket_ids();
        TimeoutFuture::new(
            self.client.heartbeat(&self.config.worker_id, &in_flight),
            self.config.request_timeout,
        )
        .wait()
        .await?
    }

    async fn heartbeat_loop(&self, interval: Duration, stop: &ShutdownManager) {
        let worker_id = &self.config.worker_id;
        let mut stop = stop.add_receiver();
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately; registration just proved we are alive.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = stop.recv_shutdown() => break,
                _ = ticker.tick() => {}
            }

            match self.heartbeat().await {
                Ok(()) => {}
                Err(ClientError::Rejected(rejection)) if rejection.should_reregister() => {
                    tracing::warn!(?worker_id, %rejection, "heartbeat rejected");
                    if let Err(error) = self.register().await {
                        tracing::warn!(?worker_id, %error, "failed to register again");
                    }
                }
                Err(ClientError::Rejected(rejection)) => {
                    tracing::error!(?worker_id, %rejection, "worker was blocked");
                    self.shutdown();
                }
                Err(error) => {
                    tracing::warn!(?worker_id, %error, "failed to heartbeat");
                }
            }
        }
    }

    async fn fetch_bucket(&self) -> Result<BucketFetchResult, ClientError> {
        let DistWorkerConfig {
            worker_id,
            capabilities,
            request_timeout,
            ..
        } = &self.config;
        TimeoutFuture::new(self.client.fetch_bucket(worker_id, capabilities), *request_timeout)
            .wait()
            .await?
    }

    async fn submit(&self, result: TestingResult) -> Result<BucketId, ClientError> {
        let DistWorkerConfig {
            worker_id,
            request_timeout,
            ..
        } = &self.config;
        TimeoutFuture::new(self.client.send_result(worker_id, result), *request_timeout)
            .wait()
            .await?
    }
}

#[async_trait]
impl SchedulerDataSource for DistWorker {
    async fn next_bucket(&self) -> Option<Bucket> {
        let worker_id = &self.config.worker_id;
        let mut backoff = self.config.reconnect_backoff;
        let mut failures = 0;
        let mut shutdown = self.shutdown.add_receiver();

        loop {
            if shutdown.is_shutdown() {
                return None;
            }

            let wait = match self.fetch_bucket().await {
                Ok(BucketFetchResult::Bucket(bucket)) => {
                    tracing::debug!(?worker_id, bucket_id=?bucket.bucket_id(), "fetched bucket");
                    self.processing.will_process(bucket.bucket_id());
                    return Some(bucket);
                }
                Ok(BucketFetchResult::QueueIsEmpty) => {
                    tracing::info!(?worker_id, "queue is empty");
                    return None;
                }
                Ok(BucketFetchResult::CheckAgainLater(after)) => {
                    failures = 0;
                    backoff.reset();
                    after
                }
                Err(ClientError::Rejected(rejection)) if rejection.should_reregister() => {
                    tracing::warn!(?worker_id, %rejection, "fetch rejected");
                    match self.recover_registration().await {
                        Ok(()) => continue,
                        Err(error) => {
                            tracing::warn!(?worker_id, %error, "failed to recover registration");
                            failures += 1;
                            backoff.next_duration()
                        }
                    }
                }
                Err(ClientError::Rejected(rejection)) => {
                    tracing::error!(?worker_id, %rejection, "worker was blocked");
                    self.shutdown();
                    return None;
                }
                Err(error) => {
                    tracing::warn!(?worker_id, %error, failures, "failed to fetch bucket");
                    failures += 1;
                    backoff.next_duration()
                }
            };

            if failures >= self.config.max_fetch_failures {
                tracing::error!(?worker_id, failures, "giving up on reaching the queue");
                return None;
            }

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.recv_shutdown() => return None,
            }
        }
    }
}

#[async_trait]
impl SchedulerDelegate for DistWorker {
    async fn bucket_completed(&self, bucket: Bucket, result: TestingResult) {
        let worker_id = &self.config.worker_id;
        let bucket_id = bucket.bucket_id().clone();

        if self.shutdown.is_shutdown() {
            tracing::info!(?worker_id, ?bucket_id, "not reporting bucket of cancelled run");
            self.buckets_unreported.fetch_add(1, Ordering::SeqCst);
            self.processing.did_process(&bucket_id);
            return;
        }

        let submitted = retry_with_backoff(
            self.config.result_submission_attempts,
            ExpDecay::constant(self.config.result_submission_delay),
            ClientError::is_transient,
            |_| self.submit(result.clone()),
        )
        .await;

        match submitted {
            Ok(acked) if acked == bucket_id => {
                tracing::debug!(?worker_id, ?bucket_id, "result accepted");
                self.buckets_completed.fetch_add(1, Ordering::SeqCst);
            }
            Ok(acked) => {
                tracing::error!(
                    ?worker_id,
                    ?bucket_id,
                    ?acked,
                    "queue acknowledged a different bucket"
                );
                self.buckets_unreported.fetch_add(1, Ordering::SeqCst);
            }
            Err(error) => {
                tracing::warn!(?worker_id, ?bucket_id, %error, "failed to report result");
                self.buckets_unreported.fetch_add(1, Ordering::SeqCst);
            }
        }
        self.processing.did_process(&bucket_id);
    }
}
