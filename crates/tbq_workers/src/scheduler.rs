//! Runs leased buckets under a bounded number of execution slots, retrying failures locally when
//! a bucket asks for it, and merging attempts into one result per bucket.

use std::any::Any;
use std::num::NonZeroUsize;
use std::panic;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tbq_utils::{
    illegal_state,
    protocol::{
        bucket::{Bucket, BucketId, BucketPayload, TestEntry, TestTimeoutConfiguration},
        results::{SyntheticFailure, TestEntryResult, TestRunResult, TestingResult},
    },
    shutdown::ShutdownManager,
    time::EpochMillis,
};
use tokio::{sync::Semaphore, time::Instant};

use crate::executor::{ExecutionEvent, ExecutionRequest, ExecutionSink, TestExecutor};

/// Supplies buckets to a [Scheduler].
#[async_trait]
pub trait SchedulerDataSource: Send + Sync {
    /// The next bucket to run, or `None` once no more work will come.
    async fn next_bucket(&self) -> Option<Bucket>;
}

/// Receives the result of every bucket a [Scheduler] ran.
#[async_trait]
pub trait SchedulerDelegate: Send + Sync {
    async fn bucket_completed(&self, bucket: Bucket, result: TestingResult);
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of attempts that may execute at once.
    pub number_of_slots: NonZeroUsize,
    /// Attached to results the scheduler makes up for entries that produced none.
    pub host_name: String,
}

pub struct Scheduler {
    executor: Arc<dyn TestExecutor>,
    permits: Arc<Semaphore>,
    number_of_slots: NonZeroUsize,
    host_name: String,
    shutdown: ShutdownManager,
}

/// How an attempt ended.
#[derive(Debug)]
enum AttemptEnd {
    /// The executor returned normally.
    Completed,
    Failed(String),
    TestTimedOut(TestEntry),
    RunnerSilent,
    Cancelled,
}

impl Scheduler {
    pub fn new(executor: Arc<dyn TestExecutor>, config: SchedulerConfig) -> Self {
        let SchedulerConfig {
            number_of_slots,
            host_name,
        } = config;

        Self {
            executor,
            permits: Arc::new(Semaphore::new(number_of_slots.get())),
            number_of_slots,
            host_name,
            shutdown: Default::default(),
        }
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn is_cancelled(&self) -> bool {
        self.shutdown.is_shutdown()
    }

    /// Pulls and runs buckets, one per slot at a time, until the source runs dry or the
    /// scheduler is cancelled.
    ///
    /// A slot only asks for its next bucket once it has reported the previous one, so fetching
    /// is deferred while every slot is busy.
    pub async fn run(&self, source: &dyn SchedulerDataSource, delegate: &dyn SchedulerDelegate) {
        let slots =
            (0..self.number_of_slots.get()).map(|slot| self.run_slot(slot, source, delegate));
        futures::future::join_all(slots).await;
    }

    async fn run_slot(
        &self,
        slot: usize,
        source: &dyn SchedulerDataSource,
        delegate: &dyn SchedulerDelegate,
    ) {
        while !self.is_cancelled() {
            let bucket = match source.next_bucket().await {
                Some(bucket) => bucket,
                None => break,
            };
            tracing::debug!(slot, bucket_id=?bucket.bucket_id(), "running bucket");
            let result = self.run_retrying(&bucket).await;
            delegate.bucket_completed(bucket, result).await;
        }
        tracing::debug!(slot, "scheduler slot finished");
    }

    /// Runs every entry of the bucket once, then reruns failures locally as many times as the
    /// bucket's execution behavior grants, stopping as soon as an attempt has no failures.
    ///
    /// Always yields a result covering every entry of the bucket.
    pub async fn run_retrying(&self, bucket: &Bucket) -> TestingResult {
        let first_run = self.run_attempt(bucket, bucket.test_entries().to_vec()).await;

        let local_retries = bucket.payload().test_execution_behavior().local_retries();
        if local_retries == 0 {
            return first_run;
        }

        let mut attempts = vec![first_run];
        for retry in 1..=local_retries {
            let failed: Vec<TestEntry> = match attempts.last() {
                Some(last) => last.failed_tests().map(|r| r.test_entry.clone()).collect(),
                None => break,
            };
            if failed.is_empty() || self.is_cancelled() {
                break;
            }

            tracing::info!(
                bucket_id=?bucket.bucket_id(),
                retry,
                failed = failed.len(),
                "retrying failed tests locally"
            );
            attempts.push(self.run_attempt(bucket, failed).await);
        }

        match TestingResult::combine(attempts) {
            Ok(result) => result,
            Err(error) => {
                illegal_state!("attempts of one bucket could not be combined", %error);
                TestingResult::new(bucket.bucket_id().clone(), Vec::new())
            }
        }
    }

    /// Runs the given entries once, holding one execution permit for the duration.
    async fn run_attempt(&self, bucket: &Bucket, test_entries: Vec<TestEntry>) -> TestingResult {
        let BucketPayload::RunTests(payload) = bucket.payload();
        let bucket_id = bucket.bucket_id().clone();
        let start_time = EpochMillis::now();
        let mut shutdown = self.shutdown.add_receiver();

        let mut monitor = AttemptMonitor::new(
            test_entries.clone(),
            payload.test_timeout_configuration,
            Instant::now(),
        );

        let permit = tokio::select! {
            permit = self.permits.clone().acquire_owned() => permit.ok(),
            _ = shutdown.recv_shutdown() => None,
        };
        let permit = match permit {
            Some(permit) => permit,
            None => {
                return monitor.finish(AttemptEnd::Cancelled, bucket_id, &self.host_name, start_time)
            }
        };

        let request = ExecutionRequest {
            bucket_id: bucket_id.clone(),
            test_entries,
            environment: payload.test_execution_behavior.environment.clone(),
            timeouts: payload.test_timeout_configuration,
        };
        let (sink, mut events) = ExecutionSink::channel();
        let executor = Arc::clone(&self.executor);

        monitor.restart_clock(Instant::now());
        let end = {
            let execution =
                panic::AssertUnwindSafe(async move { executor.execute(request, sink).await })
                    .catch_unwind();
            tokio::pin!(execution);

            loop {
                let deadline = monitor.deadline();
                tokio::select! {
                    biased;

                    _ = shutdown.recv_shutdown() => break AttemptEnd::Cancelled,
                    Some(event) = events.recv() => monitor.observe(event, Instant::now()),
                    outcome = &mut execution => {
                        while let Ok(event) = events.try_recv() {
                            monitor.observe(event, Instant::now());
                        }
                        break match outcome {
                            Ok(Ok(())) => AttemptEnd::Completed,
                            Ok(Err(error)) => AttemptEnd::Failed(error.to_string()),
                            Err(panic) => AttemptEnd::Failed(format!(
                                "executor panicked: {}",
                                panic_message(&panic)
                            )),
                        };
                    }
                    _ = tokio::time::sleep_until(deadline) => {
                        break monitor.timed_out(Instant::now());
                    }
                }
            }
            // Dropping the execution here tears down whatever it still runs.
        };
        events.close();
        drop(permit);

        match &end {
            AttemptEnd::Completed => {}
            AttemptEnd::Cancelled => tracing::info!(?bucket_id, "attempt cancelled"),
            other => tracing::warn!(?bucket_id, end=?other, "attempt ended abnormally"),
        }

        monitor.finish(end, bucket_id, &self.host_name, start_time)
    }

    /// Cancels everything the scheduler runs. Returns once every execution permit is back,
    /// that is once every in-flight attempt was torn down. No new attempts start afterwards.
    pub async fn cancel(&self) {
        self.shutdown.shutdown_immediately();

        let slots = u32::try_from(self.number_of_slots.get()).unwrap_or(u32::MAX);
        if let Ok(permits) = self.permits.acquire_many(slots).await {
            permits.forget();
            self.permits.close();
        }
        tracing::debug!("scheduler cancelled");
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

/// Watches the events of one attempt for progress and timeouts.
struct AttemptMonitor {
    test_entries: Vec<TestEntry>,
    timeouts: TestTimeoutConfiguration,
    finished: Vec<(TestEntry, TestRunResult)>,
    running: Option<(TestEntry, Instant)>,
    last_activity: Instant,
}

impl AttemptMonitor {
    fn new(test_entries: Vec<TestEntry>, timeouts: TestTimeoutConfiguration, now: Instant) -> Self {
        Self {
            test_entries,
            timeouts,
            finished: Vec::new(),
            running: None,
            last_activity: now,
        }
    }

    fn restart_clock(&mut self, now: Instant) {
        self.last_activity = now;
    }

    fn observe(&mut self, event: ExecutionEvent, now: Instant) {
        self.last_activity = now;
        match event {
            ExecutionEvent::TestStarted(entry) => {
                if !self.test_entries.contains(&entry) {
                    tracing::warn!(test_name=%entry.test_name, "executor started unrequested test");
                }
                self.running = Some((entry, now));
            }
            ExecutionEvent::Output(_) => {}
            ExecutionEvent::TestFinished(entry, result) => {
                if matches!(&self.running, Some((running, _)) if running == &entry) {
                    self.running = None;
                }
                if self.test_entries.contains(&entry) {
                    self.finished.push((entry, result));
                } else {
                    let test_name = &entry.test_name;
                    tracing::warn!(%test_name, "dropping result of unrequested test");
                }
            }
        }
    }

    fn deadline(&self) -> Instant {
        let silence = self.last_activity + self.timeouts.runner_maximum_silence_duration;
        match &self.running {
            Some((_, started)) => {
                silence.min(*started + self.timeouts.single_test_maximum_duration)
            }
            None => silence,
        }
    }

    fn timed_out(&self, now: Instant) -> AttemptEnd {
        match &self.running {
            Some((entry, started))
                if now >= *started + self.timeouts.single_test_maximum_duration =>
            {
                AttemptEnd::TestTimedOut(entry.clone())
            }
            _ => AttemptEnd::RunnerSilent,
        }
    }

    fn synthetic_failure(&self, end: &AttemptEnd, entry: &TestEntry) -> SyntheticFailure {
        let silence: Duration = self.timeouts.runner_maximum_silence_duration;
        match end {
            AttemptEnd::Completed => SyntheticFailure::NoResult,
            AttemptEnd::Failed(reason) => SyntheticFailure::ExecutionFailure(reason.clone()),
            AttemptEnd::TestTimedOut(timed_out) if timed_out == entry => {
                SyntheticFailure::TestTimedOut(self.timeouts.single_test_maximum_duration)
            }
            AttemptEnd::TestTimedOut(_) => SyntheticFailure::NoResult,
            AttemptEnd::RunnerSilent => SyntheticFailure::RunnerSilent(silence),
            AttemptEnd::Cancelled => SyntheticFailure::Cancelled,
        }
    }

    /// One entry result per requested entry, in request order. Entries without a reported
    /// result get a synthetic failure explaining how the attempt ended.
    fn finish(
        mut self,
        end: AttemptEnd,
        bucket_id: BucketId,
        host_name: &str,
        start_time: EpochMillis,
    ) -> TestingResult {
        let test_entries = std::mem::take(&mut self.test_entries);
        let mut results = Vec::with_capacity(test_entries.len());

        for entry in test_entries {
            let mut runs = Vec::new();
            self.finished.retain(|(finished, run)| {
                if finished == &entry {
                    runs.push(run.clone());
                    false
                } else {
                    true
                }
            });
            if runs.is_empty() {
                let failure = self.synthetic_failure(&end, &entry);
                runs.push(TestRunResult::synthetic_failure(&failure, host_name, start_time));
            }
            results.push(TestEntryResult::new(entry, runs));
        }

        TestingResult::new(bucket_id, results)
    }
}
