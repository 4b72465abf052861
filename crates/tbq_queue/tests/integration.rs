//! Workers and the queue, end to end, in one process.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tbq_queue::{
    config::{QueueServerConfiguration, WorkerConfigurationEntry},
    reaper::spawn_reaper,
    service::{QueueService, QueueServiceError},
    splitter::ScheduleStrategy,
};
use tbq_test_utils::{all_passing, configurations, worker};
use tbq_utils::{
    protocol::{
        bucket::{BucketId, TestName, TestRetryMode},
        capabilities::{CapabilityRequirement, WorkerCapabilities},
        entity::{JobId, JobPriority, WorkerId},
        queue::{AcceptError, BucketFetchResult, WorkerConfiguration, WorkerRejection},
        results::TestingResult,
    },
    shutdown::ShutdownManager,
};
use tbq_workers::{
    client::{ClientError, QueueClient},
    dist_worker::{DistWorker, DistWorkerConfig, DistWorkerExit},
    executor::TestExecutor,
    testing::{Scripted, ScriptedExecutor},
};

fn service(configuration: QueueServerConfiguration) -> Arc<QueueService> {
    Arc::new(QueueService::new(configuration))
}

fn unsplit() -> QueueServerConfiguration {
    QueueServerConfiguration {
        schedule_strategy: ScheduleStrategy::Unsplit,
        ..Default::default()
    }
}

fn dist_worker(
    service: &Arc<QueueService>,
    name: &str,
    capabilities: WorkerCapabilities,
    executor: &Arc<ScriptedExecutor>,
) -> DistWorker {
    let executor: Arc<dyn TestExecutor> = executor.clone();
    DistWorker::new(
        DistWorkerConfig::new(worker(name), capabilities),
        service.clone(),
        executor,
    )
}

fn names(names: &[&str]) -> Vec<TestName> {
    names.iter().map(|name| TestName::from(*name)).collect()
}

/// Talks to the queue, except that no result ever arrives. Hands out at most one bucket.
struct LossyClient {
    service: Arc<QueueService>,
    fetches: AtomicUsize,
}

#[async_trait]
impl QueueClient for LossyClient {
    async fn register(
        &self,
        worker_id: &WorkerId,
        capabilities: &WorkerCapabilities,
    ) -> Result<WorkerConfiguration, ClientError> {
        QueueClient::register(&*self.service, worker_id, capabilities).await
    }

    async fn heartbeat(
        &self,
        worker_id: &WorkerId,
        bucket_ids_in_flight: &[BucketId],
    ) -> Result<(), ClientError> {
        QueueClient::heartbeat(&*self.service, worker_id, bucket_ids_in_flight).await
    }

    async fn fetch_bucket(
        &self,
        worker_id: &WorkerId,
        capabilities: &WorkerCapabilities,
    ) -> Result<BucketFetchResult, ClientError> {
        if self.fetches.fetch_add(1, Ordering::SeqCst) > 0 {
            return Ok(BucketFetchResult::CheckAgainLater(Duration::from_millis(50)));
        }
        QueueClient::fetch_bucket(&*self.service, worker_id, capabilities).await
    }

    async fn send_result(
        &self,
        _worker_id: &WorkerId,
        _result: TestingResult,
    ) -> Result<BucketId, ClientError> {
        Err(ClientError::Transport("connection reset".to_owned()))
    }
}

#[tokio::test]
#[ntest::timeout(5000)]
async fn failure_is_retried_through_the_queue() {
    let service = service(unsplit());
    let job = JobId::new("job");
    service
        .schedule_tests(&job, JobPriority::MEDIUM, configurations(&["t1", "t2", "t3"]))
        .unwrap();

    let executor =
        Arc::new(ScriptedExecutor::default().script("t3", [Scripted::Fail("boom".into())]));
    let exit = dist_worker(&service, "w", WorkerCapabilities::new(), &executor)
        .run()
        .await
        .unwrap();

    assert_eq!(
        exit,
        DistWorkerExit {
            buckets_completed: 2,
            buckets_unreported: 0
        }
    );
    assert_eq!(
        executor.executions(),
        vec![names(&["t1", "t2", "t3"]), names(&["t3"])]
    );

    let results = service.job_results(&job).unwrap();
    assert_eq!(results.len(), 2);
    assert!(results[0].result_for(&TestName::from("t3")).is_none());
    let retried = results[1].result_for(&TestName::from("t3")).unwrap();
    assert!(retried.succeeded());
    assert!(results.iter().all(|result| result.failed_tests().count() == 0));
    assert!(service.is_depleted());
}

#[tokio::test]
#[ntest::timeout(5000)]
async fn exhausted_retries_are_reported_as_failures() {
    let service = service(unsplit());
    let job = JobId::new("job");
    service
        .schedule_tests(&job, JobPriority::MEDIUM, configurations(&["flaky"]))
        .unwrap();

    let executor = Arc::new(ScriptedExecutor::default().script(
        "flaky",
        [Scripted::Fail("one".into()), Scripted::Fail("two".into())],
    ));
    dist_worker(&service, "w", WorkerCapabilities::new(), &executor)
        .run()
        .await
        .unwrap();

    // The first result no longer carries the failure it handed back to the queue.
    let results = service.job_results(&job).unwrap();
    assert_eq!(results.len(), 2);
    assert!(results[0].unfiltered_results.is_empty());
    let failed: Vec<_> = results[1].failed_tests().collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].test_name(), &TestName::from("flaky"));
    assert_eq!(failed[0].test_run_results.len(), 1);
    assert!(service.is_depleted());
}

#[tokio::test]
#[ntest::timeout(5000)]
async fn retries_on_worker_never_touch_the_queue() {
    let service = service(unsplit());
    let job = JobId::new("job");
    let mut configs = configurations(&["t"]);
    configs[0].test_execution_behavior.retry_mode = TestRetryMode::RetryOnWorker;
    service.schedule_tests(&job, JobPriority::MEDIUM, configs).unwrap();

    let executor =
        Arc::new(ScriptedExecutor::default().script("t", [Scripted::Fail("boom".into())]));
    let exit = dist_worker(&service, "w", WorkerCapabilities::new(), &executor)
        .run()
        .await
        .unwrap();

    assert_eq!(exit.buckets_completed, 1);
    assert_eq!(executor.executions(), vec![names(&["t"]), names(&["t"])]);

    let results = service.job_results(&job).unwrap();
    assert_eq!(results.len(), 1);
    let entry = results[0].result_for(&TestName::from("t")).unwrap();
    assert_eq!(entry.test_run_results.len(), 2);
    assert!(entry.succeeded());
}

#[tokio::test]
#[ntest::timeout(8000)]
async fn silent_worker_loses_its_bucket_to_another() {
    let service = service(QueueServerConfiguration {
        schedule_strategy: ScheduleStrategy::Unsplit,
        worker_silence_timeout_secs: 1,
        ..Default::default()
    });
    let job = JobId::new("job");
    service
        .schedule_tests(&job, JobPriority::MEDIUM, configurations(&["t"]))
        .unwrap();

    let caps = WorkerCapabilities::new();
    service.register(&worker("a"), caps.clone(), None).unwrap();
    let bucket = match service.fetch_bucket(&worker("a"), &caps).unwrap() {
        BucketFetchResult::Bucket(bucket) => bucket,
        other => panic!("expected a bucket, got {other:?}"),
    };

    let (manager, receiver) = ShutdownManager::new_pair();
    let reaper = spawn_reaper(service.clone(), Duration::from_millis(20), receiver);
    while service.running_queue_state().enqueued_bucket_count == 0 {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let executor = Arc::new(ScriptedExecutor::default());
    let exit = dist_worker(&service, "b", caps.clone(), &executor)
        .run()
        .await
        .unwrap();
    assert_eq!(exit.buckets_completed, 1);

    assert!(matches!(
        service.accept_result(&worker("a"), all_passing(&bucket)),
        Err(QueueServiceError::Accept(AcceptError::UnexpectedBucketId { .. }))
    ));
    assert_eq!(
        service.heartbeat(&worker("a"), &[]),
        Err(WorkerRejection::WorkerNotRegistered(worker("a")))
    );

    let results = service.job_results(&job).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].successful_tests().count(), 1);

    manager.shutdown_immediately();
    reaper.await.unwrap();
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn undelivered_result_is_run_again_by_another_worker() {
    let service = service(QueueServerConfiguration {
        schedule_strategy: ScheduleStrategy::Unsplit,
        default_worker_configuration: WorkerConfigurationEntry {
            heartbeat_interval_secs: 1,
            ..Default::default()
        },
        ..Default::default()
    });
    let job = JobId::new("job");
    service
        .schedule_tests(&job, JobPriority::MEDIUM, configurations(&["t"]))
        .unwrap();

    let executor = Arc::new(ScriptedExecutor::default());
    let lossy = DistWorker::new(
        DistWorkerConfig {
            result_submission_attempts: 1,
            ..DistWorkerConfig::new(worker("lossy"), WorkerCapabilities::new())
        },
        Arc::new(LossyClient {
            service: service.clone(),
            fetches: AtomicUsize::new(0),
        }),
        executor.clone(),
    );

    let rest = async {
        while service.running_queue_state().dequeued_bucket_count == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        // No reaper runs, and the lossy worker keeps heartbeating: only its in-flight
        // reports can free the bucket.
        while service.running_queue_state().enqueued_bucket_count == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let exit = dist_worker(&service, "b", WorkerCapabilities::new(), &executor)
            .run()
            .await
            .unwrap();
        lossy.shutdown();
        exit
    };
    let (lossy_exit, exit) = tokio::join!(lossy.run(), rest);

    assert_eq!(
        lossy_exit.unwrap(),
        DistWorkerExit {
            buckets_completed: 0,
            buckets_unreported: 1
        }
    );
    assert_eq!(exit.buckets_completed, 1);
    assert_eq!(executor.executions(), vec![names(&["t"]), names(&["t"])]);
    assert_eq!(service.job_results(&job).unwrap().len(), 1);
    assert!(service.is_depleted());
}

#[tokio::test]
#[ntest::timeout(5000)]
async fn buckets_only_go_to_capable_workers() {
    let service = service(unsplit());
    let job = JobId::new("job");
    let mut configs = configurations(&["needs-gpu"]);
    configs[0].capability_requirements = vec![CapabilityRequirement::present("gpu")];
    service.schedule_tests(&job, JobPriority::MEDIUM, configs).unwrap();

    let cpu = WorkerCapabilities::new();
    service.register(&worker("cpu"), cpu.clone(), None).unwrap();
    assert!(matches!(
        service.fetch_bucket(&worker("cpu"), &cpu),
        Ok(BucketFetchResult::CheckAgainLater(..))
    ));

    let executor = Arc::new(ScriptedExecutor::default());
    let exit = dist_worker(&service, "gpu", WorkerCapabilities::new().with("gpu"), &executor)
        .run()
        .await
        .unwrap();
    assert_eq!(exit.buckets_completed, 1);

    assert_eq!(
        service.fetch_bucket(&worker("cpu"), &cpu),
        Ok(BucketFetchResult::QueueIsEmpty)
    );
}

#[tokio::test]
#[ntest::timeout(5000)]
async fn results_are_accepted_once() {
    let service = service(unsplit());
    let job = JobId::new("job");
    service
        .schedule_tests(&job, JobPriority::MEDIUM, configurations(&["t"]))
        .unwrap();
    let mut completions = service.subscribe_completions();

    let caps = WorkerCapabilities::new();
    service.register(&worker("w"), caps.clone(), None).unwrap();
    let bucket = match service.fetch_bucket(&worker("w"), &caps).unwrap() {
        BucketFetchResult::Bucket(bucket) => bucket,
        other => panic!("expected a bucket, got {other:?}"),
    };

    let result = all_passing(&bucket);
    assert_eq!(
        &service.accept_result(&worker("w"), result.clone()).unwrap(),
        bucket.bucket_id()
    );
    let completion = completions.recv().await.unwrap();
    assert_eq!(completion.bucket_id, *bucket.bucket_id());

    assert!(matches!(
        service.accept_result(&worker("w"), result),
        Err(QueueServiceError::Accept(AcceptError::UnexpectedBucketId { .. }))
    ));
    assert_eq!(service.job_results(&job).unwrap().len(), 1);
    assert!(completions.try_recv().is_err());
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn workers_share_a_split_job() {
    let service = service(QueueServerConfiguration {
        schedule_strategy: ScheduleStrategy::Progressive,
        number_of_workers: NonZeroUsize::new(2).unwrap(),
        check_again_time_interval_secs: 0,
        ..Default::default()
    });
    let job = JobId::new("job");
    let tests: Vec<String> = (0..12).map(|i| format!("t{i}")).collect();
    let tests: Vec<&str> = tests.iter().map(String::as_str).collect();
    let bucket_ids = service
        .schedule_tests(&job, JobPriority::MEDIUM, configurations(&tests))
        .unwrap();
    assert!(bucket_ids.len() > 1);

    let executor = Arc::new(ScriptedExecutor::default());
    let a = dist_worker(&service, "a", WorkerCapabilities::new(), &executor);
    let b = dist_worker(&service, "b", WorkerCapabilities::new(), &executor);
    let (a, b) = tokio::join!(a.run(), b.run());
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.buckets_completed + b.buckets_completed, bucket_ids.len());
    assert_eq!(a.buckets_unreported + b.buckets_unreported, 0);

    let mut ran: Vec<TestName> = service
        .job_results(&job)
        .unwrap()
        .iter()
        .flat_map(|result| result.successful_tests())
        .map(|entry| entry.test_name().clone())
        .collect();
    ran.sort();
    let mut expected = names(&tests);
    expected.sort();
    assert_eq!(ran, expected);
    assert!(service.is_depleted());
}
