//! Fixtures shared by the queue and worker tests.

use std::time::Duration;

use tbq_utils::{
    protocol::{
        bucket::{
            Bucket, BucketId, BucketPayload, RunTestsPayload, TestEntry, TestEntryConfiguration,
            TestExecutionBehavior, TestRetryMode, TestTimeoutConfiguration,
        },
        capabilities::CapabilityRequirement,
        entity::WorkerId,
        results::{TestEntryResult, TestException, TestRunResult, TestingResult},
    },
    time::EpochMillis,
};

pub fn worker(id: &str) -> WorkerId {
    WorkerId::new(id)
}

pub fn entries(names: &[&str]) -> Vec<TestEntry> {
    names.iter().map(|name| TestEntry::new(*name)).collect()
}

pub fn configurations(names: &[&str]) -> Vec<TestEntryConfiguration> {
    entries(names)
        .into_iter()
        .map(TestEntryConfiguration::new)
        .collect()
}

/// A bucket with default execution behavior: one retry, through the queue.
pub fn bucket(id: &str, names: &[&str]) -> Bucket {
    bucket_with_requirements(id, names, vec![])
}

pub fn bucket_with_requirements(
    id: &str,
    names: &[&str],
    requirements: Vec<CapabilityRequirement>,
) -> Bucket {
    Bucket::new(
        BucketId::new(id),
        requirements,
        BucketPayload::RunTests(RunTestsPayload {
            test_entries: entries(names),
            test_execution_behavior: TestExecutionBehavior::default(),
            test_timeout_configuration: TestTimeoutConfiguration::default(),
        }),
    )
}

pub fn bucket_with_retries(id: &str, names: &[&str], number_of_retries: u32) -> Bucket {
    with_number_of_retries(bucket(id, names), number_of_retries)
}

/// Rebuilds an original (not re-split) bucket with a changed payload.
fn map_payload(bucket: Bucket, f: impl FnOnce(&mut RunTestsPayload)) -> Bucket {
    let BucketPayload::RunTests(mut payload) = bucket.payload().clone();
    f(&mut payload);
    Bucket::new(
        bucket.bucket_id().clone(),
        bucket.capability_requirements().to_vec(),
        BucketPayload::RunTests(payload),
    )
}

pub fn with_number_of_retries(bucket: Bucket, number_of_retries: u32) -> Bucket {
    map_payload(bucket, |p| {
        p.test_execution_behavior.number_of_retries = number_of_retries
    })
}

pub fn with_retry_mode(bucket: Bucket, retry_mode: TestRetryMode) -> Bucket {
    map_payload(bucket, |p| p.test_execution_behavior.retry_mode = retry_mode)
}

pub fn with_timeouts(bucket: Bucket, timeouts: TestTimeoutConfiguration) -> Bucket {
    map_payload(bucket, |p| p.test_timeout_configuration = timeouts)
}

fn run(succeeded: bool, exceptions: Vec<TestException>) -> TestRunResult {
    TestRunResult {
        succeeded,
        exceptions,
        logs: vec![],
        duration: Duration::from_millis(10),
        start_time: EpochMillis::now(),
        host_name: "test-host".to_owned(),
        slot_id: "slot-0".to_owned(),
    }
}

pub fn passing_run() -> TestRunResult {
    run(true, vec![])
}

pub fn failing_run(reason: &str) -> TestRunResult {
    run(false, vec![TestException::new(reason)])
}

pub fn entry_result(name: &str, runs: Vec<TestRunResult>) -> TestEntryResult {
    TestEntryResult::new(TestEntry::new(name), runs)
}

pub fn testing_result(bucket_id: &str, results: Vec<TestEntryResult>) -> TestingResult {
    TestingResult::new(BucketId::new(bucket_id), results)
}

/// A result in which every entry of the bucket passed.
pub fn all_passing(bucket: &Bucket) -> TestingResult {
    TestingResult::new(
        bucket.bucket_id().clone(),
        bucket
            .test_entries()
            .iter()
            .map(|entry| TestEntryResult::new(entry.clone(), vec![passing_run()]))
            .collect(),
    )
}
