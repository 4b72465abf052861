//! Buckets: immutable batches of test entries and the configuration to run them with.

use std::{collections::BTreeMap, time::Duration};

use derive_more::Display;
use serde_derive::{Deserialize, Serialize};

use super::capabilities::CapabilityRequirement;

#[derive(Debug, Display, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BucketId(String);

impl BucketId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn unique() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for BucketId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Fully-qualified name of a test, e.g. `LoginTests/testValidPassword`.
#[derive(Debug, Display, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TestName(String);

impl TestName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TestName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TestEntry {
    pub test_name: TestName,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Identifier of the test in an external test case management system, if any.
    #[serde(default)]
    pub case_id: Option<u64>,
}

impl TestEntry {
    pub fn new(test_name: impl Into<TestName>) -> Self {
        Self {
            test_name: test_name.into(),
            tags: Vec::new(),
            case_id: None,
        }
    }
}

impl From<String> for TestName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Where failed test entries are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestRetryMode {
    /// The worker that ran the bucket reruns failures itself before reporting.
    RetryOnWorker,
    /// Failures are reported, then resubmitted to the queue as new buckets that any worker
    /// may lease.
    #[default]
    RetryThroughQueue,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TestExecutionBehavior {
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Number of retries a test entry is granted after its first attempt, across the whole job.
    pub number_of_retries: u32,
    #[serde(default)]
    pub retry_mode: TestRetryMode,
}

impl TestExecutionBehavior {
    pub const DEFAULT_NUMBER_OF_RETRIES: u32 = 1;

    /// How many times a worker should rerun failures locally before reporting a bucket.
    pub fn local_retries(&self) -> u32 {
        match self.retry_mode {
            TestRetryMode::RetryOnWorker => self.number_of_retries,
            TestRetryMode::RetryThroughQueue => 0,
        }
    }
}

impl Default for TestExecutionBehavior {
    fn default() -> Self {
        Self {
            environment: BTreeMap::new(),
            number_of_retries: Self::DEFAULT_NUMBER_OF_RETRIES,
            retry_mode: TestRetryMode::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TestTimeoutConfiguration {
    /// How long a single test entry may run before it is considered hung.
    pub single_test_maximum_duration: Duration,
    /// How long the execution harness may go without reporting any progress.
    pub runner_maximum_silence_duration: Duration,
}

impl Default for TestTimeoutConfiguration {
    fn default() -> Self {
        Self {
            single_test_maximum_duration: Duration::from_secs(180),
            runner_maximum_silence_duration: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTestsPayload {
    pub test_entries: Vec<TestEntry>,
    pub test_execution_behavior: TestExecutionBehavior,
    pub test_timeout_configuration: TestTimeoutConfiguration,
}

/// What a bucket asks a worker to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum BucketPayload {
    RunTests(RunTestsPayload),
}

impl BucketPayload {
    pub fn test_entries(&self) -> &[TestEntry] {
        match self {
            BucketPayload::RunTests(payload) => &payload.test_entries,
        }
    }

    pub fn test_execution_behavior(&self) -> &TestExecutionBehavior {
        match self {
            BucketPayload::RunTests(payload) => &payload.test_execution_behavior,
        }
    }
}

/// The unit of distribution. Never mutated once created; a re-split produces a new bucket with a
/// fresh [BucketId] in the same lineage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    bucket_id: BucketId,
    /// The bucket this one was (transitively) re-split from, or its own id if it is original.
    lineage_id: BucketId,
    capability_requirements: Vec<CapabilityRequirement>,
    payload: BucketPayload,
}

static_assertions::assert_impl_all!(Bucket: Send, Sync);

impl Bucket {
    pub fn new(
        bucket_id: BucketId,
        capability_requirements: Vec<CapabilityRequirement>,
        payload: BucketPayload,
    ) -> Self {
        Self {
            lineage_id: bucket_id.clone(),
            bucket_id,
            capability_requirements,
            payload,
        }
    }

    /// Creates a bucket descending from `parent`, with the same requirements and behavior but
    /// only the given entries.
    pub fn resplit_from(
        parent: &Bucket,
        bucket_id: BucketId,
        test_entries: Vec<TestEntry>,
    ) -> Self {
        let payload = match &parent.payload {
            BucketPayload::RunTests(payload) => BucketPayload::RunTests(RunTestsPayload {
                test_entries,
                test_execution_behavior: payload.test_execution_behavior.clone(),
                test_timeout_configuration: payload.test_timeout_configuration,
            }),
        };
        Self {
            bucket_id,
            lineage_id: parent.lineage_id.clone(),
            capability_requirements: parent.capability_requirements.clone(),
            payload,
        }
    }

    pub fn bucket_id(&self) -> &BucketId {
        &self.bucket_id
    }

    pub fn lineage_id(&self) -> &BucketId {
        &self.lineage_id
    }

    pub fn capability_requirements(&self) -> &[CapabilityRequirement] {
        &self.capability_requirements
    }

    pub fn payload(&self) -> &BucketPayload {
        &self.payload
    }

    pub fn test_entries(&self) -> &[TestEntry] {
        self.payload.test_entries()
    }
}

/// A test entry, together with the configuration it was scheduled with. The input to bucket
/// splitting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestEntryConfiguration {
    pub test_entry: TestEntry,
    #[serde(default)]
    pub test_execution_behavior: TestExecutionBehavior,
    #[serde(default)]
    pub test_timeout_configuration: TestTimeoutConfiguration,
    #[serde(default)]
    pub capability_requirements: Vec<CapabilityRequirement>,
}

impl TestEntryConfiguration {
    pub fn new(test_entry: TestEntry) -> Self {
        Self {
            test_entry,
            test_execution_behavior: Default::default(),
            test_timeout_configuration: Default::default(),
            capability_requirements: Vec::new(),
        }
    }

    /// Whether two configurations can share a bucket.
    pub fn runs_like(&self, other: &Self) -> bool {
        self.test_execution_behavior == other.test_execution_behavior
            && self.test_timeout_configuration == other.test_timeout_configuration
            && self.capability_requirements == other.capability_requirements
    }
}
