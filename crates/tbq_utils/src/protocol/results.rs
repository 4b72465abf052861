//! Results of running test entries, and merging of repeated attempts.

use std::time::Duration;

use derive_more::Display;
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

use super::bucket::{BucketId, TestEntry, TestName};
use crate::time::EpochMillis;

/// Who raised an exception attached to a run result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionOrigin {
    /// Reported by the test itself.
    #[default]
    Test,
    /// Synthesized by the execution engine or queue because no real result exists.
    Harness,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TestException {
    pub reason: String,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub line: Option<u32>,
    #[serde(default)]
    pub origin: ExceptionOrigin,
}

impl TestException {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            file_path: None,
            line: None,
            origin: ExceptionOrigin::Test,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TestLogEntry {
    pub contents: String,
}

/// Why a result had to be made up rather than reported by the execution harness.
#[derive(Debug, Display, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyntheticFailure {
    #[display(fmt = "execution failure: {}", _0)]
    ExecutionFailure(String),
    #[display(fmt = "test exceeded maximum duration of {:?}", _0)]
    TestTimedOut(Duration),
    #[display(fmt = "test runner was silent for {:?}", _0)]
    RunnerSilent(Duration),
    #[display(fmt = "execution was cancelled")]
    Cancelled,
    #[display(fmt = "test did not produce a result")]
    NoResult,
}

/// The outcome of a single attempt at running a test entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRunResult {
    pub succeeded: bool,
    #[serde(default)]
    pub exceptions: Vec<TestException>,
    #[serde(default)]
    pub logs: Vec<TestLogEntry>,
    pub duration: Duration,
    pub start_time: EpochMillis,
    pub host_name: String,
    /// The execution slot (simulator, device, ...) the attempt ran on.
    pub slot_id: String,
}

impl TestRunResult {
    pub fn synthetic_failure(
        failure: &SyntheticFailure,
        host_name: impl Into<String>,
        start_time: EpochMillis,
    ) -> Self {
        Self {
            succeeded: false,
            exceptions: vec![TestException {
                reason: failure.to_string(),
                file_path: None,
                line: None,
                origin: ExceptionOrigin::Harness,
            }],
            logs: Vec::new(),
            duration: Duration::ZERO,
            start_time,
            host_name: host_name.into(),
            slot_id: String::new(),
        }
    }

    pub fn is_synthetic(&self) -> bool {
        self.exceptions
            .iter()
            .any(|e| e.origin == ExceptionOrigin::Harness)
    }
}

/// All attempts at running one test entry, in the order they were made.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestEntryResult {
    pub test_entry: TestEntry,
    pub test_run_results: Vec<TestRunResult>,
}

impl TestEntryResult {
    pub fn new(test_entry: TestEntry, test_run_results: Vec<TestRunResult>) -> Self {
        Self {
            test_entry,
            test_run_results,
        }
    }

    pub fn test_name(&self) -> &TestName {
        &self.test_entry.test_name
    }

    /// A test that passed on any attempt counts as passed.
    pub fn succeeded(&self) -> bool {
        self.test_run_results.iter().any(|r| r.succeeded)
    }

    /// The attempt that decides this entry's outcome: the last passing attempt if there is one,
    /// otherwise the last attempt.
    pub fn final_run_result(&self) -> Option<&TestRunResult> {
        self.test_run_results
            .iter()
            .rev()
            .find(|r| r.succeeded)
            .or_else(|| self.test_run_results.last())
    }

    /// Every distinct exception raised over all attempts, in first-seen order.
    pub fn distinct_exceptions(&self) -> Vec<&TestException> {
        let mut seen: Vec<&TestException> = Vec::new();
        for exception in self.test_run_results.iter().flat_map(|r| &r.exceptions) {
            if !seen.contains(&exception) {
                seen.push(exception);
            }
        }
        seen
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CombineError {
    #[error("there are no testing results to combine")]
    Empty,
    #[error("cannot combine results of bucket {actual} into results of bucket {expected}")]
    MismatchedBucketIds { expected: BucketId, actual: BucketId },
}

/// The merged outcome of running a bucket, possibly over several attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestingResult {
    pub bucket_id: BucketId,
    pub unfiltered_results: Vec<TestEntryResult>,
}

impl TestingResult {
    pub fn new(bucket_id: BucketId, unfiltered_results: Vec<TestEntryResult>) -> Self {
        Self {
            bucket_id,
            unfiltered_results,
        }
    }

    pub fn successful_tests(&self) -> impl Iterator<Item = &TestEntryResult> {
        self.unfiltered_results.iter().filter(|r| r.succeeded())
    }

    pub fn failed_tests(&self) -> impl Iterator<Item = &TestEntryResult> {
        self.unfiltered_results.iter().filter(|r| !r.succeeded())
    }

    pub fn result_for(&self, test_name: &TestName) -> Option<&TestEntryResult> {
        self.unfiltered_results
            .iter()
            .find(|r| r.test_name() == test_name)
    }

    /// Keeps only the entries matching `keep`.
    pub fn filtered(mut self, keep: impl Fn(&TestEntryResult) -> bool) -> Self {
        self.unfiltered_results.retain(|r| keep(r));
        self
    }

    /// Merges attempts at running the same bucket, in the order they were made.
    ///
    /// Every run of every entry is preserved. Entries are ordered by first appearance; an entry
    /// that passed on any attempt is reported as passed (see [TestEntryResult::final_run_result]).
    pub fn combine(
        attempts: impl IntoIterator<Item = TestingResult>,
    ) -> Result<TestingResult, CombineError> {
        let mut attempts = attempts.into_iter();
        let mut combined = attempts.next().ok_or(CombineError::Empty)?;

        for attempt in attempts {
            if attempt.bucket_id != combined.bucket_id {
                return Err(CombineError::MismatchedBucketIds {
                    expected: combined.bucket_id,
                    actual: attempt.bucket_id,
                });
            }

            for entry_result in attempt.unfiltered_results {
                let existing = combined
                    .unfiltered_results
                    .iter_mut()
                    .find(|r| r.test_entry == entry_result.test_entry);
                match existing {
                    Some(existing) => existing
                        .test_run_results
                        .extend(entry_result.test_run_results),
                    None => combined.unfiltered_results.push(entry_result),
                }
            }
        }

        Ok(combined)
    }
}
