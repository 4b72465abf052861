//! The seam to whatever actually runs tests: simulators, devices, or plain processes.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tbq_utils::protocol::{
    bucket::{BucketId, TestEntry, TestTimeoutConfiguration},
    results::TestRunResult,
};
use thiserror::Error;
use tokio::sync::mpsc;

/// One attempt at running some entries of a bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub bucket_id: BucketId,
    pub test_entries: Vec<TestEntry>,
    pub environment: BTreeMap<String, String>,
    pub timeouts: TestTimeoutConfiguration,
}

/// Progress reported by an executor while it runs a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionEvent {
    TestStarted(TestEntry),
    /// Any output of the harness. Only observed as a sign of life.
    Output(String),
    TestFinished(TestEntry, TestRunResult),
}

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("{0}")]
    Harness(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Where an executor streams [ExecutionEvent]s.
///
/// Once the attempt is over (finished, timed out, or cancelled) events are silently dropped.
#[derive(Debug, Clone)]
pub struct ExecutionSink {
    tx: mpsc::UnboundedSender<ExecutionEvent>,
}

impl ExecutionSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ExecutionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, event: ExecutionEvent) {
        // The receiver is gone if the attempt was abandoned.
        let _ = self.tx.send(event);
    }

    pub fn test_started(&self, test_entry: TestEntry) {
        self.send(ExecutionEvent::TestStarted(test_entry))
    }

    pub fn output(&self, output: impl Into<String>) {
        self.send(ExecutionEvent::Output(output.into()))
    }

    pub fn test_finished(&self, test_entry: TestEntry, result: TestRunResult) {
        self.send(ExecutionEvent::TestFinished(test_entry, result))
    }
}

/// Runs test entries and reports a [TestRunResult] per entry through the sink.
///
/// The future returned by `execute` may be dropped at any await point, e.g. when a test
/// exceeds its timeout or the run is cancelled; implementations must tear down what they
/// started when that happens.
#[async_trait]
pub trait TestExecutor: Send + Sync + 'static {
    async fn execute(
        &self,
        request: ExecutionRequest,
        sink: ExecutionSink,
    ) -> Result<(), ExecutionError>;
}
