//! A [TestExecutor] that follows a script, for exercising schedulers and workers in tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tbq_utils::{
    protocol::{
        bucket::TestName,
        results::{TestException, TestRunResult},
    },
    time::EpochMillis,
};

use crate::executor::{ExecutionError, ExecutionRequest, ExecutionSink, TestExecutor};

/// What happens the next time a test is run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scripted {
    Pass,
    Fail(String),
    /// Passes after the given delay.
    Slow(Duration),
    /// Starts, then never finishes.
    Hang,
    Panic,
    /// The harness fails while running the test.
    HarnessError(String),
    /// Starts, but never reports a result.
    NoReport,
}

/// Runs tests according to per-test scripts. Tests without a script, or whose script ran out,
/// pass.
#[derive(Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<TestName, VecDeque<Scripted>>>,
    executions: Mutex<Vec<Vec<TestName>>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn script(self, test_name: &str, steps: impl IntoIterator<Item = Scripted>) -> Self {
        self.scripts
            .lock()
            .entry(TestName::from(test_name))
            .or_default()
            .extend(steps);
        self
    }

    /// The tests of every execution request, in order of execution.
    pub fn executions(&self) -> Vec<Vec<TestName>> {
        self.executions.lock().clone()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_step(&self, test_name: &TestName) -> Scripted {
        self.scripts
            .lock()
            .get_mut(test_name)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Scripted::Pass)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(in_flight: &'a AtomicUsize, max_in_flight: &AtomicUsize) -> Self {
        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(in_flight)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn run_result(succeeded: bool, exceptions: Vec<TestException>) -> TestRunResult {
    TestRunResult {
        succeeded,
        exceptions,
        logs: Vec::new(),
        duration: Duration::ZERO,
        start_time: EpochMillis::now(),
        host_name: "scripted".to_owned(),
        slot_id: "0".to_owned(),
    }
}

#[async_trait]
impl TestExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        request: ExecutionRequest,
        sink: ExecutionSink,
    ) -> Result<(), ExecutionError> {
        let _in_flight = InFlight::enter(&self.in_flight, &self.max_in_flight);
        self.executions.lock().push(
            request
                .test_entries
                .iter()
                .map(|e| e.test_name.clone())
                .collect(),
        );

        for entry in request.test_entries {
            let step = self.next_step(&entry.test_name);
            sink.test_started(entry.clone());
            match step {
                Scripted::Pass => sink.test_finished(entry, run_result(true, vec![])),
                Scripted::Fail(reason) => {
                    sink.test_finished(entry, run_result(false, vec![TestException::new(reason)]))
                }
                Scripted::Slow(delay) => {
                    tokio::time::sleep(delay).await;
                    sink.test_finished(entry, run_result(true, vec![]));
                }
                Scripted::Hang => futures::future::pending::<()>().await,
                Scripted::Panic => panic!("scripted executor panic"),
                Scripted::HarnessError(reason) => return Err(ExecutionError::Harness(reason)),
                Scripted::NoReport => {}
            }
        }

        Ok(())
    }
}
