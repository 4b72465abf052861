//! The request-response contract between a worker and the queue.

use async_trait::async_trait;
use tbq_utils::{
    protocol::{
        bucket::BucketId,
        capabilities::WorkerCapabilities,
        entity::WorkerId,
        queue::{AcceptError, BucketFetchResult, WorkerConfiguration, WorkerRejection},
        results::TestingResult,
    },
    timeout_future::TimedOut,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Rejected(#[from] WorkerRejection),
    #[error(transparent)]
    ResultRejected(#[from] AcceptError),
    #[error(transparent)]
    Timeout(#[from] TimedOut),
    #[error("transport error: {0}")]
    Transport(String),
}

impl ClientError {
    /// Whether the same request may succeed if sent again.
    pub fn is_transient(&self) -> bool {
        matches!(self, ClientError::Timeout(..) | ClientError::Transport(..))
    }
}

/// A worker's view of the queue.
#[async_trait]
pub trait QueueClient: Send + Sync {
    async fn register(
        &self,
        worker_id: &WorkerId,
        capabilities: &WorkerCapabilities,
    ) -> Result<WorkerConfiguration, ClientError>;

    /// Proves the worker is alive. `bucket_ids_in_flight` are the buckets it fetched and has not
    /// finished reporting; leases the worker keeps leaving out go back on the queue.
    async fn heartbeat(
        &self,
        worker_id: &WorkerId,
        bucket_ids_in_flight: &[BucketId],
    ) -> Result<(), ClientError>;

    async fn fetch_bucket(
        &self,
        worker_id: &WorkerId,
        capabilities: &WorkerCapabilities,
    ) -> Result<BucketFetchResult, ClientError>;

    /// Returns the id of the bucket the queue accepted a result for.
    async fn send_result(
        &self,
        worker_id: &WorkerId,
        result: TestingResult,
    ) -> Result<BucketId, ClientError>;
}
