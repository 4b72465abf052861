//! Tracks which workers are alive, and which buckets each of them holds.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tbq_utils::{
    protocol::{
        bucket::BucketId, capabilities::WorkerCapabilities, entity::WorkerId,
        queue::WorkerRejection,
    },
    vec_set::VecSet,
};

/// ```text
/// notRegistered -> alive <-> silent -> blocked
///                  alive  ----------> blocked
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlivenessStatus {
    NotRegistered,
    /// A heartbeat was received within the silence timeout.
    Alive,
    /// No heartbeat within the silence timeout. Buckets leased to the worker may be reaped.
    Silent,
    /// Never handed work again for the lifetime of the queue.
    Blocked,
}

/// Snapshot of a worker's aliveness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerAliveness {
    pub status: AlivenessStatus,
    pub capabilities: WorkerCapabilities,
    pub address: Option<SocketAddr>,
    pub bucket_ids_being_processed: VecSet<BucketId>,
    /// Whether buckets were taken away from this worker since it last registered. Such a worker
    /// must register again before it can be considered alive.
    pub leases_reaped: bool,
}

#[derive(Debug)]
struct WorkerState {
    aliveness: WorkerAliveness,
    last_heartbeat: Option<Instant>,
    /// Leases the worker left out of its latest in-flight report.
    unreported_bucket_ids: VecSet<BucketId>,
}

impl WorkerState {
    fn unregistered() -> Self {
        Self {
            aliveness: WorkerAliveness {
                status: AlivenessStatus::NotRegistered,
                capabilities: WorkerCapabilities::default(),
                address: None,
                bucket_ids_being_processed: VecSet::default(),
                leases_reaped: false,
            },
            last_heartbeat: None,
            unreported_bucket_ids: VecSet::default(),
        }
    }

    fn check_alive(&self, worker_id: &WorkerId) -> Result<(), WorkerRejection> {
        match self.aliveness.status {
            AlivenessStatus::Alive => Ok(()),
            AlivenessStatus::Blocked => Err(WorkerRejection::WorkerBlocked(worker_id.clone())),
            AlivenessStatus::NotRegistered | AlivenessStatus::Silent => {
                Err(WorkerRejection::WorkerNotRegistered(worker_id.clone()))
            }
        }
    }
}

/// The outcome of a successful registration.
#[derive(Debug, PartialEq, Eq)]
pub struct Registration {
    /// Buckets the worker held before registering again, e.g. because its process restarted.
    /// The worker will never report them, so they must be put back on the queue.
    pub stale_bucket_ids: Vec<BucketId>,
}

/// Leases taken from a worker that is no longer alive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReapedWorker {
    pub worker_id: WorkerId,
    pub bucket_ids: Vec<BucketId>,
}

/// Per-worker aliveness state machine. All mutation is serialized behind one lock.
pub struct WorkerAlivenessTracker {
    silence_timeout: Duration,
    workers: Mutex<HashMap<WorkerId, WorkerState>>,
}

impl WorkerAlivenessTracker {
    pub fn new(silence_timeout: Duration) -> Self {
        Self {
            silence_timeout,
            workers: Default::default(),
        }
    }

    pub fn silence_timeout(&self) -> Duration {
        self.silence_timeout
    }

    pub fn register(
        &self,
        worker_id: &WorkerId,
        capabilities: WorkerCapabilities,
        address: Option<SocketAddr>,
        now: Instant,
    ) -> Result<Registration, WorkerRejection> {
        let mut workers = self.workers.lock();
        let state = workers
            .entry(worker_id.clone())
            .or_insert_with(WorkerState::unregistered);

        if state.aliveness.status == AlivenessStatus::Blocked {
            tracing::warn!(?worker_id, "blocked worker attempted to register");
            return Err(WorkerRejection::WorkerBlocked(worker_id.clone()));
        }

        let previous_status = state.aliveness.status;
        let stale_bucket_ids: Vec<_> =
            state.aliveness.bucket_ids_being_processed.drain().collect();
        state.unreported_bucket_ids = VecSet::default();

        state.aliveness.status = AlivenessStatus::Alive;
        state.aliveness.capabilities = capabilities;
        state.aliveness.address = address;
        state.aliveness.leases_reaped = false;
        state.last_heartbeat = Some(now);

        tracing::info!(
            ?worker_id,
            ?previous_status,
            stale_buckets = stale_bucket_ids.len(),
            "worker registered"
        );

        Ok(Registration { stale_bucket_ids })
    }

    pub fn heartbeat(&self, worker_id: &WorkerId, now: Instant) -> Result<(), WorkerRejection> {
        let mut workers = self.workers.lock();
        let state = workers
            .get_mut(worker_id)
            .ok_or_else(|| WorkerRejection::WorkerNotRegistered(worker_id.clone()))?;

        match state.aliveness.status {
            AlivenessStatus::Alive => {}
            AlivenessStatus::Silent if !state.aliveness.leases_reaped => {
                tracing::info!(?worker_id, "silent worker is alive again");
                state.aliveness.status = AlivenessStatus::Alive;
            }
            _ => {
                let status = state.aliveness.status;
                tracing::debug!(?worker_id, ?status, "rejecting heartbeat");
                return state.check_alive(worker_id);
            }
        }

        state.last_heartbeat = Some(now);
        Ok(())
    }

    /// Checks the worker's leases against the buckets it reports having in flight.
    ///
    /// A lease left out of two consecutive reports is released and returned: the worker is done
    /// with the bucket without the queue having its result. One missed report is tolerated, as a
    /// report can be sent before the worker records a bucket it is just being handed.
    pub fn reconcile_leases(
        &self,
        worker_id: &WorkerId,
        bucket_ids_in_flight: &[BucketId],
    ) -> Vec<BucketId> {
        let mut workers = self.workers.lock();
        let state = match workers.get_mut(worker_id) {
            Some(state) => state,
            None => return Vec::new(),
        };

        let missing: Vec<_> = state
            .aliveness
            .bucket_ids_being_processed
            .iter()
            .filter(|bucket_id| !bucket_ids_in_flight.contains(bucket_id))
            .cloned()
            .collect();

        let mut lost = Vec::new();
        let mut unreported = VecSet::with_capacity(missing.len());
        for bucket_id in missing {
            if state.unreported_bucket_ids.contains(&bucket_id) {
                state.aliveness.bucket_ids_being_processed.remove(&bucket_id);
                lost.push(bucket_id);
            } else {
                unreported.insert(bucket_id);
            }
        }
        state.unreported_bucket_ids = unreported;

        if !lost.is_empty() {
            tracing::warn!(?worker_id, bucket_ids=?lost, "worker no longer reports leased buckets");
        }
        lost
    }

    /// Fails unless the worker is currently [alive][AlivenessStatus::Alive].
    pub fn ensure_alive(&self, worker_id: &WorkerId) -> Result<(), WorkerRejection> {
        match self.workers.lock().get(worker_id) {
            Some(state) => state.check_alive(worker_id),
            None => Err(WorkerRejection::WorkerNotRegistered(worker_id.clone())),
        }
    }

    pub fn update_capabilities(&self, worker_id: &WorkerId, capabilities: &WorkerCapabilities) {
        if let Some(state) = self.workers.lock().get_mut(worker_id) {
            if &state.aliveness.capabilities != capabilities {
                state.aliveness.capabilities = capabilities.clone();
            }
        }
    }

    /// Bans a worker for the lifetime of the queue. Its buckets become eligible for reaping.
    pub fn block(&self, worker_id: &WorkerId) {
        let mut workers = self.workers.lock();
        let state = workers
            .entry(worker_id.clone())
            .or_insert_with(WorkerState::unregistered);
        tracing::warn!(?worker_id, previous_status=?state.aliveness.status, "blocking worker");
        state.aliveness.status = AlivenessStatus::Blocked;
    }

    pub fn will_process(&self, worker_id: &WorkerId, bucket_id: &BucketId) {
        let mut workers = self.workers.lock();
        match workers.get_mut(worker_id) {
            Some(state) => {
                state
                    .aliveness
                    .bucket_ids_being_processed
                    .insert(bucket_id.clone());
            }
            None => tbq_utils::illegal_state!(
                "lease recorded for unknown worker",
                ?worker_id,
                ?bucket_id
            ),
        }
    }

    pub fn did_process(&self, worker_id: &WorkerId, bucket_id: &BucketId) {
        if let Some(state) = self.workers.lock().get_mut(worker_id) {
            state.aliveness.bucket_ids_being_processed.remove(bucket_id);
            state.unreported_bucket_ids.remove(bucket_id);
        }
    }

    pub fn bucket_ids_being_processed_by(&self, worker_id: &WorkerId) -> Vec<BucketId> {
        self.workers
            .lock()
            .get(worker_id)
            .map(|state| {
                state
                    .aliveness
                    .bucket_ids_being_processed
                    .iter()
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Moves workers that missed their heartbeat window to [silent][AlivenessStatus::Silent],
    /// then takes the leases of every silent or blocked worker that still holds any.
    ///
    /// Returns the leases taken. Their workers are marked as reaped, so they cannot become alive
    /// again without registering.
    pub fn reap(&self, now: Instant) -> Vec<ReapedWorker> {
        let mut workers = self.workers.lock();
        let mut reaped = Vec::new();

        for (worker_id, state) in workers.iter_mut() {
            if state.aliveness.status == AlivenessStatus::Alive {
                let silent_for = state
                    .last_heartbeat
                    .map(|last| now.saturating_duration_since(last))
                    .unwrap_or_default();
                if silent_for > self.silence_timeout {
                    tracing::warn!(?worker_id, ?silent_for, "worker went silent");
                    state.aliveness.status = AlivenessStatus::Silent;
                }
            }

            let dead = matches!(
                state.aliveness.status,
                AlivenessStatus::Silent | AlivenessStatus::Blocked
            );
            if dead && !state.aliveness.bucket_ids_being_processed.is_empty() {
                let bucket_ids: Vec<_> =
                    state.aliveness.bucket_ids_being_processed.drain().collect();
                tracing::info!(?worker_id, ?bucket_ids, "reaping leases of dead worker");
                state.aliveness.leases_reaped = true;
                state.unreported_bucket_ids = VecSet::default();
                reaped.push(ReapedWorker {
                    worker_id: worker_id.clone(),
                    bucket_ids,
                });
            }
        }

        reaped
    }

    /// Alive workers, with their capabilities.
    pub fn alive_workers(&self) -> Vec<(WorkerId, WorkerCapabilities)> {
        self.workers
            .lock()
            .iter()
            .filter(|(_, state)| state.aliveness.status == AlivenessStatus::Alive)
            .map(|(id, state)| (id.clone(), state.aliveness.capabilities.clone()))
            .collect()
    }

    pub fn aliveness_for_all_workers(&self) -> BTreeMap<WorkerId, WorkerAliveness> {
        self.workers
            .lock()
            .iter()
            .map(|(id, state)| (id.clone(), state.aliveness.clone()))
            .collect()
    }

    pub fn status_of(&self, worker_id: &WorkerId) -> AlivenessStatus {
        self.workers
            .lock()
            .get(worker_id)
            .map(|state| state.aliveness.status)
            .unwrap_or(AlivenessStatus::NotRegistered)
    }
}
