use parking_lot::Mutex;
use tbq_utils::{protocol::bucket::BucketId, vec_set::VecSet};

/// Buckets a worker fetched and has not yet reported.
#[derive(Default)]
pub(crate) struct ProcessingTracker {
    bucket_ids: Mutex<VecSet<BucketId>>,
}

impl ProcessingTracker {
    pub fn will_process(&self, bucket_id: &BucketId) {
        let already_processing = self.bucket_ids.lock().insert(bucket_id.clone());
        tbq_utils::log_assert!(
            !already_processing,
            ?bucket_id,
            "fetched a bucket that is already being processed"
        );
    }

    pub fn did_process(&self, bucket_id: &BucketId) {
        self.bucket_ids.lock().remove(bucket_id);
    }

    pub fn bucket_ids(&self) -> Vec<BucketId> {
        self.bucket_ids.lock().iter().cloned().collect()
    }
}
