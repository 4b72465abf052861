//! Partitioning of test entries into buckets.

use std::num::NonZeroUsize;

use serde_derive::{Deserialize, Serialize};
use tbq_utils::protocol::bucket::{
    Bucket, BucketId, BucketPayload, RunTestsPayload, TestEntry, TestEntryConfiguration,
};

/// How test entries are grouped into buckets. Selected when a job is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStrategy {
    /// One test entry per bucket.
    Individual,
    /// Large buckets first, shrinking towards single entries near the end of the split.
    #[default]
    Progressive,
    /// One bucket per parallel execution slot across all workers.
    EquallyDivided,
    /// Every entry in a single bucket.
    Unsplit,
    FixedBucketSize(NonZeroUsize),
}

/// The fleet a split is sized for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketSplitInfo {
    pub number_of_workers: NonZeroUsize,
    pub number_of_parallel_buckets: NonZeroUsize,
}

impl Default for BucketSplitInfo {
    fn default() -> Self {
        Self {
            number_of_workers: NonZeroUsize::MIN,
            number_of_parallel_buckets: NonZeroUsize::MIN,
        }
    }
}

/// Each progressive bucket takes this fraction of the remaining entries per worker.
const PROGRESSIVE_DIVISOR: usize = 2;

#[derive(Debug, Clone, Copy, Default)]
pub struct BucketSplitter {
    strategy: ScheduleStrategy,
    split_info: BucketSplitInfo,
}

impl BucketSplitter {
    pub fn new(strategy: ScheduleStrategy, split_info: BucketSplitInfo) -> Self {
        Self {
            strategy,
            split_info,
        }
    }

    pub fn strategy(&self) -> ScheduleStrategy {
        self.strategy
    }

    /// Splits scheduled entries into buckets. Entries only share a bucket if they run with the
    /// same configuration; groups are split in order of their first entry.
    pub fn split(&self, configurations: Vec<TestEntryConfiguration>) -> Vec<Bucket> {
        let mut groups: Vec<(TestEntryConfiguration, Vec<TestEntry>)> = Vec::new();
        for configuration in configurations {
            match groups.iter_mut().find(|(c, _)| c.runs_like(&configuration)) {
                Some((_, entries)) => entries.push(configuration.test_entry),
                None => {
                    let entry = configuration.test_entry.clone();
                    groups.push((configuration, vec![entry]));
                }
            }
        }

        let mut buckets = Vec::new();
        for (configuration, entries) in groups {
            for chunk in self.chunk(entries) {
                let payload = BucketPayload::RunTests(RunTestsPayload {
                    test_entries: chunk,
                    test_execution_behavior: configuration.test_execution_behavior.clone(),
                    test_timeout_configuration: configuration.test_timeout_configuration,
                });
                buckets.push(Bucket::new(
                    BucketId::unique(),
                    configuration.capability_requirements.clone(),
                    payload,
                ));
            }
        }

        tracing::debug!(strategy=?self.strategy, buckets=buckets.len(), "split test entries");
        buckets
    }

    /// Builds buckets for retrying `failed` entries of `parent`, in `parent`'s lineage.
    pub fn resplit_for_retry(&self, parent: &Bucket, failed: Vec<TestEntry>) -> Vec<Bucket> {
        self.chunk(failed)
            .into_iter()
            .map(|chunk| Bucket::resplit_from(parent, BucketId::unique(), chunk))
            .collect()
    }

    fn chunk(&self, entries: Vec<TestEntry>) -> Vec<Vec<TestEntry>> {
        let sizes = self.chunk_sizes(entries.len());
        let mut entries = entries.into_iter();
        sizes
            .into_iter()
            .map(|size| entries.by_ref().take(size).collect())
            .collect()
    }

    /// Sizes of consecutive buckets for `count` entries. Sums to `count`; every size is nonzero.
    fn chunk_sizes(&self, count: usize) -> Vec<usize> {
        if count == 0 {
            return Vec::new();
        }

        let fixed = |size: usize| {
            let mut sizes = vec![size; count / size];
            if count % size != 0 {
                sizes.push(count % size);
            }
            sizes
        };

        match self.strategy {
            ScheduleStrategy::Individual => vec![1; count],
            ScheduleStrategy::Unsplit => vec![count],
            ScheduleStrategy::FixedBucketSize(size) => fixed(size.get()),
            ScheduleStrategy::EquallyDivided => {
                let buckets = self.split_info.number_of_parallel_buckets.get();
                fixed((count + buckets - 1) / buckets)
            }
            ScheduleStrategy::Progressive => {
                let divisor = self.split_info.number_of_workers.get() * PROGRESSIVE_DIVISOR;
                let mut remaining = count;
                let mut sizes = Vec::new();
                while remaining > 0 {
                    let size = (remaining / divisor).max(1);
                    sizes.push(size);
                    remaining -= size;
                }
                sizes
            }
        }
    }
}
