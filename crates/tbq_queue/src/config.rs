//! Queue server configuration, read from a toml file.

use std::collections::BTreeMap;
use std::fs;
use std::num::NonZeroUsize;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, bail};
use serde_derive::{Deserialize, Serialize};
use tbq_utils::protocol::{entity::WorkerId, queue::WorkerConfiguration};

use crate::splitter::{BucketSplitInfo, ScheduleStrategy};

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfigurationEntry {
    pub number_of_slots: NonZeroUsize,
    pub heartbeat_interval_secs: u64,
}

impl Default for WorkerConfigurationEntry {
    fn default() -> Self {
        let default = WorkerConfiguration::default();
        Self {
            number_of_slots: default.number_of_slots,
            heartbeat_interval_secs: default.heartbeat_interval.as_secs(),
        }
    }
}

impl From<WorkerConfigurationEntry> for WorkerConfiguration {
    fn from(entry: WorkerConfigurationEntry) -> Self {
        Self {
            number_of_slots: entry.number_of_slots,
            heartbeat_interval: Duration::from_secs(entry.heartbeat_interval_secs),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct QueueServerConfiguration {
    /// Suggested to workers that ask for work while none is available for them.
    pub check_again_time_interval_secs: u64,
    /// How long a worker may go without heartbeating before it is considered silent.
    pub worker_silence_timeout_secs: u64,
    pub reap_interval_secs: u64,
    pub schedule_strategy: ScheduleStrategy,
    /// Expected size of the fleet; sizes progressive and equally divided splits.
    pub number_of_workers: NonZeroUsize,
    pub default_worker_configuration: WorkerConfigurationEntry,
    pub worker_specific_configurations: BTreeMap<WorkerId, WorkerConfigurationEntry>,
}

impl Default for QueueServerConfiguration {
    fn default() -> Self {
        Self {
            check_again_time_interval_secs: 30,
            worker_silence_timeout_secs: 60,
            reap_interval_secs: 5,
            schedule_strategy: ScheduleStrategy::default(),
            number_of_workers: NonZeroUsize::MIN,
            default_worker_configuration: WorkerConfigurationEntry::default(),
            worker_specific_configurations: BTreeMap::new(),
        }
    }
}

impl QueueServerConfiguration {
    pub fn from_toml_str(toml_str: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    pub fn read_from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let toml_str = fs::read_to_string(path)
            .map_err(|e| anyhow!("failed to read queue configuration {}: {e}", path.display()))?;
        Self::from_toml_str(&toml_str)
    }

    pub fn write_to_path(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let toml_str = toml::to_string(self)?;
        fs::write(path, toml_str)?;
        Ok(())
    }

    /// A worker must be able to heartbeat at least once within the silence timeout.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.check_again_time_interval_secs == 0 {
            bail!("check_again_time_interval_secs must be positive");
        }
        if self.reap_interval_secs == 0 {
            bail!("reap_interval_secs must be positive");
        }

        let entries = std::iter::once((None, &self.default_worker_configuration)).chain(
            self.worker_specific_configurations
                .iter()
                .map(|(id, entry)| (Some(id), entry)),
        );
        for (worker_id, entry) in entries {
            if entry.heartbeat_interval_secs == 0
                || entry.heartbeat_interval_secs >= self.worker_silence_timeout_secs
            {
                let worker = worker_id.map_or("default".to_owned(), |id| id.to_string());
                bail!(
                    "heartbeat interval of {}s for {worker} workers must be positive and \
                     shorter than the worker silence timeout of {}s",
                    entry.heartbeat_interval_secs,
                    self.worker_silence_timeout_secs
                );
            }
        }

        Ok(())
    }

    pub fn check_again_time_interval(&self) -> Duration {
        Duration::from_secs(self.check_again_time_interval_secs)
    }

    pub fn worker_silence_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_silence_timeout_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    pub fn worker_configuration(&self, worker_id: &WorkerId) -> WorkerConfiguration {
        self.worker_specific_configurations
            .get(worker_id)
            .copied()
            .unwrap_or(self.default_worker_configuration)
            .into()
    }

    pub fn split_info(&self) -> BucketSplitInfo {
        let slots = self.default_worker_configuration.number_of_slots;
        BucketSplitInfo {
            number_of_workers: self.number_of_workers,
            number_of_parallel_buckets: self
                .number_of_workers
                .checked_mul(slots)
                .unwrap_or(NonZeroUsize::MAX),
        }
    }
}
