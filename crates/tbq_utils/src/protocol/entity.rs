use derive_more::Display;
use serde_derive::{Deserialize, Serialize};

/// Identity of a worker process. Stable across reconnects of the same worker.
#[derive(Debug, Display, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for WorkerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Identity of a job, i.e. a set of tests scheduled together whose results are collected
/// together.
#[derive(Debug, Display, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn unique() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Jobs of higher priority have their buckets handed out first.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobPriority(u16);

impl JobPriority {
    pub const LOWEST: Self = Self(0);
    pub const MEDIUM: Self = Self(500);
    pub const HIGHEST: Self = Self(999);

    pub const fn new(value: u16) -> Self {
        Self(value)
    }
}

impl Default for JobPriority {
    fn default() -> Self {
        Self::MEDIUM
    }
}

static_assertions::assert_eq_size!(JobPriority, u16);
