//! The distributed bucket queue: leasing of buckets to workers, worker aliveness, retry budgeting,
//! and the request layer workers talk to.

pub mod aliveness;
pub mod config;
pub mod history;
pub mod queue;
pub mod reaper;
pub mod service;
pub mod splitter;
