pub mod client;
pub mod dist_worker;
pub mod executor;
mod processing;
pub mod scheduler;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;
