//! Domain model shared between the queue and its workers.
//!
//! These types are serde-serializable so that a request layer can put them on a wire; the
//! encoding itself is not decided here.

pub mod bucket;
pub mod capabilities;
pub mod entity;
pub mod queue;
pub mod results;
