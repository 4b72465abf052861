pub mod decay;
pub mod log_assert;
pub mod protocol;
pub mod retry;
pub mod shutdown;
pub mod time;
pub mod timeout_future;
pub mod vec_set;
