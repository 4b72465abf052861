#[doc(hidden)]
pub use tracing as __tracing;

/// Checks a queue or worker invariant. A violation panics in debug builds and is logged as an
/// error in release builds, where the caller carries on.
///
/// ```ignore
/// log_assert!(!leased.contains(&bucket_id), ?bucket_id, "bucket leased twice");
/// ```
#[macro_export]
macro_rules! log_assert {
    ($check:expr, $($field:tt)*) => {{
        let holds: bool = $check;
        if !holds {
            $crate::log_assert::__tracing::error!($($field)*);
            debug_assert!(holds, "invariant violated: {}", stringify!($check));
        }
    }};
}

/// Marks a branch the state machines should never reach, with optional structured fields.
#[macro_export]
macro_rules! illegal_state {
    ($msg:expr) => {{
        $crate::log_assert::__tracing::error!("illegal state: {}", $msg);
        debug_assert!(false, "illegal state: {}", $msg);
    }};
    ($msg:expr, $($field:tt)+) => {{
        $crate::log_assert::__tracing::error!($($field)+, "illegal state: {}", $msg);
        debug_assert!(false, "illegal state: {}", $msg);
    }};
}
