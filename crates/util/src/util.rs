//! Shared utilities for skiff.

use std::fmt::Debug;

/// Panic in debug builds, log error with backtrace in release.
///
/// Use for "this shouldn't happen" invariants that shouldn't take down
/// every open session in production.
#[macro_export]
macro_rules! debug_panic {
    ( $($fmt_arg:tt)* ) => {
        if cfg!(debug_assertions) {
            panic!( $($fmt_arg)* );
        } else {
            let backtrace = std::backtrace::Backtrace::capture();
            tracing::error!("{}\n{:?}", format_args!($($fmt_arg)*), backtrace);
        }
    };
}

/// Log-and-discard for results whose failure must not abort the caller,
/// such as cleanup steps during teardown.
pub trait ResultExt<T> {
    /// Log the error at `warn` and convert to an `Option`.
    fn log_err(self) -> Option<T>;

    /// Like [`ResultExt::log_err`], with a short description of the step that failed.
    fn log_err_with(self, what: &str) -> Option<T>;
}

impl<T, E: Debug> ResultExt<T> for Result<T, E> {
    #[track_caller]
    fn log_err(self) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(error) => {
                let caller = std::panic::Location::caller();
                tracing::warn!("{}:{}: {:?}", caller.file(), caller.line(), error);
                None
            }
        }
    }

    fn log_err_with(self, what: &str) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(error) => {
                tracing::warn!("{what}: {error:?}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_err_passes_ok_through() {
        let result: Result<u32, String> = Ok(7);
        assert_eq!(result.log_err(), Some(7));
    }

    #[test]
    fn log_err_swallows_errors() {
        let result: Result<u32, String> = Err("boom".into());
        assert_eq!(result.log_err_with("closing listener"), None);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "broken invariant 3")]
    fn debug_panic_panics_in_debug_builds() {
        debug_panic!("broken invariant {}", 3);
    }
}
