// Copyright (c) The Chain Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! Panic capture for the core's background loops (§7, §9): "a panic
//! inside the generator loop or any goroutine launched by the core is
//! recovered, logged with stack, and does not terminate the process."
//! Rust has no goroutines, but `std::panic::catch_unwind` gives the same
//! shape: wrap each iteration, log, and keep looping.

use backtrace::Backtrace;
use chain_logger::prelude::*;
use std::panic::{self, AssertUnwindSafe};

/// Installs a process-wide panic hook that logs the panic message and a
/// backtrace through the structured logger instead of only printing to
/// stderr. Call once at process start, before spawning any background
/// loop.
pub fn set_panic_hook() {
    panic::set_hook(Box::new(|info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_else(|| "<unknown>".to_string());
        let message = panic_message(info);
        let backtrace = Backtrace::new();
        error!(
            "panic at {}: {}\n{:?}",
            location, message, backtrace
        );
    }));
}

fn panic_message(info: &panic::PanicInfo<'_>) -> String {
    if let Some(s) = info.payload().downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = info.payload().downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Runs `f`, catching any panic instead of propagating it. Returns
/// `Some(output)` on success, `None` if `f` panicked (the panic has
/// already been logged by the hook installed via [`set_panic_hook`]).
/// `chain-executor`'s generator loop wraps every `generate -> sign ->
/// apply` cycle in this so one bad iteration never kills the node.
pub fn catch_and_log<F, T>(context: &str, f: F) -> Option<T>
where
    F: FnOnce() -> T,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(_) => {
            error!("recovered from a panic in {}; continuing", context);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catch_and_log_returns_none_on_panic_without_aborting() {
        let result = catch_and_log("test iteration", || -> u32 {
            panic!("boom");
        });
        assert!(result.is_none());
    }

    #[test]
    fn catch_and_log_returns_value_on_success() {
        let result = catch_and_log("test iteration", || 42);
        assert_eq!(result, Some(42));
    }
}
