// Copyright (c) The Chain Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! Process-wide structured logging.
//!
//! Every other crate logs through [`prelude`]'s macros instead of
//! `println!`/`eprintln!`. The backing logger is installed once, at
//! process start, by [`init`]; until `init` runs, the macros log to a
//! discarding logger so unit tests that never call `init` stay quiet.

use slog::{o, Drain};
use std::sync::atomic::{AtomicBool, Ordering};

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Output format selected by `init`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable, colorized terminal output. Good for local dev.
    Compact,
    /// One JSON object per line. Good for production log aggregation.
    Json,
}

/// Installs the process-wide logger. Safe to call more than once; only
/// the first call takes effect.
pub fn init(process_name: &'static str, format: LogFormat) {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    let drain = match format {
        LogFormat::Compact => {
            let decorator = slog_term::TermDecorator::new().build();
            let drain = slog_term::FullFormat::new(decorator).build().fuse();
            slog_async::Async::new(drain).build().fuse()
        }
        LogFormat::Json => {
            let drain = slog_json::Json::default(std::io::stdout()).fuse();
            slog_async::Async::new(drain).build().fuse()
        }
    };
    let drain = slog_envlogger::new(drain).fuse();
    let logger = slog::Logger::root(drain, o!("process" => process_name));
    slog_scope::set_global_logger(logger).cancel_reset();
}

/// Leveled logging macros bound to the global logger. Import as
/// `use chain_logger::prelude::*;` the way every other crate in the
/// workspace does.
pub mod prelude {
    pub use slog_scope::{crit, debug, error, info, trace, warn};
}
