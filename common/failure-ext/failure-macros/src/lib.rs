// Copyright (c) The Chain Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! A couple of macros that sit on top of `failure` and are shared by every
//! crate in the workspace. Kept deliberately small: the taxonomy itself
//! lives in `chain-failure-ext`, this crate only saves typing at call sites.

/// Renders an error together with its full cause chain, one cause per line.
/// Used by log statements that want to preserve context instead of just
/// printing the outermost message.
#[macro_export]
macro_rules! fmt_cause_chain {
    ($err:expr) => {{
        let err: &failure::Error = $err;
        let mut msg = format!("{}", err);
        for cause in err.iter_causes() {
            msg.push_str(&format!("\n  caused by: {}", cause));
        }
        msg
    }};
}

/// Shorthand for `return Err(format_err!(...))` used throughout the
/// validation and store code where an early return is the common case.
#[macro_export]
macro_rules! bail_fmt {
    ($($arg:tt)*) => {
        return Err(failure::format_err!($($arg)*))
    };
}
