// Copyright (c) The Chain Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! The error taxonomy used by every public entry point in the core (§7 of
//! the design). Internally every fallible function returns
//! `Result<T, failure::Error>` so causes compose freely; at the edges
//! (RPC handlers, CLI) callers downcast to [`ChainErrorKind`] to decide
//! how to react (retry, surface to the end user, log and move on).

pub use chain_failure_macros::{bail_fmt, fmt_cause_chain};
pub use failure::{bail, ensure, format_err, Error, Fail, ResultExt};

/// The result type every core API returns.
pub type Result<T> = ::std::result::Result<T, Error>;

/// The error taxonomy from §7. `Fail` gives each variant a `Display`; the
/// chain of causes leading up to it is preserved by `failure::Error`
/// regardless of which kind tags the head of the chain.
#[derive(Debug, Fail)]
pub enum ChainErrorKind {
    /// Malformed client input: JSON decode failure, missing required field.
    #[fail(display = "bad request: {}", _0)]
    BadRequest(String),

    /// Requested entity absent.
    #[fail(display = "not found: {}", _0)]
    NotFound(String),

    /// A transaction or block failed validation. Fatal for that item only.
    #[fail(display = "validation failed: {}", _0)]
    Validation(String),

    /// Distinct from insufficient funds: retryable once the contending
    /// reservation clears or expires.
    #[fail(display = "reservation contention: {}", _0)]
    ReservedContention(String),

    /// Deposit required; not retryable under the current pool state.
    #[fail(display = "insufficient funds: {}", _0)]
    InsufficientFunds(String),

    /// RPC peer disagrees about blockchain identity.
    #[fail(display = "wrong network: {}", _0)]
    WrongNetwork(String),

    /// Database or network I/O error. Potentially retryable; the core
    /// never retries these itself (§7 propagation policy).
    #[fail(display = "io error: {}", _0)]
    Io(String),

    /// Programmer error / invariant violation. Logged with a stack by the
    /// caller; never expected to be handled.
    #[fail(display = "internal error: {}", _0)]
    Internal(String),
}

impl ChainErrorKind {
    pub fn bad_request<S: Into<String>>(msg: S) -> Error {
        ChainErrorKind::BadRequest(msg.into()).into()
    }
    pub fn not_found<S: Into<String>>(msg: S) -> Error {
        ChainErrorKind::NotFound(msg.into()).into()
    }
    pub fn validation<S: Into<String>>(msg: S) -> Error {
        ChainErrorKind::Validation(msg.into()).into()
    }
    pub fn reserved_contention<S: Into<String>>(msg: S) -> Error {
        ChainErrorKind::ReservedContention(msg.into()).into()
    }
    pub fn insufficient_funds<S: Into<String>>(msg: S) -> Error {
        ChainErrorKind::InsufficientFunds(msg.into()).into()
    }
    pub fn wrong_network<S: Into<String>>(msg: S) -> Error {
        ChainErrorKind::WrongNetwork(msg.into()).into()
    }
    pub fn io<S: Into<String>>(msg: S) -> Error {
        ChainErrorKind::Io(msg.into()).into()
    }
    pub fn internal<S: Into<String>>(msg: S) -> Error {
        ChainErrorKind::Internal(msg.into()).into()
    }

    /// Best-effort classification of an arbitrary `failure::Error` back
    /// into the taxonomy, for callers (RPC handlers) that only have the
    /// opaque error and need a status code. Errors that were constructed
    /// via the helpers above downcast cleanly; anything else classifies
    /// as `Internal` so it is never silently swallowed (§7).
    pub fn classify(err: &Error) -> &'static str {
        if let Some(kind) = err.downcast_ref::<ChainErrorKind>() {
            return match kind {
                ChainErrorKind::BadRequest(_) => "bad-request",
                ChainErrorKind::NotFound(_) => "not-found",
                ChainErrorKind::Validation(_) => "validation",
                ChainErrorKind::ReservedContention(_) => "reserved-contention",
                ChainErrorKind::InsufficientFunds(_) => "insufficient-funds",
                ChainErrorKind::WrongNetwork(_) => "wrong-network",
                ChainErrorKind::Io(_) => "io",
                ChainErrorKind::Internal(_) => "internal",
            };
        }
        "internal"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_round_trips_through_error() {
        let err = ChainErrorKind::not_found("outpoint abc:0");
        assert_eq!(ChainErrorKind::classify(&err), "not-found");
    }

    #[test]
    fn classify_defaults_to_internal() {
        let err = format_err!("something broke");
        assert_eq!(ChainErrorKind::classify(&err), "internal");
    }

    #[test]
    fn cause_chain_is_preserved() {
        let root = format_err!("disk full");
        let wrapped: Error = root.context("writing block").into();
        let rendered = fmt_cause_chain!(&wrapped);
        assert!(rendered.contains("writing block"));
    }
}
