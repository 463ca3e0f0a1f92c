// Copyright (c) The Chain Core Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::outpoint::Outpoint;
use crate::output::AssetId;
use chain_canonical_serialization::{CanonicalDeserialize, CanonicalSerialize, Reader, Writer};
use chain_crypto::HashValue;
use chain_failure_ext::{ChainErrorKind, Result};
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::time::Duration;

/// A reservation with a TTL at or beyond this threshold survives a
/// process restart by being written to the store; shorter-lived ones
/// live only in memory (§3 "Reservation", §4.5 "Persistence"). Callers
/// that need a different threshold configure it explicitly; this is the
/// default used when none is supplied.
pub const DEFAULT_PERSISTENCE_THRESHOLD: Duration = Duration::from_secs(120);

/// An in-memory association from an unspent output to an expiry instant
/// and the requesting input identity (§3 "Reservation").
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct Reservation {
    pub outpoint: Outpoint,
    pub account_id: String,
    pub asset_id: AssetId,
    /// Unix timestamp (seconds) after which the reservation is no
    /// longer live.
    pub expires_at: u64,
    /// Caller-supplied idempotency key; a second `Reserve` call bearing
    /// the same token and `(account_id, asset_id)` returns the same
    /// reservation set rather than allocating anew (§4.5 "Idempotency").
    pub client_token: Option<String>,
}

impl Reservation {
    pub fn new(
        outpoint: Outpoint,
        account_id: String,
        asset_id: AssetId,
        expires_at: u64,
        client_token: Option<String>,
    ) -> Self {
        Reservation {
            outpoint,
            account_id,
            asset_id,
            expires_at,
            client_token,
        }
    }

    pub fn is_live(&self, now: u64) -> bool {
        self.expires_at > now
    }

    /// Whether this reservation's remaining life at `now` requires it to
    /// be durably persisted rather than kept only in the in-process pool.
    pub fn requires_persistence(&self, now: u64, threshold: Duration) -> bool {
        self.expires_at.saturating_sub(now) >= threshold.as_secs()
    }
}

/// Wire encoding for the `Reservation` column family in the state store
/// (§4.5 "Persistence"). `client_token` round-trips `None` and `Some("")`
/// identically, the same simplification [`crate::transaction::Input`]
/// makes for `asset_definition`.
impl CanonicalSerialize for Reservation {
    fn write_canonical(&self, w: &mut Writer) {
        self.outpoint.write_canonical(w);
        w.write_bytes(self.account_id.as_bytes());
        w.write_fixed(self.asset_id.as_bytes());
        w.write_u64(self.expires_at);
        w.write_bytes(self.client_token.as_deref().unwrap_or("").as_bytes());
    }
}

impl CanonicalDeserialize for Reservation {
    fn read_canonical(r: &mut Reader<'_>) -> Result<Self> {
        let outpoint = Outpoint::read_canonical(r)?;
        let account_id = String::from_utf8(r.read_bytes()?)
            .map_err(|e| ChainErrorKind::bad_request(format!("reservation account_id is not utf8: {}", e)))?;
        let asset_id = HashValue::try_from(r.read_fixed(32)?.as_slice())?;
        let expires_at = r.read_u64()?;
        let client_token_bytes = r.read_bytes()?;
        let client_token = if client_token_bytes.is_empty() {
            None
        } else {
            Some(String::from_utf8(client_token_bytes).map_err(|e| {
                ChainErrorKind::bad_request(format!("reservation client_token is not utf8: {}", e))
            })?)
        };
        Ok(Reservation {
            outpoint,
            account_id,
            asset_id,
            expires_at,
            client_token,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chain_crypto::HashValue;

    fn sample() -> Reservation {
        Reservation::new(
            Outpoint::new(HashValue::sha3_256_of(b"tx"), 0),
            "acct-1".to_string(),
            HashValue::sha3_256_of(b"usd"),
            1_000,
            None,
        )
    }

    #[test]
    fn expired_reservation_is_not_live() {
        let r = sample();
        assert!(r.is_live(999));
        assert!(!r.is_live(1_000));
    }

    #[test]
    fn long_ttl_requires_persistence() {
        let r = sample();
        assert!(r.requires_persistence(0, DEFAULT_PERSISTENCE_THRESHOLD));
        assert!(!Reservation::new(
            r.outpoint,
            r.account_id,
            r.asset_id,
            60,
            None,
        )
        .requires_persistence(0, DEFAULT_PERSISTENCE_THRESHOLD));
    }

    #[test]
    fn canonical_round_trips_with_and_without_a_client_token() {
        let r = sample();
        let bytes = r.to_canonical_bytes();
        assert_eq!(Reservation::from_canonical_bytes(&bytes).unwrap(), r);

        let with_token = Reservation::new(r.outpoint, r.account_id, r.asset_id, r.expires_at, Some("retry-1".to_string()));
        let bytes = with_token.to_canonical_bytes();
        assert_eq!(Reservation::from_canonical_bytes(&bytes).unwrap(), with_token);
    }
}
