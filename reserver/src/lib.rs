// Copyright (c) The Chain Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! Allocates UTXOs to transaction builders under contention, guaranteeing
//! at most one live reservation per output at any instant (§4.5
//! "Reserver").
//!
//! Candidate outputs are grouped into one pool per `(account_id,
//! asset_id)`, each lazily loaded on first use via a [`CandidateSource`]
//! supplied by the caller (the account-to-output index lives outside
//! this crate's data model, e.g. derived from output metadata or a
//! separate account index). Each pool is guarded by its own mutex so
//! contention on one account/asset pair never blocks another (§5
//! "Reserver's per-key pools are the only high-contention structure").

use chain_failure_ext::{ChainErrorKind, Result};
use chain_logger::prelude::*;
use chain_metrics::OpMetrics;
use chain_store::Store;
use chain_types::{AssetId, Outpoint, Output, Reservation, DEFAULT_PERSISTENCE_THRESHOLD};
use chain_view::OutputDelta;
use lazy_static::lazy_static;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

lazy_static! {
    static ref OP_COUNTERS: OpMetrics = OpMetrics::new_and_registered("reserver");
}

/// Supplies the candidate unspent outputs owned by one account/asset
/// pair on first use of that pool. Implemented by the caller against
/// whatever account index sits atop the State Store; this crate only
/// tracks reservation state over whatever candidates it is given.
pub trait CandidateSource {
    fn load(&self, account_id: &str, asset_id: &AssetId) -> Result<Vec<(Outpoint, Output)>>;
}

/// The inverse of [`CandidateSource`]: given a freshly confirmed output,
/// names the `(account_id, asset_id)` pool it belongs to, or `None` if
/// this reserver does not track it. Used to route [`Pool::apply`]'s
/// newly-inserted outputs back into the right pool (§4.5 `Apply`).
pub trait OutputOwner {
    fn owner(&self, outpoint: &Outpoint, output: &Output) -> Option<(String, AssetId)>;
}

/// One line item of a `Reserve` request (§4.5 `Reserve`).
#[derive(Clone, Debug)]
pub struct ReserveRequest {
    pub account_id: String,
    pub asset_id: AssetId,
    pub amount: u64,
    pub tx_hash_constraint: Option<chain_types::HashValue>,
    pub client_token: Option<String>,
}

/// Leftover value from a `Reserve` request that exceeded what was asked
/// for, to be routed back to the same account/asset as a change output
/// (§4.5 `Reserve`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeRecord {
    pub account_id: String,
    pub asset_id: AssetId,
    pub amount: u64,
}

/// The result of satisfying one [`ReserveRequest`].
#[derive(Clone, Debug)]
pub struct ReserveOutcome {
    pub reserved: Vec<(Outpoint, Output)>,
    pub change: Option<ChangeRecord>,
}

struct Candidate {
    outpoint: Outpoint,
    output: Output,
}

/// The reservation state for one `(account_id, asset_id)` pair: its
/// candidate outputs plus which of them currently carry a live
/// reservation.
#[derive(Default)]
struct Pool {
    loaded: bool,
    candidates: Vec<Candidate>,
    reservations: HashMap<Outpoint, Reservation>,
    /// `(account_id, asset_id, client_token)` -> outcome, for idempotent
    /// retries (§4.5 "Idempotency").
    by_client_token: HashMap<String, ReserveOutcome>,
}

impl Pool {
    fn evict_expired(&mut self, now: u64) {
        self.reservations.retain(|_, r| r.is_live(now));
    }

    /// Candidates in the canonical tie-break order: `(account_id,
    /// asset_id, tx_hash, index)` (§4.5 "Tie-breaking"). The account and
    /// asset are constant within one pool, so this reduces to ordering
    /// by outpoint.
    fn sorted_candidates(&self) -> Vec<&Candidate> {
        let mut v: Vec<&Candidate> = self.candidates.iter().collect();
        v.sort_by_key(|c| c.outpoint);
        v
    }
}

/// Allocates reservations across per-`(account_id, asset_id)` pools
/// (§4.5 "Reserver"). Reservations whose TTL reaches `persistence_threshold`
/// are written to the store given to [`Self::with_store`] as they are
/// minted, and removed from it on cancel or consumption, so a restart
/// does not silently release them (§3 "Reservation", §4.5
/// "Persistence"); [`Self::restore_persisted_reservations`] reseeds the
/// in-memory pools from whatever survives a restart. A `Reserver` built
/// via [`Self::new`]/[`Self::with_persistence_threshold`] has no store
/// and keeps every reservation in memory only, which is fine for tests
/// and for embedders that do not need restart survival.
pub struct Reserver<S: CandidateSource> {
    source: S,
    pools: Mutex<HashMap<(String, AssetId), Mutex<Pool>>>,
    persistence_threshold: Duration,
    store: Option<Arc<Store>>,
}

impl<S: CandidateSource> Reserver<S> {
    pub fn new(source: S) -> Self {
        Self::with_persistence_threshold(source, DEFAULT_PERSISTENCE_THRESHOLD)
    }

    pub fn with_persistence_threshold(source: S, persistence_threshold: Duration) -> Self {
        Reserver {
            source,
            pools: Mutex::new(HashMap::new()),
            persistence_threshold,
            store: None,
        }
    }

    /// As [`Self::with_persistence_threshold`], but reservations at or
    /// beyond `persistence_threshold` are durably written to `store`
    /// when minted and removed from it on cancel/consumption (§4.5
    /// "Persistence"). Call [`Self::restore_persisted_reservations`]
    /// once after construction to reseed in-memory state from a prior
    /// run.
    pub fn with_store(source: S, persistence_threshold: Duration, store: Arc<Store>) -> Self {
        Reserver {
            source,
            pools: Mutex::new(HashMap::new()),
            persistence_threshold,
            store: Some(store),
        }
    }

    pub fn persistence_threshold(&self) -> Duration {
        self.persistence_threshold
    }

    /// Reseeds in-memory reservation state from the store (a no-op if
    /// this reserver was not built with one), so a fresh process does
    /// not treat a still-live, previously-persisted reservation as
    /// available (§4.5 "Persistence"). Intended to be called once at
    /// startup before the reserver serves any `Reserve` calls.
    pub fn restore_persisted_reservations(&self) -> Result<()> {
        let store = match &self.store {
            Some(store) => store,
            None => return Ok(()),
        };
        let mut pools = self.pools.lock().expect("reserver pools mutex poisoned");
        for reservation in store.list_reservations()? {
            let key = (reservation.account_id.clone(), reservation.asset_id);
            let pool_lock = pools.entry(key).or_insert_with(|| Mutex::new(Pool::default()));
            let mut pool = pool_lock.lock().expect("reserver pool mutex poisoned");
            pool.reservations.insert(reservation.outpoint, reservation);
        }
        Ok(())
    }

    /// Reserves outputs for every request in `inputs`, each against its
    /// own `(account_id, asset_id)` pool, each locked only for the
    /// duration of its own allocation (§4.5 `Reserve`).
    pub fn reserve(&self, inputs: &[ReserveRequest], ttl: Duration, now: u64) -> Result<Vec<ReserveOutcome>> {
        inputs.iter().map(|req| self.reserve_one(req, ttl, now)).collect()
    }

    fn reserve_one(&self, req: &ReserveRequest, ttl: Duration, now: u64) -> Result<ReserveOutcome> {
        let key = (req.account_id.clone(), req.asset_id);
        {
            let mut pools = self.pools.lock().expect("reserver pools mutex poisoned");
            pools.entry(key.clone()).or_insert_with(|| Mutex::new(Pool::default()));
        }
        let pools = self.pools.lock().expect("reserver pools mutex poisoned");
        let pool_lock = pools.get(&key).expect("pool was just inserted");
        let mut pool = pool_lock.lock().expect("reserver pool mutex poisoned");
        drop(pools);

        if !pool.loaded {
            let loaded = self.source.load(&req.account_id, &req.asset_id)?;
            pool.candidates = loaded
                .into_iter()
                .map(|(outpoint, output)| Candidate { outpoint, output })
                .collect();
            pool.loaded = true;
        }

        if let Some(token) = &req.client_token {
            if let Some(outcome) = pool.by_client_token.get(token) {
                OP_COUNTERS.inc("reserve", &["idempotent_replay"]);
                return Ok(outcome.clone());
            }
        }

        pool.evict_expired(now);

        let candidates = pool.sorted_candidates();
        let candidates: Vec<(Outpoint, Output)> = candidates
            .into_iter()
            .filter(|c| req.tx_hash_constraint.map_or(true, |h| c.outpoint.hash == h))
            .map(|c| (c.outpoint, c.output.clone()))
            .collect();

        let unreserved_total: u64 = candidates
            .iter()
            .filter(|(op, _)| !pool.reservations.contains_key(op))
            .map(|(_, o)| o.amount)
            .sum();
        let grand_total: u64 = candidates.iter().map(|(_, o)| o.amount).sum();

        if unreserved_total < req.amount {
            OP_COUNTERS.inc(
                "reserve",
                &[if grand_total >= req.amount {
                    "reserved_contention"
                } else {
                    "insufficient_funds"
                }],
            );
            return if grand_total >= req.amount {
                Err(ChainErrorKind::reserved_contention(format!(
                    "account {} asset {} has enough value but some is already reserved",
                    req.account_id, req.asset_id
                )))
            } else {
                Err(ChainErrorKind::insufficient_funds(format!(
                    "account {} asset {} holds {} of the {} requested",
                    req.account_id, req.asset_id, grand_total, req.amount
                )))
            };
        }

        let mut chosen = Vec::new();
        let mut accumulated = 0u64;
        for (outpoint, output) in candidates {
            if accumulated >= req.amount {
                break;
            }
            if pool.reservations.contains_key(&outpoint) {
                continue;
            }
            accumulated += output.amount;
            chosen.push((outpoint, output));
        }

        let expires_at = now + ttl.as_secs();
        for (outpoint, _) in &chosen {
            let reservation =
                Reservation::new(*outpoint, req.account_id.clone(), req.asset_id, expires_at, req.client_token.clone());
            if let Some(store) = &self.store {
                if reservation.requires_persistence(now, self.persistence_threshold) {
                    store.put_reservation(&reservation)?;
                }
            }
            pool.reservations.insert(*outpoint, reservation);
        }

        let change = accumulated.checked_sub(req.amount).filter(|c| *c > 0).map(|amount| ChangeRecord {
            account_id: req.account_id.clone(),
            asset_id: req.asset_id,
            amount,
        });

        let outcome = ReserveOutcome { reserved: chosen, change };
        if let Some(token) = &req.client_token {
            pool.by_client_token.insert(token.clone(), outcome.clone());
        }
        OP_COUNTERS.inc("reserve", &["ok"]);
        Ok(outcome)
    }

    /// Best-effort release of any still-live reservations matching
    /// `outpoints`; ones already expired or consumed are silently
    /// ignored (§4.5 `Cancel`).
    pub fn cancel(&self, outpoints: &[Outpoint]) {
        let pools = self.pools.lock().expect("reserver pools mutex poisoned");
        for pool_lock in pools.values() {
            let mut pool = pool_lock.lock().expect("reserver pool mutex poisoned");
            for outpoint in outpoints {
                pool.reservations.remove(outpoint);
            }
        }
        drop(pools);
        self.remove_persisted(outpoints);
    }

    fn remove_persisted(&self, outpoints: &[Outpoint]) {
        let store = match &self.store {
            Some(store) => store,
            None => return,
        };
        for outpoint in outpoints {
            if let Err(err) = store.remove_reservation(outpoint) {
                warn!("failed to remove persisted reservation for {}: {}", outpoint, err);
            }
        }
    }

    /// Applies a block-apply's confirmed-state changes: deleted outputs
    /// are dropped from whichever pool holds them; inserted outputs are
    /// pushed into their owning pool if that pool has already been
    /// loaded (an unloaded pool will pick them up on its next load)
    /// (§4.5 `Apply`). `owner` maps a newly-inserted output to the
    /// `(account_id, asset_id)` pool it belongs to, or `None` if it is
    /// not one this reserver tracks.
    pub fn apply(&self, deltas: &[OutputDelta], owner: impl Fn(&Outpoint, &Output) -> Option<(String, AssetId)>) {
        let spent: HashSet<Outpoint> = deltas
            .iter()
            .filter_map(|d| match d {
                OutputDelta::Spend(outpoint) => Some(*outpoint),
                OutputDelta::Insert(_, _) => None,
            })
            .collect();

        let mut pools = self.pools.lock().expect("reserver pools mutex poisoned");
        for pool_lock in pools.values() {
            let mut pool = pool_lock.lock().expect("reserver pool mutex poisoned");
            pool.candidates.retain(|c| !spent.contains(&c.outpoint));
            for outpoint in &spent {
                pool.reservations.remove(outpoint);
            }
        }
        drop(pools);
        let spent: Vec<Outpoint> = spent.into_iter().collect();
        self.remove_persisted(&spent);
        let mut pools = self.pools.lock().expect("reserver pools mutex poisoned");

        for delta in deltas {
            if let OutputDelta::Insert(outpoint, output) = delta {
                if let Some(key) = owner(outpoint, output) {
                    let pool_lock = pools.entry(key).or_insert_with(|| Mutex::new(Pool::default()));
                    let mut pool = pool_lock.lock().expect("reserver pool mutex poisoned");
                    if pool.loaded {
                        pool.candidates.push(Candidate { outpoint: *outpoint, output: output.clone() });
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chain_crypto::HashValue;
    use std::sync::Arc;

    struct FixedSource(Vec<(Outpoint, Output)>);

    impl CandidateSource for FixedSource {
        fn load(&self, _account_id: &str, _asset_id: &AssetId) -> Result<Vec<(Outpoint, Output)>> {
            Ok(self.0.clone())
        }
    }

    fn output(amount: u64) -> Output {
        Output::new(HashValue::sha3_256_of(b"usd"), amount, vec![], vec![])
    }

    fn request(amount: u64, token: Option<&str>) -> ReserveRequest {
        ReserveRequest {
            account_id: "acct-1".to_string(),
            asset_id: HashValue::sha3_256_of(b"usd"),
            amount,
            tx_hash_constraint: None,
            client_token: token.map(str::to_string),
        }
    }

    #[test]
    fn single_utxo_reserve_yields_change() {
        let outpoint = Outpoint::new(HashValue::sha3_256_of(b"tx"), 0);
        let reserver = Reserver::new(FixedSource(vec![(outpoint, output(100))]));

        let outcomes = reserver.reserve(&[request(50, None)], Duration::from_secs(60), 0).unwrap();
        let outcome = &outcomes[0];
        assert_eq!(outcome.reserved.len(), 1);
        assert_eq!(
            outcome.change,
            Some(ChangeRecord {
                account_id: "acct-1".to_string(),
                asset_id: HashValue::sha3_256_of(b"usd"),
                amount: 50,
            })
        );
    }

    #[test]
    fn second_reservation_of_same_single_utxo_hits_contention() {
        let outpoint = Outpoint::new(HashValue::sha3_256_of(b"tx"), 0);
        let reserver = Reserver::new(FixedSource(vec![(outpoint, output(100))]));

        reserver.reserve(&[request(50, None)], Duration::from_secs(60), 0).unwrap();
        let err = reserver.reserve(&[request(50, None)], Duration::from_secs(60), 0).unwrap_err();
        assert_eq!(ChainErrorKind::classify(&err), "reserved-contention");
    }

    #[test]
    fn insufficient_funds_when_total_value_too_low() {
        let outpoint = Outpoint::new(HashValue::sha3_256_of(b"tx"), 0);
        let reserver = Reserver::new(FixedSource(vec![(outpoint, output(40))]));

        let err = reserver.reserve(&[request(100, None)], Duration::from_secs(60), 0).unwrap_err();
        assert_eq!(ChainErrorKind::classify(&err), "insufficient-funds");
    }

    #[test]
    fn client_token_replays_the_same_outcome() {
        let outpoint = Outpoint::new(HashValue::sha3_256_of(b"tx"), 0);
        let reserver = Reserver::new(FixedSource(vec![(outpoint, output(100))]));

        let first = reserver.reserve(&[request(50, Some("retry-1"))], Duration::from_secs(60), 0).unwrap();
        let second = reserver.reserve(&[request(50, Some("retry-1"))], Duration::from_secs(60), 0).unwrap();
        assert_eq!(first[0].reserved, second[0].reserved);
    }

    #[test]
    fn expired_reservation_becomes_available_again() {
        let outpoint = Outpoint::new(HashValue::sha3_256_of(b"tx"), 0);
        let reserver = Reserver::new(FixedSource(vec![(outpoint, output(100))]));

        reserver.reserve(&[request(50, None)], Duration::from_secs(10), 0).unwrap();
        let outcome = reserver.reserve(&[request(50, None)], Duration::from_secs(10), 20).unwrap();
        assert_eq!(outcome[0].reserved.len(), 1);
    }

    #[test]
    fn cancel_releases_a_live_reservation() {
        let outpoint = Outpoint::new(HashValue::sha3_256_of(b"tx"), 0);
        let reserver = Reserver::new(FixedSource(vec![(outpoint, output(100))]));

        reserver.reserve(&[request(50, None)], Duration::from_secs(60), 0).unwrap();
        reserver.cancel(&[outpoint]);
        let outcome = reserver.reserve(&[request(50, None)], Duration::from_secs(60), 0).unwrap();
        assert_eq!(outcome[0].reserved.len(), 1);
    }

    #[test]
    fn apply_removes_spent_outputs_from_the_pool() {
        let outpoint = Outpoint::new(HashValue::sha3_256_of(b"tx"), 0);
        let reserver = Reserver::new(FixedSource(vec![(outpoint, output(100))]));
        reserver.reserve(&[request(50, None)], Duration::from_secs(60), 0).unwrap();

        reserver.apply(&[OutputDelta::Spend(outpoint)], |_, _| None);

        let err = reserver.reserve(&[request(50, None)], Duration::from_secs(60), 0).unwrap_err();
        assert_eq!(ChainErrorKind::classify(&err), "insufficient-funds");
    }

    #[test]
    fn concurrent_reservations_for_the_same_output_yield_exactly_one_success() {
        let outpoint = Outpoint::new(HashValue::sha3_256_of(b"tx"), 0);
        let reserver = Arc::new(Reserver::new(FixedSource(vec![(outpoint, output(100))])));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let reserver = Arc::clone(&reserver);
                std::thread::spawn(move || reserver.reserve(&[request(50, None)], Duration::from_secs(60), 0))
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let successes = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(successes, 1);
    }

    #[test]
    fn reservation_above_threshold_is_persisted_and_survives_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let outpoint = Outpoint::new(HashValue::sha3_256_of(b"tx"), 0);
        let reserver = Reserver::with_store(
            FixedSource(vec![(outpoint, output(100))]),
            Duration::from_secs(120),
            store.clone(),
        );

        reserver.reserve(&[request(50, None)], Duration::from_secs(300), 0).unwrap();
        assert_eq!(store.list_reservations().unwrap().len(), 1);

        let restarted = Reserver::with_store(FixedSource(vec![(outpoint, output(100))]), Duration::from_secs(120), store);
        restarted.restore_persisted_reservations().unwrap();
        let err = restarted.reserve(&[request(100, None)], Duration::from_secs(300), 0).unwrap_err();
        assert_eq!(ChainErrorKind::classify(&err), "reserved-contention");
    }

    #[test]
    fn reservation_below_threshold_is_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let outpoint = Outpoint::new(HashValue::sha3_256_of(b"tx"), 0);
        let reserver = Reserver::with_store(
            FixedSource(vec![(outpoint, output(100))]),
            Duration::from_secs(120),
            store.clone(),
        );

        reserver.reserve(&[request(50, None)], Duration::from_secs(10), 0).unwrap();
        assert!(store.list_reservations().unwrap().is_empty());
    }

    #[test]
    fn cancel_removes_a_persisted_reservation() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let outpoint = Outpoint::new(HashValue::sha3_256_of(b"tx"), 0);
        let reserver = Reserver::with_store(
            FixedSource(vec![(outpoint, output(100))]),
            Duration::from_secs(120),
            store.clone(),
        );

        reserver.reserve(&[request(50, None)], Duration::from_secs(300), 0).unwrap();
        reserver.cancel(&[outpoint]);
        assert!(store.list_reservations().unwrap().is_empty());
    }
}
