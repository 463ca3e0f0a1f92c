// Copyright (c) The Chain Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! Small composable strategies reused by the property tests in
//! `chain-validator`, `chain-executor`, and `chain-reserver` that exercise
//! the invariants from §8: balance, outpoint uniqueness, chain
//! monotonicity, reservation exclusivity, pool coherence.

use proptest::collection::vec;
use proptest::prelude::*;
use proptest::sample::Index;

/// A strategy producing a `Vec<T>` of length `len` where every element is
/// distinct according to `key`. Used to generate transactions with
/// guaranteed-unique outpoints, or blocks with guaranteed-unique tx
/// hashes, without rejection-sampling the whole vector.
pub fn unique_vec<T: std::fmt::Debug + Clone, K: Eq + std::hash::Hash>(
    element: impl Strategy<Value = T> + Clone,
    len: impl Into<proptest::collection::SizeRange>,
    key: impl Fn(&T) -> K + Clone + 'static,
) -> impl Strategy<Value = Vec<T>> {
    vec(element, len).prop_map(move |items| {
        let mut seen = std::collections::HashSet::new();
        items
            .into_iter()
            .filter(|item| seen.insert(key(item)))
            .collect()
    })
}

/// Picks a pseudo-random element out of a non-empty slice, for mutation
/// strategies (e.g. "take one valid transaction and corrupt its
/// locktime").
pub fn pick<'a, T>(index: &Index, items: &'a [T]) -> &'a T {
    &items[index.index(items.len())]
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn unique_vec_never_repeats_keys(xs in unique_vec(0u32..1000, 0..20, |x: &u32| *x)) {
            let mut seen = std::collections::HashSet::new();
            for x in &xs {
                prop_assert!(seen.insert(*x));
            }
        }
    }
}
