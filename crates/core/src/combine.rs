//! Per-key reduction with an associative, commutative operator.
//!
//! Reduction happens twice: each partition folds its own contributions into
//! a [`PartialAggregates`], then partials for the same key are folded again
//! during the merge. Because the operator is a commutative monoid the final
//! totals do not depend on how records were partitioned or ordered.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use serde::{Deserialize, Serialize};
use tracing::warn;
use xxhash_rust::xxh3::Xxh3;

use crate::error::CombineError;
use crate::metrics::{Counter, Metrics};

/// What a bounded sum does when the result does not fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Report `CombineError::Overflow`.
    #[default]
    Fail,
    /// Clamp to the type's bounds.
    Saturate,
}

/// What the pipeline does with a `CombineError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombineErrorPolicy {
    #[default]
    Fail,
    /// Drop the offending contribution and count it as `combine_errors`.
    SkipAndCount,
}

/// A commutative monoid over `Value`.
///
/// `combine` must be associative and commutative and `identity` must be its
/// neutral element; nothing checks this at runtime.
pub trait Monoid: Send + Sync {
    type Value: Clone + Send + Sync;

    fn identity(&self) -> Self::Value;

    fn combine(&self, left: &Self::Value, right: &Self::Value) -> Result<Self::Value, CombineError>;
}

/// Fixed-width integers usable with [`Sum`].
pub trait CheckedInt: Copy + Default + fmt::Display + Send + Sync + 'static {
    fn checked_add(self, rhs: Self) -> Option<Self>;
    fn saturating_add(self, rhs: Self) -> Self;
}

macro_rules! checked_int {
    ($($t:ty),* $(,)?) => {
        $(
            impl CheckedInt for $t {
                fn checked_add(self, rhs: Self) -> Option<Self> {
                    <$t>::checked_add(self, rhs)
                }

                fn saturating_add(self, rhs: Self) -> Self {
                    <$t>::saturating_add(self, rhs)
                }
            }
        )*
    };
}

checked_int!(i32, i64, i128, u32, u64, u128, usize);

/// Integer addition with an explicit overflow policy.
pub struct Sum<V> {
    overflow: OverflowPolicy,
    _value: PhantomData<fn() -> V>,
}

impl<V> Sum<V> {
    pub fn new(overflow: OverflowPolicy) -> Self {
        Self { overflow, _value: PhantomData }
    }

    pub fn overflow(&self) -> OverflowPolicy {
        self.overflow
    }
}

impl<V> Default for Sum<V> {
    fn default() -> Self {
        Self::new(OverflowPolicy::default())
    }
}

impl<V> fmt::Debug for Sum<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sum").field("overflow", &self.overflow).finish()
    }
}

impl<V: CheckedInt> Monoid for Sum<V> {
    type Value = V;

    fn identity(&self) -> V {
        V::default()
    }

    fn combine(&self, left: &V, right: &V) -> Result<V, CombineError> {
        match self.overflow {
            OverflowPolicy::Fail => left.checked_add(*right).ok_or_else(|| CombineError::Overflow {
                left: left.to_string(),
                right: right.to_string(),
            }),
            OverflowPolicy::Saturate => Ok(left.saturating_add(*right)),
        }
    }
}

/// The reduction of every contribution seen so far for one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aggregate<K, V> {
    pub key: K,
    pub total: V,
}

/// Aggregates for one partition (or one merged key range), iterated in the
/// order keys were first seen.
#[derive(Debug, Clone)]
pub struct PartialAggregates<K, V> {
    slots: HashMap<K, usize>,
    entries: Vec<Aggregate<K, V>>,
}

impl<K, V> Default for PartialAggregates<K, V> {
    fn default() -> Self {
        Self { slots: HashMap::new(), entries: Vec::new() }
    }
}

impl<K, V> PartialAggregates<K, V>
where
    K: Hash + Eq + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.slots.get(key).map(|&slot| &self.entries[slot].total)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Aggregate<K, V>> {
        self.entries.iter()
    }

    pub fn into_aggregates(self) -> Vec<Aggregate<K, V>> {
        self.entries
    }

    /// Routes every key to one of `buckets` outputs by a fixed hash, so a key
    /// lands in the same bucket index no matter which partition produced it.
    pub fn split_by_key(self, buckets: usize) -> Vec<PartialAggregates<K, V>> {
        let buckets = buckets.max(1);
        let mut out: Vec<PartialAggregates<K, V>> =
            (0..buckets).map(|_| PartialAggregates::new()).collect();
        for aggregate in self.entries {
            let bucket = bucket_of(&aggregate.key, buckets);
            out[bucket].push(aggregate);
        }
        out
    }

    fn push(&mut self, aggregate: Aggregate<K, V>) {
        self.slots.insert(aggregate.key.clone(), self.entries.len());
        self.entries.push(aggregate);
    }
}

const BUCKET_SEED: u64 = 0;

// xxh3 with a fixed seed: the bucket depends only on the bytes the key's
// `Hash` impl feeds in, not on the std hasher of the current toolchain.
fn bucket_of<K: Hash>(key: &K, buckets: usize) -> usize {
    let mut hasher = Xxh3::with_seed(BUCKET_SEED);
    key.hash(&mut hasher);
    (hasher.finish() % buckets as u64) as usize
}

/// Applies a [`Monoid`] per key, honouring the configured error policy.
#[derive(Debug)]
pub struct Combiner<M> {
    op: M,
    policy: CombineErrorPolicy,
}

impl<M: Monoid> Combiner<M> {
    pub fn new(op: M, policy: CombineErrorPolicy) -> Self {
        Self { op, policy }
    }

    pub fn policy(&self) -> CombineErrorPolicy {
        self.policy
    }

    /// Folds one contribution into `partial`.
    pub fn fold<K>(
        &self,
        partial: &mut PartialAggregates<K, M::Value>,
        key: K,
        value: M::Value,
        metrics: &dyn Metrics,
    ) -> Result<(), CombineError>
    where
        K: Hash + Eq + Clone,
    {
        match partial.slots.get(&key) {
            Some(&slot) => {
                let entry = &mut partial.entries[slot];
                match self.op.combine(&entry.total, &value) {
                    Ok(total) => entry.total = total,
                    Err(err) => self.on_error(err, metrics)?,
                }
            }
            None => match self.op.combine(&self.op.identity(), &value) {
                Ok(total) => partial.push(Aggregate { key, total }),
                Err(err) => self.on_error(err, metrics)?,
            },
        }
        Ok(())
    }

    /// Local phase: reduces a run of contributions from one partition.
    pub fn reduce<K, I>(
        &self,
        contributions: I,
        metrics: &dyn Metrics,
    ) -> Result<PartialAggregates<K, M::Value>, CombineError>
    where
        K: Hash + Eq + Clone,
        I: IntoIterator<Item = (K, M::Value)>,
    {
        let mut partial = PartialAggregates::new();
        for (key, value) in contributions {
            self.fold(&mut partial, key, value, metrics)?;
        }
        Ok(partial)
    }

    /// Merge phase: folds partials in the order given. Key order in the result
    /// is first-seen across that order.
    pub fn merge<K, I>(
        &self,
        partials: I,
        metrics: &dyn Metrics,
    ) -> Result<PartialAggregates<K, M::Value>, CombineError>
    where
        K: Hash + Eq + Clone,
        I: IntoIterator<Item = PartialAggregates<K, M::Value>>,
    {
        let mut merged = PartialAggregates::new();
        for partial in partials {
            for Aggregate { key, total } in partial.entries {
                self.fold(&mut merged, key, total, metrics)?;
            }
        }
        Ok(merged)
    }

    fn on_error(&self, err: CombineError, metrics: &dyn Metrics) -> Result<(), CombineError> {
        match self.policy {
            CombineErrorPolicy::Fail => Err(err),
            CombineErrorPolicy::SkipAndCount => {
                warn!(error = %err, "dropping contribution");
                metrics.inc(Counter::CombineErrors, 1);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::testing::CountingMetrics;
    use crate::metrics::NoopMetrics;

    fn sum_i64() -> Combiner<Sum<i64>> {
        Combiner::new(Sum::default(), CombineErrorPolicy::Fail)
    }

    #[test]
    fn sums_per_key_in_first_seen_order() {
        let partial = sum_i64()
            .reduce(vec![(2u64, 1i64), (1, 1), (2, 1), (3, 5)], &NoopMetrics)
            .unwrap();
        let aggregates = partial.into_aggregates();
        assert_eq!(
            aggregates,
            vec![
                Aggregate { key: 2, total: 2 },
                Aggregate { key: 1, total: 1 },
                Aggregate { key: 3, total: 5 },
            ]
        );
    }

    #[test]
    fn overflow_fails_by_default() {
        let err = sum_i64()
            .reduce(vec![("k", i64::MAX), ("k", 1)], &NoopMetrics)
            .unwrap_err();
        assert!(matches!(err, CombineError::Overflow { .. }));
    }

    #[test]
    fn overflow_saturates_when_asked() {
        let combiner = Combiner::new(Sum::<u32>::new(OverflowPolicy::Saturate), CombineErrorPolicy::Fail);
        let partial = combiner.reduce(vec![("k", u32::MAX), ("k", 7)], &NoopMetrics).unwrap();
        assert_eq!(partial.get(&"k"), Some(&u32::MAX));
    }

    #[test]
    fn skip_and_count_keeps_previous_total() {
        let metrics = CountingMetrics::default();
        let combiner = Combiner::new(Sum::<i32>::default(), CombineErrorPolicy::SkipAndCount);
        let partial = combiner
            .reduce(vec![("a", i32::MAX), ("a", 1), ("b", 2)], &metrics)
            .unwrap();
        assert_eq!(partial.get(&"a"), Some(&i32::MAX));
        assert_eq!(partial.get(&"b"), Some(&2));
        assert_eq!(metrics.get(Counter::CombineErrors), 1);
    }

    #[test]
    fn merge_matches_single_pass() {
        let combiner = sum_i64();
        let input: Vec<(u8, i64)> = (0..60).map(|i| ((i % 7) as u8, i as i64)).collect();

        let whole = combiner.reduce(input.clone(), &NoopMetrics).unwrap();
        let partials: Vec<_> = input
            .chunks(9)
            .map(|chunk| combiner.reduce(chunk.iter().rev().copied(), &NoopMetrics).unwrap())
            .collect();
        let merged = combiner.merge(partials.into_iter().rev(), &NoopMetrics).unwrap();

        assert_eq!(merged.len(), whole.len());
        for aggregate in whole.iter() {
            assert_eq!(merged.get(&aggregate.key), Some(&aggregate.total));
        }
    }

    #[test]
    fn split_by_key_is_disjoint_and_complete() {
        let partial = sum_i64()
            .reduce((0..100u64).map(|k| (k, 1i64)), &NoopMetrics)
            .unwrap();
        let buckets = partial.split_by_key(4);
        assert_eq!(buckets.len(), 4);
        assert_eq!(buckets.iter().map(PartialAggregates::len).sum::<usize>(), 100);
        for key in 0..100u64 {
            let holders = buckets.iter().filter(|b| b.get(&key).is_some()).count();
            assert_eq!(holders, 1, "key {key} must live in exactly one bucket");
        }
    }

    #[test]
    fn same_key_same_bucket_across_partials() {
        let combiner = sum_i64();
        let left = combiner.reduce(vec![(42u64, 1i64), (7, 1)], &NoopMetrics).unwrap();
        let right = combiner.reduce(vec![(7u64, 1i64), (42, 1)], &NoopMetrics).unwrap();
        let left = left.split_by_key(3);
        let right = right.split_by_key(3);
        for key in [7u64, 42] {
            let l = left.iter().position(|b| b.get(&key).is_some());
            let r = right.iter().position(|b| b.get(&key).is_some());
            assert_eq!(l, r);
        }
    }

    #[test]
    fn bucket_is_seeded_xxh3_of_key_bytes() {
        use xxhash_rust::xxh3::xxh3_64_with_seed;

        for key in [0u64, 7, 42, u64::MAX] {
            let expected = (xxh3_64_with_seed(&key.to_ne_bytes(), BUCKET_SEED) % 5) as usize;
            assert_eq!(bucket_of(&key, 5), expected, "key {key}");
        }
    }

    struct Max;

    impl Monoid for Max {
        type Value = u64;

        fn identity(&self) -> u64 {
            0
        }

        fn combine(&self, left: &u64, right: &u64) -> Result<u64, CombineError> {
            Ok(*left.max(right))
        }
    }

    #[test]
    fn any_commutative_monoid_works() {
        let combiner = Combiner::new(Max, CombineErrorPolicy::Fail);
        let partial = combiner
            .reduce(vec![("x", 3u64), ("y", 9), ("x", 11), ("x", 4)], &NoopMetrics)
            .unwrap();
        assert_eq!(partial.get(&"x"), Some(&11));
        assert_eq!(partial.get(&"y"), Some(&9));
    }
}
