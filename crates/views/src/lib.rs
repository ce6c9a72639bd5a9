//! Incremental versions of the per-key sum and top-K, maintained by
//! differential dataflow as records are added and retracted.

use differential_dataflow::lattice::Lattice;
use differential_dataflow::operators::reduce::Reduce;
use differential_dataflow::Collection;
use timely::dataflow::Scope;
use tracing::{trace, warn};

/// Running total per key. Input values are contributions; a retracted
/// contribution is subtracted again.
///
/// A key whose total does not fit in `i64` has no output row while it
/// overflows; it reappears once retractions bring it back into range.
pub fn sum_per_key<G>(contributions: &Collection<G, (u64, i64)>) -> Collection<G, (u64, i64)>
where
    G: Scope,
    G::Timestamp: Lattice + Ord,
{
    contributions.reduce(|key, inputs, output| {
        let total = inputs.iter().try_fold(0i64, |sum, (value, count)| {
            let count = i64::try_from(*count).ok()?;
            value.checked_mul(count).and_then(|part| sum.checked_add(part))
        });
        match total {
            Some(sum) => output.push((sum, 1)),
            None => warn!(key = *key, "total overflows i64, key withheld from view"),
        }
    })
}

/// Occurrences per key, e.g. ratings per user.
pub fn count_per_key<G>(keys: &Collection<G, u64>) -> Collection<G, (u64, i64)>
where
    G: Scope,
    G::Timestamp: Lattice + Ord,
{
    sum_per_key(&keys.map(|key| (key, 1)))
}

/// The `k` keys with the largest totals. Equal totals rank by ascending key.
pub fn top_k<G>(totals: &Collection<G, (u64, i64)>, k: usize) -> Collection<G, (u64, i64)>
where
    G: Scope,
    G::Timestamp: Lattice + Ord,
{
    totals
        .map(|(key, total)| ((), (total, key)))
        .reduce(move |_unit, inputs, output| {
            let mut ranked: Vec<(i64, u64)> = inputs
                .iter()
                .filter(|(_, count)| *count > 0)
                .map(|(entry, _)| **entry)
                .collect();
            ranked.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
            ranked.truncate(k);
            trace!(kept = ranked.len(), "top-k recomputed");
            for entry in ranked {
                output.push((entry, 1));
            }
        })
        .map(|((), (total, key))| (key, total))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use differential_dataflow::input::InputSession;

    use super::*;

    type Update = ((u64, i64), isize);

    // Feeds one batch per epoch and returns the consolidated final contents,
    // best first.
    fn final_state(batches: Vec<Vec<Update>>, k: Option<usize>) -> Vec<(u64, i64)> {
        let seen: Arc<Mutex<Vec<Update>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        timely::execute_directly(move |worker| {
            let mut input: InputSession<u64, (u64, i64), isize> = InputSession::new();
            let probe = worker.dataflow::<u64, _, _>(|scope| {
                let totals = sum_per_key(&input.to_collection(scope));
                let view = match k {
                    Some(k) => top_k(&totals, k),
                    None => totals,
                };
                view.inspect(move |(data, _time, diff)| sink.lock().unwrap().push((*data, *diff)))
                    .probe()
            });
            for (epoch, batch) in batches.into_iter().enumerate() {
                for (record, diff) in batch {
                    input.update(record, diff);
                }
                input.advance_to(epoch as u64 + 1);
                input.flush();
                while probe.less_than(input.time()) {
                    worker.step();
                }
            }
        });

        let mut net: HashMap<(u64, i64), isize> = HashMap::new();
        for (data, diff) in seen.lock().unwrap().iter() {
            *net.entry(*data).or_default() += *diff;
        }
        let mut out: Vec<(u64, i64)> = net.into_iter().filter(|(_, diff)| *diff != 0).map(|(d, _)| d).collect();
        out.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        out
    }

    #[test]
    fn sums_contributions_per_key() {
        let out = final_state(vec![vec![((1, 2), 1), ((2, 5), 1), ((1, 3), 1), ((2, 1), 2)]], None);
        assert_eq!(out, vec![(2, 7), (1, 5)]);
    }

    #[test]
    fn retraction_updates_the_total() {
        let out = final_state(vec![vec![((1, 4), 1), ((2, 1), 1)], vec![((1, 4), -1), ((1, 1), 1)]], None);
        assert_eq!(out, vec![(1, 1), (2, 1)]);
    }

    #[test]
    fn overflowing_total_is_withheld() {
        let out = final_state(vec![vec![((1, i64::MAX), 1), ((1, 1), 1), ((2, 3), 1)]], None);
        assert_eq!(out, vec![(2, 3)]);
    }

    #[test]
    fn overflowing_key_returns_after_retraction() {
        let out = final_state(
            vec![vec![((1, i64::MAX), 1), ((2, 3), 1)], vec![((1, 1), 1)], vec![((1, 1), -1)]],
            None,
        );
        assert_eq!(out, vec![(1, i64::MAX), (2, 3)]);
    }

    #[test]
    fn top_k_breaks_ties_by_key() {
        let out = final_state(vec![vec![((1, 30), 1), ((3, 20), 1), ((2, 20), 1), ((4, 5), 1)]], Some(2));
        assert_eq!(out, vec![(1, 30), (2, 20)]);
    }

    #[test]
    fn top_k_follows_later_epochs() {
        let out = final_state(
            vec![
                vec![((1, 30), 1), ((2, 20), 1), ((3, 20), 1)],
                vec![((3, 15), 1)],
            ],
            Some(2),
        );
        assert_eq!(out, vec![(3, 35), (1, 30)]);
    }

    #[test]
    fn top_k_of_nothing_is_empty() {
        assert!(final_state(vec![vec![]], Some(3)).is_empty());
    }
}
