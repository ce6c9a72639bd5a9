//! Bounded selection of the K greatest items under a caller-supplied order.

use std::sync::Arc;

use serde::Serialize;

use crate::combine::Aggregate;

/// Strict "ranks lower than" relation. `less(a, b)` means `b` beats `a`.
pub type Comparator<T> = Arc<dyn Fn(&T, &T) -> bool + Send + Sync>;

/// Larger totals rank higher.
pub fn by_total_descending<K, V>() -> Comparator<Aggregate<K, V>>
where
    K: 'static,
    V: Ord + 'static,
{
    Arc::new(|a: &Aggregate<K, V>, b: &Aggregate<K, V>| a.total < b.total)
}

/// An aggregate with its 1-based position in the final ranking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RankedEntry<K, V> {
    pub rank: usize,
    pub aggregate: Aggregate<K, V>,
}

/// Numbers an already ordered list, best first.
pub fn ranked<K, V>(ordered: Vec<Aggregate<K, V>>) -> Vec<RankedEntry<K, V>> {
    ordered
        .into_iter()
        .enumerate()
        .map(|(i, aggregate)| RankedEntry { rank: i + 1, aggregate })
        .collect()
}

struct Slot<T> {
    seq: u64,
    item: T,
}

/// Keeps at most `k` items in a min-heap whose root is the weakest survivor.
///
/// Items equal under the comparator rank by arrival: the earlier one wins.
/// The comparator is trusted as given; an inconsistent one yields an
/// arbitrary (but bounded) selection rather than a panic.
pub struct TopKSelector<T> {
    k: usize,
    less: Comparator<T>,
    heap: Vec<Slot<T>>,
    next_seq: u64,
}

impl<T> TopKSelector<T> {
    pub fn new(k: usize, less: Comparator<T>) -> Self {
        Self {
            k,
            less,
            heap: Vec::with_capacity(k.min(1 << 16)),
            next_seq: 0,
        }
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// O(log k) per call.
    pub fn push(&mut self, item: T) {
        if self.k == 0 {
            return;
        }
        let slot = Slot { seq: self.next_seq, item };
        self.next_seq += 1;

        if self.heap.len() < self.k {
            self.heap.push(slot);
            self.sift_up(self.heap.len() - 1);
        } else if below(&self.less, &self.heap[0], &slot) {
            self.heap[0] = slot;
            self.sift_down(0);
        }
    }

    pub fn extend<I: IntoIterator<Item = T>>(&mut self, items: I) {
        for item in items {
            self.push(item);
        }
    }

    /// Folds partial results (each best first, as returned by [`finish`])
    /// into one selection. Partials are consumed in the order given, which
    /// decides ties between them.
    ///
    /// [`finish`]: TopKSelector::finish
    pub fn merge<I>(k: usize, less: Comparator<T>, partials: I) -> Self
    where
        I: IntoIterator<Item = Vec<T>>,
    {
        let mut merged = Self::new(k, less);
        for partial in partials {
            merged.extend(partial);
        }
        merged
    }

    /// Drains the selection, best first.
    pub fn finish(mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.heap.len());
        while let Some(slot) = self.pop_min() {
            out.push(slot.item);
        }
        out.reverse();
        out
    }

    fn pop_min(&mut self) -> Option<Slot<T>> {
        let last = self.heap.pop()?;
        if self.heap.is_empty() {
            return Some(last);
        }
        let min = std::mem::replace(&mut self.heap[0], last);
        self.sift_down(0);
        Some(min)
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if below(&self.less, &self.heap[i], &self.heap[parent]) {
                self.heap.swap(i, parent);
                i = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut i: usize) {
        let n = self.heap.len();
        loop {
            let left = 2 * i + 1;
            let right = left + 1;
            let mut weakest = i;
            if left < n && below(&self.less, &self.heap[left], &self.heap[weakest]) {
                weakest = left;
            }
            if right < n && below(&self.less, &self.heap[right], &self.heap[weakest]) {
                weakest = right;
            }
            if weakest == i {
                break;
            }
            self.heap.swap(i, weakest);
            i = weakest;
        }
    }
}

// Later arrivals lose ties.
fn below<T>(less: &Comparator<T>, a: &Slot<T>, b: &Slot<T>) -> bool {
    if less(&a.item, &b.item) {
        return true;
    }
    if less(&b.item, &a.item) {
        return false;
    }
    a.seq > b.seq
}
