//! Content-independent redistribution of records across workers.

use std::iter::Fuse;

use crate::error::ConfigError;

/// Deals records round-robin over a fixed number of partitions.
///
/// Assignment only looks at arrival position, so an input sorted by key
/// still spreads every key's records over all partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Repartitioner {
    partitions: usize,
}

impl Repartitioner {
    pub fn new(partitions: usize) -> Result<Self, ConfigError> {
        if partitions == 0 {
            return Err(ConfigError::InvalidPartitions(0));
        }
        Ok(Self { partitions })
    }

    pub fn partitions(&self) -> usize {
        self.partitions
    }

    /// Deals the input lazily, at most `per_partition` records to each
    /// partition per round. Every round holds exactly `partitions`
    /// sub-sequences, some possibly empty; a record lands in partition
    /// `position % partitions` whatever the round size.
    pub fn chunks<R, I>(&self, records: I, per_partition: usize) -> Chunks<I::IntoIter>
    where
        I: IntoIterator<Item = R>,
    {
        Chunks {
            records: records.into_iter().fuse(),
            partitions: self.partitions,
            per_partition: per_partition.max(1),
        }
    }
}

pub struct Chunks<I> {
    records: Fuse<I>,
    partitions: usize,
    per_partition: usize,
}

impl<I: Iterator> Iterator for Chunks<I> {
    type Item = Vec<Vec<I::Item>>;

    fn next(&mut self) -> Option<Self::Item> {
        let first = self.records.next()?;
        let mut round: Vec<Vec<I::Item>> = (0..self.partitions).map(|_| Vec::new()).collect();
        round[0].push(first);
        let budget = self.partitions.saturating_mul(self.per_partition);
        for (position, record) in (1..budget).zip(self.records.by_ref()) {
            round[position % self.partitions].push(record);
        }
        Some(round)
    }
}
