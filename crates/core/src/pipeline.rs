//! Wires repartition, extraction, combining and selection into one run.
//!
//! A run has parallel stages separated by barriers:
//!
//! 1. input is dealt in bounded rounds; in each round every partition
//!    extracts its records and folds them into its running partial, so raw
//!    records never pile up beyond one round;
//! 2. each partial is split by key hash into one bucket per partition;
//! 3. worker `j` merges bucket `j` of every partial (final totals for a
//!    disjoint key range) and keeps a local top-K.
//!
//! The driver then merges the local top-K lists into the final ranking.

use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::combine::{Aggregate, Combiner, Monoid, PartialAggregates};
use crate::config::PipelineConfig;
use crate::error::{ConfigError, PipelineError};
use crate::executor::{CancelToken, Executor};
use crate::format::Formatter;
use crate::metrics::{Counter, Metrics, NoopMetrics};
use crate::partition::Repartitioner;
use crate::topk::{by_total_descending, ranked, Comparator, RankedEntry, TopKSelector};
use crate::transform::Transform;

pub struct PipelineBuilder<R, K, X, M: Monoid, E> {
    config: PipelineConfig,
    executor: E,
    extractor: Option<X>,
    op: Option<M>,
    less: Comparator<Aggregate<K, M::Value>>,
    metrics: Arc<dyn Metrics>,
    cancel: CancelToken,
    _records: PhantomData<fn(R)>,
}

impl<R, K, X, M, E> PipelineBuilder<R, K, X, M, E>
where
    K: 'static,
    M: Monoid,
    M::Value: Ord + 'static,
{
    /// Ranks by descending total.
    pub fn new(config: PipelineConfig, executor: E) -> Self {
        Self::with_comparator(config, executor, by_total_descending())
    }
}

impl<R, K, X, M: Monoid, E> PipelineBuilder<R, K, X, M, E> {
    pub fn with_comparator(
        config: PipelineConfig,
        executor: E,
        less: Comparator<Aggregate<K, M::Value>>,
    ) -> Self {
        Self {
            config,
            executor,
            extractor: None,
            op: None,
            less,
            metrics: Arc::new(NoopMetrics),
            cancel: CancelToken::new(),
            _records: PhantomData,
        }
    }

    pub fn extractor(mut self, extractor: X) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn combine(mut self, op: M) -> Self {
        self.op = Some(op);
        self
    }

    pub fn comparator(mut self, less: Comparator<Aggregate<K, M::Value>>) -> Self {
        self.less = less;
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Validates the configuration. Nothing is read before this succeeds.
    pub fn build(self) -> Result<Pipeline<R, K, X, M, E>, ConfigError> {
        let top_k = self.config.top_k()?;
        let repartitioner = Repartitioner::new(self.config.partitions()?)?;
        let chunk_size = self.config.chunk_size()?;
        let extractor = self.extractor.ok_or(ConfigError::MissingOperator("key extractor"))?;
        let op = self.op.ok_or(ConfigError::MissingOperator("combine operator"))?;
        Ok(Pipeline {
            top_k,
            repartitioner,
            chunk_size,
            extractor: Arc::new(extractor),
            combiner: Arc::new(Combiner::new(op, self.config.on_combine_error)),
            less: self.less,
            executor: self.executor,
            metrics: self.metrics,
            cancel: self.cancel,
            _records: PhantomData,
        })
    }
}

pub struct Pipeline<R, K, X, M: Monoid, E> {
    top_k: usize,
    repartitioner: Repartitioner,
    chunk_size: usize,
    extractor: Arc<X>,
    combiner: Arc<Combiner<M>>,
    less: Comparator<Aggregate<K, M::Value>>,
    executor: E,
    metrics: Arc<dyn Metrics>,
    cancel: CancelToken,
    _records: PhantomData<fn(R)>,
}

impl<R, K, X, M, E> Pipeline<R, K, X, M, E>
where
    R: Send + 'static,
    K: Hash + Eq + Clone + Send + Sync + 'static,
    X: Transform<R, Output = (K, M::Value)> + 'static,
    M: Monoid + 'static,
    M::Value: 'static,
    E: Executor,
{
    pub fn top_k(&self) -> usize {
        self.top_k
    }

    pub fn partitions(&self) -> usize {
        self.repartitioner.partitions()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn metrics(&self) -> &dyn Metrics {
        &*self.metrics
    }

    /// Runs the whole pipeline and returns the ranking, best first.
    ///
    /// Input is pulled one round at a time: each round deals at most
    /// `chunk_size` records to every partition, which folds them into its
    /// running partial before the next round is read.
    pub fn run<I>(&self, records: I) -> Result<Vec<RankedEntry<K, M::Value>>, PipelineError>
    where
        I: IntoIterator<Item = R>,
    {
        let buckets = self.repartitioner.partitions();
        info!(partitions = buckets, top_k = self.top_k, chunk_size = self.chunk_size, "pipeline started");

        let mut partials: Vec<PartialAggregates<K, M::Value>> =
            (0..buckets).map(|_| PartialAggregates::new()).collect();
        for (round, chunk) in self.repartitioner.chunks(records, self.chunk_size).enumerate() {
            let inputs: Vec<(PartialAggregates<K, M::Value>, Vec<R>)> = partials.into_iter().zip(chunk).collect();
            let extractor = Arc::clone(&self.extractor);
            let combiner = Arc::clone(&self.combiner);
            let metrics = Arc::clone(&self.metrics);
            let cancel = self.cancel.clone();
            let folded = self.executor.run_partitions(
                inputs,
                move |index, (partial, records)| -> Result<PartialAggregates<K, M::Value>, PipelineError> {
                    local_combine(index, partial, records, &*extractor, &combiner, &*metrics, &cancel)
                },
            )?;
            partials = self.barrier("combine", folded)?;
            debug!(round, "round combined");
        }
        if self.cancel.is_cancelled() {
            return Err(self.abort("combine", PipelineError::Cancelled, partials.len()));
        }

        let shuffled = self
            .executor
            .run_partitions(partials, move |_, partial| partial.split_by_key(buckets))?;

        let mut by_bucket: Vec<Vec<PartialAggregates<K, M::Value>>> =
            (0..buckets).map(|_| Vec::with_capacity(shuffled.len())).collect();
        for split in shuffled {
            for (bucket, part) in split.into_iter().enumerate() {
                by_bucket[bucket].push(part);
            }
        }

        let local_tops = {
            let combiner = Arc::clone(&self.combiner);
            let metrics = Arc::clone(&self.metrics);
            let cancel = self.cancel.clone();
            let less = Arc::clone(&self.less);
            let k = self.top_k;
            self.executor.run_partitions(
                by_bucket,
                move |index, partials| -> Result<Vec<Aggregate<K, M::Value>>, PipelineError> {
                    if cancel.is_cancelled() {
                        return Err(PipelineError::Cancelled);
                    }
                    let merged = combiner.merge(partials, &*metrics)?;
                    metrics.inc(Counter::DistinctKeys, merged.len() as u64);
                    let mut selector = TopKSelector::new(k, Arc::clone(&less));
                    selector.extend(merged.into_aggregates());
                    debug!(bucket = index, kept = selector.len(), "local top-k done");
                    Ok(selector.finish())
                },
            )?
        };
        let local_tops = self.barrier("select", local_tops)?;

        let top = TopKSelector::merge(self.top_k, Arc::clone(&self.less), local_tops).finish();
        info!(emitted = top.len(), "pipeline finished");
        Ok(ranked(top))
    }

    /// Runs the pipeline and renders the ranking.
    pub fn run_formatted<I, F>(&self, records: I, formatter: &F) -> Result<Vec<String>, PipelineError>
    where
        I: IntoIterator<Item = R>,
        F: Formatter<K, M::Value>,
    {
        let ranking = self.run(records)?;
        Ok(formatter.format(&ranking, &*self.metrics))
    }

    // Every partition must succeed before the next stage starts. On failure or
    // cancellation the finished partials are dropped, not merged.
    fn barrier<T>(&self, stage: &str, results: Vec<Result<T, PipelineError>>) -> Result<Vec<T>, PipelineError> {
        let total = results.len();
        let mut done = Vec::with_capacity(total);
        let mut first_err = None;
        for result in results {
            match result {
                Ok(value) => done.push(value),
                Err(err) => {
                    first_err.get_or_insert(err);
                }
            }
        }
        if first_err.is_none() && self.cancel.is_cancelled() {
            first_err = Some(PipelineError::Cancelled);
        }
        match first_err {
            None => Ok(done),
            Some(err) => Err(self.abort(stage, err, done.len())),
        }
    }

    fn abort(&self, stage: &str, err: PipelineError, discarded: usize) -> PipelineError {
        warn!(stage, error = %err, discarded, "stage aborted");
        self.metrics.inc(Counter::PartialsDiscarded, discarded as u64);
        err
    }
}

fn local_combine<R, K, X, M>(
    index: usize,
    mut partial: PartialAggregates<K, M::Value>,
    records: Vec<R>,
    extractor: &X,
    combiner: &Combiner<M>,
    metrics: &dyn Metrics,
    cancel: &CancelToken,
) -> Result<PartialAggregates<K, M::Value>, PipelineError>
where
    K: Hash + Eq + Clone,
    X: Transform<R, Output = (K, M::Value)>,
    M: Monoid,
{
    let mut seen = 0u64;
    let mut skipped = 0u64;
    let mut contributions = 0u64;
    for record in records {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        seen += 1;
        let mut produced = 0u64;
        for (key, value) in extractor.apply(&record) {
            produced += 1;
            combiner.fold(&mut partial, key, value, metrics)?;
        }
        if produced == 0 {
            skipped += 1;
        }
        contributions += produced;
    }
    metrics.inc(Counter::RecordsIn, seen);
    metrics.inc(Counter::RecordsSkipped, skipped);
    metrics.inc(Counter::Contributions, contributions);
    debug!(partition = index, records = seen, keys = partial.len(), "records folded");
    Ok(partial)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::combine::{CombineErrorPolicy, Sum};
    use crate::error::CombineError;
    use crate::executor::SequentialExecutor;
    use crate::metrics::testing::CountingMetrics;
    use crate::transform::{Extracted, KeyExtractor};

    type Pair = (u32, i64);

    fn by_first(pair: &Pair) -> Extracted<u32, i64> {
        Extracted::Keyed(pair.0, pair.1)
    }

    fn config(top_k: i64, partitions: i64) -> PipelineConfig {
        PipelineConfig { top_k, partitions, ..PipelineConfig::default() }
    }

    fn totals(entries: &[RankedEntry<u32, i64>]) -> Vec<(u32, i64)> {
        entries.iter().map(|e| (e.aggregate.key, e.aggregate.total)).collect()
    }

    #[test]
    fn ranks_by_summed_contribution() {
        let pipeline = PipelineBuilder::new(config(2, 3), SequentialExecutor)
            .extractor(KeyExtractor::new(by_first))
            .combine(Sum::<i64>::default())
            .build()
            .unwrap();
        let out = pipeline.run(vec![(1, 5), (2, 1), (3, 4), (2, 9), (1, 1)]).unwrap();
        assert_eq!(totals(&out), vec![(2, 10), (1, 6)]);
        assert_eq!(out[0].rank, 1);
    }

    #[test]
    fn missing_operator_is_a_config_error() {
        let result = PipelineBuilder::<Pair, u32, KeyExtractor<fn(&Pair) -> Extracted<u32, i64>>, Sum<i64>, _>::new(
            config(1, 1),
            SequentialExecutor,
        )
        .extractor(KeyExtractor::new(by_first as fn(&Pair) -> Extracted<u32, i64>))
        .build();
        assert!(matches!(result, Err(ConfigError::MissingOperator("combine operator"))));
    }

    #[test]
    fn invalid_counts_fail_before_running() {
        let build = |cfg: PipelineConfig| -> Result<Pipeline<Pair, u32, _, Sum<i64>, SequentialExecutor>, ConfigError> {
            PipelineBuilder::new(cfg, SequentialExecutor)
                .extractor(KeyExtractor::new(by_first))
                .combine(Sum::<i64>::default())
                .build()
        };
        assert!(matches!(build(config(-1, 1)), Err(ConfigError::InvalidTopK(-1))));
        assert!(matches!(build(config(3, 0)), Err(ConfigError::InvalidPartitions(0))));
    }

    #[test]
    fn skipped_records_are_counted() {
        let metrics = Arc::new(CountingMetrics::default());
        let pipeline = PipelineBuilder::new(config(10, 2), SequentialExecutor)
            .extractor(KeyExtractor::new(|pair: &Pair| {
                if pair.1 < 0 {
                    Extracted::Skip
                } else {
                    Extracted::Keyed(pair.0, pair.1)
                }
            }))
            .combine(Sum::<i64>::default())
            .metrics(metrics.clone())
            .build()
            .unwrap();
        let out = pipeline.run(vec![(1, 1), (1, -1), (2, 2)]).unwrap();
        assert_eq!(totals(&out), vec![(2, 2), (1, 1)]);
        assert_eq!(metrics.get(Counter::RecordsIn), 3);
        assert_eq!(metrics.get(Counter::RecordsSkipped), 1);
        assert_eq!(metrics.get(Counter::Contributions), 2);
        assert_eq!(metrics.get(Counter::DistinctKeys), 2);
    }

    #[test]
    fn overflow_fails_the_run_by_default() {
        let pipeline = PipelineBuilder::new(config(1, 1), SequentialExecutor)
            .extractor(KeyExtractor::new(by_first))
            .combine(Sum::<i64>::default())
            .build()
            .unwrap();
        let err = pipeline.run(vec![(1, i64::MAX), (1, 1)]).unwrap_err();
        assert!(matches!(err, PipelineError::Combine(CombineError::Overflow { .. })));
    }

    #[test]
    fn skip_and_count_policy_keeps_running() {
        let metrics = Arc::new(CountingMetrics::default());
        let cfg = PipelineConfig {
            on_combine_error: CombineErrorPolicy::SkipAndCount,
            ..config(5, 1)
        };
        let pipeline = PipelineBuilder::new(cfg, SequentialExecutor)
            .extractor(KeyExtractor::new(by_first))
            .combine(Sum::<i64>::default())
            .metrics(metrics.clone())
            .build()
            .unwrap();
        let out = pipeline.run(vec![(1, i64::MAX), (1, 1), (2, 3)]).unwrap();
        assert_eq!(totals(&out), vec![(1, i64::MAX), (2, 3)]);
        assert_eq!(metrics.get(Counter::CombineErrors), 1);
    }

    #[test]
    fn cancelled_run_discards_partials() {
        let metrics = Arc::new(CountingMetrics::default());
        let cancel = CancelToken::new();
        let pipeline = PipelineBuilder::new(config(5, 2), SequentialExecutor)
            .extractor(KeyExtractor::new(by_first))
            .combine(Sum::<i64>::default())
            .metrics(metrics.clone())
            .cancel_token(cancel.clone())
            .build()
            .unwrap();
        cancel.cancel();
        let err = pipeline.run(vec![(1, 1), (2, 2), (3, 3)]).unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
        assert_eq!(metrics.get(Counter::RecordsIn), 0);
    }

    #[test]
    fn custom_comparator_selects_smallest() {
        let smallest: Comparator<Aggregate<u32, i64>> =
            Arc::new(|a: &Aggregate<u32, i64>, b: &Aggregate<u32, i64>| a.total > b.total);
        let pipeline = PipelineBuilder::with_comparator(config(2, 2), SequentialExecutor, smallest)
            .extractor(KeyExtractor::new(by_first))
            .combine(Sum::<i64>::default())
            .build()
            .unwrap();
        let out = pipeline.run(vec![(1, 5), (2, 1), (3, 3)]).unwrap();
        assert_eq!(totals(&out), vec![(2, 1), (3, 3)]);
    }

    #[test]
    fn extraction_starts_before_input_is_drained() {
        let pulled = Arc::new(AtomicUsize::new(0));
        let pulled_at_first_extract = Arc::new(AtomicUsize::new(usize::MAX));
        let (counter, first) = (Arc::clone(&pulled), Arc::clone(&pulled_at_first_extract));
        let cfg = PipelineConfig { chunk_size: 10, ..config(3, 2) };
        let pipeline = PipelineBuilder::new(cfg, SequentialExecutor)
            .extractor(KeyExtractor::new(move |pair: &Pair| {
                let now = counter.load(Ordering::SeqCst);
                let _ = first.compare_exchange(usize::MAX, now, Ordering::SeqCst, Ordering::SeqCst);
                Extracted::Keyed(pair.0, pair.1)
            }))
            .combine(Sum::<i64>::default())
            .build()
            .unwrap();

        let source = Arc::clone(&pulled);
        let records = (0..100_000u32).map(move |i| {
            source.fetch_add(1, Ordering::SeqCst);
            (i % 7, 1i64)
        });
        let out = pipeline.run(records).unwrap();

        assert_eq!(pulled.load(Ordering::SeqCst), 100_000);
        // one round is 2 partitions x 10 records
        assert!(pulled_at_first_extract.load(Ordering::SeqCst) <= 20);
        assert_eq!(out.len(), 3);
        assert_eq!(out.iter().map(|e| e.aggregate.total).sum::<i64>(), 14_286 * 3);
    }

    #[test]
    fn round_size_does_not_change_the_ranking() {
        let input: Vec<Pair> = (0..500u32).map(|i| (i * 31 % 17, i64::from(i % 5))).collect();
        let run = |chunk_size: i64| {
            let cfg = PipelineConfig { chunk_size, ..config(6, 3) };
            PipelineBuilder::new(cfg, SequentialExecutor)
                .extractor(KeyExtractor::new(by_first))
                .combine(Sum::<i64>::default())
                .build()
                .unwrap()
                .run(input.clone())
                .unwrap()
        };
        assert_eq!(run(1), run(1_000));
        assert_eq!(run(7), run(1_000));
    }
}
