use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, ensure, Result};
use clap::Parser;
use differential_dataflow::input::InputSession;
use timely::dataflow::operators::probe::Handle as ProbeHandle;
use tracing::info;

use tally_core::ratings::{top_raters, Rating};
use tally_core::{PipelineConfig, SequentialExecutor};
use tally_runtime::metrics::MetricsRegistry;
use tally_runtime::{init_tracing, start_runtime};
use tally_views::{count_per_key, top_k};

#[derive(Parser, Debug, Clone, Copy)]
#[command(name = "ratings_view", about = "Incremental top raters over synthetic epochs")]
struct Args {
    #[arg(long, default_value_t = 10)]
    epochs: u64,
    #[arg(long, default_value_t = 200)]
    per_epoch: u64,
    #[arg(long, default_value_t = 50)]
    users: u64,
    #[arg(long, default_value_t = 5)]
    top: usize,
}

// Deterministic, skewed towards a handful of heavy raters.
fn synthetic_ratings(epoch: u64, args: &Args) -> Vec<Rating> {
    (0..args.per_epoch)
        .map(|i| {
            let spread = (epoch * 13 + i * 7) % args.users.max(1);
            let user_id = if i % 4 == 0 { spread % 7 } else { spread };
            Rating {
                user_id,
                movie_id: (i * 31 + epoch) % 500,
                rating: 0.5 * ((i % 10) + 1) as f64,
                timestamp: (epoch * 1_000 + i) as i64,
            }
        })
        .collect()
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    info!(?args, "ratings_view starting");

    let updates: Arc<Mutex<Vec<((u64, i64), isize)>>> = Arc::new(Mutex::new(Vec::new()));
    let shared = Arc::clone(&updates);
    start_runtime(1, move |_index, worker| {
        let mut input: InputSession<_, u64, isize> = InputSession::new();
        let mut probe = ProbeHandle::new();
        let sink = Arc::clone(&shared);

        worker.dataflow::<u64, _, _>(|scope| {
            let totals = count_per_key(&input.to_collection(scope));
            top_k(&totals, args.top)
                .inspect(move |(entry, epoch, diff)| {
                    info!(?entry, epoch, diff, "top raters update");
                    if let Ok(mut seen) = sink.lock() {
                        seen.push((*entry, *diff));
                    }
                })
                .probe_with(&mut probe);
        });

        for epoch in 0..args.epochs {
            for rating in synthetic_ratings(epoch, &args) {
                input.insert(rating.user_id);
            }
            input.advance_to(epoch + 1);
            input.flush();
            while probe.less_than(input.time()) {
                worker.step();
            }
        }
    })?;

    let mut net: HashMap<(u64, i64), isize> = HashMap::new();
    for (entry, diff) in updates.lock().map_err(|_| anyhow!("view output lock poisoned"))?.iter() {
        *net.entry(*entry).or_default() += *diff;
    }
    let mut view: Vec<(u64, i64)> = net.into_iter().filter(|(_, diff)| *diff != 0).map(|(e, _)| e).collect();
    view.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

    // The batch job sees the same ratings at once; totals must line up rank
    // by rank. Tied users may be listed in a different order.
    let cfg = PipelineConfig { top_k: args.top as i64, partitions: 4, ..PipelineConfig::default() };
    let all: Vec<Rating> = (0..args.epochs).flat_map(|epoch| synthetic_ratings(epoch, &args)).collect();
    let batch = top_raters(&cfg, SequentialExecutor, Arc::new(MetricsRegistry::default()))?.run(all)?;

    let view_totals: Vec<i64> = view.iter().map(|(_, total)| *total).collect();
    let batch_totals: Vec<i64> = batch.iter().map(|entry| entry.aggregate.total).collect();
    ensure!(
        view_totals == batch_totals,
        "incremental view {view_totals:?} disagrees with batch ranking {batch_totals:?}"
    );
    info!(?view, "ratings_view agrees with batch ranking");
    Ok(())
}
