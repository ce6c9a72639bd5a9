use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::info;

use tally_core::ratings::{top_raters, user_ratings_formatter};
use tally_core::{Layout, PipelineConfig};
use tally_runtime::ingest::read_ratings;
use tally_runtime::metrics::{MetricsRegistry, StageTimer};
use tally_runtime::sink::write_lines;
use tally_runtime::{init_tracing, TimelyExecutor};

#[derive(Parser, Debug)]
#[command(name = "top_raters", version, about = "Users with the most ratings")]
struct Args {
    /// Ratings CSV with a `userId,movieId,rating,timestamp` header.
    #[arg(long, default_value = "./csv/sample.csv")]
    file: PathBuf,
    #[arg(long, default_value = "./outputs/reporting.txt")]
    output: PathBuf,
    /// How many users to report. Overrides the config file.
    #[arg(long, allow_negative_numbers = true)]
    top: Option<i64>,
    /// Number of partitions, also the number of timely workers.
    #[arg(long, allow_negative_numbers = true)]
    partitions: Option<i64>,
    /// Records dealt to each partition per round.
    #[arg(long, allow_negative_numbers = true)]
    chunk_size: Option<i64>,
    /// JSON pipeline config; flags win over file values.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = LayoutArg::Report)]
    layout: LayoutArg,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LayoutArg {
    Lines,
    Report,
}

impl From<LayoutArg> for Layout {
    fn from(arg: LayoutArg) -> Self {
        match arg {
            LayoutArg::Lines => Layout::Lines,
            LayoutArg::Report => Layout::Report,
        }
    }
}

fn load_config(args: &Args) -> Result<PipelineConfig> {
    let mut cfg = match &args.config {
        Some(path) => PipelineConfig::from_json_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    if let Some(top) = args.top {
        cfg.top_k = top;
    }
    if let Some(partitions) = args.partitions {
        cfg.partitions = partitions;
    }
    if let Some(chunk_size) = args.chunk_size {
        cfg.chunk_size = chunk_size;
    }
    cfg.validate()?;
    Ok(cfg)
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    info!(file = %args.file.display(), "started pipeline");
    let timer = StageTimer::start();

    let cfg = load_config(&args)?;
    let metrics = MetricsRegistry::default();
    let mut records = read_ratings(&args.file, Arc::new(metrics.clone()))?;

    let job = top_raters(&cfg, TimelyExecutor::new(cfg.partitions()?), Arc::new(metrics.clone()))?;
    let lines = job
        .run_formatted(&mut records, &user_ratings_formatter(args.layout.into()))
        .context("running top raters")?;
    records.finish().with_context(|| format!("reading {}", args.file.display()))?;
    write_lines(&args.output, &lines)?;

    metrics.dump_and_clear("top_raters", Some(timer.elapsed()));
    info!(output = %args.output.display(), "pipeline finished");
    Ok(())
}
