// ========================================================================================
//
//                         THE COMMAND-LINE DRIVER: PHENOCOUNT
//
// ========================================================================================
//
// A thin shell over the library. It owns every file the engine reads or writes, builds
// the channel table once from the command line, and hands validated in-memory data to
// the pipeline. A cache conflict is reported as a warning and is not a failure.

use clap::{Args, Parser, Subcommand};
use phenocount::cache::{FeatureCache, PutOutcome};
use phenocount::channels::ChannelTable;
use phenocount::config::EngineConfig;
use phenocount::io;
use phenocount::matcher::PhenotypeCriterion;
use phenocount::optimize::seed_from_fraction;
use phenocount::pipeline::{FeaturePipeline, FeatureRequest};
use phenocount::threshold::{ThresholdStore, ThresholdUpdate};
use phenocount::types::{ChannelId, FeatureId, SampleId};
use std::error::Error;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

// ========================================================================================
//                         COMMAND-LINE INTERFACE DEFINITION
// ========================================================================================

#[derive(Parser, Debug)]
#[clap(
    name = "phenocount",
    version,
    about = "Deterministic cell phenotype counts over marker-intensity tables."
)]
struct Cli {
    /// Optional TOML file with engine settings.
    #[clap(long, global = true)]
    config: Option<PathBuf>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compute a threshold for one channel of one sample and record it.
    Optimize(OptimizeArgs),
    /// Count the cells of one sample that match a phenotype criterion.
    Count(CountArgs),
}

#[derive(Args, Debug)]
struct SampleArgs {
    /// Intensity table (TSV, or CSV by extension) with a header row of channel names.
    #[clap(long)]
    intensities: PathBuf,

    /// The sample the intensity table belongs to.
    #[clap(long)]
    sample: String,

    /// Number of cells the table must contain, not counting the header row.
    #[clap(long)]
    expected_cells: usize,
}

#[derive(Args, Debug)]
struct OptimizeArgs {
    #[clap(flatten)]
    sample: SampleArgs,

    /// The channel to optimize.
    #[clap(long)]
    channel: String,

    /// Fraction of the brightest cells used as the positive seed.
    #[clap(long, default_value = "0.5")]
    seed_fraction: f64,

    /// Thresholds TSV. Existing records are kept; the optimized one is added or replaced.
    #[clap(long)]
    thresholds: PathBuf,

    /// Provenance label stored with the new threshold.
    #[clap(long, default_value = "phenocount-optimize")]
    origin: String,
}

#[derive(Args, Debug)]
struct CountArgs {
    #[clap(flatten)]
    sample: SampleArgs,

    /// Thresholds TSV with `sample channel value` columns.
    #[clap(long)]
    thresholds: PathBuf,

    /// Channel table in bit order, comma separated.
    #[clap(long, value_delimiter = ',', required = true)]
    channels: Vec<String>,

    /// Version label of the channel table.
    #[clap(long, default_value = "1")]
    channel_table_version: u32,

    /// Channels required positive, comma separated.
    #[clap(long, value_delimiter = ',')]
    positive: Vec<String>,

    /// Channels required negative, comma separated.
    #[clap(long, value_delimiter = ',')]
    negative: Vec<String>,

    /// Feature id to file the count under. Derived from the criterion if omitted.
    #[clap(long)]
    feature: Option<String>,

    /// Feature-value TSV used as a persistent cache.
    #[clap(long)]
    cache: Option<PathBuf>,
}

// ========================================================================================
//                           THE MAIN ORCHESTRATION LOGIC
// ========================================================================================

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn Error + Send + Sync>> {
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };

    match cli.command {
        Command::Optimize(args) => run_optimize(&config, args),
        Command::Count(args) => run_count(&config, args),
    }
}

fn load_thresholds(path: &Path, store: &ThresholdStore) -> Result<(), Box<dyn Error + Send + Sync>> {
    let origin = format!("file:{}", path.display());
    for record in io::read_thresholds(path)? {
        store.record(&record.sample, &record.channel, record.value, origin.as_str())?;
    }
    Ok(())
}

fn run_optimize(config: &EngineConfig, args: OptimizeArgs) -> Result<(), Box<dyn Error + Send + Sync>> {
    let sample = SampleId::new(args.sample.sample);
    let channel = ChannelId::new(args.channel);
    let table = io::read_intensity_table(
        &args.sample.intensities,
        sample.clone(),
        args.sample.expected_cells,
    )?;

    let store = Arc::new(ThresholdStore::new(config.thresholds.drift_tolerance));
    if args.thresholds.exists() {
        load_thresholds(&args.thresholds, &store)?;
    }

    // The optimizer only needs the channel it works on.
    let channels = Arc::new(ChannelTable::new(1, [channel.clone()])?);
    let pipeline = FeaturePipeline::new(
        channels,
        config,
        store.clone(),
        Arc::new(FeatureCache::new()),
    );

    let values = table
        .column(&channel)
        .ok_or_else(|| format!("intensity table has no column '{channel}'"))?
        .to_vec();
    let seeds = seed_from_fraction(&values, args.seed_fraction)?;
    let run = pipeline.optimize_channel(&table, &channel, &seeds, &args.origin)?;

    if let ThresholdUpdate::Replaced { previous, drift } = &run.update {
        if drift.exceeded {
            eprintln!(
                "Warning: threshold for {sample}/{channel} moved from {} ({}) to {} (drift {})",
                previous.value, previous.provenance.origin, run.optimized.value, drift.delta
            );
        }
    }
    if !run.optimized.converged {
        eprintln!(
            "Warning: optimizer did not converge within {} iterations",
            run.optimized.iterations
        );
    }

    io::write_thresholds(&args.thresholds, &store.records())?;
    println!("{sample}\t{channel}\t{}", run.optimized.value);
    Ok(())
}

fn run_count(config: &EngineConfig, args: CountArgs) -> Result<(), Box<dyn Error + Send + Sync>> {
    let sample = SampleId::new(args.sample.sample);
    let channels = Arc::new(ChannelTable::new(
        args.channel_table_version,
        args.channels.into_iter().map(ChannelId::new),
    )?);

    let store = Arc::new(ThresholdStore::new(config.thresholds.drift_tolerance));
    load_thresholds(&args.thresholds, &store)?;

    let cache = match &args.cache {
        Some(path) if path.exists() => {
            let (cache, duplicates) = FeatureCache::from_values(io::read_feature_values(path)?);
            for duplicate in &duplicates {
                eprintln!(
                    "Warning: {} lists feature '{}' for sample '{}' twice ({} and {}); keeping the first",
                    path.display(),
                    duplicate.existing.feature,
                    duplicate.existing.sample,
                    duplicate.existing.count,
                    duplicate.attempted.count
                );
            }
            cache
        }
        _ => FeatureCache::new(),
    };
    let cache = Arc::new(cache);

    let table = io::read_intensity_table(
        &args.sample.intensities,
        sample,
        args.sample.expected_cells,
    )?;

    let criterion = PhenotypeCriterion::new(
        args.positive.into_iter().map(ChannelId::new),
        args.negative.into_iter().map(ChannelId::new),
    );
    let mut request = FeatureRequest::new(criterion);
    if let Some(feature) = args.feature {
        request = request.with_feature(FeatureId::new(feature));
    }

    let pipeline = FeaturePipeline::new(channels, config, store, cache.clone());
    let outcome = pipeline.compute(&request, &table)?;

    match &outcome.write {
        PutOutcome::Stored => {
            if let Some(path) = &args.cache {
                io::write_feature_values(path, &cache.values())?;
            }
        }
        PutOutcome::AlreadyComputed(conflict) => {
            eprintln!(
                "Warning: value already exists for feature '{}' on sample '{}': stored {}, computed {}",
                conflict.existing.feature,
                conflict.existing.sample,
                conflict.existing.count,
                conflict.attempted.count
            );
        }
    }

    let fraction = outcome
        .fraction()
        .map_or_else(|| "NA".to_string(), |f| format!("{f:.6}"));
    println!(
        "{}\t{}\t{}\t{}\t{fraction}",
        outcome.value.feature, outcome.value.sample, outcome.value.count, outcome.total_cells
    );
    Ok(())
}
