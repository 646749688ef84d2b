//! Roadseg CLI - trains and applies road segmentation models on satellite tiles
//!
//! Without a mode flag the `roadseg` command trains; `--evaluate`, `--predict`
//! and `--predict-train` select the other drivers.

mod commands;
mod config;

use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Roadseg - road segmentation training for satellite imagery
#[derive(Parser, Debug)]
#[command(
    name = "roadseg",
    author,
    version,
    about = "Roadseg - road segmentation training for satellite imagery"
)]
pub struct Args {
    /// Run one validation pass and exit
    #[arg(short = 'e', long, group = "mode")]
    pub evaluate: bool,

    /// Write masks for the public test tiles
    #[arg(long, group = "mode")]
    pub predict: bool,

    /// Write masks for the training tiles
    #[arg(long, alias = "predict_train", group = "mode")]
    pub predict_train: bool,

    /// Checkpoint to restore before running
    #[arg(long, value_name = "PATH")]
    pub resume: Option<PathBuf>,

    /// Channel/resolution preset
    #[arg(long, default_value = "mul_urban")]
    pub preset: String,

    /// Site name or `all`
    #[arg(long, default_value = "all")]
    pub city: String,

    /// Model architecture identifier
    #[arg(long, default_value = "local_conv3")]
    pub arch: String,

    /// Mask variant (binary, wide, layered, all, all_16bit)
    #[arg(long, default_value = "binary")]
    pub mask_variant: String,

    /// Training loss (bce-dice, log-dice)
    #[arg(long, default_value = "bce-dice")]
    pub loss: String,

    /// Weight of the overlap term in bce-dice
    #[arg(long, default_value_t = 1.0)]
    pub dice_weight: f32,

    /// Optimizer (adam*, rmsprop*)
    #[arg(long)]
    pub optimizer: Option<String>,

    #[arg(long)]
    pub epochs: Option<u64>,

    /// Epoch to start from (overridden by --resume)
    #[arg(long)]
    pub start_epoch: Option<u64>,

    #[arg(short = 'b', long)]
    pub batch_size: Option<usize>,

    /// Initial learning rate
    #[arg(long)]
    pub lr: Option<f64>,

    /// Data loading threads
    #[arg(short = 'j', long)]
    pub workers: Option<usize>,

    /// Progress line every N batches
    #[arg(long)]
    pub print_freq: Option<usize>,

    #[arg(long)]
    pub seed: Option<u64>,

    /// Square model input size
    #[arg(long)]
    pub imsize: Option<usize>,

    /// Random flips on training samples
    #[arg(long)]
    pub augs: bool,

    /// Where scalars and images go
    #[arg(long, value_enum, default_value_t = MetricsTarget::Log)]
    pub metrics: MetricsTarget,

    /// Send validation images to the metrics sink
    #[arg(long)]
    pub log_images: bool,

    /// Run name used for checkpoints, logs and predictions (random if omitted)
    #[arg(long)]
    pub run_id: Option<String>,

    /// Config file (defaults to ./roadseg.toml when present)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MetricsTarget {
    None,
    Log,
    File,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber =
        FmtSubscriber::builder().with_max_level(level).without_time().with_target(false).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = config::RunConfig::load(args.config.as_deref())?;
    let setup = commands::setup::RunSetup::resolve(&args, config)?;

    if args.evaluate {
        commands::evaluate::execute(&setup)
    } else if args.predict || args.predict_train {
        commands::predict::execute(&setup)
    } else {
        commands::train::execute(&setup)
    }
}
