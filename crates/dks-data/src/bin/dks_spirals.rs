//! Train and sample a multimodal DKS on the noisy-spirals benchmark.
//!
//! # Usage
//!
//! ```bash
//! cargo run --release -p dks-data --bin dks-spirals -- train \
//!   --out checkpoints/spirals.safetensors --epochs 200 --corrupt 0.3 --seed 1
//!
//! cargo run --release -p dks-data --bin dks-spirals -- sample \
//!   --checkpoint checkpoints/spirals.safetensors --len 100
//! ```
//!
//! `train` also writes the run configuration next to the checkpoint
//! (`spirals.json`), which `sample` reads back to rebuild the model.
//! Set `RUST_LOG=debug` for per-batch losses.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use candle_nn::VarMap;
use clap::{Parser, Subcommand, ValueHint};
use dks_core::DksError;
use dks_data::spirals::{self, SpiralsConfig};
use dks_data::Corruption;
use dks_model::checkpoint::{load_checkpoint, save_checkpoint};
use dks_model::config::{DevicePreference, DksConfig};
use dks_model::training::{evaluate, train, TrainConfig};
use dks_model::MultiDks;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Multimodal Deep Kalman Smoother on noisy spirals")]
struct Cli {
    /// Force CPU even if an accelerator is available
    #[arg(long, global = true)]
    cpu: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate spirals, train, evaluate on a held-out split and save weights
    Train(TrainArgs),

    /// Generate sequences from a trained model and print them as JSON
    Sample(SampleArgs),
}

#[derive(clap::Args)]
struct TrainArgs {
    /// Checkpoint path (safetensors); the run config is saved alongside
    #[arg(long, value_hint = ValueHint::FilePath)]
    out: PathBuf,

    /// JSON run configuration; flags below override it
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Number of training epochs
    #[arg(long)]
    epochs: Option<usize>,

    /// Fraction of observations deleted uniformly at random
    #[arg(long)]
    corrupt: Option<f64>,

    /// Seed for data generation, initialization noise and shuffling
    #[arg(long)]
    seed: Option<u64>,

    /// Sequences per minibatch
    #[arg(long)]
    batch_size: Option<usize>,
}

#[derive(clap::Args)]
struct SampleArgs {
    /// Checkpoint written by `train`
    #[arg(long, value_hint = ValueHint::FilePath)]
    checkpoint: PathBuf,

    /// Number of time steps to generate
    #[arg(long, default_value_t = 100)]
    len: usize,

    /// Number of sequences to generate
    #[arg(long, default_value_t = 1)]
    count: usize,

    /// Seed for the sampling noise
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

/// Everything needed to reproduce a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct RunConfig {
    model: DksConfig,
    train: TrainConfig,
    data: SpiralsConfig,
    batch_size: usize,
    test_fraction: f64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            model: DksConfig::new(spirals::modalities()),
            train: TrainConfig::default(),
            data: SpiralsConfig::default(),
            batch_size: 25,
            test_fraction: 0.2,
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Train(args) => run_train(args, cli.cpu),
        Command::Sample(args) => run_sample(args, cli.cpu),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run_train(args: TrainArgs, cpu: bool) -> Result<(), DksError> {
    let mut run = match &args.config {
        Some(path) => read_json::<RunConfig>(path)?,
        None => RunConfig::default(),
    };
    if let Some(epochs) = args.epochs {
        run.train.epochs = epochs;
    }
    if let Some(p) = args.corrupt {
        run.data.corruption = Corruption::Uniform(p);
    }
    if let Some(seed) = args.seed {
        run.data.seed = seed;
        run.model.seed = seed;
        run.train.seed = seed;
    }
    if let Some(batch_size) = args.batch_size {
        run.batch_size = batch_size;
    }
    if cpu {
        run.model.device = DevicePreference::Cpu;
    }
    run.model.modalities = spirals::modalities();

    tracing::info!(
        sequences = run.data.num_sequences,
        corruption = ?run.data.corruption,
        epochs = run.train.epochs,
        batch_size = run.batch_size,
        "starting spirals run"
    );

    let dataset = spirals::generate(&run.data)?;
    let (train_set, test_set) = dataset.split(run.test_fraction, run.data.seed)?;

    let var_map = VarMap::new();
    let model = MultiDks::new(&var_map, &run.model)?;
    tracing::info!(model = ?model, params = run.model.param_count(), "model ready");

    let train_batches =
        train_set.device_batches(run.batch_size, Some(run.train.seed), model.device())?;
    let result = train(&model, &var_map, &train_batches, &run.train)?;
    tracing::info!(
        final_loss = result.final_loss,
        epochs = result.epochs_completed,
        "training finished"
    );

    if test_set.is_empty() {
        tracing::warn!("test split is empty, skipping evaluation");
    } else {
        let test_batches = test_set.device_batches(run.batch_size, None, model.device())?;
        let metrics = evaluate(&model, &test_batches)?;
        tracing::info!(elbo = metrics.elbo, mse = ?metrics.mse, "held-out evaluation");
    }

    save_checkpoint(&var_map, &args.out)?;
    write_json(&config_path(&args.out), &run)
}

fn run_sample(args: SampleArgs, cpu: bool) -> Result<(), DksError> {
    let mut run = read_json::<RunConfig>(&config_path(&args.checkpoint))?;
    if cpu {
        run.model.device = DevicePreference::Cpu;
    }

    let mut var_map = VarMap::new();
    let model = MultiDks::new(&var_map, &run.model)?;
    load_checkpoint(&mut var_map, &args.checkpoint)?;
    model.reseed(args.seed)?;

    let samples = model.sample(args.count, args.len)?;
    let mut out: BTreeMap<String, Vec<Vec<Vec<f32>>>> = BTreeMap::new();
    for (name, tensor) in samples {
        // [T, B, D] -> per sequence [T][D]
        let steps = tensor
            .transpose(0, 1)
            .and_then(|t| t.contiguous())
            .and_then(|t| t.to_vec3::<f32>())
            .map_err(|e| DksError::Internal {
                message: format!("reading samples: {e}"),
            })?;
        out.insert(name, steps);
    }
    let json = serde_json::to_string_pretty(&out).map_err(|e| DksError::DataError {
        message: format!("encoding samples: {e}"),
    })?;
    println!("{json}");
    Ok(())
}

fn config_path(checkpoint: &Path) -> PathBuf {
    checkpoint.with_extension("json")
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, DksError> {
    let text = std::fs::read_to_string(path)?;
    serde_json::from_str(&text).map_err(|e| DksError::DataError {
        message: format!("{}: {e}", path.display()),
    })
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), DksError> {
    let text = serde_json::to_string_pretty(value).map_err(|e| DksError::DataError {
        message: format!("{}: {e}", path.display()),
    })?;
    std::fs::write(path, text)?;
    tracing::info!(path = %path.display(), "saved run config");
    Ok(())
}
