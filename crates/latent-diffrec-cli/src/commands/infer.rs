//! Inference command: rank valid and test items for every user.
//!
//! Validation rankings use the training interactions as input and mask.
//! Test rankings mask training and validation interactions; their input is
//! the training interactions, or training plus validation with `--tst-w-val`.
//!
//! # Usage
//! ```bash
//! latent-diffrec infer --config run.toml
//! latent-diffrec infer --config run.toml --stem my_model --output ranked.json
//! latent-diffrec infer --config run.toml --condition gender --sampling-noise
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::Args;
use latent_diffrec_core::data::{ConditionLabels, InteractionSplits};
use latent_diffrec_core::{ArtifactName, ConditionField, DiffRecConfig, ModelBundle};
use serde::Serialize;
use tracing::{info, Level};

use super::{data_dir, fail, init_logging, ConfigArgs};

#[derive(Args, Debug)]
pub struct InferArgs {
    #[command(flatten)]
    pub source: ConfigArgs,

    /// Bundle stem to load (default: derived from the configuration)
    #[arg(long)]
    pub stem: Option<String>,

    /// Write JSON here instead of stdout
    #[arg(long, short = 'o')]
    pub output: Option<PathBuf>,

    /// User attribute used as the condition
    #[arg(long)]
    pub condition: Option<ConditionField>,

    /// Reverse diffusion steps, overriding `diffusion.sampling_steps`
    #[arg(long)]
    pub sampling_steps: Option<usize>,

    /// Add posterior noise during reverse diffusion
    #[arg(long)]
    pub sampling_noise: bool,

    /// Feed train + valid interactions when ranking the test split
    #[arg(long)]
    pub tst_w_val: bool,
}

/// Rankings written by `infer`.
#[derive(Debug, Serialize)]
pub struct InferReport {
    pub stem: String,
    pub condition: ConditionField,
    pub top_n: Vec<usize>,
    pub valid: Vec<Vec<usize>>,
    pub test: Vec<Vec<usize>>,
}

pub fn handle_infer(args: InferArgs, log_level: Option<Level>) -> i32 {
    let config = match args.source.load() {
        Ok(config) => config,
        Err(e) => return fail("Failed to load configuration", format!("{:#}", e)),
    };
    if let Err(e) = init_logging(log_level, &config.logging) {
        return fail("Failed to initialise logging", e);
    }

    let report = match run_infer(&args, config) {
        Ok(report) => report,
        Err(e) => return fail("Inference failed", format!("{:#}", e)),
    };

    let json = match serde_json::to_string_pretty(&report) {
        Ok(json) => json,
        Err(e) => return fail("Failed to serialise rankings", e),
    };
    match &args.output {
        Some(path) => {
            if let Err(e) = fs::write(path, json) {
                return fail(&format!("Failed to write {}", path.display()), e);
            }
            info!(path = %path.display(), users = report.valid.len(), "Wrote rankings");
        }
        None => println!("{}", json),
    }
    0
}

pub fn run_infer(args: &InferArgs, mut config: DiffRecConfig) -> anyhow::Result<InferReport> {
    let name = match &args.stem {
        Some(stem) => ArtifactName::new(stem.clone()),
        None => ArtifactName::from_config(&config),
    };
    let checkpoint_dir = PathBuf::from(&config.checkpoint.dir);
    let mut bundle = ModelBundle::load(&checkpoint_dir, &name)
        .with_context(|| format!("loading bundle '{}' from {}", name, checkpoint_dir.display()))?;

    // Architecture comes from the bundle, run-time settings from this run.
    if let Some(steps) = args.sampling_steps {
        config.diffusion.sampling_steps = steps;
    }
    if args.sampling_noise {
        config.diffusion.sampling_noise = true;
    }
    if args.tst_w_val {
        config.inference.tst_w_val = true;
    }
    if let Some(condition) = args.condition {
        config.inference.condition = condition;
    }
    bundle.config.seed = config.seed;
    bundle.config.diffusion.sampling_steps = config.diffusion.sampling_steps;
    bundle.config.diffusion.sampling_noise = config.diffusion.sampling_noise;
    bundle.config.inference = config.inference.clone();

    let pipeline = bundle.build_pipeline()?;

    let dir: &Path = data_dir(&config);
    let splits = InteractionSplits::load_dir(dir)
        .with_context(|| format!("loading interactions from {}", dir.display()))?;
    let n_items = pipeline.autoencoder().n_items();
    if splits.n_items() > n_items {
        bail!("data has {} items but the model was built for {}", splits.n_items(), n_items);
    }
    let splits = splits.with_n_items(n_items)?;
    let n_users = splits.n_users();
    let labels = ConditionLabels::load_dir(dir, config.inference.condition, n_users)?;
    // The attribute file may list users without interactions.
    let labels = &labels.labels[..n_users];

    let train_valid = splits.train.union(&splits.valid)?;
    let valid = pipeline.rank_users(&splits.train, &splits.train, labels)?;
    let test_input = if config.inference.tst_w_val {
        &train_valid
    } else {
        &splits.train
    };
    let test = pipeline.rank_users(test_input, &train_valid, labels)?;

    info!(
        stem = %name,
        users = n_users,
        tst_w_val = config.inference.tst_w_val,
        "Inference finished"
    );
    Ok(InferReport {
        stem: name.to_string(),
        condition: config.inference.condition,
        top_n: config.inference.top_n.clone(),
        valid: valid.lists,
        test: test.lists,
    })
}
