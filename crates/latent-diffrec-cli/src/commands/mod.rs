//! CLI command handlers
//!
//! - `infer`: rank items for every user with a trained bundle
//! - `init`: write a freshly initialised bundle
//!
//! Handlers return the process exit code: 0 on success, 1 on error.

pub mod infer;
pub mod init;

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::Context;
use clap::Args;
use latent_diffrec_core::config::LoggingConfig;
use latent_diffrec_core::DiffRecConfig;
use tracing::{error, Level};
use tracing_subscriber::FmtSubscriber;

/// Log error and print to stderr, returning exit code 1.
pub(crate) fn fail(context: &str, err: impl std::fmt::Display) -> i32 {
    error!("{}: {}", context, err);
    eprintln!("Error: {}: {}", context, err);
    1
}

/// Configuration source shared by every command.
#[derive(Args, Debug, Clone)]
pub struct ConfigArgs {
    /// TOML configuration file (default: layered config/ files and environment)
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Dataset directory, overriding `data_path`
    #[arg(long)]
    pub data_path: Option<PathBuf>,

    /// Checkpoint directory, overriding `checkpoint.dir`
    #[arg(long)]
    pub checkpoint_dir: Option<PathBuf>,

    /// Base seed, overriding `seed`
    #[arg(long)]
    pub seed: Option<u64>,
}

impl ConfigArgs {
    pub fn load(&self) -> anyhow::Result<DiffRecConfig> {
        let mut config = match &self.config {
            Some(path) => DiffRecConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => DiffRecConfig::load().context("loading layered configuration")?,
        };
        if let Some(path) = &self.data_path {
            config.data_path = path.to_string_lossy().into_owned();
        }
        if let Some(dir) = &self.checkpoint_dir {
            config.checkpoint.dir = dir.to_string_lossy().into_owned();
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        config.validate()?;
        Ok(config)
    }
}

/// Install the global subscriber; `--log-level` wins over `logging.level`.
pub(crate) fn init_logging(cli_level: Option<Level>, logging: &LoggingConfig) -> anyhow::Result<()> {
    let level = match cli_level {
        Some(level) => level,
        None => Level::from_str(&logging.level)
            .map_err(|e| anyhow::anyhow!("invalid logging.level '{}': {}", logging.level, e))?,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_file(logging.include_location)
        .with_line_number(logging.include_location)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

pub(crate) fn data_dir(config: &DiffRecConfig) -> &Path {
    Path::new(&config.data_path)
}
