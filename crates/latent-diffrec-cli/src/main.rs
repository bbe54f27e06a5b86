//! latent-diffrec command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Rank valid and test items for every user with a trained bundle
//! latent-diffrec infer --config run.toml --output rankings.json
//!
//! # Write a freshly initialised bundle for a data directory
//! latent-diffrec init --config run.toml --item-embeddings items.txt
//!
//! # Layered configuration (config/default.toml, config/$LATENT_DIFFREC_ENV.toml,
//! # LATENT_DIFFREC__SECTION__KEY variables) when --config is omitted
//! LATENT_DIFFREC__DIFFUSION__SAMPLING_STEPS=0 latent-diffrec infer
//! ```
//!
//! Exit codes: 0 on success, 1 on any error.

mod commands;

use clap::{Parser, Subcommand};
use tracing::Level;

use commands::infer::InferArgs;
use commands::init::InitArgs;

#[derive(Parser)]
#[command(name = "latent-diffrec", version, about = "Latent conditional diffusion recommender")]
struct Cli {
    /// Log level: error, warn, info, debug or trace (default: `logging.level`)
    #[arg(long, global = true)]
    log_level: Option<Level>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Rank items for every user with a trained model bundle
    Infer(InferArgs),
    /// Write a freshly initialised model bundle
    Init(InitArgs),
}

fn main() {
    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Infer(args) => commands::infer::handle_infer(args, cli.log_level),
        Commands::Init(args) => commands::init::handle_init(args, cli.log_level),
    };
    std::process::exit(code)
}
