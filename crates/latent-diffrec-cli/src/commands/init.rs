//! Init command: write a freshly initialised model bundle.
//!
//! With `autoencoder.n_cate > 1` items are grouped into categories by seeded
//! k-means over the vectors in `--item-embeddings` (one line per item).
//!
//! # Usage
//! ```bash
//! latent-diffrec init --config run.toml --item-embeddings item_emb.txt
//! latent-diffrec init --config single.toml --n-items 3706 --output-dir /tmp/ckpt
//! ```

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::Args;
use latent_diffrec_core::artifact::BundlePaths;
use latent_diffrec_core::category::kmeans_assignments;
use latent_diffrec_core::data::{infer_shape, load_interaction_file, load_item_embeddings};
use latent_diffrec_core::noise::seeded_rng;
use latent_diffrec_core::{
    AutoEncoder, CategoryMap, ConditionalDenoiser, DiffRecConfig, ModelBundle,
};
use tracing::{info, Level};

use super::{data_dir, fail, init_logging, ConfigArgs};

#[derive(Args, Debug)]
pub struct InitArgs {
    #[command(flatten)]
    pub source: ConfigArgs,

    /// Item count (default: inferred from `train_list.txt` under the data path)
    #[arg(long)]
    pub n_items: Option<usize>,

    /// Item embedding file used to assign categories
    #[arg(long)]
    pub item_embeddings: Option<PathBuf>,

    /// K-means iteration limit
    #[arg(long, default_value = "100")]
    pub kmeans_iterations: usize,

    /// Bundle stem (default: derived from the configuration)
    #[arg(long)]
    pub stem: Option<String>,

    /// Target directory (default: `checkpoint.dir`)
    #[arg(long)]
    pub output_dir: Option<PathBuf>,
}

pub fn handle_init(args: InitArgs, log_level: Option<Level>) -> i32 {
    let config = match args.source.load() {
        Ok(config) => config,
        Err(e) => return fail("Failed to load configuration", format!("{:#}", e)),
    };
    if let Err(e) = init_logging(log_level, &config.logging) {
        return fail("Failed to initialise logging", e);
    }

    match run_init(&args, config) {
        Ok(paths) => {
            println!("Model bundle written:");
            println!("  {}", paths.denoiser.display());
            println!("  {}", paths.autoencoder.display());
            println!("  {}", paths.config.display());
            0
        }
        Err(e) => fail("Initialisation failed", format!("{:#}", e)),
    }
}

pub fn run_init(args: &InitArgs, mut config: DiffRecConfig) -> anyhow::Result<BundlePaths> {
    if let Some(stem) = &args.stem {
        config.checkpoint.stem = Some(stem.clone());
    }
    let n_items = match args.n_items {
        Some(n) => n,
        None => {
            let path = data_dir(&config).join("train_list.txt");
            let pairs = load_interaction_file(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            infer_shape(&pairs).1
        }
    };
    if n_items == 0 {
        bail!("cannot initialise a model over zero items");
    }

    let mut rng = seeded_rng(config.seed);
    let category_map = build_category_map(&config, n_items, args, &mut rng)?;
    let (_, autoencoder) =
        AutoEncoder::init(config.autoencoder_spec(n_items), category_map, &mut rng)?;
    let (_, denoiser) = ConditionalDenoiser::init(config.denoiser_spec(), &mut rng)?;

    let dir = args
        .output_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(&config.checkpoint.dir));
    let bundle = ModelBundle {
        config,
        autoencoder,
        denoiser,
    };
    let paths = bundle.save(&dir)?;
    info!(dir = %dir.display(), n_items, stem = %bundle.name(), "Initialised model bundle");
    Ok(paths)
}

fn build_category_map(
    config: &DiffRecConfig,
    n_items: usize,
    args: &InitArgs,
    rng: &mut rand::rngs::StdRng,
) -> anyhow::Result<CategoryMap> {
    let n_cate = config.autoencoder.n_cate;
    if n_cate == 1 {
        return Ok(CategoryMap::identity(n_items));
    }
    let Some(path) = args.item_embeddings.as_deref() else {
        bail!("autoencoder.n_cate = {} needs --item-embeddings", n_cate);
    };
    let embeddings = read_embeddings(path, n_items)?;
    let assignments = kmeans_assignments(&embeddings, n_cate, args.kmeans_iterations, rng)?;
    Ok(CategoryMap::from_assignments(&assignments, n_cate)?)
}

fn read_embeddings(path: &Path, n_items: usize) -> anyhow::Result<Vec<Vec<f32>>> {
    let embeddings =
        load_item_embeddings(path).with_context(|| format!("reading {}", path.display()))?;
    if embeddings.len() != n_items {
        bail!(
            "{} holds {} item embeddings but there are {} items",
            path.display(),
            embeddings.len(),
            n_items
        );
    }
    Ok(embeddings)
}
