//! Checkpoint naming and model bundles.
//!
//! A trained model is three files in one directory sharing a stem:
//!
//! - `{stem}.safetensors`: denoiser parameters
//! - `{stem}_AE.safetensors`: autoencoder parameters plus the category map
//! - `{stem}.toml`: the configuration the model was trained with
//!
//! The stem is derived from the training hyperparameters, e.g.
//! `ml-1m_clean_0.0001lr1_0.0001lr2_0.0wd1_0.0wd2_bs400_cate3_in[300]_out[]_lam0.03_dims[300]_emb10_eps_steps20_scale0.1_min0.0001_max0.02_sample5_reweightTrue_log`.
//! It is computed from the configuration as written, before any dataset
//! preset replaces the diffusion settings.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use candle_core::Device;
use tracing::info;

use crate::autoencoder::{AutoEncoder, CATEGORY_MAP_PARAM};
use crate::config::{dataset_names, DiffRecConfig};
use crate::denoiser::ConditionalDenoiser;
use crate::error::{DiffRecError, DiffRecResult, TensorContext};
use crate::pipeline::{InferencePipeline, InferenceSettings};
use crate::weights::ParameterStore;

/// Suffix appended to the stem for the autoencoder file.
pub const AUTOENCODER_SUFFIX: &str = "_AE";
pub const WEIGHTS_EXTENSION: &str = "safetensors";
pub const CONFIG_EXTENSION: &str = "toml";

/// File stem of a trained model.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactName(String);

impl ArtifactName {
    pub fn new(stem: impl Into<String>) -> Self {
        Self(stem.into())
    }

    /// Derive the stem from a configuration; `checkpoint.stem` wins when set.
    pub fn from_config(config: &DiffRecConfig) -> Self {
        if let Some(stem) = &config.checkpoint.stem {
            return Self(stem.clone());
        }
        let ck = &config.checkpoint;
        let ae = &config.autoencoder;
        let df = &config.diffusion;
        Self(format!(
            "{}_{}lr1_{}lr2_{}wd1_{}wd2_bs{}_cate{}_in{}_out{}_lam{}_dims{}_emb{}_{}_steps{}_scale{}_min{}_max{}_sample{}_reweight{}_{}",
            config.dataset,
            format_float(ck.lr1),
            format_float(ck.lr2),
            format_float(ck.wd1),
            format_float(ck.wd2),
            ck.batch_size,
            ae.n_cate,
            format_list(&ae.in_dims),
            format_list(&ae.out_dims),
            format_float(ae.lamda),
            format_list(&config.denoiser.dims),
            config.denoiser.emb_size,
            df.mean_type,
            df.steps,
            format_float(df.noise_scale),
            format_float(df.noise_min),
            format_float(df.noise_max),
            df.sampling_steps,
            if df.reweight { "True" } else { "False" },
            ck.log_name,
        ))
    }

    pub fn stem(&self) -> &str {
        &self.0
    }

    pub fn autoencoder_stem(&self) -> String {
        format!("{}{}", self.0, AUTOENCODER_SUFFIX)
    }

    pub fn paths(&self, dir: &Path) -> BundlePaths {
        BundlePaths {
            denoiser: dir.join(format!("{}.{}", self.0, WEIGHTS_EXTENSION)),
            autoencoder: dir.join(format!("{}.{}", self.autoencoder_stem(), WEIGHTS_EXTENSION)),
            config: dir.join(format!("{}.{}", self.0, CONFIG_EXTENSION)),
        }
    }
}

impl fmt::Display for ArtifactName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Shortest round-tripping decimal, always carrying a fractional part or an
/// exponent: `0.0`, `0.03`, `1e-05`, `1e+16`.
fn format_float(v: f64) -> String {
    if !v.is_finite() {
        return if v.is_nan() {
            "nan".into()
        } else if v > 0.0 {
            "inf".into()
        } else {
            "-inf".into()
        };
    }
    let abs = v.abs();
    if v == 0.0 || (1e-4..1e16).contains(&abs) {
        let s = format!("{}", v);
        if s.contains('.') {
            s
        } else {
            format!("{}.0", s)
        }
    } else {
        // `1e-5` -> `1e-05`, `1.5e16` -> `1.5e+16`
        let s = format!("{:e}", v);
        match s.split_once('e') {
            Some((mantissa, exp)) => {
                let (sign, digits) = match exp.strip_prefix('-') {
                    Some(d) => ('-', d),
                    None => ('+', exp),
                };
                format!("{}e{}{:0>2}", mantissa, sign, digits)
            }
            None => s,
        }
    }
}

fn format_list(values: &[usize]) -> String {
    let items: Vec<String> = values.iter().map(|v| v.to_string()).collect();
    format!("[{}]", items.join(", "))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundlePaths {
    pub denoiser: PathBuf,
    pub autoencoder: PathBuf,
    pub config: PathBuf,
}

/// Parameters of both networks plus the configuration they were trained with.
#[derive(Debug, Clone)]
pub struct ModelBundle {
    pub config: DiffRecConfig,
    pub autoencoder: ParameterStore,
    pub denoiser: ParameterStore,
}

impl ModelBundle {
    pub fn name(&self) -> ArtifactName {
        ArtifactName::from_config(&self.config)
    }

    /// Write the three bundle files into `dir`, creating it if needed.
    pub fn save(&self, dir: &Path) -> DiffRecResult<BundlePaths> {
        fs::create_dir_all(dir)?;
        let name = self.name();
        let paths = name.paths(dir);
        self.denoiser.save(&paths.denoiser)?;
        self.autoencoder.save(&paths.autoencoder)?;
        fs::write(&paths.config, self.config.to_toml_string()?)?;
        info!(dir = %dir.display(), stem = %name, "Saved model bundle");
        Ok(paths)
    }

    /// Read the bundle named `name` from `dir`.
    ///
    /// # Errors
    ///
    /// - [`DiffRecError::Io`] when a file is missing.
    /// - [`DiffRecError::Serialization`] when a parameter file is corrupt.
    /// - [`DiffRecError::Configuration`] when the stored configuration is invalid.
    pub fn load(dir: &Path, name: &ArtifactName) -> DiffRecResult<Self> {
        let paths = name.paths(dir);
        for path in [&paths.denoiser, &paths.autoencoder, &paths.config] {
            if !path.exists() {
                return Err(DiffRecError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("missing bundle file {}", path.display()),
                )));
            }
        }
        let config = DiffRecConfig::from_file(&paths.config)?;
        let autoencoder = ParameterStore::load(&paths.autoencoder, &Device::Cpu)?;
        let denoiser = ParameterStore::load(&paths.denoiser, &Device::Cpu)?;
        info!(dir = %dir.display(), stem = %name, "Loaded model bundle");
        Ok(Self {
            config,
            autoencoder,
            denoiser,
        })
    }

    /// Item count recorded by the stored category map.
    pub fn n_items(&self) -> DiffRecResult<usize> {
        self.autoencoder
            .get(CATEGORY_MAP_PARAM)?
            .dims1()
            .op("category map length")
    }

    /// Assemble an inference pipeline.
    ///
    /// For a known dataset the preset is applied to a copy of the stored
    /// configuration first, so the diffusion runs with the dataset's step
    /// count and noise. Other datasets keep the stored diffusion settings.
    pub fn build_pipeline(&self) -> DiffRecResult<InferencePipeline<ConditionalDenoiser>> {
        let mut config = self.config.clone();
        if dataset_names().any(|n| n == config.dataset) {
            config.apply_dataset_preset()?;
        }
        config.validate()?;
        let autoencoder =
            AutoEncoder::from_parameters(config.autoencoder_spec(self.n_items()?), &self.autoencoder)?;
        let denoiser = ConditionalDenoiser::from_parameters(config.denoiser_spec(), &self.denoiser)?;
        let diffusion = config.build_diffusion()?;
        InferencePipeline::new(
            autoencoder,
            denoiser,
            diffusion,
            InferenceSettings {
                sampling_steps: config.diffusion.sampling_steps,
                sampling_noise: config.diffusion.sampling_noise,
                top_k: config.inference.top_k(),
                batch_size: config.inference.batch_size,
                seed: config.seed,
            },
        )
    }
}
