//! Configuration for training artifacts and inference runs.
//!
//! Sections mirror the components: `[diffusion]`, `[autoencoder]`,
//! `[denoiser]`, `[inference]`, `[checkpoint]` and `[logging]`. Every section
//! has defaults, so a file only needs the values it changes.

mod presets;

use std::path::Path;

use serde::{Deserialize, Serialize};

pub use presets::{dataset_names, dataset_preset, DatasetPreset};

use crate::autoencoder::AutoEncoderSpec;
use crate::data::ConditionField;
use crate::denoiser::DenoiserSpec;
use crate::diffusion::{GaussianDiffusion, MeanType};
use crate::error::{DiffRecError, DiffRecResult};
use crate::layers::Activation;
use crate::schedule::{NoiseBounds, ScheduleKind};

/// Environment variable selecting `config/{env}.toml`.
pub const ENV_SELECTOR: &str = "LATENT_DIFFREC_ENV";

/// Prefix of per-key environment overrides, e.g. `LATENT_DIFFREC__DIFFUSION__STEPS`.
pub const ENV_PREFIX: &str = "LATENT_DIFFREC";

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DiffRecConfig {
    pub dataset: String,
    pub data_path: String,
    /// Base seed for every noise draw.
    pub seed: u64,
    pub diffusion: DiffusionConfig,
    pub autoencoder: AutoencoderConfig,
    pub denoiser: DenoiserConfig,
    pub inference: InferenceConfig,
    pub checkpoint: CheckpointConfig,
    pub logging: LoggingConfig,
}

impl DiffRecConfig {
    /// Load configuration from files and environment.
    ///
    /// Configuration is loaded in order:
    /// 1. config/default.toml (base settings)
    /// 2. config/{LATENT_DIFFREC_ENV}.toml (environment-specific)
    /// 3. Environment variables with the LATENT_DIFFREC__ prefix
    pub fn load() -> DiffRecResult<Self> {
        let env = std::env::var(ENV_SELECTOR).unwrap_or_else(|_| "development".to_string());

        let builder = ::config::Config::builder()
            .add_source(::config::File::with_name("config/default").required(false))
            .add_source(::config::File::with_name(&format!("config/{}", env)).required(false))
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );

        let config: DiffRecConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn default_config() -> Self {
        Self {
            dataset: "ml-1m_clean".to_string(),
            data_path: "../datasets/ml-1m_clean/".to_string(),
            seed: 1,
            diffusion: DiffusionConfig::default(),
            autoencoder: AutoencoderConfig::default(),
            denoiser: DenoiserConfig::default(),
            inference: InferenceConfig::default(),
            checkpoint: CheckpointConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> DiffRecResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            DiffRecError::Configuration(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let config: DiffRecConfig = toml::from_str(&content).map_err(|e| {
            DiffRecError::Configuration(format!("Failed to parse config file: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> DiffRecResult<String> {
        Ok(toml::to_string(self)?)
    }

    /// Overwrite the diffusion step count and noise bounds with the dataset preset.
    pub fn apply_dataset_preset(&mut self) -> DiffRecResult<DatasetPreset> {
        let preset = dataset_preset(&self.dataset)?;
        self.diffusion.steps = preset.steps;
        self.diffusion.noise_scale = preset.noise_scale;
        self.diffusion.noise_min = preset.noise_min;
        self.diffusion.noise_max = preset.noise_max;
        Ok(preset)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> DiffRecResult<()> {
        self.diffusion.validate()?;
        self.autoencoder.validate()?;
        self.denoiser.validate()?;
        self.inference.validate()?;

        if self.denoiser.dims.last() != self.autoencoder.in_dims.last() {
            return Err(DiffRecError::Configuration(format!(
                "denoiser.dims must end at the latent width {:?}, got {:?}",
                self.autoencoder.in_dims.last(),
                self.denoiser.dims.last()
            )));
        }
        Ok(())
    }

    pub fn noise_bounds(&self) -> NoiseBounds {
        NoiseBounds::new(
            self.diffusion.noise_scale,
            self.diffusion.noise_min,
            self.diffusion.noise_max,
        )
    }

    pub fn build_diffusion(&self) -> DiffRecResult<GaussianDiffusion> {
        GaussianDiffusion::new(
            self.diffusion.mean_type,
            self.diffusion.noise_schedule,
            self.noise_bounds(),
            self.diffusion.steps,
            self.diffusion.beta_fixed,
        )
    }

    pub fn autoencoder_spec(&self, n_items: usize) -> AutoEncoderSpec {
        AutoEncoderSpec {
            n_items,
            n_cate: self.autoencoder.n_cate,
            in_dims: self.autoencoder.in_dims.clone(),
            out_dims: self.autoencoder.out_dims.clone(),
            activation: self.autoencoder.activation,
            dropout: self.autoencoder.dropout,
        }
    }

    pub fn denoiser_spec(&self) -> DenoiserSpec {
        DenoiserSpec::symmetric(
            self.autoencoder.in_dims.last().copied().unwrap_or(0),
            &self.denoiser.dims,
            self.denoiser.emb_size,
            self.denoiser.n_classes,
            self.denoiser.norm,
            self.denoiser.activation,
            self.denoiser.dropout,
            self.diffusion.mean_type,
        )
    }
}

impl Default for DiffRecConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DiffusionConfig {
    pub mean_type: MeanType,
    pub steps: usize,
    pub noise_schedule: ScheduleKind,
    pub noise_scale: f64,
    pub noise_min: f64,
    pub noise_max: f64,
    pub beta_fixed: bool,
    pub sampling_noise: bool,
    pub sampling_steps: usize,
    /// Loss reweighting used at training time; part of the artifact name.
    pub reweight: bool,
}

impl Default for DiffusionConfig {
    fn default() -> Self {
        Self {
            mean_type: MeanType::Epsilon,
            steps: 20,
            noise_schedule: ScheduleKind::LinearVar,
            noise_scale: 0.1,
            noise_min: 0.0001,
            noise_max: 0.02,
            beta_fixed: true,
            sampling_noise: false,
            sampling_steps: 5,
            reweight: true,
        }
    }
}

impl DiffusionConfig {
    pub fn validate(&self) -> DiffRecResult<()> {
        if self.steps == 0 {
            return Err(DiffRecError::Configuration(
                "diffusion.steps must be greater than 0".into(),
            ));
        }
        if self.sampling_steps > self.steps {
            return Err(DiffRecError::Configuration(format!(
                "diffusion.sampling_steps {} exceeds diffusion.steps {}",
                self.sampling_steps, self.steps
            )));
        }
        NoiseBounds::new(self.noise_scale, self.noise_min, self.noise_max).validate()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AutoencoderConfig {
    pub n_cate: usize,
    pub in_dims: Vec<usize>,
    pub out_dims: Vec<usize>,
    pub activation: Activation,
    pub dropout: f64,
    /// Weight of the autoencoder objective in the joint training loss.
    pub lamda: f64,
    /// Largest KL weight reached by annealing.
    pub anneal_cap: f64,
    /// Annealing steps until `anneal_cap` is reached.
    pub anneal_steps: usize,
}

impl Default for AutoencoderConfig {
    fn default() -> Self {
        Self {
            n_cate: 3,
            in_dims: vec![300],
            out_dims: vec![],
            activation: Activation::Tanh,
            dropout: 0.1,
            lamda: 0.03,
            anneal_cap: 0.005,
            anneal_steps: 500,
        }
    }
}

impl AutoencoderConfig {
    pub fn validate(&self) -> DiffRecResult<()> {
        if self.n_cate == 0 {
            return Err(DiffRecError::Configuration(
                "autoencoder.n_cate must be at least 1".into(),
            ));
        }
        if self.in_dims.is_empty() || self.in_dims.contains(&0) {
            return Err(DiffRecError::Configuration(format!(
                "autoencoder.in_dims must be non-empty and positive, got {:?}",
                self.in_dims
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(DiffRecError::Configuration(format!(
                "autoencoder.dropout must lie in [0, 1), got {}",
                self.dropout
            )));
        }
        if self.anneal_cap < 0.0 || self.lamda < 0.0 {
            return Err(DiffRecError::Configuration(
                "autoencoder.lamda and autoencoder.anneal_cap must be non-negative".into(),
            ));
        }
        Ok(())
    }

    /// KL weight after `update_count` optimisation steps.
    pub fn anneal(&self, update_count: usize) -> f64 {
        if self.anneal_steps == 0 {
            return self.anneal_cap;
        }
        (update_count as f64 / self.anneal_steps as f64).min(self.anneal_cap)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DenoiserConfig {
    /// Hidden widths; the last one must equal the latent width.
    pub dims: Vec<usize>,
    pub emb_size: usize,
    pub n_classes: usize,
    pub norm: bool,
    pub activation: Activation,
    pub dropout: f64,
}

impl Default for DenoiserConfig {
    fn default() -> Self {
        Self {
            dims: vec![300],
            emb_size: 10,
            n_classes: 7,
            norm: false,
            activation: Activation::Tanh,
            dropout: 0.5,
        }
    }
}

impl DenoiserConfig {
    pub fn validate(&self) -> DiffRecResult<()> {
        if self.dims.is_empty() || self.dims.contains(&0) {
            return Err(DiffRecError::Configuration(format!(
                "denoiser.dims must be non-empty and positive, got {:?}",
                self.dims
            )));
        }
        if self.emb_size == 0 || self.n_classes == 0 {
            return Err(DiffRecError::Configuration(
                "denoiser.emb_size and denoiser.n_classes must be positive".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(DiffRecError::Configuration(format!(
                "denoiser.dropout must lie in [0, 1), got {}",
                self.dropout
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub batch_size: usize,
    /// Ascending cutoffs; the largest one is the ranking width.
    pub top_n: Vec<usize>,
    /// Evaluate the test split on train + valid inputs.
    pub tst_w_val: bool,
    pub condition: ConditionField,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            batch_size: 400,
            top_n: vec![10, 20, 50, 100],
            tst_w_val: false,
            condition: ConditionField::Age,
        }
    }
}

impl InferenceConfig {
    pub fn validate(&self) -> DiffRecResult<()> {
        if self.batch_size == 0 {
            return Err(DiffRecError::Configuration(
                "inference.batch_size must be greater than 0".into(),
            ));
        }
        if self.top_n.is_empty() || self.top_n.contains(&0) {
            return Err(DiffRecError::Configuration(format!(
                "inference.top_n must be non-empty and positive, got {:?}",
                self.top_n
            )));
        }
        if self.top_n.windows(2).any(|w| w[0] >= w[1]) {
            return Err(DiffRecError::Configuration(format!(
                "inference.top_n must be strictly ascending, got {:?}",
                self.top_n
            )));
        }
        Ok(())
    }

    /// Ranking width: the largest cutoff.
    pub fn top_k(&self) -> usize {
        self.top_n.last().copied().unwrap_or(0)
    }
}

/// Training hyperparameters recorded in checkpoint names.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub dir: String,
    pub lr1: f64,
    pub lr2: f64,
    pub wd1: f64,
    pub wd2: f64,
    /// Training batch size.
    pub batch_size: usize,
    pub log_name: String,
    /// Explicit file stem, bypassing the hyperparameter-derived name.
    pub stem: Option<String>,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            dir: "checkpoints".to_string(),
            lr1: 0.0001,
            lr2: 0.0001,
            wd1: 0.0,
            wd2: 0.0,
            batch_size: 400,
            log_name: "log".to_string(),
            stem: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub include_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            include_location: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DiffRecConfig::default_config();
        assert_eq!(config.dataset, "ml-1m_clean");
        assert_eq!(config.diffusion.steps, 20);
        assert_eq!(config.diffusion.noise_schedule, ScheduleKind::LinearVar);
        assert_eq!(config.inference.top_k(), 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_fails_sampling_steps() {
        let mut config = DiffRecConfig::default_config();
        config.diffusion.sampling_steps = 21;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_fails_descending_top_n() {
        let mut config = DiffRecConfig::default_config();
        config.inference.top_n = vec![20, 10];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_fails_latent_mismatch() {
        let mut config = DiffRecConfig::default_config();
        config.denoiser.dims = vec![200];
        assert!(matches!(
            config.validate(),
            Err(DiffRecError::Configuration(_))
        ));
    }

    #[test]
    fn test_apply_preset() {
        let mut config = DiffRecConfig::default_config();
        config.dataset = "amazon-book_clean".into();
        config.apply_dataset_preset().unwrap();
        assert_eq!(config.diffusion.steps, 5);
        assert_eq!(config.diffusion.noise_scale, 0.5);

        config.dataset = "unknown".into();
        assert!(config.apply_dataset_preset().is_err());
    }

    #[test]
    fn test_config_serialization_round_trip() {
        let config = DiffRecConfig::default_config();
        let toml_str = config.to_toml_string().unwrap();
        let back: DiffRecConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.toml");
        std::fs::write(
            &path,
            "dataset = \"yelp_clean\"\n[diffusion]\nmean_type = \"x0\"\nnoise_schedule = \"cosine\"\n",
        )
        .unwrap();
        let config = DiffRecConfig::from_file(&path).unwrap();
        assert_eq!(config.dataset, "yelp_clean");
        assert_eq!(config.diffusion.mean_type, MeanType::StartX);
        assert_eq!(config.diffusion.noise_schedule, ScheduleKind::Cosine);
        assert_eq!(config.inference.batch_size, 400);
    }

    #[test]
    fn test_unknown_schedule_in_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[diffusion]\nnoise_schedule = \"sqrt\"\n").unwrap();
        assert!(matches!(
            DiffRecConfig::from_file(&path),
            Err(DiffRecError::Configuration(_))
        ));
    }

    #[test]
    fn test_specs_follow_config() {
        let config = DiffRecConfig::default_config();
        let ae = config.autoencoder_spec(3706);
        assert_eq!(ae.latent_dim(), 300);
        let dn = config.denoiser_spec();
        assert_eq!(dn.in_dims, vec![300, 300]);
        dn.validate().unwrap();
        let diffusion = config.build_diffusion().unwrap();
        assert_eq!(diffusion.steps(), 20);
    }

    #[test]
    fn test_anneal_capped() {
        let ae = AutoencoderConfig::default();
        assert_eq!(ae.anneal(0), 0.0);
        assert_eq!(ae.anneal(1_000_000), ae.anneal_cap);
    }
}
