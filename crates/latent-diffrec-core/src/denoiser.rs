//! Conditional denoiser for the reverse diffusion chain.
//!
//! The network sees a noisy latent, the timestep and a categorical user
//! attribute. The attribute is one-hot encoded, zeroed for samples whose
//! condition is masked, embedded by a two-layer block and multiplied into
//! the latent; the timestep is embedded sinusoidally and concatenated.
//!
//! ```text
//! t ──► sinusoid(emb_size) ──► emb_layer ──────────────────────┐
//! label, mask ──► one-hot·(!mask) ──► Linear ─ GELU ─ Linear ──┐│
//! x ──► [l2 norm] ──► [dropout] ──────────────────────────► x⊙c ‖ emb
//!                                                               │
//!                                       in_layers (act after every layer)
//!                                                               │
//!                                       out_layers (no trailing act) ──► x0 or eps
//! ```

use std::ops::Range;

use candle_core::{Device, Module, Tensor};
use candle_nn::Linear;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::diffusion::MeanType;
use crate::error::{DiffRecError, DiffRecResult, TensorContext};
use crate::layers::{dropout, l2_normalize, masked_one_hot, Activation, Mlp};
use crate::weights::ParameterStore;

/// Period controlling the lowest timestep embedding frequency.
pub const MAX_PERIOD: f64 = 10_000.0;

/// Per-sample condition labels and mask flags.
///
/// A `true` mask flag drops the condition for that sample (unconditional
/// denoising); the class vector fed to the network is all zeros.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionBatch {
    labels: Vec<u32>,
    mask: Vec<bool>,
}

impl ConditionBatch {
    pub fn new(labels: Vec<u32>, mask: Vec<bool>) -> DiffRecResult<Self> {
        if labels.len() != mask.len() {
            return Err(DiffRecError::shape("condition mask", labels.len(), mask.len()));
        }
        Ok(Self { labels, mask })
    }

    /// Every sample conditioned on its label.
    pub fn conditional(labels: Vec<u32>) -> Self {
        let mask = vec![false; labels.len()];
        Self { labels, mask }
    }

    /// Every sample unconditioned.
    pub fn unconditional(batch_size: usize) -> Self {
        Self {
            labels: vec![0; batch_size],
            mask: vec![true; batch_size],
        }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn labels(&self) -> &[u32] {
        &self.labels
    }

    pub fn mask(&self) -> &[bool] {
        &self.mask
    }

    pub fn slice(&self, range: Range<usize>) -> Self {
        Self {
            labels: self.labels[range.clone()].to_vec(),
            mask: self.mask[range].to_vec(),
        }
    }
}

/// Anything that can predict `x0` or `eps` for a noisy latent batch.
pub trait Denoiser: Send + Sync {
    /// Quantity returned by [`Denoiser::predict`].
    fn prediction(&self) -> MeanType;

    /// Width of the latents this denoiser accepts and returns.
    fn latent_dim(&self) -> usize;

    /// Evaluation mode prediction, one timestep per sample.
    fn predict(
        &self,
        noisy: &Tensor,
        condition: &ConditionBatch,
        timesteps: &[usize],
    ) -> DiffRecResult<Tensor>;

    /// Training mode prediction; stochastic layers draw from `rng`.
    fn predict_train(
        &self,
        noisy: &Tensor,
        condition: &ConditionBatch,
        timesteps: &[usize],
        _rng: &mut dyn RngCore,
    ) -> DiffRecResult<Tensor> {
        self.predict(noisy, condition, timesteps)
    }
}

/// Architecture of a [`ConditionalDenoiser`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenoiserSpec {
    /// Encoder widths; `in_dims[0]` is the latent width.
    pub in_dims: Vec<usize>,
    /// Decoder widths; must start at `in_dims.last()` and end at the latent width.
    pub out_dims: Vec<usize>,
    pub emb_size: usize,
    pub n_classes: usize,
    pub norm: bool,
    pub activation: Activation,
    pub dropout: f64,
    pub prediction: MeanType,
}

impl DenoiserSpec {
    /// Mirror-image layout: `out_dims = mlp_dims ++ [latent]`, `in_dims` its reverse.
    #[allow(clippy::too_many_arguments)]
    pub fn symmetric(
        latent_dim: usize,
        mlp_dims: &[usize],
        emb_size: usize,
        n_classes: usize,
        norm: bool,
        activation: Activation,
        dropout: f64,
        prediction: MeanType,
    ) -> Self {
        let mut out_dims = mlp_dims.to_vec();
        out_dims.push(latent_dim);
        let in_dims = out_dims.iter().rev().copied().collect();
        Self {
            in_dims,
            out_dims,
            emb_size,
            n_classes,
            norm,
            activation,
            dropout,
            prediction,
        }
    }

    pub fn latent_dim(&self) -> usize {
        self.in_dims.first().copied().unwrap_or(0)
    }

    /// # Errors
    ///
    /// [`DiffRecError::Configuration`] when the in/out dimension contract is
    /// violated or a width is zero.
    pub fn validate(&self) -> DiffRecResult<()> {
        if self.in_dims.len() < 2 {
            return Err(DiffRecError::Configuration(format!(
                "denoiser in_dims needs at least two entries, got {:?}",
                self.in_dims
            )));
        }
        if self.out_dims.len() < 2 {
            return Err(DiffRecError::Configuration(format!(
                "denoiser out_dims needs at least two entries so the output layer is linear, got {:?}",
                self.out_dims
            )));
        }
        if self.in_dims.contains(&0) || self.out_dims.contains(&0) {
            return Err(DiffRecError::Configuration(
                "denoiser layer widths must be positive".into(),
            ));
        }
        if self.out_dims.first() != self.in_dims.last() {
            return Err(DiffRecError::Configuration(format!(
                "In and out dimensions must equal to each other: out_dims[0]={:?}, in_dims[-1]={:?}",
                self.out_dims.first(),
                self.in_dims.last()
            )));
        }
        if self.out_dims.last() != self.in_dims.first() {
            return Err(DiffRecError::Configuration(format!(
                "denoiser output width {:?} must equal the latent width {}",
                self.out_dims.last(),
                self.in_dims[0]
            )));
        }
        // The class embedding has width in_dims[1] and is multiplied into x.
        if self.in_dims[1] != self.in_dims[0] {
            return Err(DiffRecError::Configuration(format!(
                "class embedding width in_dims[1]={} must equal the latent width {}",
                self.in_dims[1], self.in_dims[0]
            )));
        }
        if self.emb_size == 0 || self.n_classes == 0 {
            return Err(DiffRecError::Configuration(
                "emb_size and n_classes must be positive".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(DiffRecError::Configuration(format!(
                "denoiser dropout must lie in [0, 1), got {}",
                self.dropout
            )));
        }
        Ok(())
    }

    fn in_layer_dims(&self) -> Vec<usize> {
        let mut dims = Vec::with_capacity(self.in_dims.len());
        dims.push(self.in_dims[0] + self.emb_size);
        dims.extend_from_slice(&self.in_dims[1..]);
        dims
    }
}

/// Sinusoidal timestep embedding, `(timesteps.len(), dim)`.
///
/// Frequencies are `exp(-ln(max_period) * i / half)`; the output is
/// `[cos(t·f) ‖ sin(t·f)]`, zero padded by one column for odd `dim`.
pub fn timestep_embedding(
    timesteps: &[usize],
    dim: usize,
    max_period: f64,
    device: &Device,
) -> DiffRecResult<Tensor> {
    let half = dim / 2;
    let freqs: Vec<f32> = (0..half)
        .map(|i| (-(max_period.ln() as f32) * i as f32 / half as f32).exp())
        .collect();

    let mut values = Vec::with_capacity(timesteps.len() * dim);
    for &t in timesteps {
        let t = t as f32;
        values.extend(freqs.iter().map(|f| (t * f).cos()));
        values.extend(freqs.iter().map(|f| (t * f).sin()));
        if dim % 2 == 1 {
            values.push(0.0);
        }
    }
    Tensor::from_vec(values, (timesteps.len(), dim), device).op("timestep embedding")
}

/// MLP denoiser conditioned on timestep and a masked class label.
#[derive(Debug, Clone)]
pub struct ConditionalDenoiser {
    spec: DenoiserSpec,
    emb_layer: Linear,
    class_fc1: Linear,
    class_fc2: Linear,
    in_layers: Mlp,
    out_layers: Mlp,
}

impl ConditionalDenoiser {
    /// Xavier-initialise a denoiser and return its parameter set.
    pub fn init(spec: DenoiserSpec, rng: &mut dyn RngCore) -> DiffRecResult<(Self, ParameterStore)> {
        spec.validate()?;
        let mut store = ParameterStore::new(Device::Cpu);
        store.xavier_linear("emb_layer", spec.emb_size, spec.emb_size, rng)?;
        store.xavier_linear("class_emb.model.0", spec.n_classes, spec.in_dims[1], rng)?;
        store.xavier_linear("class_emb.model.2", spec.in_dims[1], spec.in_dims[1], rng)?;
        Mlp::init_parameters(&mut store, "in_layers", &spec.in_layer_dims(), rng)?;
        Mlp::init_parameters(&mut store, "out_layers", &spec.out_dims, rng)?;
        let denoiser = Self::from_parameters(spec, &store)?;
        Ok((denoiser, store))
    }

    /// Build from a parameter set.
    pub fn from_parameters(spec: DenoiserSpec, store: &ParameterStore) -> DiffRecResult<Self> {
        spec.validate()?;
        let vb = store.var_builder();
        let emb_layer =
            candle_nn::linear(spec.emb_size, spec.emb_size, vb.pp("emb_layer")).op("load emb_layer")?;
        let class_vb = vb.pp("class_emb").pp("model");
        let class_fc1 = candle_nn::linear(spec.n_classes, spec.in_dims[1], class_vb.pp("0"))
            .op("load class embedding")?;
        let class_fc2 = candle_nn::linear(spec.in_dims[1], spec.in_dims[1], class_vb.pp("2"))
            .op("load class embedding")?;
        let in_layers = Mlp::load(&spec.in_layer_dims(), spec.activation, true, vb.pp("in_layers"))?;
        let out_layers = Mlp::load(&spec.out_dims, spec.activation, false, vb.pp("out_layers"))?;

        debug!(
            in_dims = ?spec.in_dims,
            out_dims = ?spec.out_dims,
            emb_size = spec.emb_size,
            n_classes = spec.n_classes,
            prediction = %spec.prediction,
            "Built conditional denoiser"
        );

        Ok(Self {
            spec,
            emb_layer,
            class_fc1,
            class_fc2,
            in_layers,
            out_layers,
        })
    }

    pub fn spec(&self) -> &DenoiserSpec {
        &self.spec
    }

    fn forward(
        &self,
        x: &Tensor,
        condition: &ConditionBatch,
        timesteps: &[usize],
        rng: Option<&mut dyn RngCore>,
    ) -> DiffRecResult<Tensor> {
        let (batch, width) = x.dims2().op("denoiser input")?;
        if width != self.spec.latent_dim() {
            return Err(DiffRecError::shape("denoiser latent", self.spec.latent_dim(), width));
        }
        if condition.len() != batch {
            return Err(DiffRecError::shape("denoiser condition batch", batch, condition.len()));
        }
        if timesteps.len() != batch {
            return Err(DiffRecError::shape("denoiser timesteps", batch, timesteps.len()));
        }

        let time_emb = timestep_embedding(timesteps, self.spec.emb_size, MAX_PERIOD, x.device())?;
        let emb = self.emb_layer.forward(&time_emb).op("time embedding")?;

        let one_hot = masked_one_hot(
            condition.labels(),
            condition.mask(),
            self.spec.n_classes,
            x.device(),
        )?;
        let c = self
            .class_fc1
            .forward(&one_hot)
            .and_then(|h| h.gelu_erf())
            .and_then(|h| self.class_fc2.forward(&h))
            .op("class embedding")?;

        let mut x = if self.spec.norm {
            l2_normalize(x)?
        } else {
            x.clone()
        };
        if let Some(rng) = rng {
            x = dropout(&x, self.spec.dropout, rng)?;
        }

        let h = x
            .mul(&c)
            .and_then(|xc| Tensor::cat(&[&xc, &emb], 1))
            .op("concat condition and time")?;
        let h = self.in_layers.forward(&h)?;
        self.out_layers.forward(&h)
    }
}

impl Denoiser for ConditionalDenoiser {
    fn prediction(&self) -> MeanType {
        self.spec.prediction
    }

    fn latent_dim(&self) -> usize {
        self.spec.latent_dim()
    }

    fn predict(
        &self,
        noisy: &Tensor,
        condition: &ConditionBatch,
        timesteps: &[usize],
    ) -> DiffRecResult<Tensor> {
        self.forward(noisy, condition, timesteps, None)
    }

    fn predict_train(
        &self,
        noisy: &Tensor,
        condition: &ConditionBatch,
        timesteps: &[usize],
        rng: &mut dyn RngCore,
    ) -> DiffRecResult<Tensor> {
        self.forward(noisy, condition, timesteps, Some(rng))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::noise::{seeded_rng, standard_normal};

    fn spec() -> DenoiserSpec {
        DenoiserSpec::symmetric(4, &[4], 6, 3, false, Activation::Tanh, 0.5, MeanType::Epsilon)
    }

    #[test]
    fn test_symmetric_layout() {
        let s = DenoiserSpec::symmetric(300, &[300], 10, 7, false, Activation::Tanh, 0.5, MeanType::Epsilon);
        assert_eq!(s.in_dims, vec![300, 300]);
        assert_eq!(s.out_dims, vec![300, 300]);
        assert_eq!(s.in_layer_dims(), vec![310, 300]);
        s.validate().unwrap();
    }

    #[test]
    fn test_dimension_contract() {
        let mut s = spec();
        s.out_dims = vec![5, 4];
        assert!(matches!(s.validate(), Err(DiffRecError::Configuration(_))));
        let mut s = spec();
        s.in_dims = vec![4];
        assert!(matches!(s.validate(), Err(DiffRecError::Configuration(_))));
    }

    #[test]
    fn test_single_out_dim_rejected() {
        // A lone out width would leave no output layer and end on the activation.
        let mut s = spec();
        s.out_dims = vec![4];
        assert!(matches!(s.validate(), Err(DiffRecError::Configuration(_))));
        assert!(ConditionalDenoiser::init(s, &mut seeded_rng(0)).is_err());
    }

    #[test]
    fn test_timestep_embedding_values() {
        let emb = timestep_embedding(&[0, 3], 5, MAX_PERIOD, &Device::Cpu).unwrap();
        let rows = emb.to_vec2::<f32>().unwrap();
        assert_eq!(rows[0], vec![1.0, 1.0, 0.0, 0.0, 0.0]);
        // First frequency is 1.
        assert!((rows[1][0] - 3.0f32.cos()).abs() < 1e-6);
        assert!((rows[1][2] - 3.0f32.sin()).abs() < 1e-6);
        assert_eq!(rows[1][4], 0.0);
    }

    #[test]
    fn test_parameter_names() {
        let (_, store) = ConditionalDenoiser::init(spec(), &mut seeded_rng(0)).unwrap();
        for name in [
            "emb_layer.weight",
            "class_emb.model.0.weight",
            "class_emb.model.2.bias",
            "in_layers.0.weight",
            "out_layers.0.weight",
        ] {
            assert!(store.contains(name), "missing {name}");
        }
        assert_eq!(store.get("in_layers.0.weight").unwrap().dims(), &[4, 10]);
    }

    #[test]
    fn test_predict_shape_and_determinism() {
        let (d, _) = ConditionalDenoiser::init(spec(), &mut seeded_rng(1)).unwrap();
        let x = standard_normal((3, 4), &Device::Cpu, &mut seeded_rng(2)).unwrap();
        let cond = ConditionBatch::conditional(vec![0, 2, 1]);
        let a = d.predict(&x, &cond, &[0, 1, 2]).unwrap();
        let b = d.predict(&x, &cond, &[0, 1, 2]).unwrap();
        assert_eq!(a.dims(), &[3, 4]);
        assert_eq!(a.to_vec2::<f32>().unwrap(), b.to_vec2::<f32>().unwrap());
    }

    #[test]
    fn test_masked_condition_matches_unconditional() {
        let (d, _) = ConditionalDenoiser::init(spec(), &mut seeded_rng(1)).unwrap();
        let x = standard_normal((2, 4), &Device::Cpu, &mut seeded_rng(2)).unwrap();
        let masked = ConditionBatch::new(vec![2, 1], vec![true, true]).unwrap();
        let a = d.predict(&x, &masked, &[1, 1]).unwrap();
        let b = d.predict(&x, &ConditionBatch::unconditional(2), &[1, 1]).unwrap();
        assert_eq!(a.to_vec2::<f32>().unwrap(), b.to_vec2::<f32>().unwrap());
    }

    #[test]
    fn test_batch_mismatch_is_shape_error() {
        let (d, _) = ConditionalDenoiser::init(spec(), &mut seeded_rng(1)).unwrap();
        let x = standard_normal((3, 4), &Device::Cpu, &mut seeded_rng(2)).unwrap();
        let cond = ConditionBatch::conditional(vec![0, 1]);
        assert!(matches!(
            d.predict(&x, &cond, &[0, 0, 0]),
            Err(DiffRecError::Shape { .. })
        ));
    }

    #[test]
    fn test_label_out_of_range() {
        let (d, _) = ConditionalDenoiser::init(spec(), &mut seeded_rng(1)).unwrap();
        let x = standard_normal((1, 4), &Device::Cpu, &mut seeded_rng(2)).unwrap();
        let cond = ConditionBatch::conditional(vec![3]);
        assert!(matches!(
            d.predict(&x, &cond, &[0]),
            Err(DiffRecError::DataIntegrity(_))
        ));
    }

    #[test]
    fn test_condition_slice() {
        let cond = ConditionBatch::new(vec![1, 2, 3], vec![false, true, false]).unwrap();
        let s = cond.slice(1..3);
        assert_eq!(s.labels(), &[2, 3]);
        assert_eq!(s.mask(), &[true, false]);
        assert!(ConditionBatch::new(vec![1], vec![]).is_err());
    }
}
