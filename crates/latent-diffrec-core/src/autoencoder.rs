//! Categorical variational autoencoder over interaction vectors.
//!
//! With one category the whole interaction vector passes through a single
//! encoder whose last layer emits `[mu ‖ logvar]`. With `n_cate > 1` the input
//! is reordered into category blocks through the [`CategoryMap`] and every
//! block gets its own encoder head; the latent is the concatenation of the
//! per-category latents. Decoding mirrors this and produces scores in
//! category order, which [`AutoEncoder::decode`] maps back to item order.
//!
//! Per-category layer widths are proportional to the category's share of the
//! items (at least 1); the last category takes whatever remains so the
//! concatenated latent is exactly `in_dims.last()` wide.
//!
//! # Parameter layout
//!
//! | name | shape |
//! |------|-------|
//! | `encoder.{2i}` / `encoder.{c}.{2i}` | stacked linear layers |
//! | `decoder.{2i}` / `decoder.{c}.{2i}` | stacked linear layers |
//! | `category_map` | `(n_items,)` u32, category order to item |
//! | `category_len` | `(n_cate,)` u32 block sizes |

use candle_core::{Tensor, D};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::category::CategoryMap;
use crate::error::{DiffRecError, DiffRecResult, TensorContext};
use crate::layers::{dropout, Activation, Mlp};
use crate::noise::normal_like;
use crate::weights::ParameterStore;

pub const CATEGORY_MAP_PARAM: &str = "category_map";
pub const CATEGORY_LEN_PARAM: &str = "category_len";

/// Architecture of an [`AutoEncoder`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoEncoderSpec {
    pub n_items: usize,
    pub n_cate: usize,
    /// Encoder widths; the last entry is the total latent width.
    pub in_dims: Vec<usize>,
    /// Decoder hidden widths; empty selects one shared linear decoder.
    pub out_dims: Vec<usize>,
    pub activation: Activation,
    /// Input dropout in training mode.
    pub dropout: f64,
}

impl AutoEncoderSpec {
    pub fn latent_dim(&self) -> usize {
        self.in_dims.last().copied().unwrap_or(0)
    }

    pub fn validate(&self) -> DiffRecResult<()> {
        if self.n_items == 0 {
            return Err(DiffRecError::Configuration("autoencoder needs at least one item".into()));
        }
        if self.n_cate == 0 {
            return Err(DiffRecError::Configuration("n_cate must be at least 1".into()));
        }
        if self.in_dims.is_empty() || self.in_dims.contains(&0) {
            return Err(DiffRecError::Configuration(format!(
                "autoencoder in_dims must be non-empty and positive, got {:?}",
                self.in_dims
            )));
        }
        if self.out_dims.contains(&0) {
            return Err(DiffRecError::Configuration(format!(
                "autoencoder out_dims must be positive, got {:?}",
                self.out_dims
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(DiffRecError::Configuration(format!(
                "autoencoder dropout must lie in [0, 1), got {}",
                self.dropout
            )));
        }
        Ok(())
    }
}

/// Result of encoding one batch.
#[derive(Debug, Clone)]
pub struct EncodeOutput {
    /// Input in category order (after dropout in training mode).
    pub target: Tensor,
    pub latent: Tensor,
    pub kl: f32,
}

/// Per-category layer widths, proportional to category sizes.
pub fn category_latent_dims(
    in_dims: &[usize],
    category_lens: &[usize],
) -> DiffRecResult<Vec<Vec<usize>>> {
    let n_items: usize = category_lens.iter().sum();
    let n_cate = category_lens.len();
    if n_cate == 1 {
        return Ok(vec![in_dims.to_vec()]);
    }

    let mut dims: Vec<Vec<usize>> = category_lens[..n_cate - 1]
        .iter()
        .map(|&len| {
            in_dims
                .iter()
                .map(|&d| ((len as f64 / n_items as f64 * d as f64) as usize).max(1))
                .collect()
        })
        .collect();

    let mut last = Vec::with_capacity(in_dims.len());
    for (layer, &d) in in_dims.iter().enumerate() {
        let used: usize = dims.iter().map(|c| c[layer]).sum();
        if used >= d {
            return Err(DiffRecError::Configuration(format!(
                "layer width {} too small to split across {} categories",
                d, n_cate
            )));
        }
        last.push(d - used);
    }
    dims.push(last);
    Ok(dims)
}

#[derive(Debug, Clone)]
pub struct AutoEncoder {
    spec: AutoEncoderSpec,
    category_map: CategoryMap,
    latent_dims: Vec<Vec<usize>>,
    encoders: Vec<Mlp>,
    decoders: Vec<Mlp>,
}

impl AutoEncoder {
    /// Create a freshly initialised autoencoder and its parameter set.
    pub fn init(
        spec: AutoEncoderSpec,
        category_map: CategoryMap,
        rng: &mut dyn RngCore,
    ) -> DiffRecResult<(Self, ParameterStore)> {
        spec.validate()?;
        check_map_matches(&spec, &category_map)?;
        let latent_dims = category_latent_dims(&spec.in_dims, category_map.category_lens())?;

        let device = candle_core::Device::Cpu;
        let mut store = ParameterStore::new(device.clone());
        store.insert(CATEGORY_MAP_PARAM, category_map.to_tensor(&device)?);
        let lens: Vec<u32> = category_map.category_lens().iter().map(|&l| l as u32).collect();
        let n_lens = lens.len();
        store.insert(
            CATEGORY_LEN_PARAM,
            Tensor::from_vec(lens, n_lens, &device).op("category len tensor")?,
        );

        for (c, dims) in encoder_dims(&latent_dims, category_map.category_lens())
            .iter()
            .enumerate()
        {
            Mlp::init_parameters(&mut store, &head_prefix("encoder", spec.n_cate, c), dims, rng)?;
        }
        for (c, dims) in decoder_dims(&spec, &latent_dims, category_map.category_lens())
            .iter()
            .enumerate()
        {
            let prefix = if spec.n_cate == 1 || spec.out_dims.is_empty() {
                "decoder".to_string()
            } else {
                head_prefix("decoder", spec.n_cate, c)
            };
            Mlp::init_parameters(&mut store, &prefix, dims, rng)?;
        }

        let ae = Self::from_parameters(spec, &store)?;
        Ok((ae, store))
    }

    /// Rebuild an autoencoder from a parameter set.
    ///
    /// # Errors
    ///
    /// - [`DiffRecError::DataIntegrity`] when the stored category map is not a
    ///   bijection or a parameter is missing.
    /// - [`DiffRecError::Configuration`] when the map disagrees with `spec`.
    pub fn from_parameters(spec: AutoEncoderSpec, store: &ParameterStore) -> DiffRecResult<Self> {
        spec.validate()?;
        let category_map = CategoryMap::from_tensors(
            store.get(CATEGORY_MAP_PARAM)?,
            store.get(CATEGORY_LEN_PARAM)?,
        )?;
        check_map_matches(&spec, &category_map)?;
        let latent_dims = category_latent_dims(&spec.in_dims, category_map.category_lens())?;

        let vb = store.var_builder();
        let encoders = encoder_dims(&latent_dims, category_map.category_lens())
            .iter()
            .enumerate()
            .map(|(c, dims)| {
                Mlp::load(
                    dims,
                    spec.activation,
                    false,
                    vb.pp(head_prefix("encoder", spec.n_cate, c)),
                )
            })
            .collect::<DiffRecResult<Vec<_>>>()?;

        let single_decoder = spec.n_cate == 1 || spec.out_dims.is_empty();
        let decoders = decoder_dims(&spec, &latent_dims, category_map.category_lens())
            .iter()
            .enumerate()
            .map(|(c, dims)| {
                let vb = if single_decoder {
                    vb.pp("decoder")
                } else {
                    vb.pp(head_prefix("decoder", spec.n_cate, c))
                };
                Mlp::load(dims, spec.activation, false, vb)
            })
            .collect::<DiffRecResult<Vec<_>>>()?;

        info!(
            n_items = spec.n_items,
            n_cate = spec.n_cate,
            category_lens = ?category_map.category_lens(),
            latent_dims = ?latent_dims,
            decoders = decoders.len(),
            "Built autoencoder"
        );

        Ok(Self {
            spec,
            category_map,
            latent_dims,
            encoders,
            decoders,
        })
    }

    pub fn spec(&self) -> &AutoEncoderSpec {
        &self.spec
    }

    pub fn category_map(&self) -> &CategoryMap {
        &self.category_map
    }

    pub fn n_items(&self) -> usize {
        self.spec.n_items
    }

    pub fn latent_dim(&self) -> usize {
        self.spec.latent_dim()
    }

    /// Per-category encoder widths.
    pub fn latent_dims(&self) -> &[Vec<usize>] {
        &self.latent_dims
    }

    /// Deterministic (evaluation mode) encoding: no dropout, latent = mu.
    pub fn encode(&self, x: &Tensor) -> DiffRecResult<EncodeOutput> {
        self.encode_inner(x, None)
    }

    /// Training mode encoding: input dropout and a reparameterised latent.
    pub fn encode_train(&self, x: &Tensor, rng: &mut dyn RngCore) -> DiffRecResult<EncodeOutput> {
        self.encode_inner(x, Some(rng))
    }

    fn encode_inner(&self, x: &Tensor, mut rng: Option<&mut dyn RngCore>) -> DiffRecResult<EncodeOutput> {
        let (_, cols) = x.dims2().op("encode input")?;
        if cols != self.spec.n_items {
            return Err(DiffRecError::shape("autoencoder encode", self.spec.n_items, cols));
        }

        let x = match rng.as_deref_mut() {
            Some(rng) => dropout(x, self.spec.dropout, rng)?,
            None => x.clone(),
        };
        let target = if self.spec.n_cate == 1 {
            x
        } else {
            self.category_map.permute_columns(&x)?
        };

        let mut mus = Vec::with_capacity(self.encoders.len());
        let mut logvars = Vec::with_capacity(self.encoders.len());
        for (c, encoder) in self.encoders.iter().enumerate() {
            let block = if self.spec.n_cate == 1 {
                target.clone()
            } else {
                let range = self.category_map.category_range(c);
                target.narrow(1, range.start, range.len()).op("category block")?
            };
            let hidden = encoder.forward(&block)?;
            let width = self.latent_dims[c][self.latent_dims[c].len() - 1];
            mus.push(hidden.narrow(1, 0, width).op("split mu")?);
            logvars.push(hidden.narrow(1, width, width).op("split logvar")?);
        }
        let mu = Tensor::cat(&mus, 1).op("concat mu")?;
        let logvar = Tensor::cat(&logvars, 1).op("concat logvar")?;

        let latent = match rng {
            Some(rng) => reparameterize(&mu, &logvar, rng)?,
            None => mu.clone(),
        };

        let kl = kl_divergence(&mu, &logvar)?;
        Ok(EncodeOutput { target, latent, kl })
    }

    /// Decode latents into scores in category order.
    pub fn decode_category_order(&self, latent: &Tensor) -> DiffRecResult<Tensor> {
        let (_, width) = latent.dims2().op("decode input")?;
        if width != self.latent_dim() {
            return Err(DiffRecError::shape("autoencoder decode", self.latent_dim(), width));
        }

        if self.decoders.len() == 1 {
            return self.decoders[0].forward(latent);
        }

        let mut start = 0;
        let mut outputs = Vec::with_capacity(self.decoders.len());
        for (c, decoder) in self.decoders.iter().enumerate() {
            let w = self.latent_dims[c][self.latent_dims[c].len() - 1];
            let block = latent.narrow(1, start, w).op("latent block")?;
            outputs.push(decoder.forward(&block)?);
            start += w;
        }
        Tensor::cat(&outputs, 1).op("concat decoded blocks")
    }

    /// Decode latents into scores in original item order.
    pub fn decode(&self, latent: &Tensor) -> DiffRecResult<Tensor> {
        let scores = self.decode_category_order(latent)?;
        if self.spec.n_cate == 1 {
            Ok(scores)
        } else {
            self.category_map.unpermute_columns(&scores)
        }
    }

    /// Multinomial log-likelihood reconstruction loss.
    ///
    /// `-mean_b(sum_i log_softmax(recon)_bi * target_bi)`.
    pub fn compute_loss(recon: &Tensor, target: &Tensor) -> DiffRecResult<f32> {
        if recon.dims() != target.dims() {
            return Err(DiffRecError::shape(
                "reconstruction loss",
                format!("{:?}", target.dims()),
                format!("{:?}", recon.dims()),
            ));
        }
        let loss = candle_nn::ops::log_softmax(recon, D::Minus1)
            .and_then(|l| l.mul(target))
            .and_then(|l| l.sum(D::Minus1))
            .and_then(|l| l.mean_all())
            .and_then(|l| l.neg())
            .and_then(|l| l.to_scalar::<f32>())
            .op("reconstruction loss")?;
        Ok(loss)
    }

    /// Evidence lower bound objective: reconstruction + anneal * KL.
    pub fn elbo(&self, x: &Tensor, anneal: f32, rng: &mut dyn RngCore) -> DiffRecResult<f32> {
        let encoded = self.encode_train(x, rng)?;
        let recon = self.decode_category_order(&encoded.latent)?;
        let recon_loss = Self::compute_loss(&recon, &encoded.target)?;
        debug!(recon_loss, kl = encoded.kl, anneal, "Autoencoder ELBO");
        Ok(recon_loss + anneal * encoded.kl)
    }
}

fn check_map_matches(spec: &AutoEncoderSpec, map: &CategoryMap) -> DiffRecResult<()> {
    if map.n_items() != spec.n_items {
        return Err(DiffRecError::Configuration(format!(
            "category map covers {} items, autoencoder expects {}",
            map.n_items(),
            spec.n_items
        )));
    }
    if map.n_categories() != spec.n_cate {
        return Err(DiffRecError::Configuration(format!(
            "category map has {} categories, autoencoder expects {}",
            map.n_categories(),
            spec.n_cate
        )));
    }
    Ok(())
}

fn head_prefix(stack: &str, n_cate: usize, c: usize) -> String {
    if n_cate == 1 {
        stack.to_string()
    } else {
        format!("{}.{}", stack, c)
    }
}

fn encoder_dims(
    latent_dims: &[Vec<usize>],
    category_lens: &[usize],
) -> Vec<Vec<usize>> {
    latent_dims
        .iter()
        .zip(category_lens)
        .map(|(dims, &len)| {
            let mut layer_dims = Vec::with_capacity(dims.len() + 1);
            layer_dims.push(len);
            layer_dims.extend_from_slice(&dims[..dims.len() - 1]);
            layer_dims.push(dims[dims.len() - 1] * 2);
            layer_dims
        })
        .collect()
}

fn decoder_dims(
    spec: &AutoEncoderSpec,
    latent_dims: &[Vec<usize>],
    category_lens: &[usize],
) -> Vec<Vec<usize>> {
    if spec.n_cate == 1 || spec.out_dims.is_empty() {
        let mut dims = vec![spec.latent_dim()];
        if spec.n_cate == 1 {
            dims.extend_from_slice(&spec.out_dims);
        }
        dims.push(spec.n_items);
        return vec![dims];
    }
    latent_dims
        .iter()
        .zip(category_lens)
        .map(|(dims, &len)| {
            let mut layer_dims: Vec<usize> = dims.iter().rev().copied().collect();
            layer_dims.push(len);
            layer_dims
        })
        .collect()
}

fn reparameterize(mu: &Tensor, logvar: &Tensor, rng: &mut dyn RngCore) -> DiffRecResult<Tensor> {
    let eps = normal_like(mu, rng)?;
    logvar
        .affine(0.5, 0.0)
        .and_then(|h| h.exp())
        .and_then(|std| eps.mul(&std))
        .and_then(|n| n.add(mu))
        .op("reparameterize")
}

/// `-0.5 * mean_b(sum_j (1 + logvar - mu^2 - exp(logvar)))`.
fn kl_divergence(mu: &Tensor, logvar: &Tensor) -> DiffRecResult<f32> {
    let inner = logvar
        .affine(1.0, 1.0)
        .and_then(|t| t.sub(&mu.sqr()?))
        .and_then(|t| t.sub(&logvar.exp()?))
        .op("kl terms")?;
    let kl = inner
        .sum(D::Minus1)
        .and_then(|s| s.mean_all())
        .and_then(|m| m.affine(-0.5, 0.0))
        .and_then(|m| m.to_scalar::<f32>())
        .op("kl divergence")?;
    Ok(kl)
}
