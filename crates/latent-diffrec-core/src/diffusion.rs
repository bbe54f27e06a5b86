//! Gaussian diffusion over autoencoder latents.
//!
//! States run `0..T`, 0 being the least noisy. The forward process corrupts a
//! clean latent in closed form, the reverse process walks the chain back with
//! a [`Denoiser`] that predicts either the clean latent or the added noise.
//!
//! # Reverse sampling
//!
//! `p_sample` with `k` sampling steps:
//!
//! - `k == 0`: the input is returned untouched;
//! - `k == T`: the input is treated as the noisiest state;
//! - `k < T`: the input is first corrupted to step `k - 1`.
//!
//! The chain then runs `k - 1, …, 0`. Each step takes the posterior mean of
//! `q(x_{t-1} | x_t, x0_hat)`; noise `exp(½·log σ²_t)·ε` is added only when
//! sampling noise is enabled and `t != 0`.
//!
//! With a zero noise scale there is no schedule and reverse sampling applies
//! the denoiser directly, once per step.

use std::fmt;
use std::str::FromStr;

use candle_core::{Device, Tensor, D};
use rand::distributions::WeightedIndex;
use rand::{Rng, RngCore};
use rand_distr::Distribution;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::denoiser::{ConditionBatch, Denoiser};
use crate::error::{DiffRecError, DiffRecResult, TensorContext};
use crate::noise::normal_like;
use crate::schedule::{NoiseBounds, NoiseSchedule, ScheduleKind};

/// Loss values remembered per timestep for importance sampling.
pub const HISTORY_NUM_PER_TERM: usize = 10;

/// Probability mass spread uniformly over timesteps in importance sampling.
pub const UNIFORM_PROB: f64 = 0.001;

/// What the denoiser predicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MeanType {
    /// The clean latent `x0`.
    #[serde(rename = "x0")]
    StartX,
    /// The noise `eps` added by the forward process.
    #[default]
    #[serde(rename = "eps")]
    Epsilon,
}

impl MeanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StartX => "x0",
            Self::Epsilon => "eps",
        }
    }
}

impl fmt::Display for MeanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MeanType {
    type Err = DiffRecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "x0" => Ok(Self::StartX),
            "eps" => Ok(Self::Epsilon),
            other => Err(DiffRecError::Configuration(format!(
                "Unimplemented mean type {} (expected x0 or eps)",
                other
            ))),
        }
    }
}

/// Per-sample weighted training loss for one batch.
#[derive(Debug, Clone)]
pub struct TrainingLoss {
    /// `(batch,)` loss, already divided by the timestep sampling probability.
    pub loss: Tensor,
    pub timesteps: Vec<usize>,
    /// Sampling probability of each timestep, scaled by `T`.
    pub pt: Vec<f64>,
}

impl TrainingLoss {
    pub fn mean(&self) -> DiffRecResult<f32> {
        self.loss
            .mean_all()
            .and_then(|m| m.to_scalar::<f32>())
            .op("mean training loss")
    }
}

/// Posterior `q(x_{t-1} | x_t, x0)` moments.
#[derive(Debug, Clone)]
pub struct Posterior {
    pub mean: Tensor,
    pub variance: Tensor,
    pub log_variance_clipped: Tensor,
}

#[derive(Debug, Clone)]
pub struct GaussianDiffusion {
    mean_type: MeanType,
    steps: usize,
    schedule: Option<NoiseSchedule>,
    lt_history: Vec<[f64; HISTORY_NUM_PER_TERM]>,
    lt_count: Vec<usize>,
}

impl GaussianDiffusion {
    /// Build the process for `steps` diffusion steps.
    ///
    /// A zero noise scale skips schedule construction.
    pub fn new(
        mean_type: MeanType,
        kind: ScheduleKind,
        bounds: NoiseBounds,
        steps: usize,
        beta_fixed: bool,
    ) -> DiffRecResult<Self> {
        if steps == 0 {
            return Err(DiffRecError::Configuration(
                "diffusion steps must be greater than 0".into(),
            ));
        }
        bounds.validate()?;
        let schedule = if bounds.is_zero() {
            debug!(steps, "Noise scale is zero, forward process disabled");
            None
        } else {
            Some(NoiseSchedule::new(kind, steps, bounds, beta_fixed)?)
        };
        Ok(Self::assemble(mean_type, steps, schedule))
    }

    /// Build around an existing schedule.
    pub fn with_schedule(mean_type: MeanType, schedule: NoiseSchedule) -> Self {
        let steps = schedule.steps();
        Self::assemble(mean_type, steps, Some(schedule))
    }

    fn assemble(mean_type: MeanType, steps: usize, schedule: Option<NoiseSchedule>) -> Self {
        Self {
            mean_type,
            steps,
            schedule,
            lt_history: vec![[0.0; HISTORY_NUM_PER_TERM]; steps],
            lt_count: vec![0; steps],
        }
    }

    pub fn mean_type(&self) -> MeanType {
        self.mean_type
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    /// `None` when the noise scale is zero.
    pub fn schedule(&self) -> Option<&NoiseSchedule> {
        self.schedule.as_ref()
    }

    fn require_schedule(&self, operation: &str) -> DiffRecResult<&NoiseSchedule> {
        self.schedule.as_ref().ok_or_else(|| {
            DiffRecError::Configuration(format!("{} needs a non-zero noise scale", operation))
        })
    }

    /// Gather `table[t_b]` for every sample into a `(batch, 1)` tensor.
    pub fn extract_into_tensor(table: &[f64], t: &[usize], device: &Device) -> DiffRecResult<Tensor> {
        let values = t
            .iter()
            .map(|&step| {
                table.get(step).map(|v| *v as f32).ok_or_else(|| {
                    DiffRecError::DataIntegrity(format!(
                        "timestep {} outside {} diffusion steps",
                        step,
                        table.len()
                    ))
                })
            })
            .collect::<DiffRecResult<Vec<f32>>>()?;
        Tensor::from_vec(values, (t.len(), 1), device).op("extract timestep coefficients")
    }

    /// Closed-form forward corruption with explicit noise.
    pub fn q_sample(&self, x_start: &Tensor, t: &[usize], noise: &Tensor) -> DiffRecResult<Tensor> {
        let schedule = self.require_schedule("q_sample")?;
        if noise.dims() != x_start.dims() {
            return Err(DiffRecError::shape(
                "q_sample noise",
                format!("{:?}", x_start.dims()),
                format!("{:?}", noise.dims()),
            ));
        }
        let device = x_start.device();
        let a = Self::extract_into_tensor(schedule.sqrt_alphas_cumprod(), t, device)?;
        let b = Self::extract_into_tensor(schedule.sqrt_one_minus_alphas_cumprod(), t, device)?;
        let signal = x_start.broadcast_mul(&a).op("q_sample signal")?;
        let noise = noise.broadcast_mul(&b).op("q_sample noise")?;
        signal.add(&noise).op("q_sample")
    }

    pub fn q_posterior_mean_variance(
        &self,
        x_start: &Tensor,
        x_t: &Tensor,
        t: &[usize],
    ) -> DiffRecResult<Posterior> {
        let schedule = self.require_schedule("posterior")?;
        let device = x_t.device();
        let coef1 = Self::extract_into_tensor(schedule.posterior_mean_coef1(), t, device)?;
        let coef2 = Self::extract_into_tensor(schedule.posterior_mean_coef2(), t, device)?;
        let mean = x_start
            .broadcast_mul(&coef1)
            .and_then(|a| a.add(&x_t.broadcast_mul(&coef2)?))
            .op("posterior mean")?;
        let variance = Self::extract_into_tensor(schedule.posterior_variance(), t, device)?;
        let log_variance_clipped =
            Self::extract_into_tensor(schedule.posterior_log_variance_clipped(), t, device)?;
        Ok(Posterior {
            mean,
            variance,
            log_variance_clipped,
        })
    }

    /// `x0 = sqrt(1/ᾱ_t)·x_t − sqrt(1/ᾱ_t − 1)·eps`.
    pub fn predict_xstart_from_eps(&self, x_t: &Tensor, t: &[usize], eps: &Tensor) -> DiffRecResult<Tensor> {
        let schedule = self.require_schedule("predict_xstart_from_eps")?;
        let device = x_t.device();
        let recip = Self::extract_into_tensor(schedule.sqrt_recip_alphas_cumprod(), t, device)?;
        let recipm1 = Self::extract_into_tensor(schedule.sqrt_recipm1_alphas_cumprod(), t, device)?;
        x_t.broadcast_mul(&recip)
            .and_then(|a| a.sub(&eps.broadcast_mul(&recipm1)?))
            .op("predict xstart from eps")
    }

    /// Posterior mean and clipped log variance of the model's reverse step.
    pub fn p_mean_variance<M: Denoiser + ?Sized>(
        &self,
        denoiser: &M,
        x: &Tensor,
        condition: &ConditionBatch,
        t: &[usize],
    ) -> DiffRecResult<Posterior> {
        let output = denoiser.predict(x, condition, t)?;
        let pred_xstart = match self.mean_type {
            MeanType::StartX => output,
            MeanType::Epsilon => self.predict_xstart_from_eps(x, t, &output)?,
        };
        self.q_posterior_mean_variance(&pred_xstart, x, t)
    }

    fn check_inputs<M: Denoiser + ?Sized>(
        &self,
        denoiser: &M,
        x: &Tensor,
        condition: &ConditionBatch,
    ) -> DiffRecResult<usize> {
        if denoiser.prediction() != self.mean_type {
            return Err(DiffRecError::Configuration(format!(
                "denoiser predicts {} but diffusion expects {}",
                denoiser.prediction(),
                self.mean_type
            )));
        }
        let (batch, width) = x.dims2().op("diffusion input")?;
        if width != denoiser.latent_dim() {
            return Err(DiffRecError::shape("diffusion latent", denoiser.latent_dim(), width));
        }
        if condition.len() != batch {
            return Err(DiffRecError::shape("diffusion condition batch", batch, condition.len()));
        }
        Ok(batch)
    }

    /// Reverse diffusion from `x_start` over `sampling_steps` steps.
    ///
    /// With `k = sampling_steps < T` the input is first corrupted to step
    /// `k - 1` and the chain visits the contiguous steps `k - 1, ..., 0`, not a
    /// strided subset of `0..T`. With `k == T` the input is taken as the
    /// noisiest state, and `k == 0` returns it unchanged. Posterior noise is
    /// added only when `sampling_noise` is set and never at step 0.
    ///
    /// # Errors
    ///
    /// - [`DiffRecError::Configuration`] when `sampling_steps > T` or the
    ///   denoiser's prediction type differs from this process.
    /// - [`DiffRecError::Shape`] when latent width or condition batch disagree.
    #[allow(clippy::too_many_arguments)]
    pub fn p_sample<M: Denoiser + ?Sized>(
        &self,
        denoiser: &M,
        x_start: &Tensor,
        condition: &ConditionBatch,
        sampling_steps: usize,
        sampling_noise: bool,
        rng: &mut dyn RngCore,
    ) -> DiffRecResult<Tensor> {
        let batch = self.check_inputs(denoiser, x_start, condition)?;
        if sampling_steps > self.steps {
            return Err(DiffRecError::Configuration(format!(
                "Too much steps in inference: {} sampling steps > {} diffusion steps",
                sampling_steps, self.steps
            )));
        }

        if self.schedule.is_none() {
            let mut x_t = x_start.clone();
            for i in (0..sampling_steps).rev() {
                x_t = denoiser.predict(&x_t, condition, &vec![i; batch])?;
            }
            return Ok(x_t);
        }

        let mut x_t = if sampling_steps == 0 {
            return Ok(x_start.clone());
        } else if sampling_steps == self.steps {
            x_start.clone()
        } else {
            let noise = normal_like(x_start, rng)?;
            self.q_sample(x_start, &vec![sampling_steps - 1; batch], &noise)?
        };

        for i in (0..sampling_steps).rev() {
            let t = vec![i; batch];
            let out = self.p_mean_variance(denoiser, &x_t, condition, &t)?;
            x_t = if sampling_noise && i != 0 {
                let noise = normal_like(&x_t, rng)?;
                let std = out
                    .log_variance_clipped
                    .affine(0.5, 0.0)
                    .and_then(|h| h.exp())
                    .op("posterior std")?;
                noise
                    .broadcast_mul(&std)
                    .and_then(|n| out.mean.add(&n))
                    .op("perturb posterior mean")?
            } else {
                out.mean
            };
            trace!(step = i, batch, "Reverse diffusion step");
        }
        Ok(x_t)
    }

    /// Draw training timesteps and their scaled sampling probabilities.
    ///
    /// Importance sampling from the loss history kicks in once every step
    /// holds [`HISTORY_NUM_PER_TERM`] entries; until then sampling is uniform
    /// with `pt = 1`.
    pub fn sample_timesteps(
        &self,
        batch: usize,
        importance: bool,
        rng: &mut dyn RngCore,
    ) -> DiffRecResult<(Vec<usize>, Vec<f64>)> {
        let history_full = self.lt_count.iter().all(|&c| c == HISTORY_NUM_PER_TERM);
        if !importance || !history_full {
            let t = (0..batch).map(|_| rng.gen_range(0..self.steps)).collect();
            return Ok((t, vec![1.0; batch]));
        }

        let lt_sqrt: Vec<f64> = self
            .lt_history
            .iter()
            .map(|h| (h.iter().map(|v| v * v).sum::<f64>() / HISTORY_NUM_PER_TERM as f64).sqrt())
            .collect();
        let total: f64 = lt_sqrt.iter().sum();
        let n = self.steps as f64;
        let pt_all: Vec<f64> = lt_sqrt
            .iter()
            .map(|l| {
                let p = if total > 0.0 { l / total } else { 1.0 / n };
                p * (1.0 - UNIFORM_PROB) + UNIFORM_PROB / n
            })
            .collect();

        let dist = WeightedIndex::new(&pt_all).map_err(|e| {
            DiffRecError::DataIntegrity(format!("invalid timestep distribution: {}", e))
        })?;
        let t: Vec<usize> = (0..batch).map(|_| dist.sample(&mut *rng)).collect();
        let pt = t.iter().map(|&s| pt_all[s] * n).collect();
        Ok((t, pt))
    }

    fn record_loss(&mut self, t: usize, loss: f64) {
        let count = self.lt_count[t];
        if count == HISTORY_NUM_PER_TERM {
            self.lt_history[t].rotate_left(1);
            self.lt_history[t][HISTORY_NUM_PER_TERM - 1] = loss;
        } else {
            self.lt_history[t][count] = loss;
            self.lt_count[t] += 1;
        }
    }

    /// Loss values remembered for timestep `t`, oldest first.
    pub fn loss_history(&self, t: usize) -> &[f64] {
        &self.lt_history[t][..self.lt_count[t]]
    }

    /// Single-batch diffusion loss with importance-sampled timesteps.
    ///
    /// Updates the per-timestep loss history with the weighted loss; the
    /// returned loss is additionally divided by `pt`.
    pub fn training_losses<M: Denoiser + ?Sized>(
        &mut self,
        denoiser: &M,
        x_start: &Tensor,
        condition: &ConditionBatch,
        reweight: bool,
        rng: &mut dyn RngCore,
    ) -> DiffRecResult<TrainingLoss> {
        let batch = self.check_inputs(denoiser, x_start, condition)?;
        if reweight && self.schedule.is_none() {
            return Err(DiffRecError::Configuration(
                "loss reweighting needs a non-zero noise scale".into(),
            ));
        }

        let (t, pt) = self.sample_timesteps(batch, true, rng)?;
        let noise = normal_like(x_start, rng)?;
        let x_t = match self.schedule {
            Some(_) => self.q_sample(x_start, &t, &noise)?,
            None => x_start.clone(),
        };

        let output = denoiser.predict_train(&x_t, condition, &t, rng)?;
        let target = match self.mean_type {
            MeanType::StartX => x_start,
            MeanType::Epsilon => &noise,
        };
        let mse = mean_flat_sq(&target.sub(&output).op("loss residual")?)?;

        let weighted: Vec<f64> = match (reweight, self.schedule.as_ref()) {
            (true, Some(schedule)) => {
                let likelihood = match self.mean_type {
                    MeanType::Epsilon => {
                        let pred_xstart = self.predict_xstart_from_eps(&x_t, &t, &output)?;
                        let half = x_start
                            .sub(&pred_xstart)
                            .and_then(|d| d.affine(std::f64::consts::FRAC_1_SQRT_2, 0.0))
                            .op("likelihood residual")?;
                        Some(mean_flat_sq(&half)?)
                    }
                    MeanType::StartX => None,
                };
                t.iter()
                    .enumerate()
                    .map(|(b, &step)| {
                        if step == 0 {
                            return likelihood.as_ref().map_or(mse[b], |l| l[b]);
                        }
                        let weight = match self.mean_type {
                            MeanType::StartX => schedule.snr(step - 1) - schedule.snr(step),
                            MeanType::Epsilon => {
                                let prev = 1.0 - schedule.alphas_cumprod_prev()[step];
                                (1.0 - schedule.alphas_cumprod()[step])
                                    / (prev * prev * (1.0 - schedule.betas()[step]))
                            }
                        };
                        weight * mse[b]
                    })
                    .collect()
            }
            _ => mse.clone(),
        };

        for (&step, &loss) in t.iter().zip(&weighted) {
            self.record_loss(step, loss);
        }

        let scaled: Vec<f32> = weighted
            .iter()
            .zip(&pt)
            .map(|(l, p)| (l / p) as f32)
            .collect();
        let loss = Tensor::from_vec(scaled, batch, x_start.device()).op("training loss")?;
        debug!(batch, reweight, "Computed diffusion training loss");
        Ok(TrainingLoss { loss, timesteps: t, pt })
    }
}

/// Per-row mean of squares, as host values.
fn mean_flat_sq(x: &Tensor) -> DiffRecResult<Vec<f64>> {
    let values = x
        .sqr()
        .and_then(|s| s.mean(D::Minus1))
        .and_then(|m| m.to_vec1::<f32>())
        .op("mean flat")?;
    Ok(values.into_iter().map(f64::from).collect())
}
