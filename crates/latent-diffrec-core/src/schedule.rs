//! Noise schedules and the tables derived from them.
//!
//! A [`NoiseSchedule`] is built once from a schedule family, a step count and
//! noise bounds, and is read-only afterwards. Everything is computed in `f64`
//! on the host; the diffusion process extracts per-timestep coefficients and
//! broadcasts them over latent batches.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{DiffRecError, DiffRecResult};

/// Upper clip applied to betas derived from an alpha-bar curve.
pub const MAX_BETA: f64 = 0.999;

/// Value written to `betas[0]` when the first beta is fixed.
pub const FIXED_FIRST_BETA: f64 = 1e-5;

/// Schedule family used to derive per-step betas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleKind {
    /// Betas evenly spaced between `scale·min` and `scale·max`.
    #[serde(rename = "linear")]
    Linear,
    /// The evenly spaced values are the variance `1 - alpha_bar`.
    #[serde(rename = "linear-var")]
    LinearVar,
    /// Squared-cosine alpha-bar curve.
    #[serde(rename = "cosine")]
    Cosine,
    /// `beta_t = 1 / (T - t + 1)`.
    #[serde(rename = "binomial")]
    Binomial,
}

impl ScheduleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Linear => "linear",
            Self::LinearVar => "linear-var",
            Self::Cosine => "cosine",
            Self::Binomial => "binomial",
        }
    }
}

impl fmt::Display for ScheduleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScheduleKind {
    type Err = DiffRecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linear" => Ok(Self::Linear),
            "linear-var" => Ok(Self::LinearVar),
            "cosine" => Ok(Self::Cosine),
            "binomial" => Ok(Self::Binomial),
            other => Err(DiffRecError::Configuration(format!(
                "unknown noise schedule '{}' (expected linear, linear-var, cosine or binomial)",
                other
            ))),
        }
    }
}

/// Noise magnitude bounds: betas span `[scale·min, scale·max]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NoiseBounds {
    pub scale: f64,
    pub min: f64,
    pub max: f64,
}

impl NoiseBounds {
    pub fn new(scale: f64, min: f64, max: f64) -> Self {
        Self { scale, min, max }
    }

    /// A zero scale disables the forward process entirely.
    pub fn is_zero(&self) -> bool {
        self.scale == 0.0
    }

    pub fn validate(&self) -> DiffRecResult<()> {
        if !(self.scale.is_finite() && self.min.is_finite() && self.max.is_finite()) {
            return Err(DiffRecError::Configuration(format!(
                "noise bounds must be finite, got {:?}",
                self
            )));
        }
        if self.scale < 0.0 || self.min < 0.0 {
            return Err(DiffRecError::Configuration(format!(
                "noise scale and noise min must be non-negative, got scale={} min={}",
                self.scale, self.min
            )));
        }
        if self.min > self.max {
            return Err(DiffRecError::Configuration(format!(
                "noise min {} exceeds noise max {}",
                self.min, self.max
            )));
        }
        Ok(())
    }
}

/// Immutable table of betas and every quantity derived from them.
#[derive(Debug, Clone)]
pub struct NoiseSchedule {
    kind: Option<ScheduleKind>,
    betas: Vec<f64>,
    alphas_cumprod: Vec<f64>,
    alphas_cumprod_prev: Vec<f64>,
    alphas_cumprod_next: Vec<f64>,
    sqrt_alphas_cumprod: Vec<f64>,
    sqrt_one_minus_alphas_cumprod: Vec<f64>,
    log_one_minus_alphas_cumprod: Vec<f64>,
    sqrt_recip_alphas_cumprod: Vec<f64>,
    sqrt_recipm1_alphas_cumprod: Vec<f64>,
    posterior_variance: Vec<f64>,
    posterior_log_variance_clipped: Vec<f64>,
    posterior_mean_coef1: Vec<f64>,
    posterior_mean_coef2: Vec<f64>,
}

impl NoiseSchedule {
    /// Build a schedule of `steps` betas for the given family.
    ///
    /// With `beta_fixed` the first beta is overwritten with [`FIXED_FIRST_BETA`]
    /// before the derived tables are computed.
    ///
    /// # Errors
    ///
    /// Returns [`DiffRecError::Configuration`] when `steps == 0`, when the
    /// bounds are invalid, or when the family produces a beta outside `(0, 1)`.
    pub fn new(
        kind: ScheduleKind,
        steps: usize,
        bounds: NoiseBounds,
        beta_fixed: bool,
    ) -> DiffRecResult<Self> {
        if steps == 0 {
            return Err(DiffRecError::Configuration(
                "diffusion steps must be greater than 0".into(),
            ));
        }
        bounds.validate()?;

        let start = bounds.scale * bounds.min;
        let end = bounds.scale * bounds.max;
        let mut betas = match kind {
            ScheduleKind::Linear => linspace(start, end, steps),
            ScheduleKind::LinearVar => betas_from_linear_variance(&linspace(start, end, steps)),
            ScheduleKind::Cosine => betas_for_alpha_bar(steps, |t| {
                ((t + 0.008) / 1.008 * std::f64::consts::FRAC_PI_2)
                    .cos()
                    .powi(2)
            }),
            ScheduleKind::Binomial => (0..steps)
                .map(|t| 1.0 / (steps - t + 1) as f64)
                .collect(),
        };
        if beta_fixed {
            betas[0] = FIXED_FIRST_BETA;
        }

        let mut schedule = Self::from_betas(betas)?;
        schedule.kind = Some(kind);
        info!(
            schedule = %kind,
            steps,
            scale = bounds.scale,
            min = bounds.min,
            max = bounds.max,
            beta_fixed,
            "Built noise schedule"
        );
        Ok(schedule)
    }

    /// Build the derived tables from an explicit beta sequence.
    pub fn from_betas(betas: Vec<f64>) -> DiffRecResult<Self> {
        if betas.is_empty() {
            return Err(DiffRecError::Configuration(
                "noise schedule needs at least one beta".into(),
            ));
        }
        if let Some((t, beta)) = betas
            .iter()
            .enumerate()
            .find(|(_, b)| !(**b > 0.0 && **b < 1.0))
        {
            return Err(DiffRecError::Configuration(format!(
                "beta at step {} is {}, betas must lie in (0, 1)",
                t, beta
            )));
        }

        let steps = betas.len();
        let alphas: Vec<f64> = betas.iter().map(|b| 1.0 - b).collect();

        let mut alphas_cumprod = Vec::with_capacity(steps);
        let mut acc = 1.0;
        for a in &alphas {
            acc *= a;
            alphas_cumprod.push(acc);
        }

        let mut alphas_cumprod_prev = Vec::with_capacity(steps);
        alphas_cumprod_prev.push(1.0);
        alphas_cumprod_prev.extend_from_slice(&alphas_cumprod[..steps - 1]);

        let mut alphas_cumprod_next = alphas_cumprod[1..].to_vec();
        alphas_cumprod_next.push(0.0);

        let sqrt_alphas_cumprod = alphas_cumprod.iter().map(|a| a.sqrt()).collect();
        let sqrt_one_minus_alphas_cumprod =
            alphas_cumprod.iter().map(|a| (1.0 - a).sqrt()).collect();
        let log_one_minus_alphas_cumprod = alphas_cumprod.iter().map(|a| (1.0 - a).ln()).collect();
        let sqrt_recip_alphas_cumprod = alphas_cumprod.iter().map(|a| (1.0 / a).sqrt()).collect();
        let sqrt_recipm1_alphas_cumprod = alphas_cumprod
            .iter()
            .map(|a| (1.0 / a - 1.0).sqrt())
            .collect();

        // 1 - alpha_bar_t >= beta_0 > 0 for every t, so none of these divide by zero.
        let posterior_variance: Vec<f64> = (0..steps)
            .map(|t| betas[t] * (1.0 - alphas_cumprod_prev[t]) / (1.0 - alphas_cumprod[t]))
            .collect();

        // posterior_variance[0] is 0; the clipped log borrows the next entry.
        let first = if steps > 1 {
            posterior_variance[1]
        } else {
            posterior_variance[0]
        };
        let posterior_log_variance_clipped = std::iter::once(first)
            .chain(posterior_variance[1..].iter().copied())
            .map(f64::ln)
            .collect();

        let posterior_mean_coef1 = (0..steps)
            .map(|t| betas[t] * alphas_cumprod_prev[t].sqrt() / (1.0 - alphas_cumprod[t]))
            .collect();
        let posterior_mean_coef2 = (0..steps)
            .map(|t| (1.0 - alphas_cumprod_prev[t]) * alphas[t].sqrt() / (1.0 - alphas_cumprod[t]))
            .collect();

        debug!(
            steps,
            first_beta = betas[0],
            last_beta = betas[steps - 1],
            final_alpha_bar = alphas_cumprod[steps - 1],
            "Derived diffusion tables"
        );

        Ok(Self {
            kind: None,
            betas,
            alphas_cumprod,
            alphas_cumprod_prev,
            alphas_cumprod_next,
            sqrt_alphas_cumprod,
            sqrt_one_minus_alphas_cumprod,
            log_one_minus_alphas_cumprod,
            sqrt_recip_alphas_cumprod,
            sqrt_recipm1_alphas_cumprod,
            posterior_variance,
            posterior_log_variance_clipped,
            posterior_mean_coef1,
            posterior_mean_coef2,
        })
    }

    /// Family this schedule was built from, `None` for explicit betas.
    pub fn kind(&self) -> Option<ScheduleKind> {
        self.kind
    }

    /// Number of diffusion steps `T`.
    pub fn steps(&self) -> usize {
        self.betas.len()
    }

    pub fn betas(&self) -> &[f64] {
        &self.betas
    }

    pub fn alphas_cumprod(&self) -> &[f64] {
        &self.alphas_cumprod
    }

    pub fn alphas_cumprod_prev(&self) -> &[f64] {
        &self.alphas_cumprod_prev
    }

    pub fn alphas_cumprod_next(&self) -> &[f64] {
        &self.alphas_cumprod_next
    }

    pub fn sqrt_alphas_cumprod(&self) -> &[f64] {
        &self.sqrt_alphas_cumprod
    }

    pub fn sqrt_one_minus_alphas_cumprod(&self) -> &[f64] {
        &self.sqrt_one_minus_alphas_cumprod
    }

    pub fn log_one_minus_alphas_cumprod(&self) -> &[f64] {
        &self.log_one_minus_alphas_cumprod
    }

    pub fn sqrt_recip_alphas_cumprod(&self) -> &[f64] {
        &self.sqrt_recip_alphas_cumprod
    }

    pub fn sqrt_recipm1_alphas_cumprod(&self) -> &[f64] {
        &self.sqrt_recipm1_alphas_cumprod
    }

    pub fn posterior_variance(&self) -> &[f64] {
        &self.posterior_variance
    }

    pub fn posterior_log_variance_clipped(&self) -> &[f64] {
        &self.posterior_log_variance_clipped
    }

    pub fn posterior_mean_coef1(&self) -> &[f64] {
        &self.posterior_mean_coef1
    }

    pub fn posterior_mean_coef2(&self) -> &[f64] {
        &self.posterior_mean_coef2
    }

    /// Signal-to-noise ratio `alpha_bar_t / (1 - alpha_bar_t)`.
    pub fn snr(&self, t: usize) -> f64 {
        let a = self.alphas_cumprod[t];
        a / (1.0 - a)
    }
}

/// Evenly spaced values with both endpoints included.
fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    if n == 1 {
        return vec![start];
    }
    let step = (end - start) / (n - 1) as f64;
    let mut out: Vec<f64> = (0..n).map(|i| start + step * i as f64).collect();
    out[n - 1] = end;
    out
}

fn betas_from_linear_variance(variance: &[f64]) -> Vec<f64> {
    let alpha_bar: Vec<f64> = variance.iter().map(|v| 1.0 - v).collect();
    let mut betas = Vec::with_capacity(variance.len());
    betas.push(1.0 - alpha_bar[0]);
    for i in 1..alpha_bar.len() {
        betas.push((1.0 - alpha_bar[i] / alpha_bar[i - 1]).min(MAX_BETA));
    }
    betas
}

fn betas_for_alpha_bar(steps: usize, alpha_bar: impl Fn(f64) -> f64) -> Vec<f64> {
    (0..steps)
        .map(|i| {
            let t1 = i as f64 / steps as f64;
            let t2 = (i + 1) as f64 / steps as f64;
            (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(MAX_BETA)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_KINDS: [ScheduleKind; 4] = [
        ScheduleKind::Linear,
        ScheduleKind::LinearVar,
        ScheduleKind::Cosine,
        ScheduleKind::Binomial,
    ];

    fn bounds() -> NoiseBounds {
        NoiseBounds::new(0.1, 0.0001, 0.02)
    }

    #[test]
    fn test_first_alpha_bar_matches_first_beta() {
        for kind in ALL_KINDS {
            for fixed in [false, true] {
                let s = NoiseSchedule::new(kind, 20, bounds(), fixed).unwrap();
                assert_eq!(s.alphas_cumprod()[0], 1.0 - s.betas()[0], "{kind}");
            }
        }
    }

    #[test]
    fn test_alpha_bar_non_increasing() {
        for kind in ALL_KINDS {
            let s = NoiseSchedule::new(kind, 50, bounds(), true).unwrap();
            for w in s.alphas_cumprod().windows(2) {
                assert!(w[1] <= w[0], "{kind}: {} > {}", w[1], w[0]);
            }
        }
    }

    #[test]
    fn test_linear_endpoints() {
        let s = NoiseSchedule::new(ScheduleKind::Linear, 10, bounds(), false).unwrap();
        assert!((s.betas()[0] - 0.1 * 0.0001).abs() < 1e-15);
        assert!((s.betas()[9] - 0.1 * 0.02).abs() < 1e-15);
    }

    #[test]
    fn test_linear_var_matches_variance() {
        let s = NoiseSchedule::new(ScheduleKind::LinearVar, 10, bounds(), false).unwrap();
        let variance = linspace(0.1 * 0.0001, 0.1 * 0.02, 10);
        for (t, v) in variance.iter().enumerate() {
            assert!((1.0 - s.alphas_cumprod()[t] - v).abs() < 1e-12);
        }
    }

    #[test]
    fn test_binomial_values() {
        let s = NoiseSchedule::new(ScheduleKind::Binomial, 4, bounds(), false).unwrap();
        assert_eq!(s.betas(), &[1.0 / 5.0, 1.0 / 4.0, 1.0 / 3.0, 1.0 / 2.0]);
    }

    #[test]
    fn test_cosine_clipped() {
        let s = NoiseSchedule::new(ScheduleKind::Cosine, 10, bounds(), false).unwrap();
        assert!((s.betas()[9] - MAX_BETA).abs() < 1e-12);
        assert!(s.betas().iter().all(|b| *b <= MAX_BETA));
    }

    #[test]
    fn test_beta_fixed() {
        let s = NoiseSchedule::new(ScheduleKind::Linear, 5, bounds(), true).unwrap();
        assert_eq!(s.betas()[0], FIXED_FIRST_BETA);
    }

    #[test]
    fn test_posterior_tables_finite() {
        for kind in ALL_KINDS {
            let s = NoiseSchedule::new(kind, 8, bounds(), true).unwrap();
            assert_eq!(s.posterior_variance()[0], 0.0);
            for t in 0..s.steps() {
                assert!(s.posterior_log_variance_clipped()[t].is_finite());
                assert!(s.posterior_mean_coef1()[t].is_finite());
                assert!(s.posterior_mean_coef2()[t].is_finite());
                assert!(s.snr(t) > 0.0);
            }
            assert_eq!(
                s.posterior_log_variance_clipped()[0],
                s.posterior_log_variance_clipped()[1]
            );
            assert_eq!(s.alphas_cumprod_next()[s.steps() - 1], 0.0);
            assert_eq!(s.alphas_cumprod_prev()[0], 1.0);
        }
    }

    #[test]
    fn test_unknown_schedule_name() {
        let err = "quadratic".parse::<ScheduleKind>().unwrap_err();
        assert!(matches!(err, DiffRecError::Configuration(_)));
        assert_eq!("linear-var".parse::<ScheduleKind>().unwrap(), ScheduleKind::LinearVar);
    }

    #[test]
    fn test_zero_steps_rejected() {
        let err = NoiseSchedule::new(ScheduleKind::Linear, 0, bounds(), true).unwrap_err();
        assert!(matches!(err, DiffRecError::Configuration(_)));
    }

    #[test]
    fn test_zero_scale_rejected_for_linear() {
        let zero = NoiseBounds::new(0.0, 0.0001, 0.02);
        assert!(zero.is_zero());
        assert!(NoiseSchedule::new(ScheduleKind::Linear, 5, zero, false).is_err());
    }

    #[test]
    fn test_single_step_schedule() {
        let s = NoiseSchedule::new(ScheduleKind::Linear, 1, bounds(), false).unwrap();
        assert_eq!(s.steps(), 1);
        assert_eq!(s.alphas_cumprod_next(), &[0.0]);
    }
}
