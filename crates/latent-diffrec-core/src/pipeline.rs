//! Inference pipeline: encode, reverse-diffuse, decode, mask, rank.
//!
//! Ranking happens in category order, the order the decoder emits. Seen
//! items are mapped into that order and excluded before the top-K cut, and the
//! surviving category-order indices are mapped back to original item ids.
//!
//! Batches run in parallel; batch `i` draws all of its noise from a PRNG
//! seeded with `seed + i`, so results do not depend on thread scheduling.

use std::cmp::Ordering;

use candle_core::{Device, Tensor};
use rand::RngCore;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::autoencoder::AutoEncoder;
use crate::data::{DataLoader, InteractionMatrix};
use crate::denoiser::{ConditionBatch, ConditionalDenoiser, Denoiser};
use crate::diffusion::GaussianDiffusion;
use crate::error::{DiffRecError, DiffRecResult, TensorContext};
use crate::noise::{batch_seed, seeded_rng};

/// Run-time knobs of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceSettings {
    pub sampling_steps: usize,
    pub sampling_noise: bool,
    /// Ranked list length per user.
    pub top_k: usize,
    pub batch_size: usize,
    pub seed: u64,
}

/// Ranked item ids per user, best first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankedPredictions {
    pub top_k: usize,
    pub lists: Vec<Vec<usize>>,
}

impl RankedPredictions {
    pub fn len(&self) -> usize {
        self.lists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }

    pub fn for_user(&self, user: usize) -> Option<&[usize]> {
        self.lists.get(user).map(Vec::as_slice)
    }

    /// Every list cut to at most `n` entries.
    pub fn truncated(&self, n: usize) -> Vec<Vec<usize>> {
        self.lists
            .iter()
            .map(|l| l[..l.len().min(n)].to_vec())
            .collect()
    }
}

pub struct InferencePipeline<M: Denoiser = ConditionalDenoiser> {
    autoencoder: AutoEncoder,
    denoiser: M,
    diffusion: GaussianDiffusion,
    settings: InferenceSettings,
}

impl<M: Denoiser> InferencePipeline<M> {
    /// Assemble a pipeline.
    ///
    /// # Errors
    ///
    /// [`DiffRecError::Configuration`] when the components disagree on the
    /// latent width or prediction type, when `top_k` exceeds the item count,
    /// or when more sampling steps than diffusion steps are requested.
    pub fn new(
        autoencoder: AutoEncoder,
        denoiser: M,
        diffusion: GaussianDiffusion,
        settings: InferenceSettings,
    ) -> DiffRecResult<Self> {
        if denoiser.latent_dim() != autoencoder.latent_dim() {
            return Err(DiffRecError::Configuration(format!(
                "denoiser latent width {} differs from autoencoder latent width {}",
                denoiser.latent_dim(),
                autoencoder.latent_dim()
            )));
        }
        if denoiser.prediction() != diffusion.mean_type() {
            return Err(DiffRecError::Configuration(format!(
                "denoiser predicts {} but diffusion expects {}",
                denoiser.prediction(),
                diffusion.mean_type()
            )));
        }
        if settings.top_k == 0 || settings.top_k > autoencoder.n_items() {
            return Err(DiffRecError::Configuration(format!(
                "top_k {} must lie in 1..={}",
                settings.top_k,
                autoencoder.n_items()
            )));
        }
        if settings.sampling_steps > diffusion.steps() {
            return Err(DiffRecError::Configuration(format!(
                "{} sampling steps exceed {} diffusion steps",
                settings.sampling_steps,
                diffusion.steps()
            )));
        }
        if settings.batch_size == 0 {
            return Err(DiffRecError::Configuration("batch size must be greater than 0".into()));
        }
        Ok(Self {
            autoencoder,
            denoiser,
            diffusion,
            settings,
        })
    }

    pub fn autoencoder(&self) -> &AutoEncoder {
        &self.autoencoder
    }

    pub fn denoiser(&self) -> &M {
        &self.denoiser
    }

    pub fn diffusion(&self) -> &GaussianDiffusion {
        &self.diffusion
    }

    pub fn settings(&self) -> &InferenceSettings {
        &self.settings
    }

    /// Category-order scores for one batch of interaction rows.
    pub fn score_batch(
        &self,
        x: &Tensor,
        condition: &ConditionBatch,
        rng: &mut dyn RngCore,
    ) -> DiffRecResult<Tensor> {
        let encoded = self.autoencoder.encode(x)?;
        let latent = self.diffusion.p_sample(
            &self.denoiser,
            &encoded.latent,
            condition,
            self.settings.sampling_steps,
            self.settings.sampling_noise,
            rng,
        )?;
        self.autoencoder.decode_category_order(&latent)
    }

    /// Rank one batch.
    ///
    /// `seen_local[b]` holds the category-order indices already seen by row
    /// `b`; they never appear in the output. Returned ids are original item
    /// indices.
    pub fn rank_batch(
        &self,
        x: &Tensor,
        condition: &ConditionBatch,
        seen_local: &[&[usize]],
        rng: &mut dyn RngCore,
    ) -> DiffRecResult<Vec<Vec<usize>>> {
        let (batch, _) = x.dims2().op("rank input")?;
        if seen_local.len() != batch {
            return Err(DiffRecError::shape("seen-item mask batch", batch, seen_local.len()));
        }
        let scores = self
            .score_batch(x, condition, rng)?
            .to_vec2::<f32>()
            .op("read scores")?;

        let map = self.autoencoder.category_map();
        scores
            .iter()
            .zip(seen_local)
            .map(|(row, seen)| {
                let local = top_k_unseen(row, seen, self.settings.top_k);
                if self.autoencoder.spec().n_cate > 1 {
                    map.map_ranked(&local)
                } else {
                    Ok(local)
                }
            })
            .collect()
    }

    /// Rank every user of `inputs`, masking the items in `seen`.
    ///
    /// `seen` is in original item order; `labels[u]` is user `u`'s condition.
    ///
    /// # Errors
    ///
    /// [`DiffRecError::Shape`] when item counts differ from the model, or when
    /// `seen` or `labels` do not cover exactly the users of `inputs`.
    pub fn rank_users(
        &self,
        inputs: &InteractionMatrix,
        seen: &InteractionMatrix,
        labels: &[u32],
    ) -> DiffRecResult<RankedPredictions> {
        let n_items = self.autoencoder.n_items();
        if inputs.n_items() != n_items || seen.n_items() != n_items {
            return Err(DiffRecError::shape(
                "ranking item count",
                n_items,
                format!("inputs {} / seen {}", inputs.n_items(), seen.n_items()),
            ));
        }
        if seen.n_users() != inputs.n_users() || labels.len() != inputs.n_users() {
            return Err(DiffRecError::shape(
                "ranking user count",
                inputs.n_users(),
                format!("seen {} / labels {}", seen.n_users(), labels.len()),
            ));
        }

        let seen_local = if self.autoencoder.spec().n_cate > 1 {
            seen.to_category_order(self.autoencoder.category_map())?
        } else {
            seen.clone()
        };

        let batches = DataLoader::sequential(inputs.n_users(), self.settings.batch_size)?.batches();
        info!(
            users = inputs.n_users(),
            batches = batches.len(),
            top_k = self.settings.top_k,
            sampling_steps = self.settings.sampling_steps,
            "Ranking users"
        );

        let ranked: Vec<Vec<Vec<usize>>> = batches
            .par_iter()
            .map(|batch| {
                let x = inputs.dense_rows(&batch.users, &Device::Cpu)?;
                let condition =
                    ConditionBatch::conditional(batch.users.iter().map(|&u| labels[u]).collect());
                let seen: Vec<&[usize]> = batch.users.iter().map(|&u| seen_local.row(u)).collect();
                let mut rng = seeded_rng(batch_seed(self.settings.seed, batch.batch_idx));
                let lists = self.rank_batch(&x, &condition, &seen, &mut rng)?;
                debug!(batch = batch.batch_idx, users = batch.len(), "Ranked batch");
                Ok(lists)
            })
            .collect::<DiffRecResult<Vec<_>>>()?;

        Ok(RankedPredictions {
            top_k: self.settings.top_k,
            lists: ranked.into_iter().flatten().collect(),
        })
    }
}

/// Indices of the `k` highest scores outside `seen`, best first.
///
/// Ties go to the lower index; NaN scores rank last.
pub fn top_k_unseen(scores: &[f32], seen: &[usize], k: usize) -> Vec<usize> {
    let mut masked = vec![false; scores.len()];
    for &i in seen {
        if let Some(m) = masked.get_mut(i) {
            *m = true;
        }
    }
    let mut candidates: Vec<(usize, f32)> = scores
        .iter()
        .enumerate()
        .filter(|(i, _)| !masked[*i])
        .map(|(i, &s)| (i, s))
        .collect();

    let order = |a: &(usize, f32), b: &(usize, f32)| -> Ordering {
        match (a.1.is_nan(), b.1.is_nan()) {
            (false, true) => Ordering::Less,
            (true, false) => Ordering::Greater,
            _ => b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)),
        }
    };
    if candidates.len() > k {
        candidates.select_nth_unstable_by(k, order);
        candidates.truncate(k);
    }
    candidates.sort_unstable_by(order);
    candidates.into_iter().map(|(i, _)| i).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_top_k_orders_and_masks() {
        let scores = [0.1, 0.9, 0.5, 0.9, -1.0];
        assert_eq!(top_k_unseen(&scores, &[], 3), vec![1, 3, 2]);
        assert_eq!(top_k_unseen(&scores, &[1], 3), vec![3, 2, 0]);
    }

    #[test]
    fn test_top_k_short_when_most_items_seen() {
        let scores = [0.3, 0.2, 0.1];
        assert_eq!(top_k_unseen(&scores, &[0, 2], 3), vec![1]);
    }

    #[test]
    fn test_top_k_nan_last() {
        let scores = [f32::NAN, 0.0, 1.0];
        assert_eq!(top_k_unseen(&scores, &[], 3), vec![2, 1, 0]);
    }

    #[test]
    fn test_truncated() {
        let ranked = RankedPredictions {
            top_k: 3,
            lists: vec![vec![4, 2, 1], vec![0]],
        };
        assert_eq!(ranked.truncated(2), vec![vec![4, 2], vec![0]]);
        assert_eq!(ranked.for_user(1), Some(&[0usize][..]));
    }
}
