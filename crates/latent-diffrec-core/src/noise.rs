//! Seeded Gaussian noise.
//!
//! Noise is sampled on the host from an explicit [`RngCore`] and uploaded, so
//! one seed governs every draw regardless of the tensor backend.

use candle_core::{Device, Shape, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use rand_distr::StandardNormal;

use crate::error::{DiffRecResult, TensorContext};

/// Draw a standard normal tensor of the given shape.
pub fn standard_normal<S: Into<Shape>>(
    shape: S,
    device: &Device,
    rng: &mut dyn RngCore,
) -> DiffRecResult<Tensor> {
    let shape = shape.into();
    let values: Vec<f32> = (0..shape.elem_count())
        .map(|_| rng.sample::<f32, _>(StandardNormal))
        .collect();
    Tensor::from_vec(values, shape, device).op("standard_normal")
}

/// Standard normal noise with the shape and device of `like`.
pub fn normal_like(like: &Tensor, rng: &mut dyn RngCore) -> DiffRecResult<Tensor> {
    standard_normal(like.shape().clone(), like.device(), rng)
}

/// Seed used for the `batch_idx`-th batch of a run seeded with `base`.
pub fn batch_seed(base: u64, batch_idx: usize) -> u64 {
    base.wrapping_add(batch_idx as u64)
}

pub fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_seed_same_noise() {
        let a = standard_normal((2, 3), &Device::Cpu, &mut seeded_rng(7)).unwrap();
        let b = standard_normal((2, 3), &Device::Cpu, &mut seeded_rng(7)).unwrap();
        assert_eq!(
            a.to_vec2::<f32>().unwrap(),
            b.to_vec2::<f32>().unwrap()
        );
    }

    #[test]
    fn test_normal_like_shape() {
        let base = Tensor::zeros((4, 5), candle_core::DType::F32, &Device::Cpu).unwrap();
        let n = normal_like(&base, &mut seeded_rng(1)).unwrap();
        assert_eq!(n.dims(), &[4, 5]);
    }

    #[test]
    fn test_batch_seed_offsets() {
        assert_eq!(batch_seed(1, 0), 1);
        assert_eq!(batch_seed(1, 3), 4);
        assert_eq!(batch_seed(u64::MAX, 1), 0);
    }
}
