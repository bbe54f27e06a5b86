//! Shared fixtures: a six-item, three-category model over five users.

#![allow(dead_code)]

use latent_diffrec_core::category::CategoryMap;
use latent_diffrec_core::noise::seeded_rng;
use latent_diffrec_core::schedule::ScheduleKind;
use latent_diffrec_core::{AutoEncoder, ConditionalDenoiser, DiffRecConfig, InteractionMatrix, ModelBundle};

pub const N_USERS: usize = 5;
pub const N_ITEMS: usize = 6;

/// Item `i` belongs to category `ASSIGNMENTS[i]`.
pub const ASSIGNMENTS: [usize; N_ITEMS] = [2, 0, 1, 0, 2, 1];

pub fn toy_config() -> DiffRecConfig {
    let mut config = DiffRecConfig::default_config();
    config.dataset = "toy".into();
    config.seed = 7;
    config.diffusion.noise_schedule = ScheduleKind::Linear;
    config.diffusion.steps = 10;
    config.diffusion.sampling_steps = 5;
    config.autoencoder.n_cate = 3;
    config.autoencoder.in_dims = vec![6];
    config.denoiser.dims = vec![6];
    config.denoiser.emb_size = 4;
    config.denoiser.n_classes = 3;
    config.inference.batch_size = 2;
    config.inference.top_n = vec![2, 4];
    config.checkpoint.stem = Some("toy".into());
    config
}

pub fn toy_bundle(config: DiffRecConfig) -> ModelBundle {
    let mut rng = seeded_rng(11);
    let map = CategoryMap::from_assignments(&ASSIGNMENTS, 3).unwrap();
    let (_, autoencoder) =
        AutoEncoder::init(config.autoencoder_spec(N_ITEMS), map, &mut rng).unwrap();
    let (_, denoiser) = ConditionalDenoiser::init(config.denoiser_spec(), &mut rng).unwrap();
    ModelBundle {
        config,
        autoencoder,
        denoiser,
    }
}

pub fn toy_train() -> InteractionMatrix {
    InteractionMatrix::from_pairs(
        &[(0, 0), (0, 1), (1, 2), (2, 3), (2, 4), (3, 5), (4, 0), (4, 2)],
        N_USERS,
        N_ITEMS,
    )
    .unwrap()
}

pub fn toy_labels() -> Vec<u32> {
    vec![0, 1, 2, 1, 0]
}
