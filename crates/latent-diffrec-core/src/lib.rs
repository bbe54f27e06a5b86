//! Latent conditional diffusion for collaborative-filtering recommendation.
//!
//! A user's sparse interaction vector is compressed by a categorical
//! [`AutoEncoder`](autoencoder::AutoEncoder) into a dense latent, pushed through
//! a reverse diffusion chain driven by a [`ConditionalDenoiser`](denoiser::ConditionalDenoiser)
//! that sees a (possibly masked) user attribute, and decoded back into item
//! scores that the [`InferencePipeline`](pipeline::InferencePipeline) ranks.
//!
//! # Module map
//!
//! - [`schedule`]: noise schedule families and the derived diffusion tables
//! - [`category`]: item-to-category bijection and k-means category assignment
//! - [`autoencoder`]: per-category variational encoder/decoder heads
//! - [`denoiser`]: timestep and class conditioned MLP denoiser
//! - [`diffusion`]: forward corruption, reverse sampling, training loss
//! - [`pipeline`]: encode, sample, decode, mask and rank
//! - [`data`]: interaction matrices, attribute labels, batch loader
//! - [`artifact`]: checkpoint naming and safetensors bundles
//! - [`config`]: layered configuration and dataset presets
//!
//! All randomness flows through explicitly passed PRNG handles; two runs
//! with the same seed, inputs and weights produce identical rankings.

pub mod artifact;
pub mod autoencoder;
pub mod category;
pub mod config;
pub mod data;
pub mod denoiser;
pub mod diffusion;
pub mod error;
pub mod layers;
pub mod noise;
pub mod pipeline;
pub mod schedule;
pub mod weights;

pub use artifact::{ArtifactName, ModelBundle};
pub use autoencoder::{AutoEncoder, EncodeOutput};
pub use category::CategoryMap;
pub use crate::config::DiffRecConfig;
pub use data::{ConditionField, DataLoader, InteractionMatrix, LabelEncoder};
pub use denoiser::{ConditionBatch, ConditionalDenoiser, Denoiser, DenoiserSpec};
pub use diffusion::{GaussianDiffusion, MeanType, TrainingLoss};
pub use error::{DiffRecError, DiffRecResult};
pub use pipeline::{InferencePipeline, RankedPredictions};
pub use schedule::{NoiseBounds, NoiseSchedule, ScheduleKind};
pub use weights::ParameterStore;
