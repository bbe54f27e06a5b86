//! Named parameter sets.
//!
//! A [`ParameterStore`] is the opaque handle the models are built from: a flat
//! map of dotted tensor names to tensors on one device. It can be filled with
//! Xavier-normal initialised linear layers from a seeded PRNG, or loaded from
//! and saved to safetensors files. Models read it through a [`VarBuilder`].

use std::collections::HashMap;
use std::path::Path;

use candle_core::{safetensors, DType, Device, Tensor};
use candle_nn::VarBuilder;
use rand::RngCore;
use rand_distr::{Distribution, Normal};
use tracing::{debug, info};

use crate::error::{DiffRecError, DiffRecResult, TensorContext};

#[derive(Debug, Clone)]
pub struct ParameterStore {
    tensors: HashMap<String, Tensor>,
    device: Device,
}

impl ParameterStore {
    pub fn new(device: Device) -> Self {
        Self {
            tensors: HashMap::new(),
            device,
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    /// Sorted tensor names.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tensors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.tensors.insert(name.into(), tensor);
    }

    /// Fetch a tensor by name.
    ///
    /// # Errors
    ///
    /// [`DiffRecError::DataIntegrity`] if the name is missing.
    pub fn get(&self, name: &str) -> DiffRecResult<&Tensor> {
        self.tensors.get(name).ok_or_else(|| {
            DiffRecError::DataIntegrity(format!("parameter '{}' missing from parameter set", name))
        })
    }

    /// Add a linear layer `{prefix}.weight` (out, in) and `{prefix}.bias` (out).
    ///
    /// Weights are Xavier-normal with `std = sqrt(2 / (fan_in + fan_out))`,
    /// biases are zero.
    pub fn xavier_linear(
        &mut self,
        prefix: &str,
        in_dim: usize,
        out_dim: usize,
        rng: &mut dyn RngCore,
    ) -> DiffRecResult<()> {
        if in_dim == 0 || out_dim == 0 {
            return Err(DiffRecError::Configuration(format!(
                "linear layer '{}' has a zero dimension ({} -> {})",
                prefix, in_dim, out_dim
            )));
        }
        let std = (2.0 / (in_dim + out_dim) as f64).sqrt();
        let normal = Normal::new(0.0f64, std)
            .map_err(|e| DiffRecError::Configuration(format!("xavier init for '{}': {}", prefix, e)))?;
        let values: Vec<f32> = (0..in_dim * out_dim)
            .map(|_| normal.sample(&mut *rng) as f32)
            .collect();

        let weight = Tensor::from_vec(values, (out_dim, in_dim), &self.device).op("xavier weight")?;
        let bias = Tensor::zeros(out_dim, DType::F32, &self.device).op("zero bias")?;
        self.insert(format!("{}.weight", prefix), weight);
        self.insert(format!("{}.bias", prefix), bias);
        Ok(())
    }

    /// A builder over the floating point parameters.
    pub fn var_builder(&self) -> VarBuilder<'static> {
        VarBuilder::from_tensors(self.tensors.clone(), DType::F32, &self.device)
    }

    pub fn load(path: &Path, device: &Device) -> DiffRecResult<Self> {
        let tensors = safetensors::load(path, device).map_err(|e| {
            DiffRecError::Serialization(format!(
                "failed to load parameters from {}: {}",
                path.display(),
                e
            ))
        })?;
        info!(path = %path.display(), tensors = tensors.len(), "Loaded parameter set");
        Ok(Self {
            tensors,
            device: device.clone(),
        })
    }

    pub fn save(&self, path: &Path) -> DiffRecResult<()> {
        safetensors::save(&self.tensors, path).map_err(|e| {
            DiffRecError::Serialization(format!(
                "failed to save parameters to {}: {}",
                path.display(),
                e
            ))
        })?;
        debug!(path = %path.display(), tensors = self.tensors.len(), "Saved parameter set");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::noise::seeded_rng;

    #[test]
    fn test_xavier_linear_shapes() {
        let mut store = ParameterStore::new(Device::Cpu);
        store.xavier_linear("emb_layer", 10, 4, &mut seeded_rng(3)).unwrap();
        assert_eq!(store.get("emb_layer.weight").unwrap().dims(), &[4, 10]);
        let bias = store.get("emb_layer.bias").unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(bias, vec![0.0; 4]);
    }

    #[test]
    fn test_xavier_is_seeded() {
        let mut a = ParameterStore::new(Device::Cpu);
        let mut b = ParameterStore::new(Device::Cpu);
        a.xavier_linear("l", 3, 3, &mut seeded_rng(9)).unwrap();
        b.xavier_linear("l", 3, 3, &mut seeded_rng(9)).unwrap();
        assert_eq!(
            a.get("l.weight").unwrap().to_vec2::<f32>().unwrap(),
            b.get("l.weight").unwrap().to_vec2::<f32>().unwrap()
        );
    }

    #[test]
    fn test_missing_parameter() {
        let store = ParameterStore::new(Device::Cpu);
        assert!(matches!(
            store.get("nope"),
            Err(DiffRecError::DataIntegrity(_))
        ));
    }

    #[test]
    fn test_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.safetensors");
        let mut store = ParameterStore::new(Device::Cpu);
        store.xavier_linear("layer", 3, 2, &mut seeded_rng(5)).unwrap();
        store.save(&path).unwrap();

        let loaded = ParameterStore::load(&path, &Device::Cpu).unwrap();
        assert_eq!(loaded.names(), store.names());
        assert_eq!(
            loaded.get("layer.weight").unwrap().to_vec2::<f32>().unwrap(),
            store.get("layer.weight").unwrap().to_vec2::<f32>().unwrap()
        );
    }
}
