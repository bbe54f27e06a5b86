//! Per-dataset diffusion presets.

use serde::{Deserialize, Serialize};

use crate::error::{DiffRecError, DiffRecResult};

/// Diffusion settings tuned for one dataset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DatasetPreset {
    pub steps: usize,
    pub noise_scale: f64,
    pub noise_min: f64,
    pub noise_max: f64,
}

const PRESETS: &[(&str, DatasetPreset)] = &[
    ("amazon-book_clean", preset(5, 0.5, 0.001, 0.005)),
    ("yelp_clean", preset(5, 0.01, 0.005, 0.01)),
    ("ml-1m_clean", preset(40, 0.005, 0.005, 0.02)),
    ("amazon-book_noisy", preset(10, 0.5, 0.001, 0.005)),
    ("yelp_noisy", preset(5, 0.01, 0.005, 0.01)),
    ("ml-1m_noisy", preset(100, 0.005, 0.005, 0.02)),
];

const fn preset(steps: usize, noise_scale: f64, noise_min: f64, noise_max: f64) -> DatasetPreset {
    DatasetPreset {
        steps,
        noise_scale,
        noise_min,
        noise_max,
    }
}

/// Names of every known dataset.
pub fn dataset_names() -> impl Iterator<Item = &'static str> {
    PRESETS.iter().map(|(name, _)| *name)
}

/// Look up the preset for `dataset`.
///
/// # Errors
///
/// [`DiffRecError::Configuration`] for an unknown dataset name.
pub fn dataset_preset(dataset: &str) -> DiffRecResult<DatasetPreset> {
    PRESETS
        .iter()
        .find(|(name, _)| *name == dataset)
        .map(|(_, p)| *p)
        .ok_or_else(|| {
            DiffRecError::Configuration(format!(
                "unknown dataset '{}' (known: {})",
                dataset,
                dataset_names().collect::<Vec<_>>().join(", ")
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ml1m_clean() {
        let p = dataset_preset("ml-1m_clean").unwrap();
        assert_eq!(p.steps, 40);
        assert_eq!(p.noise_scale, 0.005);
        assert_eq!(p.noise_min, 0.005);
        assert_eq!(p.noise_max, 0.02);
    }

    #[test]
    fn test_noisy_variants_differ_in_steps() {
        assert_eq!(dataset_preset("amazon-book_noisy").unwrap().steps, 10);
        assert_eq!(dataset_preset("ml-1m_noisy").unwrap().steps, 100);
        assert_eq!(
            dataset_preset("yelp_noisy").unwrap(),
            dataset_preset("yelp_clean").unwrap()
        );
    }

    #[test]
    fn test_unknown_dataset() {
        assert!(matches!(
            dataset_preset("netflix"),
            Err(DiffRecError::Configuration(_))
        ));
        assert_eq!(dataset_names().count(), 6);
    }
}
