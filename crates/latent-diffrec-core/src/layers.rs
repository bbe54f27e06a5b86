//! Shared building blocks: activations, stacked linear layers, dropout.

use std::fmt;
use std::str::FromStr;

use candle_core::{Module, Tensor, D};
use candle_nn::{Linear, VarBuilder};
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};

use crate::error::{DiffRecError, DiffRecResult, TensorContext};
use crate::weights::ParameterStore;

/// Negative slope of the leaky ReLU.
pub const LEAKY_RELU_SLOPE: f64 = 0.01;

/// Smallest norm used when L2 normalising a row.
pub const NORM_EPS: f64 = 1e-12;

/// Elementwise nonlinearity between linear layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Activation {
    #[default]
    #[serde(rename = "tanh")]
    Tanh,
    #[serde(rename = "relu")]
    Relu,
    #[serde(rename = "sigmoid")]
    Sigmoid,
    #[serde(rename = "leaky_relu", alias = "leaky-relu")]
    LeakyRelu,
}

impl Activation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tanh => "tanh",
            Self::Relu => "relu",
            Self::Sigmoid => "sigmoid",
            Self::LeakyRelu => "leaky_relu",
        }
    }

    pub fn apply(&self, x: &Tensor) -> DiffRecResult<Tensor> {
        match self {
            Self::Tanh => x.tanh().op("tanh"),
            Self::Relu => x.relu().op("relu"),
            Self::Sigmoid => candle_nn::ops::sigmoid(x).op("sigmoid"),
            Self::LeakyRelu => candle_nn::ops::leaky_relu(x, LEAKY_RELU_SLOPE).op("leaky_relu"),
        }
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Activation {
    type Err = DiffRecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tanh" => Ok(Self::Tanh),
            "relu" => Ok(Self::Relu),
            "sigmoid" => Ok(Self::Sigmoid),
            "leaky_relu" | "leaky-relu" => Ok(Self::LeakyRelu),
            other => Err(DiffRecError::Configuration(format!(
                "unknown activation '{}' (expected tanh, relu, sigmoid or leaky_relu)",
                other
            ))),
        }
    }
}

/// Stack of linear layers with an activation between them.
///
/// Layer `i` lives under parameter name `{2i}`, matching a sequential
/// container that interleaves linear and activation modules.
#[derive(Debug, Clone)]
pub struct Mlp {
    layers: Vec<Linear>,
    activation: Activation,
    trailing_activation: bool,
}

impl Mlp {
    /// Parameter name of the `index`-th linear layer.
    pub fn layer_name(index: usize) -> String {
        (2 * index).to_string()
    }

    /// Write Xavier-initialised layers for `dims` under `prefix`.
    pub fn init_parameters(
        store: &mut ParameterStore,
        prefix: &str,
        dims: &[usize],
        rng: &mut dyn RngCore,
    ) -> DiffRecResult<()> {
        for (i, pair) in dims.windows(2).enumerate() {
            store.xavier_linear(&format!("{}.{}", prefix, Self::layer_name(i)), pair[0], pair[1], rng)?;
        }
        Ok(())
    }

    /// Build the stack from a var builder already scoped to the stack prefix.
    ///
    /// With `trailing_activation` the activation also follows the last layer.
    pub fn load(
        dims: &[usize],
        activation: Activation,
        trailing_activation: bool,
        vb: VarBuilder,
    ) -> DiffRecResult<Self> {
        let layers = dims
            .windows(2)
            .enumerate()
            .map(|(i, pair)| candle_nn::linear(pair[0], pair[1], vb.pp(Self::layer_name(i))))
            .collect::<candle_core::Result<Vec<_>>>()
            .op("load linear stack")?;
        Ok(Self {
            layers,
            activation,
            trailing_activation,
        })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn forward(&self, x: &Tensor) -> DiffRecResult<Tensor> {
        let last = self.layers.len().saturating_sub(1);
        let mut h = x.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            h = layer.forward(&h).op("linear forward")?;
            if i != last || self.trailing_activation {
                h = self.activation.apply(&h)?;
            }
        }
        Ok(h)
    }
}

/// Inverted dropout: zero each entry with probability `p`, scale the rest.
pub fn dropout(x: &Tensor, p: f64, rng: &mut dyn RngCore) -> DiffRecResult<Tensor> {
    if !(0.0..1.0).contains(&p) {
        return Err(DiffRecError::Configuration(format!(
            "dropout probability must lie in [0, 1), got {}",
            p
        )));
    }
    if p == 0.0 {
        return Ok(x.clone());
    }
    let keep = 1.0 - p;
    let scale = (1.0 / keep) as f32;
    let mask: Vec<f32> = (0..x.elem_count())
        .map(|_| if rng.gen::<f64>() < keep { scale } else { 0.0 })
        .collect();
    let mask = Tensor::from_vec(mask, x.shape().clone(), x.device()).op("dropout mask")?;
    x.mul(&mask).op("dropout")
}

/// Row-wise L2 normalisation over the last dimension.
pub fn l2_normalize(x: &Tensor) -> DiffRecResult<Tensor> {
    let norm = x
        .sqr()
        .and_then(|s| s.sum_keepdim(D::Minus1))
        .and_then(|s| s.sqrt())
        .and_then(|n| n.maximum(NORM_EPS))
        .op("l2 norm")?;
    x.broadcast_div(&norm).op("l2 normalize")
}

/// One-hot rows for `labels`, zeroed where `masked` is true.
pub fn masked_one_hot(
    labels: &[u32],
    masked: &[bool],
    n_classes: usize,
    device: &candle_core::Device,
) -> DiffRecResult<Tensor> {
    let mut values = vec![0.0f32; labels.len() * n_classes];
    for (row, (&label, &is_masked)) in labels.iter().zip(masked).enumerate() {
        let label = label as usize;
        if label >= n_classes {
            return Err(DiffRecError::DataIntegrity(format!(
                "condition label {} outside {} classes",
                label, n_classes
            )));
        }
        if !is_masked {
            values[row * n_classes + label] = 1.0;
        }
    }
    Tensor::from_vec(values, (labels.len(), n_classes), device).op("one hot")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::noise::seeded_rng;
    use candle_core::{DType, Device};

    #[test]
    fn test_activation_parse() {
        assert_eq!("leaky-relu".parse::<Activation>().unwrap(), Activation::LeakyRelu);
        assert_eq!("leaky_relu".parse::<Activation>().unwrap(), Activation::LeakyRelu);
        assert!(matches!(
            "swish".parse::<Activation>(),
            Err(DiffRecError::Configuration(_))
        ));
    }

    #[test]
    fn test_leaky_relu_slope() {
        let x = Tensor::new(&[-1.0f32, 2.0], &Device::Cpu).unwrap();
        let y = Activation::LeakyRelu.apply(&x).unwrap().to_vec1::<f32>().unwrap();
        assert!((y[0] + 0.01).abs() < 1e-7);
        assert_eq!(y[1], 2.0);
    }

    #[test]
    fn test_mlp_layer_names_and_forward() {
        let mut store = ParameterStore::new(Device::Cpu);
        Mlp::init_parameters(&mut store, "stack", &[4, 3, 2], &mut seeded_rng(0)).unwrap();
        assert!(store.contains("stack.0.weight"));
        assert!(store.contains("stack.2.weight"));

        let vb = store.var_builder();
        let mlp = Mlp::load(&[4, 3, 2], Activation::Tanh, false, vb.pp("stack")).unwrap();
        assert_eq!(mlp.num_layers(), 2);
        let x = Tensor::ones((5, 4), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(mlp.forward(&x).unwrap().dims(), &[5, 2]);
    }

    #[test]
    fn test_trailing_activation_bounds_output() {
        let mut store = ParameterStore::new(Device::Cpu);
        Mlp::init_parameters(&mut store, "s", &[3, 3], &mut seeded_rng(4)).unwrap();
        let mlp = Mlp::load(&[3, 3], Activation::Sigmoid, true, store.var_builder().pp("s")).unwrap();
        let x = Tensor::new(&[[50.0f32, -50.0, 3.0]], &Device::Cpu).unwrap();
        let y = mlp.forward(&x).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(y.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_l2_normalize_rows() {
        let x = Tensor::new(&[[3.0f32, 4.0], [0.0, 0.0]], &Device::Cpu).unwrap();
        let y = l2_normalize(&x).unwrap().to_vec2::<f32>().unwrap();
        assert!((y[0][0] - 0.6).abs() < 1e-6);
        assert!((y[0][1] - 0.8).abs() < 1e-6);
        assert_eq!(y[1], vec![0.0, 0.0]);
    }

    #[test]
    fn test_dropout_zero_is_identity() {
        let x = Tensor::ones((2, 2), DType::F32, &Device::Cpu).unwrap();
        let y = dropout(&x, 0.0, &mut seeded_rng(1)).unwrap();
        assert_eq!(y.to_vec2::<f32>().unwrap(), x.to_vec2::<f32>().unwrap());
        assert!(dropout(&x, 1.0, &mut seeded_rng(1)).is_err());
    }

    #[test]
    fn test_masked_one_hot() {
        let c = masked_one_hot(&[1, 0], &[false, true], 3, &Device::Cpu).unwrap();
        assert_eq!(
            c.to_vec2::<f32>().unwrap(),
            vec![vec![0.0, 1.0, 0.0], vec![0.0, 0.0, 0.0]]
        );
        assert!(matches!(
            masked_one_hot(&[3], &[false], 3, &Device::Cpu),
            Err(DiffRecError::DataIntegrity(_))
        ));
    }
}
