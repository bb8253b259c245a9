//! MesoNet architectures and the sequential network that runs them.

use super::layers::{Activation, BatchNorm, Conv2d, Dense, Layer, MaxPool2d, Parameter};
use crate::error::MlError;
use crate::inference::prediction::Prediction;
use ndarray::{Array1, Array3, Array4, ArrayView3, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Spatial input resolution shared by every MesoNet variant.
pub const INPUT_SIZE: usize = 256;
/// Color channels expected at the input.
pub const INPUT_CHANNELS: usize = 3;

/// `(filters, kernel_size, pool_size)` for the four convolutional blocks.
const MESO4_BLOCKS: [(usize, usize, usize); 4] = [(8, 3, 2), (8, 5, 2), (16, 5, 2), (16, 5, 4)];

/// Supported network topologies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Architecture {
    /// Meso-4 with a single sigmoid output (fake probability).
    Meso4,
    /// Meso-4 convolutional trunk as a frozen feature extractor under a
    /// dense(256) head with a `[real, fake]` softmax output.
    Meso4Pair,
}

impl Architecture {
    pub fn name(self) -> &'static str {
        match self {
            Architecture::Meso4 => "meso4",
            Architecture::Meso4Pair => "meso4-pair",
        }
    }

    /// Width of the final dense layer.
    pub fn output_width(self) -> usize {
        match self {
            Architecture::Meso4 => 1,
            Architecture::Meso4Pair => 2,
        }
    }

    /// Resolve an architecture from the width of its output layer.
    pub fn from_output_width(width: usize) -> Option<Self> {
        match width {
            1 => Some(Architecture::Meso4),
            2 => Some(Architecture::Meso4Pair),
            _ => None,
        }
    }

    /// Name of the final dense layer in Keras numbering.
    pub fn output_layer_name(self) -> &'static str {
        "dense_2"
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Architecture {
    type Err = MlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "meso4" | "meso-4" => Ok(Architecture::Meso4),
            "meso4-pair" | "meso4-two-class" => Ok(Architecture::Meso4Pair),
            other => Err(MlError::invalid_input(format!(
                "unknown architecture '{other}' (expected meso4 or meso4-pair)"
            ))),
        }
    }
}

/// Intermediate value flowing between layers.
enum FeatureMap {
    Spatial(Array3<f32>),
    Flat(Array1<f32>),
}

/// A sequential network with inference-only semantics.
#[derive(Debug, Clone)]
pub struct Network {
    architecture: Architecture,
    layers: Vec<Layer>,
}

impl Network {
    /// Build the topology with zero weights and identity batch-norm statistics.
    pub fn new(architecture: Architecture) -> Self {
        let mut layers = meso4_trunk();
        let features = flattened_features();

        match architecture {
            Architecture::Meso4 => {
                layers.push(Layer::Flatten {
                    name: "flatten_1".into(),
                });
                layers.push(Layer::Dropout {
                    name: "dropout_1".into(),
                    rate: 0.5,
                });
                layers.push(Layer::Dense(Dense::new("dense_1", features, 16, Activation::Relu)));
                layers.push(Layer::Dropout {
                    name: "dropout_2".into(),
                    rate: 0.5,
                });
                layers.push(Layer::Dense(Dense::new("dense_2", 16, 1, Activation::Sigmoid)));
            }
            Architecture::Meso4Pair => {
                for layer in &mut layers {
                    layer.set_trainable(false);
                }
                layers.push(Layer::Flatten {
                    name: "flatten_1".into(),
                });
                layers.push(Layer::Dense(Dense::new(
                    "dense_1",
                    features,
                    256,
                    Activation::Relu,
                )));
                layers.push(Layer::Dropout {
                    name: "dropout_1".into(),
                    rate: 0.3,
                });
                layers.push(Layer::Dense(Dense::new("dense_2", 256, 2, Activation::Softmax)));
            }
        }

        Self {
            architecture,
            layers,
        }
    }

    /// Build the topology with Glorot-uniform kernels drawn from `seed`.
    pub fn random(architecture: Architecture, seed: u64) -> Self {
        let mut network = Self::new(architecture);
        let mut rng = StdRng::seed_from_u64(seed);
        for layer in &mut network.layers {
            match layer {
                Layer::Conv2d(conv) => {
                    let (kh, kw, cin, cout) = conv.kernel.dim();
                    let limit = glorot_limit(kh * kw * cin, kh * kw * cout);
                    conv.kernel.mapv_inplace(|_| rng.gen_range(-limit..limit));
                }
                Layer::Dense(dense) => {
                    let (fan_in, fan_out) = dense.kernel.dim();
                    let limit = glorot_limit(fan_in, fan_out);
                    dense.kernel.mapv_inplace(|_| rng.gen_range(-limit..limit));
                }
                _ => {}
            }
        }
        network
    }

    pub fn architecture(&self) -> Architecture {
        self.architecture
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// All learned tensors, in layer order.
    pub fn parameters(&self) -> Vec<Parameter> {
        self.layers.iter().flat_map(Layer::parameters).collect()
    }

    /// Total number of learned scalars.
    pub fn parameter_count(&self) -> usize {
        self.parameters().iter().map(|p| p.values.len()).sum()
    }

    /// Names of the layers that make up the convolutional feature extractor.
    pub fn trunk_layer_names(&self) -> Vec<&str> {
        self.layers
            .iter()
            .take_while(|l| !matches!(l, Layer::Flatten { .. }))
            .map(Layer::name)
            .collect()
    }

    /// Overwrite a tensor by its full `<layer>/<weight>` name.
    pub fn assign(&mut self, name: &str, shape: &[usize], values: Vec<f32>) -> Result<(), MlError> {
        let (layer_name, weight) = name
            .split_once('/')
            .ok_or_else(|| MlError::model_load(format!("malformed tensor name '{name}'")))?;
        let layer = self
            .layers
            .iter_mut()
            .find(|l| l.name() == layer_name)
            .ok_or_else(|| {
                MlError::model_load(format!(
                    "tensor '{name}' does not belong to a {} layer",
                    self.architecture
                ))
            })?;
        layer.assign(weight, shape, values)
    }

    /// Run a `[N, 256, 256, 3]` batch and return one prediction per image.
    pub fn forward(&self, batch: &Array4<f32>) -> Result<Vec<Prediction>, MlError> {
        let (_, h, w, c) = batch.dim();
        if (h, w, c) != (INPUT_SIZE, INPUT_SIZE, INPUT_CHANNELS) {
            return Err(MlError::invalid_input(format!(
                "expected input of shape [N, {INPUT_SIZE}, {INPUT_SIZE}, {INPUT_CHANNELS}], got {:?}",
                batch.shape()
            )));
        }
        batch
            .axis_iter(Axis(0))
            .map(|image| self.forward_one(image))
            .collect()
    }

    fn forward_one(&self, image: ArrayView3<f32>) -> Result<Prediction, MlError> {
        let mut x = FeatureMap::Spatial(image.to_owned());
        for layer in &self.layers {
            x = match (layer, x) {
                (Layer::Conv2d(conv), FeatureMap::Spatial(t)) => FeatureMap::Spatial(conv.forward(&t)?),
                (Layer::BatchNorm(bn), FeatureMap::Spatial(t)) => FeatureMap::Spatial(bn.forward(&t)?),
                (Layer::MaxPool2d(pool), FeatureMap::Spatial(t)) => FeatureMap::Spatial(pool.forward(&t)),
                (Layer::Flatten { .. }, FeatureMap::Spatial(t)) => {
                    FeatureMap::Flat(t.iter().copied().collect())
                }
                (Layer::Dropout { .. }, x) => x,
                (Layer::Dense(dense), FeatureMap::Flat(v)) => FeatureMap::Flat(dense.forward(&v)?),
                (layer, _) => {
                    return Err(MlError::inference(format!(
                        "layer '{}' received a tensor of the wrong rank",
                        layer.name()
                    )));
                }
            };
        }

        match x {
            FeatureMap::Flat(out) => Prediction::from_outputs(&out.to_vec()),
            FeatureMap::Spatial(_) => Err(MlError::inference("network did not end in a dense layer")),
        }
    }
}

fn meso4_trunk() -> Vec<Layer> {
    let mut layers = Vec::with_capacity(MESO4_BLOCKS.len() * 3);
    let mut in_channels = INPUT_CHANNELS;
    for (i, (filters, kernel, pool)) in MESO4_BLOCKS.iter().copied().enumerate() {
        let n = i + 1;
        layers.push(Layer::Conv2d(Conv2d::new(
            format!("conv2d_{n}"),
            kernel,
            in_channels,
            filters,
            Activation::Relu,
        )));
        layers.push(Layer::BatchNorm(BatchNorm::new(
            format!("batch_normalization_{n}"),
            filters,
        )));
        layers.push(Layer::MaxPool2d(MaxPool2d::new(
            format!("max_pooling2d_{n}"),
            pool,
        )));
        in_channels = filters;
    }
    layers
}

/// Length of the flattened trunk output (8 × 8 × 16).
fn flattened_features() -> usize {
    let mut extent = INPUT_SIZE;
    let mut channels = INPUT_CHANNELS;
    for (filters, _, pool) in MESO4_BLOCKS {
        extent = extent.div_ceil(pool);
        channels = filters;
    }
    extent * extent * channels
}

fn glorot_limit(fan_in: usize, fan_out: usize) -> f32 {
    (6.0 / (fan_in + fan_out) as f32).sqrt()
}
