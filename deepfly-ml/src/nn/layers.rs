//! Layer primitives for channels-last (NHWC) feature maps.
//!
//! Conventions follow Keras so that weights exported from a Keras model map
//! one-to-one: convolution kernels are `[kh, kw, in, out]`, dense kernels
//! are `[in, out]`, and "same" padding splits any odd remainder toward the
//! bottom/right edge.

use crate::error::MlError;
use ndarray::{Array1, Array2, Array3, Array4, ArrayD, IxDyn};
use serde::{Deserialize, Serialize};

/// Keras' default batch-normalization epsilon.
pub const BATCH_NORM_EPSILON: f32 = 1e-3;

/// Element-wise or vector activation applied after a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Linear,
    Relu,
    Sigmoid,
    Softmax,
}

impl Activation {
    /// Keras identifier used in exported topologies.
    pub fn keras_name(self) -> &'static str {
        match self {
            Activation::Linear => "linear",
            Activation::Relu => "relu",
            Activation::Sigmoid => "sigmoid",
            Activation::Softmax => "softmax",
        }
    }

    fn apply_scalar(self, v: f32) -> f32 {
        match self {
            Activation::Linear | Activation::Softmax => v,
            Activation::Relu => v.max(0.0),
            Activation::Sigmoid => 1.0 / (1.0 + (-v).exp()),
        }
    }

    fn apply_vector(self, mut v: Array1<f32>) -> Array1<f32> {
        if self == Activation::Softmax {
            let max = v.fold(f32::NEG_INFINITY, |m, &x| m.max(x));
            v.mapv_inplace(|x| (x - max).exp());
            let sum = v.sum();
            v.mapv_inplace(|x| x / sum);
        } else {
            v.mapv_inplace(|x| self.apply_scalar(x));
        }
        v
    }
}

/// A named learned tensor, flattened in row-major order.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    /// `<layer>/<weight>`, e.g. `conv2d_1/kernel`.
    pub name: String,
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

impl Parameter {
    fn from_array<D: ndarray::Dimension>(
        layer: &str,
        weight: &str,
        array: &ndarray::Array<f32, D>,
    ) -> Self {
        Self {
            name: format!("{layer}/{weight}"),
            shape: array.shape().to_vec(),
            values: array.iter().copied().collect(),
        }
    }
}

/// Replace `target` with `values`, which must have the same shape.
fn assign_array<D: ndarray::Dimension>(
    target: &mut ndarray::Array<f32, D>,
    name: &str,
    shape: &[usize],
    values: Vec<f32>,
) -> Result<(), MlError> {
    if target.shape() != shape {
        return Err(MlError::model_load(format!(
            "tensor '{name}' has shape {shape:?}, expected {:?}",
            target.shape()
        )));
    }
    *target = ArrayD::from_shape_vec(IxDyn(shape), values)?
        .into_dimensionality::<D>()?;
    Ok(())
}

/// 2D convolution, stride 1, "same" padding.
#[derive(Debug, Clone)]
pub struct Conv2d {
    pub name: String,
    /// `[kh, kw, in, out]`
    pub kernel: Array4<f32>,
    pub bias: Array1<f32>,
    pub activation: Activation,
    pub trainable: bool,
}

impl Conv2d {
    pub fn new(
        name: impl Into<String>,
        kernel_size: usize,
        in_channels: usize,
        filters: usize,
        activation: Activation,
    ) -> Self {
        Self {
            name: name.into(),
            kernel: Array4::zeros((kernel_size, kernel_size, in_channels, filters)),
            bias: Array1::zeros(filters),
            activation,
            trainable: true,
        }
    }

    pub fn filters(&self) -> usize {
        self.kernel.dim().3
    }

    pub fn kernel_size(&self) -> usize {
        self.kernel.dim().0
    }

    pub fn forward(&self, input: &Array3<f32>) -> Result<Array3<f32>, MlError> {
        let (h, w, cin) = input.dim();
        let (kh, kw, kin, cout) = self.kernel.dim();
        if cin != kin {
            return Err(MlError::inference(format!(
                "{}: expected {kin} input channels, got {cin}",
                self.name
            )));
        }
        let pad_top = (kh - 1) / 2;
        let pad_left = (kw - 1) / 2;

        // Row-major copies regardless of the source memory layout.
        let x: Vec<f32> = input.iter().copied().collect();
        let k: Vec<f32> = self.kernel.iter().copied().collect();
        let bias: Vec<f32> = self.bias.iter().copied().collect();
        let mut out = vec![0.0f32; h * w * cout];

        for oy in 0..h {
            for ox in 0..w {
                let out_base = (oy * w + ox) * cout;
                let acc = &mut out[out_base..out_base + cout];
                acc.copy_from_slice(&bias);
                for ky in 0..kh {
                    let Some(iy) = (oy + ky).checked_sub(pad_top).filter(|&y| y < h) else {
                        continue;
                    };
                    for kx in 0..kw {
                        let Some(ix) = (ox + kx).checked_sub(pad_left).filter(|&x| x < w) else {
                            continue;
                        };
                        let in_base = (iy * w + ix) * cin;
                        let k_base = (ky * kw + kx) * cin * cout;
                        for ci in 0..cin {
                            let v = x[in_base + ci];
                            let row = &k[k_base + ci * cout..k_base + (ci + 1) * cout];
                            for (a, kv) in acc.iter_mut().zip(row) {
                                *a += v * kv;
                            }
                        }
                    }
                }
                for a in acc.iter_mut() {
                    *a = self.activation.apply_scalar(*a);
                }
            }
        }

        Ok(Array3::from_shape_vec((h, w, cout), out)?)
    }

    pub fn parameters(&self) -> Vec<Parameter> {
        vec![
            Parameter::from_array(&self.name, "kernel", &self.kernel),
            Parameter::from_array(&self.name, "bias", &self.bias),
        ]
    }

    fn assign(&mut self, weight: &str, shape: &[usize], values: Vec<f32>) -> Result<(), MlError> {
        let name = format!("{}/{weight}", self.name);
        match weight {
            "kernel" => assign_array(&mut self.kernel, &name, shape, values),
            "bias" => assign_array(&mut self.bias, &name, shape, values),
            _ => Err(MlError::model_load(format!("unknown tensor '{name}'"))),
        }
    }
}

/// Inference-mode batch normalization over the channel axis.
#[derive(Debug, Clone)]
pub struct BatchNorm {
    pub name: String,
    pub gamma: Array1<f32>,
    pub beta: Array1<f32>,
    pub moving_mean: Array1<f32>,
    pub moving_variance: Array1<f32>,
    pub epsilon: f32,
    pub trainable: bool,
}

impl BatchNorm {
    /// Identity normalization: gamma 1, beta 0, mean 0, variance 1.
    pub fn new(name: impl Into<String>, channels: usize) -> Self {
        Self {
            name: name.into(),
            gamma: Array1::ones(channels),
            beta: Array1::zeros(channels),
            moving_mean: Array1::zeros(channels),
            moving_variance: Array1::ones(channels),
            epsilon: BATCH_NORM_EPSILON,
            trainable: true,
        }
    }

    pub fn channels(&self) -> usize {
        self.gamma.len()
    }

    pub fn forward(&self, input: &Array3<f32>) -> Result<Array3<f32>, MlError> {
        if input.dim().2 != self.channels() {
            return Err(MlError::inference(format!(
                "{}: expected {} channels, got {}",
                self.name,
                self.channels(),
                input.dim().2
            )));
        }
        let (scale, shift) = self.affine();
        Ok(input * &scale + &shift)
    }

    /// Per-channel `(scale, shift)` with `bn(x) = x * scale + shift`.
    pub fn affine(&self) -> (Array1<f32>, Array1<f32>) {
        let inv_std = self.moving_variance.mapv(|v| 1.0 / (v + self.epsilon).sqrt());
        let scale = &self.gamma * &inv_std;
        let shift = &self.beta - &(&self.moving_mean * &scale);
        (scale, shift)
    }

    pub fn parameters(&self) -> Vec<Parameter> {
        vec![
            Parameter::from_array(&self.name, "gamma", &self.gamma),
            Parameter::from_array(&self.name, "beta", &self.beta),
            Parameter::from_array(&self.name, "moving_mean", &self.moving_mean),
            Parameter::from_array(&self.name, "moving_variance", &self.moving_variance),
        ]
    }

    fn assign(&mut self, weight: &str, shape: &[usize], values: Vec<f32>) -> Result<(), MlError> {
        let name = format!("{}/{weight}", self.name);
        let target = match weight {
            "gamma" => &mut self.gamma,
            "beta" => &mut self.beta,
            "moving_mean" => &mut self.moving_mean,
            "moving_variance" => &mut self.moving_variance,
            _ => return Err(MlError::model_load(format!("unknown tensor '{name}'"))),
        };
        assign_array(target, &name, shape, values)
    }
}

/// Max pooling with `stride == pool_size` and "same" padding.
#[derive(Debug, Clone)]
pub struct MaxPool2d {
    pub name: String,
    pub pool_size: usize,
}

impl MaxPool2d {
    pub fn new(name: impl Into<String>, pool_size: usize) -> Self {
        Self {
            name: name.into(),
            pool_size,
        }
    }

    /// Output extent and leading pad along one axis.
    fn geometry(&self, extent: usize) -> (usize, usize) {
        let p = self.pool_size;
        let out = extent.div_ceil(p);
        let pad_total = ((out - 1) * p + p).saturating_sub(extent);
        (out, pad_total / 2)
    }

    pub fn forward(&self, input: &Array3<f32>) -> Array3<f32> {
        let (h, w, c) = input.dim();
        let (out_h, pad_top) = self.geometry(h);
        let (out_w, pad_left) = self.geometry(w);
        let p = self.pool_size;

        Array3::from_shape_fn((out_h, out_w, c), |(oy, ox, ch)| {
            let y0 = (oy * p).saturating_sub(pad_top);
            let y1 = (oy * p + p).saturating_sub(pad_top).min(h);
            let x0 = (ox * p).saturating_sub(pad_left);
            let x1 = (ox * p + p).saturating_sub(pad_left).min(w);
            let mut best = f32::NEG_INFINITY;
            for y in y0..y1 {
                for x in x0..x1 {
                    best = best.max(input[[y, x, ch]]);
                }
            }
            best
        })
    }
}

/// Fully connected layer.
#[derive(Debug, Clone)]
pub struct Dense {
    pub name: String,
    /// `[in, out]`
    pub kernel: Array2<f32>,
    pub bias: Array1<f32>,
    pub activation: Activation,
    pub trainable: bool,
}

impl Dense {
    pub fn new(
        name: impl Into<String>,
        inputs: usize,
        units: usize,
        activation: Activation,
    ) -> Self {
        Self {
            name: name.into(),
            kernel: Array2::zeros((inputs, units)),
            bias: Array1::zeros(units),
            activation,
            trainable: true,
        }
    }

    pub fn units(&self) -> usize {
        self.kernel.dim().1
    }

    pub fn forward(&self, input: &Array1<f32>) -> Result<Array1<f32>, MlError> {
        if input.len() != self.kernel.dim().0 {
            return Err(MlError::inference(format!(
                "{}: expected {} features, got {}",
                self.name,
                self.kernel.dim().0,
                input.len()
            )));
        }
        let z = input.dot(&self.kernel) + &self.bias;
        Ok(self.activation.apply_vector(z))
    }

    pub fn parameters(&self) -> Vec<Parameter> {
        vec![
            Parameter::from_array(&self.name, "kernel", &self.kernel),
            Parameter::from_array(&self.name, "bias", &self.bias),
        ]
    }

    fn assign(&mut self, weight: &str, shape: &[usize], values: Vec<f32>) -> Result<(), MlError> {
        let name = format!("{}/{weight}", self.name);
        match weight {
            "kernel" => assign_array(&mut self.kernel, &name, shape, values),
            "bias" => assign_array(&mut self.bias, &name, shape, values),
            _ => Err(MlError::model_load(format!("unknown tensor '{name}'"))),
        }
    }
}

/// One node of the sequential graph.
#[derive(Debug, Clone)]
pub enum Layer {
    Conv2d(Conv2d),
    BatchNorm(BatchNorm),
    MaxPool2d(MaxPool2d),
    Flatten { name: String },
    /// Identity at inference; the rate is kept for exported topologies.
    Dropout { name: String, rate: f32 },
    Dense(Dense),
}

impl Layer {
    pub fn name(&self) -> &str {
        match self {
            Layer::Conv2d(l) => &l.name,
            Layer::BatchNorm(l) => &l.name,
            Layer::MaxPool2d(l) => &l.name,
            Layer::Flatten { name } | Layer::Dropout { name, .. } => name,
            Layer::Dense(l) => &l.name,
        }
    }

    pub fn parameters(&self) -> Vec<Parameter> {
        match self {
            Layer::Conv2d(l) => l.parameters(),
            Layer::BatchNorm(l) => l.parameters(),
            Layer::Dense(l) => l.parameters(),
            Layer::MaxPool2d(_) | Layer::Flatten { .. } | Layer::Dropout { .. } => Vec::new(),
        }
    }

    /// Overwrite the weight called `weight` (the part after `/`).
    pub fn assign(&mut self, weight: &str, shape: &[usize], values: Vec<f32>) -> Result<(), MlError> {
        match self {
            Layer::Conv2d(l) => l.assign(weight, shape, values),
            Layer::BatchNorm(l) => l.assign(weight, shape, values),
            Layer::Dense(l) => l.assign(weight, shape, values),
            other => Err(MlError::model_load(format!(
                "layer '{}' has no weights",
                other.name()
            ))),
        }
    }

    pub fn set_trainable(&mut self, trainable: bool) {
        match self {
            Layer::Conv2d(l) => l.trainable = trainable,
            Layer::BatchNorm(l) => l.trainable = trainable,
            Layer::Dense(l) => l.trainable = trainable,
            _ => {}
        }
    }

    pub fn trainable(&self) -> bool {
        match self {
            Layer::Conv2d(l) => l.trainable,
            Layer::BatchNorm(l) => l.trainable,
            Layer::Dense(l) => l.trainable,
            _ => true,
        }
    }
}
