//! TF.js "layers-model" bundle: `model.json` plus binary weight shards.
//!
//! The topology is a Keras-style `Sequential` config so the bundle can be
//! opened with `tf.loadLayersModel`. Weights are written in parameter order
//! as little-endian float32 and split into shards of at most
//! `shard_size_bytes`.

use crate::error::MlError;
use crate::nn::{Architecture, INPUT_CHANNELS, INPUT_SIZE, Layer, Network};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashSet;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

pub const MODEL_JSON: &str = "model.json";

/// Default shard size used by the TF.js converter.
pub const DEFAULT_SHARD_SIZE: usize = 4 * 1024 * 1024;

/// One entry of a weights manifest group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightSpec {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: String,
}

/// A group of shard files and the weights packed into them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestGroup {
    pub paths: Vec<String>,
    pub weights: Vec<WeightSpec>,
}

/// Top-level `model.json` document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayersModel {
    pub format: String,
    pub generated_by: String,
    pub converted_by: String,
    pub model_topology: Value,
    pub weights_manifest: Vec<ManifestGroup>,
}

fn layer_config(layer: &Layer, first: bool) -> Value {
    let (class_name, mut config) = match layer {
        Layer::Conv2d(conv) => (
            "Conv2D",
            json!({
                "name": conv.name,
                "trainable": conv.trainable,
                "filters": conv.filters(),
                "kernel_size": [conv.kernel_size(), conv.kernel_size()],
                "strides": [1, 1],
                "padding": "same",
                "data_format": "channels_last",
                "dilation_rate": [1, 1],
                "activation": conv.activation.keras_name(),
                "use_bias": true,
            }),
        ),
        Layer::BatchNorm(bn) => (
            "BatchNormalization",
            json!({
                "name": bn.name,
                "trainable": bn.trainable,
                "axis": -1,
                "momentum": 0.99,
                "epsilon": bn.epsilon,
                "center": true,
                "scale": true,
            }),
        ),
        Layer::MaxPool2d(pool) => (
            "MaxPooling2D",
            json!({
                "name": pool.name,
                "trainable": true,
                "pool_size": [pool.pool_size, pool.pool_size],
                "strides": [pool.pool_size, pool.pool_size],
                "padding": "same",
                "data_format": "channels_last",
            }),
        ),
        Layer::Flatten { name } => (
            "Flatten",
            json!({ "name": name, "trainable": true, "data_format": "channels_last" }),
        ),
        Layer::Dropout { name, rate } => (
            "Dropout",
            json!({ "name": name, "trainable": true, "rate": rate }),
        ),
        Layer::Dense(dense) => (
            "Dense",
            json!({
                "name": dense.name,
                "trainable": dense.trainable,
                "units": dense.units(),
                "activation": dense.activation.keras_name(),
                "use_bias": true,
            }),
        ),
    };
    if first {
        config["batch_input_shape"] = json!([null, INPUT_SIZE, INPUT_SIZE, INPUT_CHANNELS]);
        config["dtype"] = json!("float32");
    }
    json!({ "class_name": class_name, "config": config })
}

/// Keras `Sequential` topology describing `network`.
pub fn model_topology(network: &Network) -> Value {
    let layers: Vec<Value> = network
        .layers()
        .iter()
        .enumerate()
        .map(|(i, layer)| layer_config(layer, i == 0))
        .collect();
    json!({
        "class_name": "Sequential",
        "config": {
            "name": network.architecture().name(),
            "layers": layers,
        },
        "backend": "tensorflow",
    })
}

fn shard_name(index: usize, count: usize) -> String {
    format!("group1-shard{index}of{count}.bin")
}

/// Write `model.json` and the weight shards into `dir`.
///
/// Returns the paths written, `model.json` first.
pub fn write_layers_model(
    network: &Network,
    dir: &Path,
    shard_size_bytes: usize,
) -> Result<Vec<PathBuf>, MlError> {
    if shard_size_bytes == 0 || shard_size_bytes % 4 != 0 {
        return Err(MlError::conversion(format!(
            "shard size must be a positive multiple of 4 bytes, got {shard_size_bytes}"
        )));
    }

    let params = network.parameters();
    let mut data = Vec::with_capacity(params.iter().map(|p| p.values.len() * 4).sum());
    let mut weights = Vec::with_capacity(params.len());
    for p in params {
        if let Some(bad) = p.values.iter().find(|v| !v.is_finite()) {
            return Err(MlError::conversion(format!(
                "tensor '{}' contains a non-finite value ({bad})",
                p.name
            )));
        }
        data.extend(p.values.iter().flat_map(|v| v.to_le_bytes()));
        weights.push(WeightSpec {
            name: p.name,
            shape: p.shape,
            dtype: "float32".into(),
        });
    }

    let chunks: Vec<&[u8]> = data.chunks(shard_size_bytes).collect();
    let count = chunks.len().max(1);
    let mut written = Vec::with_capacity(count + 1);
    let mut paths = Vec::with_capacity(count);

    let model_path = dir.join(MODEL_JSON);
    written.push(model_path.clone());
    for (i, chunk) in chunks.iter().enumerate() {
        let name = shard_name(i + 1, count);
        let path = dir.join(&name);
        std::fs::write(&path, chunk)?;
        paths.push(name);
        written.push(path);
    }

    let generator = concat!("deepfly-ml ", env!("CARGO_PKG_VERSION")).to_string();
    let model = LayersModel {
        format: "layers-model".into(),
        generated_by: generator.clone(),
        converted_by: generator,
        model_topology: model_topology(network),
        weights_manifest: vec![ManifestGroup { paths, weights }],
    };
    std::fs::write(&model_path, serde_json::to_vec_pretty(&model)?)?;
    Ok(written)
}

/// Rebuild a network from a bundle written by [`write_layers_model`].
///
/// The manifest must name every parameter of the topology exactly once and
/// each group's shards must hold exactly the bytes its weights describe.
pub fn read_layers_model(dir: &Path) -> Result<Network, MlError> {
    let model: LayersModel = serde_json::from_slice(&std::fs::read(dir.join(MODEL_JSON))?)?;
    let name = model.model_topology["config"]["name"]
        .as_str()
        .ok_or_else(|| MlError::model_load("model.json has no topology name"))?;
    let architecture: Architecture = name.parse()?;
    let mut network = Network::new(architecture);
    let expected = network.parameters().len();
    let mut seen = HashSet::with_capacity(expected);

    for group in model.weights_manifest {
        let mut data = Vec::new();
        for path in &group.paths {
            if Path::new(path).file_name() != Some(OsStr::new(path)) {
                return Err(MlError::model_load(format!(
                    "shard path '{path}' must be a bare file name"
                )));
            }
            data.extend(std::fs::read(dir.join(path))?);
        }
        let mut offset = 0usize;
        for spec in group.weights {
            if spec.dtype != "float32" {
                return Err(MlError::model_load(format!(
                    "weight '{}' has dtype {}, only float32 is supported",
                    spec.name, spec.dtype
                )));
            }
            if !seen.insert(spec.name.clone()) {
                return Err(MlError::model_load(format!(
                    "weight '{}' appears twice in the manifest",
                    spec.name
                )));
            }
            let end = spec
                .shape
                .iter()
                .try_fold(4usize, |acc, d| acc.checked_mul(*d))
                .and_then(|len| offset.checked_add(len))
                .ok_or_else(|| {
                    MlError::model_load(format!("weight '{}' has an oversized shape", spec.name))
                })?;
            let bytes = data.get(offset..end).ok_or_else(|| {
                MlError::model_load(format!("shards end before weight '{}'", spec.name))
            })?;
            let values = bytes
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            network.assign(&spec.name, &spec.shape, values)?;
            offset = end;
        }
        if offset != data.len() {
            return Err(MlError::model_load(format!(
                "shards hold {} bytes past the last weight",
                data.len() - offset
            )));
        }
    }

    if seen.len() != expected {
        return Err(MlError::model_load(format!(
            "{architecture} expects {expected} weights, manifest lists {}",
            seen.len()
        )));
    }
    Ok(network)
}
