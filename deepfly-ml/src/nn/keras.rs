//! Keras HDF5 weight files.
//!
//! `Model.save_weights` writes one group per layer with the tensors nested a
//! level down: `conv2d_1/conv2d_1/kernel:0`, `dense_2/dense_2/bias:0`, and so
//! on. Full-model saves put the same tree under `model_weights/`. Keras matches
//! weighted layers by creation order rather than by name, so a file whose
//! layers are numbered `conv2d_5..conv2d_8` still loads; the numeric suffix
//! gives the order within each layer kind.

use super::layers::Layer;
use super::network::{Architecture, Network};
use crate::error::MlError;
use std::path::Path;
use tracing::{debug, info};

/// Group holding the layer tree in full-model saves.
const MODEL_WEIGHTS_GROUP: &str = "model_weights";

/// Weighted layer kinds, told apart by the tensors a group carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LayerKind {
    Conv2d,
    BatchNorm,
    Dense,
}

/// Tensors found under one top-level layer group.
#[derive(Debug)]
struct StoredLayer {
    group: String,
    kind: LayerKind,
    tensors: Vec<(String, Vec<usize>, Vec<f32>)>,
}

impl StoredLayer {
    fn kernel_shape(&self) -> Option<&[usize]> {
        self.tensors
            .iter()
            .find(|(name, _, _)| name == "kernel")
            .map(|(_, shape, _)| shape.as_slice())
    }
}

/// Load a Keras HDF5 weight file into the matching MesoNet topology.
///
/// When `architecture` is `None` the width of the last dense kernel decides
/// between the single-score and the two-class head.
pub fn load_keras_h5(path: &Path, architecture: Option<Architecture>) -> Result<Network, MlError> {
    let file = hdf5::File::open(path)
        .map_err(|e| MlError::model_load(format!("cannot open {}: {e}", path.display())))?;
    let root = if file.link_exists(MODEL_WEIGHTS_GROUP) {
        file.group(MODEL_WEIGHTS_GROUP)?
    } else {
        file.group("/")?
    };

    let mut stored = Vec::new();
    for group in root.groups()? {
        let name = leaf_name(&group.name());
        let mut tensors = Vec::new();
        collect_tensors(&group, &mut tensors)?;
        if tensors.is_empty() {
            continue;
        }
        let kind = classify(&name, &tensors)?;
        stored.push(StoredLayer {
            group: name,
            kind,
            tensors,
        });
    }
    stored.sort_by_key(|layer| layer_order(&layer.group));

    let architecture = match architecture {
        Some(a) => a,
        None => detect_keras_architecture(&stored)?,
    };
    let mut network = Network::new(architecture);

    let mut assigned = 0;
    for kind in [LayerKind::Conv2d, LayerKind::BatchNorm, LayerKind::Dense] {
        let targets = target_layers(&network, kind);
        let sources: Vec<&StoredLayer> = stored.iter().filter(|l| l.kind == kind).collect();
        if sources.len() != targets.len() {
            return Err(MlError::model_load(format!(
                "{architecture} has {} {kind:?} layers, file has {}",
                targets.len(),
                sources.len()
            )));
        }
        for (target, source) in targets.iter().zip(sources) {
            debug!(from = %source.group, to = %target, "Mapping Keras layer");
            for (weight, shape, values) in &source.tensors {
                network.assign(&format!("{target}/{weight}"), shape, values.clone())?;
                assigned += 1;
            }
        }
    }

    let expected = network.parameters().len();
    if assigned != expected {
        return Err(MlError::model_load(format!(
            "{architecture} expects {expected} tensors, file has {assigned}"
        )));
    }

    info!(
        path = %path.display(),
        architecture = %architecture,
        parameters = network.parameter_count(),
        "Loaded Keras weight file"
    );
    Ok(network)
}

/// Gather every dataset below `group`, named by its leaf without the `:0`.
fn collect_tensors(
    group: &hdf5::Group,
    out: &mut Vec<(String, Vec<usize>, Vec<f32>)>,
) -> Result<(), MlError> {
    for dataset in group.datasets()? {
        let leaf = leaf_name(&dataset.name());
        let weight = leaf.split(':').next().unwrap_or(&leaf).to_string();
        out.push((weight, dataset.shape(), dataset.read_raw::<f32>()?));
    }
    for sub in group.groups()? {
        collect_tensors(&sub, out)?;
    }
    Ok(())
}

fn classify(group: &str, tensors: &[(String, Vec<usize>, Vec<f32>)]) -> Result<LayerKind, MlError> {
    let has = |w: &str| tensors.iter().any(|(name, _, _)| name == w);
    if has("moving_mean") || has("gamma") {
        return Ok(LayerKind::BatchNorm);
    }
    match tensors.iter().find(|(name, _, _)| name == "kernel") {
        Some((_, shape, _)) if shape.len() == 4 => Ok(LayerKind::Conv2d),
        Some((_, shape, _)) if shape.len() == 2 => Ok(LayerKind::Dense),
        _ => Err(MlError::model_load(format!(
            "layer group '{group}' holds weights MesoNet has no place for"
        ))),
    }
}

fn detect_keras_architecture(stored: &[StoredLayer]) -> Result<Architecture, MlError> {
    let width = stored
        .iter()
        .rev()
        .find(|l| l.kind == LayerKind::Dense)
        .and_then(StoredLayer::kernel_shape)
        .and_then(|shape| shape.last().copied())
        .ok_or_else(|| MlError::model_load("file has no dense output layer"))?;
    Architecture::from_output_width(width).ok_or_else(|| {
        MlError::model_load(format!(
            "output layer has {width} units; expected 1 (meso4) or 2 (meso4-pair)"
        ))
    })
}

fn target_layers(network: &Network, kind: LayerKind) -> Vec<String> {
    network
        .layers()
        .iter()
        .filter(|layer| match kind {
            LayerKind::Conv2d => matches!(layer, Layer::Conv2d(_)),
            LayerKind::BatchNorm => matches!(layer, Layer::BatchNorm(_)),
            LayerKind::Dense => matches!(layer, Layer::Dense(_)),
        })
        .map(|layer| layer.name().to_string())
        .collect()
}

/// `conv2d_12` sorts after `conv2d_9`; unnumbered names come first.
fn layer_order(group: &str) -> (String, u64) {
    match group.rsplit_once('_') {
        Some((stem, n)) => match n.parse() {
            Ok(n) => (stem.to_string(), n),
            Err(_) => (group.to_string(), 0),
        },
        None => (group.to_string(), 0),
    }
}

fn leaf_name(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}
