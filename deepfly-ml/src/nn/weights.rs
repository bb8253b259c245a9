//! Weight artifact (de)serialization.
//!
//! Networks are stored as `safetensors` files. Tensor names follow Keras
//! layer naming (`conv2d_1/kernel`, `batch_normalization_3/moving_mean`,
//! ...) and the header metadata records the architecture so the loader can
//! rebuild the right topology.

use super::keras::load_keras_h5;
use super::layers::Parameter;
use super::network::{Architecture, Network};
use crate::error::MlError;
use safetensors::tensor::{Dtype, SafeTensors, TensorView};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

/// Bumped whenever the tensor naming scheme changes.
pub const FORMAT_VERSION: &str = "1";

/// Weight artifact container formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightFormat {
    SafeTensors,
    /// Keras HDF5 from `save_weights` or a full-model save.
    Hdf5,
    Unknown,
}

/// Detect the container format from the file extension.
pub fn detect_format(path: &Path) -> WeightFormat {
    match path.extension().and_then(|e| e.to_str()) {
        Some("safetensors") => WeightFormat::SafeTensors,
        Some("h5" | "hdf5" | "keras") => WeightFormat::Hdf5,
        _ => WeightFormat::Unknown,
    }
}

/// Serialize every parameter of `network` into a safetensors buffer.
pub fn to_safetensors_bytes(network: &Network) -> Result<Vec<u8>, MlError> {
    let encoded: Vec<(String, Vec<usize>, Vec<u8>)> = network
        .parameters()
        .into_iter()
        .map(|p| {
            let bytes = p.values.iter().flat_map(|v| v.to_le_bytes()).collect();
            (p.name, p.shape, bytes)
        })
        .collect();

    let views = encoded
        .iter()
        .map(|(name, shape, bytes)| {
            TensorView::new(Dtype::F32, shape.clone(), bytes).map(|view| (name.as_str(), view))
        })
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| MlError::conversion(format!("failed to build tensor view: {e}")))?;

    let mut metadata = HashMap::new();
    metadata.insert(
        "architecture".to_string(),
        network.architecture().name().to_string(),
    );
    metadata.insert("format_version".to_string(), FORMAT_VERSION.to_string());
    metadata.insert(
        "generated_by".to_string(),
        concat!("deepfly-ml ", env!("CARGO_PKG_VERSION")).to_string(),
    );

    safetensors::serialize(views, &Some(metadata))
        .map_err(|e| MlError::conversion(format!("safetensors serialization failed: {e}")))
}

/// Write `network` to `path` as a safetensors file.
pub fn save_safetensors(network: &Network, path: &Path) -> Result<u64, MlError> {
    let bytes = to_safetensors_bytes(network)?;
    std::fs::write(path, &bytes)?;
    debug!(path = %path.display(), bytes = bytes.len(), "Wrote safetensors artifact");
    Ok(bytes.len() as u64)
}

/// Work out which architecture a safetensors buffer holds.
///
/// Header metadata wins; otherwise the width of the output dense kernel
/// decides between the single-score and the two-class head.
pub fn detect_architecture(buffer: &[u8]) -> Result<Architecture, MlError> {
    let (_, metadata) = SafeTensors::read_metadata(buffer)?;
    if let Some(name) = metadata
        .metadata()
        .as_ref()
        .and_then(|m| m.get("architecture"))
    {
        return name.parse();
    }

    let tensors = SafeTensors::deserialize(buffer)?;
    let output = format!("{}/kernel", Architecture::Meso4.output_layer_name());
    let view = tensors.tensor(&output).map_err(|_| {
        MlError::model_load(format!(
            "artifact has no architecture metadata and no '{output}' tensor"
        ))
    })?;
    let width = view.shape().last().copied().unwrap_or(0);
    Architecture::from_output_width(width).ok_or_else(|| {
        MlError::model_load(format!(
            "output layer has {width} units; expected 1 (meso4) or 2 (meso4-pair)"
        ))
    })
}

/// Decode every tensor of a safetensors buffer into a [`Parameter`].
pub fn read_parameters(buffer: &[u8]) -> Result<Vec<Parameter>, MlError> {
    let tensors = SafeTensors::deserialize(buffer)?;
    let mut params = Vec::with_capacity(tensors.len());
    for (name, view) in tensors.tensors() {
        if view.dtype() != Dtype::F32 {
            return Err(MlError::model_load(format!(
                "tensor '{name}' has dtype {:?}, only F32 is supported",
                view.dtype()
            )));
        }
        let values = view
            .data()
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        params.push(Parameter {
            name,
            shape: view.shape().to_vec(),
            values,
        });
    }
    Ok(params)
}

/// Rebuild a network from a safetensors buffer.
///
/// Every parameter of the target topology must be present with a matching
/// shape; extra tensors are rejected.
pub fn from_safetensors_bytes(
    buffer: &[u8],
    architecture: Option<Architecture>,
) -> Result<Network, MlError> {
    let architecture = match architecture {
        Some(a) => a,
        None => detect_architecture(buffer)?,
    };
    let mut network = Network::new(architecture);
    let expected = network.parameters().len();

    let params = read_parameters(buffer)?;
    if params.len() != expected {
        return Err(MlError::model_load(format!(
            "{architecture} expects {expected} tensors, artifact has {}",
            params.len()
        )));
    }
    for p in params {
        network.assign(&p.name, &p.shape, p.values)?;
    }
    Ok(network)
}

/// Load a safetensors weight artifact from disk.
pub fn load_safetensors(path: &Path, architecture: Option<Architecture>) -> Result<Network, MlError> {
    let buffer = std::fs::read(path)
        .map_err(|e| MlError::model_load(format!("cannot read {}: {e}", path.display())))?;
    let network = from_safetensors_bytes(&buffer, architecture)?;
    info!(
        path = %path.display(),
        architecture = %network.architecture(),
        parameters = network.parameter_count(),
        "Loaded weight artifact"
    );
    Ok(network)
}

/// Load any supported weight artifact, picking the decoder by extension.
pub fn load_weights(path: &Path, architecture: Option<Architecture>) -> Result<Network, MlError> {
    match detect_format(path) {
        WeightFormat::SafeTensors => load_safetensors(path, architecture),
        WeightFormat::Hdf5 => load_keras_h5(path, architecture),
        WeightFormat::Unknown => Err(MlError::model_load(format!(
            "unrecognized weight artifact '{}' (expected .h5 or .safetensors)",
            path.display()
        ))),
    }
}

/// Copy the convolutional trunk of `source` into `target`.
///
/// Both networks share the Meso-4 trunk, so this is how a pretrained
/// single-score model seeds the feature extractor of a two-class model.
pub fn copy_trunk(source: &Network, target: &mut Network) -> Result<usize, MlError> {
    let trunk: Vec<String> = source
        .trunk_layer_names()
        .into_iter()
        .map(|n| format!("{n}/"))
        .collect();
    let mut copied = 0;
    for p in source.parameters() {
        if trunk.iter().any(|prefix| p.name.starts_with(prefix)) {
            target.assign(&p.name, &p.shape, p.values)?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    #[test]
    fn test_detect_format() {
        assert_eq!(
            detect_format(Path::new("Meso4_DF.safetensors")),
            WeightFormat::SafeTensors
        );
        assert_eq!(detect_format(Path::new("Meso4_DF.h5")), WeightFormat::Hdf5);
        assert_eq!(detect_format(Path::new("model.tflite")), WeightFormat::Unknown);
    }

    #[test]
    fn test_bytes_roundtrip_preserves_parameters() {
        let net = Network::random(Architecture::Meso4, 3);
        let bytes = to_safetensors_bytes(&net).unwrap();
        assert_eq!(detect_architecture(&bytes).unwrap(), Architecture::Meso4);

        let loaded = from_safetensors_bytes(&bytes, None).unwrap();
        assert_eq!(loaded.parameters(), net.parameters());
    }

    #[test]
    fn test_reloaded_network_gives_identical_output() {
        let net = Network::random(Architecture::Meso4Pair, 11);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pair.safetensors");
        save_safetensors(&net, &path).unwrap();

        let loaded = load_safetensors(&path, None).unwrap();
        assert_eq!(loaded.architecture(), Architecture::Meso4Pair);

        let batch = Array4::from_elem((1, 256, 256, 3), 0.25f32);
        assert_eq!(net.forward(&batch).unwrap(), loaded.forward(&batch).unwrap());
    }

    #[test]
    fn test_architecture_inferred_without_metadata() {
        let net = Network::random(Architecture::Meso4Pair, 1);
        let params = net.parameters();
        let encoded: Vec<(String, Vec<usize>, Vec<u8>)> = params
            .into_iter()
            .map(|p| {
                let b = p.values.iter().flat_map(|v| v.to_le_bytes()).collect();
                (p.name, p.shape, b)
            })
            .collect();
        let views: Vec<(&str, TensorView)> = encoded
            .iter()
            .map(|(n, s, b)| (n.as_str(), TensorView::new(Dtype::F32, s.clone(), b).unwrap()))
            .collect();
        let bytes = safetensors::serialize(views, &None).unwrap();

        assert_eq!(detect_architecture(&bytes).unwrap(), Architecture::Meso4Pair);
    }

    #[test]
    fn test_architecture_mismatch_is_rejected() {
        let net = Network::random(Architecture::Meso4, 5);
        let bytes = to_safetensors_bytes(&net).unwrap();
        let err = from_safetensors_bytes(&bytes, Some(Architecture::Meso4Pair)).unwrap_err();
        assert!(matches!(err, MlError::ModelLoad(_)));
    }

    #[test]
    fn test_garbage_is_rejected() {
        let err = from_safetensors_bytes(b"definitely not safetensors", None).unwrap_err();
        assert!(matches!(err, MlError::ModelLoad(_)));
    }

    #[test]
    fn test_load_weights_dispatches_on_extension() {
        let dir = tempfile::tempdir().unwrap();
        let net = Network::random(Architecture::Meso4, 13);
        let st = dir.path().join("w.safetensors");
        let h5 = dir.path().join("w.h5");
        save_safetensors(&net, &st).unwrap();
        crate::nn::keras::tests::write_keras_weights(&net, &h5, 1);

        assert_eq!(load_weights(&st, None).unwrap().parameters(), net.parameters());
        assert_eq!(load_weights(&h5, None).unwrap().parameters(), net.parameters());
        assert!(load_weights(&dir.path().join("w.bin"), None).is_err());
    }

    #[test]
    fn test_missing_file() {
        let err = load_safetensors(Path::new("/nonexistent/w.safetensors"), None).unwrap_err();
        assert!(err.to_string().contains("cannot read"));
    }

    #[test]
    fn test_copy_trunk_into_pair() {
        let source = Network::random(Architecture::Meso4, 9);
        let mut target = Network::new(Architecture::Meso4Pair);
        let copied = copy_trunk(&source, &mut target).unwrap();
        assert_eq!(copied, 4 * 2 + 4 * 4);

        let src = source.parameters();
        let dst = target.parameters();
        assert_eq!(src[0], dst[0]);
        // Head stays untouched.
        let head = dst.iter().find(|p| p.name == "dense_1/kernel").unwrap();
        assert!(head.values.iter().all(|v| *v == 0.0));
    }
}
