//! Model handle and startup loading.
//!
//! The handle is built once when the server starts and is never mutated
//! afterwards; request handlers share it through an `Arc`. A failed load is
//! terminal for the process: the state records why and every prediction is
//! refused until restart.

use super::prediction::Prediction;
use super::preprocess;
use crate::error::MlError;
use crate::nn::{Architecture, Network, load_weights};
use deepfly_core::ChannelOrder;
use ndarray::Array4;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

/// Classification of one image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InferenceResult {
    pub prediction: Prediction,
    pub fake_probability: f32,
    /// `floor(fake_probability × 100)`.
    pub score: u8,
}

/// Read-only, cheaply clonable reference to a loaded network.
#[derive(Debug, Clone)]
pub struct ModelHandle {
    network: Arc<Network>,
    source: PathBuf,
}

impl ModelHandle {
    pub fn new(network: Network, source: impl Into<PathBuf>) -> Self {
        Self {
            network: Arc::new(network),
            source: source.into(),
        }
    }

    pub fn architecture(&self) -> Architecture {
        self.network.architecture()
    }

    /// Artifact the handle was loaded from.
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Run a single-image batch.
    pub fn predict(&self, batch: &Array4<f32>) -> Result<Prediction, MlError> {
        if batch.dim().0 != 1 {
            return Err(MlError::invalid_input(format!(
                "expected a batch of one image, got {}",
                batch.dim().0
            )));
        }
        self.network
            .forward(batch)?
            .into_iter()
            .next()
            .ok_or_else(|| MlError::inference("network returned no prediction"))
    }

    /// Decode, preprocess and classify encoded image bytes.
    pub fn classify(&self, bytes: &[u8], order: ChannelOrder) -> Result<InferenceResult, MlError> {
        let batch = preprocess::preprocess(bytes, order)?;
        let prediction = self.predict(&batch)?;
        Ok(InferenceResult {
            prediction,
            fake_probability: prediction.fake_probability(),
            score: prediction.score()?,
        })
    }
}

/// Outcome of loading the model at startup.
#[derive(Debug, Clone)]
pub enum ModelState {
    Loaded(ModelHandle),
    Unavailable { reason: String },
}

impl ModelState {
    /// Try to build the model handle; never fails, degrades instead.
    pub fn load(weights_path: &Path, architecture: Option<Architecture>) -> Self {
        info!(path = %weights_path.display(), "Initializing MesoNet model");
        match try_load(weights_path, architecture) {
            Ok(handle) => {
                info!(
                    architecture = %handle.architecture(),
                    "Model and weights loaded successfully"
                );
                ModelState::Loaded(handle)
            }
            Err(e) => {
                error!(path = %weights_path.display(), error = %e, "Model failed to load, serving degraded");
                ModelState::Unavailable {
                    reason: e.to_string(),
                }
            }
        }
    }

    pub fn handle(&self) -> Option<&ModelHandle> {
        match self {
            ModelState::Loaded(h) => Some(h),
            ModelState::Unavailable { .. } => None,
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self, ModelState::Loaded(_))
    }
}

fn try_load(
    weights_path: &Path,
    architecture: Option<Architecture>,
) -> Result<ModelHandle, MlError> {
    if !weights_path.exists() {
        return Err(MlError::model_load(format!(
            "weights file '{}' not found; run `deepfly fetch` first",
            weights_path.display()
        )));
    }

    let network = load_weights(weights_path, architecture)?;
    Ok(ModelHandle::new(network, weights_path))
}
