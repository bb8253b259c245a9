//! Error types for the deepfly-ml crate.

use deepfly_core::FetchError;
use thiserror::Error;

/// Top-level error type for model, inference and export operations.
#[derive(Debug, Error)]
pub enum MlError {
    #[error("Model load error: {0}")]
    ModelLoad(String),

    #[error("Conversion error: {0}")]
    Conversion(String),

    #[error("Image decode error: {0}")]
    Decode(String),

    #[error("Inference error: {0}")]
    Inference(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl MlError {
    pub fn model_load(msg: impl Into<String>) -> Self {
        Self::ModelLoad(msg.into())
    }

    pub fn conversion(msg: impl Into<String>) -> Self {
        Self::Conversion(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    pub fn inference(msg: impl Into<String>) -> Self {
        Self::Inference(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }
}

impl From<safetensors::SafeTensorError> for MlError {
    fn from(e: safetensors::SafeTensorError) -> Self {
        Self::ModelLoad(format!("safetensors: {e}"))
    }
}

impl From<hdf5::Error> for MlError {
    fn from(e: hdf5::Error) -> Self {
        Self::ModelLoad(format!("hdf5: {e}"))
    }
}

impl From<image::ImageError> for MlError {
    fn from(e: image::ImageError) -> Self {
        Self::Decode(e.to_string())
    }
}

impl From<ndarray::ShapeError> for MlError {
    fn from(e: ndarray::ShapeError) -> Self {
        Self::InvalidInput(format!("tensor shape: {e}"))
    }
}
