//! # deepfly-ml
//!
//! MesoNet deepfake detection for DeepFly: the Meso-4 network and its
//! two-class variant, image preprocessing, the HTTP inference server, and
//! the exporter that produces browser and mobile artifacts.
//!
//! Everything runs in-process on the CPU. Weights are loaded from Keras
//! HDF5 files or from `safetensors` files whose tensor names follow Keras
//! layer naming.

pub mod error;
pub mod inference;
pub mod nn;
pub mod zoo;

pub use error::MlError;
pub use inference::{AppState, InferenceResult, ModelHandle, ModelState, Prediction};
pub use nn::{Architecture, Network};
pub use zoo::{BaseWeights, ExportFormat, ExportReport, ModelExporter, ModelSource};
