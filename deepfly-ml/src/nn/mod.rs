//! # Neural network
//!
//! A small inference-only runtime for the MesoNet family: channels-last
//! layer primitives on `ndarray`, the fixed sequential topologies,
//! safetensors weight I/O and Keras HDF5 import.

pub mod keras;
pub mod layers;
pub mod network;
pub mod weights;

pub use keras::load_keras_h5;
pub use layers::{Activation, Layer, Parameter};
pub use network::{Architecture, INPUT_CHANNELS, INPUT_SIZE, Network};
pub use weights::{WeightFormat, detect_format, load_safetensors, load_weights, save_safetensors};
