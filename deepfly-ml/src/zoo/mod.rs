//! Model zoo: model sources, hub cache and deployable exports (TF.js,
//! TFLite and safetensors).

pub mod export;
pub mod source;
pub mod tfjs;
pub mod tflite;

pub use export::{ExportFormat, ExportReport, ExportedFile, ModelExporter};
pub use source::{BaseWeights, HubCache, ModelSource};
pub use tfjs::{read_layers_model, write_layers_model};
pub use tflite::{to_tflite_bytes, write_tflite};
