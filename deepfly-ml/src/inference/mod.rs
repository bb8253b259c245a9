//! Image-to-score inference: preprocessing, the loaded model handle and the
//! HTTP server that exposes it.

pub mod engine;
pub mod prediction;
pub mod preprocess;
pub mod server;

pub use engine::{InferenceResult, ModelHandle, ModelState};
pub use prediction::{Prediction, score_from_probability};
pub use preprocess::preprocess;
pub use server::{ApiError, AppState, SharedState, router, run};
