//! # deepfly-core
//!
//! Shared foundation for the DeepFly workspace: layered configuration,
//! error types, and the weight artifact fetcher used by both the `fetch`
//! command and the model hub cache.

pub mod config;
pub mod error;
pub mod fetch;

pub use config::{ChannelOrder, DeepflyConfig, load_config};
pub use error::{ConfigError, FetchError};
pub use fetch::{ArtifactFetcher, FetchOutcome, LogProgress, NoProgress, ProgressReporter};
