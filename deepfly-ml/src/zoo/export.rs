//! Build-and-export pipeline for deployable model artifacts.
//!
//! The output directory is wiped and recreated on every run, so pointing it
//! at a directory holding anything else destroys that content.

use super::source::{HubCache, ModelSource};
use super::tfjs::{self, DEFAULT_SHARD_SIZE};
use super::tflite::{self, TFLITE_FILE};
use crate::error::MlError;
use crate::nn::weights::{load_safetensors, save_safetensors};
use crate::nn::{Architecture, Network};
use deepfly_core::config::{ExportConfig, FetchConfig};
use deepfly_core::{ArtifactFetcher, DeepflyConfig};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{info, warn};

/// Intermediate artifact used by the fallback conversion path.
pub const CHECKPOINT_FILE: &str = "checkpoint.safetensors";

/// File written for the flat safetensors target.
pub const SAFETENSORS_FILE: &str = "model.safetensors";

/// Deployable artifact formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExportFormat {
    /// TF.js layers bundle for browsers.
    Tfjs,
    /// TensorFlow Lite flatbuffer for on-device inference.
    Tflite,
    /// Single safetensors file for native runtimes and the server.
    #[serde(rename = "safetensors")]
    SafeTensors,
}

impl ExportFormat {
    pub fn name(self) -> &'static str {
        match self {
            ExportFormat::Tfjs => "tfjs",
            ExportFormat::Tflite => "tflite",
            ExportFormat::SafeTensors => "safetensors",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ExportFormat {
    type Err = MlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tfjs" | "web" | "graph-bundle-for-web" | "layers-model" => Ok(ExportFormat::Tfjs),
            "tflite" | "mobile" => Ok(ExportFormat::Tflite),
            "safetensors" => Ok(ExportFormat::SafeTensors),
            other => Err(MlError::conversion(format!(
                "unsupported export format '{other}' (expected tfjs, tflite or safetensors)"
            ))),
        }
    }
}

/// One file in the output directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportedFile {
    pub name: String,
    pub bytes: u64,
}

/// Summary of a finished export.
#[derive(Debug, Clone, Serialize)]
pub struct ExportReport {
    pub output_dir: PathBuf,
    pub format: ExportFormat,
    pub architecture: Architecture,
    /// Sorted by name.
    pub files: Vec<ExportedFile>,
    pub total_bytes: u64,
    /// Whether the primary conversion failed and the checkpoint path ran.
    pub used_fallback: bool,
}

/// Turns a [`ModelSource`] into artifacts on disk.
#[derive(Debug, Clone)]
pub struct ModelExporter {
    hub: HubCache,
    shard_size_bytes: usize,
}

impl ModelExporter {
    pub fn new(hub: HubCache) -> Self {
        Self {
            hub,
            shard_size_bytes: DEFAULT_SHARD_SIZE,
        }
    }

    pub fn with_shard_size(mut self, shard_size_bytes: usize) -> Self {
        self.shard_size_bytes = shard_size_bytes;
        self
    }

    /// Build an exporter from configuration, resolving the hub cache
    /// directory against `workspace`.
    pub fn from_config(
        export: &ExportConfig,
        fetch: &FetchConfig,
        workspace: &Path,
    ) -> Result<Self, MlError> {
        let fetcher = ArtifactFetcher::from_config(fetch)?;
        let cache_dir = DeepflyConfig::resolve(workspace, &export.cache_dir);
        let hub = HubCache::new(export.hub_endpoint.clone(), cache_dir, fetcher);
        Ok(Self::new(hub).with_shard_size(export.shard_size_bytes))
    }

    /// Acquire the model, then replace `output_dir` with its exported form.
    pub async fn build_and_export(
        &self,
        source: &ModelSource,
        output_dir: &Path,
        target_format: &str,
    ) -> Result<ExportReport, MlError> {
        let format: ExportFormat = target_format.parse()?;
        let network = source.acquire(&self.hub).await?;

        if output_dir.exists() {
            warn!(path = %output_dir.display(), "Replacing existing output directory");
            std::fs::remove_dir_all(output_dir)?;
        }
        std::fs::create_dir_all(output_dir)?;

        let used_fallback = convert_with_fallback(&network, output_dir, |net, dir| {
            self.convert(net, dir, format)
        })?;

        let files = list_files(output_dir)?;
        let total_bytes = files.iter().map(|f| f.bytes).sum();
        for file in &files {
            info!(file = %file.name, bytes = file.bytes, "Exported");
        }
        info!(
            path = %output_dir.display(),
            %format,
            files = files.len(),
            total_bytes,
            "Export complete"
        );

        Ok(ExportReport {
            output_dir: output_dir.to_path_buf(),
            format,
            architecture: network.architecture(),
            files,
            total_bytes,
            used_fallback,
        })
    }

    fn convert(&self, network: &Network, dir: &Path, format: ExportFormat) -> Result<(), MlError> {
        match format {
            ExportFormat::Tfjs => {
                tfjs::write_layers_model(network, dir, self.shard_size_bytes)?;
            }
            ExportFormat::Tflite => {
                tflite::write_tflite(network, &dir.join(TFLITE_FILE))?;
            }
            ExportFormat::SafeTensors => {
                save_safetensors(network, &dir.join(SAFETENSORS_FILE))?;
            }
        }
        Ok(())
    }
}

/// Run `convert`; on failure retry once from a reloaded safetensors
/// checkpoint. Returns whether the fallback was needed.
fn convert_with_fallback<F>(network: &Network, dir: &Path, mut convert: F) -> Result<bool, MlError>
where
    F: FnMut(&Network, &Path) -> Result<(), MlError>,
{
    let primary = match convert(network, dir) {
        Ok(()) => return Ok(false),
        Err(e) => e,
    };
    warn!(error = %primary, "Direct conversion failed, retrying through a checkpoint");

    let checkpoint = dir.join(CHECKPOINT_FILE);
    let retried = save_safetensors(network, &checkpoint)
        .and_then(|_| load_safetensors(&checkpoint, Some(network.architecture())))
        .and_then(|reloaded| convert(&reloaded, dir));
    if checkpoint.exists() {
        std::fs::remove_file(&checkpoint)?;
    }

    retried.map(|()| true).map_err(|fallback| {
        MlError::conversion(format!(
            "conversion failed ({primary}); checkpoint fallback failed ({fallback})"
        ))
    })
}

fn list_files(dir: &Path) -> Result<Vec<ExportedFile>, MlError> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if meta.is_file() {
            files.push(ExportedFile {
                name: entry.file_name().to_string_lossy().into_owned(),
                bytes: meta.len(),
            });
        }
    }
    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zoo::source::BaseWeights;
    use std::time::Duration;

    fn exporter(dir: &Path) -> ModelExporter {
        let fetcher = ArtifactFetcher::new(Duration::from_secs(1)).unwrap();
        ModelExporter::new(HubCache::new("http://127.0.0.1:9", dir.join("cache"), fetcher))
    }

    fn random_source(architecture: Architecture) -> ModelSource {
        ModelSource::Build {
            architecture,
            base: BaseWeights::Random { seed: 3 },
        }
    }

    #[test]
    fn test_format_aliases() {
        assert_eq!("web".parse::<ExportFormat>().unwrap(), ExportFormat::Tfjs);
        assert_eq!(
            "graph-bundle-for-web".parse::<ExportFormat>().unwrap(),
            ExportFormat::Tfjs
        );
        assert_eq!(
            "Mobile".parse::<ExportFormat>().unwrap(),
            ExportFormat::Tflite
        );
        assert_eq!(
            "safetensors".parse::<ExportFormat>().unwrap(),
            ExportFormat::SafeTensors
        );
        assert!(matches!(
            "onnx".parse::<ExportFormat>(),
            Err(MlError::Conversion(_))
        ));
    }

    #[tokio::test]
    async fn test_unsupported_format_leaves_output_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        std::fs::create_dir_all(&out).unwrap();
        std::fs::write(out.join("keep.txt"), b"keep").unwrap();

        let err = exporter(dir.path())
            .build_and_export(&random_source(Architecture::Meso4), &out, "onnx")
            .await
            .unwrap_err();
        assert!(matches!(err, MlError::Conversion(_)));
        assert_eq!(std::fs::read(out.join("keep.txt")).unwrap(), b"keep");
    }

    #[tokio::test]
    async fn test_export_replaces_directory() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        std::fs::create_dir_all(&out).unwrap();
        std::fs::write(out.join("stale.bin"), b"old").unwrap();

        let report = exporter(dir.path())
            .build_and_export(&random_source(Architecture::Meso4), &out, "safetensors")
            .await
            .unwrap();
        assert!(!out.join("stale.bin").exists());
        assert!(!report.used_fallback);
        assert_eq!(report.format, ExportFormat::SafeTensors);
        assert_eq!(report.files.len(), 1);
        assert_eq!(report.files[0].name, SAFETENSORS_FILE);
        assert_eq!(report.total_bytes, report.files[0].bytes);
    }

    #[tokio::test]
    async fn test_mobile_export_writes_tflite() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("mobile");
        let report = exporter(dir.path())
            .build_and_export(&random_source(Architecture::Meso4Pair), &out, "mobile")
            .await
            .unwrap();
        assert_eq!(report.format, ExportFormat::Tflite);
        assert_eq!(report.files.len(), 1);
        assert_eq!(report.files[0].name, TFLITE_FILE);
        let bytes = std::fs::read(out.join(TFLITE_FILE)).unwrap();
        assert_eq!(&bytes[4..8], b"TFL3");
        assert_eq!(report.total_bytes, bytes.len() as u64);
    }

    #[tokio::test]
    async fn test_export_tfjs_files_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("web");
        let report = exporter(dir.path())
            .with_shard_size(32 * 1024)
            .build_and_export(&random_source(Architecture::Meso4), &out, "tfjs")
            .await
            .unwrap();
        let names: Vec<&str> = report.files.iter().map(|f| f.name.as_str()).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        assert!(names.contains(&"model.json"));
        assert!(names.iter().any(|n| n.starts_with("group1-shard1of")));
    }

    #[test]
    fn test_fallback_used_once_and_checkpoint_removed() {
        let dir = tempfile::tempdir().unwrap();
        let network = Network::random(Architecture::Meso4, 1);
        let mut calls = 0;
        let used = convert_with_fallback(&network, dir.path(), |net, out| {
            calls += 1;
            if calls == 1 {
                return Err(MlError::conversion("first attempt"));
            }
            save_safetensors(net, &out.join(SAFETENSORS_FILE)).map(|_| ())
        })
        .unwrap();
        assert!(used);
        assert_eq!(calls, 2);
        assert!(!dir.path().join(CHECKPOINT_FILE).exists());
        assert!(dir.path().join(SAFETENSORS_FILE).exists());
    }

    #[test]
    fn test_fallback_failure_is_conversion_error() {
        let dir = tempfile::tempdir().unwrap();
        let network = Network::new(Architecture::Meso4);
        let err = convert_with_fallback(&network, dir.path(), |_, _| {
            Err(MlError::conversion("always"))
        })
        .unwrap_err();
        assert!(matches!(err, MlError::Conversion(_)));
        assert!(!dir.path().join(CHECKPOINT_FILE).exists());
    }
}
