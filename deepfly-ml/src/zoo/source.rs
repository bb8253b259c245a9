//! Where an exported model comes from: built locally or pulled from a hub.

use crate::error::MlError;
use crate::nn::weights::copy_trunk;
use crate::nn::{Architecture, Network, load_weights};
use deepfly_core::{ArtifactFetcher, FetchOutcome, LogProgress};
use std::path::PathBuf;
use tracing::info;

/// Weights for the network's convolutional trunk.
#[derive(Debug, Clone, PartialEq)]
pub enum BaseWeights {
    /// Glorot-uniform kernels drawn from `seed`.
    Random { seed: u64 },
    /// Trunk copied from an existing `.h5` or `.safetensors` artifact; the
    /// head is drawn from `seed`.
    Pretrained { path: PathBuf, seed: u64 },
}

/// Model to export.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelSource {
    Build {
        architecture: Architecture,
        base: BaseWeights,
    },
    /// A weight artifact published on a model hub.
    Hub {
        repo_id: String,
        revision: String,
        filename: String,
    },
}

/// Local cache of hub artifacts, keyed by repo, revision and filename.
#[derive(Debug, Clone)]
pub struct HubCache {
    endpoint: String,
    cache_dir: PathBuf,
    fetcher: ArtifactFetcher,
}

impl HubCache {
    pub fn new(endpoint: impl Into<String>, cache_dir: impl Into<PathBuf>, fetcher: ArtifactFetcher) -> Self {
        Self {
            endpoint: endpoint.into(),
            cache_dir: cache_dir.into(),
            fetcher,
        }
    }

    /// Download URL of a file at a given revision.
    pub fn resolve_url(&self, repo_id: &str, revision: &str, filename: &str) -> String {
        format!(
            "{}/{repo_id}/resolve/{revision}/{filename}",
            self.endpoint.trim_end_matches('/')
        )
    }

    /// Where a file lives once cached.
    pub fn cache_path(&self, repo_id: &str, revision: &str, filename: &str) -> PathBuf {
        self.cache_dir
            .join(repo_id.replace('/', "--"))
            .join(revision)
            .join(filename)
    }

    /// Return the cached path, downloading the file on a cache miss.
    pub async fn fetch(&self, repo_id: &str, revision: &str, filename: &str) -> Result<PathBuf, MlError> {
        if repo_id.is_empty() || revision.is_empty() || filename.is_empty() {
            return Err(MlError::invalid_input(
                "hub source needs a repo id, a revision and a filename",
            ));
        }
        let destination = self.cache_path(repo_id, revision, filename);
        let url = self.resolve_url(repo_id, revision, filename);
        let outcome = self
            .fetcher
            .fetch(&url, &destination, &mut LogProgress::default())
            .await?;
        match outcome {
            FetchOutcome::AlreadyPresent => info!(path = %destination.display(), "Hub cache hit"),
            FetchOutcome::Downloaded { bytes } => {
                info!(repo_id, revision, filename, bytes, "Downloaded hub artifact")
            }
        }
        Ok(destination)
    }
}

impl ModelSource {
    /// Materialize the network this source describes.
    pub async fn acquire(&self, hub: &HubCache) -> Result<Network, MlError> {
        match self {
            ModelSource::Build { architecture, base } => build(*architecture, base),
            ModelSource::Hub {
                repo_id,
                revision,
                filename,
            } => {
                let path = hub.fetch(repo_id, revision, filename).await?;
                load_weights(&path, None)
            }
        }
    }
}

fn build(architecture: Architecture, base: &BaseWeights) -> Result<Network, MlError> {
    match base {
        BaseWeights::Random { seed } => {
            info!(%architecture, seed, "Building network with random weights");
            Ok(Network::random(architecture, *seed))
        }
        BaseWeights::Pretrained { path, seed } => {
            let pretrained = load_weights(path, None)?;
            let mut network = Network::random(architecture, *seed);
            let copied = copy_trunk(&pretrained, &mut network)?;
            info!(
                %architecture,
                base = %path.display(),
                tensors = copied,
                "Seeded trunk from pretrained weights"
            );
            Ok(network)
        }
    }
}
