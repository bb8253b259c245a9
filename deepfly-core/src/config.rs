//! Configuration system for DeepFly.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment -> CLI args.
//! Configuration is loaded from `~/.config/deepfly/config.toml` and/or `.deepfly/config.toml`
//! in the workspace directory.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::ConfigError;

/// Upstream MesoNet weights trained on the Deepfake dataset.
pub const DEFAULT_WEIGHTS_URL: &str =
    "https://github.com/DariusAf/MesoNet/raw/master/weights/Meso4_DF.h5";

/// File the fetcher writes and the server loads by default.
pub const DEFAULT_WEIGHTS_FILE: &str = "Meso4_DF.h5";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeepflyConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub export: ExportConfig,
}

/// HTTP inference server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
    /// Maximum accepted request body, in bytes.
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            max_upload_bytes: 20 * 1024 * 1024,
        }
    }
}

/// Order in which color channels are fed to the network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelOrder {
    /// Natural decode order.
    Rgb,
    /// Reversed channels, matching the deployed MesoNet weights.
    #[default]
    Bgr,
}

impl fmt::Display for ChannelOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelOrder::Rgb => write!(f, "rgb"),
            ChannelOrder::Bgr => write!(f, "bgr"),
        }
    }
}

impl FromStr for ChannelOrder {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rgb" => Ok(ChannelOrder::Rgb),
            "bgr" => Ok(ChannelOrder::Bgr),
            other => Err(ConfigError::Invalid {
                message: format!("unknown channel order '{other}' (expected rgb or bgr)"),
            }),
        }
    }
}

/// Model loading settings for the inference server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Weight artifact loaded at startup.
    pub weights_path: PathBuf,
    /// Architecture override (`meso4` or `meso4-pair`). Detected from the
    /// artifact when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    /// Channel order applied during preprocessing.
    #[serde(default)]
    pub channel_order: ChannelOrder,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            weights_path: PathBuf::from(DEFAULT_WEIGHTS_FILE),
            architecture: None,
            channel_order: ChannelOrder::default(),
        }
    }
}

/// Weight artifact download settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Source URL.
    pub url: String,
    /// Destination file.
    pub destination: PathBuf,
    /// TCP connect timeout in seconds.
    pub connect_timeout_secs: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_WEIGHTS_URL.to_string(),
            destination: PathBuf::from(DEFAULT_WEIGHTS_FILE),
            connect_timeout_secs: 30,
        }
    }
}

/// Model build/convert settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Output directory. Deleted and recreated on every export.
    pub output_dir: PathBuf,
    /// Target format name (`tfjs` or `safetensors`).
    pub format: String,
    /// Local cache for artifacts pulled from a model hub.
    pub cache_dir: PathBuf,
    /// Base URL of the model hub.
    pub hub_endpoint: String,
    /// Maximum size of a single TF.js weight shard.
    pub shard_size_bytes: usize,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("assets/models/deepfake"),
            format: "tfjs".to_string(),
            cache_dir: PathBuf::from(".deepfly/hub_cache"),
            hub_endpoint: "https://huggingface.co".to_string(),
            shard_size_bytes: 4 * 1024 * 1024,
        }
    }
}

impl DeepflyConfig {
    /// Resolve a configured path against the workspace directory.
    ///
    /// Absolute paths are returned unchanged.
    pub fn resolve(workspace: &Path, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            workspace.join(path)
        }
    }
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `DEEPFLY_`)
/// 3. Workspace-local config (`.deepfly/config.toml`)
/// 4. User config (`~/.config/deepfly/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&DeepflyConfig>,
) -> Result<DeepflyConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(DeepflyConfig::default()));

    if let Some(config_dir) = directories::ProjectDirs::from("dev", "deepfly", "deepfly") {
        let user_config = config_dir.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = workspace_config_path(ws);
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // DEEPFLY_SERVER__PORT, DEEPFLY_MODEL__WEIGHTS_PATH, etc.
    figment = figment.merge(Env::prefixed("DEEPFLY_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(|e| ConfigError::Load {
        message: e.to_string(),
    })
}

/// Location of the workspace-level config file.
pub fn workspace_config_path(workspace: &Path) -> PathBuf {
    workspace.join(".deepfly").join("config.toml")
}

/// Write the default configuration to `<workspace>/.deepfly/config.toml`.
///
/// Returns `Ok(None)` when a config file already exists.
pub fn init_workspace_config(workspace: &Path) -> Result<Option<PathBuf>, ConfigError> {
    let config_path = workspace_config_path(workspace);
    if config_path.exists() {
        return Ok(None);
    }
    let toml_str =
        toml::to_string_pretty(&DeepflyConfig::default()).map_err(|e| ConfigError::Invalid {
            message: e.to_string(),
        })?;
    let write = || -> std::io::Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&config_path, toml_str)
    };
    write().map_err(|e| ConfigError::Load {
        message: format!("{}: {e}", config_path.display()),
    })?;
    Ok(Some(config_path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DeepflyConfig::default();
        assert_eq!(config.server.port, 5000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.model.weights_path, PathBuf::from("Meso4_DF.h5"));
        assert_eq!(config.model.channel_order, ChannelOrder::Bgr);
        assert!(config.model.architecture.is_none());
        assert_eq!(config.fetch.url, DEFAULT_WEIGHTS_URL);
        assert_eq!(config.export.format, "tfjs");
        assert_eq!(config.export.shard_size_bytes, 4 * 1024 * 1024);
    }

    #[test]
    fn test_server_loads_what_fetch_writes() {
        let config = DeepflyConfig::default();
        assert_eq!(config.model.weights_path, config.fetch.destination);
    }

    #[test]
    fn test_channel_order_parse() {
        assert_eq!("RGB".parse::<ChannelOrder>().unwrap(), ChannelOrder::Rgb);
        assert_eq!("bgr".parse::<ChannelOrder>().unwrap(), ChannelOrder::Bgr);
        assert!("grb".parse::<ChannelOrder>().is_err());
        assert_eq!(ChannelOrder::Rgb.to_string(), "rgb");
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let config = DeepflyConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: DeepflyConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(deserialized.server.port, config.server.port);
        assert_eq!(deserialized.fetch.destination, config.fetch.destination);
        assert_eq!(
            deserialized.model.channel_order,
            config.model.channel_order
        );
    }

    #[test]
    fn test_load_config_with_overrides() {
        let mut overrides = DeepflyConfig::default();
        overrides.server.port = 8088;
        overrides.model.channel_order = ChannelOrder::Rgb;

        let config = load_config(None, Some(&overrides)).unwrap();
        assert_eq!(config.server.port, 8088);
        assert_eq!(config.model.channel_order, ChannelOrder::Rgb);
    }

    #[test]
    fn test_load_config_from_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let deepfly_dir = dir.path().join(".deepfly");
        std::fs::create_dir_all(&deepfly_dir).unwrap();
        std::fs::write(
            deepfly_dir.join("config.toml"),
            r#"
[server]
host = "127.0.0.1"
port = 6001
max_upload_bytes = 1024

[model]
weights_path = "weights/custom.safetensors"
architecture = "meso4-pair"
channel_order = "rgb"
"#,
        )
        .unwrap();

        let config = load_config(Some(dir.path()), None).unwrap();
        assert_eq!(config.server.port, 6001);
        assert_eq!(config.server.max_upload_bytes, 1024);
        assert_eq!(config.model.architecture.as_deref(), Some("meso4-pair"));
        assert_eq!(config.model.channel_order, ChannelOrder::Rgb);
        // Sections missing from the file keep their defaults.
        assert_eq!(config.export.format, "tfjs");
    }

    #[test]
    fn test_resolve_relative_and_absolute() {
        let ws = Path::new("/srv/deepfly");
        assert_eq!(
            DeepflyConfig::resolve(ws, Path::new("Meso4_DF.h5")),
            PathBuf::from("/srv/deepfly/Meso4_DF.h5")
        );
        assert_eq!(
            DeepflyConfig::resolve(ws, Path::new("/opt/w.safetensors")),
            PathBuf::from("/opt/w.safetensors")
        );
    }

    #[test]
    fn test_init_workspace_config_once() {
        let dir = tempfile::tempdir().unwrap();
        let created = init_workspace_config(dir.path()).unwrap();
        assert!(created.is_some());
        assert!(workspace_config_path(dir.path()).exists());

        let again = init_workspace_config(dir.path()).unwrap();
        assert!(again.is_none());

        let config = load_config(Some(dir.path()), None).unwrap();
        assert_eq!(config.server.port, 5000);
    }
}
