//! DeepFly CLI: serve MesoNet predictions, fetch weights and export models.

mod commands;

use clap::Parser;
use deepfly_core::ChannelOrder;
use deepfly_ml::Architecture;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// DeepFly: deepfake detection with MesoNet
#[derive(Parser, Debug)]
#[command(name = "deepfly", version, about, long_about = None)]
struct Cli {
    /// Workspace directory; relative paths in the configuration resolve here
    #[arg(short, long, default_value = ".", global = true)]
    workspace: PathBuf,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the HTTP inference server
    Serve {
        /// Address to bind
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Weight artifact to load (.h5 or .safetensors)
        #[arg(long)]
        weights: Option<PathBuf>,

        /// Architecture override: meso4 or meso4-pair
        #[arg(long)]
        arch: Option<Architecture>,

        /// Channel order fed to the network: rgb or bgr
        #[arg(long)]
        channel_order: Option<ChannelOrder>,
    },
    /// Download the pretrained weight artifact
    Fetch {
        /// Source URL
        #[arg(long)]
        url: Option<String>,

        /// Destination file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Build a model and export it for browsers or mobile
    Export {
        /// Target format: tfjs (web), tflite (mobile) or safetensors
        #[arg(short, long)]
        format: Option<String>,

        /// Output directory (replaced if it exists)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Architecture to build: meso4 or meso4-pair
        #[arg(long, default_value = "meso4-pair")]
        arch: Architecture,

        /// Seed for freshly initialized weights
        #[arg(long, default_value_t = 0)]
        seed: u64,

        /// Weight artifact (.h5 or .safetensors) whose trunk seeds the network
        #[arg(long, conflicts_with = "hub")]
        base_weights: Option<PathBuf>,

        /// Export a hub model instead of building one (repo id)
        #[arg(long)]
        hub: Option<String>,

        /// Hub revision
        #[arg(long, default_value = "main")]
        revision: String,

        /// File within the hub repo
        #[arg(long, default_value = "model.safetensors")]
        filename: String,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Write the default config to <workspace>/.deepfly/config.toml
    Init,
    /// Print the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("dev", "deepfly", "deepfly")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "deepfly.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    commands::handle_command(cli.command, &workspace).await
}
