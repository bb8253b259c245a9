//! CLI subcommand handlers.

use crate::Commands;
use crate::ConfigAction;
use deepfly_core::config::{init_workspace_config, load_config};
use deepfly_core::fetch::percent_complete;
use deepfly_core::{ArtifactFetcher, DeepflyConfig, FetchOutcome, ProgressReporter};
use deepfly_ml::inference::{AppState, run};
use deepfly_ml::zoo::{BaseWeights, ExportReport, ModelExporter, ModelSource};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands, workspace: &Path) -> anyhow::Result<()> {
    match command {
        Commands::Serve {
            host,
            port,
            weights,
            arch,
            channel_order,
        } => {
            let mut config = load(workspace)?;
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(weights) = weights {
                config.model.weights_path = weights;
            }
            if let Some(arch) = arch {
                config.model.architecture = Some(arch.name().to_string());
            }
            if let Some(order) = channel_order {
                config.model.channel_order = order;
            }
            handle_serve(config, workspace).await
        }
        Commands::Fetch { url, output } => {
            let mut config = load(workspace)?;
            if let Some(url) = url {
                config.fetch.url = url;
            }
            if let Some(output) = output {
                config.fetch.destination = output;
            }
            handle_fetch(&config, workspace).await
        }
        Commands::Export {
            format,
            output,
            arch,
            seed,
            base_weights,
            hub,
            revision,
            filename,
        } => {
            let mut config = load(workspace)?;
            if let Some(format) = format {
                config.export.format = format;
            }
            if let Some(output) = output {
                config.export.output_dir = output;
            }
            let source = match hub {
                Some(repo_id) => ModelSource::Hub {
                    repo_id,
                    revision,
                    filename,
                },
                None => {
                    let base = match base_weights {
                        Some(path) => BaseWeights::Pretrained {
                            path: DeepflyConfig::resolve(workspace, &path),
                            seed,
                        },
                        None => BaseWeights::Random { seed },
                    };
                    ModelSource::Build {
                        architecture: arch,
                        base,
                    }
                }
            };
            handle_export(&config, &source, workspace).await
        }
        Commands::Config { action } => handle_config(action, workspace),
    }
}

fn load(workspace: &Path) -> anyhow::Result<DeepflyConfig> {
    load_config(Some(workspace), None).map_err(|e| anyhow::anyhow!("Configuration error: {}", e))
}

async fn handle_serve(config: DeepflyConfig, workspace: &Path) -> anyhow::Result<()> {
    let state = Arc::new(AppState::from_config(&config, workspace)?);
    if !state.model().is_loaded() {
        eprintln!("Warning: model not loaded; /predict will return errors until restart.");
    }
    println!(
        "DeepFly server listening on http://{}:{}",
        config.server.host, config.server.port
    );
    run(state, &config.server)
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))
}

/// Prints a single self-overwriting percentage line to stderr.
#[derive(Debug, Default)]
struct StderrProgress {
    printed: bool,
}

impl ProgressReporter for StderrProgress {
    fn on_progress(&mut self, downloaded: u64, total: Option<u64>) {
        let mut stderr = std::io::stderr();
        match percent_complete(downloaded, total) {
            Some(pct) => {
                let _ = write!(stderr, "\r -> {pct:.1}%");
            }
            None => {
                let _ = write!(stderr, "\r -> {downloaded} bytes");
            }
        }
        let _ = stderr.flush();
        self.printed = true;
    }
}

impl StderrProgress {
    fn finish(&self) {
        if self.printed {
            eprintln!();
        }
    }
}

async fn handle_fetch(config: &DeepflyConfig, workspace: &Path) -> anyhow::Result<()> {
    let destination = DeepflyConfig::resolve(workspace, &config.fetch.destination);
    let fetcher = ArtifactFetcher::from_config(&config.fetch)?;

    println!("Downloading {}", config.fetch.url);
    let mut progress = StderrProgress::default();
    let result = fetcher
        .fetch(&config.fetch.url, &destination, &mut progress)
        .await;
    progress.finish();

    match result? {
        FetchOutcome::AlreadyPresent => {
            println!("{} already exists, skipping.", destination.display());
        }
        FetchOutcome::Downloaded { bytes } => {
            println!("Saved {} ({} bytes)", destination.display(), bytes);
        }
    }
    Ok(())
}

async fn handle_export(
    config: &DeepflyConfig,
    source: &ModelSource,
    workspace: &Path,
) -> anyhow::Result<()> {
    let output_dir = DeepflyConfig::resolve(workspace, &config.export.output_dir);
    let exporter = ModelExporter::from_config(&config.export, &config.fetch, workspace)?;
    let report = exporter
        .build_and_export(source, &output_dir, &config.export.format)
        .await?;
    print_report(&report);
    Ok(())
}

fn print_report(report: &ExportReport) {
    println!(
        "Exported {} model as {} to {}",
        report.architecture,
        report.format,
        report.output_dir.display()
    );
    if report.used_fallback {
        println!("  (converted through an intermediate checkpoint)");
    }
    for file in &report.files {
        println!("  {:<32} {:>10} bytes", file.name, file.bytes);
    }
    println!("  {:<32} {:>10} bytes", "total", report.total_bytes);
}

fn handle_config(action: ConfigAction, workspace: &Path) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            match init_workspace_config(workspace)? {
                Some(path) => println!("Created default configuration at: {}", path.display()),
                None => println!(
                    "Configuration file already exists at: {}",
                    deepfly_core::config::workspace_config_path(workspace).display()
                ),
            }
            Ok(())
        }
        ConfigAction::Show => {
            let config = load(workspace)?;
            let toml_str = toml::to_string_pretty(&config)?;
            println!("{}", toml_str);
            Ok(())
        }
    }
}
