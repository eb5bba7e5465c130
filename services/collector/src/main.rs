mod app;
mod config;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use config::CollectorConfig;

#[derive(Debug, Parser)]
#[command(name = "collector", version, about = "Exchange market data collector")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "collector.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    let config = CollectorConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    fs::create_dir_all(&config.log_dir)
        .with_context(|| format!("creating log dir {}", config.log_dir.display()))?;

    // Dropping the guard flushes the file writer, so it lives until exit.
    let _guard = init_tracing(&config.log_dir)?;
    tracing::info!(config = %cli.config.display(), "Starting collector");

    app::run(config).await
}

/// Stdout plus `{log_dir}/collector.log`, filtered by `RUST_LOG` (default `info`).
fn init_tracing(log_dir: &Path) -> anyhow::Result<WorkerGuard> {
    let file = tracing_appender::rolling::never(log_dir, "collector.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .try_init()
        .context("installing tracing subscriber")?;
    Ok(guard)
}
