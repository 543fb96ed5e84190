use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use gitsshd::config::{read_config, validate_config};
use gitsshd::{Config, GitSshServer};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "gitsshd", about = "Loopback SSH server for Git clients")]
struct Cli {
    /// Path to a YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory to serve.  Overrides `workdir` from the config file.
    #[arg(short, long)]
    workdir: Option<PathBuf>,

    /// Loopback port to listen on (0 = OS-assigned).
    #[arg(short, long)]
    port: Option<u16>,

    /// Delay applied before every command spawn, in milliseconds.
    #[arg(long)]
    exec_delay_ms: Option<u64>,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

fn build_config(cli: &Cli) -> Result<Config> {
    let mut config = match (&cli.config, &cli.workdir) {
        (Some(path), _) => read_config(path)?,
        (None, Some(workdir)) => Config::new(workdir),
        (None, None) => bail!("either --config or --workdir is required"),
    };
    if let Some(workdir) = &cli.workdir {
        config.workdir = workdir.clone();
    }
    if let Some(port) = cli.port {
        config.listen_port = port;
    }
    if let Some(ms) = cli.exec_delay_ms {
        config.exec_delay_ms = ms;
    }
    validate_config(&config)?;
    Ok(config)
}

fn init_tracing(format: LogFormat) {
    let json = format == LogFormat::Json;
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(|| tracing_subscriber::fmt::layer()))
        .init();
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async { signal::ctrl_c().await.context("failed to listen for Ctrl+C") };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("failed to install SIGTERM handler")?
            .recv()
            .await;
        Ok::<(), anyhow::Error>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<()>>();

    tokio::select! {
        res = ctrl_c => {
            res?;
            tracing::info!("received SIGINT");
        }
        res = terminate => {
            res?;
            tracing::info!("received SIGTERM");
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = build_config(&cli)?;
    let server = GitSshServer::start_with_config(config).await?;

    println!("url:             {}", server.url());
    println!("known_hosts:     {}", server.known_hosts_path().display());
    println!("client key:      {}", server.client_key_path().display());
    println!("GIT_SSH_COMMAND: {}", server.git_ssh_command());

    let waited = shutdown_signal().await;
    server.close().await?;
    waited?;

    tracing::info!("gitsshd shut down cleanly");
    Ok(())
}
