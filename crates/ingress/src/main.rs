//! Wharf - Main entry point
//!
//! Ingress controller for containerized services with automatic ACME
//! certificates.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use tracing::info;

use wharf_config::Config;
use wharf_ingress::acme::RevocationReason;
use wharf_ingress::Wharf;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

/// Wharf - container ingress with automatic ACME certificates
#[derive(Parser, Debug)]
#[command(name = "wharf")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config", env = "WHARF_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose", global = true)]
    verbose: bool,

    /// Log output format
    #[arg(long = "log-format", value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller, reading container events from stdin (default)
    Run,
    /// Validate configuration and exit
    Check,
    /// Renew the certificate of one domain now
    Renew {
        domain: String,
    },
    /// Revoke the stored certificate of one domain
    Revoke {
        domain: String,
        /// unspecified, key-compromise, affiliation-changed, superseded,
        /// cessation-of-operation
        #[arg(long = "reason", value_parser = parse_reason)]
        reason: Option<RevocationReason>,
    },
}

fn parse_reason(s: &str) -> Result<RevocationReason, String> {
    s.parse()
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Check => check_config(cli.config.as_deref()),
        Commands::Run => runtime()?.block_on(run(cli.config.as_deref())),
        Commands::Renew { domain } => runtime()?.block_on(renew(cli.config.as_deref(), &domain)),
        Commands::Revoke { domain, reason } => {
            runtime()?.block_on(revoke(cli.config.as_deref(), &domain, reason))
        }
    }
}

fn init_logging(verbose: bool, format: LogFormat) {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    Config::load(path).context("Failed to load configuration")
}

/// Validate configuration and exit
fn check_config(path: Option<&Path>) -> Result<()> {
    let config = load_config(path)?;

    info!("Configuration test successful:");
    info!("  - directory: {}", config.acme.directory_url);
    info!(
        "  - self-signed: {}",
        if config.self_signed.signing_ca().is_some() {
            "signed by configured CA"
        } else {
            "self-issued"
        }
    );
    info!("  - storage: {}", config.storage.path.display());
    info!(
        "  - responder: {}",
        if config.responder.enabled {
            config.responder.listen.as_str()
        } else {
            "disabled"
        }
    );

    println!(
        "wharf: configuration {} test is successful",
        path.map(|p| p.display().to_string())
            .unwrap_or_else(|| "(defaults)".to_string())
    );
    Ok(())
}

async fn run(path: Option<&Path>) -> Result<()> {
    let wharf = Wharf::open(load_config(path)?)?;
    let events = tokio::io::BufReader::new(tokio::io::stdin());
    wharf.run(events, shutdown_signal()).await
}

async fn renew(path: Option<&Path>, domain: &str) -> Result<()> {
    let wharf = Wharf::open(load_config(path)?)?;
    let outcome = wharf.renew(domain).await?;
    println!("wharf: {}: {:?}", domain, outcome);
    if outcome.is_issued() {
        Ok(())
    } else {
        anyhow::bail!("certificate for {} was not renewed", domain)
    }
}

async fn revoke(path: Option<&Path>, domain: &str, reason: Option<RevocationReason>) -> Result<()> {
    let wharf = Wharf::open(load_config(path)?)?;
    wharf.revoke(domain, reason).await?;
    println!("wharf: certificate for {} revoked", domain);
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
