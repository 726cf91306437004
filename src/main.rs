//! Argus Binary Entry Point
//!
//! Runs the active check agent. Core functionality is provided by the
//! `argus` library crate.

use clap::Parser;
use argus::{AgentBuilder, AgentHandles, AppConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Argus - Active Check Telemetry Agent
#[derive(Parser, Debug)]
#[command(name = "argus", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        default_value = "configs/agent.yaml",
        env = "ARGUS_CONFIG"
    )]
    config: String,

    /// Host name reported with every item (overrides config file)
    #[arg(long, env = "ARGUS_HOSTNAME")]
    hostname: Option<String>,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

impl Cli {
    /// Load the configuration file and apply CLI/env overrides (CLI > ENV > config file).
    fn load_config(&self) -> Result<AppConfig, argus::ConfigError> {
        let mut config = AppConfig::load_with_metric_path(&self.config)?;
        if let Some(hostname) = &self.hostname {
            config.agent.hostname = hostname.clone();
            config.validate()?;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,argus=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Argus - Active Check Telemetry Agent");

    let cli = Cli::parse();

    tracing::info!(path = %cli.config, "Loading configuration");
    let config = cli.load_config()?;

    if cli.check {
        tracing::info!(metrics = config.metrics.len(), "Configuration is valid");
        return Ok(());
    }

    tracing::info!(
        hostname = %config.agent.hostname,
        forward = %config.agent.forward,
        servers = ?config.server.addresses,
        endpoints = config.connectors.endpoints.len(),
        "Configuration loaded"
    );

    let handles = AgentBuilder::new(config).build()?;
    tracing::info!("Press Ctrl+C to shutdown");

    wait_for_shutdown(&cli, &handles).await?;

    tracing::info!("Shutting down agent...");
    handles.shutdown().await;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM, reloading on SIGHUP in the meantime.
async fn wait_for_shutdown(cli: &Cli, handles: &AgentHandles) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut terminate = signal(SignalKind::terminate())?;
        let mut hangup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    result?;
                    tracing::info!("Received Ctrl+C signal");
                    return Ok(());
                }
                _ = terminate.recv() => {
                    tracing::info!("Received terminate signal");
                    return Ok(());
                }
                _ = hangup.recv() => reload(cli, handles),
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = (cli, handles);
        tokio::signal::ctrl_c().await?;
        tracing::info!("Received Ctrl+C signal");
        Ok(())
    }
}

/// Re-read the configuration file; a failed reload keeps the running configuration.
#[cfg(unix)]
fn reload(cli: &Cli, handles: &AgentHandles) {
    tracing::info!(path = %cli.config, "Received hangup signal, reloading configuration");

    match cli.load_config().and_then(|config| handles.reload(&config).map(|()| config)) {
        Ok(config) => tracing::info!(
            metrics = config.metrics.len(),
            workers = config.connectors.workers,
            "Configuration reloaded"
        ),
        Err(e) => tracing::error!(error = %e, "Configuration reload failed, keeping previous configuration"),
    }
}
