use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Portico — cloud-native API gateway
#[derive(Parser)]
#[command(name = "portico", version, about)]
struct Cli {
    /// Path to the static configuration file
    #[arg(short, long, default_value = "portico.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway in the foreground
    Start,
    /// Stop a running gateway via its pid file
    Stop,
    /// Ask a running gateway to reload its static configuration
    Reload,
    /// Print the gateway version
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Version => {
            println!("portico {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Command::Start => start(&cli).await,
        Command::Stop => signal_running_gateway(&cli, "TERM").await,
        Command::Reload => signal_running_gateway(&cli, "HUP").await,
    }
}

async fn start(cli: &Cli) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    tracing::info!("Portico v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&cli.config).await;
    let pid_file = config.pid_file.clone();

    let gateway = Arc::new(portico::Gateway::new(config)?);
    gateway.start().await?;

    std::fs::write(&pid_file, std::process::id().to_string())
        .map_err(|e| anyhow::anyhow!("Failed to write pid file {}: {}", pid_file, e))?;
    tracing::info!(pid_file, "Gateway ready — SIGTERM stops, SIGHUP reloads");

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sighup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = sigterm.recv() => break,
            _ = sighup.recv() => {
                tracing::info!(config = cli.config, "SIGHUP received, reloading configuration");
                let new_config = load_config(&cli.config).await;
                if let Err(e) = gateway.reload(new_config).await {
                    tracing::error!(error = %e, "Reload failed, previous configuration kept");
                }
            }
        }
    }

    gateway.shutdown().await;
    let _ = std::fs::remove_file(&pid_file);
    Ok(())
}

async fn load_config(path: &str) -> portico::config::GatewayConfig {
    if std::path::Path::new(path).exists() {
        match portico::config::GatewayConfig::from_file(path).await {
            Ok(config) => {
                tracing::info!(config = path, "Loaded configuration");
                return config;
            }
            Err(e) => {
                tracing::error!(config = path, error = %e, "Invalid configuration, using defaults");
            }
        }
    } else {
        tracing::warn!(config = path, "Config file not found, using defaults");
    }
    portico::config::GatewayConfig::default()
}

/// Send a signal to the pid recorded by a running `start` invocation
async fn signal_running_gateway(cli: &Cli, signal: &str) -> anyhow::Result<()> {
    let config = load_config(&cli.config).await;
    let pid_raw = std::fs::read_to_string(&config.pid_file).map_err(|e| {
        anyhow::anyhow!(
            "Cannot read pid file {} (is the gateway running?): {}",
            config.pid_file,
            e
        )
    })?;
    let pid: u32 = pid_raw
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("Pid file {} is corrupt", config.pid_file))?;

    let status = std::process::Command::new("kill")
        .arg(format!("-{}", signal))
        .arg(pid.to_string())
        .status()
        .map_err(|e| anyhow::anyhow!("Failed to run kill: {}", e))?;

    if !status.success() {
        anyhow::bail!("kill -{} {} failed", signal, pid);
    }
    println!("sent SIG{} to {}", signal, pid);
    Ok(())
}
