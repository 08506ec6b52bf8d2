//! Workflow Daemon - workflow executer service
//!
//! The daemon provides:
//! - Definition registration from a directory of JSON files
//! - Event processing from a JSON-lines stream (file or stdin)
//! - Published messages as JSON lines on stdout
//! - Optional loopback execution of dispatch and export requests

use clap::Parser;
use std::path::Path;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use workflow_daemon::{Daemon, DaemonConfig, DaemonError, DaemonResult, LoggingConfig};

/// Workflow Daemon CLI
#[derive(Parser)]
#[command(name = "workflowd")]
#[command(about = "Workflow Daemon - runs workflow instances from payload events", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "WORKFLOW_CONFIG")]
    config: Option<String>,

    /// Log level
    #[arg(long, env = "WORKFLOW_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, env = "WORKFLOW_LOG_JSON")]
    json: bool,

    /// Directory of workflow definition JSON files to register at startup
    #[arg(short, long, env = "WORKFLOW_DEFINITIONS")]
    definitions: Option<String>,

    /// JSON-lines file of inbound events; `-` reads stdin
    #[arg(short, long, env = "WORKFLOW_EVENTS")]
    events: Option<String>,

    /// Answer dispatch and export requests in-process
    #[arg(long)]
    loopback: bool,
}

fn init_tracing(logging: &LoggingConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| logging.level.clone().into());

    // Logs go to stderr; stdout carries published messages
    if logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> DaemonResult<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = DaemonConfig::load(cli.config.as_deref())
        .map_err(|e| DaemonError::Config(e.to_string()))?;

    // Override with CLI args
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if cli.json {
        config.logging.json = true;
    }

    init_tracing(&config.logging);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        loopback = cli.loopback,
        workflow_request = %config.messaging.topics.workflow_request,
        "Workflow daemon starting"
    );

    let daemon = Daemon::new(&config, cli.loopback);
    if let Some(dir) = &cli.definitions {
        let count = daemon.register_definitions(Path::new(dir)).await?;
        tracing::info!(count, directory = %dir, "Definitions registered");
    }

    daemon.run(cli.events.as_deref()).await?;
    Ok(())
}
