//! mqtt-sql - stores MQTT messages in SQL databases
//!
//! Module structure:
//! - `domain/` - merged routing model, timestamp formats
//! - `io/` - MQTT connections, database managers
//! - `services/` - message handler, service lifecycle
//! - `infra/` - configuration, logging, cancellation, backoff

use anyhow::Context;
use clap::Parser;
use mqtt_sql::infra::{logging, ServicePaths};
use mqtt_sql::services::{Service, ServiceSettings};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Subscribes to MQTT topics and writes every message into SQL tables
#[derive(Parser, Debug)]
#[command(name = "mqtt-sql", version, about)]
struct Args {
    /// Home directory holding config.json, logs.txt and the default SQLite file
    #[arg(long, env = "MQTTSQL_HOME")]
    home: Option<PathBuf>,

    /// Write logs to logs.txt in the home directory instead of stdout
    #[arg(long)]
    log_file: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let home = match args.home {
        Some(home) => home,
        None => std::env::current_dir().context("Failed to determine current directory")?,
    };
    let paths = ServicePaths::new(home);

    logging::init(args.log_file.then_some(paths.log_file.as_path()))?;

    info!(version = env!("CARGO_PKG_VERSION"), git_hash = env!("GIT_HASH"), "mqtt_sql_starting");

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown_signal_received");
                signal_token.cancel();
            }
            Err(e) => error!(error = %e, "shutdown_signal_listener_failed"),
        }
    });

    let service = Service::new(paths, ServiceSettings::default());
    service.run(shutdown).await
}
