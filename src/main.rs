//! jaild - log-driven intrusion prevention daemon.
//!
//! Tails authentication logs through per-jail filters, bans repeat
//! offenders via configurable actions, and serves a local control socket.

mod action;
mod banmanager;
mod config;
mod db;
mod error;
mod failmanager;
mod filter;
mod ip;
mod jail;
mod mytime;
mod network;
mod observer;
mod server;
mod telemetry;
mod ticket;
mod transmitter;

use std::path::Path;
use std::sync::Arc;

use tracing::{error, info};

use crate::config::Config;
use crate::server::Server;
use crate::telemetry::{LogTarget, Telemetry};

/// Resolve the configuration path from CLI arguments.
/// Supports `-c <path>`, `--config <path>`, or a bare path.
/// Falls back to `config.toml` when no argument is provided.
fn resolve_config_path() -> String {
    let mut args = std::env::args().skip(1);

    let raw_path = match args.next() {
        Some(flag) if flag == "-c" || flag == "--config" => args.next().unwrap_or_else(|| {
            eprintln!("Missing path after {}", flag);
            std::process::exit(1);
        }),
        Some(path) => path,
        None => "config.toml".to_string(),
    };

    match std::fs::canonicalize(Path::new(&raw_path)) {
        Ok(p) => p.to_string_lossy().into_owned(),
        Err(_) => raw_path,
    }
}

fn write_pidfile(path: &str) {
    if let Some(parent) = Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Err(e) = std::fs::write(path, format!("{}\n", std::process::id())) {
        error!(pidfile = %path, error = %e, "Failed to write pidfile");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration first (before tracing, so we can use its settings)
    let config_path = resolve_config_path();
    let config = Config::load(&config_path).map_err(|e| {
        eprintln!("ERROR: Failed to load config from {}: {}", config_path, e);
        e
    })?;

    if let Err(errors) = config::validate(&config) {
        for err in &errors {
            eprintln!("ERROR: {}", err);
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    let level = jail_proto::LogLevel::parse(&config.server.loglevel)
        .expect("level validated above");
    let telemetry = Telemetry::init(
        level,
        LogTarget::parse(&config.server.logtarget),
        config.server.log_format,
    );

    info!(
        version = %env!("CARGO_PKG_VERSION"),
        socket = %config.server.socket,
        "Starting jaild"
    );

    let server = Server::new(telemetry);
    server.set_allow_ipv6(config.allow_ipv6().expect("validated above"));

    if let Some(db) = &config.database {
        server.set_db_file(Some(&db.path)).await?;
        server.set_db_purge_age(db.purge_age);
        server.set_db_max_matches(db.max_matches);
    }

    write_pidfile(&config.server.pidfile);

    // Graceful shutdown on SIGINT/SIGTERM
    {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
            let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

            tokio::select! {
                _ = sigint.recv() => info!("Received SIGINT - initiating graceful shutdown"),
                _ = sigterm.recv() => info!("Received SIGTERM - initiating graceful shutdown"),
            }
            server.quit().await;
        });
    }

    // The accept loop runs until `stop` or a signal shuts the server down.
    let result = network::serve(Path::new(&config.server.socket), server).await;

    // Give connection handlers a moment to flush their last reply
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;

    let _ = std::fs::remove_file(&config.server.pidfile);
    info!("jaild stopped");
    result?;
    Ok(())
}
