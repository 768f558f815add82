// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! HAMcast middleware daemon
//!
//! Serves client stub libraries on the local host. Clients find the
//! daemon through the discovery file it writes into the meeting-point
//! directory.
//!
//! # Usage
//!
//! ```bash
//! # Ephemeral port, one loopback interface
//! hamcast-middleware
//!
//! # Fixed port, two loopback interfaces
//! hamcast-middleware --port 4711 --loopback lo0 --loopback lo1
//!
//! # JSON configuration
//! hamcast-middleware --config middleware.json --log-level debug
//! ```

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::mpsc;

use clap::Parser;
use hamcast::{Middleware, MiddlewareConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// HAMcast middleware - multicast for local client applications
#[derive(Parser, Debug)]
#[command(name = "hamcast-middleware")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TCP port to listen on (0 = ephemeral)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Bind address
    #[arg(short, long, default_value = "127.0.0.1")]
    bind: IpAddr,

    /// Configuration file (JSON format); overrides the other options
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory of the discovery file
    #[arg(long)]
    meeting_point: Option<PathBuf>,

    /// Loopback interface to start (repeatable)
    #[arg(long = "loopback", default_value = "lo")]
    loopback: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn middleware_config(&self) -> Result<MiddlewareConfig, Box<dyn std::error::Error>> {
        if let Some(path) = &self.config {
            info!("Loading config from {:?}", path);
            return Ok(MiddlewareConfig::from_json_file(path)?);
        }
        let mut config = MiddlewareConfig {
            bind: self.bind,
            port: self.port,
            loopback_interfaces: self.loopback.clone(),
            ..Default::default()
        };
        if let Some(dir) = &self.meeting_point {
            config.meeting_point = dir.clone();
        }
        Ok(config)
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // RUST_LOG wins over --log-level; library `log` records are bridged.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("hamcast={0},hamcast_middleware={0}", args.log_level)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(true)
        .try_init()
        .map_err(|e| -> Box<dyn std::error::Error> { e })?;

    let config = args.middleware_config()?;
    let middleware = Middleware::bind(config.clone())?;

    info!("+----------------------------------------------------+");
    info!(
        "|       HAMcast middleware v{}                    |",
        env!("CARGO_PKG_VERSION")
    );
    info!("+----------------------------------------------------+");
    info!("|  Listen:     {:37} |", middleware.local_addr());
    info!("|  Meeting:    {:37} |", config.meeting_point.display());
    info!("|  Interfaces: {:37} |", config.loopback_interfaces.join(", "));
    info!("+----------------------------------------------------+");

    let (stop_tx, stop_rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })?;

    let _ = stop_rx.recv();
    info!("Shutdown signal received, stopping middleware...");
    middleware.shutdown();

    info!("Middleware stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let args = Args::parse_from(["hamcast-middleware"]);
        let config = args.middleware_config().unwrap();
        assert_eq!(config.port, 0);
        assert_eq!(config.loopback_interfaces, vec!["lo".to_string()]);
    }

    #[test]
    fn test_cli_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let args = Args::parse_from([
            "hamcast-middleware",
            "--port",
            "4711",
            "--loopback",
            "a",
            "--loopback",
            "b",
            "--meeting-point",
            dir.path().to_str().unwrap(),
        ]);
        let config = args.middleware_config().unwrap();
        assert_eq!(config.port, 4711);
        assert_eq!(config.loopback_interfaces, vec!["a", "b"]);
        assert_eq!(config.meeting_point, dir.path());
    }
}
