//! # Server Binary
//!
//! Bootstrap only: flag parsing, logging setup, signal handling. The
//! interesting parts all live in the library crate.

use std::env;
use std::process;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use fkv_server::config::{self, ServerConfig};
use fkv_server::Server;

const USAGE: &str = "\
flarekv - in-memory Redis-compatible key/value store with pub/sub

USAGE:
    fkv-server [OPTIONS]

OPTIONS:
    -p, --port <PORT>    TCP port to listen on (default 6380, or
                         REDIS_PORT / PORT from the environment)
        --help           Print this help and exit
        --version        Print the version and exit
";

/// Scans the argument list; help/version/unknown flags exit here.
fn parse_cli_port() -> Option<u16> {
    let mut port = None;
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" => {
                print!("{USAGE}");
                process::exit(0);
            }
            "--version" => {
                println!("fkv-server {}", env!("CARGO_PKG_VERSION"));
                process::exit(0);
            }
            "-p" | "--port" => {
                let value = match args.next() {
                    Some(value) => value,
                    None => {
                        eprintln!("missing value for {arg}");
                        process::exit(1);
                    }
                };
                match config::parse_port(&value) {
                    Ok(parsed) => port = Some(parsed),
                    Err(()) => {
                        eprintln!("invalid port: {value}");
                        process::exit(1);
                    }
                }
            }
            flag if flag.starts_with('-') => {
                eprintln!("unknown flag: {flag}\n\n{USAGE}");
                process::exit(1);
            }
            _ => {}
        }
    }
    port
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
    info!("shutdown signal received");
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let port = match parse_cli_port() {
        Some(port) => port,
        None => config::port_from_env()
            .context("reading port from environment")?
            .unwrap_or(config::DEFAULT_PORT),
    };

    let config = ServerConfig {
        port,
        ..ServerConfig::default()
    };
    let server = Server::bind(config).await.context("binding listener")?;
    server.run(shutdown_signal()).await.context("serving")?;
    Ok(())
}
