//! PairHub server binary entry point.
//!
//! Starts the hub with configurable host, port and config file via
//! command-line arguments.

use std::net::SocketAddr;
use std::path::Path;

use pairhub::config::HubConfig;
use pairhub::Hub;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize tracing with RUST_LOG env filter support.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Parse CLI arguments (simple manual parsing, no clap dependency needed).
    let args: Vec<String> = std::env::args().collect();
    let host = get_arg(&args, "--host").unwrap_or_else(|| "0.0.0.0".to_string());
    let port = get_arg(&args, "--port")
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(3000);

    let mut config = match get_arg(&args, "--config") {
        Some(path) => match HubConfig::load(Path::new(&path)) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("failed to load config '{path}': {e}");
                std::process::exit(1);
            }
        },
        None => HubConfig::default(),
    };
    if args.iter().any(|a| a == "--ws-fallback") {
        config.ws_fallback = true;
    }
    if args.iter().any(|a| a == "--trust-proxy") && config.proxy_header.is_none() {
        config.proxy_header = Some("x-forwarded-for".to_string());
    }

    let addr: SocketAddr = format!("{host}:{port}").parse().unwrap_or_else(|e| {
        eprintln!("invalid address '{host}:{port}': {e}");
        std::process::exit(1);
    });

    let hub = match Hub::bind(addr, config).await {
        Ok(hub) => hub,
        Err(e) => {
            eprintln!("failed to bind {addr}: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = hub.run().await {
        eprintln!("server error: {e}");
        std::process::exit(1);
    }
}

/// Extract the value following a `--key` argument.
fn get_arg(args: &[String], key: &str) -> Option<String> {
    args.iter()
        .position(|a| a == key)
        .and_then(|i| args.get(i + 1))
        .cloned()
}
