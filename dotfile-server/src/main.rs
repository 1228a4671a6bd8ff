//! Dotfile Server - hosted revision history for dotfiles

use anyhow::{Context, Result};
use clap::Parser;
use dotfile_core::config::parse_offset;
use dotfile_server::{Config, Service};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "dotfile-server")]
#[command(author = "Dotfile Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Hosted revision history for dotfiles", long_about = None)]
struct Cli {
    /// Listen address (e.g., 0.0.0.0:8080)
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    addr: String,

    /// SQLite database file
    #[arg(long, default_value = "dotfilehub.db")]
    database: PathBuf,

    /// Offset for listing timestamps, e.g. "-07:00"
    #[arg(long, default_value = "+00:00")]
    utc_offset: String,

    /// Maximum upload size in bytes
    #[arg(long, default_value_t = 1024 * 1024)]
    max_body_size: usize,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_filter = if cli.debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into())
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let config = Config {
        database: cli.database,
        utc_offset: parse_offset(&cli.utc_offset)?,
        max_body_size: cli.max_body_size,
        debug: cli.debug,
    };
    info!("Opening database {:?}", config.database);
    let service = Service::open(config).context("Failed to open database")?;
    let service = Arc::new(service);

    let addr: SocketAddr = cli
        .addr
        .parse()
        .with_context(|| format!("Invalid address {:?}", cli.addr))?;
    let listener = TcpListener::bind(addr).await?;
    info!("Server listening on {}", addr);

    dotfile_server::serve(listener, service).await?;
    Ok(())
}
