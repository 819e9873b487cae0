//! Harvest - run an intercepting proxy and write its traffic to archive files.
//!
//! Every recorded entry writes a fresh snapshot of the open archive into the
//! output directory. On Ctrl-C the archive is ended, its final snapshot
//! written and the writer drained before exit.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use harvest_core::{CaptureConfig, HarCapture};
use harvest_proxy::{ProxyConfig, ProxyServer, DEFAULT_PORT};
use harvest_storage::{FileSink, StorageConfig};
use tracing_subscriber::EnvFilter;

/// Harvest - capture proxied traffic as HTTP Archives
#[derive(Parser, Debug)]
#[command(name = "harvest", version, about)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1")]
    listen: IpAddr,

    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Directory snapshots are written to (platform cache dir by default)
    #[arg(short, long)]
    out_dir: Option<PathBuf>,

    /// Gzip snapshots (.zhar)
    #[arg(long)]
    compress: bool,

    /// Only write snapshots on page and archive commands, not per entry
    #[arg(long)]
    no_persist_on_entry: bool,

    /// Directory holding the interception CA
    #[arg(long)]
    ca_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn storage_config(&self) -> StorageConfig {
        let config = match &self.out_dir {
            Some(dir) => StorageConfig::in_dir(dir),
            None => StorageConfig::default(),
        };
        config.with_compress(self.compress)
    }

    fn capture_config(&self) -> CaptureConfig {
        CaptureConfig::default().with_persist_on_entry(!self.no_persist_on_entry)
    }

    fn proxy_config(&self) -> ProxyConfig {
        let config = ProxyConfig::default().with_addr(SocketAddr::new(self.listen, self.port));
        match &self.ca_dir {
            Some(dir) => config.with_ca_dir(dir),
            None => config,
        }
    }
}

fn init_logging(args: &Args) {
    let log_level = if args.debug { "debug" } else { &args.log_level };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("harvest={},warn", log_level)));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let sink = Arc::new(FileSink::new(args.storage_config()).context("Failed to open snapshot directory")?);
    let capture = Arc::new(HarCapture::new(args.capture_config(), sink.clone()));

    let server = ProxyServer::new(args.proxy_config(), capture.clone())?;
    tracing::info!("Trust {:?} in clients to capture HTTPS", server.ca_cert_path());
    tracing::info!("Writing snapshots to {:?}", sink.config().dir);
    let proxy = server.start()?;

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    tracing::info!("Shutting down");
    proxy.stop().await;

    let snapshot = capture.end_archive();
    if let Some(handle) = &snapshot.handle {
        tracing::info!("Final archive written to {}", handle);
    }
    sink.shutdown();
    Ok(())
}
