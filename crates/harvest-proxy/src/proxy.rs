//! Capture proxy server.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use harvest_core::{CaptureConfig, HarCapture, LifecycleHooks};
use harvest_storage::{FileSink, StorageConfig};
use hudsucker::rustls::crypto::aws_lc_rs::default_provider;
use hudsucker::Proxy;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::ca::CaManager;
use crate::error::{ProxyError, Result};
use crate::handler::CaptureHandler;

/// Default listen port.
pub const DEFAULT_PORT: u16 = 8080;

/// Proxy server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Address to listen on.
    pub addr: SocketAddr,
    /// Directory holding the capture CA; the platform data dir when unset.
    pub ca_dir: Option<PathBuf>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            ca_dir: None,
        }
    }
}

impl ProxyConfig {
    /// Sets the listen address.
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    /// Listens on localhost at `port`.
    pub fn with_port(mut self, port: u16) -> Self {
        self.addr = SocketAddr::from(([127, 0, 0, 1], port));
        self
    }

    /// Sets the CA directory.
    pub fn with_ca_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.ca_dir = Some(dir.into());
        self
    }

    fn ca_manager(&self) -> Result<CaManager> {
        match &self.ca_dir {
            Some(dir) => Ok(CaManager::new(dir)),
            None => CaManager::with_default_dir(),
        }
    }
}

/// Creates a capture that writes its snapshots to files.
pub fn file_capture(capture: CaptureConfig, storage: StorageConfig) -> Result<Arc<HarCapture>> {
    let sink = FileSink::new(storage)?;
    Ok(Arc::new(HarCapture::new(capture, Arc::new(sink))))
}

/// Intercepting proxy reporting its traffic to [`LifecycleHooks`].
pub struct ProxyServer {
    config: ProxyConfig,
    ca: CaManager,
    hooks: Arc<dyn LifecycleHooks>,
}

impl std::fmt::Debug for ProxyServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyServer")
            .field("config", &self.config)
            .field("ca", &self.ca)
            .finish()
    }
}

impl ProxyServer {
    /// Creates a proxy server.
    pub fn new(config: ProxyConfig, hooks: Arc<dyn LifecycleHooks>) -> Result<Self> {
        let ca = config.ca_manager()?;
        Ok(Self { config, ca, hooks })
    }

    /// Returns the configured listen address.
    pub fn addr(&self) -> SocketAddr {
        self.config.addr
    }

    /// Path of the CA certificate clients must trust.
    pub fn ca_cert_path(&self) -> PathBuf {
        self.ca.cert_path()
    }

    /// Runs the proxy until it stops.
    pub async fn run(self) -> Result<()> {
        let authority = self.ca.ensure_ca()?;

        tracing::info!("Starting capture proxy on {}", self.config.addr);
        tracing::info!("CA certificate: {:?}", self.ca.cert_path());

        let proxy = Proxy::builder()
            .with_addr(self.config.addr)
            .with_ca(authority)
            .with_rustls_connector(default_provider())
            .with_http_handler(CaptureHandler::new(self.hooks))
            .build()
            .map_err(|e| ProxyError::Proxy(e.to_string()))?;

        proxy
            .start()
            .await
            .map_err(|e| ProxyError::Proxy(e.to_string()))?;

        tracing::info!("Capture proxy stopped");
        Ok(())
    }

    /// Starts the proxy in the background.
    ///
    /// The CA is loaded before spawning so certificate problems surface here.
    pub fn start(self) -> Result<ProxyHandle> {
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let addr = self.config.addr;
        let authority = self.ca.ensure_ca()?;
        let handler = CaptureHandler::new(self.hooks);
        let mut shutdown_rx = shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            let proxy = match Proxy::builder()
                .with_addr(addr)
                .with_ca(authority)
                .with_rustls_connector(default_provider())
                .with_http_handler(handler)
                .build()
            {
                Ok(p) => p,
                Err(e) => {
                    tracing::error!("Failed to build capture proxy: {}", e);
                    return;
                }
            };

            tracing::info!("Capture proxy listening on {}", addr);
            tokio::select! {
                result = proxy.start() => {
                    if let Err(e) = result {
                        tracing::error!("Capture proxy error: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Capture proxy shutdown signal received");
                }
            }
        });

        Ok(ProxyHandle {
            shutdown_tx,
            addr,
            handle,
        })
    }
}

/// Handle for controlling a running proxy server.
pub struct ProxyHandle {
    shutdown_tx: broadcast::Sender<()>,
    addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

impl ProxyHandle {
    /// Returns the address the proxy listens on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signals the proxy to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Waits for the proxy to finish.
    pub async fn wait(self) {
        let _ = self.handle.await;
    }

    /// Shuts down the proxy and waits for it to finish.
    pub async fn stop(self) {
        self.shutdown();
        self.wait().await;
    }
}
