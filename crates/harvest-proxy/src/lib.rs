//! Harvest Proxy - an intercepting proxy that captures its traffic.
//!
//! Runs a [hudsucker](https://docs.rs/hudsucker) MITM proxy whose
//! [`CaptureHandler`] reports every intercepted request to a
//! [`LifecycleHooks`](harvest_core::LifecycleHooks) implementation, usually a
//! [`HarCapture`](harvest_core::HarCapture) writing snapshots through
//! `harvest-storage`.
//!
//! ```text
//! client ──► hudsucker ──► CaptureHandler ──► LifecycleHooks (HarCapture)
//!                │                                  │
//!                ▼                                  ▼
//!            upstream                           FileSink
//! ```
//!
//! # Example
//!
//! ```no_run
//! use harvest_core::CaptureConfig;
//! use harvest_proxy::{file_capture, ProxyConfig, ProxyServer};
//! use harvest_storage::StorageConfig;
//!
//! # async fn run() -> harvest_proxy::Result<()> {
//! let capture = file_capture(CaptureConfig::default(), StorageConfig::default())?;
//! let server = ProxyServer::new(ProxyConfig::default().with_port(8899), capture)?;
//! server.run().await
//! # }
//! ```

mod ca;
mod error;
mod handler;
mod proxy;

pub use ca::CaManager;
pub use error::{ProxyError, Result};
pub use handler::{decode_body, request_record, response_record, CaptureHandler};
pub use proxy::{file_capture, ProxyConfig, ProxyHandle, ProxyServer, DEFAULT_PORT};
