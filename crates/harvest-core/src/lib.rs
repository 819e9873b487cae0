//! Harvest Core - timing capture and archive assembly for intercepting proxies.
//!
//! This crate turns the lifecycle callbacks of a traffic-intercepting proxy
//! into an HTTP Archive: per-phase timings (DNS, connect, TLS, send, wait,
//! receive), request/response metadata and grouping of entries into pages.
//! It handles:
//!
//! - Per-connection timing capture under concurrent, interleaved callbacks
//! - Failure classification (resolution, connection, timeout) with partial timings
//! - Page rollover and through-snapshots while capture continues
//! - Snapshot persistence through a pluggable [`ArchiveSink`]
//! - Canonical event ordering for replaying finished exchanges
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use harvest_core::{
//!     CaptureConfig, ConnectionId, HarCapture, HttpExchange, HttpRequest, HttpResponse,
//!     LifecycleHooks, MemorySink,
//! };
//!
//! let capture = HarCapture::new(CaptureConfig::default(), Arc::new(MemorySink::new()));
//!
//! let exchange = HttpExchange::new(ConnectionId::next())
//!     .with_request(HttpRequest::new("GET", "https", "example.com", 443, "/"))
//!     .with_response(HttpResponse::new(200, "OK").with_body("hello"));
//!
//! capture.request_send_started(&exchange);
//! capture.request_send_finished(&exchange);
//! capture.exchange_completed(&exchange);
//!
//! let snapshot = capture.new_page(Some("checkout"), None);
//! println!("{:?}", snapshot.handle);
//! ```

pub mod assembler;
pub mod capture;
pub mod classifier;
pub mod clock;
pub mod config;
pub mod control;
pub mod entry;
pub mod error;
pub mod exchange;
pub mod model;
pub mod sequencer;
pub mod sink;
pub mod timing;

pub use assembler::{ArchiveAssembler, Snapshot};
pub use capture::{HarCapture, LifecycleHooks};
pub use classifier::{root_cause, ErrorClassifier, FailureClass, FailureReport};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::CaptureConfig;
pub use control::{ControlCommand, ControlResponse};
pub use error::{CaptureError, Result};
pub use exchange::{
    ConnectionId, Exchange, ExchangeId, FlowError, HeaderList, HttpExchange, HttpRequest,
    HttpResponse, OpaqueExchange, ServerConnection, StreamExchange, StreamMessage,
};
pub use model::{
    Archive, Cache, Content, Cookie, Creator, Entry, Har, NameValue, Page, PageTimings, PostData,
    RequestRecord, ResponseRecord, Timing, Timings,
};
pub use sequencer::{replay, sequence, EventSequence, FlowEvent, FlowEventHandler};
pub use sink::{ArchiveSink, MemorySink, PersistHandle};
pub use timing::{TimingRecorder, TimingState};
