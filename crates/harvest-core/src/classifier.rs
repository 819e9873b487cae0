//! Failure classification.
//!
//! A failed exchange carries an error whose `source()` chain ends at the
//! network-level cause. The classifier walks that chain to its root, sorts
//! the failure into one of the capture failure categories and works out
//! which timing phases can still be filled in from what the
//! [`TimingRecorder`] captured before the failure.

use std::error::Error as StdError;
use std::io;

use crate::error::CaptureError;
use crate::exchange::HttpExchange;
use crate::model::{Entry, Timings};
use crate::timing::{Stage, TimingRecorder, TimingState};

/// Message prefix for resolution failures; the host follows.
pub const RESOLUTION_FAILED_MESSAGE: &str = "Unable to resolve host: ";

/// Message for connection failures.
pub const CONNECTION_FAILED_MESSAGE: &str = "Unable to connect to host";

/// Message for response timeouts.
pub const RESPONSE_TIMED_OUT_MESSAGE: &str = "Response timed out";

/// Maximum number of `source()` links followed.
pub const MAX_CAUSE_DEPTH: usize = 32;

const RESOLUTION_PATTERNS: &[&str] = &[
    "Name or service not known",
    "failed to lookup address",
    "nodename nor servname",
    "No such host is known",
    "Temporary failure in name resolution",
];

const TIMEOUT_PATTERNS: &[&str] = &["timed out", "deadline has elapsed"];

/// Failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Upstream host name did not resolve.
    Resolution,
    /// Upstream stopped answering.
    Timeout,
    /// Upstream connection refused, reset or otherwise unusable.
    Connection,
    /// The proxy failed the exchange without a network cause.
    Proxy,
}

/// Outcome of classifying one failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureReport {
    /// Category of the failure.
    pub class: FailureClass,
    /// Message recorded on the entry.
    pub message: String,
    /// Whether the server address should be recorded on the entry.
    pub attribute_server_ip: bool,
}

impl FailureReport {
    /// Converts the report into the matching error value.
    pub fn to_error(&self) -> CaptureError {
        match self.class {
            FailureClass::Resolution => CaptureError::ResolutionFailure(self.message.clone()),
            FailureClass::Timeout => CaptureError::ResponseTimeout(self.message.clone()),
            FailureClass::Connection => CaptureError::ConnectionFailure(self.message.clone()),
            FailureClass::Proxy => CaptureError::GenericProxyError(self.message.clone()),
        }
    }
}

/// Follows the `source()` chain to its last link.
pub fn root_cause<'a>(err: &'a (dyn StdError + 'static)) -> &'a (dyn StdError + 'static) {
    let mut current = err;
    for _ in 0..MAX_CAUSE_DEPTH {
        match current.source() {
            Some(next) => current = next,
            None => break,
        }
    }
    current
}

fn io_kind(err: &(dyn StdError + 'static)) -> Option<io::ErrorKind> {
    err.downcast_ref::<io::Error>().map(io::Error::kind)
}

fn mentions(err: &(dyn StdError + 'static), patterns: &[&str]) -> bool {
    let text = err.to_string();
    patterns.iter().any(|p| text.contains(p))
}

/// Classifies exchange failures and fills in their timings.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    /// Creates a classifier.
    pub fn new() -> Self {
        Self
    }

    /// Sorts a failure into its category.
    ///
    /// `failure` is `None` when the engine reported the exchange as failed
    /// without an error value; the exchange's own error message is used then.
    pub fn classify(
        &self,
        exchange: &HttpExchange,
        failure: Option<&(dyn StdError + 'static)>,
    ) -> FailureReport {
        let Some(failure) = failure else {
            let message = exchange
                .error
                .as_ref()
                .map(|e| e.msg.clone())
                .unwrap_or_else(|| CONNECTION_FAILED_MESSAGE.to_string());
            return FailureReport {
                class: FailureClass::Proxy,
                message,
                attribute_server_ip: false,
            };
        };

        let root = root_cause(failure);
        let kind = io_kind(root);
        let host_port = exchange
            .request
            .as_ref()
            .map(|r| r.host_port())
            .unwrap_or_default();

        if mentions(root, RESOLUTION_PATTERNS) {
            FailureReport {
                class: FailureClass::Resolution,
                message: format!("{}{}", RESOLUTION_FAILED_MESSAGE, host_port),
                attribute_server_ip: false,
            }
        } else if kind == Some(io::ErrorKind::TimedOut) || mentions(root, TIMEOUT_PATTERNS) {
            FailureReport {
                class: FailureClass::Timeout,
                message: RESPONSE_TIMED_OUT_MESSAGE.to_string(),
                attribute_server_ip: true,
            }
        } else {
            FailureReport {
                class: FailureClass::Connection,
                message: CONNECTION_FAILED_MESSAGE.to_string(),
                attribute_server_ip: kind == Some(io::ErrorKind::ConnectionRefused),
            }
        }
    }

    /// Timings of a failed exchange.
    ///
    /// Starts from the phases already measured for the exchange and fills in
    /// what the failure interrupted: the resolution time, the connect time
    /// of a connection that never carried a request and, for timeouts, the
    /// one transfer stage that was in progress.
    pub fn failure_timings(
        &self,
        class: FailureClass,
        state: &TimingState,
        measured: &Timings,
        recorder: &TimingRecorder,
    ) -> Timings {
        let mut timings = Timings::unknown();
        timings.merge_known(measured);

        if !timings.dns.is_applicable() {
            timings.dns = recorder.elapsed_since(state.dns_start);
        }
        if class == FailureClass::Resolution || class == FailureClass::Proxy {
            return timings;
        }

        if state.send_start.is_none() && !timings.connect.is_applicable() {
            timings.connect = recorder.elapsed_since(state.connect_start);
        }

        if class == FailureClass::Timeout {
            if let Some((stage, start)) = state.stage_start() {
                let elapsed = recorder.elapsed_since(Some(start));
                match stage {
                    Stage::Sending => timings.send = elapsed,
                    Stage::Waiting => timings.wait = elapsed,
                    Stage::Receiving => timings.receive = elapsed,
                }
            }
        }
        timings
    }

    /// Writes the report onto an entry and recomputes its total time.
    pub fn annotate(&self, entry: &mut Entry, exchange: &HttpExchange, report: &FailureReport, timings: Timings) {
        entry.response.error_message = Some(report.message.clone());
        entry.timings.merge_known(&timings);
        if report.attribute_server_ip {
            if let Some(ip) = exchange.server_conn.ip_address {
                entry.server_ip_address = Some(ip.to_string());
            }
        }
        entry.recompute_time();
    }
}
