//! Capture coordinator.
//!
//! [`HarCapture`] is what the proxy engine talks to. It implements
//! [`LifecycleHooks`], feeding per-connection timestamps into the
//! [`TimingRecorder`], and turns completed or failed exchanges into archive
//! entries through the [`ArchiveAssembler`].
//!
//! ## Architecture
//!
//! ```text
//!  proxy engine callbacks (concurrent, one stream per connection)
//!          │
//!          ▼
//!  ┌──────────────┐   phase timestamps    ┌────────────────┐
//!  │  HarCapture  │ ────────────────────► │ TimingRecorder │
//!  │              │                       └────────────────┘
//!  │  in-flight   │   completed/failed    ┌──────────────────┐   snapshot   ┌──────┐
//!  │  side table  │ ────────────────────► │ ArchiveAssembler │ ───────────► │ sink │
//!  └──────────────┘   (ErrorClassifier)   └──────────────────┘              └──────┘
//! ```
//!
//! Phase durations measured through callbacks are parked in a side table
//! keyed by connection until the exchange finishes; the entry is built and
//! appended exactly once, at that point. Callbacks that arrive after an
//! exchange was finalized are recognized and dropped.

use std::collections::{HashSet, VecDeque};
use std::error::Error as StdError;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::assembler::{ArchiveAssembler, Snapshot};
use crate::classifier::ErrorClassifier;
use crate::clock::{SharedClock, SystemClock};
use crate::config::CaptureConfig;
use crate::control::{ControlCommand, ControlResponse};
use crate::error::Result;
use crate::exchange::{ConnectionId, ExchangeId, HttpExchange};
use crate::model::{Archive, Timings};
use crate::sink::ArchiveSink;
use crate::timing::TimingRecorder;

/// Callbacks a proxy engine invokes while it forwards traffic.
///
/// Every method has an empty default so engines and decorators only
/// implement what they observe.
pub trait LifecycleHooks: Send + Sync {
    /// Name resolution for the upstream host began.
    fn address_resolution_started(&self, _conn: ConnectionId) {}

    /// Name resolution for the upstream host ended.
    fn address_resolution_finished(&self, _conn: ConnectionId) {}

    /// The TLS handshake with the upstream began.
    fn tls_handshake_started(&self, _exchange: &HttpExchange) {}

    /// The request started going upstream.
    fn request_send_started(&self, _exchange: &HttpExchange) {}

    /// The request was fully written upstream.
    fn request_send_finished(&self, _exchange: &HttpExchange) {}

    /// The first response bytes arrived.
    fn response_receive_started(&self, _exchange: &HttpExchange) {}

    /// The response was fully read.
    fn response_receive_finished(&self, _exchange: &HttpExchange) {}

    /// The exchange finished with a response.
    fn exchange_completed(&self, _exchange: &HttpExchange) {}

    /// The exchange failed. `failure` is the engine's error, if it has one.
    fn exchange_failed(&self, _exchange: &HttpExchange, _failure: Option<&(dyn StdError + 'static)>) {}

    /// The upstream connection closed.
    fn connection_closed(&self, _conn: ConnectionId) {}
}

/// In-flight state of a connection's current exchange.
#[derive(Debug, Clone, Copy, Default)]
struct PendingEntry {
    exchange: Option<ExchangeId>,
    timings: Timings,
}

/// Bounded memory of finalized exchanges.
#[derive(Debug)]
struct FinalizedSet {
    capacity: usize,
    order: VecDeque<ExchangeId>,
    members: HashSet<ExchangeId>,
}

impl FinalizedSet {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            members: HashSet::new(),
        }
    }

    /// Returns false if the id was already present.
    fn insert(&mut self, id: ExchangeId) -> bool {
        if !self.members.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.members.remove(&evicted);
            }
        }
        true
    }

    fn contains(&self, id: ExchangeId) -> bool {
        self.members.contains(&id)
    }
}

/// Captures intercepted traffic into an archive.
pub struct HarCapture {
    recorder: Arc<TimingRecorder>,
    assembler: ArchiveAssembler,
    classifier: ErrorClassifier,
    pending: DashMap<ConnectionId, PendingEntry>,
    finalized: Mutex<FinalizedSet>,
}

impl std::fmt::Debug for HarCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HarCapture")
            .field("assembler", &self.assembler)
            .field("in_flight", &self.pending.len())
            .finish()
    }
}

impl HarCapture {
    /// Creates a capture on the system clock.
    pub fn new(config: CaptureConfig, sink: Arc<dyn ArchiveSink>) -> Self {
        Self::with_clock(config, Arc::new(SystemClock), sink)
    }

    /// Creates a capture reading time from `clock`.
    pub fn with_clock(config: CaptureConfig, clock: SharedClock, sink: Arc<dyn ArchiveSink>) -> Self {
        let recorder = Arc::new(TimingRecorder::new(clock));
        let finalized = Mutex::new(FinalizedSet::new(config.finalized_capacity));
        Self {
            assembler: ArchiveAssembler::new(config, recorder.clone(), sink),
            recorder,
            classifier: ErrorClassifier::new(),
            pending: DashMap::new(),
            finalized,
        }
    }

    /// The archive assembler.
    pub fn assembler(&self) -> &ArchiveAssembler {
        &self.assembler
    }

    /// The timing recorder.
    pub fn recorder(&self) -> &TimingRecorder {
        &self.recorder
    }

    /// Number of connections with an exchange in flight.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    fn is_finalized(&self, id: ExchangeId) -> bool {
        self.finalized.lock().contains(id)
    }

    /// Marks the exchange finalized; false if it already was.
    fn claim(&self, id: ExchangeId) -> bool {
        self.finalized.lock().insert(id)
    }

    /// Runs `update` on the connection's pending entry, unless the exchange
    /// was already finalized.
    ///
    /// The finalized check and the update happen under the side table's
    /// entry lock, so an update either lands before finalization removes the
    /// entry or is dropped.
    fn track(&self, exchange: &HttpExchange, update: impl FnOnce(&mut PendingEntry)) -> bool {
        let slot = self.pending.entry(exchange.connection());
        if self.is_finalized(exchange.id) {
            tracing::trace!("Ignoring late callback for finalized {}", exchange.id);
            return false;
        }
        let mut entry = slot.or_default();
        entry.exchange = Some(exchange.id);
        update(&mut entry);
        true
    }

    /// Takes the measured timings for an exchange out of the side table.
    fn take_measured(&self, exchange: &HttpExchange) -> Timings {
        match self.pending.remove(&exchange.connection()) {
            Some((_, pending)) if pending.exchange.map_or(true, |id| id == exchange.id) => pending.timings,
            Some((_, pending)) => {
                tracing::debug!(
                    "Discarding timings of {:?} found on {} while finishing {}",
                    pending.exchange,
                    exchange.connection(),
                    exchange.id
                );
                Timings::unknown()
            }
            None => Timings::unknown(),
        }
    }

    /// Records a completed exchange; `None` if it was already finalized or
    /// carried no request.
    pub fn record_completion(&self, exchange: &HttpExchange) -> Option<Snapshot> {
        if !self.claim(exchange.id) {
            tracing::debug!("Ignoring duplicate completion of {}", exchange.id);
            return None;
        }
        let measured = self.take_measured(exchange);
        let snapshot = self.assembler.record_exchange_completion(exchange, &measured);
        self.recorder.finish(exchange.connection());
        snapshot
    }

    /// Records a failed exchange.
    pub fn record_failure(
        &self,
        exchange: &HttpExchange,
        failure: Option<&(dyn StdError + 'static)>,
    ) -> Option<Snapshot> {
        // A failure after completion annotates the recorded entry.
        self.claim(exchange.id);
        let report = self.classifier.classify(exchange, failure);
        tracing::info!("{} failed: {}", exchange.id, report.to_error());

        let state = self.recorder.snapshot(exchange.connection());
        let measured = self.take_measured(exchange);
        let timings = self
            .classifier
            .failure_timings(report.class, &state, &measured, &self.recorder);
        let snapshot = self.assembler.record_exchange_failure(exchange, &report, timings);
        self.recorder.finish(exchange.connection());
        snapshot
    }

    /// Returns the open archive, or a clean one.
    pub fn get_archive(&self, clean: bool) -> Snapshot {
        self.assembler.persist(self.assembler.archive(clean))
    }

    /// Starts a new archive; the snapshot holds the previous one.
    pub fn begin_archive(&self, page_ref: Option<&str>, page_title: Option<&str>) -> Snapshot {
        self.assembler.persist(self.assembler.begin_archive(page_ref, page_title))
    }

    /// Ends the open archive; the snapshot holds it.
    pub fn end_archive(&self) -> Snapshot {
        self.assembler.persist(self.assembler.end_archive())
    }

    /// Rolls over to a new page; the snapshot holds the archive through the
    /// ended page.
    pub fn new_page(&self, page_ref: Option<&str>, page_title: Option<&str>) -> Snapshot {
        self.assembler.persist(self.assembler.new_page(page_ref, page_title))
    }

    /// Ends the current page.
    pub fn end_page(&self) -> Snapshot {
        self.assembler.persist(self.assembler.end_page())
    }

    /// Copy of the open archive without persisting it.
    pub fn archive(&self) -> Option<Archive> {
        self.assembler.archive(false)
    }

    /// Executes a control command.
    pub fn execute(&self, command: &ControlCommand) -> ControlResponse {
        tracing::debug!("Control command {}", command.name());
        let snapshot = match command {
            ControlCommand::GetArchive { clean } => self.get_archive(*clean),
            ControlCommand::BeginArchive { page_ref, page_title } => {
                self.begin_archive(page_ref.as_deref(), page_title.as_deref())
            }
            ControlCommand::EndArchive => self.end_archive(),
            ControlCommand::NewPage { page_ref, page_title } => {
                self.new_page(page_ref.as_deref(), page_title.as_deref())
            }
            ControlCommand::EndPage => self.end_page(),
        };
        snapshot.into()
    }

    /// Parses and executes a control command given by name and query string.
    pub fn handle_command(&self, name: &str, query: &str) -> Result<ControlResponse> {
        let command = ControlCommand::from_query(name, query)?;
        Ok(self.execute(&command))
    }
}

impl LifecycleHooks for HarCapture {
    fn address_resolution_started(&self, conn: ConnectionId) {
        self.recorder.dns_started(conn);
        self.pending.entry(conn).or_default();
    }

    fn address_resolution_finished(&self, conn: ConnectionId) {
        let dns = self.recorder.dns_finished(conn);
        self.pending.entry(conn).or_default().timings.dns = dns;
    }

    fn tls_handshake_started(&self, exchange: &HttpExchange) {
        let recorder = &self.recorder;
        self.track(exchange, |_| recorder.tls_started(exchange.connection()));
    }

    fn request_send_started(&self, exchange: &HttpExchange) {
        let recorder = &self.recorder;
        self.track(exchange, |_| recorder.send_started(exchange.connection()));
    }

    fn request_send_finished(&self, exchange: &HttpExchange) {
        let recorder = &self.recorder;
        self.track(exchange, |pending| {
            pending.timings.send = recorder.send_finished(exchange.connection());
        });
    }

    fn response_receive_started(&self, exchange: &HttpExchange) {
        let recorder = &self.recorder;
        self.track(exchange, |_| recorder.receive_started(exchange.connection()));
    }

    fn response_receive_finished(&self, exchange: &HttpExchange) {
        let recorder = &self.recorder;
        self.track(exchange, |pending| {
            let start = recorder.snapshot(exchange.connection()).receive_start;
            pending.timings.receive = recorder.elapsed_since(start);
        });
    }

    fn exchange_completed(&self, exchange: &HttpExchange) {
        self.record_completion(exchange);
    }

    fn exchange_failed(&self, exchange: &HttpExchange, failure: Option<&(dyn StdError + 'static)>) {
        self.record_failure(exchange, failure);
    }

    fn connection_closed(&self, conn: ConnectionId) {
        self.recorder.close(conn);
        self.pending.remove(&conn);
        tracing::trace!("Connection {} closed", conn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{CONNECTION_FAILED_MESSAGE, RESOLUTION_FAILED_MESSAGE, RESPONSE_TIMED_OUT_MESSAGE};
    use crate::clock::{Clock, ManualClock};
    use crate::exchange::{HttpRequest, HttpResponse};
    use crate::model::{Har, Timing};
    use crate::sink::MemorySink;
    use base64::{engine::general_purpose::STANDARD, Engine};
    use chrono::Duration;
    use std::io;

    struct Fixture {
        clock: Arc<ManualClock>,
        sink: Arc<MemorySink>,
        capture: HarCapture,
    }

    fn fixture_with(config: CaptureConfig) -> Fixture {
        let clock = Arc::new(ManualClock::new());
        let sink = Arc::new(MemorySink::new());
        let capture = HarCapture::with_clock(config, clock.clone(), sink.clone());
        Fixture { clock, sink, capture }
    }

    fn fixture() -> Fixture {
        fixture_with(CaptureConfig::default())
    }

    fn request(path: &str) -> HttpRequest {
        HttpRequest::new("GET", "http", "example.com", 80, path)
    }

    fn exchange_on(conn: ConnectionId, path: &str) -> HttpExchange {
        HttpExchange::new(conn).with_request(request(path))
    }

    fn entries(capture: &HarCapture) -> Vec<crate::model::Entry> {
        capture.archive().map(|a| a.entries).unwrap_or_default()
    }

    #[test]
    fn scenario_a_timestamps_sum_to_total() {
        let f = fixture();
        let t0 = f.clock.wall_now();
        let mut req = request("/a");
        req.timestamp_start = Some(t0);
        req.timestamp_end = Some(t0 + Duration::milliseconds(50));
        let mut res = HttpResponse::new(200, "OK").with_body("hello");
        res.timestamp_start = Some(t0 + Duration::milliseconds(170));
        res.timestamp_end = Some(t0 + Duration::milliseconds(200));
        let ex = HttpExchange::new(ConnectionId::next()).with_request(req).with_response(res);

        f.capture.exchange_completed(&ex);

        let entry = &entries(&f.capture)[0];
        assert_eq!(entry.time, 200);
        assert_eq!(entry.timings.send, Timing::Ms(50));
        assert_eq!(entry.timings.wait, Timing::Ms(120));
        assert_eq!(entry.timings.receive, Timing::Ms(30));

        let json = serde_json::to_value(entry).unwrap();
        assert_eq!(json["timings"]["connect"], -1);
        assert_eq!(json["timings"]["ssl"], -1);
        assert_eq!(json["time"], 200);
    }

    #[test]
    fn scenario_b_resolution_failure() {
        let f = fixture();
        let conn = ConnectionId::next();
        let ex = exchange_on(conn, "/");

        f.capture.address_resolution_started(conn);
        f.clock.advance_ms(30);
        let failure = io::Error::new(
            io::ErrorKind::Other,
            "failed to lookup address information: Name or service not known",
        );
        f.capture.exchange_failed(&ex, Some(&failure));

        let entry = &entries(&f.capture)[0];
        let message = entry.error_message().unwrap();
        assert!(message.starts_with(RESOLUTION_FAILED_MESSAGE));
        assert_eq!(message, "Unable to resolve host: example.com");
        assert_eq!(entry.timings.dns, Timing::Ms(30));
        assert_eq!(entry.timings.connect, Timing::NotApplicable);
        assert_eq!(entry.time, 30);
        assert_eq!(f.capture.in_flight(), 0);
    }

    #[test]
    fn scenario_c_interleaved_connections_keep_timings_apart() {
        let f = fixture();
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        let ex_a = exchange_on(a, "/a").with_response(HttpResponse::new(200, "OK"));
        let ex_b = exchange_on(b, "/b").with_response(HttpResponse::new(204, "No Content"));

        f.capture.address_resolution_started(a);
        f.clock.advance_ms(10);
        f.capture.address_resolution_started(b);
        f.clock.advance_ms(5);
        f.capture.address_resolution_finished(a);
        f.clock.advance_ms(20);
        f.capture.address_resolution_finished(b);

        f.capture.request_send_started(&ex_b);
        f.capture.request_send_started(&ex_a);
        f.clock.advance_ms(7);
        f.capture.request_send_finished(&ex_a);
        f.clock.advance_ms(4);
        f.capture.request_send_finished(&ex_b);

        f.capture.exchange_completed(&ex_b);
        f.capture.exchange_completed(&ex_a);

        let entries = entries(&f.capture);
        assert_eq!(entries.len(), 2);
        let by_url = |suffix: &str| entries.iter().find(|e| e.request.url.ends_with(suffix)).unwrap();
        let ea = by_url("/a");
        let eb = by_url("/b");
        assert_eq!(ea.timings.dns, Timing::Ms(15));
        assert_eq!(eb.timings.dns, Timing::Ms(25));
        assert_eq!(ea.timings.send, Timing::Ms(7));
        assert_eq!(eb.timings.send, Timing::Ms(11));
        assert_eq!(ea.timings.connect, Timing::Ms(20));
        assert_eq!(eb.timings.connect, Timing::Ms(0));
        assert_eq!(eb.time, 25 + 0 + 11);
    }

    #[test]
    fn scenario_c_threads_produce_one_entry_each() {
        let capture = HarCapture::new(
            CaptureConfig::default().with_persist_on_entry(false),
            Arc::new(MemorySink::new()),
        );
        std::thread::scope(|scope| {
            for i in 0..8 {
                let capture = &capture;
                scope.spawn(move || {
                    let conn = ConnectionId::next();
                    let ex = exchange_on(conn, &format!("/item/{}", i))
                        .with_response(HttpResponse::new(200, "OK").with_body(vec![b'x'; i]));
                    capture.address_resolution_started(conn);
                    capture.address_resolution_finished(conn);
                    capture.request_send_started(&ex);
                    capture.request_send_finished(&ex);
                    capture.response_receive_started(&ex);
                    capture.response_receive_finished(&ex);
                    capture.exchange_completed(&ex);
                });
            }
        });

        let entries = entries(&capture);
        assert_eq!(entries.len(), 8);
        for entry in &entries {
            let i: usize = entry.request.url.rsplit('/').next().unwrap().parse().unwrap();
            assert_eq!(entry.response.content.size, i as i64);
            assert_eq!(entry.time, entry.timings.total_ms());
        }
        assert_eq!(capture.in_flight(), 0);
        assert_eq!(capture.recorder().tracked_connections(), 0);
    }

    #[test]
    fn scenario_d_binary_and_text_bodies() {
        let f = fixture();
        let png = vec![0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0x00, 0x00, 0x0d, 0x01, 0x02];
        let binary = exchange_on(ConnectionId::next(), "/logo.png")
            .with_response(HttpResponse::new(200, "OK").with_body(png.clone()));
        let text = exchange_on(ConnectionId::next(), "/index.html")
            .with_response(HttpResponse::new(200, "OK").with_body("<p>hi</p>"));

        f.capture.exchange_completed(&binary);
        f.capture.exchange_completed(&text);

        let entries = entries(&f.capture);
        assert_eq!(entries[0].response.content.encoding.as_deref(), Some("base64"));
        assert_eq!(entries[0].response.content.text.as_deref(), Some(STANDARD.encode(&png).as_str()));
        assert_eq!(entries[1].response.content.encoding, None);
        assert_eq!(entries[1].response.content.text.as_deref(), Some("<p>hi</p>"));
    }

    #[test]
    fn scenario_e_clean_copy_leaves_archive_alone() {
        let f = fixture();
        f.capture
            .exchange_completed(&exchange_on(ConnectionId::next(), "/").with_response(HttpResponse::new(200, "OK")));
        let before = f.capture.archive().unwrap();

        let snapshot = f.capture.get_archive(true);
        let clean = snapshot.archive().unwrap();
        assert!(clean.entries.is_empty());
        assert!(snapshot.handle.is_some());

        assert_eq!(f.capture.archive().unwrap(), before);
        assert_eq!(f.capture.archive().unwrap().entries.len(), 1);
    }

    #[test]
    fn duplicate_completion_is_ignored() {
        let f = fixture();
        let ex = exchange_on(ConnectionId::next(), "/").with_response(HttpResponse::new(200, "OK"));
        assert!(f.capture.record_completion(&ex).is_some());
        assert!(f.capture.record_completion(&ex).is_none());
        assert_eq!(entries(&f.capture).len(), 1);
    }

    #[test]
    fn concurrent_duplicate_completions_record_once() {
        for _ in 0..200 {
            let capture = HarCapture::new(
                CaptureConfig::default().with_persist_on_entry(false),
                Arc::new(MemorySink::new()),
            );
            let ex = exchange_on(ConnectionId::next(), "/twice").with_response(HttpResponse::new(200, "OK"));
            let barrier = std::sync::Barrier::new(2);
            std::thread::scope(|scope| {
                for _ in 0..2 {
                    scope.spawn(|| {
                        barrier.wait();
                        capture.exchange_completed(&ex);
                    });
                }
            });
            assert_eq!(entries(&capture).len(), 1);
        }
    }

    #[test]
    fn completion_racing_failure_records_once() {
        for _ in 0..200 {
            let capture = HarCapture::new(
                CaptureConfig::default().with_persist_on_entry(false),
                Arc::new(MemorySink::new()),
            );
            let ex = exchange_on(ConnectionId::next(), "/race").with_response(HttpResponse::new(200, "OK"));
            let barrier = std::sync::Barrier::new(2);
            std::thread::scope(|scope| {
                scope.spawn(|| {
                    barrier.wait();
                    capture.exchange_completed(&ex);
                });
                scope.spawn(|| {
                    barrier.wait();
                    let failure = io::Error::from(io::ErrorKind::ConnectionReset);
                    capture.exchange_failed(&ex, Some(&failure));
                });
            });
            let entries = entries(&capture);
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].error_message(), Some(CONNECTION_FAILED_MESSAGE));
        }
    }

    #[test]
    fn late_callbacks_do_not_resurrect_state() {
        let f = fixture();
        let ex = exchange_on(ConnectionId::next(), "/").with_response(HttpResponse::new(200, "OK"));
        f.capture.request_send_started(&ex);
        f.capture.exchange_completed(&ex);
        assert_eq!(f.capture.in_flight(), 0);

        f.capture.request_send_finished(&ex);
        f.capture.response_receive_finished(&ex);
        assert_eq!(f.capture.in_flight(), 0);
        assert_eq!(f.capture.recorder().tracked_connections(), 0);
    }

    #[test]
    fn reused_connection_skips_connect() {
        let f = fixture();
        let conn = ConnectionId::next();
        f.capture.address_resolution_started(conn);
        f.clock.advance_ms(3);
        f.capture.address_resolution_finished(conn);
        f.clock.advance_ms(12);
        let first = exchange_on(conn, "/1").with_response(HttpResponse::new(200, "OK"));
        f.capture.request_send_started(&first);
        f.capture.exchange_completed(&first);

        let second = exchange_on(conn, "/2").with_response(HttpResponse::new(200, "OK"));
        f.capture.request_send_started(&second);
        f.capture.exchange_completed(&second);

        let entries = entries(&f.capture);
        assert_eq!(entries[0].timings.connect, Timing::Ms(12));
        assert_eq!(entries[1].timings.connect, Timing::NotApplicable);
        assert_eq!(entries[1].timings.dns, Timing::NotApplicable);
    }

    #[test]
    fn timeout_while_waiting() {
        let f = fixture();
        let conn = ConnectionId::next();
        let mut ex = exchange_on(conn, "/slow");
        ex.server_conn.ip_address = Some("192.0.2.7".parse().unwrap());

        f.capture.request_send_started(&ex);
        f.clock.advance_ms(4);
        f.capture.request_send_finished(&ex);
        f.clock.advance_ms(1000);
        let failure = io::Error::new(io::ErrorKind::TimedOut, "upstream timed out");
        f.capture.exchange_failed(&ex, Some(&failure));

        let entry = &entries(&f.capture)[0];
        assert_eq!(entry.error_message(), Some(RESPONSE_TIMED_OUT_MESSAGE));
        assert_eq!(entry.timings.send, Timing::Ms(4));
        assert_eq!(entry.timings.wait, Timing::Ms(1000));
        assert_eq!(entry.timings.receive, Timing::NotApplicable);
        assert_eq!(entry.time, 1004);
        assert_eq!(entry.server_ip_address.as_deref(), Some("192.0.2.7"));
        assert_eq!(entry.response.status, 0);
    }

    #[test]
    fn timeout_while_sending() {
        let f = fixture();
        let ex = exchange_on(ConnectionId::next(), "/upload");

        f.capture.request_send_started(&ex);
        f.clock.advance_ms(700);
        let failure = io::Error::new(io::ErrorKind::TimedOut, "write timed out");
        f.capture.exchange_failed(&ex, Some(&failure));

        let entry = &entries(&f.capture)[0];
        assert_eq!(entry.error_message(), Some(RESPONSE_TIMED_OUT_MESSAGE));
        assert_eq!(entry.timings.send, Timing::Ms(700));
        assert_eq!(entry.timings.wait, Timing::NotApplicable);
        assert_eq!(entry.timings.receive, Timing::NotApplicable);
        assert_eq!(entry.time, 700);
    }

    #[test]
    fn timeout_while_receiving() {
        let f = fixture();
        let ex = exchange_on(ConnectionId::next(), "/stream");

        f.capture.request_send_started(&ex);
        f.clock.advance_ms(3);
        f.capture.request_send_finished(&ex);
        f.clock.advance_ms(40);
        f.capture.response_receive_started(&ex);
        f.clock.advance_ms(250);
        let failure = io::Error::new(io::ErrorKind::TimedOut, "read timed out");
        f.capture.exchange_failed(&ex, Some(&failure));

        let entry = &entries(&f.capture)[0];
        assert_eq!(entry.timings.send, Timing::Ms(3));
        assert_eq!(entry.timings.wait, Timing::NotApplicable);
        assert_eq!(entry.timings.receive, Timing::Ms(250));
        assert_eq!(entry.time, 253);
        assert_eq!(entry.time, entry.timings.total_ms());
    }

    #[test]
    fn refused_connection_measures_connect() {
        let f = fixture();
        let conn = ConnectionId::next();
        let ex = exchange_on(conn, "/");
        f.capture.address_resolution_started(conn);
        f.clock.advance_ms(2);
        f.capture.address_resolution_finished(conn);
        f.clock.advance_ms(8);
        let failure = io::Error::from(io::ErrorKind::ConnectionRefused);
        f.capture.exchange_failed(&ex, Some(&failure));

        let entry = &entries(&f.capture)[0];
        assert_eq!(entry.error_message(), Some(CONNECTION_FAILED_MESSAGE));
        assert_eq!(entry.timings.dns, Timing::Ms(2));
        assert_eq!(entry.timings.connect, Timing::Ms(8));
        assert_eq!(entry.time, 10);
    }

    #[test]
    fn connection_closed_drops_state() {
        let f = fixture();
        let conn = ConnectionId::next();
        f.capture.address_resolution_started(conn);
        assert_eq!(f.capture.in_flight(), 1);
        f.capture.connection_closed(conn);
        assert_eq!(f.capture.in_flight(), 0);
        assert_eq!(f.capture.recorder().tracked_connections(), 0);
    }

    #[test]
    fn control_commands_persist_results() {
        let f = fixture();
        let response = f.capture.handle_command("new_har", "pageRef=home").unwrap();
        assert!(response.json.is_none());
        assert!(response.path.is_none());

        f.capture
            .exchange_completed(&exchange_on(ConnectionId::next(), "/").with_response(HttpResponse::new(200, "OK")));
        let response = f.capture.execute(&ControlCommand::NewPage {
            page_ref: None,
            page_title: Some("Second".into()),
        });
        let through: &Har = response.json.as_ref().unwrap();
        assert_eq!(through.log.pages.len(), 1);
        assert_eq!(through.log.pages[0].id, "home");
        assert!(response.path.is_some());

        let ended = f.capture.handle_command("end_har", "").unwrap();
        let ended = ended.json.unwrap();
        assert_eq!(ended.log.pages[1].id, "Page 1");
        assert_eq!(ended.log.pages[1].title, "Second");
        assert!(f.capture.archive().is_none());

        assert!(f.capture.handle_command("rotate", "").is_err());
        assert!(f.sink.len() >= 3);
    }

    #[test]
    fn finalized_set_evicts_oldest() {
        let mut set = FinalizedSet::new(2);
        assert!(set.insert(ExchangeId::new(1)));
        assert!(!set.insert(ExchangeId::new(1)));
        set.insert(ExchangeId::new(2));
        set.insert(ExchangeId::new(3));
        assert!(!set.contains(ExchangeId::new(1)));
        assert!(set.contains(ExchangeId::new(3)));
    }
}
