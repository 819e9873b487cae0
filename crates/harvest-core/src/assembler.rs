//! Archive assembly.
//!
//! [`ArchiveAssembler`] owns the open archive. It creates the archive and the
//! default page lazily, rolls pages over on request, appends one entry per
//! finished exchange and hands snapshots to the configured [`ArchiveSink`].
//!
//! ## Architecture
//!
//! ```text
//! completion / failure ──► lock ──► ensure archive ──► build entry ──► append
//!                                                                        │
//!                  sink.persist(snapshot) ◄── unlock ◄── clone snapshot ◄┘
//! ```
//!
//! All mutation happens under one mutex; the sink is always called after the
//! lock is released so a slow sink never stalls other connections.
//!
//! Every operation is best-effort. Ending a page or archive that does not
//! exist is a no-op, and an exchange without a request produces no entry.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::classifier::{ErrorClassifier, FailureReport};
use crate::config::CaptureConfig;
use crate::entry::{build_entry, fallback_entry, transfer_timings};
use crate::exchange::{ExchangeId, HttpExchange};
use crate::model::{Archive, Har, Page, Timings};
use crate::sink::{ArchiveSink, PersistHandle};
use crate::timing::TimingRecorder;

/// A persisted archive structure and where it went.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// The archive document, if the operation produced one.
    pub har: Option<Har>,
    /// Handle of the persisted copy; absent when nothing was persisted or
    /// persistence failed.
    pub handle: Option<PersistHandle>,
}

impl Snapshot {
    /// A snapshot with no document.
    pub fn empty() -> Self {
        Self {
            har: None,
            handle: None,
        }
    }

    /// The archive log, if any.
    pub fn archive(&self) -> Option<&Archive> {
        self.har.as_ref().map(|h| &h.log)
    }
}

#[derive(Debug, Default)]
struct AssemblerState {
    archive: Option<Archive>,
    /// Index of the current page in `archive.pages`.
    current_page: Option<usize>,
    /// Counter behind automatic page ids.
    page_count: usize,
    /// Position of the entry recorded for each exchange.
    entries_by_exchange: HashMap<ExchangeId, usize>,
}

impl AssemblerState {
    fn ensure_archive(
        &mut self,
        config: &CaptureConfig,
        page_ref: Option<&str>,
        page_title: Option<&str>,
        create_page: bool,
        now: DateTime<Utc>,
    ) {
        if self.archive.is_none() {
            self.begin_archive(config, page_ref, page_title, create_page, now);
        }
    }

    fn begin_archive(
        &mut self,
        config: &CaptureConfig,
        page_ref: Option<&str>,
        page_title: Option<&str>,
        create_page: bool,
        now: DateTime<Utc>,
    ) -> Option<Archive> {
        let previous = self.end_archive(config, now);
        self.page_count = 0;
        self.archive = Some(Archive::new(config));
        if create_page {
            self.new_page(config, page_ref, page_title, now);
        }
        previous
    }

    fn end_archive(&mut self, config: &CaptureConfig, now: DateTime<Utc>) -> Option<Archive> {
        self.archive.as_ref()?;
        self.end_page(config, now);
        self.entries_by_exchange.clear();
        self.archive.take()
    }

    fn new_page(
        &mut self,
        config: &CaptureConfig,
        page_ref: Option<&str>,
        page_title: Option<&str>,
        now: DateTime<Utc>,
    ) -> Option<Archive> {
        self.ensure_archive(config, page_ref, page_title, false, now);
        let through = self.end_page(config, now);

        let id = match page_ref {
            Some(id) => id.to_string(),
            None => {
                self.page_count += 1;
                format!("Page {}", self.page_count)
            }
        };
        let title = page_title.map(str::to_string).unwrap_or_else(|| id.clone());

        let archive = self.archive.as_mut()?;
        archive.pages.push(Page::new(id, title, now));
        self.current_page = Some(archive.pages.len() - 1);
        through
    }

    /// Ends the current page; returns the archive through that page.
    fn end_page(&mut self, config: &CaptureConfig, now: DateTime<Utc>) -> Option<Archive> {
        let index = self.current_page.take()?;
        let archive = self.archive.as_mut()?;

        if let Some(page) = archive.pages.get_mut(index) {
            page.finish(now);
        }
        if let Some(default_index) = archive.page_index(&config.default_page_ref) {
            archive.pages[default_index].finish(now);
        }
        Some(archive.through_page(index))
    }

    /// Id of the current page, creating the default page when none is current.
    fn current_page_ref(&mut self, config: &CaptureConfig, now: DateTime<Utc>) -> Option<String> {
        let archive = self.archive.as_mut()?;
        if let Some(page) = self.current_page.and_then(|i| archive.pages.get(i)) {
            return Some(page.id.clone());
        }
        if !archive.has_page(&config.default_page_ref) {
            archive.pages.push(Page::new(
                config.default_page_ref.as_str(),
                config.default_page_title.as_str(),
                now,
            ));
        }
        Some(config.default_page_ref.clone())
    }

    fn snapshot(&self) -> Option<Har> {
        self.archive.as_ref().map(|a| Har::new(a.clone()))
    }
}

/// Owns and mutates the open archive.
pub struct ArchiveAssembler {
    config: CaptureConfig,
    recorder: Arc<TimingRecorder>,
    sink: Arc<dyn ArchiveSink>,
    classifier: ErrorClassifier,
    state: Mutex<AssemblerState>,
}

impl std::fmt::Debug for ArchiveAssembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ArchiveAssembler")
            .field("open", &state.archive.is_some())
            .field("current_page", &state.current_page)
            .field("page_count", &state.page_count)
            .field("sink", &self.sink)
            .finish()
    }
}

impl ArchiveAssembler {
    /// Creates an assembler with no open archive.
    pub fn new(config: CaptureConfig, recorder: Arc<TimingRecorder>, sink: Arc<dyn ArchiveSink>) -> Self {
        Self {
            config,
            recorder,
            sink,
            classifier: ErrorClassifier::new(),
            state: Mutex::new(AssemblerState::default()),
        }
    }

    /// The capture configuration.
    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    fn now(&self) -> DateTime<Utc> {
        self.recorder.clock().wall_now()
    }

    /// Opens an archive if none is open, optionally with a first page.
    pub fn ensure_archive(&self, page_ref: Option<&str>, page_title: Option<&str>, create_page: bool) {
        let now = self.now();
        self.state
            .lock()
            .ensure_archive(&self.config, page_ref, page_title, create_page, now);
    }

    /// Starts a fresh archive with a first page; returns the previous one.
    pub fn begin_archive(&self, page_ref: Option<&str>, page_title: Option<&str>) -> Option<Archive> {
        let now = self.now();
        let previous = self
            .state
            .lock()
            .begin_archive(&self.config, page_ref, page_title, true, now);
        tracing::info!(
            "Started new archive (previous had {} entries)",
            previous.as_ref().map_or(0, |a| a.entries.len())
        );
        previous
    }

    /// Ends the current page, if any, and makes a new one current.
    ///
    /// Returns the archive up to and including the ended page. Without a
    /// `page_ref` the page is named `Page N`; the title defaults to the id.
    pub fn new_page(&self, page_ref: Option<&str>, page_title: Option<&str>) -> Option<Archive> {
        let now = self.now();
        let mut state = self.state.lock();
        let through = state.new_page(&self.config, page_ref, page_title, now);
        if let Some(page) = state.current_page.and_then(|i| state.archive.as_ref()?.pages.get(i)) {
            tracing::debug!("New page '{}'", page.id);
        }
        through
    }

    /// Ends the current page; a no-op when no page is current.
    pub fn end_page(&self) -> Option<Archive> {
        let now = self.now();
        self.state.lock().end_page(&self.config, now)
    }

    /// Ends the current page and detaches the archive.
    pub fn end_archive(&self) -> Option<Archive> {
        let now = self.now();
        let archive = self.state.lock().end_archive(&self.config, now);
        if let Some(archive) = &archive {
            tracing::info!(
                "Ended archive with {} pages and {} entries",
                archive.pages.len(),
                archive.entries.len()
            );
        }
        archive
    }

    /// Copy of the open archive.
    ///
    /// With `clean` set, returns a new archive holding only the default page
    /// instead; the open archive is left untouched either way.
    pub fn archive(&self, clean: bool) -> Option<Archive> {
        if clean {
            let mut archive = Archive::new(&self.config);
            archive.pages.push(Page::new(
                self.config.default_page_ref.as_str(),
                self.config.default_page_title.as_str(),
                self.now(),
            ));
            return Some(archive);
        }
        self.state.lock().archive.clone()
    }

    /// Id of the current page, if an archive is open and a page is current.
    pub fn current_page_id(&self) -> Option<String> {
        let state = self.state.lock();
        let index = state.current_page?;
        state.archive.as_ref()?.pages.get(index).map(|p| p.id.clone())
    }

    /// Returns true if an archive is open.
    pub fn is_open(&self) -> bool {
        self.state.lock().archive.is_some()
    }

    /// Records a finished exchange as a new entry.
    ///
    /// `measured` holds the phases reported through lifecycle callbacks;
    /// send/wait/receive from the exchange's own timestamps and the
    /// connection's connect/TLS time take precedence over them.
    pub fn record_exchange_completion(&self, exchange: &HttpExchange, measured: &Timings) -> Option<Snapshot> {
        let conn = exchange.connection();
        let (connect, ssl) = self
            .recorder
            .connection_phases(&exchange.server_conn, &self.recorder.snapshot(conn));

        let mut timings = *measured;
        timings.merge_known(&transfer_timings(exchange));
        timings.merge_known(&Timings {
            connect,
            ssl,
            ..Timings::unknown()
        });

        let now = self.now();
        let snapshot = {
            let mut state = self.state.lock();
            if state.entries_by_exchange.contains_key(&exchange.id) {
                tracing::debug!("{} already has an entry", exchange.id);
                return None;
            }
            state.ensure_archive(
                &self.config,
                Some(self.config.default_page_ref.as_str()),
                Some(self.config.default_page_title.as_str()),
                true,
                now,
            );
            let pageref = state.current_page_ref(&self.config, now)?;

            let Some(entry) = build_entry(exchange, &pageref, timings, now) else {
                tracing::trace!("Exchange {} finished without a request", exchange.id);
                return None;
            };
            tracing::debug!(
                "Recorded {} {} in {}ms on page '{}'",
                entry.request.method,
                entry.request.url,
                entry.time,
                pageref
            );

            let archive = state.archive.as_mut()?;
            archive.entries.push(entry);
            let index = archive.entries.len() - 1;
            state.entries_by_exchange.insert(exchange.id, index);
            self.config.persist_on_entry.then(|| state.snapshot()).flatten()
        };

        Some(self.persist_har(snapshot))
    }

    /// Records a failed exchange.
    ///
    /// An entry already recorded for the exchange is annotated in place;
    /// otherwise a fallback entry is built from the request. Without a
    /// request, a fallback entry is only created when
    /// [`CaptureConfig::fallback_entry_without_request`] is set.
    pub fn record_exchange_failure(
        &self,
        exchange: &HttpExchange,
        report: &FailureReport,
        timings: Timings,
    ) -> Option<Snapshot> {
        let now = self.now();
        let snapshot = {
            let mut state = self.state.lock();

            if let Some(&index) = state.entries_by_exchange.get(&exchange.id) {
                let entry = state.archive.as_mut()?.entries.get_mut(index)?;
                self.classifier.annotate(entry, exchange, report, timings);
            } else {
                if exchange.request.is_none() && !self.config.fallback_entry_without_request {
                    tracing::debug!("Dropping failure of {} without a request: {}", exchange.id, report.message);
                    return None;
                }
                state.ensure_archive(
                    &self.config,
                    Some(self.config.default_page_ref.as_str()),
                    Some(self.config.default_page_title.as_str()),
                    true,
                    now,
                );
                let pageref = state.current_page_ref(&self.config, now)?;
                let mut entry = fallback_entry(exchange.request.as_ref(), &pageref, now);
                self.classifier.annotate(&mut entry, exchange, report, timings);

                let archive = state.archive.as_mut()?;
                archive.entries.push(entry);
                let index = archive.entries.len() - 1;
                state.entries_by_exchange.insert(exchange.id, index);
            }
            tracing::debug!("Recorded failure of {}: {}", exchange.id, report.message);
            self.config.persist_on_entry.then(|| state.snapshot()).flatten()
        };

        Some(self.persist_har(snapshot))
    }

    /// Persists an archive; `None` is not persisted.
    pub fn persist(&self, archive: Option<Archive>) -> Snapshot {
        self.persist_har(archive.map(Har::new))
    }

    fn persist_har(&self, har: Option<Har>) -> Snapshot {
        let Some(har) = har else {
            return Snapshot::empty();
        };
        let handle = match self.sink.persist(&har) {
            Ok(handle) => {
                tracing::trace!("Persisted snapshot to {}", handle);
                Some(handle)
            }
            Err(e) => {
                tracing::warn!("Failed to persist snapshot: {}", e);
                None
            }
        };
        Snapshot {
            har: Some(har),
            handle,
        }
    }
}
