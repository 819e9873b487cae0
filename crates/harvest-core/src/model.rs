//! Archive data model.
//!
//! Passive structures for the capture archive: the document root ([`Har`]),
//! the [`Archive`] log with its [`Page`]s and [`Entry`]s, and the per-entry
//! [`Timings`]. Field names follow the HTTP Archive layout so a serialized
//! snapshot can be loaded by existing HAR tooling.
//!
//! ## Invariants
//!
//! - `Entry::time` is the sum of every timing phase that is not
//!   [`Timing::NotApplicable`].
//! - Every entry's `pageref` names a page present in the same archive.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::CaptureConfig;

/// Encoded value of a timing phase that does not apply.
pub const NOT_APPLICABLE: i64 = -1;

/// A single timing phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum Timing {
    /// Phase duration in whole milliseconds.
    Ms(u64),
    /// Phase did not happen or could not be measured.
    #[default]
    NotApplicable,
}

impl Timing {
    /// Returns the duration if the phase applies.
    pub fn ms(&self) -> Option<u64> {
        match self {
            Timing::Ms(ms) => Some(*ms),
            Timing::NotApplicable => None,
        }
    }

    /// Returns true if the phase carries a measurement.
    pub fn is_applicable(&self) -> bool {
        matches!(self, Timing::Ms(_))
    }

    /// Builds a timing from a signed millisecond delta; negative deltas do not apply.
    pub fn from_delta_ms(ms: i64) -> Self {
        Timing::from(ms)
    }

    /// Builds a timing from a chrono duration, truncated to whole milliseconds.
    pub fn from_duration(delta: chrono::Duration) -> Self {
        Timing::from(delta.num_milliseconds())
    }
}

impl From<i64> for Timing {
    fn from(ms: i64) -> Self {
        if ms < 0 {
            Timing::NotApplicable
        } else {
            Timing::Ms(ms as u64)
        }
    }
}

impl From<Timing> for i64 {
    fn from(timing: Timing) -> Self {
        match timing {
            Timing::Ms(ms) => i64::try_from(ms).unwrap_or(i64::MAX),
            Timing::NotApplicable => NOT_APPLICABLE,
        }
    }
}

impl From<std::time::Duration> for Timing {
    fn from(duration: std::time::Duration) -> Self {
        Timing::Ms(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }
}

/// Root of a serialized archive document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Har {
    /// The archive log.
    pub log: Archive,
}

impl Har {
    /// Wraps an archive log.
    pub fn new(log: Archive) -> Self {
        Self { log }
    }

    /// Serializes the document to JSON.
    pub fn to_json(&self, pretty: bool) -> serde_json::Result<String> {
        if pretty {
            serde_json::to_string_pretty(self)
        } else {
            serde_json::to_string(self)
        }
    }

    /// Parses a document from JSON.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

impl From<Archive> for Har {
    fn from(log: Archive) -> Self {
        Self::new(log)
    }
}

/// Tool that produced the archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Creator {
    /// Tool name.
    pub name: String,
    /// Tool version.
    pub version: String,
    /// Free-form comment.
    #[serde(default)]
    pub comment: String,
}

/// Accumulated pages and entries of one capture session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Archive {
    /// Format version.
    pub version: String,
    /// Producing tool.
    pub creator: Creator,
    /// Pages in creation order.
    #[serde(default)]
    pub pages: Vec<Page>,
    /// Entries in append order.
    #[serde(default)]
    pub entries: Vec<Entry>,
}

impl Archive {
    /// Creates an empty archive stamped with the configured creator.
    pub fn new(config: &CaptureConfig) -> Self {
        Self {
            version: config.archive_version.clone(),
            creator: Creator {
                name: config.creator_name.clone(),
                version: config.creator_version.clone(),
                comment: config.creator_comment.clone(),
            },
            pages: Vec::new(),
            entries: Vec::new(),
        }
    }

    /// Creates an empty archive with the same version and creator.
    pub fn empty_like(&self) -> Self {
        Self {
            version: self.version.clone(),
            creator: self.creator.clone(),
            pages: Vec::new(),
            entries: Vec::new(),
        }
    }

    /// Returns the first page with the given id.
    pub fn page(&self, id: &str) -> Option<&Page> {
        self.pages.iter().find(|p| p.id == id)
    }

    /// Returns the position of the first page with the given id.
    pub fn page_index(&self, id: &str) -> Option<usize> {
        self.pages.iter().position(|p| p.id == id)
    }

    /// Returns true if a page with the given id exists.
    pub fn has_page(&self, id: &str) -> bool {
        self.page(id).is_some()
    }

    /// Entries referencing the given page.
    pub fn entries_for<'a>(&'a self, page_id: &'a str) -> impl Iterator<Item = &'a Entry> + 'a {
        self.entries.iter().filter(move |e| e.pageref == page_id)
    }

    /// Copies the pages up to and including `index`, with their entries.
    ///
    /// Order of pages and entries is preserved. An out-of-range index copies
    /// every page.
    pub fn through_page(&self, index: usize) -> Archive {
        let end = index.saturating_add(1).min(self.pages.len());
        let pages: Vec<Page> = self.pages[..end].to_vec();
        let entries = self
            .entries
            .iter()
            .filter(|e| pages.iter().any(|p| p.id == e.pageref))
            .cloned()
            .collect();

        Archive {
            pages,
            entries,
            ..self.empty_like()
        }
    }
}

/// Aggregate load timings of a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageTimings {
    /// Time until the content was loaded.
    pub on_content_load: Timing,
    /// Time from page start until the page was ended.
    pub on_load: Timing,
    /// Free-form comment.
    #[serde(default)]
    pub comment: String,
}

impl Default for PageTimings {
    fn default() -> Self {
        Self {
            on_content_load: Timing::NotApplicable,
            on_load: Timing::NotApplicable,
            comment: String::new(),
        }
    }
}

/// A logical group of entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    /// Stable reference used by entries.
    pub id: String,
    /// Display title.
    pub title: String,
    /// When the page started.
    pub started_date_time: DateTime<Utc>,
    /// Aggregate timings.
    pub page_timings: PageTimings,
}

impl Page {
    /// Creates a page started at `started`.
    pub fn new(id: impl Into<String>, title: impl Into<String>, started: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            started_date_time: started,
            page_timings: PageTimings::default(),
        }
    }

    /// Records the load time as `now - started`.
    pub fn finish(&mut self, now: DateTime<Utc>) {
        self.page_timings.on_load = Timing::from_duration(now - self.started_date_time);
    }
}

/// A name/value pair (headers, query parameters, form fields).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameValue {
    /// Name.
    pub name: String,
    /// Value.
    pub value: String,
}

impl NameValue {
    /// Creates a pair.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A request or response cookie.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cookie {
    /// Cookie name.
    pub name: String,
    /// Cookie value.
    pub value: String,
    /// Path attribute.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Domain attribute.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    /// Comment attribute.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// Absolute expiry time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,
    /// HttpOnly flag.
    #[serde(default)]
    pub http_only: bool,
    /// Secure flag.
    #[serde(default)]
    pub secure: bool,
}

/// Decoded body of a mutating request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostData {
    /// Request content type.
    pub mime_type: String,
    /// Body as text.
    pub text: String,
    /// Urlencoded form fields.
    #[serde(default)]
    pub params: Vec<NameValue>,
}

/// Recorded request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    pub method: String,
    pub url: String,
    pub http_version: String,
    #[serde(default)]
    pub cookies: Vec<Cookie>,
    #[serde(default)]
    pub headers: Vec<NameValue>,
    #[serde(default)]
    pub query_string: Vec<NameValue>,
    pub headers_size: i64,
    pub body_size: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_data: Option<PostData>,
}

/// Response body metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    /// Size of the body as received on the wire.
    pub size: i64,
    /// Decoded size minus wire size.
    #[serde(default)]
    pub compression: i64,
    /// Content-Type of the response.
    pub mime_type: String,
    /// Body text, base64 when `encoding` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Encoding applied to `text`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
}

impl Content {
    /// Size of the decoded body.
    pub fn decoded_size(&self) -> i64 {
        self.size + self.compression
    }
}

impl Default for Content {
    fn default() -> Self {
        Self {
            size: 0,
            compression: 0,
            mime_type: String::new(),
            text: None,
            encoding: None,
        }
    }
}

/// Recorded response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseRecord {
    pub status: u16,
    pub status_text: String,
    pub http_version: String,
    #[serde(default)]
    pub cookies: Vec<Cookie>,
    #[serde(default)]
    pub headers: Vec<NameValue>,
    pub content: Content,
    #[serde(rename = "redirectURL", default)]
    pub redirect_url: String,
    pub headers_size: i64,
    pub body_size: i64,
    /// Failure description for exchanges that never got a real response.
    #[serde(rename = "_errorMessage", default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ResponseRecord {
    /// Placeholder response for exchanges that failed before one arrived.
    pub fn placeholder() -> Self {
        Self {
            status: 0,
            status_text: String::new(),
            http_version: String::new(),
            cookies: Vec::new(),
            headers: Vec::new(),
            content: Content::default(),
            redirect_url: String::new(),
            headers_size: -1,
            body_size: -1,
            error_message: None,
        }
    }
}

/// Cache information; always empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cache {}

/// Named timing phases of an entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timings {
    #[serde(default)]
    pub blocked: Timing,
    #[serde(default)]
    pub dns: Timing,
    #[serde(default)]
    pub connect: Timing,
    #[serde(default)]
    pub ssl: Timing,
    #[serde(default)]
    pub send: Timing,
    #[serde(default)]
    pub wait: Timing,
    #[serde(default)]
    pub receive: Timing,
}

impl Timings {
    /// Every phase set to not applicable.
    pub fn unknown() -> Self {
        Self::default()
    }

    fn phases(&self) -> [Timing; 7] {
        [
            self.blocked,
            self.dns,
            self.connect,
            self.ssl,
            self.send,
            self.wait,
            self.receive,
        ]
    }

    /// Sum of all applicable phases.
    pub fn total_ms(&self) -> u64 {
        self.phases().iter().filter_map(Timing::ms).sum()
    }

    /// Copies every applicable phase of `other` over this one.
    pub fn merge_known(&mut self, other: &Timings) {
        let pairs = [
            (&mut self.blocked, other.blocked),
            (&mut self.dns, other.dns),
            (&mut self.connect, other.connect),
            (&mut self.ssl, other.ssl),
            (&mut self.send, other.send),
            (&mut self.wait, other.wait),
            (&mut self.receive, other.receive),
        ];
        for (slot, value) in pairs {
            if value.is_applicable() {
                *slot = value;
            }
        }
    }
}

/// One captured exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    /// Page the entry belongs to.
    pub pageref: String,
    /// When the request started.
    pub started_date_time: DateTime<Utc>,
    /// Sum of the applicable timing phases in milliseconds.
    pub time: u64,
    pub request: RequestRecord,
    pub response: ResponseRecord,
    #[serde(default)]
    pub cache: Cache,
    pub timings: Timings,
    #[serde(rename = "serverIPAddress", default, skip_serializing_if = "Option::is_none")]
    pub server_ip_address: Option<String>,
}

impl Entry {
    /// Recomputes `time` from the timing phases.
    pub fn recompute_time(&mut self) {
        self.time = self.timings.total_ms();
    }

    /// Failure message attached by the classifier, if any.
    pub fn error_message(&self) -> Option<&str> {
        self.response.error_message.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(pageref: &str) -> Entry {
        Entry {
            pageref: pageref.to_string(),
            started_date_time: Utc::now(),
            time: 0,
            request: RequestRecord {
                method: "GET".into(),
                url: "http://example.com/".into(),
                http_version: "HTTP/1.1".into(),
                cookies: vec![],
                headers: vec![NameValue::new("Host", "example.com")],
                query_string: vec![],
                headers_size: 20,
                body_size: 0,
                post_data: None,
            },
            response: ResponseRecord::placeholder(),
            cache: Cache::default(),
            timings: Timings::unknown(),
            server_ip_address: None,
        }
    }

    fn archive_with_pages(ids: &[&str]) -> Archive {
        let mut archive = Archive::new(&CaptureConfig::default());
        for id in ids {
            archive.pages.push(Page::new(*id, *id, Utc::now()));
            archive.entries.push(entry(id));
        }
        archive
    }

    #[test]
    fn timing_serializes_sentinel() {
        assert_eq!(serde_json::to_string(&Timing::NotApplicable).unwrap(), "-1");
        assert_eq!(serde_json::to_string(&Timing::Ms(42)).unwrap(), "42");
        let parsed: Timing = serde_json::from_str("-1").unwrap();
        assert_eq!(parsed, Timing::NotApplicable);
        let negative: Timing = serde_json::from_str("-7").unwrap();
        assert_eq!(negative, Timing::NotApplicable);
    }

    #[test]
    fn total_skips_not_applicable() {
        let timings = Timings {
            send: Timing::Ms(50),
            wait: Timing::Ms(120),
            receive: Timing::Ms(30),
            ..Timings::unknown()
        };
        assert_eq!(timings.total_ms(), 200);
        assert_eq!(Timings::unknown().total_ms(), 0);
    }

    #[test]
    fn merge_known_keeps_existing_values() {
        let mut base = Timings {
            dns: Timing::Ms(5),
            ..Timings::unknown()
        };
        let other = Timings {
            send: Timing::Ms(3),
            ..Timings::unknown()
        };
        base.merge_known(&other);
        assert_eq!(base.dns, Timing::Ms(5));
        assert_eq!(base.send, Timing::Ms(3));
        assert_eq!(base.wait, Timing::NotApplicable);
    }

    #[test]
    fn through_page_is_inclusive_and_ordered() {
        let archive = archive_with_pages(&["a", "b", "c"]);
        let copy = archive.through_page(1);
        let ids: Vec<_> = copy.pages.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        let refs: Vec<_> = copy.entries.iter().map(|e| e.pageref.as_str()).collect();
        assert_eq!(refs, vec!["a", "b"]);
        assert_eq!(copy.creator, archive.creator);
    }

    #[test]
    fn through_page_out_of_range_copies_all() {
        let archive = archive_with_pages(&["a", "b"]);
        assert_eq!(archive.through_page(10).pages.len(), 2);
    }

    #[test]
    fn page_finish_records_on_load() {
        let start = Utc::now();
        let mut page = Page::new("p", "p", start);
        assert!(!page.page_timings.on_load.is_applicable());
        page.finish(start + chrono::Duration::milliseconds(750));
        assert_eq!(page.page_timings.on_load, Timing::Ms(750));
    }

    #[test]
    fn serialized_entry_uses_archive_field_names() {
        let mut e = entry("Default");
        e.server_ip_address = Some("10.0.0.1".into());
        e.response.error_message = Some("boom".into());
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["pageref"], "Default");
        assert_eq!(json["serverIPAddress"], "10.0.0.1");
        assert_eq!(json["response"]["_errorMessage"], "boom");
        assert_eq!(json["response"]["redirectURL"], "");
        assert_eq!(json["timings"]["connect"], -1);
        assert_eq!(json["cache"], serde_json::json!({}));
        assert!(json["request"].get("postData").is_none());
    }

    #[test]
    fn archive_round_trip_preserves_pages_and_entries() {
        let archive = archive_with_pages(&["first", "second", "third"]);
        let har = Har::new(archive.clone());
        let json = har.to_json(true).unwrap();
        let parsed = Har::from_json(&json).unwrap();

        let ids: Vec<_> = parsed.log.pages.iter().map(|p| p.id.clone()).collect();
        assert_eq!(ids, vec!["first", "second", "third"]);
        assert_eq!(parsed.log.entries, archive.entries);
        assert_eq!(parsed, har);
    }
}
