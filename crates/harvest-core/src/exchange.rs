//! Intercepted exchanges as reported by the proxy engine.
//!
//! These types are the input side of capture: the proxy engine fills them in
//! while it forwards traffic and hands them to the lifecycle hooks and the
//! event sequencer. Nothing in here is produced by the capture engine itself.

use std::collections::VecDeque;
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_EXCHANGE_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one upstream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Wraps a raw identifier.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Allocates a process-unique identifier.
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw identifier.
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Identity of one intercepted exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExchangeId(u64);

impl ExchangeId {
    /// Wraps a raw identifier.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Allocates a process-unique identifier.
    pub fn next() -> Self {
        Self(NEXT_EXCHANGE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw identifier.
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "flow#{}", self.0)
    }
}

/// Upstream side of an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConnection {
    pub id: ConnectionId,
    /// Resolved peer address.
    pub ip_address: Option<IpAddr>,
    /// Whether the connection is currently established.
    pub connected: bool,
    /// When the connection attempt began.
    pub timestamp_start: Option<DateTime<Utc>>,
    /// When the TCP handshake completed.
    pub timestamp_tcp_setup: Option<DateTime<Utc>>,
    /// When the TLS handshake completed.
    pub timestamp_tls_setup: Option<DateTime<Utc>>,
}

impl ServerConnection {
    /// Creates a connection record with no timestamps.
    pub fn new(id: ConnectionId) -> Self {
        Self {
            id,
            ip_address: None,
            connected: false,
            timestamp_start: None,
            timestamp_tcp_setup: None,
            timestamp_tls_setup: None,
        }
    }
}

/// Ordered header list, preserving duplicates.
pub type HeaderList = Vec<(String, String)>;

fn find_header<'a>(headers: &'a HeaderList, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn find_headers<'a>(headers: &'a HeaderList, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
    headers
        .iter()
        .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// An intercepted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub scheme: String,
    pub host: String,
    pub port: u16,
    /// Path including the query string.
    pub path: String,
    pub http_version: String,
    pub headers: HeaderList,
    /// Decoded body.
    pub content: Vec<u8>,
    pub timestamp_start: Option<DateTime<Utc>>,
    pub timestamp_end: Option<DateTime<Utc>>,
}

impl HttpRequest {
    /// Creates a body-less request.
    pub fn new(method: &str, scheme: &str, host: &str, port: u16, path: &str) -> Self {
        Self {
            method: method.to_string(),
            scheme: scheme.to_string(),
            host: host.to_string(),
            port,
            path: path.to_string(),
            http_version: "HTTP/1.1".to_string(),
            headers: Vec::new(),
            content: Vec::new(),
            timestamp_start: None,
            timestamp_end: None,
        }
    }

    /// Full request URL; the port is omitted when it is the scheme default.
    pub fn url(&self) -> String {
        let default_port = match self.scheme.as_str() {
            "https" | "wss" => 443,
            _ => 80,
        };
        if self.port == default_port {
            format!("{}://{}{}", self.scheme, self.host, self.path)
        } else {
            format!("{}://{}:{}{}", self.scheme, self.host, self.port, self.path)
        }
    }

    /// Host, with the port appended unless it is 80 or 443.
    pub fn host_port(&self) -> String {
        if self.port == 80 || self.port == 443 {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// First header with the given name, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Every header with the given name.
    pub fn headers_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        find_headers(&self.headers, name)
    }

    /// Returns true for methods that carry a body worth recording.
    pub fn is_mutating(&self) -> bool {
        matches!(self.method.to_ascii_uppercase().as_str(), "POST" | "PUT" | "PATCH")
    }
}

/// An intercepted response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status_code: u16,
    pub reason: String,
    pub http_version: String,
    pub headers: HeaderList,
    /// Body as received on the wire.
    pub raw_content: Vec<u8>,
    /// Body after content-encoding was removed.
    pub content: Vec<u8>,
    pub timestamp_start: Option<DateTime<Utc>>,
    pub timestamp_end: Option<DateTime<Utc>>,
}

impl HttpResponse {
    /// Creates a body-less response.
    pub fn new(status_code: u16, reason: &str) -> Self {
        Self {
            status_code,
            reason: reason.to_string(),
            http_version: "HTTP/1.1".to_string(),
            headers: Vec::new(),
            raw_content: Vec::new(),
            content: Vec::new(),
            timestamp_start: None,
            timestamp_end: None,
        }
    }

    /// Sets an unencoded body.
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        let body = body.into();
        self.raw_content = body.clone();
        self.content = body;
        self
    }

    /// First header with the given name, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Every header with the given name.
    pub fn headers_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        find_headers(&self.headers, name)
    }
}

/// Terminal error attached to an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowError {
    pub msg: String,
    pub timestamp: DateTime<Utc>,
}

impl FlowError {
    /// Creates an error stamped now.
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            msg: msg.into(),
            timestamp: Utc::now(),
        }
    }
}

/// A request/response exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpExchange {
    pub id: ExchangeId,
    pub server_conn: ServerConnection,
    pub request: Option<HttpRequest>,
    pub response: Option<HttpResponse>,
    pub error: Option<FlowError>,
}

impl HttpExchange {
    /// Creates an exchange on `conn` with nothing observed yet.
    pub fn new(conn: ConnectionId) -> Self {
        Self {
            id: ExchangeId::next(),
            server_conn: ServerConnection::new(conn),
            request: None,
            response: None,
            error: None,
        }
    }

    /// Attaches the request.
    pub fn with_request(mut self, request: HttpRequest) -> Self {
        self.request = Some(request);
        self
    }

    /// Attaches the response.
    pub fn with_response(mut self, response: HttpResponse) -> Self {
        self.response = Some(response);
        self
    }

    /// Connection the exchange runs on.
    pub fn connection(&self) -> ConnectionId {
        self.server_conn.id
    }
}

/// One frame of a message or byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    pub from_client: bool,
    pub content: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

impl StreamMessage {
    /// Creates a message stamped now.
    pub fn new(from_client: bool, content: impl Into<Vec<u8>>) -> Self {
        Self {
            from_client,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// A message-oriented (WebSocket) or byte-oriented (TCP) stream exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamExchange {
    pub id: ExchangeId,
    pub server_conn: ServerConnection,
    /// Delivered messages, in arrival order.
    pub messages: Vec<StreamMessage>,
    pub error: Option<FlowError>,
}

impl StreamExchange {
    /// Creates an exchange on `conn` with no messages.
    pub fn new(conn: ConnectionId) -> Self {
        Self {
            id: ExchangeId::next(),
            server_conn: ServerConnection::new(conn),
            messages: Vec::new(),
            error: None,
        }
    }

    /// Appends a message.
    pub fn push(&mut self, message: StreamMessage) {
        self.messages.push(message);
    }

    pub(crate) fn take_pending(&mut self) -> VecDeque<StreamMessage> {
        std::mem::take(&mut self.messages).into()
    }
}

/// A flow whose kind the capture engine does not model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpaqueExchange {
    pub id: ExchangeId,
    /// Engine-reported kind, e.g. `"dns"` or `"quic"`.
    pub kind: String,
}

/// Any intercepted exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exchange {
    Http(HttpExchange),
    WebSocket(StreamExchange),
    Tcp(StreamExchange),
    Other(OpaqueExchange),
}

impl Exchange {
    /// Exchange identity.
    pub fn id(&self) -> ExchangeId {
        match self {
            Exchange::Http(f) => f.id,
            Exchange::WebSocket(f) | Exchange::Tcp(f) => f.id,
            Exchange::Other(f) => f.id,
        }
    }

    /// Kind tag of the exchange.
    pub fn kind(&self) -> &str {
        match self {
            Exchange::Http(_) => "http",
            Exchange::WebSocket(_) => "websocket",
            Exchange::Tcp(_) => "tcp",
            Exchange::Other(f) => &f.kind,
        }
    }

    /// Terminal error, if any.
    pub fn error(&self) -> Option<&FlowError> {
        match self {
            Exchange::Http(f) => f.error.as_ref(),
            Exchange::WebSocket(f) | Exchange::Tcp(f) => f.error.as_ref(),
            Exchange::Other(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_omits_default_port() {
        let req = HttpRequest::new("GET", "https", "example.com", 443, "/a?b=c");
        assert_eq!(req.url(), "https://example.com/a?b=c");

        let req = HttpRequest::new("GET", "http", "example.com", 8080, "/");
        assert_eq!(req.url(), "http://example.com:8080/");
    }

    #[test]
    fn host_port_only_for_non_standard_ports() {
        let req = HttpRequest::new("GET", "https", "example.com", 443, "/");
        assert_eq!(req.host_port(), "example.com");
        let req = HttpRequest::new("GET", "http", "example.com", 8443, "/");
        assert_eq!(req.host_port(), "example.com:8443");
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let mut req = HttpRequest::new("POST", "http", "h", 80, "/");
        req.headers.push(("Content-Type".into(), "text/plain".into()));
        req.headers.push(("X-Multi".into(), "1".into()));
        req.headers.push(("x-multi".into(), "2".into()));
        assert_eq!(req.header("content-type"), Some("text/plain"));
        assert_eq!(req.headers_named("X-MULTI").collect::<Vec<_>>(), vec!["1", "2"]);
        assert!(req.is_mutating());
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(ExchangeId::next(), ExchangeId::next());
        assert_ne!(ConnectionId::next(), ConnectionId::next());
    }

    #[test]
    fn exchange_kind_tags() {
        let http = Exchange::Http(HttpExchange::new(ConnectionId::new(1)));
        assert_eq!(http.kind(), "http");
        let other = Exchange::Other(OpaqueExchange {
            id: ExchangeId::new(9),
            kind: "quic".into(),
        });
        assert_eq!(other.kind(), "quic");
        assert_eq!(other.id(), ExchangeId::new(9));
    }
}
