//! hudsucker handler that reports intercepted traffic to the capture hooks.
//!
//! hudsucker clones the handler for every request, so the exchange begun in
//! `handle_request` is still held when `handle_response` or `handle_error`
//! runs for the same request. Upstream connections are pooled inside the
//! engine and not visible here; every exchange gets a connection id of its
//! own, which is closed again once the exchange is finished.

use std::error::Error as StdError;
use std::io::{self, Read};
use std::sync::Arc;

use chrono::Utc;
use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use harvest_core::{ConnectionId, FlowError, HttpExchange, HttpRequest, HttpResponse, LifecycleHooks};
use http_body_util::{BodyExt, Full};
use hudsucker::{
    hyper::{Request, Response},
    Body, HttpContext, HttpHandler, RequestOrResponse,
};
use hyper::body::Bytes;
use hyper::{header, HeaderMap, Method, StatusCode, Uri, Version};

fn bytes_to_body(bytes: Bytes) -> Body {
    Body::from(Full::new(bytes))
}

async fn collect_body(body: Body, what: &str) -> Bytes {
    match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            tracing::warn!("Failed to read {} body: {}", what, e);
            Bytes::new()
        }
    }
}

fn version_label(version: Version) -> String {
    format!("{:?}", version)
}

fn header_list(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

/// Splits `host[:port]`, keeping bracketed IPv6 literals intact.
fn split_host_port(authority: &str) -> (&str, Option<u16>) {
    match authority.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && (!host.contains(':') || host.ends_with(']')) => {
            match port.parse() {
                Ok(port) => (host, Some(port)),
                Err(_) => (authority, None),
            }
        }
        _ => (authority, None),
    }
}

/// Builds the request record from the parts hudsucker hands over.
///
/// Absolute-form URIs carry scheme and authority; for origin-form requests
/// the `Host` header supplies them.
pub fn request_record(
    method: &Method,
    uri: &Uri,
    version: Version,
    headers: &HeaderMap,
    body: &[u8],
) -> HttpRequest {
    let scheme = uri.scheme_str().unwrap_or("http");
    let host_header = headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(split_host_port);

    let host = uri
        .host()
        .or_else(|| host_header.map(|(host, _)| host))
        .unwrap_or_default();
    let default_port = if scheme == "https" { 443 } else { 80 };
    let port = uri
        .port_u16()
        .or_else(|| host_header.and_then(|(_, port)| port))
        .unwrap_or(default_port);
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

    let mut request = HttpRequest::new(method.as_str(), scheme, host, port, path);
    request.http_version = version_label(version);
    request.headers = header_list(headers);
    request.content = body.to_vec();
    request
}

/// Undoes a `Content-Encoding`; unknown encodings are returned as is.
pub fn decode_body(encoding: Option<&str>, raw: &[u8]) -> io::Result<Vec<u8>> {
    let encoding = encoding.map(|e| e.trim().to_ascii_lowercase());
    let mut decoded = Vec::new();
    match encoding.as_deref() {
        Some("gzip") | Some("x-gzip") => {
            GzDecoder::new(raw).read_to_end(&mut decoded)?;
        }
        // Servers disagree on whether deflate means zlib-wrapped or raw.
        Some("deflate") => {
            if ZlibDecoder::new(raw).read_to_end(&mut decoded).is_err() {
                decoded.clear();
                DeflateDecoder::new(raw).read_to_end(&mut decoded)?;
            }
        }
        _ => return Ok(raw.to_vec()),
    }
    Ok(decoded)
}

/// Builds the response record; `raw` is the body as received.
pub fn response_record(status: StatusCode, version: Version, headers: &HeaderMap, raw: &[u8]) -> HttpResponse {
    let mut response = HttpResponse::new(status.as_u16(), status.canonical_reason().unwrap_or_default());
    response.http_version = version_label(version);
    response.headers = header_list(headers);
    response.raw_content = raw.to_vec();

    let encoding = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|h| h.to_str().ok());
    response.content = match decode_body(encoding, raw) {
        Ok(decoded) => decoded,
        Err(e) => {
            tracing::debug!("Keeping undecodable {:?} body: {}", encoding, e);
            raw.to_vec()
        }
    };
    response
}

fn bad_gateway() -> Response<Body> {
    let mut res = Response::new(bytes_to_body(Bytes::from_static(b"Bad Gateway")));
    *res.status_mut() = StatusCode::BAD_GATEWAY;
    res
}

/// Reports each intercepted request to a set of [`LifecycleHooks`].
#[derive(Clone)]
pub struct CaptureHandler {
    hooks: Arc<dyn LifecycleHooks>,
    in_flight: Option<HttpExchange>,
}

impl std::fmt::Debug for CaptureHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureHandler")
            .field("in_flight", &self.in_flight.as_ref().map(|ex| ex.id))
            .finish()
    }
}

impl CaptureHandler {
    /// Creates a handler reporting to `hooks`.
    pub fn new(hooks: Arc<dyn LifecycleHooks>) -> Self {
        Self {
            hooks,
            in_flight: None,
        }
    }

    /// The exchange waiting for its response, if any.
    pub fn in_flight(&self) -> Option<&HttpExchange> {
        self.in_flight.as_ref()
    }

    /// Starts an exchange for a request that is about to go upstream.
    pub fn begin(&mut self, request: HttpRequest) {
        let exchange = HttpExchange::new(ConnectionId::next()).with_request(request);
        if let Some(request) = &exchange.request {
            tracing::trace!("{} {} {}", exchange.id, request.method, request.url());
        }
        self.hooks.request_send_started(&exchange);
        self.hooks.request_send_finished(&exchange);
        self.in_flight = Some(exchange);
    }

    /// The first response bytes arrived.
    pub fn response_started(&self) {
        if let Some(exchange) = &self.in_flight {
            self.hooks.response_receive_started(exchange);
        }
    }

    /// Finishes the in-flight exchange with its response.
    pub fn complete(&mut self, response: HttpResponse) {
        let Some(mut exchange) = self.in_flight.take() else {
            return;
        };
        exchange.response = Some(response);
        self.hooks.response_receive_finished(&exchange);
        self.hooks.exchange_completed(&exchange);
        self.hooks.connection_closed(exchange.connection());
    }

    /// Finishes the in-flight exchange with an upstream failure.
    pub fn fail(&mut self, failure: &(dyn StdError + 'static)) {
        let Some(mut exchange) = self.in_flight.take() else {
            return;
        };
        exchange.error = Some(FlowError::new(failure.to_string()));
        self.hooks.exchange_failed(&exchange, Some(failure));
        self.hooks.connection_closed(exchange.connection());
    }
}

impl HttpHandler for CaptureHandler {
    async fn handle_request(&mut self, _ctx: &HttpContext, req: Request<Body>) -> RequestOrResponse {
        // Tunnels are opened here; the requests inside them come back through this handler.
        if req.method() == Method::CONNECT {
            return RequestOrResponse::Request(req);
        }

        let started = Utc::now();
        let (parts, body) = req.into_parts();
        let bytes = collect_body(body, "request").await;

        let mut request = request_record(&parts.method, &parts.uri, parts.version, &parts.headers, &bytes);
        request.timestamp_start = Some(started);
        request.timestamp_end = Some(Utc::now());
        self.begin(request);

        RequestOrResponse::Request(Request::from_parts(parts, bytes_to_body(bytes)))
    }

    async fn handle_response(&mut self, _ctx: &HttpContext, res: Response<Body>) -> Response<Body> {
        if self.in_flight.is_none() {
            return res;
        }

        let started = Utc::now();
        self.response_started();
        let (parts, body) = res.into_parts();
        let raw = collect_body(body, "response").await;

        let mut response = response_record(parts.status, parts.version, &parts.headers, &raw);
        response.timestamp_start = Some(started);
        response.timestamp_end = Some(Utc::now());
        self.complete(response);

        Response::from_parts(parts, bytes_to_body(raw))
    }

    async fn handle_error(
        &mut self,
        _ctx: &HttpContext,
        err: hyper_util::client::legacy::Error,
    ) -> Response<Body> {
        tracing::warn!("Upstream request failed: {}", err);
        self.fail(&err);
        bad_gateway()
    }
}
