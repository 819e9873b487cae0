//! Building archive entries from intercepted exchanges.
//!
//! Converts the engine's request/response records into the archive's entry
//! layout: header and query lists, cookies with boolean `httpOnly`/`secure`
//! flags and absolute expiry, form post-data for mutating requests, and
//! response content stored either as text or as base64 for binary bodies.

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, NaiveDateTime, Utc};
use url::form_urlencoded;

use crate::exchange::{HeaderList, HttpExchange, HttpRequest, HttpResponse};
use crate::model::{
    Cache, Content, Cookie, Entry, NameValue, PostData, RequestRecord, ResponseRecord, Timing,
    Timings,
};

/// Share of control bytes above which a body is treated as binary.
const BINARY_THRESHOLD: f64 = 0.3;

/// Number of leading bytes inspected by the binary heuristic.
const BINARY_SAMPLE_LEN: usize = 100;

/// Content type of urlencoded form bodies.
const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";

/// Returns true if more than 30% of the first 100 bytes are control or
/// non-ASCII bytes.
pub fn is_mostly_binary(data: &[u8]) -> bool {
    if data.is_empty() {
        return false;
    }
    let sample = &data[..data.len().min(BINARY_SAMPLE_LEN)];
    let suspicious = sample
        .iter()
        .filter(|&&b| b < 9 || (13 < b && b < 32) || b > 126)
        .count();
    suspicious as f64 / sample.len() as f64 > BINARY_THRESHOLD
}

/// Converts a header list to name/value pairs.
pub fn name_value(headers: &HeaderList) -> Vec<NameValue> {
    headers
        .iter()
        .map(|(name, value)| NameValue::new(name.as_str(), value.as_str()))
        .collect()
}

/// Approximate size of the serialized header block.
pub fn headers_size(headers: &HeaderList) -> i64 {
    headers
        .iter()
        .map(|(name, value)| (name.len() + value.len() + 4) as i64)
        .sum()
}

/// Query parameters of a request path.
pub fn query_string(path: &str) -> Vec<NameValue> {
    match path.split_once('?') {
        Some((_, query)) => form_urlencoded::parse(query.as_bytes())
            .map(|(k, v)| NameValue::new(k.into_owned(), v.into_owned()))
            .collect(),
        None => Vec::new(),
    }
}

/// Cookies sent with a request.
pub fn request_cookies(request: &HttpRequest) -> Vec<Cookie> {
    request
        .headers_named("cookie")
        .flat_map(|header| header.split(';'))
        .filter_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            Some(Cookie {
                name: name.trim().to_string(),
                value: value.trim().to_string(),
                path: None,
                domain: None,
                comment: None,
                expires: None,
                http_only: false,
                secure: false,
            })
        })
        .collect()
}

/// Parses a cookie `Expires` attribute.
fn parse_cookie_date(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc2822(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%a, %d-%b-%Y %H:%M:%S GMT", "%A, %d-%b-%y %H:%M:%S GMT"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Parses one `Set-Cookie` header. `Max-Age` wins over `Expires`.
pub fn parse_set_cookie(header: &str, now: DateTime<Utc>) -> Option<Cookie> {
    let mut parts = header.split(';');
    let (name, value) = parts.next()?.trim().split_once('=')?;
    let mut cookie = Cookie {
        name: name.trim().to_string(),
        value: value.trim().to_string(),
        path: None,
        domain: None,
        comment: None,
        expires: None,
        http_only: false,
        secure: false,
    };

    let mut max_age = None;
    let mut expires = None;
    for attr in parts {
        let attr = attr.trim();
        let (key, val) = match attr.split_once('=') {
            Some((k, v)) => (k.trim(), Some(v.trim())),
            None => (attr, None),
        };
        match (key.to_ascii_lowercase().as_str(), val) {
            ("path", Some(v)) => cookie.path = Some(v.to_string()),
            ("domain", Some(v)) => cookie.domain = Some(v.to_string()),
            ("comment", Some(v)) => cookie.comment = Some(v.to_string()),
            ("httponly", _) => cookie.http_only = true,
            ("secure", _) => cookie.secure = true,
            ("max-age", Some(v)) => max_age = v.parse::<i64>().ok(),
            ("expires", Some(v)) => expires = parse_cookie_date(v),
            _ => {}
        }
    }

    // Out-of-range Max-Age values fall back to Expires.
    cookie.expires = max_age
        .and_then(chrono::Duration::try_seconds)
        .and_then(|age| now.checked_add_signed(age))
        .or(expires);
    Some(cookie)
}

/// Cookies set by a response.
pub fn response_cookies(response: &HttpResponse, now: DateTime<Utc>) -> Vec<Cookie> {
    response
        .headers_named("set-cookie")
        .filter_map(|header| parse_set_cookie(header, now))
        .collect()
}

/// Body of a POST, PUT or PATCH request.
pub fn post_data(request: &HttpRequest) -> Option<PostData> {
    if !request.is_mutating() {
        return None;
    }
    let mime_type = request.header("content-type").unwrap_or_default().to_string();
    let params = if mime_type.to_ascii_lowercase().starts_with(FORM_URLENCODED) {
        form_urlencoded::parse(&request.content)
            .map(|(k, v)| NameValue::new(k.into_owned(), v.into_owned()))
            .collect()
    } else {
        Vec::new()
    };
    Some(PostData {
        mime_type,
        text: String::from_utf8_lossy(&request.content).into_owned(),
        params,
    })
}

/// Content metadata and body text of a response.
pub fn response_content(response: &HttpResponse) -> Content {
    let size = response.raw_content.len() as i64;
    let decoded = response.content.len() as i64;
    let mut content = Content {
        size,
        compression: decoded - size,
        mime_type: response.header("content-type").unwrap_or_default().to_string(),
        text: None,
        encoding: None,
    };
    if is_mostly_binary(&response.content) {
        content.text = Some(STANDARD.encode(&response.content));
        content.encoding = Some("base64".to_string());
    } else {
        content.text = Some(String::from_utf8_lossy(&response.content).into_owned());
    }
    content
}

/// Request part of an entry.
pub fn request_record(request: &HttpRequest) -> RequestRecord {
    RequestRecord {
        method: request.method.clone(),
        url: request.url(),
        http_version: request.http_version.clone(),
        cookies: request_cookies(request),
        headers: name_value(&request.headers),
        query_string: query_string(&request.path),
        headers_size: headers_size(&request.headers),
        body_size: request.content.len() as i64,
        post_data: post_data(request),
    }
}

/// Request part for a failure that happened before any request was seen.
pub fn empty_request_record() -> RequestRecord {
    RequestRecord {
        method: String::new(),
        url: String::new(),
        http_version: String::new(),
        cookies: Vec::new(),
        headers: Vec::new(),
        query_string: Vec::new(),
        headers_size: -1,
        body_size: -1,
        post_data: None,
    }
}

/// Response part of an entry.
pub fn response_record(response: &HttpResponse, now: DateTime<Utc>) -> ResponseRecord {
    let content = response_content(response);
    ResponseRecord {
        status: response.status_code,
        status_text: response.reason.clone(),
        http_version: response.http_version.clone(),
        cookies: response_cookies(response, now),
        headers: name_value(&response.headers),
        redirect_url: response.header("location").unwrap_or_default().to_string(),
        headers_size: headers_size(&response.headers),
        body_size: content.size,
        content,
        error_message: None,
    }
}

fn delta(from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Timing {
    match (from, to) {
        (Some(from), Some(to)) => Timing::from_duration(to - from),
        _ => Timing::NotApplicable,
    }
}

/// Send, wait and receive phases from the exchange's own timestamps.
pub fn transfer_timings(exchange: &HttpExchange) -> Timings {
    let req = exchange.request.as_ref();
    let res = exchange.response.as_ref();
    let req_start = req.and_then(|r| r.timestamp_start);
    let req_end = req.and_then(|r| r.timestamp_end);
    let res_start = res.and_then(|r| r.timestamp_start);
    let res_end = res.and_then(|r| r.timestamp_end);

    Timings {
        send: delta(req_start, req_end),
        wait: delta(req_end, res_start),
        receive: delta(res_start, res_end),
        ..Timings::unknown()
    }
}

/// Builds a complete entry for a finished exchange.
///
/// Returns `None` when the exchange carries no request.
pub fn build_entry(
    exchange: &HttpExchange,
    pageref: &str,
    timings: Timings,
    now: DateTime<Utc>,
) -> Option<Entry> {
    let request = exchange.request.as_ref()?;
    let response = match exchange.response.as_ref() {
        Some(response) => response_record(response, now),
        None => ResponseRecord::placeholder(),
    };

    let server_ip_address = if exchange.server_conn.connected {
        exchange.server_conn.ip_address.map(|ip| ip.to_string())
    } else {
        None
    };

    Some(Entry {
        pageref: pageref.to_string(),
        started_date_time: request.timestamp_start.unwrap_or(now),
        time: timings.total_ms(),
        request: request_record(request),
        response,
        cache: Cache::default(),
        timings,
        server_ip_address,
    })
}

/// Builds the minimal entry recorded for a failed exchange.
pub fn fallback_entry(request: Option<&HttpRequest>, pageref: &str, now: DateTime<Utc>) -> Entry {
    Entry {
        pageref: pageref.to_string(),
        started_date_time: request.and_then(|r| r.timestamp_start).unwrap_or(now),
        time: 0,
        request: request.map(request_record).unwrap_or_else(empty_request_record),
        response: ResponseRecord::placeholder(),
        cache: Cache::default(),
        timings: Timings::unknown(),
        server_ip_address: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::ConnectionId;
    use chrono::TimeZone;

    fn sample_request() -> HttpRequest {
        let mut req = HttpRequest::new("GET", "https", "example.com", 443, "/search?q=rust&page=2");
        req.headers.push(("Host".into(), "example.com".into()));
        req.headers.push(("Cookie".into(), "session=abc; theme=dark".into()));
        req
    }

    #[test]
    fn binary_heuristic() {
        assert!(!is_mostly_binary(b""));
        assert!(!is_mostly_binary(b"hello world\nplain text\r\n"));
        assert!(is_mostly_binary(&[0x89, 0x50, 0x4e, 0x47, 0x00, 0x01, 0x02, 0x03]));
    }

    #[test]
    fn query_string_is_decoded() {
        let params = query_string("/a?name=J%C3%BCrgen&x=1+2");
        assert_eq!(params, vec![NameValue::new("name", "Jürgen"), NameValue::new("x", "1 2")]);
        assert!(query_string("/plain").is_empty());
    }

    #[test]
    fn request_cookies_have_false_flags() {
        let cookies = request_cookies(&sample_request());
        assert_eq!(cookies.len(), 2);
        assert_eq!(cookies[0].name, "session");
        assert_eq!(cookies[1].value, "dark");
        assert!(!cookies[0].http_only);
        assert!(!cookies[0].secure);
    }

    #[test]
    fn set_cookie_attributes() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let cookie = parse_set_cookie(
            "id=42; Path=/app; Domain=example.com; HttpOnly; Secure; Expires=Wed, 21 Oct 2015 07:28:00 GMT",
            now,
        )
        .unwrap();
        assert_eq!(cookie.path.as_deref(), Some("/app"));
        assert_eq!(cookie.domain.as_deref(), Some("example.com"));
        assert!(cookie.http_only);
        assert!(cookie.secure);
        assert_eq!(
            cookie.expires,
            Some(Utc.with_ymd_and_hms(2015, 10, 21, 7, 28, 0).unwrap())
        );
    }

    #[test]
    fn max_age_wins_over_expires() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let cookie =
            parse_set_cookie("a=b; Max-Age=60; Expires=Wed, 21 Oct 2015 07:28:00 GMT", now).unwrap();
        assert_eq!(cookie.expires, Some(now + chrono::Duration::seconds(60)));
        assert!(!cookie.http_only);
    }

    #[test]
    fn huge_max_age_does_not_overflow() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        let cookie = parse_set_cookie("a=b; Max-Age=9223372036854775807", now).unwrap();
        assert_eq!(cookie.expires, None);

        let cookie = parse_set_cookie("a=b; Max-Age=9000000000000", now).unwrap();
        assert_eq!(cookie.expires, None);

        let cookie =
            parse_set_cookie("a=b; Max-Age=9000000000000; Expires=Wed, 21 Oct 2015 07:28:00 GMT", now).unwrap();
        assert_eq!(cookie.expires, Some(Utc.with_ymd_and_hms(2015, 10, 21, 7, 28, 0).unwrap()));
    }

    #[test]
    fn dashed_expires_format() {
        let now = Utc::now();
        let cookie = parse_set_cookie("a=b; expires=Wed, 21-Oct-2015 07:28:00 GMT", now).unwrap();
        assert_eq!(
            cookie.expires,
            Some(Utc.with_ymd_and_hms(2015, 10, 21, 7, 28, 0).unwrap())
        );
    }

    #[test]
    fn post_data_only_for_mutating_methods() {
        assert!(post_data(&sample_request()).is_none());

        let mut req = HttpRequest::new("POST", "http", "example.com", 80, "/login");
        req.headers.push(("Content-Type".into(), "application/x-www-form-urlencoded".into()));
        req.content = b"user=ann&pass=s%26cret".to_vec();
        let data = post_data(&req).unwrap();
        assert_eq!(data.params, vec![NameValue::new("user", "ann"), NameValue::new("pass", "s&cret")]);
        assert_eq!(data.text, "user=ann&pass=s%26cret");

        let mut json = HttpRequest::new("PUT", "http", "example.com", 80, "/item");
        json.headers.push(("Content-Type".into(), "application/json".into()));
        json.content = br#"{"a":1}"#.to_vec();
        let data = post_data(&json).unwrap();
        assert!(data.params.is_empty());
        assert_eq!(data.mime_type, "application/json");
    }

    #[test]
    fn binary_content_is_base64() {
        let bytes = vec![0u8, 1, 2, 3, 255, 254, 7, 8];
        let response = HttpResponse::new(200, "OK").with_body(bytes.clone());
        let content = response_content(&response);
        assert_eq!(content.encoding.as_deref(), Some("base64"));
        assert_eq!(content.text.as_deref(), Some(STANDARD.encode(&bytes).as_str()));
    }

    #[test]
    fn text_content_is_stored_directly() {
        let mut response = HttpResponse::new(200, "OK").with_body("<html>hi</html>");
        response.headers.push(("Content-Type".into(), "text/html".into()));
        let content = response_content(&response);
        assert_eq!(content.encoding, None);
        assert_eq!(content.text.as_deref(), Some("<html>hi</html>"));
        assert_eq!(content.mime_type, "text/html");
    }

    #[test]
    fn compression_delta() {
        let mut response = HttpResponse::new(200, "OK");
        response.raw_content = vec![1; 40];
        response.content = b"a much longer decoded body than the wire body, truly".to_vec();
        let content = response_content(&response);
        assert_eq!(content.size, 40);
        assert_eq!(content.decoded_size(), response.content.len() as i64);
    }

    #[test]
    fn transfer_timings_from_timestamps() {
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let ms = chrono::Duration::milliseconds;
        let mut req = sample_request();
        req.timestamp_start = Some(t0);
        req.timestamp_end = Some(t0 + ms(50));
        let mut res = HttpResponse::new(200, "OK");
        res.timestamp_start = Some(t0 + ms(170));
        res.timestamp_end = Some(t0 + ms(200));
        let exchange = HttpExchange::new(ConnectionId::new(1))
            .with_request(req)
            .with_response(res);

        let timings = transfer_timings(&exchange);
        assert_eq!(timings.send, Timing::Ms(50));
        assert_eq!(timings.wait, Timing::Ms(120));
        assert_eq!(timings.receive, Timing::Ms(30));
        assert_eq!(timings.connect, Timing::NotApplicable);
    }

    #[test]
    fn build_entry_requires_request() {
        let exchange = HttpExchange::new(ConnectionId::new(1));
        assert!(build_entry(&exchange, "Default", Timings::unknown(), Utc::now()).is_none());
    }

    #[test]
    fn build_entry_fills_metadata() {
        let mut res = HttpResponse::new(302, "Found").with_body("moved");
        res.headers.push(("Location".into(), "https://example.com/next".into()));
        res.headers.push(("Set-Cookie".into(), "id=1; HttpOnly".into()));
        let mut exchange = HttpExchange::new(ConnectionId::new(1))
            .with_request(sample_request())
            .with_response(res);
        exchange.server_conn.connected = true;
        exchange.server_conn.ip_address = Some("93.184.216.34".parse().unwrap());

        let timings = Timings {
            send: Timing::Ms(1),
            wait: Timing::Ms(2),
            ..Timings::unknown()
        };
        let entry = build_entry(&exchange, "Page 1", timings, Utc::now()).unwrap();
        assert_eq!(entry.pageref, "Page 1");
        assert_eq!(entry.time, 3);
        assert_eq!(entry.request.url, "https://example.com/search?q=rust&page=2");
        assert_eq!(entry.request.query_string.len(), 2);
        assert_eq!(entry.response.redirect_url, "https://example.com/next");
        assert!(entry.response.cookies[0].http_only);
        assert_eq!(entry.server_ip_address.as_deref(), Some("93.184.216.34"));
    }

    #[test]
    fn fallback_entry_without_request() {
        let entry = fallback_entry(None, "Default", Utc::now());
        assert_eq!(entry.request.method, "");
        assert_eq!(entry.request.body_size, -1);
        assert_eq!(entry.time, 0);
        assert_eq!(entry.response.status, 0);
    }
}
