//! The control API gate: a strict, length-bounded request parser, the
//! per-address rate limiter, pre-shared key authentication and an open
//! routing table. Socket handling lives in the platform runtimes; this module
//! only turns request bytes into response bytes.

use std::{
    collections::HashMap,
    net::IpAddr,
    time::{Duration, Instant},
};

use http::{Method, StatusCode};
use serde::Serialize;
use subtle::ConstantTimeEq;
use thiserror::Error;

pub const API_KEY_HEADER: &str = "X-API-Key";
const HEAD_DELIMITER: &[u8] = b"\r\n\r\n";
const MAX_HEADERS: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("request does not fit in {0} bytes")]
    TooLarge(usize),
    #[error("request ended before its head or declared body was complete")]
    Incomplete,
    #[error("request head is not valid UTF-8")]
    NotUtf8,
    #[error("malformed request line")]
    RequestLine,
    #[error("unsupported protocol version `{0}`")]
    Version(String),
    #[error("malformed header line")]
    Header,
    #[error("more than 32 headers")]
    TooManyHeaders,
    #[error("invalid Content-Length")]
    ContentLength,
}

/// How far a read buffer has got towards one complete request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    NeedMore,
    Complete,
    TooLarge,
}

pub fn frame_status(buffer: &[u8], limit: usize) -> Frame {
    let Some(head_end) = find_delimiter(buffer) else {
        return if buffer.len() >= limit {
            Frame::TooLarge
        } else {
            Frame::NeedMore
        };
    };

    // A head the parser will reject is complete as far as framing goes.
    let Some(declared) = std::str::from_utf8(&buffer[..head_end])
        .ok()
        .and_then(|head| content_length(head.split("\r\n").skip(1)).ok())
    else {
        return Frame::Complete;
    };
    let Some(total) = head_end
        .checked_add(HEAD_DELIMITER.len())
        .and_then(|head_len| head_len.checked_add(declared))
    else {
        return Frame::TooLarge;
    };

    if total > limit {
        Frame::TooLarge
    } else if buffer.len() >= total {
        Frame::Complete
    } else {
        Frame::NeedMore
    }
}

fn find_delimiter(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(HEAD_DELIMITER.len())
        .position(|window| window == HEAD_DELIMITER)
}

fn content_length<'a>(lines: impl Iterator<Item = &'a str>) -> Result<usize, RequestError> {
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                return value
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| RequestError::ContentLength);
            }
        }
    }
    Ok(0)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub target: String,
    headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Request {
    pub fn parse(raw: &[u8]) -> Result<Self, RequestError> {
        let head_end = find_delimiter(raw).ok_or(RequestError::Incomplete)?;
        let head = std::str::from_utf8(&raw[..head_end]).map_err(|_| RequestError::NotUtf8)?;
        let body = &raw[head_end + HEAD_DELIMITER.len()..];

        let mut lines = head.split("\r\n");
        let (method, target) = parse_request_line(lines.next().unwrap_or_default())?;

        let mut headers = Vec::new();
        for line in lines {
            if headers.len() == MAX_HEADERS {
                return Err(RequestError::TooManyHeaders);
            }
            headers.push(parse_header(line)?);
        }

        let declared = match headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        {
            Some((_, value)) => value
                .parse::<usize>()
                .map_err(|_| RequestError::ContentLength)?,
            None => 0,
        };
        if body.len() < declared {
            return Err(RequestError::Incomplete);
        }
        let body_len = if declared == 0 { body.len() } else { declared };

        Ok(Self {
            method,
            target,
            headers,
            body: body[..body_len].to_vec(),
        })
    }

    /// Target without its query string.
    pub fn path(&self) -> &str {
        self.target
            .split_once('?')
            .map_or(self.target.as_str(), |(path, _)| path)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(candidate, _)| candidate.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

fn parse_request_line(line: &str) -> Result<(Method, String), RequestError> {
    let mut parts = line.split(' ');
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(RequestError::RequestLine);
    };

    if version != "HTTP/1.1" && version != "HTTP/1.0" {
        return Err(RequestError::Version(version.to_string()));
    }
    if !target.starts_with('/') || target.bytes().any(|byte| byte.is_ascii_control()) {
        return Err(RequestError::RequestLine);
    }
    let method = Method::from_bytes(method.as_bytes()).map_err(|_| RequestError::RequestLine)?;

    Ok((method, target.to_string()))
}

fn parse_header(line: &str) -> Result<(String, String), RequestError> {
    let (name, value) = line.split_once(':').ok_or(RequestError::Header)?;
    let is_token = |byte: u8| byte.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&byte);
    if name.is_empty() || !name.bytes().all(is_token) {
        return Err(RequestError::Header);
    }
    Ok((name.to_string(), value.trim().to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    status: StatusCode,
    headers: Vec<(&'static str, String)>,
    body: Vec<u8>,
}

impl Response {
    pub fn empty(status: StatusCode) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Answer for authenticated requests nothing is registered for.
    pub fn stub() -> Self {
        Self {
            status: StatusCode::OK,
            headers: Vec::new(),
            body: b"OK".to_vec(),
        }
    }

    pub fn json<T: Serialize>(status: StatusCode, payload: &T) -> Self {
        match serde_json::to_vec(payload) {
            Ok(body) => Self {
                status,
                headers: vec![
                    ("Content-Type", "application/json".to_string()),
                    ("Content-Length", body.len().to_string()),
                ],
                body,
            },
            Err(_) => Self::empty(StatusCode::INTERNAL_SERVER_ERROR),
        }
    }

    pub fn error(status: StatusCode, message: &str) -> Self {
        Self::json(status, &serde_json::json!({ "error": message }))
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!(
            "HTTP/1.1 {} {}\r\n",
            self.status.as_u16(),
            self.status.canonical_reason().unwrap_or("Unknown")
        )
        .into_bytes();
        for (name, value) in &self.headers {
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

/// Last accepted request per client address.
#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    ledger: HashMap<IpAddr, Instant>,
}

impl RateLimiter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            ledger: HashMap::new(),
        }
    }

    pub fn is_throttled(&self, peer: IpAddr, now: Instant) -> bool {
        self.ledger
            .get(&peer)
            .is_some_and(|last| now.saturating_duration_since(*last) < self.window)
    }

    pub fn record(&mut self, peer: IpAddr, now: Instant) {
        self.ledger.insert(peer, now);
    }

    pub fn last_accepted(&self, peer: IpAddr) -> Option<Instant> {
        self.ledger.get(&peer).copied()
    }
}

pub type Handler<C> = Box<dyn FnMut(&Request, &mut C) -> Response + Send>;

/// Handlers keyed by method and path, with a fallback for everything else.
pub struct Routes<C> {
    table: HashMap<(Method, String), Handler<C>>,
    fallback: Handler<C>,
}

impl<C> Default for Routes<C> {
    fn default() -> Self {
        Self {
            table: HashMap::new(),
            fallback: Box::new(|_, _| Response::stub()),
        }
    }
}

impl<C> Routes<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route<F>(mut self, method: Method, path: &str, handler: F) -> Self
    where
        F: FnMut(&Request, &mut C) -> Response + Send + 'static,
    {
        self.table
            .insert((method, path.to_string()), Box::new(handler));
        self
    }

    pub fn fallback<F>(mut self, handler: F) -> Self
    where
        F: FnMut(&Request, &mut C) -> Response + Send + 'static,
    {
        self.fallback = Box::new(handler);
        self
    }

    fn dispatch(&mut self, request: &Request, context: &mut C) -> Response {
        let key = (request.method.clone(), request.path().to_string());
        match self.table.get_mut(&key) {
            Some(handler) => handler(request, context),
            None => (self.fallback)(request, context),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Malformed(RequestError),
    Throttled,
    Unauthorized,
    Accepted { method: Method, path: String },
}

#[derive(Debug)]
pub struct Exchange {
    pub response: Response,
    pub disposition: Disposition,
}

impl Exchange {
    fn rejected(status: StatusCode, disposition: Disposition) -> Self {
        Self {
            response: Response::empty(status),
            disposition,
        }
    }
}

pub struct ControlApi<C> {
    api_key: String,
    limiter: RateLimiter,
    routes: Routes<C>,
}

impl<C> ControlApi<C> {
    pub fn new(api_key: impl Into<String>, rate_window: Duration, routes: Routes<C>) -> Self {
        Self {
            api_key: api_key.into(),
            limiter: RateLimiter::new(rate_window),
            routes,
        }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// One request/response exchange. Gates run in order: parse, throttle,
    /// authenticate; only a request that clears all three is routed and
    /// recorded in the ledger.
    pub fn handle(&mut self, peer: IpAddr, raw: &[u8], now: Instant, context: &mut C) -> Exchange {
        let request = match Request::parse(raw) {
            Ok(request) => request,
            Err(err) => {
                return Exchange::rejected(StatusCode::BAD_REQUEST, Disposition::Malformed(err))
            }
        };

        if self.limiter.is_throttled(peer, now) {
            return Exchange::rejected(StatusCode::TOO_MANY_REQUESTS, Disposition::Throttled);
        }

        if !self.is_authorized(&request) {
            return Exchange::rejected(StatusCode::UNAUTHORIZED, Disposition::Unauthorized);
        }

        let response = self.routes.dispatch(&request, context);
        self.limiter.record(peer, now);

        Exchange {
            response,
            disposition: Disposition::Accepted {
                path: request.path().to_string(),
                method: request.method,
            },
        }
    }

    /// Answer for a read that hit the buffer limit before the request was
    /// complete. Nothing is parsed or recorded.
    pub fn reject_oversized(&self, limit: usize) -> Exchange {
        Exchange::rejected(
            StatusCode::BAD_REQUEST,
            Disposition::Malformed(RequestError::TooLarge(limit)),
        )
    }

    fn is_authorized(&self, request: &Request) -> bool {
        request
            .header(API_KEY_HEADER)
            .is_some_and(|key| key.as_bytes().ct_eq(self.api_key.as_bytes()).into())
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use pretty_assertions::assert_eq;

    use super::*;

    const KEY: &str = "SECURE_KEY_a1b2c3";

    #[derive(Default)]
    struct Calls {
        routed: usize,
    }

    fn peer(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 4, last))
    }

    fn api() -> ControlApi<Calls> {
        let routes = Routes::new().route(Method::GET, "/ping", |_, calls: &mut Calls| {
            calls.routed += 1;
            Response::json(StatusCode::OK, &serde_json::json!({ "pong": true }))
        });
        ControlApi::new(KEY, Duration::from_secs(1), routes)
    }

    fn request(path: &str, key: Option<&str>) -> Vec<u8> {
        let mut raw = format!("GET {path} HTTP/1.1\r\nHost: device\r\n");
        if let Some(key) = key {
            raw.push_str(&format!("X-API-Key: {key}\r\n"));
        }
        raw.push_str("\r\n");
        raw.into_bytes()
    }

    #[test]
    fn gate_responses_are_bare_status_lines() {
        assert_eq!(
            Response::empty(StatusCode::TOO_MANY_REQUESTS).to_bytes(),
            b"HTTP/1.1 429 Too Many Requests\r\n\r\n"
        );
        assert_eq!(
            Response::empty(StatusCode::UNAUTHORIZED).to_bytes(),
            b"HTTP/1.1 401 Unauthorized\r\n\r\n"
        );
        assert_eq!(Response::stub().to_bytes(), b"HTTP/1.1 200 OK\r\n\r\nOK");
    }

    #[test]
    fn unregistered_paths_get_the_stub() {
        let mut api = api();
        let mut calls = Calls::default();

        let exchange = api.handle(peer(2), &request("/relay", Some(KEY)), Instant::now(), &mut calls);

        assert_eq!(exchange.response, Response::stub());
        assert_eq!(calls.routed, 0);
        assert_eq!(
            exchange.disposition,
            Disposition::Accepted {
                method: Method::GET,
                path: "/relay".to_string()
            }
        );
    }

    #[test]
    fn registered_route_sees_path_without_query() {
        let mut api = api();
        let mut calls = Calls::default();

        let exchange = api.handle(peer(2), &request("/ping?x=1", Some(KEY)), Instant::now(), &mut calls);

        assert_eq!(exchange.response.status(), StatusCode::OK);
        assert_eq!(exchange.response.body(), br#"{"pong":true}"#);
        assert_eq!(calls.routed, 1);
    }

    #[test]
    fn missing_or_wrong_key_is_never_routed_or_recorded() {
        let mut api = api();
        let mut calls = Calls::default();
        let now = Instant::now();

        let missing = api.handle(peer(3), &request("/ping", None), now, &mut calls);
        let wrong = api.handle(peer(3), &request("/ping", Some("SECURE_KEY_000000")), now, &mut calls);
        let prefix = api.handle(peer(3), &request("/ping", Some("SECURE_KEY")), now, &mut calls);

        for exchange in [&missing, &wrong, &prefix] {
            assert_eq!(exchange.disposition, Disposition::Unauthorized);
            assert_eq!(exchange.response.to_bytes(), b"HTTP/1.1 401 Unauthorized\r\n\r\n");
        }
        assert_eq!(calls.routed, 0);
        assert_eq!(api.limiter().last_accepted(peer(3)), None);

        // Rejections did not open a throttle window.
        let accepted = api.handle(peer(3), &request("/ping", Some(KEY)), now, &mut calls);
        assert_eq!(accepted.response.status(), StatusCode::OK);
    }

    #[test]
    fn second_request_inside_window_is_throttled() {
        let mut api = api();
        let mut calls = Calls::default();
        let start = Instant::now();

        let first = api.handle(peer(4), &request("/ping", Some(KEY)), start, &mut calls);
        let second = api.handle(
            peer(4),
            &request("/ping", Some(KEY)),
            start + Duration::from_millis(400),
            &mut calls,
        );
        let other_peer = api.handle(
            peer(5),
            &request("/ping", Some(KEY)),
            start + Duration::from_millis(400),
            &mut calls,
        );
        let third = api.handle(
            peer(4),
            &request("/ping", Some(KEY)),
            start + Duration::from_millis(1_001),
            &mut calls,
        );

        assert_eq!(first.response.status(), StatusCode::OK);
        assert_eq!(second.disposition, Disposition::Throttled);
        assert_eq!(
            second.response.to_bytes(),
            b"HTTP/1.1 429 Too Many Requests\r\n\r\n"
        );
        assert_eq!(other_peer.response.status(), StatusCode::OK);
        assert_eq!(third.response.status(), StatusCode::OK);
        assert_eq!(calls.routed, 3);
    }

    #[test]
    fn throttled_request_does_not_extend_window() {
        let mut api = api();
        let mut calls = Calls::default();
        let start = Instant::now();

        api.handle(peer(6), &request("/ping", Some(KEY)), start, &mut calls);
        api.handle(
            peer(6),
            &request("/ping", Some(KEY)),
            start + Duration::from_millis(900),
            &mut calls,
        );

        assert_eq!(api.limiter().last_accepted(peer(6)), Some(start));
    }

    #[test]
    fn malformed_requests_are_rejected() {
        let mut api = api();
        let mut calls = Calls::default();
        let now = Instant::now();

        let cases: [(&[u8], RequestError); 5] = [
            (b"GET /ping HTTP/1.1\r\nX-API-Key: k", RequestError::Incomplete),
            (b"GET /ping\r\n\r\n", RequestError::RequestLine),
            (b"GET ping HTTP/1.1\r\n\r\n", RequestError::RequestLine),
            (b"GET /ping SPDY/3\r\n\r\n", RequestError::Version("SPDY/3".to_string())),
            (b"GET /ping HTTP/1.1\r\nno colon here\r\n\r\n", RequestError::Header),
        ];

        for (raw, expected) in cases {
            let exchange = api.handle(peer(7), raw, now, &mut calls);
            assert_eq!(exchange.disposition, Disposition::Malformed(expected));
            assert_eq!(exchange.response.to_bytes(), b"HTTP/1.1 400 Bad Request\r\n\r\n");
        }
        assert_eq!(calls.routed, 0);
    }

    #[test]
    fn parses_headers_and_declared_body() {
        let raw = b"PUT /schedule HTTP/1.1\r\nx-api-key: abc\r\nContent-Length: 4\r\n\r\nbodyEXTRA";
        let request = Request::parse(raw).unwrap();

        assert_eq!(request.method, Method::PUT);
        assert_eq!(request.path(), "/schedule");
        assert_eq!(request.header("X-API-Key"), Some("abc"));
        assert_eq!(request.body, b"body");
    }

    #[test]
    fn short_body_is_incomplete() {
        let raw = b"PUT /schedule HTTP/1.1\r\nContent-Length: 10\r\n\r\nbody";
        assert_eq!(Request::parse(raw), Err(RequestError::Incomplete));
    }

    #[test]
    fn too_many_headers_are_rejected() {
        let mut raw = String::from("GET / HTTP/1.1\r\n");
        for index in 0..=MAX_HEADERS {
            raw.push_str(&format!("X-H{index}: v\r\n"));
        }
        raw.push_str("\r\n");

        assert_eq!(Request::parse(raw.as_bytes()), Err(RequestError::TooManyHeaders));
    }

    #[test]
    fn framing_tracks_head_and_declared_body() {
        let head = b"PUT /schedule HTTP/1.1\r\nContent-Length: 4\r\n\r\n";
        let mut buffer = head.to_vec();

        assert_eq!(frame_status(b"GET / HTTP/1.1\r\n", 1024), Frame::NeedMore);
        assert_eq!(frame_status(&buffer, 1024), Frame::NeedMore);
        buffer.extend_from_slice(b"body");
        assert_eq!(frame_status(&buffer, 1024), Frame::Complete);
        assert_eq!(frame_status(&buffer, head.len() + 2), Frame::TooLarge);
        assert_eq!(frame_status(&[b'a'; 64], 64), Frame::TooLarge);
    }

    #[test]
    fn huge_content_length_is_too_large() {
        let head = b"PUT /schedule HTTP/1.1\r\nContent-Length: 18446744073709551615\r\n\r\n";
        assert_eq!(frame_status(head, 1024), Frame::TooLarge);

        let near_limit = format!(
            "PUT /schedule HTTP/1.1\r\nContent-Length: {}\r\n\r\n",
            usize::MAX - 8
        );
        assert_eq!(frame_status(near_limit.as_bytes(), 1024), Frame::TooLarge);
    }

    #[test]
    fn unparseable_content_length_is_framed_then_rejected() {
        let raw = b"PUT /ping HTTP/1.1\r\nX-API-Key: SECURE_KEY_a1b2c3\r\nContent-Length: lots\r\n\r\n";
        assert_eq!(frame_status(raw, 1024), Frame::Complete);

        let mut api = api();
        let mut calls = Calls::default();
        let exchange = api.handle(peer(11), raw, Instant::now(), &mut calls);

        assert_eq!(
            exchange.disposition,
            Disposition::Malformed(RequestError::ContentLength)
        );
        assert_eq!(exchange.response.to_bytes(), b"HTTP/1.1 400 Bad Request\r\n\r\n");
        assert_eq!(calls.routed, 0);
    }

    #[test]
    fn oversized_reads_get_bad_request_without_recording() {
        let api = api();
        let exchange = api.reject_oversized(1024);

        assert_eq!(exchange.response.to_bytes(), b"HTTP/1.1 400 Bad Request\r\n\r\n");
        assert_eq!(
            exchange.disposition,
            Disposition::Malformed(RequestError::TooLarge(1024))
        );
        assert!(api.limiter().last_accepted(peer(10)).is_none());
    }
}
