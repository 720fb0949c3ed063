//! Request/response types, head parsing, and head rendering.

use skein_types::Error;
use std::fs::File;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HttpVersion {
    H10,
    H11,
}

impl HttpVersion {
    /// HTTP/1.1 keeps connections alive by default; HTTP/1.0 closes.
    pub fn keep_alive_by_default(self) -> bool {
        matches!(self, HttpVersion::H11)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HttpVersion::H10 => "HTTP/1.0",
            HttpVersion::H11 => "HTTP/1.1",
        }
    }
}

/// A parsed request head. Bodies are not consumed by the server; a
/// request that carries one is answered and then the connection closes
/// rather than desynchronizing the stream.
#[derive(Clone, Debug)]
pub struct Request {
    pub method: String,
    pub target: String,
    pub version: HttpVersion,
    pub headers: Vec<(String, String)>,
}

impl Request {
    /// First header value with the given name, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether the client asked to keep the connection open.
    pub fn wants_keep_alive(&self) -> bool {
        match self.header("connection") {
            Some(v) if v.eq_ignore_ascii_case("close") => false,
            Some(v) if v.eq_ignore_ascii_case("keep-alive") => true,
            _ => self.version.keep_alive_by_default(),
        }
    }

    /// Declared request body length, if any.
    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length").and_then(|v| v.trim().parse().ok())
    }
}

/// Response body: in-memory bytes, or a file served via `SendFile`.
pub enum Body {
    Bytes(Vec<u8>),
    /// File and the number of bytes to send from its start.
    File(File, u64),
}

impl Body {
    pub fn len(&self) -> u64 {
        match self {
            Body::Bytes(b) => b.len() as u64,
            Body::File(_, len) => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct Response {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Body,
}

impl Response {
    pub fn new(status: u16, reason: impl Into<String>) -> Self {
        Response {
            status,
            reason: reason.into(),
            headers: Vec::new(),
            body: Body::Bytes(Vec::new()),
        }
    }

    /// A 200 text response.
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Response::new(200, "OK").with_body(Body::Bytes(body.into()))
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: Body) -> Self {
        self.body = body;
        self
    }

    /// Render the status line and headers. A `Content-Length` for the
    /// body and the connection disposition are appended unless the
    /// handler already set them.
    pub fn render_head(&self, version: HttpVersion, keep_alive: bool) -> Vec<u8> {
        let mut head = format!("{} {} {}\r\n", version.as_str(), self.status, self.reason);
        let mut have_length = false;
        let mut have_connection = false;
        for (name, value) in &self.headers {
            have_length |= name.eq_ignore_ascii_case("content-length");
            have_connection |= name.eq_ignore_ascii_case("connection");
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        if !have_length {
            head.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        }
        if !have_connection {
            head.push_str(if keep_alive {
                "Connection: keep-alive\r\n"
            } else {
                "Connection: close\r\n"
            });
        }
        head.push_str("\r\n");
        head.into_bytes()
    }
}

/// Application callable invoked once per request.
pub trait Handler {
    /// Produce a response. An error is rendered as a plain 500.
    fn handle(&self, req: &Request) -> Result<Response, Error>;
}

impl<F> Handler for F
where
    F: Fn(&Request) -> Result<Response, Error>,
{
    fn handle(&self, req: &Request) -> Result<Response, Error> {
        self(req)
    }
}

/// Parse `METHOD target HTTP/x.y`. `None` is a 400.
pub fn parse_request_line(line: &[u8]) -> Option<(String, String, HttpVersion)> {
    let line = std::str::from_utf8(line).ok()?.trim_end_matches(['\r', '\n']);
    let mut parts = line.split_ascii_whitespace();
    let method = parts.next()?;
    let target = parts.next()?;
    let version = match parts.next()? {
        "HTTP/1.0" => HttpVersion::H10,
        "HTTP/1.1" => HttpVersion::H11,
        _ => return None,
    };
    if parts.next().is_some() || method.is_empty() {
        return None;
    }
    Some((method.to_owned(), target.to_owned(), version))
}

/// Parse `Name: value`. `None` is a 400.
pub fn parse_header_line(line: &[u8]) -> Option<(String, String)> {
    let line = std::str::from_utf8(line).ok()?.trim_end_matches(['\r', '\n']);
    let (name, value) = line.split_once(':')?;
    let name = name.trim();
    if name.is_empty() || name.contains(' ') {
        return None;
    }
    Some((name.to_owned(), value.trim().to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(version: HttpVersion, headers: &[(&str, &str)]) -> Request {
        Request {
            method: "GET".into(),
            target: "/".into(),
            version,
            headers: headers
                .iter()
                .map(|(n, v)| ((*n).to_owned(), (*v).to_owned()))
                .collect(),
        }
    }

    #[test]
    fn request_line_parses_both_versions() {
        let (method, target, version) =
            parse_request_line(b"GET /index.html HTTP/1.1\r\n").expect("valid");
        assert_eq!(method, "GET");
        assert_eq!(target, "/index.html");
        assert_eq!(version, HttpVersion::H11);

        let (_, _, version) = parse_request_line(b"POST /submit HTTP/1.0\r\n").expect("valid");
        assert_eq!(version, HttpVersion::H10);
    }

    #[test]
    fn malformed_request_lines_are_rejected() {
        assert!(parse_request_line(b"GET /\r\n").is_none());
        assert!(parse_request_line(b"GET / HTTP/2.0\r\n").is_none());
        assert!(parse_request_line(b"GET / HTTP/1.1 extra\r\n").is_none());
        assert!(parse_request_line(b"\r\n").is_none());
        assert!(parse_request_line(&[0xff, 0xfe]).is_none());
    }

    #[test]
    fn header_lines_split_on_the_first_colon() {
        assert_eq!(
            parse_header_line(b"Host: example.com:8080\r\n"),
            Some(("Host".to_owned(), "example.com:8080".to_owned()))
        );
        assert!(parse_header_line(b"no colon here\r\n").is_none());
        assert!(parse_header_line(b"bad name: x\r\n").is_none());
    }

    #[test]
    fn keep_alive_follows_version_defaults_and_overrides() {
        assert!(request(HttpVersion::H11, &[]).wants_keep_alive());
        assert!(!request(HttpVersion::H10, &[]).wants_keep_alive());
        assert!(!request(HttpVersion::H11, &[("Connection", "close")]).wants_keep_alive());
        assert!(request(HttpVersion::H10, &[("Connection", "keep-alive")]).wants_keep_alive());
    }

    #[test]
    fn rendered_head_appends_length_and_connection() {
        let head = Response::ok(b"hello".to_vec()).render_head(HttpVersion::H11, true);
        let head = String::from_utf8(head).expect("ascii");
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Content-Length: 5\r\n"));
        assert!(head.contains("Connection: keep-alive\r\n"));
        assert!(head.ends_with("\r\n\r\n"));
    }

    #[test]
    fn explicit_headers_are_not_duplicated() {
        let head = Response::new(204, "No Content")
            .with_header("Content-Length", "0")
            .with_header("Connection", "close")
            .render_head(HttpVersion::H11, true);
        let head = String::from_utf8(head).expect("ascii");
        assert_eq!(head.matches("Content-Length").count(), 1);
        assert_eq!(head.matches("Connection").count(), 1);
    }
}
