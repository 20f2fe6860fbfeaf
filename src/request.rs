use std::collections::HashMap;

use tracing::debug;

use crate::buffer::Buffer;
use crate::db;

/// Pages addressable without their `.html` suffix.
const DEFAULT_PAGES: [&str; 6] = [
    "/index",
    "/register",
    "/login",
    "/welcome",
    "/video",
    "/picture",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    RequestLine,
    Headers,
    Body,
    Finish,
}

/// A full request was not yet available; nothing was consumed past the last
/// complete element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseOutcome {
    Complete,
    Incomplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    BadRequestLine,
    BadHeader,
    BadEncoding,
}

/// Incremental HTTP/1.1 request parser over an elastic buffer.
///
/// State moves strictly forward through request line, headers, body. Each
/// successfully parsed line is consumed from the buffer including its CRLF;
/// when no CRLF (or not enough body) is available the parser reports
/// `Incomplete` and leaves the cursor alone so the next read can extend the
/// data.
pub struct HttpRequest {
    state: ParseState,
    method: String,
    path: String,
    version: String,
    body: String,
    headers: HashMap<String, String>,
    form: HashMap<String, String>,
}

impl HttpRequest {
    pub fn new() -> Self {
        Self {
            state: ParseState::RequestLine,
            method: String::new(),
            path: String::new(),
            version: String::new(),
            body: String::new(),
            headers: HashMap::new(),
            form: HashMap::new(),
        }
    }

    /// Rewind to a fresh request; called once a response has been built so
    /// a keep-alive connection can parse the next request.
    pub fn reset(&mut self) {
        self.state = ParseState::RequestLine;
        self.method.clear();
        self.path.clear();
        self.version.clear();
        self.body.clear();
        self.headers.clear();
        self.form.clear();
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn post_value(&self, key: &str) -> Option<&str> {
        self.form.get(key).map(String::as_str)
    }

    /// Keep-alive is granted only to HTTP/1.1 requests that asked for it.
    pub fn is_keep_alive(&self) -> bool {
        self.header("Connection")
            .is_some_and(|v| v.eq_ignore_ascii_case("keep-alive"))
            && self.version == "1.1"
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn content_length(&self) -> usize {
        self.header("Content-Length")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Drive the state machine over the buffer's readable extent.
    pub fn parse(&mut self, buf: &mut Buffer) -> Result<ParseOutcome, ParseError> {
        loop {
            match self.state {
                ParseState::Finish => {
                    debug!("request {} {} HTTP/{}", self.method, self.path, self.version);
                    return Ok(ParseOutcome::Complete);
                }
                ParseState::RequestLine | ParseState::Headers => {
                    let Some(line_len) = find_crlf(buf.peek()) else {
                        return Ok(ParseOutcome::Incomplete);
                    };
                    let line = std::str::from_utf8(&buf.peek()[..line_len])
                        .map_err(|_| ParseError::BadEncoding)?
                        .to_owned();
                    buf.consume(line_len + 2);
                    if self.state == ParseState::RequestLine {
                        self.parse_request_line(&line)?;
                        self.normalize_path();
                        self.state = ParseState::Headers;
                    } else {
                        self.parse_header_line(&line)?;
                    }
                }
                ParseState::Body => {
                    let need = self.content_length();
                    if buf.readable_len() < need {
                        return Ok(ParseOutcome::Incomplete);
                    }
                    self.body = String::from_utf8_lossy(&buf.peek()[..need]).into_owned();
                    buf.consume(need);
                    self.parse_post();
                    self.state = ParseState::Finish;
                }
            }
        }
    }

    fn parse_request_line(&mut self, line: &str) -> Result<(), ParseError> {
        let mut parts = line.split(' ');
        let method = parts.next().filter(|s| !s.is_empty());
        let path = parts.next().filter(|s| !s.is_empty());
        let proto = parts.next();
        if parts.next().is_some() {
            return Err(ParseError::BadRequestLine);
        }
        match (method, path, proto.and_then(|p| p.strip_prefix("HTTP/"))) {
            (Some(method), Some(path), Some(version)) if !version.is_empty() => {
                self.method = method.to_owned();
                self.path = path.to_owned();
                self.version = version.to_owned();
                Ok(())
            }
            _ => Err(ParseError::BadRequestLine),
        }
    }

    fn parse_header_line(&mut self, line: &str) -> Result<(), ParseError> {
        if line.is_empty() {
            // Blank line: GET and bodyless POST finish here, a POST with a
            // declared body waits for it.
            self.state = if self.method == "POST" && self.content_length() > 0 {
                ParseState::Body
            } else {
                ParseState::Finish
            };
            return Ok(());
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(ParseError::BadHeader);
        };
        self.headers
            .insert(name.to_owned(), value.trim_start().to_owned());
        Ok(())
    }

    /// `/` means the index page, and the well-known pages may be addressed
    /// without their suffix.
    fn normalize_path(&mut self) {
        if self.path == "/" {
            self.path = "/index.html".to_owned();
        } else if DEFAULT_PAGES.contains(&self.path.as_str()) {
            self.path.push_str(".html");
        }
    }

    /// Decode a urlencoded POST body and run the form endpoints: register
    /// and login redirect to the welcome page on success, the error page on
    /// failure.
    fn parse_post(&mut self) {
        if self.method != "POST"
            || !self
                .header("Content-Type")
                .is_some_and(|v| v.eq_ignore_ascii_case("application/x-www-form-urlencoded"))
        {
            return;
        }
        self.form = decode_form(&self.body);

        let is_login = match self.path.as_str() {
            "/register.html" => false,
            "/login.html" => true,
            _ => return,
        };
        let name = self.post_value("username").unwrap_or("");
        let password = self.post_value("password").unwrap_or("");
        self.path = if db::user_verify(name, password, is_login) {
            "/welcome.html".to_owned()
        } else {
            "/error.html".to_owned()
        };
    }
}

impl Default for HttpRequest {
    fn default() -> Self {
        Self::new()
    }
}

fn find_crlf(bytes: &[u8]) -> Option<usize> {
    bytes.windows(2).position(|w| w == b"\r\n")
}

/// Split `&`-separated pairs on the first `=`, decoding `+` and `%HH` in
/// both halves.
fn decode_form(body: &str) -> HashMap<String, String> {
    let mut form = HashMap::new();
    for pair in body.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        form.insert(decode_component(key), decode_component(value));
    }
    form
}

fn decode_component(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => {
                if let Some(b) = raw
                    .get(i + 1..i + 3)
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok())
                {
                    out.push(b);
                    i += 3;
                } else {
                    out.push(b'%');
                    i += 1;
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}
