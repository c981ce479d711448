//! Request type and its incremental parser.
use std::collections::HashMap;
use std::io::Read;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use bytes::BytesMut;
use flate2::read::GzDecoder;
use memchr::memmem;
use regex::Regex;
use tracing::{info, warn};

use crate::config::{ServerConfig, Verbosity};
use crate::error::HttpError;
use crate::header::HeaderMap;
use crate::method::Method;
use crate::multipart::{FormFile, PartSink};
use crate::query::Query;
use crate::response::Response;
use crate::status::StatusCode;

const MAX_HEADERS: usize = 100;

/// Where the parser is in the current request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParseState {
    /// Waiting for (or reading) the request line.
    ReadRequestLine,
    /// Reading the header block.
    ReadHeader,
    /// Reading a fixed-size body.
    ReadBody,
    /// Reading multipart content, scanning for the next boundary.
    ReadMultipartData,
    /// Reading the header block of a multipart part.
    ReadMultipartHeaders,
    /// The request is fully parsed.
    Complete,
    /// A fatal framing error; remaining input cannot be trusted.
    Abort,
}

/// What the parser did with the bytes it was given.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Advance {
    /// More bytes are needed.
    Progress,
    /// The request is complete or aborted; stop reading.
    Done,
}

/// An incoming HTTP request.
///
/// Created when the first byte of a new request arrives on a connection
/// and populated incrementally by the parser; destroyed (together with any
/// temporary upload files) once its paired response has been written.
#[derive(Debug)]
pub struct Request {
    config: Arc<ServerConfig>,
    state: ParseState,
    peer_addr: SocketAddr,
    method: Method,
    target: String,
    path: String,
    query: Query,
    fragment: Option<String>,
    version: String,
    headers: HeaderMap,
    cookies: HashMap<String, String>,
    expected_body_size: usize,
    body: Vec<u8>,
    mime_type: String,
    charset: String,
    boundary: String,
    form_fields: HashMap<String, String>,
    form_files: HashMap<String, FormFile>,

    // Bytes consumed so far; counts the head against `max_request_size`,
    // then is reset to count body bytes once a multipart body starts.
    request_bytes: usize,
    // Staging buffer for the multipart boundary scanner.
    buffer: Vec<u8>,
    part: Option<PartSink>,
}

impl Request {
    pub(crate) fn new(config: Arc<ServerConfig>, peer_addr: SocketAddr) -> Request {
        Request {
            config,
            state: ParseState::ReadRequestLine,
            peer_addr,
            method: Method::Get,
            target: String::new(),
            path: String::new(),
            query: Query::default(),
            fragment: None,
            version: String::new(),
            headers: HeaderMap::new(),
            cookies: HashMap::new(),
            expected_body_size: 0,
            body: Vec::new(),
            mime_type: String::new(),
            charset: String::new(),
            boundary: String::new(),
            form_fields: HashMap::new(),
            form_files: HashMap::new(),
            request_bytes: 0,
            buffer: Vec::new(),
            part: None,
        }
    }

    /// Current parser state.
    pub fn state(&self) -> ParseState {
        self.state
    }

    /// Address of the client.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// The request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The request target as it appeared on the wire.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// The decoded request path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The decoded query.
    pub fn query(&self) -> &Query {
        &self.query
    }

    /// The target's fragment, if one was sent.
    pub fn fragment(&self) -> Option<&str> {
        self.fragment.as_deref()
    }

    /// The HTTP version string, e.g. `HTTP/1.1`.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// The request headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// A cookie sent with the request. Names are case-sensitive.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    /// All cookies sent with the request.
    pub fn cookies(&self) -> &HashMap<String, String> {
        &self.cookies
    }

    /// The MIME type of the body, or the configured default.
    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    /// The charset of the body, or the configured default.
    pub fn charset(&self) -> &str {
        &self.charset
    }

    /// The decoded body bytes.
    ///
    /// Empty for `multipart/form-data` and `application/x-www-form-urlencoded`
    /// requests, whose content is drained into [`form_fields`](Request::form_fields)
    /// and [`form_files`](Request::form_files) instead.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Form fields from a urlencoded or multipart body.
    pub fn form_fields(&self) -> &HashMap<String, String> {
        &self.form_fields
    }

    /// A single form field.
    pub fn form_field(&self, name: &str) -> Option<&str> {
        self.form_fields.get(name).map(String::as_str)
    }

    /// Uploaded files from a multipart body.
    pub fn form_files(&self) -> &HashMap<String, FormFile> {
        &self.form_files
    }

    /// A single uploaded file.
    pub fn form_file(&self, name: &str) -> Option<&FormFile> {
        self.form_files.get(name)
    }

    /// The body decoded to text using the request charset.
    ///
    /// `US-ASCII`, `ISO-8859-1` and `UTF-8` decode directly; any other
    /// charset goes through the `encoding_rs` registry, falling back to
    /// UTF-8 with a warning when the label is unknown.
    pub fn parse_body_str(&self) -> String {
        if self.charset.eq_ignore_ascii_case("US-ASCII")
            || self.charset.eq_ignore_ascii_case("ISO-8859-1")
        {
            self.body.iter().map(|&b| b as char).collect()
        } else if self.charset.eq_ignore_ascii_case("UTF-8") {
            String::from_utf8_lossy(&self.body).into_owned()
        } else {
            match encoding_rs::Encoding::for_label(self.charset.as_bytes()) {
                Some(encoding) => {
                    let (text, _, _) = encoding.decode(&self.body);
                    text.into_owned()
                }
                None => {
                    if self.config.logs(Verbosity::Warning) {
                        warn!(
                            "unknown charset when parsing body: {}, falling back to UTF-8",
                            self.charset
                        );
                    }
                    String::from_utf8_lossy(&self.body).into_owned()
                }
            }
        }
    }

    /// The body parsed as JSON.
    pub fn parse_json_body(&self) -> Result<serde_json::Value, HttpError> {
        serde_json::from_str(&self.parse_body_str()).map_err(|err| {
            if self.config.logs(Verbosity::Warning) {
                warn!("unable to parse JSON body: {}", err);
            }
            HttpError::with_message(StatusCode::BadRequest, "Invalid JSON")
        })
    }

    /// Feeds buffered connection bytes through the state machine.
    ///
    /// Consumes as much of `buf` as the current state allows. `Done` means
    /// the request completed or aborted; the caller must then stop feeding
    /// this request. After an abort the remaining input is untrustworthy
    /// and `buf` has been discarded.
    pub(crate) fn parse(&mut self, buf: &mut BytesMut, response: &mut Response) -> Advance {
        loop {
            let advanced = match self.state {
                ParseState::ReadRequestLine => self.parse_request_line(buf, response),
                ParseState::ReadHeader => self.parse_header(buf, response),
                ParseState::ReadBody => self.parse_body(buf, response),
                ParseState::ReadMultipartData | ParseState::ReadMultipartHeaders => {
                    self.parse_multipart(buf, response)
                }
                ParseState::Complete => return Advance::Done,
                ParseState::Abort => {
                    // Pipelined framing cannot be recovered after an error,
                    // discard whatever else was sent.
                    buf.clear();
                    self.buffer.clear();
                    return Advance::Done;
                }
            };
            if !advanced {
                return Advance::Progress;
            }
        }
    }

    fn abort(&mut self, response: &mut Response, status: StatusCode, message: &str) {
        response.set_error(status, message, true);
        self.state = ParseState::Abort;
    }

    fn parse_request_line(&mut self, buf: &mut BytesMut, response: &mut Response) -> bool {
        let newline = match memchr::memchr(b'\n', buf) {
            Some(index) => index,
            None => {
                if self.request_bytes + buf.len() > self.config.max_request_size {
                    self.head_too_large(buf, response, "The request line was too large to parse");
                    return true;
                }
                return false;
            }
        };

        let line = buf.split_to(newline + 1);
        self.request_bytes += line.len();
        if self.request_bytes > self.config.max_request_size {
            self.head_too_large(buf, response, "The request line was too large to parse");
            return true;
        }

        let line = String::from_utf8_lossy(&line);
        let line = line.trim();

        // RFC2616 section 4.1: ignore empty lines before the request line,
        // some buggy clients send extras after POST requests.
        if line.is_empty() {
            return true;
        }

        // RFC7230 section 2.6: the version must start with the literal
        // "HTTP", case-sensitive.
        let parts: Vec<&str> = line.split(' ').collect();
        if parts.len() != 3 || !parts[2].starts_with("HTTP") {
            if self.config.logs(Verbosity::Info) {
                info!("invalid HTTP request line received from {}: {}", self.peer_addr, line);
            }
            self.abort(response, StatusCode::BadRequest, "Invalid HTTP request, invalid request line");
            return true;
        }

        self.method = Method::from(parts[0]);
        self.target = parts[1].to_owned();
        self.version = parts[2].to_owned();
        self.state = ParseState::ReadHeader;

        if !self.method.is_allowed() {
            if self.config.logs(Verbosity::Info) {
                info!("invalid method received from {}: {}", self.peer_addr, self.method);
            }
            response.set_error(StatusCode::MethodNotAllowed, "", false);
            return true;
        }

        if self.parse_target().is_err() {
            if self.config.logs(Verbosity::Info) {
                info!("invalid URI received from {}: {}", self.peer_addr, self.target);
            }
            response.set_error(StatusCode::BadRequest, "Invalid URI", false);
            return true;
        }

        // HTTP/0.9 and HTTP/1.0 are deprecated; require clients to speak
        // at least HTTP/1.1. Later versions are assumed backwards
        // compatible.
        let version = self.version.get(5..).unwrap_or("");
        if version == "0.9" || version == "1.0" {
            response.set_error(
                StatusCode::HttpVersionNotSupported,
                "HTTP version must be at least 1.1",
                false,
            );
        }

        true
    }

    fn parse_target(&mut self) -> Result<(), ()> {
        let target = self.target.clone();
        if target == "*" {
            self.path = target;
            return Ok(());
        }
        if !target.starts_with('/') {
            return Err(());
        }

        let (rest, fragment) = match target.split_once('#') {
            Some((rest, fragment)) => (rest, Some(fragment.to_owned())),
            None => (target.as_str(), None),
        };
        let (path, query) = match rest.split_once('?') {
            Some((path, query)) => (path, query),
            None => (rest, ""),
        };

        self.path = percent_encoding::percent_decode_str(path)
            .decode_utf8()
            .map_err(|_| ())?
            .into_owned();
        self.query = Query::parse(query);
        self.fragment = fragment;
        Ok(())
    }

    fn parse_header(&mut self, buf: &mut BytesMut, response: &mut Response) -> bool {
        // The header block is parsed in one piece once its terminating
        // empty line has arrived.
        let head_len = if buf.starts_with(b"\r\n") {
            2
        } else {
            match memmem::find(buf, b"\r\n\r\n") {
                Some(index) => index + 4,
                None => {
                    if self.request_bytes + buf.len() > self.config.max_request_size {
                        self.head_too_large(buf, response, "The headers were too large to parse");
                        return true;
                    }
                    return false;
                }
            }
        };

        let head = buf.split_to(head_len);
        self.request_bytes += head.len();
        if self.request_bytes > self.config.max_request_size {
            self.head_too_large(buf, response, "The headers were too large to parse");
            return true;
        }

        let mut parsed = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let headers = match httparse::parse_headers(&head, &mut parsed) {
            Ok(httparse::Status::Complete((_, headers))) => headers,
            _ => {
                if self.config.logs(Verbosity::Info) {
                    info!("invalid headers in request from {}", self.peer_addr);
                }
                self.abort(
                    response,
                    StatusCode::BadRequest,
                    "Invalid headers in request, must contain a field name and value",
                );
                return true;
            }
        };

        for header in headers {
            let value = String::from_utf8_lossy(header.value);
            let value = value.trim();
            if header.name.eq_ignore_ascii_case("Cookie") {
                self.parse_cookie_header(value);
            } else {
                self.headers.append(header.name, value);
            }
        }

        self.expected_body_size = self.headers.get_parsed("Content-Length").unwrap_or(0);
        self.parse_content_type();

        if self.expected_body_size == 0 {
            self.state = ParseState::Complete;
            return true;
        }

        if self.mime_type == "multipart/form-data" {
            // Multipart bodies have their own limit; the head already
            // counted against `max_request_size`.
            if self.expected_body_size > self.config.max_multipart_size {
                if self.config.logs(Verbosity::Info) {
                    info!(
                        "maximum multipart size reached for {} ({})",
                        self.peer_addr, self.config.max_multipart_size
                    );
                }
                let message = format!(
                    "The body is too large to parse (max size: {})",
                    self.config.max_multipart_size
                );
                self.abort(response, StatusCode::PayloadTooLarge, &message);
                return true;
            }
            if self.boundary.is_empty() {
                self.invalid_multipart(response);
                return true;
            }
            // From here on the counter tracks body bytes only.
            self.request_bytes = 0;
            self.state = ParseState::ReadMultipartData;
        } else {
            if self.request_bytes + self.expected_body_size > self.config.max_request_size {
                if self.config.logs(Verbosity::Info) {
                    info!(
                        "maximum request size reached for {} ({})",
                        self.peer_addr, self.config.max_request_size
                    );
                }
                let message = format!(
                    "The body is too large to parse (max size: {})",
                    self.config.max_request_size
                );
                self.abort(response, StatusCode::PayloadTooLarge, &message);
                return true;
            }
            self.state = ParseState::ReadBody;
        }

        true
    }

    fn head_too_large(&mut self, buf: &mut BytesMut, response: &mut Response, what: &str) {
        if self.config.logs(Verbosity::Info) {
            info!(
                "maximum request size reached for {} ({})",
                self.peer_addr, self.config.max_request_size
            );
        }
        buf.clear();
        let message = format!("{} (max size: {})", what, self.config.max_request_size);
        self.abort(response, StatusCode::RequestHeaderFieldsTooLarge, &message);
    }

    fn parse_cookie_header(&mut self, value: &str) {
        // Cookies are split by semicolons, then on the first equals sign.
        // A later occurrence of a name overwrites the earlier one.
        for part in value.split(';') {
            let Some((name, cookie_value)) = part.split_once('=') else {
                if self.config.logs(Verbosity::Info) {
                    info!("invalid cookie header for {}: {}", self.peer_addr, value);
                }
                continue;
            };
            self.cookies
                .insert(name.trim().to_owned(), cookie_value.to_owned());
        }
    }

    fn parse_content_type(&mut self) {
        let content_type = match self.headers.get("Content-Type") {
            Some(value) => value.to_owned(),
            None => {
                self.mime_type = self.config.default_content_type.clone();
                self.charset = self.config.default_charset.clone();
                return;
            }
        };

        static FORM_DATA: OnceLock<Regex> = OnceLock::new();
        static WITH_CHARSET: OnceLock<Regex> = OnceLock::new();
        let form_data = FORM_DATA.get_or_init(|| {
            Regex::new(r#"^multipart/form-data;\s*boundary="?([^"]*)"?$"#).expect("boundary regex")
        });
        let with_charset = WITH_CHARSET.get_or_init(|| {
            Regex::new(r#"^(.*);\s*[cC]harset="?([^"]*)"?$"#).expect("charset regex")
        });

        if let Some(captures) = form_data.captures(&content_type) {
            self.mime_type = "multipart/form-data".to_owned();
            self.charset = self.config.default_charset.clone();
            self.boundary = captures[1].to_owned();
        } else if let Some(captures) = with_charset.captures(&content_type) {
            self.mime_type = captures[1].to_owned();
            self.charset = captures[2].to_owned();
        } else {
            self.mime_type = content_type;
            self.charset = self.config.default_charset.clone();
        }
    }

    fn parse_body(&mut self, buf: &mut BytesMut, _response: &mut Response) -> bool {
        if buf.is_empty() {
            return false;
        }

        let need = self.expected_body_size - self.body.len();
        let take = std::cmp::min(need, buf.len());
        let chunk = buf.split_to(take);
        self.request_bytes += chunk.len();
        self.body.extend_from_slice(&chunk);

        if self.body.len() < self.expected_body_size {
            return false;
        }

        self.state = ParseState::Complete;

        let gzipped = self
            .headers
            .get("Content-Encoding")
            .map(|encoding| encoding.eq_ignore_ascii_case("gzip"))
            .unwrap_or(false);
        if gzipped {
            let mut decoded = Vec::new();
            let mut decoder = GzDecoder::new(&self.body[..]);
            match decoder.read_to_end(&mut decoded) {
                Ok(_) => self.body = decoded,
                Err(_) => {
                    // Never fatal; the handler sees an empty body.
                    self.body = Vec::new();
                    if self.config.logs(Verbosity::Info) {
                        info!("unable to decompress gzip request from {}", self.peer_addr);
                    }
                }
            }
        }

        // Urlencoded bodies are drained into form fields so that form data
        // is in one place no matter which encoding the client picked.
        if self.mime_type == "application/x-www-form-urlencoded" {
            self.parse_form_body();
        }

        true
    }

    fn parse_form_body(&mut self) {
        self.form_fields.clear();
        self.form_files.clear();

        let body = self.parse_body_str();
        for (name, value) in form_urlencoded::parse(body.as_bytes()) {
            self.form_fields.insert(name.into_owned(), value.into_owned());
        }

        self.body.clear();
    }

    fn parse_multipart(&mut self, buf: &mut BytesMut, response: &mut Response) -> bool {
        // Move the available body bytes into the scan buffer, bounded so
        // pipelined bytes of a following request are left untouched.
        let remaining = self.expected_body_size - self.request_bytes;
        let take = std::cmp::min(remaining, buf.len());
        if take > 0 {
            let chunk = buf.split_to(take);
            self.request_bytes += chunk.len();
            self.buffer.extend_from_slice(&chunk);
        }

        match self.state {
            ParseState::ReadMultipartHeaders => self.scan_part_headers(response),
            _ => self.scan_part_data(response),
        }
    }

    fn scan_part_data(&mut self, response: &mut Response) -> bool {
        let delimiter = {
            let mut d = Vec::with_capacity(2 + self.boundary.len());
            d.extend_from_slice(b"--");
            d.extend_from_slice(self.boundary.as_bytes());
            d
        };
        // The delimiter is always followed by either CRLF (another part) or
        // "--" (end of parts).
        let delimiter_size = delimiter.len() + 2;

        match memmem::find(&self.buffer, &delimiter) {
            Some(index) => {
                if self.buffer.len() < index + delimiter_size {
                    // The deciding suffix has not arrived yet.
                    if self.request_bytes == self.expected_body_size {
                        self.invalid_multipart(response);
                        return true;
                    }
                    return false;
                }

                if let Some(part) = self.part.take() {
                    // Strip the CRLF separating the content from the
                    // delimiter.
                    let end = index.saturating_sub(2);
                    if part.file.is_some() {
                        match part.finish_file(&self.buffer[..end]) {
                            Ok((name, file)) => {
                                self.form_files.insert(name, file);
                            }
                            Err(err) => {
                                self.upload_failed(response, err);
                                return true;
                            }
                        }
                    } else {
                        let value = String::from_utf8_lossy(&self.buffer[..end]).into_owned();
                        self.form_fields.insert(part.name, value);
                    }
                } else if index != 0 {
                    // The body did not start with the boundary.
                    self.invalid_multipart(response);
                    return true;
                }

                let suffix = &self.buffer[index + delimiter.len()..index + delimiter_size];
                if suffix == b"\r\n" {
                    self.state = ParseState::ReadMultipartHeaders;
                    self.buffer.drain(..index + delimiter_size);
                } else if suffix == b"--" {
                    self.state = ParseState::Complete;
                    self.buffer.clear();
                } else {
                    self.invalid_multipart(response);
                }
                true
            }
            None => {
                if self.part.is_none() && self.buffer.len() > delimiter_size {
                    // Content before the first boundary.
                    self.invalid_multipart(response);
                    return true;
                }
                if self.request_bytes == self.expected_body_size {
                    // Body consumed without a final boundary.
                    self.invalid_multipart(response);
                    return true;
                }

                // Stream file content to disk, always retaining a
                // delimiter-sized tail so a delimiter split across reads
                // cannot be missed.
                let mut failed = None;
                if let Some(ref mut part) = self.part {
                    if part.file.is_some() && self.buffer.len() > delimiter_size {
                        let flush = self.buffer.len() - delimiter_size;
                        match part.write(&self.buffer[..flush]) {
                            Ok(()) => {
                                self.buffer.drain(..flush);
                            }
                            Err(err) => failed = Some(err),
                        }
                    }
                }
                if let Some(err) = failed {
                    self.upload_failed(response, err);
                    return true;
                }
                false
            }
        }
    }

    fn scan_part_headers(&mut self, response: &mut Response) -> bool {
        let index = match memmem::find(&self.buffer, b"\r\n\r\n") {
            Some(index) => index,
            None => {
                if self.request_bytes == self.expected_body_size {
                    self.invalid_multipart(response);
                    return true;
                }
                return false;
            }
        };

        let head = String::from_utf8_lossy(&self.buffer[..index]).into_owned();
        let Some((name, filename)) = PartSink::parse_disposition(&head) else {
            self.invalid_multipart(response);
            return true;
        };

        match PartSink::open(name, filename) {
            Ok(part) => self.part = Some(part),
            Err(err) => {
                self.upload_failed(response, err);
                return true;
            }
        }

        self.buffer.drain(..index + 4);
        self.state = ParseState::ReadMultipartData;
        true
    }

    fn invalid_multipart(&mut self, response: &mut Response) {
        if self.config.logs(Verbosity::Info) {
            info!("invalid multipart form data from {}", self.peer_addr);
        }
        self.buffer.clear();
        self.abort(response, StatusCode::BadRequest, "Invalid multipart form data");
    }

    fn upload_failed(&mut self, response: &mut Response, err: std::io::Error) {
        if self.config.logs(Verbosity::Warning) {
            warn!("unable to store upload from {}: {}", self.peer_addr, err);
        }
        self.buffer.clear();
        self.abort(
            response,
            StatusCode::InternalServerError,
            "Unable to store uploaded file",
        );
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::net::SocketAddr;
    use std::sync::Arc;

    use bytes::BytesMut;

    use super::{Advance, ParseState, Request};
    use crate::config::ServerConfig;
    use crate::method::Method;
    use crate::response::Response;
    use crate::status::StatusCode;

    fn pair(config: ServerConfig) -> (Request, Response) {
        let config = Arc::new(config);
        let peer: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        (Request::new(config.clone(), peer), Response::new(config))
    }

    fn feed(request: &mut Request, response: &mut Response, bytes: &[u8]) -> Advance {
        let mut buf = BytesMut::from(bytes);
        request.parse(&mut buf, response)
    }

    fn feed_chunked(
        request: &mut Request,
        response: &mut Response,
        bytes: &[u8],
        chunk_size: usize,
    ) -> Advance {
        let mut buf = BytesMut::new();
        for chunk in bytes.chunks(chunk_size) {
            buf.extend_from_slice(chunk);
            if let Advance::Done = request.parse(&mut buf, response) {
                return Advance::Done;
            }
        }
        Advance::Progress
    }

    #[test]
    fn parses_simple_get() {
        let (mut request, mut response) = pair(ServerConfig::default());
        let advance = feed(
            &mut request,
            &mut response,
            b"GET /foo?x=1&x=2 HTTP/1.1\r\nHost: h\r\nAccept: text/html\r\nAccept: application/json\r\n\r\n",
        );

        assert_eq!(advance, Advance::Done);
        assert_eq!(request.state(), ParseState::Complete);
        assert_eq!(*request.method(), Method::Get);
        assert_eq!(request.path(), "/foo");
        assert_eq!(request.version(), "HTTP/1.1");
        assert_eq!(request.query().get("x"), Some("1"));
        assert_eq!(request.headers().get("host"), Some("h"));
        assert_eq!(
            request.headers().get("accept"),
            Some("text/html, application/json")
        );
        assert!(!response.is_valid());
    }

    #[test]
    fn needs_more_bytes_for_partial_head() {
        let (mut request, mut response) = pair(ServerConfig::default());
        let advance = feed(&mut request, &mut response, b"GET / HTTP/1.1\r\nHost:");
        assert_eq!(advance, Advance::Progress);
        assert_eq!(request.state(), ParseState::ReadHeader);
    }

    #[test]
    fn tolerates_leading_empty_lines() {
        let (mut request, mut response) = pair(ServerConfig::default());
        let advance = feed(&mut request, &mut response, b"\r\n\r\nGET /x HTTP/1.1\r\n\r\n");
        assert_eq!(advance, Advance::Done);
        assert_eq!(request.state(), ParseState::Complete);
        assert_eq!(request.path(), "/x");
    }

    #[test]
    fn decodes_percent_encoded_path() {
        let (mut request, mut response) = pair(ServerConfig::default());
        feed(
            &mut request,
            &mut response,
            b"GET /with%20space#frag HTTP/1.1\r\n\r\n",
        );
        assert_eq!(request.path(), "/with space");
        assert_eq!(request.fragment(), Some("frag"));
    }

    #[test]
    fn unknown_method_is_405() {
        let (mut request, mut response) = pair(ServerConfig::default());
        let advance = feed(&mut request, &mut response, b"PATCH /x HTTP/1.1\r\nHost: h\r\n\r\n");
        assert_eq!(advance, Advance::Done);
        // The request still parses fully so the connection stays usable.
        assert_eq!(request.state(), ParseState::Complete);
        assert_eq!(response.status(), Some(StatusCode::MethodNotAllowed));
    }

    #[test]
    fn malformed_request_line_aborts_with_400() {
        let (mut request, mut response) = pair(ServerConfig::default());
        let advance = feed(&mut request, &mut response, b"GET  /two-spaces HTTP/1.1\r\n\r\n");
        assert_eq!(advance, Advance::Done);
        assert_eq!(request.state(), ParseState::Abort);
        assert_eq!(response.status(), Some(StatusCode::BadRequest));
        assert_eq!(response.headers().get("Connection"), Some("close"));
    }

    #[test]
    fn non_origin_form_target_is_400() {
        let (mut request, mut response) = pair(ServerConfig::default());
        feed(
            &mut request,
            &mut response,
            b"GET http://example.com/abs HTTP/1.1\r\n\r\n",
        );
        assert_eq!(request.state(), ParseState::Complete);
        assert_eq!(response.status(), Some(StatusCode::BadRequest));
    }

    #[test]
    fn old_http_versions_are_505() {
        let (mut request, mut response) = pair(ServerConfig::default());
        feed(&mut request, &mut response, b"GET / HTTP/1.0\r\n\r\n");
        assert_eq!(request.state(), ParseState::Complete);
        assert_eq!(response.status(), Some(StatusCode::HttpVersionNotSupported));
    }

    #[test]
    fn reads_fixed_size_body() {
        let (mut request, mut response) = pair(ServerConfig::default());
        let advance = feed(
            &mut request,
            &mut response,
            b"POST /submit HTTP/1.1\r\nContent-Length: 11\r\nContent-Type: text/plain\r\n\r\nhello world",
        );
        assert_eq!(advance, Advance::Done);
        assert_eq!(request.body(), b"hello world");
        assert_eq!(request.mime_type(), "text/plain");
    }

    #[test]
    fn body_can_arrive_in_pieces() {
        let (mut request, mut response) = pair(ServerConfig::default());
        let wire = b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\n0123456789";
        let advance = feed_chunked(&mut request, &mut response, wire, 7);
        assert_eq!(advance, Advance::Done);
        assert_eq!(request.body(), b"0123456789");
    }

    #[test]
    fn pipelined_bytes_are_left_in_the_buffer() {
        let (mut request, mut response) = pair(ServerConfig::default());
        let mut buf = BytesMut::from(
            &b"GET /first HTTP/1.1\r\n\r\nGET /second HTTP/1.1\r\n\r\n"[..],
        );
        assert_eq!(request.parse(&mut buf, &mut response), Advance::Done);
        assert_eq!(request.path(), "/first");

        let (mut second, mut second_response) = pair(ServerConfig::default());
        assert_eq!(second.parse(&mut buf, &mut second_response), Advance::Done);
        assert_eq!(second.path(), "/second");
        assert!(buf.is_empty());
    }

    #[test]
    fn cookies_are_split_from_headers() {
        let (mut request, mut response) = pair(ServerConfig::default());
        feed(
            &mut request,
            &mut response,
            b"GET / HTTP/1.1\r\nCookie: session=abc; theme=dark; invalid\r\nCookie: session=later\r\n\r\n",
        );
        assert_eq!(request.cookie("session"), Some("later"));
        assert_eq!(request.cookie("theme"), Some("dark"));
        assert_eq!(request.cookies().len(), 2);
        // Cookie headers do not appear in the header map.
        assert!(request.headers().get("Cookie").is_none());
    }

    #[test]
    fn content_type_defaults_apply() {
        let (mut request, mut response) = pair(ServerConfig::default());
        feed(&mut request, &mut response, b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(request.mime_type(), "application/octet-stream");
        assert_eq!(request.charset(), "utf-8");
    }

    #[test]
    fn content_type_charset_is_captured() {
        let (mut request, mut response) = pair(ServerConfig::default());
        feed(
            &mut request,
            &mut response,
            b"POST / HTTP/1.1\r\nContent-Type: text/html; charset=\"ISO-8859-1\"\r\nContent-Length: 1\r\n\r\n\xe9",
        );
        assert_eq!(request.mime_type(), "text/html");
        assert_eq!(request.charset(), "ISO-8859-1");
        assert_eq!(request.parse_body_str(), "\u{e9}");
    }

    #[test]
    fn urlencoded_body_becomes_form_fields() {
        let (mut request, mut response) = pair(ServerConfig::default());
        let advance = feed(
            &mut request,
            &mut response,
            b"POST /form HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: 21\r\n\r\nname=John+Doe&lang=en",
        );
        assert_eq!(advance, Advance::Done);
        assert_eq!(request.form_field("name"), Some("John Doe"));
        assert_eq!(request.form_field("lang"), Some("en"));
        // The body was drained into the fields.
        assert!(request.body().is_empty());
    }

    #[test]
    fn gzip_request_bodies_are_decompressed() {
        let payload = b"a body worth compressing, a body worth compressing";
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(payload).unwrap();
        let compressed = encoder.finish().unwrap();

        let mut wire = format!(
            "POST / HTTP/1.1\r\nContent-Encoding: gzip\r\nContent-Length: {}\r\n\r\n",
            compressed.len()
        )
        .into_bytes();
        wire.extend_from_slice(&compressed);

        let (mut request, mut response) = pair(ServerConfig::default());
        let advance = feed(&mut request, &mut response, &wire);
        assert_eq!(advance, Advance::Done);
        assert_eq!(request.body(), payload);
    }

    #[test]
    fn broken_gzip_yields_empty_body_not_an_error() {
        let (mut request, mut response) = pair(ServerConfig::default());
        let advance = feed(
            &mut request,
            &mut response,
            b"POST / HTTP/1.1\r\nContent-Encoding: gzip\r\nContent-Length: 9\r\n\r\nnot gzip!",
        );
        assert_eq!(advance, Advance::Done);
        assert_eq!(request.state(), ParseState::Complete);
        assert!(request.body().is_empty());
        assert!(!response.is_valid());
    }

    #[test]
    fn oversized_head_is_431() {
        let config = ServerConfig {
            max_request_size: 128,
            ..ServerConfig::default()
        };
        let (mut request, mut response) = pair(config);
        let mut wire = b"GET / HTTP/1.1\r\nX-Padding: ".to_vec();
        wire.extend_from_slice(&vec![b'a'; 256]);
        wire.extend_from_slice(b"\r\n\r\n");

        let advance = feed(&mut request, &mut response, &wire);
        assert_eq!(advance, Advance::Done);
        assert_eq!(request.state(), ParseState::Abort);
        assert_eq!(
            response.status(),
            Some(StatusCode::RequestHeaderFieldsTooLarge)
        );
    }

    #[test]
    fn oversized_body_is_413() {
        let config = ServerConfig {
            max_request_size: 256,
            ..ServerConfig::default()
        };
        let (mut request, mut response) = pair(config);
        let advance = feed(
            &mut request,
            &mut response,
            b"POST / HTTP/1.1\r\nContent-Length: 100000\r\n\r\n",
        );
        assert_eq!(advance, Advance::Done);
        assert_eq!(request.state(), ParseState::Abort);
        assert_eq!(response.status(), Some(StatusCode::PayloadTooLarge));
        assert_eq!(response.headers().get("Connection"), Some("close"));
    }

    fn multipart_wire(boundary: &str, file_bytes: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(b"Content-Disposition: form-data; name=\"title\"\r\n\r\n");
        body.extend_from_slice(b"hello\r\n");
        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(
            b"Content-Disposition: form-data; name=\"photo\"; filename=\"a.png\"\r\n",
        );
        body.extend_from_slice(b"Content-Type: image/png\r\n\r\n");
        body.extend_from_slice(file_bytes);
        body.extend_from_slice(b"\r\n");
        body.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());

        let mut wire = format!(
            "POST /upload HTTP/1.1\r\nContent-Type: multipart/form-data; boundary={}\r\nContent-Length: {}\r\n\r\n",
            boundary,
            body.len()
        )
        .into_bytes();
        wire.extend_from_slice(&body);
        wire
    }

    #[test]
    fn multipart_fields_and_files_are_collected() {
        let file_bytes: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let wire = multipart_wire("BoUnDaRy123", &file_bytes);

        let config = ServerConfig {
            max_multipart_size: 1024 * 1024,
            ..ServerConfig::default()
        };
        let (mut request, mut response) = pair(config);
        let advance = feed(&mut request, &mut response, &wire);

        assert_eq!(advance, Advance::Done);
        assert_eq!(request.state(), ParseState::Complete);
        assert!(!response.is_valid());
        assert_eq!(request.form_field("title"), Some("hello"));

        let file = request.form_file("photo").expect("photo file");
        assert_eq!(file.filename(), "a.png");
        assert_eq!(std::fs::read(file.path()).unwrap(), file_bytes);
    }

    #[test]
    fn multipart_survives_delimiters_split_across_reads() {
        let file_bytes: Vec<u8> = (0..10_000u32).map(|i| (i % 13) as u8).collect();
        let wire = multipart_wire("xyz", &file_bytes);

        // Feed in awkward chunk sizes so boundaries straddle reads.
        for chunk_size in [1, 3, 7, 64] {
            let (mut request, mut response) = pair(ServerConfig::default());
            let advance = feed_chunked(&mut request, &mut response, &wire, chunk_size);
            assert_eq!(advance, Advance::Done, "chunk size {}", chunk_size);
            assert_eq!(request.state(), ParseState::Complete);
            assert_eq!(request.form_field("title"), Some("hello"));
            let file = request.form_file("photo").expect("photo file");
            assert_eq!(std::fs::read(file.path()).unwrap(), file_bytes);
        }
    }

    #[test]
    fn multipart_missing_initial_boundary_is_400() {
        let boundary = "bound";
        let body = b"garbage that is not a boundary at all, longer than the delimiter";
        let mut wire = format!(
            "POST / HTTP/1.1\r\nContent-Type: multipart/form-data; boundary={}\r\nContent-Length: {}\r\n\r\n",
            boundary,
            body.len()
        )
        .into_bytes();
        wire.extend_from_slice(body);

        let (mut request, mut response) = pair(ServerConfig::default());
        let advance = feed(&mut request, &mut response, &wire);
        assert_eq!(advance, Advance::Done);
        assert_eq!(request.state(), ParseState::Abort);
        assert_eq!(response.status(), Some(StatusCode::BadRequest));
    }

    #[test]
    fn multipart_truncated_final_boundary_is_400() {
        let boundary = "bound";
        let body = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"t\"\r\n\r\nvalue\r\n--{b}",
            b = boundary
        );
        // Content-Length stops before the final "--".
        let mut wire = format!(
            "POST / HTTP/1.1\r\nContent-Type: multipart/form-data; boundary={}\r\nContent-Length: {}\r\n\r\n",
            boundary,
            body.len()
        )
        .into_bytes();
        wire.extend_from_slice(body.as_bytes());

        let (mut request, mut response) = pair(ServerConfig::default());
        let advance = feed(&mut request, &mut response, &wire);
        assert_eq!(advance, Advance::Done);
        assert_eq!(request.state(), ParseState::Abort);
        assert_eq!(response.status(), Some(StatusCode::BadRequest));
    }

    #[test]
    fn multipart_body_over_limit_is_413() {
        let config = ServerConfig {
            max_multipart_size: 1024,
            ..ServerConfig::default()
        };
        let (mut request, mut response) = pair(config);
        let advance = feed(
            &mut request,
            &mut response,
            b"POST / HTTP/1.1\r\nContent-Type: multipart/form-data; boundary=b\r\nContent-Length: 100000\r\n\r\n",
        );
        assert_eq!(advance, Advance::Done);
        assert_eq!(request.state(), ParseState::Abort);
        assert_eq!(response.status(), Some(StatusCode::PayloadTooLarge));
    }

    #[test]
    fn parse_json_body_round_trips() {
        let body = br#"{"name": "test", "count": 3}"#;
        let mut wire = format!(
            "POST / HTTP/1.1\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n",
            body.len()
        )
        .into_bytes();
        wire.extend_from_slice(body);

        let (mut request, mut response) = pair(ServerConfig::default());
        feed(&mut request, &mut response, &wire);
        let value = request.parse_json_body().unwrap();
        assert_eq!(value["name"], "test");
        assert_eq!(value["count"], 3);

        let (mut bad, mut bad_response) = pair(ServerConfig::default());
        feed(
            &mut bad,
            &mut bad_response,
            b"POST / HTTP/1.1\r\nContent-Type: application/json\r\nContent-Length: 3\r\n\r\n{{{",
        );
        assert_eq!(
            bad.parse_json_body().unwrap_err().status(),
            StatusCode::BadRequest
        );
    }
}
