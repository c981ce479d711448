//! Response builder and serializer.
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use flate2::write::GzEncoder;
use flate2::Compression;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{info, warn};

use crate::config::{ServerConfig, Verbosity};
use crate::cookie::Cookie;
use crate::error::HttpError;
use crate::header::HeaderMap;
use crate::method::Method;
use crate::status::StatusCode;

const VERSION: &str = "HTTP/1.1";

/// Options for [`Response::send_file`].
#[derive(Clone, Copy, Debug, Default)]
pub struct SendFileOptions<'a> {
    /// MIME type for `Content-Type`. Guessed from the file extension when
    /// absent, falling back to the configured default.
    pub mime_type: Option<&'a str>,
    /// Charset appended to `Content-Type` when present.
    pub charset: Option<&'a str>,
    /// gzip the content at this level (0-9) and set `Content-Encoding`.
    pub compress_level: Option<u32>,
    /// Serve as a download: sets `Content-Disposition: attachment` with
    /// this filename.
    pub attachment_filename: Option<&'a str>,
    /// `Cache-Control: max-age` in seconds.
    pub cache_time: Option<u64>,
}

/// An outgoing HTTP response.
///
/// A response starts without a status; it becomes *valid* (sendable) once
/// a status is set, *sending* once its wire buffer has been built, and
/// *sent* once the write cursor reaches the end of that buffer.
#[derive(Debug)]
pub struct Response {
    config: Arc<ServerConfig>,
    status: Option<StatusCode>,
    headers: HeaderMap,
    cookies: Vec<Cookie>,
    body: Vec<u8>,

    // Wire form and write cursor.
    buffer: Vec<u8>,
    written: usize,
}

impl Response {
    pub(crate) fn new(config: Arc<ServerConfig>) -> Response {
        Response {
            config,
            status: None,
            headers: HeaderMap::new(),
            cookies: Vec::new(),
            body: Vec::new(),
            buffer: Vec::new(),
            written: 0,
        }
    }

    /// Whether a status has been set.
    pub fn is_valid(&self) -> bool {
        self.status.is_some()
    }

    pub(crate) fn is_sending(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// The status, once set.
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    /// The response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The body bytes.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// A cookie previously set on this response.
    pub fn cookie(&self, name: &str) -> Option<&Cookie> {
        self.cookies.iter().find(|cookie| cookie.name == name)
    }

    /// Sets the status line.
    pub fn set_status(&mut self, status: StatusCode) {
        self.status = Some(status);
    }

    /// Sets status, body and `Content-Type` in one go.
    ///
    /// An empty `content_type` falls back to the configured default. The
    /// content type must carry the charset when one applies; it cannot be
    /// deduced from the body bytes.
    pub fn set_status_with<B: Into<Vec<u8>>>(
        &mut self,
        status: StatusCode,
        body: B,
        content_type: &str,
    ) {
        self.status = Some(status);
        self.body = body.into();
        let content_type = if content_type.is_empty() {
            self.config.default_content_type.as_str()
        } else {
            content_type
        };
        self.headers.set("Content-Type", content_type);
    }

    /// Sets status and a JSON body.
    pub fn set_status_json(&mut self, status: StatusCode, body: &serde_json::Value) {
        self.status = Some(status);
        self.body = body.to_string().into_bytes();
        self.headers.set("Content-Type", "application/json");
    }

    /// Replaces the body without touching status or headers.
    pub fn set_body<B: Into<Vec<u8>>>(&mut self, body: B) {
        self.body = body.into();
    }

    /// Sets a header, replacing any existing value.
    pub fn set_header<N, V>(&mut self, name: N, value: V)
    where
        N: Into<String>,
        V: Into<String>,
    {
        self.headers.set(name, value);
    }

    /// Sets a header with the value percent-encoded.
    pub fn set_header_encoded<N: Into<String>>(&mut self, name: N, value: &str) {
        let encoded: String = utf8_percent_encode(value, NON_ALPHANUMERIC).collect();
        self.headers.set(name, encoded);
    }

    /// Mutable access to the headers.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Adds a cookie. A response cannot carry two cookies with the same
    /// name; the second set is ignored with a warning.
    pub fn set_cookie(&mut self, cookie: Cookie) {
        if self.cookies.iter().any(|existing| existing.name == cookie.name) {
            if self.config.logs(Verbosity::Warning) {
                warn!(
                    "HTTP response cannot have two cookies with the same name: {}",
                    cookie.name
                );
            }
            return;
        }
        self.cookies.push(cookie);
    }

    /// Redirects to `url`: status 308 when `permanent`, 307 otherwise,
    /// plus a `Location` header.
    pub fn redirect(&mut self, url: &str, permanent: bool) {
        self.set_status(if permanent {
            StatusCode::PermanentRedirect
        } else {
            StatusCode::TemporaryRedirect
        });
        self.headers.set("Location", url);
    }

    /// gzip-compresses the body and sets `Content-Encoding`. Does nothing
    /// when the body is empty.
    pub fn compress_body(&mut self, level: u32) {
        if self.body.is_empty() {
            return;
        }

        let mut encoder = GzEncoder::new(Vec::new(), Compression::new(level.min(9)));
        let written = encoder.write_all(&self.body);
        match written.and_then(|_| encoder.finish()) {
            Ok(compressed) => {
                self.body = compressed;
                self.headers.set("Content-Encoding", "gzip");
            }
            Err(err) => {
                if self.config.logs(Verbosity::Warning) {
                    warn!("unable to compress response body: {}", err);
                }
            }
        }
    }

    /// Loads the body from a file.
    ///
    /// Does not set the status. The MIME type is taken from the options,
    /// guessed from the file extension, or the configured default.
    pub async fn send_file<P: AsRef<Path>>(
        &mut self,
        path: P,
        options: SendFileOptions<'_>,
    ) -> Result<(), HttpError> {
        let path = path.as_ref();
        let content = match tokio::fs::read(path).await {
            Ok(content) => content,
            Err(err) => {
                if self.config.logs(Verbosity::Info) {
                    info!("unable to open file to be sent ({}): {}", path.display(), err);
                }
                return Err(HttpError::with_message(
                    StatusCode::NotFound,
                    "Unable to open file",
                ));
            }
        };

        let guessed;
        let mime_type = match options.mime_type {
            Some(mime_type) => mime_type,
            None => match mime_guess::from_path(path).first_raw() {
                Some(guess) => guess,
                None => {
                    guessed = self.config.default_content_type.clone();
                    guessed.as_str()
                }
            },
        };

        self.finish_send(content, mime_type, options);
        Ok(())
    }

    /// Loads the body from a byte stream, reading it to the end.
    ///
    /// Like [`send_file`](Response::send_file) but with nothing to guess a
    /// MIME type from: the options or the configured default decide.
    pub async fn send_reader<R>(
        &mut self,
        reader: &mut R,
        options: SendFileOptions<'_>,
    ) -> Result<(), HttpError>
    where
        R: AsyncRead + Unpin,
    {
        let mut content = Vec::new();
        reader
            .read_to_end(&mut content)
            .await
            .map_err(HttpError::internal)?;

        let guessed;
        let mime_type = match options.mime_type {
            Some(mime_type) => mime_type,
            None => {
                guessed = self.config.default_content_type.clone();
                guessed.as_str()
            }
        };

        self.finish_send(content, mime_type, options);
        Ok(())
    }

    fn finish_send(&mut self, content: Vec<u8>, mime_type: &str, options: SendFileOptions<'_>) {
        self.body = content;
        match options.charset {
            Some(charset) => {
                self.headers
                    .set("Content-Type", format!("{}; charset={}", mime_type, charset));
            }
            None => self.headers.set("Content-Type", mime_type),
        }

        if let Some(filename) = options.attachment_filename {
            self.headers.set(
                "Content-Disposition",
                format!("attachment; filename=\"{}\"", filename),
            );
        }

        if let Some(cache_time) = options.cache_time {
            if cache_time > 0 {
                self.headers
                    .set("Cache-Control", format!("max-age={}", cache_time));
            }
        }

        if let Some(level) = options.compress_level {
            self.compress_body(level);
        }
    }

    /// Renders the standard error path for `status`.
    ///
    /// An error document configured for the status is read and its
    /// `${message}`, `${statusCode}` and `${statusStr}` placeholders are
    /// substituted. Without a (readable) template the body is a JSON
    /// `{"message": …}` when a message is given, or empty. When
    /// `close_connection` is set the response forces `Connection: close`;
    /// otherwise the connection keeps whatever the request implied.
    pub fn set_error(&mut self, status: StatusCode, message: &str, close_connection: bool) {
        let template = self
            .config
            .error_document_map
            .get(&status)
            .and_then(|path| std::fs::read(path).ok());

        match template {
            Some(template) => {
                let mut buf = itoa::Buffer::new();
                let text = String::from_utf8_lossy(&template)
                    .replace("${message}", message)
                    .replace("${statusCode}", buf.format(status.as_u16()))
                    .replace("${statusStr}", status.canonical_reason());
                self.set_status_with(status, text, "text/html");
                if self.config.error_document_cache_time > 0 {
                    self.headers.set(
                        "Cache-Control",
                        format!("max-age={}", self.config.error_document_cache_time),
                    );
                }
            }
            None if !message.is_empty() => {
                self.set_status_json(status, &serde_json::json!({ "message": message }));
            }
            None => self.set_status(status),
        }

        if close_connection {
            self.headers.set("Connection", "close");
        }
    }

    /// Fills defaults derived from the paired request: the `Connection`
    /// header is inherited (defaulting to keep-alive) and a 405 gets its
    /// `Allow` header.
    pub(crate) fn setup_from_request(&mut self, request_connection: Option<&str>) {
        if !self.headers.contains("Connection") {
            self.headers
                .set("Connection", request_connection.unwrap_or("keep-alive"));
        }

        if self.status == Some(StatusCode::MethodNotAllowed) && !self.headers.contains("Allow") {
            self.headers.set("Allow", Method::allow_header());
        }
    }

    /// Whether this response leaves the connection open.
    pub(crate) fn keeps_alive(&self) -> bool {
        // Connection defaults to keep-alive when absent.
        match self.headers.get("Connection") {
            Some(value) => !value.to_ascii_lowercase().contains("close"),
            None => true,
        }
    }

    /// Materializes the wire buffer: status line, headers in insertion
    /// order, one `Set-Cookie` per cookie, terminating CRLF and the body.
    pub(crate) fn prepare_to_send(&mut self) {
        // Keep-Alive advertises the idle timeout iff the connection stays
        // open.
        let keep_alive = self
            .headers
            .get("Connection")
            .map(|value| value.to_ascii_lowercase().contains("keep-alive"))
            .unwrap_or(false);
        if keep_alive {
            self.headers.set(
                "Keep-Alive",
                format!("timeout={}", self.config.keep_alive_timeout.as_secs()),
            );
        }

        let mut length = itoa::Buffer::new();
        self.headers.set("Content-Length", length.format(self.body.len()));

        let status = self.status.unwrap_or(StatusCode::InternalServerError);

        self.written = 0;
        self.buffer.clear();
        self.buffer.reserve(2048 + self.body.len());

        self.buffer.extend_from_slice(VERSION.as_bytes());
        self.buffer.push(b' ');
        let mut code = itoa::Buffer::new();
        self.buffer.extend_from_slice(code.format(status.as_u16()).as_bytes());
        self.buffer.push(b' ');
        self.buffer.extend_from_slice(status.canonical_reason().as_bytes());
        self.buffer.extend_from_slice(b"\r\n");

        for (name, value) in self.headers.iter() {
            self.buffer.extend_from_slice(name.as_bytes());
            self.buffer.extend_from_slice(b": ");
            self.buffer.extend_from_slice(value.as_bytes());
            self.buffer.extend_from_slice(b"\r\n");
        }

        for cookie in &self.cookies {
            self.buffer.extend_from_slice(b"Set-Cookie: ");
            self.buffer.extend_from_slice(cookie.serialize().as_bytes());
            self.buffer.extend_from_slice(b"\r\n");
        }

        self.buffer.extend_from_slice(b"\r\n");
        self.buffer.extend_from_slice(&self.body);
    }

    /// Writes the wire buffer from the cursor. Returns `false` when the
    /// socket failed and must be force-closed.
    pub(crate) async fn write_wire<W>(&mut self, socket: &mut W) -> bool
    where
        W: AsyncWrite + Unpin,
    {
        while self.written < self.buffer.len() {
            match socket.write(&self.buffer[self.written..]).await {
                Ok(0) | Err(_) => return false,
                Ok(n) => self.written += n,
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{Response, SendFileOptions};
    use crate::config::ServerConfig;
    use crate::cookie::Cookie;
    use crate::status::StatusCode;

    fn response() -> Response {
        Response::new(Arc::new(ServerConfig::default()))
    }

    #[test]
    fn starts_invalid() {
        let response = response();
        assert!(!response.is_valid());
        assert_eq!(response.status(), None);
    }

    #[test]
    fn serializes_expected_wire_form() {
        let mut response = response();
        response.set_status_with(StatusCode::Ok, "hi", "text/plain");
        response.setup_from_request(None);
        response.prepare_to_send();
        assert_eq!(
            response.buffer,
            b"HTTP/1.1 200 OK\r\n\
              Content-Type: text/plain\r\n\
              Connection: keep-alive\r\n\
              Keep-Alive: timeout=5\r\n\
              Content-Length: 2\r\n\
              \r\n\
              hi"
            .to_vec()
        );
    }

    #[test]
    fn close_responses_omit_keep_alive() {
        let mut response = response();
        response.set_status(StatusCode::Ok);
        response.set_header("Connection", "close");
        response.prepare_to_send();
        assert!(!response.keeps_alive());
        assert!(response.headers().get("Keep-Alive").is_none());
    }

    #[test]
    fn content_length_matches_body() {
        let mut response = response();
        response.set_status_with(StatusCode::Ok, vec![0u8; 1234], "application/octet-stream");
        response.setup_from_request(None);
        response.prepare_to_send();
        assert_eq!(response.headers().get("Content-Length"), Some("1234"));
    }

    #[test]
    fn redirect_picks_status_by_permanence() {
        let mut permanent = response();
        permanent.redirect("https://example.com/next", true);
        assert_eq!(permanent.status(), Some(StatusCode::PermanentRedirect));
        assert_eq!(permanent.headers().get("Location"), Some("https://example.com/next"));

        let mut temporary = response();
        temporary.redirect("/elsewhere", false);
        assert_eq!(temporary.status(), Some(StatusCode::TemporaryRedirect));
        assert_eq!(temporary.headers().get("Location"), Some("/elsewhere"));
    }

    #[test]
    fn error_with_message_renders_json() {
        let mut response = response();
        response.set_error(StatusCode::Unauthorized, "Access denied", false);
        assert_eq!(response.status(), Some(StatusCode::Unauthorized));
        assert_eq!(response.headers().get("Content-Type"), Some("application/json"));
        assert_eq!(response.body(), br#"{"message":"Access denied"}"#);
        assert!(response.headers().get("Connection").is_none());
    }

    #[test]
    fn error_without_message_has_empty_body() {
        let mut response = response();
        response.set_error(StatusCode::RequestTimeout, "", true);
        assert_eq!(response.status(), Some(StatusCode::RequestTimeout));
        assert!(response.body().is_empty());
        assert_eq!(response.headers().get("Connection"), Some("close"));
    }

    #[test]
    fn error_document_substitutes_placeholders() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("404.html");
        std::fs::write(&template, "<h1>${statusCode} ${statusStr}</h1><p>${message}</p>").unwrap();

        let mut config = ServerConfig::default();
        config.error_document_map.insert(StatusCode::NotFound, template);
        config.error_document_cache_time = 60;

        let mut response = Response::new(Arc::new(config));
        response.set_error(StatusCode::NotFound, "no such page", false);
        assert_eq!(
            response.body(),
            b"<h1>404 Not Found</h1><p>no such page</p>"
        );
        assert_eq!(response.headers().get("Content-Type"), Some("text/html"));
        assert_eq!(response.headers().get("Cache-Control"), Some("max-age=60"));
    }

    #[test]
    fn setup_fills_allow_for_405() {
        let mut response = response();
        response.set_status(StatusCode::MethodNotAllowed);
        response.setup_from_request(Some("keep-alive"));
        assert_eq!(
            response.headers().get("Allow"),
            Some("GET, HEAD, POST, PUT, DELETE, OPTIONS")
        );
    }

    #[test]
    fn setup_inherits_request_connection() {
        let mut response = response();
        response.set_status(StatusCode::Ok);
        response.setup_from_request(Some("close"));
        assert_eq!(response.headers().get("Connection"), Some("close"));
        assert!(!response.keeps_alive());
    }

    #[test]
    fn compress_body_round_trips() {
        use std::io::Read;

        let mut response = response();
        let body = "squeeze me ".repeat(100);
        response.set_status_with(StatusCode::Ok, body.clone(), "text/plain");
        response.compress_body(6);

        assert_eq!(response.headers().get("Content-Encoding"), Some("gzip"));
        assert!(response.body().len() < body.len());

        let mut decoded = String::new();
        flate2::read::GzDecoder::new(response.body())
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, body);
    }

    #[test]
    fn cookies_serialize_one_line_each() {
        let mut response = response();
        response.set_status(StatusCode::Ok);
        response.set_cookie(Cookie::new("a", "1"));
        response.set_cookie(Cookie::new("b", "2"));
        // Duplicate names are rejected.
        response.set_cookie(Cookie::new("a", "3"));
        response.prepare_to_send();

        let wire = String::from_utf8(response.buffer.clone()).unwrap();
        assert!(wire.contains("Set-Cookie: a=1; Path=%2F\r\n"));
        assert!(wire.contains("Set-Cookie: b=2; Path=%2F\r\n"));
        assert!(!wire.contains("a=3"));
    }

    #[tokio::test]
    async fn send_file_guesses_mime_and_sets_attachment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.html");
        tokio::fs::write(&path, "<html></html>").await.unwrap();

        let mut response = response();
        response
            .send_file(
                &path,
                SendFileOptions {
                    attachment_filename: Some("report.html"),
                    cache_time: Some(120),
                    ..SendFileOptions::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(response.body(), b"<html></html>");
        assert_eq!(response.headers().get("Content-Type"), Some("text/html"));
        assert_eq!(
            response.headers().get("Content-Disposition"),
            Some("attachment; filename=\"report.html\"")
        );
        assert_eq!(response.headers().get("Cache-Control"), Some("max-age=120"));
    }

    #[tokio::test]
    async fn send_reader_uses_options_or_default_mime() {
        let mut response = response();
        let mut reader = &b"raw bytes"[..];
        response
            .send_reader(&mut reader, SendFileOptions::default())
            .await
            .unwrap();
        assert_eq!(response.body(), b"raw bytes");
        assert_eq!(
            response.headers().get("Content-Type"),
            Some("application/octet-stream")
        );
    }

    #[tokio::test]
    async fn send_file_missing_file_is_an_error() {
        let mut response = response();
        let err = response
            .send_file("/no/such/file", SendFileOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::NotFound);
    }
}
