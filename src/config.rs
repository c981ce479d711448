//! Server configuration.
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use crate::status::StatusCode;

/// How much the server logs.
///
/// Each log statement inside the library is gated on the configured level;
/// output goes through [`tracing`], so a subscriber may filter further.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    /// Nothing at all.
    None,
    /// Unrecoverable problems only.
    Critical,
    /// Problems the server worked around.
    Warning,
    /// Request/connection lifecycle events.
    Info,
    /// Parser and connection internals.
    Debug,
    /// Everything.
    All,
}

/// Configuration for a [`Server`](crate::Server).
///
/// Immutable once the server is constructed; connections share it by
/// reference.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Address to listen on. Defaults to any IPv4 interface.
    pub host: IpAddr,
    /// Port to listen on. Defaults to 80.
    pub port: u16,

    /// Ceiling on concurrent connections. Connections over the limit are
    /// sent a `503 Service Unavailable` and closed.
    pub max_connections: usize,
    /// Listen backlog for the listener socket.
    pub max_pending_connections: u32,

    /// Cap on request line + headers + non-multipart body, in bytes.
    /// Exceeding it on the head yields 431, on the body 413.
    pub max_request_size: usize,
    /// Cap on a multipart body alone, in bytes. Exceeding it yields 413.
    pub max_multipart_size: usize,

    /// Time allowed to receive a request, restarted when the body phase
    /// begins so large uploads get fresh time. Zero disables the timer.
    pub request_timeout: Duration,
    /// How long an idle connection is kept open for further requests.
    /// Expiry closes the socket silently. Zero disables the timer.
    pub keep_alive_timeout: Duration,
    /// Time a handler has to finish processing asynchronously before the
    /// request is answered with 408. Zero disables the timer.
    pub response_timeout: Duration,

    /// Content type assumed when a request carries none.
    pub default_content_type: String,
    /// Charset assumed when a request carries none.
    pub default_charset: String,

    /// Log level.
    pub verbosity: Verbosity,

    /// Path to a PEM private key. TLS is enabled when both this and
    /// `tls_cert_path` are set and the material loads; anything else
    /// disables TLS with a warning.
    pub tls_key_path: Option<PathBuf>,
    /// Passphrase for the private key.
    pub tls_key_passphrase: Option<String>,
    /// Path to a PEM certificate chain.
    pub tls_cert_path: Option<PathBuf>,

    /// Per-status path to an HTML template used by
    /// [`Response::set_error`](crate::Response::set_error). Templates may
    /// use the `${statusCode}`, `${statusStr}` and `${message}`
    /// placeholders.
    pub error_document_map: HashMap<StatusCode, PathBuf>,
    /// `Cache-Control: max-age` attached to rendered error documents, in
    /// seconds. Zero omits the header.
    pub error_document_cache_time: u64,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 80,
            max_connections: 100,
            max_pending_connections: 100,
            max_request_size: 16 * 1024,
            max_multipart_size: 1024 * 1024,
            request_timeout: Duration::from_secs(10),
            keep_alive_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(10),
            default_content_type: "application/octet-stream".to_owned(),
            default_charset: "utf-8".to_owned(),
            verbosity: Verbosity::None,
            tls_key_path: None,
            tls_key_passphrase: None,
            tls_cert_path: None,
            error_document_map: HashMap::new(),
            error_document_cache_time: 60 * 60 * 24,
        }
    }
}

impl ServerConfig {
    /// Whether statements at `level` should be logged.
    pub(crate) fn logs(&self, level: Verbosity) -> bool {
        self.verbosity >= level
    }
}
