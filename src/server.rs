//! The server shell: listener, connection ceiling, per-connection tasks.
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::io::AsyncWriteExt;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

use crate::config::{ServerConfig, Verbosity};
use crate::conn;
use crate::error::Error;
use crate::response::Response;
use crate::service::Handler;
use crate::status::StatusCode;
use crate::tls;

/// An HTTP/1.1 server.
///
/// Binds eagerly so the listen address (and an ephemeral port) is known
/// before [`serve`](Server::serve) takes over:
///
/// ```no_run
/// use hearth::{handler_fn, Exchange, Server, ServerConfig, StatusCode};
///
/// # async fn run() -> hearth::Result<()> {
/// let config = ServerConfig { port: 8080, ..ServerConfig::default() };
/// let server = Server::bind(config)?;
/// server
///     .serve(handler_fn(|mut exchange: Exchange| async move {
///         exchange.response.set_status_with(StatusCode::Ok, "hello!", "text/plain");
///         Ok(exchange)
///     }))
///     .await
/// # }
/// ```
pub struct Server {
    config: Arc<ServerConfig>,
    listener: std::net::TcpListener,
    local_addr: SocketAddr,
    tls: Option<TlsAcceptor>,
}

impl Server {
    /// Binds the listen socket and loads TLS material.
    ///
    /// TLS problems are not fatal: invalid or unreadable material logs a
    /// warning and the server stays plain-text.
    pub fn bind(config: ServerConfig) -> crate::Result<Server> {
        let addr = SocketAddr::new(config.host, config.port);

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(Error::new_listen)?;
        socket.set_reuse_address(true).map_err(Error::new_listen)?;
        socket.bind(&addr.into()).map_err(Error::new_listen)?;
        socket
            .listen(config.max_pending_connections as i32)
            .map_err(Error::new_listen)?;
        socket.set_nonblocking(true).map_err(Error::new_listen)?;

        let listener: std::net::TcpListener = socket.into();
        let local_addr = listener.local_addr().map_err(Error::new_listen)?;
        let tls = tls::load_acceptor(&config);

        Ok(Server {
            config: Arc::new(config),
            listener,
            local_addr,
            tls,
        })
    }

    /// The bound address; useful when the configured port was 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts connections forever, handing each to `handler`.
    ///
    /// Connections over `max_connections` are answered with a synthesized
    /// `503 Service Unavailable` and closed.
    pub async fn serve<H: Handler>(self, handler: H) -> crate::Result<()> {
        let listener = TcpListener::from_std(self.listener).map_err(Error::new_listen)?;
        let handler = Arc::new(handler);
        let active = Arc::new(AtomicUsize::new(0));

        if self.config.logs(Verbosity::Info) {
            info!("listening on {}", self.local_addr);
        }

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    // Likely out of file descriptors; log, wait, go on.
                    if self.config.logs(Verbosity::Critical) {
                        error!("accept error: {}", err);
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            if active.load(Ordering::SeqCst) >= self.config.max_connections {
                if self.config.logs(Verbosity::Warning) {
                    warn!(
                        "maximum connections reached ({}), rejecting connection from {}",
                        self.config.max_connections, peer
                    );
                }
                let config = self.config.clone();
                tokio::spawn(reject(stream, config));
                continue;
            }

            active.fetch_add(1, Ordering::SeqCst);
            let config = self.config.clone();
            let handler = handler.clone();
            let active = active.clone();
            let tls = self.tls.clone();

            tokio::spawn(async move {
                match tls {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(stream) => conn::serve(stream, peer, config, handler).await,
                        Err(err) => {
                            // The handshake failed before anything could be
                            // encrypted, so no response is sent back.
                            if config.logs(Verbosity::Warning) {
                                warn!("TLS handshake failed for client {}: {}", peer, err);
                            }
                        }
                    },
                    None => conn::serve(stream, peer, config, handler).await,
                }
                active.fetch_sub(1, Ordering::SeqCst);
            });
        }
    }
}

// Over-limit connections get a plain-text 503 on the raw socket and are
// closed.
async fn reject(mut stream: TcpStream, config: Arc<ServerConfig>) {
    let mut response = Response::new(config);
    response.set_error(StatusCode::ServiceUnavailable, "Too many connections", true);
    response.prepare_to_send();
    let _ = response.write_wire(&mut stream).await;
    let _ = stream.shutdown().await;
}
