//! Per-connection protocol engine.
//!
//! Each accepted socket gets one engine: a reader that drives the request
//! parser and dispatches handlers, and a writer that drains the pending
//! response queue strictly in request-arrival order (HTTP pipelining
//! requires in-order responses no matter which handler finishes first).
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use futures_util::FutureExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{oneshot, Notify};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::config::{ServerConfig, Verbosity};
use crate::error::HttpError;
use crate::exchange::Exchange;
use crate::request::{Advance, ParseState, Request};
use crate::response::Response;
use crate::service::Handler;
use crate::status::StatusCode;

const INIT_BUFFER_SIZE: usize = 8192;

// State shared between the reader and writer halves of one connection.
struct Shared {
    // Responses enqueued but not yet fully written.
    pending: AtomicUsize,
    // The writer has decided the connection is done.
    closing: AtomicBool,
    // Pinged on queue drain and on close.
    notify: Notify,
}

// What a handler task reports back to the writer.
struct Completed {
    // Present on success; released once the response is written. Absent
    // when the handler failed or timed out and the request died with it.
    request: Option<Request>,
    response: Response,
}

enum Pending {
    // The response was ready at parse time (parse errors skip the
    // handler).
    Ready {
        request: Option<Request>,
        response: Response,
        finished: Arc<AtomicBool>,
    },
    // A handler task owns the exchange and reports back when done.
    Handler {
        rx: oneshot::Receiver<Completed>,
        finished: Arc<AtomicBool>,
    },
}

impl Pending {
    fn poison(self) {
        match self {
            Pending::Ready { finished, .. } | Pending::Handler { finished, .. } => {
                finished.store(true, Ordering::SeqCst);
            }
        }
    }
}

/// Serves one connection until it disconnects.
pub(crate) async fn serve<T, H>(io: T, peer: SocketAddr, config: Arc<ServerConfig>, handler: Arc<H>)
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    H: Handler,
{
    if config.logs(Verbosity::Debug) {
        debug!("new incoming connection from {}", peer);
    }

    let (read_half, write_half) = tokio::io::split(io);
    let shared = Arc::new(Shared {
        pending: AtomicUsize::new(0),
        closing: AtomicBool::new(false),
        notify: Notify::new(),
    });
    let (tx, rx) = mpsc::unbounded_channel();

    let writer = tokio::spawn(write_loop(write_half, rx, config.clone(), shared.clone(), peer));
    read_loop(read_half, tx, config.clone(), handler, shared, peer).await;
    let _ = writer.await;

    if config.logs(Verbosity::Debug) {
        debug!("client {} disconnected", peer);
    }
}

async fn read_loop<T, H>(
    mut socket: ReadHalf<T>,
    tx: UnboundedSender<Pending>,
    config: Arc<ServerConfig>,
    handler: Arc<H>,
    shared: Arc<Shared>,
    peer: SocketAddr,
) where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    H: Handler,
{
    let mut buf = BytesMut::with_capacity(INIT_BUFFER_SIZE);
    let mut keep_alive_mode = false;

    'requests: loop {
        // Between requests, wait for the next one to begin. The keep-alive
        // clock runs only while the response queue is empty.
        if keep_alive_mode && buf.is_empty() {
            match idle_wait(&mut socket, &mut buf, &config, &shared).await {
                IdleOutcome::Data => {}
                IdleOutcome::Expired => {
                    // Keep-alive expiry with no request underway: close
                    // silently.
                    break 'requests;
                }
                IdleOutcome::Disconnected => break 'requests,
            }
        }

        let finished = Arc::new(AtomicBool::new(false));
        let mut request = Request::new(config.clone(), peer);
        let mut response = Response::new(config.clone());

        let mut deadline = Instant::now() + config.request_timeout;
        loop {
            if let Advance::Done = request.parse(&mut buf, &mut response) {
                break;
            }

            // Body phases get fresh time on each chunk so large uploads
            // are not cut off by the request timer.
            if matches!(
                request.state(),
                ParseState::ReadBody | ParseState::ReadMultipartData | ParseState::ReadMultipartHeaders
            ) {
                deadline = Instant::now() + config.request_timeout;
            }

            buf.reserve(INIT_BUFFER_SIZE);
            let n = if config.request_timeout.is_zero() {
                match read_some(&mut socket, &mut buf, &shared).await {
                    Ok(n) => n,
                    Err(_) => break 'requests,
                }
            } else {
                match timeout_at(deadline, read_some(&mut socket, &mut buf, &shared)).await {
                    Ok(Ok(n)) => n,
                    Ok(Err(_)) => break 'requests,
                    Err(_) => {
                        // The request timer fired mid-request: answer 408
                        // and close.
                        request_timed_out(&tx, &config, &shared, finished, peer);
                        break 'requests;
                    }
                }
            };
            if n == 0 {
                // Disconnected before the request completed.
                break 'requests;
            }
        }

        let aborted = request.state() == ParseState::Abort;
        if aborted {
            // Framing is unrecoverable after a fatal parse error; discard
            // whatever else was already sent.
            buf.clear();
            drain_readable(&mut socket).await;
        }

        if response.is_valid() {
            // The parser produced an error response: skip the handler and
            // queue it in arrival order.
            response.setup_from_request(request.headers().get("Connection"));
            shared.pending.fetch_add(1, Ordering::SeqCst);
            if tx
                .send(Pending::Ready {
                    request: Some(request),
                    response,
                    finished,
                })
                .is_err()
            {
                break 'requests;
            }
        } else {
            if config.logs(Verbosity::Info) {
                info!(
                    "received {} request to {} from {}",
                    request.method(),
                    request.path(),
                    peer
                );
            }
            let exchange = Exchange::new(request, response, finished.clone());
            let rx = dispatch(handler.clone(), config.clone(), exchange, peer);
            shared.pending.fetch_add(1, Ordering::SeqCst);
            if tx.send(Pending::Handler { rx, finished }).is_err() {
                break 'requests;
            }
        }

        if aborted {
            break 'requests;
        }
        keep_alive_mode = true;
    }
}

enum IdleOutcome {
    Data,
    Expired,
    Disconnected,
}

// Waits for the first bytes of the next request while honoring the
// keep-alive clock, which starts once the response queue drains.
async fn idle_wait<T>(
    socket: &mut ReadHalf<T>,
    buf: &mut BytesMut,
    config: &ServerConfig,
    shared: &Shared,
) -> IdleOutcome
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    loop {
        if shared.closing.load(Ordering::SeqCst) {
            return IdleOutcome::Disconnected;
        }
        buf.reserve(INIT_BUFFER_SIZE);

        if shared.pending.load(Ordering::SeqCst) > 0 || config.keep_alive_timeout.is_zero() {
            tokio::select! {
                _ = shared.notify.notified() => continue,
                result = socket.read_buf(buf) => match result {
                    Ok(0) | Err(_) => return IdleOutcome::Disconnected,
                    Ok(_) => return IdleOutcome::Data,
                },
            }
        } else {
            tokio::select! {
                _ = shared.notify.notified() => continue,
                result = timeout(config.keep_alive_timeout, socket.read_buf(buf)) => match result {
                    Ok(Ok(0)) | Ok(Err(_)) => return IdleOutcome::Disconnected,
                    Ok(Ok(_)) => return IdleOutcome::Data,
                    Err(_) => return IdleOutcome::Expired,
                },
            }
        }
    }
}

// Reads into the buffer, waking early when the writer closes the
// connection.
async fn read_some<T>(
    socket: &mut ReadHalf<T>,
    buf: &mut BytesMut,
    shared: &Shared,
) -> io::Result<usize>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    loop {
        if shared.closing.load(Ordering::SeqCst) {
            return Ok(0);
        }
        tokio::select! {
            _ = shared.notify.notified() => continue,
            result = socket.read_buf(buf) => return result,
        }
    }
}

// Best-effort drain of bytes that already arrived, without waiting for
// more.
async fn drain_readable<T>(socket: &mut ReadHalf<T>)
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut scratch = [0u8; 4096];
    loop {
        match socket.read(&mut scratch).now_or_never() {
            Some(Ok(n)) if n > 0 => continue,
            _ => break,
        }
    }
}

fn request_timed_out(
    tx: &UnboundedSender<Pending>,
    config: &Arc<ServerConfig>,
    shared: &Shared,
    finished: Arc<AtomicBool>,
    peer: SocketAddr,
) {
    if config.logs(Verbosity::Info) {
        info!("request from {} timed out", peer);
    }
    let mut response = Response::new(config.clone());
    response.set_error(StatusCode::RequestTimeout, "", true);
    shared.pending.fetch_add(1, Ordering::SeqCst);
    let _ = tx.send(Pending::Ready {
        request: None,
        response,
        finished,
    });
}

// Runs the handler as its own task so the reader can keep parsing
// pipelined requests, and so a handler timeout abandons only this
// exchange.
fn dispatch<H: Handler>(
    handler: Arc<H>,
    config: Arc<ServerConfig>,
    exchange: Exchange,
    peer: SocketAddr,
) -> oneshot::Receiver<Completed> {
    let (done_tx, done_rx) = oneshot::channel();
    let connection = exchange
        .request
        .headers()
        .get("Connection")
        .map(str::to_owned);
    let finished = exchange.finished_flag();

    tokio::spawn(async move {
        let work = handler.handle(exchange);
        let outcome = if config.response_timeout.is_zero() {
            work.await
        } else {
            match timeout(config.response_timeout, work).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    // The handler future is dropped; poison the exchange
                    // first so cooperative side effects become no-ops.
                    finished.store(true, Ordering::SeqCst);
                    if config.logs(Verbosity::Warning) {
                        warn!("handler for client {} timed out", peer);
                    }
                    Err(HttpError::new(StatusCode::RequestTimeout))
                }
            }
        };

        let mut completed = match outcome {
            Ok(exchange) => {
                let (request, response, _state) = exchange.into_parts();
                Completed {
                    request: Some(request),
                    response,
                }
            }
            Err(err) => {
                if config.logs(Verbosity::Warning) && err.status().is_server_error() {
                    warn!("handler for client {} failed: {}", peer, err);
                }
                let mut response = Response::new(config.clone());
                response.set_error(err.status(), err.message().unwrap_or(""), false);
                Completed {
                    request: None,
                    response,
                }
            }
        };

        let request_connection = completed
            .request
            .as_ref()
            .and_then(|request| request.headers().get("Connection"))
            .map(str::to_owned)
            .or(connection);
        completed
            .response
            .setup_from_request(request_connection.as_deref());

        let _ = done_tx.send(completed);
    });

    done_rx
}

async fn write_loop<T>(
    mut socket: WriteHalf<T>,
    mut rx: UnboundedReceiver<Pending>,
    config: Arc<ServerConfig>,
    shared: Arc<Shared>,
    peer: SocketAddr,
) where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut close_connection = false;

    while let Some(entry) = rx.recv().await {
        let (request, mut response) = match entry {
            Pending::Ready {
                request, response, ..
            } => (request, response),
            Pending::Handler { rx: done, .. } => match done.await {
                Ok(completed) => (completed.request, completed.response),
                Err(_) => {
                    // The handler task died without reporting back.
                    if config.logs(Verbosity::Warning) {
                        warn!("handler for client {} failed while processing request", peer);
                    }
                    let mut response = Response::new(config.clone());
                    response.set_error(
                        StatusCode::InternalServerError,
                        "An error occurred while processing request",
                        false,
                    );
                    response.setup_from_request(None);
                    (None, response)
                }
            },
        };

        if !response.is_valid() {
            if config.logs(Verbosity::Warning) {
                warn!("handler did not set a status for client {}, sending 500", peer);
            }
            response.set_status(StatusCode::InternalServerError);
        }

        response.prepare_to_send();
        debug_assert!(response.is_sending());
        let sent = response.write_wire(&mut socket).await && socket.flush().await.is_ok();

        // Any completed response asking for close latches the decision;
        // the connection still drains the rest of the queue first.
        close_connection |= !response.keeps_alive();

        // The paired request (and its temporary upload files) is released
        // only now that its response is on the wire.
        drop(request);
        drop(response);

        let remaining = shared.pending.fetch_sub(1, Ordering::SeqCst) - 1;

        if !sent {
            // Write error: force-close.
            break;
        }
        if remaining == 0 {
            if close_connection {
                break;
            }
            // Queue drained: tell the reader to arm the keep-alive clock.
            shared.notify.notify_one();
        }
    }

    // Stop the reader and poison anything still queued so late handler
    // completions become no-ops.
    shared.closing.store(true, Ordering::SeqCst);
    shared.notify.notify_one();
    rx.close();
    while let Ok(entry) = rx.try_recv() {
        entry.poison();
    }

    let _ = socket.shutdown().await;
}
