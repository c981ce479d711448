//! The handler contract.
use std::fmt;
use std::future::Future;

use futures_util::future::BoxFuture;

use crate::error::HttpError;
use crate::exchange::Exchange;

/// An asynchronous request handler.
///
/// The connection hands a fully parsed [`Exchange`] to the handler and
/// serializes whatever comes back, in request-arrival order. Returning an
/// [`HttpError`] renders that error's status; any panic is answered with
/// a 500.
///
/// Middleware composes by plain chaining: each step takes the exchange and
/// returns a future of it.
pub trait Handler: Send + Sync + 'static {
    /// Processes one exchange.
    fn handle(&self, exchange: Exchange) -> BoxFuture<'static, Result<Exchange, HttpError>>;
}

/// Wraps an async closure as a [`Handler`].
///
/// ```no_run
/// use hearth::{handler_fn, Exchange, StatusCode};
///
/// let handler = handler_fn(|mut exchange: Exchange| async move {
///     exchange.response.set_status_with(StatusCode::Ok, "hi", "text/plain");
///     Ok(exchange)
/// });
/// ```
pub fn handler_fn<F, R>(f: F) -> HandlerFn<F>
where
    F: Fn(Exchange) -> R + Send + Sync + 'static,
    R: Future<Output = Result<Exchange, HttpError>> + Send + 'static,
{
    HandlerFn { f }
}

/// A [`Handler`] backed by a closure, see [`handler_fn`].
pub struct HandlerFn<F> {
    f: F,
}

impl<F, R> Handler for HandlerFn<F>
where
    F: Fn(Exchange) -> R + Send + Sync + 'static,
    R: Future<Output = Result<Exchange, HttpError>> + Send + 'static,
{
    fn handle(&self, exchange: Exchange) -> BoxFuture<'static, Result<Exchange, HttpError>> {
        Box::pin((self.f)(exchange))
    }
}

impl<F> fmt::Debug for HandlerFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HandlerFn")
    }
}
