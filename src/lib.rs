//! # hearth
//!
//! An embeddable HTTP/1.1 server library: the application provides a
//! [`Handler`] and a [`ServerConfig`], and the library accepts TCP
//! (optionally TLS) connections, parses requests, dispatches them to the
//! handler and writes the responses back.
//!
//! The core is the per-connection protocol engine: a state-machine-driven
//! HTTP/1.1 parser, an asynchronous pipeline that preserves pipelined
//! response ordering, a timeout regime covering the request, handler and
//! keep-alive phases of a connection's life, and streaming
//! `multipart/form-data` intake that spools uploads to temporary files.
//!
//! ```no_run
//! use hearth::{handler_fn, Exchange, Server, ServerConfig, StatusCode};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> hearth::Result<()> {
//!     let config = ServerConfig {
//!         port: 8080,
//!         ..ServerConfig::default()
//!     };
//!     let server = Server::bind(config)?;
//!     server
//!         .serve(handler_fn(|mut exchange: Exchange| async move {
//!             exchange
//!                 .response
//!                 .set_status_with(StatusCode::Ok, "hello!", "text/plain");
//!             Ok(exchange)
//!         }))
//!         .await
//! }
//! ```
//!
//! Routing is optional; a [`Router`] dispatches on method and path regex
//! and publishes captures to the exchange's scratch [`State`].

mod config;
mod conn;
mod cookie;
mod error;
mod exchange;
mod header;
mod method;
mod multipart;
mod query;
mod request;
mod response;
mod router;
mod server;
mod service;
mod status;
mod tls;

pub use crate::config::{ServerConfig, Verbosity};
pub use crate::cookie::Cookie;
pub use crate::error::{Error, HttpError, Result};
pub use crate::exchange::{Exchange, State};
pub use crate::header::HeaderMap;
pub use crate::method::Method;
pub use crate::multipart::FormFile;
pub use crate::query::Query;
pub use crate::request::{ParseState, Request};
pub use crate::response::{Response, SendFileOptions};
pub use crate::router::{Routed, Router};
pub use crate::server::Server;
pub use crate::service::{handler_fn, Handler, HandlerFn};
pub use crate::status::StatusCode;
