//! Error and Result types.
use std::error::Error as StdError;
use std::fmt;
use std::io;

use crate::status::StatusCode;

/// Result type often returned from methods that can have `hearth` errors.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// Represents errors that can occur while running the server.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

#[derive(Debug)]
pub(crate) enum Kind {
    /// Error creating the listener.
    Listen,
    /// A route pattern failed to compile.
    RoutePattern,
}

impl Error {
    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(crate) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(crate) fn new_listen<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Listen).with(cause)
    }

    pub(crate) fn new_route<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::RoutePattern).with(cause)
    }

    /// Returns true if this error came from creating the listener.
    pub fn is_listen(&self) -> bool {
        matches!(self.inner.kind, Kind::Listen)
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::Listen => "error creating server listener",
            Kind::RoutePattern => "invalid route pattern",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("hearth::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref cause) = self.inner.cause {
            write!(f, "{}: {}", self.description(), cause)
        } else {
            f.write_str(self.description())
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

/// A typed error a handler raises to produce a specific HTTP response.
///
/// Raising `HttpError` from a handler (or middleware) renders the standard
/// error path for its status: an error document if one is configured for
/// the status, a JSON `{"message": …}` body if a message is present, or an
/// empty body. Any other handler failure is treated as a 500.
#[derive(Debug, Clone)]
pub struct HttpError {
    status: StatusCode,
    message: Option<String>,
}

impl HttpError {
    /// An error with no message body.
    pub fn new(status: StatusCode) -> HttpError {
        HttpError { status, message: None }
    }

    /// An error with a message rendered into the response body.
    pub fn with_message<S: Into<String>>(status: StatusCode, message: S) -> HttpError {
        HttpError {
            status,
            message: Some(message.into()),
        }
    }

    /// Wraps an arbitrary failure as a 500 Internal Server Error.
    pub fn internal<E: fmt::Display>(err: E) -> HttpError {
        HttpError::with_message(StatusCode::InternalServerError, err.to_string())
    }

    /// The status the response will carry.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// The message rendered into the response body, if any.
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message {
            Some(ref message) => write!(f, "{}: {}", self.status, message),
            None => write!(f, "{}", self.status),
        }
    }
}

impl StdError for HttpError {}

impl From<io::Error> for HttpError {
    fn from(err: io::Error) -> HttpError {
        HttpError::internal(err)
    }
}

impl From<serde_json::Error> for HttpError {
    fn from(err: serde_json::Error) -> HttpError {
        HttpError::with_message(StatusCode::BadRequest, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_error_carries_status_and_message() {
        let err = HttpError::with_message(StatusCode::Unauthorized, "Access denied");
        assert_eq!(err.status(), StatusCode::Unauthorized);
        assert_eq!(err.message(), Some("Access denied"));
    }

    #[test]
    fn generic_failures_map_to_500() {
        let err = HttpError::internal("database is on fire");
        assert_eq!(err.status(), StatusCode::InternalServerError);
    }
}
