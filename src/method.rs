//! The HTTP request method.
use std::fmt;

/// The request method.
///
/// The server accepts the six methods below; anything else parses into
/// `Extension` and is answered with `405 Method Not Allowed`, with the
/// `Allow` header listing the accepted set.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Method {
    /// OPTIONS
    Options,
    /// GET
    Get,
    /// POST
    Post,
    /// PUT
    Put,
    /// DELETE
    Delete,
    /// HEAD
    Head,
    /// A method outside the accepted set, e.g. `PATCH` or `TRACE`.
    Extension(String),
}

impl Method {
    /// The methods this server accepts, in the order advertised by the
    /// `Allow` header.
    pub const ALLOWED: [Method; 6] = [
        Method::Get,
        Method::Head,
        Method::Post,
        Method::Put,
        Method::Delete,
        Method::Options,
    ];

    /// Whether this method is in the accepted set.
    pub fn is_allowed(&self) -> bool {
        !matches!(*self, Method::Extension(_))
    }

    /// The comma-joined accepted set, as sent in `Allow`.
    pub(crate) fn allow_header() -> &'static str {
        "GET, HEAD, POST, PUT, DELETE, OPTIONS"
    }

    /// The method token as it appears on the wire.
    pub fn as_str(&self) -> &str {
        match *self {
            Method::Options => "OPTIONS",
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
            Method::Extension(ref s) => s,
        }
    }
}

impl From<&str> for Method {
    fn from(s: &str) -> Method {
        match s {
            "OPTIONS" => Method::Options,
            "GET" => Method::Get,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "DELETE" => Method::Delete,
            "HEAD" => Method::Head,
            _ => Method::Extension(s.to_owned()),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::Method;

    #[test]
    fn parses_known_methods() {
        assert_eq!(Method::from("GET"), Method::Get);
        assert_eq!(Method::from("DELETE"), Method::Delete);
        assert_eq!(Method::from("PATCH"), Method::Extension("PATCH".to_owned()));
    }

    #[test]
    fn extension_methods_are_not_allowed() {
        assert!(Method::Get.is_allowed());
        assert!(Method::Options.is_allowed());
        assert!(!Method::from("TRACE").is_allowed());
    }

    #[test]
    fn allow_header_lists_the_accepted_set() {
        assert_eq!(Method::allow_header(), "GET, HEAD, POST, PUT, DELETE, OPTIONS");
    }
}
