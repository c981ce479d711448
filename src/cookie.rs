//! Response cookies.
use std::time::SystemTime;

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

// Everything outside the URI "unreserved" set is percent-encoded in cookie
// values and paths.
const COOKIE_ENCODE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// A cookie to be set on a response.
///
/// Serialized as one `Set-Cookie:` line with the attributes below; the
/// value and path are percent-encoded.
#[derive(Clone, Debug)]
pub struct Cookie {
    /// Cookie name. Names are case-sensitive and unique per response.
    pub name: String,
    /// Cookie value.
    pub value: String,
    /// `Max-Age` in seconds, emitted when set.
    pub max_age: Option<u64>,
    /// `Expires`, emitted as an IMF-fixdate when set.
    pub expires: Option<SystemTime>,
    /// `Domain` attribute, emitted when non-empty.
    pub domain: String,
    /// `Path` attribute, emitted when non-empty.
    pub path: String,
    /// Adds `Secure`.
    pub secure: bool,
    /// Adds `HttpOnly`.
    pub http_only: bool,
}

impl Cookie {
    /// A session cookie for `/` with no extra attributes.
    pub fn new<N, V>(name: N, value: V) -> Cookie
    where
        N: Into<String>,
        V: Into<String>,
    {
        Cookie {
            name: name.into(),
            value: value.into(),
            max_age: None,
            expires: None,
            domain: String::new(),
            path: "/".to_owned(),
            secure: false,
            http_only: false,
        }
    }

    /// The `Set-Cookie` value for this cookie.
    pub(crate) fn serialize(&self) -> String {
        let mut out = String::with_capacity(self.name.len() + self.value.len() + 32);
        out.push_str(&self.name);
        out.push('=');
        out.extend(utf8_percent_encode(&self.value, COOKIE_ENCODE));

        if let Some(expires) = self.expires {
            out.push_str("; Expires=");
            out.push_str(&httpdate::fmt_http_date(expires));
        }

        if let Some(max_age) = self.max_age {
            out.push_str("; Max-Age=");
            let mut buf = itoa::Buffer::new();
            out.push_str(buf.format(max_age));
        }

        if !self.domain.is_empty() {
            out.push_str("; Domain=");
            out.push_str(&self.domain);
        }

        if !self.path.is_empty() {
            out.push_str("; Path=");
            out.extend(utf8_percent_encode(&self.path, COOKIE_ENCODE));
        }

        if self.secure {
            out.push_str("; Secure");
        }

        if self.http_only {
            out.push_str("; HttpOnly");
        }

        out
    }
}
