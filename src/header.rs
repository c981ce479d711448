//! Case-insensitive header map.
use std::fmt;
use std::str::FromStr;

/// A map of header fields to values.
///
/// Field names compare case-insensitively (RFC 7230 §3.2) while the case
/// first used for a field is preserved for serialization. Entries keep
/// insertion order on the wire. Setting a field that already exists through
/// [`append`](HeaderMap::append) joins the values with `", "` per RFC 7230
/// §3.2.2.
#[derive(Clone, Default)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    /// Creates an empty map.
    pub fn new() -> HeaderMap {
        HeaderMap { entries: Vec::new() }
    }

    /// Returns the value for a field, matching the name case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(field, _)| field.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Returns the value for a field parsed into `T`, or `None` when the
    /// field is absent or fails to parse.
    pub fn get_parsed<T: FromStr>(&self, name: &str) -> Option<T> {
        self.get(name).and_then(|value| value.parse().ok())
    }

    /// Whether a field is present.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Sets a field, replacing any existing value. The position and
    /// spelling of an existing field are kept.
    pub fn set<N, V>(&mut self, name: N, value: V)
    where
        N: Into<String>,
        V: Into<String>,
    {
        let name = name.into();
        let value = value.into();
        match self
            .entries
            .iter_mut()
            .find(|(field, _)| field.eq_ignore_ascii_case(&name))
        {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    /// Adds a field occurrence. A repeated field (under any case) collapses
    /// into one entry with the occurrences joined by `", "` in arrival
    /// order.
    pub fn append(&mut self, name: &str, value: &str) {
        match self
            .entries
            .iter_mut()
            .find(|(field, _)| field.eq_ignore_ascii_case(name))
        {
            Some(entry) => {
                entry.1.push_str(", ");
                entry.1.push_str(value);
            }
            None => self.entries.push((name.to_owned(), value.to_owned())),
        }
    }

    /// Removes a field, returning its value if it was present.
    pub fn remove(&mut self, name: &str) -> Option<String> {
        let index = self
            .entries
            .iter()
            .position(|(field, _)| field.eq_ignore_ascii_case(name))?;
        Some(self.entries.remove(index).1)
    }

    /// The number of distinct fields.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map has no fields.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates fields in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(field, value)| (field.as_str(), value.as_str()))
    }
}

impl fmt::Debug for HeaderMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(k, v)| (k, v)))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::HeaderMap;

    #[test]
    fn lookup_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.set("Content-Type", "text/plain");
        assert_eq!(headers.get("content-type"), Some("text/plain"));
        assert_eq!(headers.get("CONTENT-TYPE"), Some("text/plain"));
        assert_eq!(headers.get("Content-type"), Some("text/plain"));
    }

    #[test]
    fn duplicates_join_with_comma_in_arrival_order() {
        let mut headers = HeaderMap::new();
        headers.append("Accept", "text/html");
        headers.append("accept", "application/json");
        headers.append("ACCEPT", "*/*");
        assert_eq!(headers.get("Accept"), Some("text/html, application/json, */*"));
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn set_replaces_in_place() {
        let mut headers = HeaderMap::new();
        headers.set("Connection", "keep-alive");
        headers.set("Content-Length", "10");
        headers.set("connection", "close");
        let fields: Vec<_> = headers.iter().collect();
        assert_eq!(fields, vec![("Connection", "close"), ("Content-Length", "10")]);
    }

    #[test]
    fn parsed_accessor() {
        let mut headers = HeaderMap::new();
        headers.set("Content-Length", "4096");
        assert_eq!(headers.get_parsed::<usize>("content-length"), Some(4096));
        assert_eq!(headers.get_parsed::<usize>("Host"), None);
        headers.set("Content-Length", "not a number");
        assert_eq!(headers.get_parsed::<usize>("Content-Length"), None);
    }
}
