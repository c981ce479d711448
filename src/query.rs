//! Decoded query strings.

/// An ordered multi-map of decoded query items.
///
/// Items keep their arrival order and duplicate names are preserved;
/// [`get`](Query::get) returns the first occurrence.
#[derive(Clone, Debug, Default)]
pub struct Query {
    items: Vec<(String, String)>,
}

impl Query {
    /// Parses a raw query string (the part after `?`, without the `?`).
    pub fn parse(input: &str) -> Query {
        let items = form_urlencoded::parse(input.as_bytes())
            .map(|(name, value)| (name.into_owned(), value.into_owned()))
            .collect();
        Query { items }
    }

    /// The first value for `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.items
            .iter()
            .find(|(item, _)| item == name)
            .map(|(_, value)| value.as_str())
    }

    /// All values for `name`, in arrival order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.items
            .iter()
            .filter(move |(item, _)| item == name)
            .map(|(_, value)| value.as_str())
    }

    /// Whether `name` appears at least once.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Iterates all items in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.items
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    /// The number of items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the query is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::Query;

    #[test]
    fn parses_and_decodes_items() {
        let query = Query::parse("name=John%20Doe&lang=en");
        assert_eq!(query.get("name"), Some("John Doe"));
        assert_eq!(query.get("lang"), Some("en"));
        assert_eq!(query.get("missing"), None);
    }

    #[test]
    fn preserves_order_and_duplicates() {
        let query = Query::parse("tag=a&tag=b&x=1&tag=c");
        let tags: Vec<_> = query.get_all("tag").collect();
        assert_eq!(tags, vec!["a", "b", "c"]);
        assert_eq!(query.get("tag"), Some("a"));
        assert_eq!(query.len(), 4);
    }

    #[test]
    fn plus_decodes_to_space() {
        let query = Query::parse("q=rust+http");
        assert_eq!(query.get("q"), Some("rust http"));
    }

    #[test]
    fn value_less_items_are_empty() {
        let query = Query::parse("flag&x=1");
        assert_eq!(query.get("flag"), Some(""));
        assert!(query.contains("flag"));
    }
}
