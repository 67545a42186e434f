//! Parsing for the `kwds` path segment: `key1=val1;key2=val2;...`.

use std::collections::HashMap;

/// A parsed `kwds` segment. Malformed pairs (no `=`, or more than one) are
/// dropped rather than rejected (spec.md §4.4).
#[derive(Debug, Clone, Default)]
pub struct Kwds(HashMap<String, String>);

impl Kwds {
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let mut map = HashMap::new();
        for pair in raw.split(';') {
            let mut parts = pair.splitn(2, '=');
            let (Some(key), Some(val)) = (parts.next(), parts.next()) else {
                continue;
            };
            if key.is_empty() {
                continue;
            }
            map.insert(key.to_string(), val.to_string());
        }
        Self(map)
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Iterates every parsed `key=value` pair, for handlers (like
    /// `cache_files`) that need the whole set rather than a single lookup.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_keystamp_pair() {
        let kwds = Kwds::parse("keystamp=10666-71cf950fcd");
        assert_eq!(kwds.get("keystamp"), Some("10666-71cf950fcd"));
    }

    #[test]
    fn ignores_malformed_pairs() {
        let kwds = Kwds::parse("a=1;noequals;=noKey;b=2");
        assert_eq!(kwds.get("a"), Some("1"));
        assert_eq!(kwds.get("b"), Some("2"));
        assert_eq!(kwds.get("noequals"), None);
    }

    #[test]
    fn dash_only_segment_parses_to_empty() {
        let kwds = Kwds::parse("-");
        assert!(kwds.get("-").is_none());
    }
}
