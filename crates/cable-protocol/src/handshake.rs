//! Upgrade request metadata.
//!
//! The handshake is what identity resolution sees of the HTTP upgrade:
//! path, query parameters, headers and the peer address.

use std::collections::BTreeMap;
use url::form_urlencoded;

/// Metadata captured from a WebSocket upgrade request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Handshake {
    path: String,
    query: Vec<(String, String)>,
    headers: BTreeMap<String, String>,
    remote_addr: Option<String>,
}

impl Handshake {
    /// Create a handshake from a request target such as `/cable?token=abc`.
    #[must_use]
    pub fn new(target: &str) -> Self {
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, query),
            None => (target, ""),
        };

        Self {
            path: path.to_string(),
            query: form_urlencoded::parse(query.as_bytes())
                .into_owned()
                .collect(),
            headers: BTreeMap::new(),
            remote_addr: None,
        }
    }

    /// Add a header. Names are stored lower-cased.
    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Set the peer address.
    #[must_use]
    pub fn with_remote_addr(mut self, addr: impl Into<String>) -> Self {
        self.remote_addr = Some(addr.into());
        self
    }

    /// Get the request path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Get the first value of a query parameter.
    #[must_use]
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Get a header by case-insensitive name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Iterate over all headers.
    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Get the `Origin` header.
    #[must_use]
    pub fn origin(&self) -> Option<&str> {
        self.header("origin")
    }

    /// Get a cookie value from the `Cookie` header.
    #[must_use]
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.header("cookie")?
            .split(';')
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value)
    }

    /// Get the peer address, if known.
    #[must_use]
    pub fn remote_addr(&self) -> Option<&str> {
        self.remote_addr.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_query() {
        let handshake = Handshake::new("/cable?user=ada%20l&room=1&room=2");
        assert_eq!(handshake.path(), "/cable");
        assert_eq!(handshake.query_param("user"), Some("ada l"));
        assert_eq!(handshake.query_param("room"), Some("1"));
        assert_eq!(handshake.query_param("missing"), None);

        let bare = Handshake::new("/cable");
        assert_eq!(bare.path(), "/cable");
        assert_eq!(bare.query_param("user"), None);
    }

    #[test]
    fn test_handshake_headers() {
        let handshake = Handshake::new("/")
            .with_header("Origin", "https://example.com")
            .with_header("Cookie", "session=abc; theme=dark")
            .with_remote_addr("127.0.0.1:5000");

        assert_eq!(handshake.origin(), Some("https://example.com"));
        assert_eq!(handshake.header("ORIGIN"), Some("https://example.com"));
        assert_eq!(handshake.cookie("theme"), Some("dark"));
        assert_eq!(handshake.cookie("session"), Some("abc"));
        assert_eq!(handshake.cookie("nope"), None);
        assert_eq!(handshake.remote_addr(), Some("127.0.0.1:5000"));
        assert_eq!(handshake.headers().count(), 2);
    }
}
