//! Cookie jar.
//!
//! A deliberately small take on RFC 6265: cookies are name/value pairs
//! scoped to the origin that set them. Attributes on `Set-Cookie` are
//! parsed past but not honored. Cookies set on one origin are never sent
//! to another.

use std::collections::HashMap;

use crate::url::Origin;

/// Origin-scoped cookie storage.
#[derive(Debug, Clone, Default)]
pub struct CookieJar {
    jars: HashMap<Origin, Vec<(String, String)>>,
}

impl CookieJar {
    pub fn new() -> Self {
        CookieJar::default()
    }

    /// Ingest one `Set-Cookie` header value for an origin.
    ///
    /// Only the leading `name=value` pair is kept; malformed values are
    /// ignored. A repeated name replaces the stored value in place.
    pub fn store(&mut self, origin: &Origin, set_cookie: &str) {
        let pair = set_cookie.split(';').next().unwrap_or("");
        let Some((name, value)) = pair.split_once('=') else {
            return;
        };
        let name = name.trim();
        let value = value.trim();
        if name.is_empty() {
            return;
        }
        self.set(origin, name, value);
    }

    /// Set a cookie directly.
    pub fn set(&mut self, origin: &Origin, name: &str, value: &str) {
        let jar = self.jars.entry(origin.clone()).or_default();
        if let Some(entry) = jar.iter_mut().find(|(n, _)| n == name) {
            entry.1 = value.to_string();
        } else {
            jar.push((name.to_string(), value.to_string()));
        }
    }

    /// Look up one cookie for an origin.
    pub fn get(&self, origin: &Origin, name: &str) -> Option<&str> {
        self.jars
            .get(origin)?
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Remove one cookie. Returns whether it existed.
    pub fn remove(&mut self, origin: &Origin, name: &str) -> bool {
        match self.jars.get_mut(origin) {
            Some(jar) => {
                let before = jar.len();
                jar.retain(|(n, _)| n != name);
                jar.len() != before
            }
            None => false,
        }
    }

    /// Render the `Cookie` header for an origin, `name=value; ...` in
    /// insertion order. `None` when no cookies are scoped to it.
    pub fn cookie_header(&self, origin: &Origin) -> Option<String> {
        let jar = self.jars.get(origin)?;
        if jar.is_empty() {
            return None;
        }
        Some(
            jar.iter()
                .map(|(n, v)| format!("{}={}", n, v))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    /// Number of cookies stored for an origin.
    pub fn len(&self, origin: &Origin) -> usize {
        self.jars.get(origin).map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.jars.values().all(Vec::is_empty)
    }

    pub fn clear(&mut self) {
        self.jars.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::url::{Scheme, Url};

    fn origin(s: &str) -> Origin {
        Url::parse(s).unwrap().origin()
    }

    #[test]
    fn test_store_and_render() {
        let mut jar = CookieJar::new();
        let o = origin("http://a.example/");

        jar.store(&o, "session=abc123");
        jar.store(&o, "theme=dark; Path=/; HttpOnly");

        assert_eq!(jar.get(&o, "session"), Some("abc123"));
        assert_eq!(jar.get(&o, "theme"), Some("dark"));
        assert_eq!(
            jar.cookie_header(&o),
            Some("session=abc123; theme=dark".to_string())
        );
    }

    #[test]
    fn test_replace_keeps_position() {
        let mut jar = CookieJar::new();
        let o = origin("http://a.example/");

        jar.store(&o, "a=1");
        jar.store(&o, "b=2");
        jar.store(&o, "a=9");

        assert_eq!(jar.cookie_header(&o), Some("a=9; b=2".to_string()));
    }

    #[test]
    fn test_origin_scoping() {
        let mut jar = CookieJar::new();
        let a = origin("http://a.example/");
        let b = origin("http://b.example/");

        jar.store(&a, "secret=yes");

        assert_eq!(jar.get(&a, "secret"), Some("yes"));
        assert_eq!(jar.get(&b, "secret"), None);
        assert_eq!(jar.cookie_header(&b), None);
    }

    #[test]
    fn test_port_is_part_of_scope() {
        let mut jar = CookieJar::new();
        let a = origin("http://a.example:8080/");
        let b = origin("http://a.example:9090/");

        jar.store(&a, "x=1");
        assert_eq!(jar.cookie_header(&b), None);
    }

    #[test]
    fn test_malformed_ignored() {
        let mut jar = CookieJar::new();
        let o = origin("http://a.example/");

        jar.store(&o, "novalue");
        jar.store(&o, "=bare");
        jar.store(&o, "");

        assert!(jar.is_empty());
    }

    #[test]
    fn test_value_with_equals() {
        let mut jar = CookieJar::new();
        let o = origin("http://a.example/");

        jar.store(&o, "token=a=b=c");
        assert_eq!(jar.get(&o, "token"), Some("a=b=c"));
    }

    #[test]
    fn test_remove() {
        let mut jar = CookieJar::new();
        let o = origin("http://a.example/");

        jar.store(&o, "a=1");
        assert!(jar.remove(&o, "a"));
        assert!(!jar.remove(&o, "a"));
        assert_eq!(jar.cookie_header(&o), None);
    }
}
