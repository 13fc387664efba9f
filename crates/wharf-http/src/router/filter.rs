//! Header predicates for routes.
//!
//! A value pattern is either a literal, `*` on its own, or a literal with a
//! single `*` at one end: `application/*` matches by prefix, `*.example`
//! by suffix.

use http::{HeaderMap, HeaderName};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValuePattern {
    Literal(String),
    Prefix(String),
    Suffix(String),
    Any,
}

impl ValuePattern {
    /// Parses the `*` positions; a `*` anywhere but the ends is literal.
    pub fn parse(pattern: &str) -> ValuePattern {
        if pattern == "*" {
            ValuePattern::Any
        } else if let Some(prefix) = pattern.strip_suffix('*') {
            ValuePattern::Prefix(prefix.to_string())
        } else if let Some(suffix) = pattern.strip_prefix('*') {
            ValuePattern::Suffix(suffix.to_string())
        } else {
            ValuePattern::Literal(pattern.to_string())
        }
    }

    pub fn matches(&self, value: &str) -> bool {
        match self {
            ValuePattern::Literal(literal) => value == literal,
            ValuePattern::Prefix(prefix) => value.starts_with(prefix.as_str()),
            ValuePattern::Suffix(suffix) => value.ends_with(suffix.as_str()),
            ValuePattern::Any => true,
        }
    }
}

/// A named header that must be present and match its value pattern.
#[derive(Debug, Clone)]
pub struct HeaderPredicate {
    name: HeaderName,
    pattern: ValuePattern,
}

impl HeaderPredicate {
    pub fn new(name: HeaderName, pattern: ValuePattern) -> Self {
        Self { name, pattern }
    }

    pub fn check(&self, headers: &HeaderMap) -> bool {
        headers
            .get(&self.name)
            .and_then(|value| value.to_str().ok())
            .map(|value| self.pattern.matches(value))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::CONTENT_TYPE;

    #[test]
    fn pattern_forms() {
        assert!(ValuePattern::parse("text/html").matches("text/html"));
        assert!(!ValuePattern::parse("text/html").matches("text/plain"));
        assert!(ValuePattern::parse("application/*").matches("application/json"));
        assert!(!ValuePattern::parse("application/*").matches("text/html"));
        assert!(ValuePattern::parse("*/json").matches("application/json"));
        assert!(ValuePattern::parse("*").matches("anything"));
    }

    #[test]
    fn predicate_requires_presence() {
        let predicate = HeaderPredicate::new(CONTENT_TYPE, ValuePattern::parse("application/*"));

        let mut headers = HeaderMap::new();
        assert!(!predicate.check(&headers), "absent header never matches");

        headers.insert(CONTENT_TYPE, "application/json".parse().unwrap());
        assert!(predicate.check(&headers));

        headers.insert(CONTENT_TYPE, "text/html".parse().unwrap());
        assert!(!predicate.check(&headers));
    }
}
