//! Path patterns: ordered segments of literals, `{name}` parameters and a
//! trailing `*` wildcard.

use crate::protocol::{path_segments, ParseError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Parameter(String),
    Wildcard,
}

/// A parsed route pattern.
///
/// A trailing `/` in the source pattern demands an exact-length match;
/// otherwise extra request segments are allowed only when the last pattern
/// element is the wildcard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    segments: Vec<Segment>,
    exact: bool,
}

/// Pattern syntax errors surface at registration time.
#[derive(Debug, thiserror::Error)]
pub enum PatternError {
    #[error("wildcard must be the last pattern segment: {pattern}")]
    WildcardNotLast { pattern: String },
    #[error("empty parameter name in pattern: {pattern}")]
    EmptyParameter { pattern: String },
    #[error("invalid percent-encoding in pattern: {source}")]
    Encoding {
        #[from]
        source: ParseError,
    },
}

impl PathPattern {
    pub fn parse(pattern: &str) -> Result<PathPattern, PatternError> {
        let exact = pattern.ends_with('/') && pattern != "/";
        let raw = path_segments(pattern)?;

        let mut segments = Vec::with_capacity(raw.len());
        for (position, segment) in raw.iter().enumerate() {
            let parsed = if segment == "*" {
                if position + 1 != raw.len() {
                    return Err(PatternError::WildcardNotLast { pattern: pattern.to_string() });
                }
                Segment::Wildcard
            } else if let Some(name) = segment.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                if name.is_empty() {
                    return Err(PatternError::EmptyParameter { pattern: pattern.to_string() });
                }
                Segment::Parameter(name.to_string())
            } else {
                Segment::Literal(segment.clone())
            };
            segments.push(parsed);
        }

        Ok(PathPattern { segments, exact })
    }

    pub fn has_wildcard(&self) -> bool {
        matches!(self.segments.last(), Some(Segment::Wildcard))
    }

    /// Matches decoded request segments positionally, binding parameters in
    /// pattern order. Returns `None` on any mismatch.
    pub fn matches(&self, request: &[String], case_insensitive: bool) -> Option<Vec<(String, String)>> {
        let mut params = Vec::new();

        for (position, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Wildcard => {
                    // consumes everything that remains, including nothing
                    return Some(params);
                }
                Segment::Literal(literal) => {
                    let value = request.get(position)?;
                    let equal = if case_insensitive {
                        literal.eq_ignore_ascii_case(value)
                    } else {
                        literal == value
                    };
                    if !equal {
                        return None;
                    }
                }
                Segment::Parameter(name) => {
                    let value = request.get(position)?;
                    params.push((name.clone(), value.clone()));
                }
            }
        }

        if request.len() > self.segments.len() && self.exact {
            return None;
        }
        if request.len() > self.segments.len() {
            // extra segments need the wildcard, which would have returned
            return None;
        }
        Some(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segs(path: &str) -> Vec<String> {
        path_segments(path).unwrap()
    }

    #[test]
    fn literal_match() {
        let pattern = PathPattern::parse("/a/b").unwrap();
        assert!(pattern.matches(&segs("/a/b"), false).is_some());
        assert!(pattern.matches(&segs("/a/c"), false).is_none());
        assert!(pattern.matches(&segs("/a"), false).is_none());
        assert!(pattern.matches(&segs("/a/b/c"), false).is_none());
    }

    #[test]
    fn parameters_bind_in_order() {
        let pattern = PathPattern::parse("/users/{user}/posts/{post}").unwrap();
        let params = pattern.matches(&segs("/users/7/posts/42"), false).unwrap();
        assert_eq!(params, vec![("user".into(), "7".into()), ("post".into(), "42".into())]);
    }

    #[test]
    fn wildcard_consumes_the_rest() {
        let pattern = PathPattern::parse("/static/*").unwrap();
        assert!(pattern.matches(&segs("/static/css/site.css"), false).is_some());
        assert!(pattern.matches(&segs("/static"), false).is_some());
        assert!(pattern.matches(&segs("/other"), false).is_none());
    }

    #[test]
    fn wildcard_must_be_last() {
        assert!(matches!(PathPattern::parse("/a/*/b"), Err(PatternError::WildcardNotLast { .. })));
    }

    #[test]
    fn case_insensitive_literals() {
        let pattern = PathPattern::parse("/API/Users").unwrap();
        assert!(pattern.matches(&segs("/api/users"), true).is_some());
        assert!(pattern.matches(&segs("/api/users"), false).is_none());
    }

    #[test]
    fn percent_escapes_decode_before_matching() {
        let pattern = PathPattern::parse("/a b").unwrap();
        assert!(pattern.matches(&segs("/a%20b"), false).is_some());
    }
}
