//! Path patterns for route rules.
//!
//! `*` matches any run of characters (including none), `?` matches exactly
//! one character, everything else is literal. Matching is case-sensitive
//! and anchored at both ends, so `/ws/*` matches `/ws/` and `/ws/lobby/7`
//! but not `/ws` or `/wsx`.

use regex::Regex;

use crate::error::{ProxyError, ProxyResult};

#[derive(Debug, Clone)]
pub struct PathPattern {
    raw: String,
    regex: Regex,
}

impl PathPattern {
    pub fn new(raw: &str) -> ProxyResult<Self> {
        let invalid = |reason: &str| ProxyError::InvalidPattern {
            pattern: raw.to_string(),
            reason: reason.to_string(),
        };
        if !raw.starts_with('/') {
            return Err(invalid("must start with '/'"));
        }

        let mut expr = String::with_capacity(raw.len() + 8);
        expr.push('^');
        let mut literal = String::new();
        for c in raw.chars() {
            match c {
                '*' | '?' => {
                    expr.push_str(&regex::escape(&literal));
                    literal.clear();
                    expr.push_str(if c == '*' { ".*" } else { "." });
                }
                _ => literal.push(c),
            }
        }
        expr.push_str(&regex::escape(&literal));
        expr.push('$');

        let regex = Regex::new(&expr).map_err(|e| invalid(&e.to_string()))?;
        Ok(Self {
            raw: raw.to_string(),
            regex,
        })
    }

    /// Pattern matching every absolute path.
    pub fn catch_all() -> Self {
        Self {
            raw: "/*".to_string(),
            regex: Regex::new("^/.*$").expect("static catch-all regex"),
        }
    }

    pub fn matches(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl PartialEq for PathPattern {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for PathPattern {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_suffix() {
        let p = PathPattern::new("/ws/*").unwrap();
        assert!(p.matches("/ws/"));
        assert!(p.matches("/ws/lobby/7"));
        assert!(!p.matches("/ws"));
        assert!(!p.matches("/wsx/lobby"));
        assert!(!p.matches("/api/ws/lobby"));
    }

    #[test]
    fn single_char_wildcard() {
        let p = PathPattern::new("/v?/games").unwrap();
        assert!(p.matches("/v1/games"));
        assert!(!p.matches("/v10/games"));
    }

    #[test]
    fn literal_regex_metacharacters_are_escaped() {
        let p = PathPattern::new("/api/v1.0/*").unwrap();
        assert!(p.matches("/api/v1.0/games"));
        assert!(!p.matches("/api/v1x0/games"));
    }

    #[test]
    fn case_sensitive() {
        let p = PathPattern::new("/API/*").unwrap();
        assert!(!p.matches("/api/games"));
    }

    #[test]
    fn catch_all_matches_everything_absolute() {
        let p = PathPattern::catch_all();
        assert!(p.matches("/"));
        assert!(p.matches("/anything/at/all"));
        assert!(!p.matches("relative"));
    }

    #[test]
    fn rejects_relative_pattern() {
        assert!(matches!(
            PathPattern::new("ws/*"),
            Err(ProxyError::InvalidPattern { .. })
        ));
    }
}
