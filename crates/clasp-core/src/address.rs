//! Address parsing and pattern matching
//!
//! CLASP addresses are slash-separated paths:
//! ```text
//! /lights/room1/brightness
//! /lumen/scene/0/layer/3/opacity
//! ```
//!
//! Patterns add two wildcards for subscriptions:
//! - `*` matches exactly one segment
//! - `**` matches zero or more segments, trailing position only

use crate::error::{Error, Result};

/// A validated CLASP address.
///
/// Case-sensitive, single leading slash, no trailing slash, no empty
/// segments. Segments may contain any UTF-8 except `/`, `*`, and control
/// characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    raw: String,
}

impl Address {
    pub fn parse(s: &str) -> Result<Self> {
        validate_path(s, false)?;
        Ok(Self { raw: s.to_string() })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.raw[1..].split('/')
    }

    /// First segment, conventionally the namespace
    pub fn namespace(&self) -> &str {
        self.segments().next().unwrap_or("")
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.raw)
    }
}

impl TryFrom<&str> for Address {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        Address::parse(s)
    }
}

/// One parsed pattern segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternSegment {
    Literal(String),
    /// `*` - exactly one segment
    One,
    /// `**` - zero or more segments, always last
    Rest,
}

use PatternSegment as Seg;

/// A parsed subscription pattern. An exact address is a degenerate pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    raw: String,
    segs: Vec<Seg>,
}

impl Pattern {
    pub fn parse(s: &str) -> Result<Self> {
        validate_path(s, true)?;

        let parts: Vec<&str> = s[1..].split('/').collect();
        let mut segs = Vec::with_capacity(parts.len());
        for (i, part) in parts.iter().enumerate() {
            let seg = match *part {
                "*" => Seg::One,
                "**" => {
                    if i != parts.len() - 1 {
                        return Err(Error::InvalidPattern(format!(
                            "'**' must be the final segment: {s}"
                        )));
                    }
                    Seg::Rest
                }
                lit => Seg::Literal(lit.to_string()),
            };
            segs.push(seg);
        }

        Ok(Self {
            raw: s.to_string(),
            segs,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// True when the pattern contains no wildcards
    pub fn is_exact(&self) -> bool {
        self.segs.iter().all(|s| matches!(s, Seg::Literal(_)))
    }

    /// Parsed segment view, for index structures
    pub fn segments(&self) -> &[PatternSegment] {
        &self.segs
    }

    /// Match an address string against this pattern.
    ///
    /// `/a/*` matches `/a/b` but neither `/a` nor `/a/b/c`; `/a/**` matches
    /// `/a`, `/a/b`, and `/a/b/c`; `/a` matches `/a` only.
    pub fn matches(&self, address: &str) -> bool {
        if address.len() < 2 || !address.starts_with('/') {
            return false;
        }
        let mut addr = address[1..].split('/');

        for (i, seg) in self.segs.iter().enumerate() {
            match seg {
                Seg::Rest => {
                    // Zero or more remaining segments. The prefix before the
                    // globstar has already consumed i address segments; the
                    // bare prefix itself also matches.
                    debug_assert_eq!(i, self.segs.len() - 1);
                    return true;
                }
                Seg::One => {
                    if addr.next().is_none() {
                        return false;
                    }
                }
                Seg::Literal(lit) => match addr.next() {
                    Some(a) if a == lit => {}
                    _ => return false,
                },
            }
        }

        addr.next().is_none()
    }

    pub fn matches_address(&self, address: &Address) -> bool {
        self.matches(address.as_str())
    }
}

impl std::fmt::Display for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.raw)
    }
}

impl TryFrom<&str> for Pattern {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        Pattern::parse(s)
    }
}

fn validate_path(s: &str, allow_wildcards: bool) -> Result<()> {
    let err = |msg: String| {
        if allow_wildcards {
            Error::InvalidPattern(msg)
        } else {
            Error::InvalidAddress(msg)
        }
    };

    if s.is_empty() {
        return Err(err("empty path".to_string()));
    }
    if !s.starts_with('/') {
        return Err(err(format!("path must start with '/': {s}")));
    }
    if s.len() == 1 {
        return Err(err("path has no segments".to_string()));
    }
    if s.ends_with('/') {
        return Err(err(format!("trailing slash: {s}")));
    }

    for seg in s[1..].split('/') {
        if seg.is_empty() {
            return Err(err(format!("empty segment: {s}")));
        }
        if seg.chars().any(|c| c.is_control()) {
            return Err(err(format!("control character in segment: {s}")));
        }
        if seg.contains('*') && !(allow_wildcards && (seg == "*" || seg == "**")) {
            return Err(err(format!("'*' not allowed here: {s}")));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_valid_address() {
        let addr = Address::parse("/lumen/scene/0/layer/3/opacity").unwrap();
        assert_eq!(addr.segments().count(), 6);
        assert_eq!(addr.namespace(), "lumen");
    }

    #[test]
    fn parse_invalid_address() {
        assert!(Address::parse("").is_err());
        assert!(Address::parse("/").is_err());
        assert!(Address::parse("no/leading/slash").is_err());
        assert!(Address::parse("/a//b").is_err());
        assert!(Address::parse("/a/b/").is_err());
        assert!(Address::parse("/a/*").is_err());
        assert!(Address::parse("/a/b\u{7}").is_err());
    }

    #[test]
    fn single_wildcard() {
        let p = Pattern::parse("/a/*").unwrap();
        assert!(p.matches("/a/b"));
        assert!(p.matches("/a/c"));
        assert!(!p.matches("/a"));
        assert!(!p.matches("/a/b/c"));
    }

    #[test]
    fn globstar() {
        let p = Pattern::parse("/a/**").unwrap();
        assert!(p.matches("/a"));
        assert!(p.matches("/a/b"));
        assert!(p.matches("/a/b/c"));
        assert!(!p.matches("/ab"));
        assert!(!p.matches("/b/a"));
    }

    #[test]
    fn root_globstar() {
        let p = Pattern::parse("/**").unwrap();
        assert!(p.matches("/anything"));
        assert!(p.matches("/deeply/nested/path"));
    }

    #[test]
    fn exact() {
        let p = Pattern::parse("/a").unwrap();
        assert!(p.is_exact());
        assert!(p.matches("/a"));
        assert!(!p.matches("/a/b"));
    }

    #[test]
    fn embedded_globstar_rejected() {
        assert!(Pattern::parse("/a/**/b").is_err());
    }

    #[test]
    fn mixed_wildcards() {
        let p = Pattern::parse("/scene/*/layer/**").unwrap();
        assert!(p.matches("/scene/0/layer"));
        assert!(p.matches("/scene/0/layer/3/opacity"));
        assert!(!p.matches("/scene/layer"));
    }
}
