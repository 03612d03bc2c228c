//! Pattern matching corner cases

use clasp_core::{Address, Pattern};

#[test]
fn star_matches_exactly_one_segment() {
    let p = Pattern::parse("/a/*").unwrap();
    assert!(p.matches("/a/b"));
    assert!(p.matches("/a/c"));
    assert!(!p.matches("/a/b/c"));
    assert!(!p.matches("/a"));
}

#[test]
fn globstar_matches_zero_or_more() {
    let p = Pattern::parse("/a/**").unwrap();
    assert!(p.matches("/a"));
    assert!(p.matches("/a/b"));
    assert!(p.matches("/a/b/c"));
    assert!(!p.matches("/b"));
}

#[test]
fn exact_pattern_matches_itself_only() {
    let p = Pattern::parse("/a").unwrap();
    assert!(p.matches("/a"));
    assert!(!p.matches("/a/b"));
    assert!(!p.matches("/ab"));
}

#[test]
fn interior_globstar_is_invalid() {
    assert!(Pattern::parse("/a/**/b").is_err());
}

#[test]
fn unicode_segments() {
    let addr = Address::parse("/licht/große-bühne/intensität").unwrap();
    assert_eq!(addr.segments().count(), 3);
    let p = Pattern::parse("/licht/*/intensität").unwrap();
    assert!(p.matches_address(&addr));
}

#[test]
fn case_sensitive() {
    let p = Pattern::parse("/Lights/*").unwrap();
    assert!(!p.matches("/lights/a"));
    assert!(p.matches("/Lights/a"));
}

#[test]
fn degenerate_pattern_reports_exact() {
    assert!(Pattern::parse("/a/b/c").unwrap().is_exact());
    assert!(!Pattern::parse("/a/*").unwrap().is_exact());
    assert!(!Pattern::parse("/a/**").unwrap().is_exact());
}
