//! Segment tries
//!
//! Two index shapes share the address segment model:
//!
//! - [`AddressTrie`] indexes live addresses so the state store can answer
//!   "which addresses match this pattern" sublinearly in the address space.
//! - [`PatternTrie`] indexes subscription patterns (with wildcard edges) so
//!   fan-out can answer "which patterns match this address" without walking
//!   every subscription.

use clasp_core::{Pattern, PatternSegment};
use std::collections::HashMap;

#[derive(Debug, Default)]
struct AddrNode {
    children: HashMap<String, AddrNode>,
    terminal: bool,
}

/// Trie over live addresses, queried by pattern.
#[derive(Debug, Default)]
pub struct AddressTrie {
    root: AddrNode,
    len: usize,
}

impl AddressTrie {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn insert(&mut self, address: &str) {
        let mut node = &mut self.root;
        for seg in address[1..].split('/') {
            node = node.children.entry(seg.to_string()).or_default();
        }
        if !node.terminal {
            node.terminal = true;
            self.len += 1;
        }
    }

    pub fn remove(&mut self, address: &str) {
        let segs: Vec<&str> = address[1..].split('/').collect();
        if Self::remove_rec(&mut self.root, &segs) {
            self.len -= 1;
        }
    }

    fn remove_rec(node: &mut AddrNode, segs: &[&str]) -> bool {
        match segs.split_first() {
            None => {
                let was = node.terminal;
                node.terminal = false;
                was
            }
            Some((head, rest)) => {
                let Some(child) = node.children.get_mut(*head) else {
                    return false;
                };
                let removed = Self::remove_rec(child, rest);
                if child.children.is_empty() && !child.terminal {
                    node.children.remove(*head);
                }
                removed
            }
        }
    }

    /// All stored addresses matching `pattern`.
    pub fn collect_matching(&self, pattern: &Pattern) -> Vec<String> {
        let mut out = Vec::new();
        let mut path = String::new();
        Self::walk(&self.root, pattern.segments(), &mut path, &mut out);
        out
    }

    fn walk(node: &AddrNode, segs: &[PatternSegment], path: &mut String, out: &mut Vec<String>) {
        match segs.split_first() {
            None => {
                if node.terminal {
                    out.push(path.clone());
                }
            }
            Some((PatternSegment::Literal(lit), rest)) => {
                if let Some(child) = node.children.get(lit) {
                    let mark = path.len();
                    path.push('/');
                    path.push_str(lit);
                    Self::walk(child, rest, path, out);
                    path.truncate(mark);
                }
            }
            Some((PatternSegment::One, rest)) => {
                for (seg, child) in &node.children {
                    let mark = path.len();
                    path.push('/');
                    path.push_str(seg);
                    Self::walk(child, rest, path, out);
                    path.truncate(mark);
                }
            }
            Some((PatternSegment::Rest, _)) => {
                Self::collect_subtree(node, path, out);
            }
        }
    }

    fn collect_subtree(node: &AddrNode, path: &mut String, out: &mut Vec<String>) {
        if node.terminal {
            out.push(path.clone());
        }
        for (seg, child) in &node.children {
            let mark = path.len();
            path.push('/');
            path.push_str(seg);
            Self::collect_subtree(child, path, out);
            path.truncate(mark);
        }
    }
}

#[derive(Debug)]
struct PatNode<K> {
    children: HashMap<String, PatNode<K>>,
    star: Option<Box<PatNode<K>>>,
    /// Keys of patterns ending exactly here
    here: Vec<K>,
    /// Keys of patterns ending with `**` here: match this node and below
    rest: Vec<K>,
}

impl<K> Default for PatNode<K> {
    fn default() -> Self {
        Self {
            children: HashMap::new(),
            star: None,
            here: Vec::new(),
            rest: Vec::new(),
        }
    }
}

/// Trie over patterns, queried by address. Keys collect in walk order,
/// which is deterministic for a given set of insertions.
#[derive(Debug)]
pub struct PatternTrie<K> {
    root: PatNode<K>,
}

impl<K: Clone + PartialEq> PatternTrie<K> {
    pub fn new() -> Self {
        Self {
            root: PatNode::default(),
        }
    }

    pub fn insert(&mut self, pattern: &Pattern, key: K) {
        let mut node = &mut self.root;
        for seg in pattern.segments() {
            match seg {
                PatternSegment::Literal(lit) => {
                    node = node.children.entry(lit.clone()).or_default();
                }
                PatternSegment::One => {
                    node = node.star.get_or_insert_with(Default::default);
                }
                PatternSegment::Rest => {
                    node.rest.push(key);
                    return;
                }
            }
        }
        node.here.push(key);
    }

    pub fn remove(&mut self, pattern: &Pattern, key: &K) {
        Self::remove_rec(&mut self.root, pattern.segments(), key);
    }

    fn remove_rec(node: &mut PatNode<K>, segs: &[PatternSegment], key: &K) -> bool {
        // Returns true when the child node became prunable
        match segs.split_first() {
            None => {
                node.here.retain(|k| k != key);
            }
            Some((PatternSegment::Rest, _)) => {
                node.rest.retain(|k| k != key);
            }
            Some((PatternSegment::Literal(lit), rest)) => {
                if let Some(child) = node.children.get_mut(lit) {
                    if Self::remove_rec(child, rest, key) {
                        node.children.remove(lit);
                    }
                }
            }
            Some((PatternSegment::One, rest)) => {
                if let Some(child) = node.star.as_deref_mut() {
                    if Self::remove_rec(child, rest, key) {
                        node.star = None;
                    }
                }
            }
        }
        node.here.is_empty() && node.rest.is_empty() && node.children.is_empty() && node.star.is_none()
    }

    /// Keys of all patterns matching `address`.
    pub fn collect(&self, address: &str) -> Vec<K> {
        let segs: Vec<&str> = address[1..].split('/').collect();
        let mut out = Vec::new();
        Self::collect_rec(&self.root, &segs, &mut out);
        out
    }

    fn collect_rec(node: &PatNode<K>, segs: &[&str], out: &mut Vec<K>) {
        // `**` at this node matches zero or more remaining segments
        out.extend(node.rest.iter().cloned());

        match segs.split_first() {
            None => {
                out.extend(node.here.iter().cloned());
            }
            Some((head, rest)) => {
                if let Some(child) = node.children.get(*head) {
                    Self::collect_rec(child, rest, out);
                }
                if let Some(star) = node.star.as_deref() {
                    Self::collect_rec(star, rest, out);
                }
            }
        }
    }
}

impl<K: Clone + PartialEq> Default for PatternTrie<K> {
    fn default() -> Self {
        Self::new()
    }
}
