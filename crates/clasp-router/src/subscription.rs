//! Subscription index and per-subscription throttling
//!
//! The index is dual: exact patterns live in a hash map, wildcard patterns
//! in a segment trie, so fan-out consults only candidate subscriptions.
//! Each subscription carries its own throttle state: the last delivered
//! numeric value per address (epsilon), the last delivery time per address
//! (max_rate), a pending coalesced sample per address, and the last seen
//! revision per address so a snapshot and the live stream never overlap or
//! regress.

use clasp_core::{Pattern, Timestamp};
use std::collections::HashMap;

use crate::session::{OutboundFrame, SessionId};
use crate::trie::PatternTrie;

pub type SubKey = (SessionId, u32);

/// Decision for one candidate delivery
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Gate {
    Deliver,
    /// Suppressed: duplicate revision or sub-epsilon delta
    Skip,
    /// Rate window closed; stash the sample and flush at `open_at`
    Defer { open_at: Timestamp },
}

#[derive(Debug)]
struct Pending {
    frame: OutboundFrame,
    numeric: Option<f64>,
    revision: Option<u64>,
}

/// One registered subscription
pub struct Subscription {
    pub session: SessionId,
    pub id: u32,
    pub pattern: Pattern,
    pub max_rate: Option<u32>,
    pub epsilon: Option<f64>,
    seen_revision: HashMap<String, u64>,
    last_numeric: HashMap<String, f64>,
    last_sent_at: HashMap<String, Timestamp>,
    pending: HashMap<String, Pending>,
}

impl Subscription {
    pub fn new(
        session: SessionId,
        id: u32,
        pattern: Pattern,
        max_rate: Option<u32>,
        epsilon: Option<f64>,
    ) -> Self {
        Self {
            session,
            id,
            pattern,
            max_rate,
            epsilon,
            seen_revision: HashMap::new(),
            last_numeric: HashMap::new(),
            last_sent_at: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    fn window_us(&self) -> Option<u64> {
        match self.max_rate {
            Some(rate) if rate > 0 => Some(1_000_000 / rate as u64),
            _ => None,
        }
    }

    /// Gate a candidate delivery for `address`.
    pub fn gate(
        &mut self,
        address: &str,
        numeric: Option<f64>,
        revision: Option<u64>,
        now: Timestamp,
    ) -> Gate {
        if let (Some(rev), Some(seen)) = (revision, self.seen_revision.get(address)) {
            if rev <= *seen {
                return Gate::Skip;
            }
        }

        if let (Some(eps), Some(value)) = (self.epsilon, numeric) {
            if eps > 0.0 {
                if let Some(last) = self.last_numeric.get(address) {
                    if (value - last).abs() < eps {
                        return Gate::Skip;
                    }
                }
            }
        }

        if let Some(window) = self.window_us() {
            if let Some(sent_at) = self.last_sent_at.get(address) {
                if now.saturating_sub(*sent_at) < window {
                    return Gate::Defer {
                        open_at: sent_at + window,
                    };
                }
            }
        }

        Gate::Deliver
    }

    /// Record a completed delivery for throttle bookkeeping.
    pub fn note_delivered(
        &mut self,
        address: &str,
        numeric: Option<f64>,
        revision: Option<u64>,
        now: Timestamp,
    ) {
        if let Some(v) = numeric {
            self.last_numeric.insert(address.to_string(), v);
        }
        if let Some(rev) = revision {
            self.seen_revision.insert(address.to_string(), rev);
        }
        self.last_sent_at.insert(address.to_string(), now);
    }

    /// Prime the revision cursor from a snapshot entry.
    pub fn note_snapshot(&mut self, address: &str, numeric: Option<f64>, revision: u64) {
        self.seen_revision.insert(address.to_string(), revision);
        if let Some(v) = numeric {
            self.last_numeric.insert(address.to_string(), v);
        }
    }

    /// Hold the latest sample for a closed rate window; later samples for
    /// the same address supersede it.
    pub fn stash(
        &mut self,
        address: &str,
        frame: OutboundFrame,
        numeric: Option<f64>,
        revision: Option<u64>,
    ) {
        self.pending.insert(
            address.to_string(),
            Pending {
                frame,
                numeric,
                revision,
            },
        );
    }

    /// Pull every pending sample whose window has opened. Returns the
    /// deliverable frames and the earliest still-closed deadline.
    pub fn take_due(&mut self, now: Timestamp) -> (Vec<OutboundFrame>, Option<Timestamp>) {
        let window = match self.window_us() {
            Some(w) => w,
            None => {
                // No rate limit; release everything
                let drained: Vec<(String, Pending)> = self.pending.drain().collect();
                let mut out = Vec::with_capacity(drained.len());
                for (addr, p) in drained {
                    self.note_delivered(&addr, p.numeric, p.revision, now);
                    out.push(p.frame);
                }
                return (out, None);
            }
        };

        let due: Vec<String> = self
            .pending
            .keys()
            .filter(|addr| {
                self.last_sent_at
                    .get(*addr)
                    .map(|sent| now.saturating_sub(*sent) >= window)
                    .unwrap_or(true)
            })
            .cloned()
            .collect();

        let mut out = Vec::with_capacity(due.len());
        for addr in due {
            if let Some(p) = self.pending.remove(&addr) {
                self.note_delivered(&addr, p.numeric, p.revision, now);
                out.push(p.frame);
            }
        }

        let next = self
            .pending
            .keys()
            .filter_map(|addr| self.last_sent_at.get(addr).map(|sent| sent + window))
            .min();
        (out, next)
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

/// All active subscriptions
pub struct SubscriptionIndex {
    subs: HashMap<SubKey, Subscription>,
    exact: HashMap<String, Vec<SubKey>>,
    wild: PatternTrie<SubKey>,
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self {
            subs: HashMap::new(),
            exact: HashMap::new(),
            wild: PatternTrie::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.subs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }

    /// Register a subscription; re-subscribing with the same id replaces
    /// the previous registration.
    pub fn add(&mut self, sub: Subscription) {
        let key = (sub.session.clone(), sub.id);
        self.remove(&key);

        if sub.pattern.is_exact() {
            self.exact
                .entry(sub.pattern.as_str().to_string())
                .or_default()
                .push(key.clone());
        } else {
            self.wild.insert(&sub.pattern, key.clone());
        }
        self.subs.insert(key, sub);
    }

    pub fn remove(&mut self, key: &SubKey) -> Option<Subscription> {
        let sub = self.subs.remove(key)?;
        if sub.pattern.is_exact() {
            let now_empty = match self.exact.get_mut(sub.pattern.as_str()) {
                Some(keys) => {
                    keys.retain(|k| k != key);
                    keys.is_empty()
                }
                None => false,
            };
            if now_empty {
                self.exact.remove(sub.pattern.as_str());
            }
        } else {
            self.wild.remove(&sub.pattern, key);
        }
        Some(sub)
    }

    pub fn remove_session(&mut self, session: &SessionId) -> usize {
        let keys: Vec<SubKey> = self
            .subs
            .keys()
            .filter(|(s, _)| s == session)
            .cloned()
            .collect();
        let count = keys.len();
        for key in keys {
            self.remove(&key);
        }
        count
    }

    pub fn get_mut(&mut self, key: &SubKey) -> Option<&mut Subscription> {
        self.subs.get_mut(key)
    }

    /// Candidate subscriptions for an address: exact matches first, then
    /// wildcard matches in trie walk order. Deterministic for a fixed set
    /// of registrations.
    pub fn matching(&self, address: &str) -> Vec<SubKey> {
        let mut keys: Vec<SubKey> = self
            .exact
            .get(address)
            .map(|v| v.clone())
            .unwrap_or_default();
        for key in self.wild.collect(address) {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        keys
    }

    /// Flush all open-window pendings across subscriptions. Returns frames
    /// paired with their session and the earliest remaining deadline.
    pub fn flush_due(&mut self, now: Timestamp) -> (Vec<(SessionId, OutboundFrame)>, Option<Timestamp>) {
        let mut out = Vec::new();
        let mut next: Option<Timestamp> = None;
        for sub in self.subs.values_mut() {
            if !sub.has_pending() {
                continue;
            }
            let (frames, sub_next) = sub.take_due(now);
            for frame in frames {
                out.push((sub.session.clone(), frame));
            }
            if let Some(n) = sub_next {
                next = Some(next.map_or(n, |cur| cur.min(n)));
            }
        }
        (out, next)
    }
}

impl Default for SubscriptionIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::DeliveryClass;
    use bytes::Bytes;

    fn sub(session: &str, id: u32, pattern: &str) -> Subscription {
        Subscription::new(
            session.to_string(),
            id,
            Pattern::parse(pattern).unwrap(),
            None,
            None,
        )
    }

    fn frame(address: &str) -> OutboundFrame {
        OutboundFrame {
            class: DeliveryClass::Control,
            address: Some(address.to_string()),
            gesture_id: None,
            gesture_move: false,
            bytes: Bytes::new(),
        }
    }

    #[test]
    fn exact_and_wildcard_matching() {
        let mut index = SubscriptionIndex::new();
        index.add(sub("s1", 1, "/a/b"));
        index.add(sub("s2", 1, "/a/*"));
        index.add(sub("s3", 1, "/**"));

        let keys = index.matching("/a/b");
        assert_eq!(keys.len(), 3);
        assert_eq!(keys[0], ("s1".to_string(), 1));

        let keys = index.matching("/z");
        assert_eq!(keys, vec![("s3".to_string(), 1)]);
    }

    #[test]
    fn resubscribe_replaces() {
        let mut index = SubscriptionIndex::new();
        index.add(sub("s1", 1, "/a/**"));
        index.add(sub("s1", 1, "/b/**"));
        assert_eq!(index.len(), 1);
        assert!(index.matching("/a/x").is_empty());
        assert_eq!(index.matching("/b/x").len(), 1);
    }

    #[test]
    fn remove_session_clears_all() {
        let mut index = SubscriptionIndex::new();
        index.add(sub("s1", 1, "/a/**"));
        index.add(sub("s1", 2, "/b"));
        index.add(sub("s2", 1, "/a/**"));
        assert_eq!(index.remove_session(&"s1".to_string()), 2);
        assert_eq!(index.len(), 1);
        assert_eq!(index.matching("/a/x").len(), 1);
    }

    #[test]
    fn epsilon_gates_small_deltas() {
        let mut s = Subscription::new(
            "s".into(),
            1,
            Pattern::parse("/sensor").unwrap(),
            None,
            Some(0.1),
        );
        // The canonical sequence: 0.0, 0.05, 0.15, 0.16, 0.30 -> 0.0, 0.15, 0.30
        assert_eq!(s.gate("/sensor", Some(0.0), Some(1), 0), Gate::Deliver);
        s.note_delivered("/sensor", Some(0.0), Some(1), 0);
        assert_eq!(s.gate("/sensor", Some(0.05), Some(2), 1), Gate::Skip);
        assert_eq!(s.gate("/sensor", Some(0.15), Some(3), 2), Gate::Deliver);
        s.note_delivered("/sensor", Some(0.15), Some(3), 2);
        assert_eq!(s.gate("/sensor", Some(0.16), Some(4), 3), Gate::Skip);
        assert_eq!(s.gate("/sensor", Some(0.30), Some(5), 4), Gate::Deliver);
    }

    #[test]
    fn revision_cursor_skips_duplicates() {
        let mut s = sub("s", 1, "/a");
        s.note_snapshot("/a", None, 5);
        assert_eq!(s.gate("/a", None, Some(5), 0), Gate::Skip);
        assert_eq!(s.gate("/a", None, Some(4), 0), Gate::Skip);
        assert_eq!(s.gate("/a", None, Some(6), 0), Gate::Deliver);
    }

    #[test]
    fn max_rate_defers_and_flushes_latest() {
        let mut s = Subscription::new(
            "s".into(),
            1,
            Pattern::parse("/s").unwrap(),
            Some(10), // 100ms window
            None,
        );
        assert_eq!(s.gate("/s", Some(1.0), None, 0), Gate::Deliver);
        s.note_delivered("/s", Some(1.0), None, 0);

        // Inside the window: defer
        match s.gate("/s", Some(2.0), None, 50_000) {
            Gate::Defer { open_at } => assert_eq!(open_at, 100_000),
            other => panic!("expected defer, got {other:?}"),
        }
        s.stash("/s", frame("/s"), Some(2.0), None);
        // A later sample supersedes the stashed one
        s.stash("/s", frame("/s"), Some(3.0), None);

        // Window still closed
        let (frames, next) = s.take_due(60_000);
        assert!(frames.is_empty());
        assert_eq!(next, Some(100_000));

        // Window open: exactly one frame comes out
        let (frames, next) = s.take_due(100_000);
        assert_eq!(frames.len(), 1);
        assert_eq!(next, None);
        assert!(!s.has_pending());
    }
}
