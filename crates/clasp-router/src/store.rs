//! Authoritative param state
//!
//! Maps addresses to their current value, revision, writer, and lock state.
//! Pattern iteration goes through a segment trie so wildcard snapshots stay
//! sublinear in the full address space. TTL and capacity eviction remove
//! entries silently; absence is not an event.

use clasp_core::{ConflictStrategy, ParamMeta, ParamSnapshot, Pattern, Timestamp, Value};
use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::debug;

use crate::config::EvictionStrategy;
use crate::trie::AddressTrie;

/// State of one live address
#[derive(Debug, Clone)]
pub struct ParamEntry {
    pub value: Value,
    pub revision: u64,
    pub writer: String,
    pub timestamp: Timestamp,
    pub created_at: Timestamp,
    pub last_accessed: Timestamp,
    pub strategy: ConflictStrategy,
    pub lock_holder: Option<String>,
    pub meta: Option<ParamMeta>,
    /// Opaque federation tag for loop prevention
    pub origin: Option<String>,
    /// TTL in microseconds; `None` disables TTL for this entry
    pub ttl: Option<u64>,
}

impl ParamEntry {
    pub fn snapshot(&self, address: &str) -> ParamSnapshot {
        ParamSnapshot {
            address: address.to_string(),
            value: self.value.clone(),
            revision: self.revision,
            writer: self.writer.clone(),
            timestamp: self.timestamp,
        }
    }
}

/// One validated write
#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub address: String,
    pub value: Value,
    pub writer: String,
    /// Revision precondition; `Some(0)` means "create only"
    pub precondition: Option<u64>,
    pub lock: bool,
    pub unlock: bool,
    pub strategy: Option<ConflictStrategy>,
    pub meta: Option<ParamMeta>,
    pub origin: Option<String>,
    /// TTL in microseconds for the entry
    pub ttl: Option<u64>,
}

impl WriteRequest {
    pub fn new(address: impl Into<String>, value: Value, writer: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            value,
            writer: writer.into(),
            precondition: None,
            lock: false,
            unlock: false,
            strategy: None,
            meta: None,
            origin: None,
            ttl: None,
        }
    }
}

/// Rejection reasons; writes fail atomically with no mutation
#[derive(Debug, Clone, PartialEq)]
pub enum WriteError {
    RevisionConflict { expected: u64, actual: u64 },
    LockHeld { holder: String },
    /// Max/Min strategy rejected a non-improving value
    StrategyRejected { revision: u64 },
    AtCapacity,
}

/// Result of an accepted write
#[derive(Debug, Clone)]
pub struct Applied {
    pub revision: u64,
    pub created: bool,
    pub previous: Option<Value>,
}

/// The state store
#[derive(Debug)]
pub struct ParamStore {
    entries: HashMap<String, ParamEntry>,
    index: AddressTrie,
    /// Highest revision ever used per address; survives eviction so a
    /// re-created address never reuses a revision
    high_water: HashMap<String, u64>,
    max_params: usize,
    eviction: EvictionStrategy,
}

impl ParamStore {
    pub fn new(max_params: usize, eviction: EvictionStrategy) -> Self {
        Self {
            entries: HashMap::new(),
            index: AddressTrie::new(),
            high_water: HashMap::new(),
            max_params,
            eviction,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Read an entry, refreshing its TTL clock.
    pub fn get(&mut self, address: &str, now: Timestamp) -> Option<&ParamEntry> {
        let entry = self.entries.get_mut(address)?;
        entry.last_accessed = now;
        Some(entry)
    }

    pub fn peek(&self, address: &str) -> Option<&ParamEntry> {
        self.entries.get(address)
    }

    /// Validate a write without mutating. Capacity is only an error under
    /// the reject-new strategy; the evicting strategies make room instead.
    pub fn check(&self, req: &WriteRequest) -> Result<(), WriteError> {
        match self.entries.get(&req.address) {
            Some(entry) => self.check_existing(entry, req),
            None => {
                if let Some(expected) = req.precondition {
                    if expected != 0 {
                        return Err(WriteError::RevisionConflict {
                            expected,
                            actual: 0,
                        });
                    }
                }
                if self.rejects_new(0) {
                    return Err(WriteError::AtCapacity);
                }
                Ok(())
            }
        }
    }

    /// Start a hypothetical validation pass over a sequence of writes.
    /// Used by bundle execution: every inner write is checked against the
    /// state its predecessors would leave behind, so a sequence that
    /// passes the preview cannot fail when applied for real.
    pub fn preview(&self) -> WritePreview<'_> {
        WritePreview {
            store: self,
            sim: HashMap::new(),
            creations: 0,
        }
    }

    fn check_existing(&self, entry: &ParamEntry, req: &WriteRequest) -> Result<(), WriteError> {
        if let Some(holder) = &entry.lock_holder {
            if *holder != req.writer {
                return Err(WriteError::LockHeld {
                    holder: holder.clone(),
                });
            }
        }
        if let Some(expected) = req.precondition {
            if expected != entry.revision {
                return Err(WriteError::RevisionConflict {
                    expected,
                    actual: entry.revision,
                });
            }
        }

        let strategy = req.strategy.unwrap_or(entry.strategy);
        match strategy {
            ConflictStrategy::Max => {
                if let Some(ord) = req.value.numeric_cmp(&entry.value) {
                    if ord != Ordering::Greater {
                        return Err(WriteError::StrategyRejected {
                            revision: entry.revision,
                        });
                    }
                }
            }
            ConflictStrategy::Min => {
                if let Some(ord) = req.value.numeric_cmp(&entry.value) {
                    if ord != Ordering::Less {
                        return Err(WriteError::StrategyRejected {
                            revision: entry.revision,
                        });
                    }
                }
            }
            // Lww and Merge accept unconditionally; Lock is the holder gate
            // above
            ConflictStrategy::Lww | ConflictStrategy::Lock | ConflictStrategy::Merge => {}
        }
        Ok(())
    }

    /// Apply a write. Either the full state transition happens or nothing
    /// does.
    pub fn apply(&mut self, req: WriteRequest, now: Timestamp) -> Result<Applied, WriteError> {
        self.check(&req)?;

        if let Some(entry) = self.entries.get_mut(&req.address) {
            let previous = entry.value.clone();
            entry.value = req.value;
            entry.revision += 1;
            entry.writer = req.writer.clone();
            entry.timestamp = now;
            entry.last_accessed = now;
            if let Some(strategy) = req.strategy {
                entry.strategy = strategy;
            }
            if let Some(meta) = req.meta {
                entry.meta = Some(meta);
            }
            if req.origin.is_some() {
                entry.origin = req.origin;
            }
            if req.lock {
                entry.lock_holder = Some(req.writer);
            } else if req.unlock {
                entry.lock_holder = None;
            }
            let revision = entry.revision;
            self.high_water.insert(req.address, revision);
            return Ok(Applied {
                revision,
                created: false,
                previous: Some(previous),
            });
        }

        // New address
        if self.at_capacity() {
            self.evict_one(now);
        }
        let revision = self.high_water.get(&req.address).copied().unwrap_or(0) + 1;
        let entry = ParamEntry {
            value: req.value,
            revision,
            writer: req.writer.clone(),
            timestamp: now,
            created_at: now,
            last_accessed: now,
            strategy: req.strategy.unwrap_or_default(),
            lock_holder: req.lock.then(|| req.writer.clone()),
            meta: req.meta,
            origin: req.origin,
            ttl: req.ttl,
        };
        self.high_water.insert(req.address.clone(), revision);
        self.index.insert(&req.address);
        self.entries.insert(req.address, entry);
        Ok(Applied {
            revision,
            created: true,
            previous: None,
        })
    }

    fn at_capacity(&self) -> bool {
        self.max_params > 0 && self.entries.len() >= self.max_params
    }

    /// Whether creating one more address (after `pending` hypothetical
    /// creations) would be rejected rather than make room by eviction.
    fn rejects_new(&self, pending: usize) -> bool {
        self.max_params > 0
            && self.eviction == EvictionStrategy::RejectNew
            && self.entries.len() + pending >= self.max_params
    }

    fn evict_one(&mut self, _now: Timestamp) {
        let victim = match self.eviction {
            EvictionStrategy::Lru => self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_accessed)
                .map(|(a, _)| a.clone()),
            EvictionStrategy::Oldest => self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.created_at)
                .map(|(a, _)| a.clone()),
            // check() already rejected the write
            EvictionStrategy::RejectNew => None,
        };
        if let Some(address) = victim {
            debug!(%address, "evicting param at capacity");
            self.remove(&address);
        }
    }

    pub fn remove(&mut self, address: &str) -> Option<ParamEntry> {
        let entry = self.entries.remove(address)?;
        self.index.remove(address);
        Some(entry)
    }

    /// Snapshots of all entries matching `pattern`, refreshed for TTL.
    /// Addresses come back in deterministic trie order.
    pub fn collect_matching(&mut self, pattern: &Pattern, now: Timestamp) -> Vec<ParamSnapshot> {
        let mut addresses = self.index.collect_matching(pattern);
        addresses.sort();
        addresses
            .into_iter()
            .filter_map(|address| {
                let entry = self.entries.get_mut(&address)?;
                entry.last_accessed = now;
                Some(entry.snapshot(&address))
            })
            .collect()
    }

    /// Drop every lock held by a terminating session. Returns the released
    /// addresses; no notifications are emitted for them.
    pub fn release_locks_of(&mut self, session: &str) -> Vec<String> {
        let mut released = Vec::new();
        for (address, entry) in self.entries.iter_mut() {
            if entry.lock_holder.as_deref() == Some(session) {
                entry.lock_holder = None;
                released.push(address.clone());
            }
        }
        released
    }

    /// Evict entries idle past their TTL. Returns the evicted addresses.
    pub fn sweep_ttl(&mut self, now: Timestamp) -> Vec<String> {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| {
                e.ttl
                    .map(|ttl| now.saturating_sub(e.last_accessed) > ttl)
                    .unwrap_or(false)
            })
            .map(|(a, _)| a.clone())
            .collect();
        for address in &expired {
            self.remove(address);
        }
        expired
    }
}

/// The hypothetical state of one address inside a [`WritePreview`]
#[derive(Debug)]
struct SimParam {
    exists: bool,
    revision: u64,
    value: Value,
    lock_holder: Option<String>,
    strategy: ConflictStrategy,
}

impl SimParam {
    /// `high_water` mirrors the revision an actual create would resume
    /// from when the address was evicted earlier.
    fn seed(entry: Option<&ParamEntry>, high_water: u64) -> Self {
        match entry {
            Some(e) => Self {
                exists: true,
                revision: e.revision,
                value: e.value.clone(),
                lock_holder: e.lock_holder.clone(),
                strategy: e.strategy,
            },
            None => Self {
                exists: false,
                revision: high_water,
                value: Value::Null,
                lock_holder: None,
                strategy: ConflictStrategy::default(),
            },
        }
    }
}

/// Validates a sequence of writes against the state each predecessor would
/// leave behind, without touching the store. Mirrors the lock, precondition,
/// strategy, and capacity gates of [`ParamStore::apply`]; any sequence this
/// accepts will apply cleanly as long as the store is not mutated in
/// between.
#[derive(Debug)]
pub struct WritePreview<'a> {
    store: &'a ParamStore,
    sim: HashMap<String, SimParam>,
    creations: usize,
}

impl WritePreview<'_> {
    pub fn check(&mut self, req: &WriteRequest) -> Result<(), WriteError> {
        if !self.sim.contains_key(&req.address) {
            let high_water = self
                .store
                .high_water
                .get(&req.address)
                .copied()
                .unwrap_or(0);
            let seeded = SimParam::seed(self.store.peek(&req.address), high_water);
            self.sim.insert(req.address.clone(), seeded);
        }
        let entry = self
            .sim
            .get_mut(&req.address)
            .expect("seeded above");

        if entry.exists {
            if let Some(holder) = &entry.lock_holder {
                if *holder != req.writer {
                    return Err(WriteError::LockHeld {
                        holder: holder.clone(),
                    });
                }
            }
        }
        if let Some(expected) = req.precondition {
            // A nonexistent address takes Some(0) as the create-only
            // marker, exactly as `ParamStore::check` does
            let current = if entry.exists { entry.revision } else { 0 };
            if expected != current {
                return Err(WriteError::RevisionConflict {
                    expected,
                    actual: current,
                });
            }
        }
        if entry.exists {
            let strategy = req.strategy.unwrap_or(entry.strategy);
            match strategy {
                ConflictStrategy::Max => {
                    if let Some(ord) = req.value.numeric_cmp(&entry.value) {
                        if ord != Ordering::Greater {
                            return Err(WriteError::StrategyRejected {
                                revision: entry.revision,
                            });
                        }
                    }
                }
                ConflictStrategy::Min => {
                    if let Some(ord) = req.value.numeric_cmp(&entry.value) {
                        if ord != Ordering::Less {
                            return Err(WriteError::StrategyRejected {
                                revision: entry.revision,
                            });
                        }
                    }
                }
                ConflictStrategy::Lww | ConflictStrategy::Lock | ConflictStrategy::Merge => {}
            }
        } else {
            if self.store.rejects_new(self.creations) {
                return Err(WriteError::AtCapacity);
            }
            self.creations += 1;
        }

        // Accepted; fold the write into the hypothetical state
        entry.exists = true;
        entry.revision += 1;
        entry.value = req.value.clone();
        if let Some(strategy) = req.strategy {
            entry.strategy = strategy;
        }
        if req.lock {
            entry.lock_holder = Some(req.writer.clone());
        } else if req.unlock {
            entry.lock_holder = None;
        }
        Ok(())
    }
}

impl WriteError {
    pub fn kind(&self) -> clasp_core::ErrorKind {
        use clasp_core::ErrorKind;
        match self {
            WriteError::RevisionConflict { .. } | WriteError::StrategyRejected { .. } => {
                ErrorKind::RevisionConflict
            }
            WriteError::LockHeld { .. } => ErrorKind::LockHeld,
            WriteError::AtCapacity => ErrorKind::AtCapacity,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            WriteError::RevisionConflict { expected, actual } => {
                format!("revision precondition {expected} does not match current {actual}")
            }
            WriteError::LockHeld { holder } => format!("lock held by {holder}"),
            WriteError::StrategyRejected { revision } => {
                format!("value rejected by conflict strategy at revision {revision}")
            }
            WriteError::AtCapacity => "state store at capacity".to_string(),
        }
    }
}
