//! Session management
//!
//! A session is a live connected client: identity, granted features,
//! authorization scopes, its subscriptions and held locks, and a bounded
//! outbound queue. The queue applies the per-signal backpressure policy:
//! control traffic must deliver (a persistently full queue closes the
//! session as a slow consumer), while stream/event/gesture traffic degrades
//! by coalescing or dropping.

use bytes::Bytes;
use clasp_transport::FrameSink;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;
use tracing::trace;
use uuid::Uuid;

use crate::hooks::ScopeSet;

/// Session identifier
pub type SessionId = String;

/// Delivery classes for outbound frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryClass {
    /// Must-deliver: WELCOME, VALUE, SNAPSHOT, ACK, ERROR, SYNC, PING/PONG
    Control,
    /// Droppable, oldest kept under pressure
    Event,
    /// Droppable, latest sample per address kept under pressure
    Stream,
    /// Droppable, consecutive moves with the same id collapse
    Gesture,
}

/// One frame queued for a session
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    pub class: DeliveryClass,
    pub address: Option<String>,
    pub gesture_id: Option<u32>,
    pub gesture_move: bool,
    pub bytes: Bytes,
}

impl OutboundFrame {
    pub fn control(bytes: Bytes) -> Self {
        Self {
            class: DeliveryClass::Control,
            address: None,
            gesture_id: None,
            gesture_move: false,
            bytes,
        }
    }
}

/// Result of enqueueing onto an [`Outbox`]
#[derive(Debug, Clone, Copy)]
pub enum EnqueueOutcome {
    Queued,
    /// Replaced an older queued frame (stream sample or gesture move)
    Coalesced,
    /// Dropped under backpressure (droppable classes only)
    Dropped,
    /// Queued, but the queue has been beyond capacity since the instant
    Overflow(Instant),
}

#[derive(Debug, Default)]
struct OutboxState {
    queue: VecDeque<OutboundFrame>,
    over_capacity_since: Option<Instant>,
    closed: bool,
}

/// Bounded outbound queue, drained by the session writer task.
#[derive(Debug)]
pub struct Outbox {
    state: Mutex<OutboxState>,
    notify: Notify,
    capacity: usize,
    low_water: usize,
}

impl Outbox {
    pub fn new(capacity: usize, low_water: usize) -> Self {
        Self {
            state: Mutex::new(OutboxState::default()),
            notify: Notify::new(),
            capacity,
            low_water,
        }
    }

    pub fn push(&self, frame: OutboundFrame) -> EnqueueOutcome {
        let mut state = self.state.lock();
        if state.closed {
            return EnqueueOutcome::Dropped;
        }

        let outcome = match frame.class {
            DeliveryClass::Control => {
                state.queue.push_back(frame);
                if state.queue.len() > self.capacity {
                    let since = *state.over_capacity_since.get_or_insert_with(Instant::now);
                    EnqueueOutcome::Overflow(since)
                } else {
                    state.over_capacity_since = None;
                    EnqueueOutcome::Queued
                }
            }
            DeliveryClass::Stream => {
                if state.queue.len() > self.low_water {
                    // Latest sample wins for the same address
                    if let Some(slot) = state.queue.iter_mut().find(|f| {
                        f.class == DeliveryClass::Stream && f.address == frame.address
                    }) {
                        *slot = frame;
                        EnqueueOutcome::Coalesced
                    } else if state.queue.len() >= self.capacity {
                        EnqueueOutcome::Dropped
                    } else {
                        state.queue.push_back(frame);
                        EnqueueOutcome::Queued
                    }
                } else {
                    state.queue.push_back(frame);
                    EnqueueOutcome::Queued
                }
            }
            DeliveryClass::Event => {
                if state.queue.len() > self.low_water {
                    // The oldest queued events win; the newcomer is shed
                    EnqueueOutcome::Dropped
                } else {
                    state.queue.push_back(frame);
                    EnqueueOutcome::Queued
                }
            }
            DeliveryClass::Gesture => {
                if frame.gesture_move {
                    if let Some(slot) = state.queue.iter_mut().find(|f| {
                        f.class == DeliveryClass::Gesture
                            && f.gesture_move
                            && f.address == frame.address
                            && f.gesture_id == frame.gesture_id
                    }) {
                        *slot = frame;
                        self.notify.notify_one();
                        return EnqueueOutcome::Coalesced;
                    }
                }
                state.queue.push_back(frame);
                EnqueueOutcome::Queued
            }
        };

        drop(state);
        self.notify.notify_one();
        outcome
    }

    /// Next frame to write; `None` once closed and drained.
    pub async fn pop(&self) -> Option<OutboundFrame> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
                if let Some(frame) = state.queue.pop_front() {
                    if state.queue.len() <= self.capacity {
                        state.over_capacity_since = None;
                    }
                    return Some(frame);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Stop accepting frames; queued frames still drain.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_one();
    }

    /// Stop accepting frames and discard the queue.
    pub fn close_discard(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.queue.clear();
        drop(state);
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().queue.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

/// A connected client session
pub struct Session {
    pub id: SessionId,
    pub name: String,
    pub features: Vec<String>,
    pub peer: SocketAddr,
    pub scopes: ScopeSet,
    outbox: Arc<Outbox>,
    sink: Arc<dyn FrameSink>,
    subscriptions: Mutex<HashSet<u32>>,
    locks: Mutex<HashSet<String>>,
    pub created_at: Instant,
}

impl Session {
    pub fn new(
        name: String,
        features: Vec<String>,
        peer: SocketAddr,
        scopes: ScopeSet,
        sink: Arc<dyn FrameSink>,
        outbox_capacity: usize,
        outbox_low_water: usize,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            features,
            peer,
            scopes,
            outbox: Arc::new(Outbox::new(outbox_capacity, outbox_low_water)),
            sink,
            subscriptions: Mutex::new(HashSet::new()),
            locks: Mutex::new(HashSet::new()),
            created_at: Instant::now(),
        }
    }

    pub fn enqueue(&self, frame: OutboundFrame) -> EnqueueOutcome {
        self.outbox.push(frame)
    }

    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    /// Spawn the writer task draining this session's outbox into its sink.
    /// The task closes the sink when the outbox is closed and drained.
    pub fn spawn_writer(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let session = self.clone();
        tokio::spawn(async move {
            while let Some(frame) = session.outbox.pop().await {
                if session.sink.send(frame.bytes).await.is_err() {
                    trace!(session = %session.id, "writer stopping on send failure");
                    break;
                }
            }
            let _ = session.sink.close().await;
        })
    }

    pub fn add_subscription(&self, id: u32) {
        self.subscriptions.lock().insert(id);
    }

    pub fn remove_subscription(&self, id: u32) -> bool {
        self.subscriptions.lock().remove(&id)
    }

    pub fn subscription_ids(&self) -> Vec<u32> {
        self.subscriptions.lock().iter().copied().collect()
    }

    pub fn note_lock(&self, address: &str, held: bool) {
        let mut locks = self.locks.lock();
        if held {
            locks.insert(address.to_string());
        } else {
            locks.remove(address);
        }
    }

    pub fn held_locks(&self) -> Vec<String> {
        self.locks.lock().iter().cloned().collect()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("peer", &self.peer)
            .field("subscriptions", &self.subscriptions.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(class: DeliveryClass, address: &str, bytes: &'static [u8]) -> OutboundFrame {
        OutboundFrame {
            class,
            address: Some(address.to_string()),
            gesture_id: None,
            gesture_move: false,
            bytes: Bytes::from_static(bytes),
        }
    }

    #[tokio::test]
    async fn fifo_order_preserved() {
        let outbox = Outbox::new(8, 4);
        outbox.push(OutboundFrame::control(Bytes::from_static(b"a")));
        outbox.push(OutboundFrame::control(Bytes::from_static(b"b")));
        assert_eq!(outbox.pop().await.unwrap().bytes.as_ref(), b"a");
        assert_eq!(outbox.pop().await.unwrap().bytes.as_ref(), b"b");
    }

    #[tokio::test]
    async fn stream_coalesces_above_low_water() {
        let outbox = Outbox::new(16, 1);
        outbox.push(frame(DeliveryClass::Stream, "/s", b"1"));
        outbox.push(frame(DeliveryClass::Stream, "/s", b"2"));
        // Above low water now; same-address sample replaces the queued one
        assert!(matches!(
            outbox.push(frame(DeliveryClass::Stream, "/s", b"3")),
            EnqueueOutcome::Coalesced
        ));
        assert_eq!(outbox.len(), 2);
        assert_eq!(outbox.pop().await.unwrap().bytes.as_ref(), b"1");
        assert_eq!(outbox.pop().await.unwrap().bytes.as_ref(), b"3");
    }

    #[tokio::test]
    async fn event_sheds_newest_above_low_water() {
        let outbox = Outbox::new(16, 1);
        outbox.push(frame(DeliveryClass::Event, "/e", b"1"));
        outbox.push(frame(DeliveryClass::Event, "/e", b"2"));
        assert!(matches!(
            outbox.push(frame(DeliveryClass::Event, "/e", b"3")),
            EnqueueOutcome::Dropped
        ));
        assert_eq!(outbox.len(), 2);
    }

    #[tokio::test]
    async fn gesture_moves_collapse() {
        let outbox = Outbox::new(16, 4);
        let mv = |b: &'static [u8]| OutboundFrame {
            class: DeliveryClass::Gesture,
            address: Some("/g".into()),
            gesture_id: Some(1),
            gesture_move: true,
            bytes: Bytes::from_static(b),
        };
        outbox.push(mv(b"m1"));
        assert!(matches!(outbox.push(mv(b"m2")), EnqueueOutcome::Coalesced));
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox.pop().await.unwrap().bytes.as_ref(), b"m2");
    }

    #[tokio::test]
    async fn control_overflow_reports_duration() {
        let outbox = Outbox::new(1, 1);
        outbox.push(OutboundFrame::control(Bytes::from_static(b"1")));
        match outbox.push(OutboundFrame::control(Bytes::from_static(b"2"))) {
            EnqueueOutcome::Overflow(_) => {}
            other => panic!("expected overflow, got {other:?}"),
        }
        // Frames are never dropped for control class
        assert_eq!(outbox.len(), 2);
    }

    #[tokio::test]
    async fn close_drains_then_ends() {
        let outbox = Outbox::new(8, 4);
        outbox.push(OutboundFrame::control(Bytes::from_static(b"last")));
        outbox.close();
        assert!(outbox.pop().await.is_some());
        assert!(outbox.pop().await.is_none());
        assert!(matches!(
            outbox.push(OutboundFrame::control(Bytes::from_static(b"x"))),
            EnqueueOutcome::Dropped
        ));
    }
}
