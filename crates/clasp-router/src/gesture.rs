//! Gesture move coalescing
//!
//! Routers may coalesce `move` phases to bound bandwidth: Start, End, and
//! Cancel forward immediately (flushing any buffered move first), while
//! successive Move frames for the same (address, gesture id) replace each
//! other and drain on a flush interval. The publisher travels with each
//! buffered frame so fan-out can keep excluding the originating session.

use clasp_core::{GesturePhase, Publish, Timestamp};
use std::collections::HashMap;

use crate::session::SessionId;

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct GestureKey {
    address: String,
    gesture_id: u32,
}

#[derive(Debug)]
struct ActiveGesture {
    pending_move: Option<(SessionId, Publish)>,
    buffered_at: Timestamp,
}

/// Result of feeding one gesture publish through the coalescer
#[derive(Debug)]
pub enum GestureAction {
    /// Forward these publishes now, in order
    Forward(Vec<(SessionId, Publish)>),
    /// Buffered; a flush deadline of `due` microseconds is pending
    Buffered { due: Timestamp },
}

/// Coalesces gesture moves. Owned by the dispatcher task.
pub struct GestureCoalescer {
    active: HashMap<GestureKey, ActiveGesture>,
    interval_us: u64,
}

impl GestureCoalescer {
    /// `interval_ms` of 0 disables coalescing entirely.
    pub fn new(interval_ms: u64) -> Self {
        Self {
            active: HashMap::new(),
            interval_us: interval_ms * 1000,
        }
    }

    pub fn enabled(&self) -> bool {
        self.interval_us > 0
    }

    pub fn process(
        &mut self,
        publisher: &SessionId,
        publish: Publish,
        now: Timestamp,
    ) -> GestureAction {
        let (Some(phase), Some(gesture_id)) = (publish.phase, publish.gesture_id) else {
            return GestureAction::Forward(vec![(publisher.clone(), publish)]);
        };
        if !self.enabled() {
            return GestureAction::Forward(vec![(publisher.clone(), publish)]);
        }

        let key = GestureKey {
            address: publish.address.clone(),
            gesture_id,
        };

        match phase {
            GesturePhase::Start => {
                self.active.insert(
                    key,
                    ActiveGesture {
                        pending_move: None,
                        buffered_at: now,
                    },
                );
                GestureAction::Forward(vec![(publisher.clone(), publish)])
            }
            GesturePhase::Move => match self.active.get_mut(&key) {
                Some(gesture) => {
                    if gesture.pending_move.is_none() {
                        gesture.buffered_at = now;
                    }
                    gesture.pending_move = Some((publisher.clone(), publish));
                    GestureAction::Buffered {
                        due: gesture.buffered_at + self.interval_us,
                    }
                }
                // Move without a tracked Start passes through
                None => GestureAction::Forward(vec![(publisher.clone(), publish)]),
            },
            GesturePhase::End | GesturePhase::Cancel => {
                let mut out = Vec::with_capacity(2);
                if let Some(gesture) = self.active.remove(&key) {
                    if let Some(pending) = gesture.pending_move {
                        out.push(pending);
                    }
                }
                out.push((publisher.clone(), publish));
                GestureAction::Forward(out)
            }
        }
    }

    /// Drain all buffered moves whose interval has elapsed. Returns the
    /// flushed publishes (with their publishers) and the earliest remaining
    /// deadline.
    pub fn flush_due(&mut self, now: Timestamp) -> (Vec<(SessionId, Publish)>, Option<Timestamp>) {
        let mut out = Vec::new();
        let mut next: Option<Timestamp> = None;

        for gesture in self.active.values_mut() {
            if gesture.pending_move.is_none() {
                continue;
            }
            let due = gesture.buffered_at + self.interval_us;
            if due <= now {
                if let Some(pending) = gesture.pending_move.take() {
                    out.push(pending);
                }
            } else {
                next = Some(next.map_or(due, |cur: Timestamp| cur.min(due)));
            }
        }
        (out, next)
    }

    /// Forget gestures buffered by a closing session; its moves are
    /// discarded, not flushed.
    pub fn drop_session(&mut self, session: &SessionId) {
        for gesture in self.active.values_mut() {
            if gesture
                .pending_move
                .as_ref()
                .map(|(owner, _)| owner == session)
                .unwrap_or(false)
            {
                gesture.pending_move = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clasp_core::{SignalKind, Value};

    fn gesture(address: &str, id: u32, phase: GesturePhase, v: f64) -> Publish {
        Publish {
            address: address.to_string(),
            signal: SignalKind::Gesture,
            payload: Some(Value::Float(v)),
            qos: None,
            timestamp: None,
            gesture_id: Some(id),
            phase: Some(phase),
            keyframes: None,
            loop_: false,
            start_time: None,
        }
    }

    fn sid() -> SessionId {
        "publisher".to_string()
    }

    #[test]
    fn start_forwards_immediately() {
        let mut c = GestureCoalescer::new(16);
        match c.process(&sid(), gesture("/g", 1, GesturePhase::Start, 0.0), 0) {
            GestureAction::Forward(msgs) => assert_eq!(msgs.len(), 1),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn moves_buffer_and_latest_wins() {
        let mut c = GestureCoalescer::new(16);
        c.process(&sid(), gesture("/g", 1, GesturePhase::Start, 0.0), 0);

        assert!(matches!(
            c.process(&sid(), gesture("/g", 1, GesturePhase::Move, 0.1), 1_000),
            GestureAction::Buffered { due: 17_000 }
        ));
        assert!(matches!(
            c.process(&sid(), gesture("/g", 1, GesturePhase::Move, 0.2), 2_000),
            GestureAction::Buffered { .. }
        ));

        // Nothing due before the interval elapses
        let (flushed, next) = c.flush_due(10_000);
        assert!(flushed.is_empty());
        assert_eq!(next, Some(17_000));

        let (flushed, next) = c.flush_due(17_000);
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].1.payload, Some(Value::Float(0.2)));
        assert_eq!(next, None);
    }

    #[test]
    fn end_flushes_pending_move_first() {
        let mut c = GestureCoalescer::new(16);
        c.process(&sid(), gesture("/g", 1, GesturePhase::Start, 0.0), 0);
        c.process(&sid(), gesture("/g", 1, GesturePhase::Move, 0.5), 1_000);

        match c.process(&sid(), gesture("/g", 1, GesturePhase::End, 1.0), 2_000) {
            GestureAction::Forward(msgs) => {
                assert_eq!(msgs.len(), 2);
                assert_eq!(msgs[0].1.phase, Some(GesturePhase::Move));
                assert_eq!(msgs[1].1.phase, Some(GesturePhase::End));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn distinct_ids_do_not_collapse() {
        let mut c = GestureCoalescer::new(16);
        c.process(&sid(), gesture("/g", 1, GesturePhase::Start, 0.0), 0);
        c.process(&sid(), gesture("/g", 2, GesturePhase::Start, 0.0), 0);
        c.process(&sid(), gesture("/g", 1, GesturePhase::Move, 0.1), 1_000);
        c.process(&sid(), gesture("/g", 2, GesturePhase::Move, 0.2), 1_000);

        let (flushed, _) = c.flush_due(20_000);
        assert_eq!(flushed.len(), 2);
    }

    #[test]
    fn drop_session_discards_buffered_moves() {
        let mut c = GestureCoalescer::new(16);
        c.process(&sid(), gesture("/g", 1, GesturePhase::Start, 0.0), 0);
        c.process(&sid(), gesture("/g", 1, GesturePhase::Move, 0.1), 1_000);
        c.drop_session(&sid());
        let (flushed, next) = c.flush_due(20_000);
        assert!(flushed.is_empty());
        assert_eq!(next, None);
    }

    #[test]
    fn disabled_coalescer_passes_moves() {
        let mut c = GestureCoalescer::new(0);
        c.process(&sid(), gesture("/g", 1, GesturePhase::Start, 0.0), 0);
        assert!(matches!(
            c.process(&sid(), gesture("/g", 1, GesturePhase::Move, 0.1), 1),
            GestureAction::Forward(_)
        ));
    }
}
