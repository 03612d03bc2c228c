//! The dispatcher
//!
//! A single consumer task owns the state store, the subscription index, the
//! announce registry, and the gesture coalescer. Session I/O tasks post
//! decoded messages here; timers post bundle deadlines, throttle flushes,
//! and TTL sweeps. Because every mutation and every fan-out enqueue happens
//! on this one task, per-address write ordering, snapshot atomicity, and
//! bundle atomicity are structural rather than locked for. Nothing on the
//! write path suspends: deliveries go into per-session outboxes and the
//! persistence hook into a bounded queue.

use bytes::Bytes;
use clasp_core::{
    codec, Ack, Address, Bundle, Clock, Easing, ErrorInfo, ErrorKind, Get, Message, ParamSnapshot,
    Publish, QoS, Query, QueryResult, Set, SignalInfo, SignalKind, Snapshot, Subscribe, Sync,
    Timestamp, Unsubscribe, Value,
};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::config::RouterConfig;
use crate::gesture::{GestureAction, GestureCoalescer};
use crate::hooks::{Authorizer, ParamRecord, PersistenceHandle};
use crate::session::{DeliveryClass, EnqueueOutcome, OutboundFrame, Session, SessionId};
use crate::store::{ParamStore, WriteRequest};
use crate::subscription::{Gate, Subscription, SubscriptionIndex};

/// Commands consumed by the dispatcher task
#[derive(Debug)]
pub enum Cmd {
    Inbound {
        session_id: SessionId,
        message: Message,
    },
    SessionClosed {
        session_id: SessionId,
    },
    RunBundle {
        owner: SessionId,
        id: Option<u32>,
        messages: Vec<Message>,
    },
    FlushThrottled,
    SweepTtl,
    Stop,
}

/// How a terminated session's queued frames are handled
#[derive(Debug, Clone, Copy)]
enum Teardown {
    /// Let the writer drain what is already queued
    Drain,
    /// Discard the queue (slow consumer)
    Discard,
}

enum Note {
    Param(ParamSnapshot),
    Publish {
        publisher: SessionId,
        publish: Publish,
    },
}

pub(crate) struct Dispatcher {
    config: RouterConfig,
    clock: Clock,
    sessions: Arc<DashMap<SessionId, Arc<Session>>>,
    store: ParamStore,
    index: SubscriptionIndex,
    registry: HashMap<String, SignalInfo>,
    gestures: GestureCoalescer,
    scheduler: crate::schedule::SchedulerHandle,
    authorizer: Arc<dyn Authorizer>,
    persistence: PersistenceHandle,
    draining: Arc<AtomicBool>,
    sub_count: Arc<AtomicUsize>,
    param_count: Arc<AtomicUsize>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: RouterConfig,
        clock: Clock,
        sessions: Arc<DashMap<SessionId, Arc<Session>>>,
        scheduler: crate::schedule::SchedulerHandle,
        authorizer: Arc<dyn Authorizer>,
        persistence: PersistenceHandle,
        draining: Arc<AtomicBool>,
        sub_count: Arc<AtomicUsize>,
        param_count: Arc<AtomicUsize>,
    ) -> Self {
        let store = ParamStore::new(config.max_params, config.eviction);
        let gestures = GestureCoalescer::new(config.gesture_coalesce_ms);
        Self {
            config,
            clock,
            sessions,
            store,
            index: SubscriptionIndex::new(),
            registry: HashMap::new(),
            gestures,
            scheduler,
            authorizer,
            persistence,
            draining,
            sub_count,
            param_count,
        }
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<Cmd>) {
        debug!("dispatcher running");
        while let Some(cmd) = rx.recv().await {
            match cmd {
                Cmd::Inbound {
                    session_id,
                    message,
                } => self.handle_inbound(&session_id, message),
                Cmd::SessionClosed { session_id } => {
                    self.terminate(&session_id, Teardown::Drain);
                }
                Cmd::RunBundle {
                    owner,
                    id,
                    messages,
                } => self.execute_bundle(&owner, id, messages, QoS::Commit),
                Cmd::FlushThrottled => self.flush_throttled(),
                Cmd::SweepTtl => {
                    let evicted = self.store.sweep_ttl(self.clock.now());
                    if !evicted.is_empty() {
                        debug!(count = evicted.len(), "ttl sweep evicted params");
                    }
                    self.param_count.store(self.store.len(), Ordering::Relaxed);
                }
                Cmd::Stop => break,
            }
        }
        info!("dispatcher stopped");
    }

    fn handle_inbound(&mut self, session_id: &SessionId, message: Message) {
        let Some(session) = self.session(session_id) else {
            trace!(%session_id, "message from unknown session dropped");
            return;
        };

        match message {
            Message::Ping => self.send_control(&session, &Message::Pong),
            Message::Pong => {}
            Message::Sync(sync) => self.handle_sync(&session, sync),
            Message::Set(set) => self.handle_set(&session, set),
            Message::Get(get) => self.handle_get(&session, get),
            Message::Subscribe(sub) => self.handle_subscribe(&session, sub),
            Message::Unsubscribe(unsub) => self.handle_unsubscribe(&session, unsub),
            Message::Publish(publish) => self.handle_publish(&session, publish),
            Message::Bundle(bundle) => self.handle_bundle(&session, bundle),
            Message::Announce(announce) => self.handle_announce(&session, announce),
            Message::Query(query) => self.handle_query(&session, query),
            Message::Hello(_) => {
                self.send_error(&session, ErrorKind::InvalidHandshake, Some("session already active".into()), None);
            }
            other => {
                trace!(%session_id, kind = other.type_name(), "ignoring server-bound message");
            }
        }
    }

    // ------------------------------------------------------------------
    // SET / GET
    // ------------------------------------------------------------------

    fn handle_set(&mut self, session: &Arc<Session>, set: Set) {
        let address = set.address.clone();
        if self.draining.load(Ordering::Acquire) {
            self.send_error(session, ErrorKind::Unavailable, Some("draining".into()), Some(address));
            return;
        }
        if !self.persistence.available() {
            self.send_error(
                session,
                ErrorKind::Unavailable,
                Some("persistence unavailable".into()),
                Some(address),
            );
            return;
        }
        if let Err(e) = Address::parse(&address) {
            self.send_error(session, ErrorKind::InvalidAddress, Some(e.to_string()), Some(address));
            return;
        }
        if !self
            .authorizer
            .check_write(&session.scopes, &address, &set.value)
        {
            self.send_error(session, ErrorKind::PermissionDenied, None, Some(address));
            return;
        }

        let now = self.clock.now();
        let qos = set.qos();
        let req = WriteRequest {
            address: address.clone(),
            value: set.value,
            writer: session.id.clone(),
            precondition: set.revision,
            lock: set.lock,
            unlock: set.unlock,
            strategy: set.strategy,
            meta: set.meta,
            origin: None,
            ttl: self.param_ttl(),
        };

        match self.store.apply(req, now) {
            Err(e) => {
                self.send_error(session, e.kind(), Some(e.describe()), Some(address));
            }
            Ok(_applied) => {
                self.param_count.store(self.store.len(), Ordering::Relaxed);
                if set.lock {
                    session.note_lock(&address, true);
                } else if set.unlock {
                    session.note_lock(&address, false);
                }

                let snap = match self.store.peek(&address) {
                    Some(entry) => entry.snapshot(&address),
                    None => return,
                };
                let accepted = self.persistence.enqueue(ParamRecord {
                    address: address.clone(),
                    value: snap.value.clone(),
                    revision: snap.revision,
                    writer: snap.writer.clone(),
                    timestamp: snap.timestamp,
                });

                self.fanout_param(&snap);

                // Commit additionally requires the record to be durably
                // accepted when persistence is configured
                let ack_ok = qos < QoS::Commit || accepted || !self.persistence.configured();
                if qos >= QoS::Confirm && ack_ok {
                    let revision = snap.revision;
                    self.send_control(
                        session,
                        &Message::Ack(Ack {
                            address: Some(address),
                            revision: Some(revision),
                            bundle_id: None,
                        }),
                    );
                }
            }
        }
    }

    fn handle_get(&mut self, session: &Arc<Session>, get: Get) {
        let now = self.clock.now();
        match self.store.get(&get.address, now) {
            Some(entry) => {
                let msg = Message::Value(entry.snapshot(&get.address));
                self.send_control(session, &msg);
            }
            None => {
                self.send_error(session, ErrorKind::NotFound, None, Some(get.address));
            }
        }
    }

    // ------------------------------------------------------------------
    // SUBSCRIBE / UNSUBSCRIBE
    // ------------------------------------------------------------------

    fn handle_subscribe(&mut self, session: &Arc<Session>, sub: Subscribe) {
        let pattern = match clasp_core::Pattern::parse(&sub.pattern) {
            Ok(p) => p,
            Err(e) => {
                self.send_error(
                    session,
                    ErrorKind::InvalidPattern,
                    Some(e.to_string()),
                    Some(sub.pattern),
                );
                return;
            }
        };
        if !self.authorizer.check_subscribe(&session.scopes, &pattern) {
            self.send_error(session, ErrorKind::PermissionDenied, None, Some(sub.pattern));
            return;
        }

        let now = self.clock.now();
        // The snapshot and the registration happen in the same dispatcher
        // step, so no write can interleave between them: the subscriber
        // sees every revision above its snapshot exactly once.
        let params = self.store.collect_matching(&pattern, now);

        let mut subscription = Subscription::new(
            session.id.clone(),
            sub.id,
            pattern,
            sub.max_rate,
            sub.epsilon,
        );
        for p in &params {
            subscription.note_snapshot(&p.address, p.value.as_f64(), p.revision);
        }
        self.index.add(subscription);
        self.sub_count.store(self.index.len(), Ordering::Relaxed);
        session.add_subscription(sub.id);

        debug!(session = %session.id, id = sub.id, count = params.len(), "subscription registered");
        self.send_control(session, &Message::Snapshot(Snapshot { params }));
    }

    fn handle_unsubscribe(&mut self, session: &Arc<Session>, unsub: Unsubscribe) {
        self.index.remove(&(session.id.clone(), unsub.id));
        self.sub_count.store(self.index.len(), Ordering::Relaxed);
        session.remove_subscription(unsub.id);
        // Doubles as scheduled-bundle cancellation; idempotent either way
        self.scheduler.cancel_bundle(session.id.clone(), unsub.id);
    }

    // ------------------------------------------------------------------
    // PUBLISH
    // ------------------------------------------------------------------

    fn handle_publish(&mut self, session: &Arc<Session>, publish: Publish) {
        let address = publish.address.clone();
        if self.draining.load(Ordering::Acquire) {
            self.send_error(session, ErrorKind::Unavailable, Some("draining".into()), Some(address));
            return;
        }
        if let Err(e) = Address::parse(&address) {
            self.send_error(session, ErrorKind::InvalidAddress, Some(e.to_string()), Some(address));
            return;
        }
        let probe = publish.payload.clone().unwrap_or(Value::Null);
        if !self.authorizer.check_write(&session.scopes, &address, &probe) {
            self.send_error(session, ErrorKind::PermissionDenied, None, Some(address));
            return;
        }

        let qos = publish.qos();
        match publish.signal {
            SignalKind::Param => {
                self.send_error(
                    session,
                    ErrorKind::MalformedFrame,
                    Some("param signals are written with SET".into()),
                    Some(address),
                );
            }
            SignalKind::Timeline => self.handle_timeline(session, publish, qos),
            SignalKind::Gesture => {
                let now = self.clock.now();
                match self.gestures.process(&session.id, publish, now) {
                    GestureAction::Forward(list) => {
                        for (publisher, p) in list {
                            self.fanout_publish(&publisher, &p);
                        }
                    }
                    GestureAction::Buffered { due } => {
                        self.scheduler.flush_at(due);
                    }
                }
                if qos >= QoS::Confirm {
                    self.ack_publish(session, address);
                }
            }
            SignalKind::Event | SignalKind::Stream => {
                self.fanout_publish(&session.id, &publish);
                if qos >= QoS::Confirm {
                    self.ack_publish(session, address);
                }
            }
        }
    }

    fn handle_timeline(&mut self, session: &Arc<Session>, publish: Publish, qos: QoS) {
        let address = publish.address.clone();
        if publish.keyframes.is_none() {
            self.send_error(
                session,
                ErrorKind::MalformedFrame,
                Some("timeline publish requires keyframes".into()),
                Some(address),
            );
            return;
        }
        if !self.persistence.available() {
            self.send_error(session, ErrorKind::Unavailable, Some("persistence unavailable".into()), Some(address));
            return;
        }

        let now = self.clock.now();
        let req = WriteRequest {
            address: address.clone(),
            value: timeline_value(&publish),
            writer: session.id.clone(),
            precondition: None,
            lock: false,
            unlock: false,
            strategy: None,
            meta: None,
            origin: None,
            ttl: self.signal_ttl(),
        };
        match self.store.apply(req, now) {
            Err(e) => {
                self.send_error(session, e.kind(), Some(e.describe()), Some(address));
            }
            Ok(applied) => {
                self.param_count.store(self.store.len(), Ordering::Relaxed);
                let accepted = match self.store.peek(&address) {
                    Some(entry) => self.persistence.enqueue(ParamRecord {
                        address: address.clone(),
                        value: entry.value.clone(),
                        revision: entry.revision,
                        writer: entry.writer.clone(),
                        timestamp: entry.timestamp,
                    }),
                    None => true,
                };

                // Subscribers receive the timeline definition itself; the
                // router never interpolates keyframes
                self.fanout_timeline(&session.id, &publish, applied.revision);

                let ack_ok = qos < QoS::Commit || accepted || !self.persistence.configured();
                if qos >= QoS::Confirm && ack_ok {
                    self.send_control(
                        session,
                        &Message::Ack(Ack {
                            address: Some(address),
                            revision: Some(applied.revision),
                            bundle_id: None,
                        }),
                    );
                }
            }
        }
    }

    fn ack_publish(&mut self, session: &Arc<Session>, address: String) {
        self.send_control(
            session,
            &Message::Ack(Ack {
                address: Some(address),
                revision: None,
                bundle_id: None,
            }),
        );
    }

    // ------------------------------------------------------------------
    // BUNDLE
    // ------------------------------------------------------------------

    fn handle_bundle(&mut self, session: &Arc<Session>, bundle: Bundle) {
        if self.draining.load(Ordering::Acquire) {
            self.send_error(session, ErrorKind::Unavailable, Some("draining".into()), None);
            return;
        }

        let now = self.clock.now();
        if let Some(due) = bundle.scheduled_time {
            if due > now {
                let horizon = now + self.config.schedule_horizon_secs * 1_000_000;
                if due > horizon {
                    self.send_error(
                        session,
                        ErrorKind::Unavailable,
                        Some("scheduled_time beyond the schedule horizon".into()),
                        None,
                    );
                    return;
                }
                // Authorization happens now and again at execution; a
                // bundle never schedules if any inner message is denied
                if let Err((kind, detail, address)) =
                    self.precheck_bundle(session, &bundle.messages, false)
                {
                    self.send_error(session, kind, Some(detail), address);
                    return;
                }
                self.scheduler.schedule_bundle(
                    session.id.clone(),
                    bundle.id,
                    due,
                    bundle.messages,
                );
                return;
            }
        }

        let qos = bundle.qos();
        let id = bundle.id;
        self.execute_bundle(&session.id.clone(), id, bundle.messages, qos);
    }

    fn execute_bundle(
        &mut self,
        owner: &SessionId,
        id: Option<u32>,
        messages: Vec<Message>,
        qos: QoS,
    ) {
        // Owner teardown cancels its scheduled bundles; a late RunBundle
        // for a dead owner is a no-op
        let Some(session) = self.session(owner) else {
            return;
        };
        if self.draining.load(Ordering::Acquire) {
            self.send_error(&session, ErrorKind::Unavailable, Some("draining".into()), None);
            return;
        }

        if let Err((kind, detail, address)) = self.precheck_bundle(&session, &messages, true) {
            self.send_error(&session, kind, Some(detail), address);
            return;
        }

        // All inner effects first, then all notifications, in bundle
        // order. Subscribers observe the bundle as a contiguous block.
        let now = self.clock.now();
        let mut notes: Vec<Note> = Vec::with_capacity(messages.len());
        let mut persist_ok = true;

        for msg in messages {
            match msg {
                Message::Set(set) => {
                    let address = set.address.clone();
                    let req = WriteRequest {
                        address: address.clone(),
                        value: set.value,
                        writer: session.id.clone(),
                        precondition: None,
                        lock: set.lock,
                        unlock: set.unlock,
                        strategy: set.strategy,
                        meta: set.meta,
                        origin: None,
                        ttl: self.param_ttl(),
                    };
                    match self.store.apply(req, now) {
                        Ok(_) => {
                            if set.lock {
                                session.note_lock(&address, true);
                            } else if set.unlock {
                                session.note_lock(&address, false);
                            }
                            if let Some(entry) = self.store.peek(&address) {
                                persist_ok &= self.persistence.enqueue(ParamRecord {
                                    address: address.clone(),
                                    value: entry.value.clone(),
                                    revision: entry.revision,
                                    writer: entry.writer.clone(),
                                    timestamp: entry.timestamp,
                                });
                                notes.push(Note::Param(entry.snapshot(&address)));
                            }
                        }
                        Err(e) => {
                            // The preview validated this exact sequence and
                            // nothing else runs between check and apply.
                            // Divergence means the store no longer matches
                            // what was validated; continuing would break
                            // bundle atomicity, so fail fast.
                            panic!(
                                "bundle apply diverged from preview at {address}: {}",
                                e.describe()
                            );
                        }
                    }
                }
                Message::Publish(publish) => match publish.signal {
                    SignalKind::Timeline => {
                        let address = publish.address.clone();
                        let req = WriteRequest {
                            address: address.clone(),
                            value: timeline_value(&publish),
                            writer: session.id.clone(),
                            precondition: None,
                            lock: false,
                            unlock: false,
                            strategy: None,
                            meta: None,
                            origin: None,
                            ttl: self.signal_ttl(),
                        };
                        match self.store.apply(req, now) {
                            Ok(_) => notes.push(Note::Publish {
                                publisher: session.id.clone(),
                                publish,
                            }),
                            Err(e) => panic!(
                                "bundle apply diverged from preview at {address}: {}",
                                e.describe()
                            ),
                        }
                    }
                    _ => notes.push(Note::Publish {
                        publisher: session.id.clone(),
                        publish,
                    }),
                },
                _ => unreachable!("precheck admits only SET and PUBLISH"),
            }
        }
        self.param_count.store(self.store.len(), Ordering::Relaxed);

        for note in &notes {
            match note {
                Note::Param(snap) => self.fanout_param(snap),
                Note::Publish { publisher, publish } => self.fanout_publish(publisher, publish),
            }
        }

        let ack_ok = qos < QoS::Commit || persist_ok || !self.persistence.configured();
        if qos >= QoS::Confirm && ack_ok {
            self.send_control(
                &session,
                &Message::Ack(Ack {
                    address: None,
                    revision: None,
                    bundle_id: id,
                }),
            );
        }
    }

    /// Validate a bundle without touching state. At execution time
    /// (`strict`) every inner write is checked through a store preview
    /// that carries the hypothetical value, revision, lock, and strategy
    /// each predecessor leaves behind, so the apply loop in
    /// [`execute_bundle`](Self::execute_bundle) cannot fail partway. At
    /// scheduling time only addresses and authorization are checked; state
    /// is simulated again when the deadline fires.
    fn precheck_bundle(
        &self,
        session: &Arc<Session>,
        messages: &[Message],
        strict: bool,
    ) -> std::result::Result<(), (ErrorKind, String, Option<String>)> {
        let mut preview = self.store.preview();

        for msg in messages {
            match msg {
                Message::Set(set) => {
                    Address::parse(&set.address).map_err(|e| {
                        (
                            ErrorKind::InvalidAddress,
                            e.to_string(),
                            Some(set.address.clone()),
                        )
                    })?;
                    if !self
                        .authorizer
                        .check_write(&session.scopes, &set.address, &set.value)
                    {
                        return Err((
                            ErrorKind::PermissionDenied,
                            "write denied".to_string(),
                            Some(set.address.clone()),
                        ));
                    }
                    if !strict {
                        continue;
                    }

                    let req = WriteRequest {
                        address: set.address.clone(),
                        value: set.value.clone(),
                        writer: session.id.clone(),
                        precondition: set.revision,
                        lock: set.lock,
                        unlock: set.unlock,
                        strategy: set.strategy,
                        meta: None,
                        origin: None,
                        ttl: None,
                    };
                    preview
                        .check(&req)
                        .map_err(|e| (e.kind(), e.describe(), Some(set.address.clone())))?;
                }
                Message::Publish(publish) => {
                    Address::parse(&publish.address).map_err(|e| {
                        (
                            ErrorKind::InvalidAddress,
                            e.to_string(),
                            Some(publish.address.clone()),
                        )
                    })?;
                    let probe = publish.payload.clone().unwrap_or(Value::Null);
                    if !self
                        .authorizer
                        .check_write(&session.scopes, &publish.address, &probe)
                    {
                        return Err((
                            ErrorKind::PermissionDenied,
                            "publish denied".to_string(),
                            Some(publish.address.clone()),
                        ));
                    }
                    match publish.signal {
                        SignalKind::Param => {
                            return Err((
                                ErrorKind::MalformedFrame,
                                "param signals are written with SET".to_string(),
                                Some(publish.address.clone()),
                            ));
                        }
                        SignalKind::Timeline if publish.keyframes.is_none() => {
                            return Err((
                                ErrorKind::MalformedFrame,
                                "timeline publish requires keyframes".to_string(),
                                Some(publish.address.clone()),
                            ));
                        }
                        SignalKind::Timeline if strict => {
                            let req = WriteRequest {
                                address: publish.address.clone(),
                                value: timeline_value(publish),
                                writer: session.id.clone(),
                                precondition: None,
                                lock: false,
                                unlock: false,
                                strategy: None,
                                meta: None,
                                origin: None,
                                ttl: None,
                            };
                            preview.check(&req).map_err(|e| {
                                (e.kind(), e.describe(), Some(publish.address.clone()))
                            })?;
                        }
                        _ => {}
                    }
                }
                other => {
                    return Err((
                        ErrorKind::MalformedFrame,
                        format!("bundle may not contain {}", other.type_name()),
                        None,
                    ));
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // SYNC / ANNOUNCE / QUERY
    // ------------------------------------------------------------------

    fn handle_sync(&mut self, session: &Arc<Session>, sync: Sync) {
        let t2 = self.clock.now();
        let reply = Message::Sync(Sync {
            t1: sync.t1,
            t2: Some(t2),
            t3: Some(self.clock.now()),
        });
        self.send_control(session, &reply);
    }

    fn handle_announce(&mut self, session: &Arc<Session>, announce: clasp_core::Announce) {
        for signal in announce.signals {
            if Address::parse(&signal.address).is_err() {
                self.send_error(
                    session,
                    ErrorKind::InvalidAddress,
                    None,
                    Some(signal.address),
                );
                continue;
            }
            if !self
                .authorizer
                .check_write(&session.scopes, &signal.address, &Value::Null)
            {
                self.send_error(
                    session,
                    ErrorKind::PermissionDenied,
                    None,
                    Some(signal.address),
                );
                continue;
            }
            trace!(address = %signal.address, "signal announced");
            self.registry.insert(signal.address.clone(), signal);
        }
    }

    fn handle_query(&mut self, session: &Arc<Session>, query: Query) {
        let pattern = match clasp_core::Pattern::parse(&query.pattern) {
            Ok(p) => p,
            Err(e) => {
                self.send_error(
                    session,
                    ErrorKind::InvalidPattern,
                    Some(e.to_string()),
                    Some(query.pattern),
                );
                return;
            }
        };
        let mut signals: Vec<SignalInfo> = self
            .registry
            .values()
            .filter(|s| pattern.matches(&s.address))
            .cloned()
            .collect();
        signals.sort_by(|a, b| a.address.cmp(&b.address));
        self.send_control(session, &Message::Result(QueryResult { signals }));
    }

    // ------------------------------------------------------------------
    // Fan-out
    // ------------------------------------------------------------------

    fn fanout_param(&mut self, snap: &ParamSnapshot) {
        let bytes = match codec::encode_payload(&Message::Value(snap.clone())) {
            Ok(b) => Bytes::from(b),
            Err(e) => {
                error!("encode failed for param fan-out: {e}");
                return;
            }
        };
        self.fanout(
            &snap.address,
            Some(snap.revision),
            snap.value.as_f64(),
            DeliveryClass::Control,
            None,
            bytes,
            None,
        );
    }

    fn fanout_publish(&mut self, publisher: &SessionId, publish: &Publish) {
        let bytes = match codec::encode_payload(&Message::Publish(publish.clone())) {
            Ok(b) => Bytes::from(b),
            Err(e) => {
                error!("encode failed for publish fan-out: {e}");
                return;
            }
        };
        let class = match publish.signal {
            SignalKind::Event => DeliveryClass::Event,
            SignalKind::Stream => DeliveryClass::Stream,
            SignalKind::Gesture => DeliveryClass::Gesture,
            SignalKind::Param | SignalKind::Timeline => DeliveryClass::Control,
        };
        let gesture = publish
            .gesture_id
            .map(|id| (id, publish.phase == Some(clasp_core::GesturePhase::Move)));
        let numeric = publish.payload.as_ref().and_then(|v| v.as_f64());
        self.fanout(
            &publish.address,
            None,
            numeric,
            class,
            gesture,
            bytes,
            Some(publisher),
        );
    }

    fn fanout_timeline(&mut self, publisher: &SessionId, publish: &Publish, revision: u64) {
        let bytes = match codec::encode_payload(&Message::Publish(publish.clone())) {
            Ok(b) => Bytes::from(b),
            Err(e) => {
                error!("encode failed for timeline fan-out: {e}");
                return;
            }
        };
        self.fanout(
            &publish.address,
            Some(revision),
            None,
            DeliveryClass::Control,
            None,
            bytes,
            Some(publisher),
        );
    }

    /// The shared fan-out core: consult the index, gate per subscription,
    /// enqueue or stash. Failures of one subscriber never propagate to the
    /// writer or to other subscribers.
    #[allow(clippy::too_many_arguments)]
    fn fanout(
        &mut self,
        address: &str,
        revision: Option<u64>,
        numeric: Option<f64>,
        class: DeliveryClass,
        gesture: Option<(u32, bool)>,
        bytes: Bytes,
        exclude: Option<&SessionId>,
    ) {
        let keys = self.index.matching(address);
        if keys.is_empty() {
            return;
        }

        let now = self.clock.now();
        let slow_after = Duration::from_secs(self.config.slow_consumer_timeout_secs);
        let mut slow: Vec<SessionId> = Vec::new();
        let mut next_flush: Option<Timestamp> = None;

        for key in keys {
            if exclude == Some(&key.0) {
                continue;
            }
            let frame = OutboundFrame {
                class,
                address: Some(address.to_string()),
                gesture_id: gesture.map(|g| g.0),
                gesture_move: gesture.map(|g| g.1).unwrap_or(false),
                bytes: bytes.clone(),
            };

            let deliver = match self.index.get_mut(&key) {
                Some(sub) => match sub.gate(address, numeric, revision, now) {
                    Gate::Skip => None,
                    Gate::Deliver => {
                        sub.note_delivered(address, numeric, revision, now);
                        Some(frame)
                    }
                    Gate::Defer { open_at } => {
                        sub.stash(address, frame, numeric, revision);
                        next_flush = Some(next_flush.map_or(open_at, |cur| cur.min(open_at)));
                        None
                    }
                },
                None => None,
            };

            if let Some(frame) = deliver {
                if let Some(target) = self.sessions.get(&key.0).map(|e| e.value().clone()) {
                    if let EnqueueOutcome::Overflow(since) = target.enqueue(frame) {
                        if since.elapsed() >= slow_after {
                            slow.push(key.0.clone());
                        }
                    }
                }
            }
        }

        if let Some(due) = next_flush {
            self.scheduler.flush_at(due);
        }
        for session_id in slow {
            warn!(session = %session_id, "closing slow consumer");
            self.terminate(&session_id, Teardown::Discard);
        }
    }

    fn flush_throttled(&mut self) {
        let now = self.clock.now();
        let slow_after = Duration::from_secs(self.config.slow_consumer_timeout_secs);
        let mut slow: Vec<SessionId> = Vec::new();

        let (deliveries, next_sub) = self.index.flush_due(now);
        for (session_id, frame) in deliveries {
            if let Some(target) = self.sessions.get(&session_id).map(|e| e.value().clone()) {
                if let EnqueueOutcome::Overflow(since) = target.enqueue(frame) {
                    if since.elapsed() >= slow_after {
                        slow.push(session_id);
                    }
                }
            }
        }

        let (gestures, next_gesture) = self.gestures.flush_due(now);
        for (publisher, publish) in gestures {
            self.fanout_publish(&publisher, &publish);
        }

        let next = match (next_sub, next_gesture) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        if let Some(due) = next {
            self.scheduler.flush_at(due);
        }
        for session_id in slow {
            warn!(session = %session_id, "closing slow consumer");
            self.terminate(&session_id, Teardown::Discard);
        }
    }

    // ------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------

    fn terminate(&mut self, session_id: &SessionId, teardown: Teardown) {
        let Some((_, session)) = self.sessions.remove(session_id) else {
            return;
        };
        let removed = self.index.remove_session(session_id);
        self.sub_count.store(self.index.len(), Ordering::Relaxed);

        // Lock release is silent: absence of a write is absence of an event
        let released = self.store.release_locks_of(session_id);
        self.gestures.drop_session(session_id);
        self.scheduler.cancel_owned(session_id.clone());

        match teardown {
            Teardown::Drain => session.outbox().close(),
            Teardown::Discard => session.outbox().close_discard(),
        }
        info!(
            session = %session_id,
            name = %session.name,
            subscriptions = removed,
            locks = released.len(),
            "session terminated"
        );
    }

    // ------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------

    fn session(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|e| e.value().clone())
    }

    fn send_control(&mut self, session: &Arc<Session>, message: &Message) {
        match codec::encode_payload(message) {
            Ok(bytes) => {
                let outcome = session.enqueue(OutboundFrame::control(Bytes::from(bytes)));
                if let EnqueueOutcome::Overflow(since) = outcome {
                    if since.elapsed() >= Duration::from_secs(self.config.slow_consumer_timeout_secs)
                    {
                        warn!(session = %session.id, "closing slow consumer");
                        self.terminate(&session.id.clone(), Teardown::Discard);
                    }
                }
            }
            Err(e) => error!("encode failed for {}: {e}", message.type_name()),
        }
    }

    fn send_error(
        &mut self,
        session: &Arc<Session>,
        kind: ErrorKind,
        detail: Option<String>,
        address: Option<String>,
    ) {
        debug!(session = %session.id, code = kind.code(), ?address, "sending error");
        let info = match detail {
            Some(detail) => ErrorInfo::with_message(kind, detail, address),
            None => ErrorInfo::new(kind, address),
        };
        self.send_control(session, &Message::Error(info));
    }

    fn param_ttl(&self) -> Option<u64> {
        (!self.config.no_ttl && self.config.param_ttl_secs > 0)
            .then(|| self.config.param_ttl_secs * 1_000_000)
    }

    fn signal_ttl(&self) -> Option<u64> {
        (!self.config.no_ttl && self.config.signal_ttl_secs > 0)
            .then(|| self.config.signal_ttl_secs * 1_000_000)
    }
}

/// The stored representation of a timeline: subscribers that join late get
/// the definition through the ordinary snapshot path.
fn timeline_value(publish: &Publish) -> Value {
    let mut map = HashMap::new();
    let keyframes: Vec<Value> = publish
        .keyframes
        .as_deref()
        .unwrap_or_default()
        .iter()
        .map(|kf| {
            let mut entry = HashMap::new();
            entry.insert("time".to_string(), Value::Int(kf.time as i64));
            entry.insert("value".to_string(), kf.value.clone());
            entry.insert(
                "easing".to_string(),
                Value::String(easing_name(kf.easing).to_string()),
            );
            Value::Map(entry)
        })
        .collect();
    map.insert("keyframes".to_string(), Value::Array(keyframes));
    map.insert("loop".to_string(), Value::Bool(publish.loop_));
    if let Some(start) = publish.start_time {
        map.insert("start_time".to_string(), Value::Int(start as i64));
    }
    Value::Map(map)
}

fn easing_name(easing: Easing) -> &'static str {
    match easing {
        Easing::Linear => "linear",
        Easing::EaseIn => "ease-in",
        Easing::EaseOut => "ease-out",
        Easing::EaseInOut => "ease-in-out",
        Easing::Step => "step",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clasp_core::Keyframe;

    #[test]
    fn timeline_value_shape() {
        let publish = Publish {
            address: "/anim".into(),
            signal: SignalKind::Timeline,
            payload: None,
            qos: None,
            timestamp: None,
            gesture_id: None,
            phase: None,
            keyframes: Some(vec![Keyframe {
                time: 1000,
                value: Value::Float(0.5),
                easing: Easing::EaseOut,
            }]),
            loop_: true,
            start_time: Some(42),
        };
        let value = timeline_value(&publish);
        let Value::Map(map) = value else {
            panic!("expected map");
        };
        assert_eq!(map.get("loop"), Some(&Value::Bool(true)));
        assert_eq!(map.get("start_time"), Some(&Value::Int(42)));
        let Some(Value::Array(kfs)) = map.get("keyframes") else {
            panic!("expected keyframes array");
        };
        assert_eq!(kfs.len(), 1);
    }
}
