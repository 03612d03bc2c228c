//! Scheduled execution
//!
//! A single time-ordered heap with one consumer task drives both scheduled
//! bundles and throttle/gesture flush ticks. At each deadline the scheduler
//! posts a command back to the dispatcher; it never touches router state
//! itself.

use clasp_core::{Clock, Message, Timestamp};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::dispatch::Cmd;
use crate::session::SessionId;

#[derive(Debug)]
enum Job {
    Bundle {
        owner: SessionId,
        id: Option<u32>,
        messages: Vec<Message>,
    },
    Flush,
}

#[derive(Debug)]
struct Entry {
    due: Timestamp,
    seq: u64,
    job: Job,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.due, self.seq).cmp(&(other.due, other.seq))
    }
}

#[derive(Debug)]
pub enum SchedCmd {
    Bundle {
        owner: SessionId,
        id: Option<u32>,
        due: Timestamp,
        messages: Vec<Message>,
    },
    CancelBundle {
        owner: SessionId,
        id: u32,
    },
    CancelOwned {
        owner: SessionId,
    },
    FlushAt(Timestamp),
    Shutdown,
}

/// Handle held by the dispatcher and the router.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<SchedCmd>,
}

impl SchedulerHandle {
    pub fn schedule_bundle(
        &self,
        owner: SessionId,
        id: Option<u32>,
        due: Timestamp,
        messages: Vec<Message>,
    ) {
        let _ = self.tx.send(SchedCmd::Bundle {
            owner,
            id,
            due,
            messages,
        });
    }

    /// Idempotent; unknown ids are a silent no-op.
    pub fn cancel_bundle(&self, owner: SessionId, id: u32) {
        let _ = self.tx.send(SchedCmd::CancelBundle { owner, id });
    }

    pub fn cancel_owned(&self, owner: SessionId) {
        let _ = self.tx.send(SchedCmd::CancelOwned { owner });
    }

    pub fn flush_at(&self, due: Timestamp) {
        let _ = self.tx.send(SchedCmd::FlushAt(due));
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(SchedCmd::Shutdown);
    }
}

/// Spawn the scheduler task.
pub fn spawn_scheduler(clock: Clock, dispatch_tx: mpsc::Sender<Cmd>) -> SchedulerHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run(clock, rx, dispatch_tx));
    SchedulerHandle { tx }
}

async fn run(
    clock: Clock,
    mut rx: mpsc::UnboundedReceiver<SchedCmd>,
    dispatch_tx: mpsc::Sender<Cmd>,
) {
    let mut heap: BinaryHeap<Reverse<Entry>> = BinaryHeap::new();
    let mut seq: u64 = 0;
    // At most one flush tick is armed at a time; the dispatcher re-arms
    // with the earliest remaining deadline after every flush.
    let mut armed_flush: Option<Timestamp> = None;

    loop {
        let next_due = heap.peek().map(|e| e.0.due);

        tokio::select! {
            cmd = rx.recv() => {
                match cmd {
                    None | Some(SchedCmd::Shutdown) => break,
                    Some(SchedCmd::Bundle { owner, id, due, messages }) => {
                        seq += 1;
                        trace!(%owner, ?id, due, "bundle scheduled");
                        heap.push(Reverse(Entry { due, seq, job: Job::Bundle { owner, id, messages } }));
                    }
                    Some(SchedCmd::CancelBundle { owner, id }) => {
                        retain(&mut heap, |job| !matches!(job, Job::Bundle { owner: o, id: i, .. } if *o == owner && *i == Some(id)));
                    }
                    Some(SchedCmd::CancelOwned { owner }) => {
                        retain(&mut heap, |job| !matches!(job, Job::Bundle { owner: o, .. } if *o == owner));
                    }
                    Some(SchedCmd::FlushAt(due)) => {
                        if armed_flush.map_or(true, |armed| due < armed) {
                            seq += 1;
                            armed_flush = Some(due);
                            heap.push(Reverse(Entry { due, seq, job: Job::Flush }));
                        }
                    }
                }
            }
            _ = sleep_until(&clock, next_due), if next_due.is_some() => {
                let now = clock.now();
                while heap.peek().map(|e| e.0.due <= now).unwrap_or(false) {
                    let Some(Reverse(entry)) = heap.pop() else { break };
                    match entry.job {
                        Job::Bundle { owner, id, messages } => {
                            debug!(%owner, ?id, "scheduled bundle due");
                            if dispatch_tx.send(Cmd::RunBundle { owner, id, messages }).await.is_err() {
                                return;
                            }
                        }
                        Job::Flush => {
                            armed_flush = None;
                            if dispatch_tx.send(Cmd::FlushThrottled).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        }
    }
}

async fn sleep_until(clock: &Clock, due: Option<Timestamp>) {
    if let Some(due) = due {
        tokio::time::sleep(clock.until(due)).await;
    }
}

fn retain(heap: &mut BinaryHeap<Reverse<Entry>>, keep: impl Fn(&Job) -> bool) {
    let entries: Vec<Reverse<Entry>> = std::mem::take(heap).into_vec();
    heap.extend(entries.into_iter().filter(|e| keep(&e.0.job)));
}
