//! Single-threaded reactor driving the probe state machine.
//!
//! All state transitions happen on one logical thread: the connection
//! reader and the sink threads never touch session state directly, they
//! only push [`Event`]s into the queue. [`Reactor::wait`] returns exactly
//! one wakeup at a time (an event or a due timer), so command results,
//! frame arrivals, and timer fires are strictly serialized and can never
//! interleave with a mid-flight state mutation.
//!
//! Timers are keyed by [`TimerKind`] with at most one outstanding instance
//! per kind: arming a kind supersedes any previous instance, and cancelled
//! or superseded heap entries are skipped when they surface. A cancelled
//! timer is therefore guaranteed not to fire.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};

use crate::session::SubsessionId;
use crate::transport::{CommandKind, CommandOutcome};

/// An occurrence delivered into the dispatch loop.
#[derive(Debug)]
pub enum Event {
    /// An issued RTSP command resolved.
    CommandResult {
        command: CommandKind,
        outcome: CommandOutcome,
    },
    /// A media frame arrived for a subsession (payload already discarded).
    Frame {
        subsession: SubsessionId,
        bytes: usize,
    },
    /// A subsession's data flow ended (source closed or receive error).
    SubsessionFinished(SubsessionId),
    /// An RTCP BYE arrived for a subsession.
    SubsessionBye(SubsessionId),
    /// The control connection reader thread died.
    TransportClosed { reason: String },
}

/// The two timer slots the probe uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimerKind {
    /// Recurring 10s check that frames are still arriving.
    Liveness,
    /// One-shot end-of-expected-duration timer.
    StreamDuration,
}

/// What [`Reactor::wait`] woke up for.
#[derive(Debug)]
pub enum Wake {
    Event(Event),
    Timer(TimerKind),
}

/// Cloneable handle for pushing events into the reactor from other threads.
#[derive(Clone)]
pub struct EventSender(mpsc::Sender<Event>);

impl EventSender {
    /// Deliver an event. Silently dropped if the dispatch loop has exited.
    pub fn send(&self, event: Event) {
        if self.0.send(event).is_err() {
            tracing::trace!("event dropped, reactor gone");
        }
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct TimerEntry {
    deadline: Instant,
    id: u64,
    kind: TimerKind,
}

/// Event queue plus timer heap, owned by the probe client.
pub struct Reactor {
    tx: mpsc::Sender<Event>,
    rx: mpsc::Receiver<Event>,
    timers: BinaryHeap<Reverse<TimerEntry>>,
    /// Currently armed entry id per kind. A heap entry whose id is no
    /// longer registered here is stale and gets skipped.
    armed: HashMap<TimerKind, u64>,
    next_id: u64,
}

impl Reactor {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Reactor {
            tx,
            rx,
            timers: BinaryHeap::new(),
            armed: HashMap::new(),
            next_id: 0,
        }
    }

    /// Returns a sender for reader/sink threads (and tests) to deliver events.
    pub fn sender(&self) -> EventSender {
        EventSender(self.tx.clone())
    }

    /// Arm (or rearm) a timer. Any previous instance of the same kind is
    /// superseded and will not fire.
    pub fn arm(&mut self, kind: TimerKind, delay: Duration) {
        self.next_id += 1;
        let id = self.next_id;
        self.armed.insert(kind, id);
        self.timers.push(Reverse(TimerEntry {
            deadline: Instant::now() + delay,
            id,
            kind,
        }));
        tracing::trace!(?kind, ?delay, "timer armed");
    }

    /// Cancel a timer kind. No-op when not armed.
    pub fn cancel(&mut self, kind: TimerKind) {
        if self.armed.remove(&kind).is_some() {
            tracing::trace!(?kind, "timer cancelled");
        }
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.armed.contains_key(&kind)
    }

    /// Block until the next event arrives or the earliest armed timer is
    /// due, and return exactly one wakeup. Events that arrive before a
    /// deadline win; a due timer wins over later events.
    pub fn wait(&mut self) -> Wake {
        loop {
            // Drop stale (cancelled or superseded) heap entries.
            while let Some(Reverse(entry)) = self.timers.peek() {
                if self.armed.get(&entry.kind) == Some(&entry.id) {
                    break;
                }
                self.timers.pop();
            }

            let deadline = self.timers.peek().map(|Reverse(entry)| entry.deadline);

            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if deadline <= now {
                        // peek above guaranteed a live entry at the top
                        if let Some(Reverse(entry)) = self.timers.pop() {
                            self.armed.remove(&entry.kind);
                            return Wake::Timer(entry.kind);
                        }
                        continue;
                    }
                    match self.rx.recv_timeout(deadline - now) {
                        Ok(event) => return Wake::Event(event),
                        Err(RecvTimeoutError::Timeout) => continue,
                        // The reactor keeps its own sender alive, so the
                        // channel can never disconnect.
                        Err(RecvTimeoutError::Disconnected) => {
                            unreachable!("reactor holds an event sender")
                        }
                    }
                }
                None => match self.rx.recv() {
                    Ok(event) => return Wake::Event(event),
                    Err(_) => unreachable!("reactor holds an event sender"),
                },
            }
        }
    }
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new()
    }
}
