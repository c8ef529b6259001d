//! Simulation clock and event queue.
//!
//! A min-heap of events keyed by `(time, priority, sequence)`: earlier times
//! first, then higher priority, then FIFO by insertion sequence. Cancellation
//! is tombstoning — [`SimulationClock::pop_next`] silently discards any event
//! cancelled before it reached the head of the queue, for every event kind.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use bevy_ecs::prelude::Resource;
use serde::{Deserialize, Serialize};

use crate::ecs::{TripId, VehicleId};

pub const ONE_SEC_MS: u64 = 1000;

/// Every event kind the kernel processes. One system per kind reacts to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    PassengerRelease,
    PassengerAssignment,
    PassengerReady,
    PassengerBoard,
    PassengerAlight,
    VehicleRelease,
    VehicleBoarding,
    VehicleDeparture,
    VehicleArrival,
    VehicleNotification,
    Optimize,
    Hold,
    EnvironmentUpdate,
    EnvironmentIdle,
}

/// Tie-break within a single timestamp. Declaration order is pop order:
/// `High` events at a timestamp run before `Standard`, then `Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EventPriority {
    High,
    Standard,
    Low,
}

impl EventKind {
    /// Default priority for this kind.
    ///
    /// Merge events run before anything else queued at the same instant so
    /// dispatch results land first; `Optimize` and `EnvironmentIdle` run last
    /// so a cycle starting at time T sees every state change made at T.
    pub fn default_priority(self) -> EventPriority {
        match self {
            EventKind::PassengerAssignment
            | EventKind::PassengerBoard
            | EventKind::PassengerAlight
            | EventKind::VehicleNotification
            | EventKind::EnvironmentUpdate
            | EventKind::Hold => EventPriority::High,
            EventKind::Optimize | EventKind::EnvironmentIdle => EventPriority::Low,
            _ => EventPriority::Standard,
        }
    }
}

/// The entity (or partition subset) an event is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventSubject {
    Trip(TripId),
    Vehicle(VehicleId),
    Subset(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub time: u64,
    pub kind: EventKind,
    pub priority: EventPriority,
    pub subject: Option<EventSubject>,
    /// Monotonic insertion index; FIFO tie-break at equal (time, priority).
    pub sequence: u64,
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering to make BinaryHeap a min-heap by (time, priority, sequence).
        other
            .time
            .cmp(&self.time)
            .then_with(|| other.priority.cmp(&self.priority))
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The event currently being processed; inserted by the runner before each
/// schedule pass so `run_if` conditions can gate systems on the event kind.
#[derive(Debug, Clone, Copy, Resource)]
pub struct CurrentEvent(pub Event);

#[derive(Debug, Default, Clone, Resource, Serialize, Deserialize)]
pub struct SimulationClock {
    now: u64,
    sequence: u64,
    events: BinaryHeap<Event>,
    /// Sequence numbers of cancelled (tombstoned) events still in the heap.
    cancelled: HashSet<u64>,
}

impl SimulationClock {
    pub fn now(&self) -> u64 {
        self.now
    }

    /// Advance the clock; simulated time never moves backwards.
    pub fn advance_to(&mut self, time: u64) {
        if time > self.now {
            self.now = time;
        }
    }

    /// Schedule an event at an absolute time with the kind's default priority.
    /// Returns the event's sequence number.
    pub fn schedule_at(
        &mut self,
        time: u64,
        kind: EventKind,
        subject: Option<EventSubject>,
    ) -> u64 {
        self.schedule_at_with_priority(time, kind, subject, kind.default_priority())
    }

    pub fn schedule_at_with_priority(
        &mut self,
        time: u64,
        kind: EventKind,
        subject: Option<EventSubject>,
        priority: EventPriority,
    ) -> u64 {
        let sequence = self.sequence;
        self.sequence += 1;
        self.events.push(Event {
            time,
            kind,
            priority,
            subject,
            sequence,
        });
        sequence
    }

    /// Schedule an event `delta` ms from now.
    pub fn schedule_in(&mut self, delta: u64, kind: EventKind, subject: Option<EventSubject>) -> u64 {
        self.schedule_at(self.now + delta, kind, subject)
    }

    pub fn schedule_in_secs(
        &mut self,
        secs: u64,
        kind: EventKind,
        subject: Option<EventSubject>,
    ) -> u64 {
        self.schedule_in(secs * ONE_SEC_MS, kind, subject)
    }

    /// Drop tombstoned events sitting at the head of the heap.
    fn skim(&mut self) {
        while let Some(top) = self.events.peek() {
            if self.cancelled.remove(&top.sequence) {
                self.events.pop();
            } else {
                break;
            }
        }
    }

    /// Pop the next live event. Cancelled events are discarded unprocessed.
    /// Does not advance the clock; the driver loop owns time progression.
    pub fn pop_next(&mut self) -> Option<Event> {
        self.skim();
        self.events.pop()
    }

    /// Peek the next live event without removing it.
    pub fn peek_next(&mut self) -> Option<&Event> {
        self.skim();
        self.events.peek()
    }

    pub fn next_event_time(&mut self) -> Option<u64> {
        self.peek_next().map(|e| e.time)
    }

    fn matches(event: &Event, kind: EventKind, time: Option<u64>, subject: Option<EventSubject>) -> bool {
        event.kind == kind
            && time.map_or(true, |t| event.time == t)
            && subject.map_or(true, |s| event.subject == Some(s))
    }

    /// Is a live event of this kind queued, optionally at an exact time and/or
    /// addressed to a specific subject?
    pub fn is_in_queue(
        &self,
        kind: EventKind,
        time: Option<u64>,
        subject: Option<EventSubject>,
    ) -> bool {
        self.events
            .iter()
            .any(|e| !self.cancelled.contains(&e.sequence) && Self::matches(e, kind, time, subject))
    }

    /// Tombstone every live event matching the predicate; returns how many.
    pub fn cancel(
        &mut self,
        kind: EventKind,
        time: Option<u64>,
        subject: Option<EventSubject>,
    ) -> usize {
        let matched: Vec<u64> = self
            .events
            .iter()
            .filter(|e| !self.cancelled.contains(&e.sequence) && Self::matches(e, kind, time, subject))
            .map(|e| e.sequence)
            .collect();
        let count = matched.len();
        self.cancelled.extend(matched);
        count
    }

    /// Number of live (non-tombstoned) events in the queue.
    pub fn pending_event_count(&self) -> usize {
        self.events.len() - self.cancelled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending_event_count() == 0
    }
}
