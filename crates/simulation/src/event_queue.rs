//! Pending events keyed for a total, reproducible order.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::time::Duration;
use tcpsim_core::EventPriority;

/// Position of an event in the queue.
///
/// Sorts on fire time, then on priority class (`Internal` first), then on
/// insertion sequence, so two keys never compare equal.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct EventKey {
    pub time: Duration,
    pub priority: EventPriority,
    /// Queue-wide insertion counter.
    pub sequence: u64,
}

impl Ord for EventKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time
            .cmp(&other.time)
            .then_with(|| self.priority.cmp(&other.priority))
            .then_with(|| self.sequence.cmp(&other.sequence))
    }
}

impl PartialOrd for EventKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Handle to a scheduled event, used for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle(EventKey);

impl EventHandle {
    /// Time the event is scheduled for.
    pub fn time(&self) -> Duration {
        self.0.time
    }
}

/// Timestamped events, popped in key order.
#[derive(Debug)]
pub struct EventQueue<E> {
    events: BTreeMap<EventKey, E>,
    sequence: u64,
}

impl<E> Default for EventQueue<E> {
    fn default() -> Self {
        Self {
            events: BTreeMap::new(),
            sequence: 0,
        }
    }
}

impl<E> EventQueue<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an event. Later insertions sort after earlier ones with the
    /// same time and priority.
    pub fn push(&mut self, time: Duration, priority: EventPriority, event: E) -> EventHandle {
        self.sequence += 1;
        let key = EventKey {
            time,
            priority,
            sequence: self.sequence,
        };
        self.events.insert(key, event);
        EventHandle(key)
    }

    /// Remove and return the earliest event.
    pub fn pop(&mut self) -> Option<(EventKey, E)> {
        self.events.pop_first()
    }

    /// Time of the earliest event.
    pub fn peek_time(&self) -> Option<Duration> {
        self.events.first_key_value().map(|(key, _)| key.time)
    }

    /// Withdraw a pending event. Returns `None` if it already fired or was
    /// cancelled.
    pub fn remove(&mut self, handle: EventHandle) -> Option<E> {
        self.events.remove(&handle.0)
    }

    pub fn contains(&self, handle: EventHandle) -> bool {
        self.events.contains_key(&handle.0)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
