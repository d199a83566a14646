//! Virtual clock plus event queue.

use crate::error::SchedulingError;
use crate::event_queue::{EventHandle, EventQueue};
use std::time::Duration;
use tcpsim_core::{Event, EventPriority};
use tracing::trace;

/// Events that carry their own same-instant priority class.
pub trait Prioritized {
    fn priority(&self) -> EventPriority;
}

impl Prioritized for Event {
    fn priority(&self) -> EventPriority {
        Event::priority(self)
    }
}

/// Scheduler counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Events inserted.
    pub scheduled: u64,
    /// Events popped and handed out for dispatch.
    pub dispatched: u64,
    /// Events withdrawn before firing.
    pub cancelled: u64,
}

/// Single-threaded discrete-event scheduler.
///
/// Time only moves forward: it jumps to each dispatched event's time and
/// nothing can be scheduled before it.
#[derive(Debug)]
pub struct Scheduler<E> {
    queue: EventQueue<E>,
    now: Duration,
    stats: SchedulerStats,
}

impl<E> Default for Scheduler<E> {
    fn default() -> Self {
        Self {
            queue: EventQueue::new(),
            now: Duration::ZERO,
            stats: SchedulerStats::default(),
        }
    }
}

impl<E: Prioritized> Scheduler<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current simulated time.
    pub fn now(&self) -> Duration {
        self.now
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    /// Events waiting to fire.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Schedule `event` to fire `delay` after now.
    pub fn schedule(&mut self, delay: Duration, event: E) -> Result<EventHandle, SchedulingError> {
        let at = self
            .now
            .checked_add(delay)
            .ok_or(SchedulingError::Overflow {
                now: self.now,
                delay,
            })?;
        Ok(self.insert(at, event))
    }

    /// Schedule `event` at an absolute time.
    pub fn schedule_at(&mut self, at: Duration, event: E) -> Result<EventHandle, SchedulingError> {
        if at < self.now {
            return Err(SchedulingError::InPast { at, now: self.now });
        }
        Ok(self.insert(at, event))
    }

    /// Schedule with a delay in (fractional) seconds.
    ///
    /// Negative and non-finite delays are rejected rather than clamped.
    pub fn schedule_after_secs(
        &mut self,
        secs: f64,
        event: E,
    ) -> Result<EventHandle, SchedulingError> {
        if !secs.is_finite() {
            return Err(SchedulingError::NonFiniteDelay(secs));
        }
        if secs < 0.0 {
            return Err(SchedulingError::NegativeDelay(secs));
        }
        let delay = Duration::try_from_secs_f64(secs).map_err(|_| SchedulingError::Overflow {
            now: self.now,
            delay: Duration::MAX,
        })?;
        self.schedule(delay, event)
    }

    /// Withdraw a pending event. Returns false if it already fired or was
    /// already cancelled.
    pub fn cancel(&mut self, handle: EventHandle) -> bool {
        if self.queue.remove(handle).is_some() {
            self.stats.cancelled += 1;
            trace!(at = ?handle.time(), "Event cancelled");
            true
        } else {
            false
        }
    }

    pub fn is_pending(&self, handle: EventHandle) -> bool {
        self.queue.contains(handle)
    }

    /// Time of the next event.
    pub fn peek_time(&self) -> Option<Duration> {
        self.queue.peek_time()
    }

    /// Pop the next event, advancing the clock to its time.
    pub fn pop_next(&mut self) -> Option<E> {
        self.pop_until(Duration::MAX)
    }

    /// Pop the next event if it fires at or before `until`.
    pub fn pop_until(&mut self, until: Duration) -> Option<E> {
        if self.queue.peek_time()? > until {
            return None;
        }
        let (key, event) = self.queue.pop()?;
        self.now = key.time;
        self.stats.dispatched += 1;
        Some(event)
    }

    /// Move the clock forward to `to` without dispatching. Never moves it
    /// backwards or past a pending event.
    pub fn advance_to(&mut self, to: Duration) {
        let limit = self.queue.peek_time().map_or(to, |next| next.min(to));
        self.now = self.now.max(limit);
    }

    /// Dispatch events in order until the queue drains or, with `Some(t)`,
    /// until the next event is later than `t`; the clock then rests at `t`.
    ///
    /// The handler may schedule and cancel further events.
    pub fn run<F>(&mut self, until: Option<Duration>, mut handler: F)
    where
        F: FnMut(&mut Self, E),
    {
        let limit = until.unwrap_or(Duration::MAX);
        while let Some(event) = self.pop_until(limit) {
            handler(self, event);
        }
        if let Some(until) = until {
            self.advance_to(until);
        }
    }

    fn insert(&mut self, at: Duration, event: E) -> EventHandle {
        self.stats.scheduled += 1;
        let priority = event.priority();
        self.queue.push(at, priority, event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Tagged {
        id: u32,
        priority: EventPriority,
    }

    impl Prioritized for Tagged {
        fn priority(&self) -> EventPriority {
            self.priority
        }
    }

    fn normal(id: u32) -> Tagged {
        Tagged {
            id,
            priority: EventPriority::Normal,
        }
    }

    fn ms(ms: u64) -> Duration {
        Duration::from_millis(ms)
    }

    #[test]
    fn test_dispatch_advances_clock() {
        let mut scheduler = Scheduler::new();
        scheduler.schedule(ms(20), normal(2)).unwrap();
        scheduler.schedule(ms(10), normal(1)).unwrap();

        let mut seen = Vec::new();
        scheduler.run(None, |s, e| seen.push((s.now(), e.id)));
        assert_eq!(seen, vec![(ms(10), 1), (ms(20), 2)]);
        assert_eq!(scheduler.stats().dispatched, 2);
    }

    #[test]
    fn test_run_until_leaves_later_events() {
        let mut scheduler = Scheduler::new();
        scheduler.schedule(ms(10), normal(1)).unwrap();
        scheduler.schedule(ms(30), normal(2)).unwrap();

        let mut seen = Vec::new();
        scheduler.run(Some(ms(20)), |_, e| seen.push(e.id));
        assert_eq!(seen, vec![1]);
        assert_eq!(scheduler.now(), ms(20));
        assert_eq!(scheduler.pending(), 1);
    }

    #[test]
    fn test_handler_can_schedule_same_instant() {
        let mut scheduler = Scheduler::new();
        scheduler.schedule(ms(5), normal(1)).unwrap();
        scheduler.schedule(ms(5), normal(2)).unwrap();

        let mut seen = Vec::new();
        scheduler.run(None, |s, e| {
            seen.push(e.id);
            if e.id == 1 {
                // Same time, but inserted later than event 2
                s.schedule(Duration::ZERO, normal(3)).unwrap();
            }
        });
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[test]
    fn test_internal_priority_first() {
        let mut scheduler = Scheduler::new();
        scheduler.schedule(ms(1), normal(1)).unwrap();
        scheduler
            .schedule(
                ms(1),
                Tagged {
                    id: 2,
                    priority: EventPriority::Internal,
                },
            )
            .unwrap();
        assert_eq!(scheduler.pop_next().map(|e| e.id), Some(2));
        assert_eq!(scheduler.pop_next().map(|e| e.id), Some(1));
    }

    #[test]
    fn test_cancel_before_fire() {
        let mut scheduler = Scheduler::new();
        let handle = scheduler.schedule(ms(10), normal(1)).unwrap();
        scheduler.schedule(ms(20), normal(2)).unwrap();

        assert!(scheduler.cancel(handle));
        let mut seen = Vec::new();
        scheduler.run(None, |_, e| seen.push(e.id));
        assert_eq!(seen, vec![2]);
        assert_eq!(scheduler.stats().cancelled, 1);
    }

    #[test]
    fn test_cancel_after_fire_is_noop() {
        let mut scheduler = Scheduler::new();
        let handle = scheduler.schedule(ms(10), normal(1)).unwrap();
        assert!(scheduler.pop_next().is_some());

        assert!(!scheduler.cancel(handle));
        assert!(!scheduler.cancel(handle));
        assert_eq!(scheduler.stats().cancelled, 0);
    }

    #[test]
    fn test_rejects_past_and_negative() {
        let mut scheduler = Scheduler::new();
        scheduler.schedule(ms(10), normal(1)).unwrap();
        scheduler.pop_next();

        assert_eq!(
            scheduler.schedule_at(ms(5), normal(2)),
            Err(SchedulingError::InPast {
                at: ms(5),
                now: ms(10)
            })
        );
        assert_eq!(
            scheduler.schedule_after_secs(-0.5, normal(3)),
            Err(SchedulingError::NegativeDelay(-0.5))
        );
        assert!(matches!(
            scheduler.schedule_after_secs(f64::NAN, normal(4)),
            Err(SchedulingError::NonFiniteDelay(_))
        ));
        assert!(matches!(
            scheduler.schedule(Duration::MAX, normal(5)),
            Err(SchedulingError::Overflow { .. })
        ));
        assert_eq!(scheduler.pending(), 0);

        let handle = scheduler.schedule_after_secs(0.25, normal(6)).unwrap();
        assert_eq!(handle.time(), ms(260));
    }

    #[test]
    fn test_advance_never_skips_pending() {
        let mut scheduler: Scheduler<Tagged> = Scheduler::new();
        scheduler.schedule(ms(10), normal(1)).unwrap();
        scheduler.advance_to(ms(50));
        assert_eq!(scheduler.now(), ms(10));
        scheduler.advance_to(ms(5));
        assert_eq!(scheduler.now(), ms(10));
    }

    proptest! {
        #[test]
        fn prop_dispatch_order_is_time_then_insertion(
            delays in prop::collection::vec(0u64..20, 1..200),
            cancel_mask in prop::collection::vec(any::<bool>(), 200),
        ) {
            let mut scheduler = Scheduler::new();
            let mut expected = Vec::new();
            for (id, &delay) in delays.iter().enumerate() {
                let handle = scheduler.schedule(ms(delay), normal(id as u32)).unwrap();
                if cancel_mask[id] {
                    prop_assert!(scheduler.cancel(handle));
                } else {
                    expected.push((delay, id as u32));
                }
            }
            // Stable sort keeps insertion order among equal delays.
            expected.sort_by_key(|&(delay, _)| delay);

            let mut seen = Vec::new();
            let mut last = Duration::ZERO;
            scheduler.run(None, |s, e| {
                assert!(s.now() >= last);
                last = s.now();
                seen.push((s.now().as_millis() as u64, e.id));
            });
            prop_assert_eq!(seen, expected);
        }
    }
}
