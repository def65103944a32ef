//! Helpers for testing code built on joblin.
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, TimeDelta, Utc};

use crate::{
    clock::Clock,
    event::{DomainEvent, EventSink},
};

/// A [`Clock`] that only moves when told to.
///
/// ```
/// # use joblin::{clock::Clock, testing::ManualClock};
/// # use chrono::TimeDelta;
/// let clock = ManualClock::default();
/// let start = clock.now();
///
/// clock.advance(TimeDelta::hours(1));
///
/// assert_eq!(clock.now() - start, TimeDelta::hours(1));
/// ```
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.current() = now;
    }

    pub fn advance(&self, by: TimeDelta) {
        *self.current() += by;
    }

    fn current(&self) -> MutexGuard<'_, DateTime<Utc>> {
        self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current()
    }
}

/// An [`EventSink`] that keeps every event it receives.
#[derive(Debug, Clone, Default)]
pub struct RecordingEventSink {
    events: Arc<Mutex<Vec<DomainEvent>>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// The events received so far, oldest first.
    pub fn events(&self) -> Vec<DomainEvent> {
        self.recorded().clone()
    }

    /// Remove and return the events received so far.
    pub fn take(&self) -> Vec<DomainEvent> {
        std::mem::take(&mut *self.recorded())
    }

    fn recorded(&self) -> MutexGuard<'_, Vec<DomainEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl EventSink for RecordingEventSink {
    fn publish(&self, event: DomainEvent) {
        self.recorded().push(event);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn manual_clock_still_moves_after_a_panic_while_locked() {
        let start = Utc::now();
        let clock = Arc::new(ManualClock::new(start));
        let holder = clock.clone();
        let _ = std::thread::spawn(move || {
            let _current = holder.now.lock().unwrap();
            panic!("panicked while holding the clock");
        })
        .join();
        assert!(clock.now.is_poisoned());

        clock.advance(TimeDelta::minutes(1));
        assert_eq!(clock.now(), start + TimeDelta::minutes(1));

        let later = start + TimeDelta::hours(2);
        clock.set(later);
        assert_eq!(clock.now(), later);
    }

    #[test]
    fn recording_sink_drains_on_take() {
        let sink = RecordingEventSink::new();
        let event = DomainEvent::Job(crate::event::JobEvent {
            job_id: crate::job::JobId::new(),
            occurred_at: Utc::now(),
            kind: crate::event::JobEventKind::Cancelled { reason: None },
        });

        sink.publish(event.clone());

        assert_eq!(sink.events(), vec![event.clone()]);
        assert_eq!(sink.take(), vec![event]);
        assert!(sink.events().is_empty());
    }
}
