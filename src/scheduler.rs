// Deadline scheduler. One master counter runs at the least common multiple
// of the 200 MHz CPU clock and the video clocks; every device derives its
// cadence from an integer divisor of it. Events are kept in a queue ordered
// by deadline and the CPU runs until the front deadline comes due.

use std::cell::RefCell;
use std::rc::Rc;

pub const SCHED_FREQUENCY: u64 = 5_400_000_000;

pub const TIMESLICE: u64 = SCHED_FREQUENCY / 400;

// scheduler ticks per SH4 cycle (200 MHz)
pub const SH4_CLOCK_SCALE: u64 = SCHED_FREQUENCY / 200_000_000;

pub type SchedPtr = Rc<RefCell<Scheduler>>;

/// Every deadline in the system. A kind is live at most once, so it doubles
/// as a stable handle for cancellation.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum EventKind {
    TimesliceEnd,
    TmuUnderflow(usize),
    ScifRxi,
    ScifTxi,
    Ch2DmaStart,
    Ch2DmaDone,
    Hblank,
    VblankIn,
    VblankOut,
}

#[derive(Debug, Copy, Clone)]
pub struct Event {
    pub when: u64,
    pub kind: EventKind,
}

pub struct Scheduler {
    stamp: u64,
    target: u64,
    queue: Vec<Event>,
}

impl Scheduler {
    pub fn new() -> Scheduler {
        let mut sched = Scheduler { stamp: 0, target: 0, queue: Vec::new() };
        sched.update_target();
        sched
    }
    pub fn stamp(&self) -> u64 {
        self.stamp
    }
    pub fn target(&self) -> u64 {
        self.target
    }
    pub fn advance(&mut self, ticks: u64) {
        self.stamp += ticks;
    }
    pub fn schedule(&mut self, when: u64, kind: EventKind) {
        if when < self.stamp {
            panic!(
                "integrity: event {:?} scheduled at {} with the clock already at {}",
                kind, when, self.stamp
            );
        }
        // stable for equal stamps: insert after existing entries
        let at = self
            .queue
            .iter()
            .position(|ev| ev.when > when)
            .unwrap_or(self.queue.len());
        self.queue.insert(at, Event { when, kind });
        self.update_target();
    }
    pub fn cancel(&mut self, kind: EventKind) {
        self.queue.retain(|ev| ev.kind != kind);
        self.update_target();
    }
    pub fn pop(&mut self) -> Option<Event> {
        if self.queue.is_empty() {
            return None;
        }
        let ev = self.queue.remove(0);
        self.update_target();
        Some(ev)
    }
    pub fn peek(&self) -> Option<Event> {
        self.queue.first().copied()
    }
    pub fn scheduled(&self, kind: EventKind) -> bool {
        self.queue.iter().any(|ev| ev.kind == kind)
    }
    fn update_target(&mut self) {
        // With nothing scheduled the CPU still has to make progress; run it a
        // few cycles at a time so a freshly scheduled event is not overrun by
        // much. In practice the TMU and SPG keep the queue non-empty.
        self.target = match self.queue.first() {
            Some(ev) => ev.when,
            None => self.stamp + 16 * SH4_CLOCK_SCALE,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pop_order_is_monotonic() {
        let mut sched = Scheduler::new();
        let stamps = [40u64, 7, 7, 99, 3, 56, 12, 3, 77, 23];
        let kinds = [
            EventKind::TmuUnderflow(0),
            EventKind::TmuUnderflow(1),
            EventKind::TmuUnderflow(2),
            EventKind::ScifRxi,
            EventKind::ScifTxi,
            EventKind::Ch2DmaDone,
            EventKind::Hblank,
            EventKind::VblankIn,
            EventKind::VblankOut,
            EventKind::TimesliceEnd,
        ];
        for (when, kind) in stamps.iter().zip(kinds.iter()) {
            sched.schedule(*when, *kind);
        }
        sched.cancel(EventKind::Ch2DmaDone);
        let mut last = 0;
        let mut n = 0;
        while let Some(ev) = sched.pop() {
            assert!(ev.when >= last);
            assert_ne!(ev.kind, EventKind::Ch2DmaDone);
            last = ev.when;
            n += 1;
        }
        assert_eq!(n, 9);
    }

    #[test]
    fn equal_stamps_pop_in_schedule_order() {
        let mut sched = Scheduler::new();
        sched.schedule(10, EventKind::Hblank);
        sched.schedule(10, EventKind::VblankIn);
        sched.schedule(10, EventKind::VblankOut);
        assert_eq!(sched.pop().unwrap().kind, EventKind::Hblank);
        assert_eq!(sched.pop().unwrap().kind, EventKind::VblankIn);
        assert_eq!(sched.pop().unwrap().kind, EventKind::VblankOut);
    }

    #[test]
    fn target_tracks_front_event() {
        let mut sched = Scheduler::new();
        sched.schedule(500, EventKind::Hblank);
        assert_eq!(sched.target(), 500);
        sched.schedule(100, EventKind::VblankIn);
        assert_eq!(sched.target(), 100);
        sched.cancel(EventKind::VblankIn);
        assert_eq!(sched.target(), 500);
    }

    #[test]
    #[should_panic]
    fn past_due_schedule_is_fatal() {
        let mut sched = Scheduler::new();
        sched.advance(1000);
        sched.schedule(999, EventKind::Hblank);
    }
}
