//! Generation-tagged timer bookkeeping for the connection session.
//!
//! Arming a timer hands out a `TimerHandle`; re-arming or cancelling bumps
//! the kind's generation so any handle issued earlier becomes stale. The
//! async driver delivers fired handles back and `fire` only accepts the
//! current, still-armed one.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Auto-stop for a running scan
    ScanWindow,
    /// Periodic liveness check while connected
    Keepalive,
    /// Delay before the next reconnect attempt
    Reconnect,
    /// Synthetic sample tick
    Simulation,
    /// Wait for the first real sample after subscribing
    DataGrace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle {
    pub kind: TimerKind,
    pub generation: u64,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u64,
    armed: bool,
}

#[derive(Debug, Default)]
pub struct Timers {
    slots: HashMap<TimerKind, Slot>,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `kind`, invalidating any earlier handle for it
    pub fn arm(&mut self, kind: TimerKind) -> TimerHandle {
        let slot = self.slots.entry(kind).or_default();
        slot.generation += 1;
        slot.armed = true;
        TimerHandle { kind, generation: slot.generation }
    }

    /// Returns whether the timer was armed
    pub fn cancel(&mut self, kind: TimerKind) -> bool {
        match self.slots.get_mut(&kind) {
            Some(slot) if slot.armed => {
                slot.armed = false;
                slot.generation += 1;
                true
            }
            _ => false,
        }
    }

    /// Cancel everything, returning the kinds that were armed
    pub fn cancel_all(&mut self) -> Vec<TimerKind> {
        let mut cancelled: Vec<TimerKind> = self
            .slots
            .iter_mut()
            .filter(|(_, slot)| slot.armed)
            .map(|(kind, slot)| {
                slot.armed = false;
                slot.generation += 1;
                *kind
            })
            .collect();
        cancelled.sort_by_key(|kind| *kind as u8);
        cancelled
    }

    /// Accept a fired handle. Stale or cancelled handles are rejected.
    pub fn fire(&mut self, handle: TimerHandle) -> bool {
        match self.slots.get_mut(&handle.kind) {
            Some(slot) if slot.armed && slot.generation == handle.generation => {
                slot.armed = false;
                true
            }
            _ => false,
        }
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.slots.get(&kind).is_some_and(|slot| slot.armed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fire_current_handle_once() {
        let mut timers = Timers::new();
        let handle = timers.arm(TimerKind::Reconnect);

        assert!(timers.is_armed(TimerKind::Reconnect));
        assert!(timers.fire(handle));
        assert!(!timers.fire(handle));
        assert!(!timers.is_armed(TimerKind::Reconnect));
    }

    #[test]
    fn test_rearm_invalidates_old_handle() {
        let mut timers = Timers::new();
        let old = timers.arm(TimerKind::Keepalive);
        let new = timers.arm(TimerKind::Keepalive);

        assert!(!timers.fire(old));
        assert!(timers.fire(new));
    }

    #[test]
    fn test_cancelled_timer_is_noop() {
        let mut timers = Timers::new();
        let handle = timers.arm(TimerKind::Reconnect);
        assert!(timers.cancel(TimerKind::Reconnect));
        assert!(!timers.cancel(TimerKind::Reconnect));
        assert!(!timers.fire(handle));

        // A fresh arm after cancel must not revive the stale handle
        let fresh = timers.arm(TimerKind::Reconnect);
        assert!(!timers.fire(handle));
        assert!(timers.fire(fresh));
    }

    #[test]
    fn test_cancel_all() {
        let mut timers = Timers::new();
        let keepalive = timers.arm(TimerKind::Keepalive);
        timers.arm(TimerKind::Simulation);
        timers.arm(TimerKind::ScanWindow);
        timers.cancel(TimerKind::ScanWindow);

        assert_eq!(
            timers.cancel_all(),
            vec![TimerKind::Keepalive, TimerKind::Simulation]
        );
        assert!(!timers.fire(keepalive));
        assert!(timers.cancel_all().is_empty());
    }
}
