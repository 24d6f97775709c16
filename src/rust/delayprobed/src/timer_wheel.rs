//! Single-level hashed timer wheel, one per worker.
//!
//! Timers land in `slot = expiry_tick % slots`. Advancing the wheel walks
//! the slots between the last processed tick and `now`, and sends every
//! due timer on the worker's expired channel as an [`Expiration`]. The
//! wheel never calls back into the flow table; the worker drains the
//! channel in its own context.
//!
//! Timers further out than one revolution stay in their slot until the
//! wheel comes around to their tick.

use crate::flow_table::EntryIndex;
use crossbeam_channel::Sender;
use std::time::Duration;
use tracing::debug;

/// Slots in the wheel.
pub const WHEEL_SLOTS: usize = 2048;

/// One tick.
pub const TICK: Duration = Duration::from_secs(1);

/// Most expirations produced by one call to `advance`.
pub const MAX_EXPIRATIONS: usize = 1024;

/// Each flow entry carries two timers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerKind {
    /// Fires periodically; the entry is exported and its counters reset.
    Active,
    /// Fires when the entry may have gone idle; the entry is evicted.
    Passive,
}

/// Identifies a started timer so that it can be stopped, and so that a
/// stale expiration can be told apart from a current one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimerHandle {
    slot: u32,
    id: u64,
}

/// A timer that came due.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Expiration {
    pub entry: EntryIndex,
    pub kind: TimerKind,
    pub handle: TimerHandle,
}

#[derive(Clone, Copy, Debug)]
struct PendingTimer {
    id: u64,
    expiry_tick: u64,
    entry: EntryIndex,
    kind: TimerKind,
}

pub struct TimerWheel {
    slots: Vec<Vec<PendingTimer>>,
    tick_ns: u64,
    start_ns: u64,
    /// Last tick whose slot has been fully processed
    current_tick: u64,
    next_id: u64,
    max_expirations: usize,
    live: usize,
    expired: Sender<Expiration>,
}

impl TimerWheel {
    /// A wheel with the default geometry, whose tick zero starts at `now_ns`.
    pub fn new(now_ns: u64, expired: Sender<Expiration>) -> Self {
        Self::with_geometry(now_ns, WHEEL_SLOTS, TICK, MAX_EXPIRATIONS, expired)
    }

    pub fn with_geometry(
        now_ns: u64,
        slots: usize,
        tick: Duration,
        max_expirations: usize,
        expired: Sender<Expiration>,
    ) -> Self {
        assert!(slots > 0 && !tick.is_zero() && max_expirations > 0);
        Self {
            slots: vec![Vec::new(); slots],
            tick_ns: tick.as_nanos() as u64,
            start_ns: now_ns,
            current_tick: 0,
            next_id: 0,
            max_expirations,
            live: 0,
            expired,
        }
    }

    /// Number of timers that have been started and neither stopped nor
    /// expired.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Converts a duration into whole ticks, rounding up. Never zero.
    pub fn ticks_for(&self, interval: Duration) -> u64 {
        let ns = interval.as_nanos() as u64;
        ns.div_ceil(self.tick_ns).max(1)
    }

    /// Arms a timer `interval` from the current tick.
    pub fn start(&mut self, entry: EntryIndex, kind: TimerKind, interval: Duration) -> TimerHandle {
        let expiry_tick = self.current_tick + self.ticks_for(interval);
        let slot = (expiry_tick % self.slots.len() as u64) as usize;
        let id = self.next_id;
        self.next_id += 1;
        self.slots[slot].push(PendingTimer {
            id,
            expiry_tick,
            entry,
            kind,
        });
        self.live += 1;
        TimerHandle {
            slot: slot as u32,
            id,
        }
    }

    /// Disarms a timer. Returns `false` if it had already expired or been
    /// stopped.
    pub fn stop(&mut self, handle: TimerHandle) -> bool {
        let Some(slot) = self.slots.get_mut(handle.slot as usize) else {
            return false;
        };
        if let Some(position) = slot.iter().position(|t| t.id == handle.id) {
            slot.swap_remove(position);
            self.live -= 1;
            true
        } else {
            false
        }
    }

    /// Processes every tick up to `now_ns`, sending due timers on the
    /// expired channel. Stops early once `max_expirations` have been
    /// produced; the rest are picked up by the next call.
    pub fn advance(&mut self, now_ns: u64) -> usize {
        let target_tick = now_ns.saturating_sub(self.start_ns) / self.tick_ns;
        let n_slots = self.slots.len() as u64;
        let mut fired = 0;

        while self.current_tick < target_tick {
            let tick = self.current_tick + 1;
            let slot = &mut self.slots[(tick % n_slots) as usize];
            let mut i = 0;
            while i < slot.len() {
                if fired == self.max_expirations {
                    // Budget spent part way through this slot: revisit it next time.
                    return fired;
                }
                if slot[i].expiry_tick <= tick {
                    let timer = slot.swap_remove(i);
                    self.live -= 1;
                    fired += 1;
                    let expiration = Expiration {
                        entry: timer.entry,
                        kind: timer.kind,
                        handle: TimerHandle {
                            slot: (tick % n_slots) as u32,
                            id: timer.id,
                        },
                    };
                    if self.expired.send(expiration).is_err() {
                        debug!("Expired list receiver is gone; dropping expiration");
                    }
                } else {
                    i += 1;
                }
            }
            self.current_tick = tick;
        }
        fired
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crossbeam_channel::{unbounded, Receiver};

    const SECOND: u64 = 1_000_000_000;

    fn wheel() -> (TimerWheel, Receiver<Expiration>) {
        let (tx, rx) = unbounded();
        (TimerWheel::new(0, tx), rx)
    }

    #[test]
    fn fires_after_interval() {
        let (mut wheel, rx) = wheel();
        let handle = wheel.start(7, TimerKind::Passive, Duration::from_secs(3));
        assert_eq!(wheel.advance(2 * SECOND), 0);
        assert!(rx.is_empty());
        assert_eq!(wheel.advance(3 * SECOND), 1);
        let expiration = rx.try_recv().unwrap();
        assert_eq!(expiration.entry, 7);
        assert_eq!(expiration.kind, TimerKind::Passive);
        assert_eq!(expiration.handle, handle);
        assert!(wheel.is_empty());
    }

    #[test]
    fn stopped_timers_do_not_fire() {
        let (mut wheel, rx) = wheel();
        let handle = wheel.start(1, TimerKind::Active, Duration::from_secs(1));
        assert!(wheel.stop(handle));
        assert!(!wheel.stop(handle));
        wheel.advance(5 * SECOND);
        assert!(rx.is_empty());
    }

    #[test]
    fn survives_more_than_one_revolution() {
        let (tx, rx) = unbounded();
        let mut wheel = TimerWheel::with_geometry(0, 4, TICK, 16, tx);
        wheel.start(3, TimerKind::Passive, Duration::from_secs(10));
        wheel.advance(9 * SECOND);
        assert!(rx.is_empty());
        wheel.advance(10 * SECOND);
        assert_eq!(rx.try_recv().unwrap().entry, 3);
    }

    #[test]
    fn expiration_budget_carries_over() {
        let (tx, rx) = unbounded();
        let mut wheel = TimerWheel::with_geometry(0, 8, TICK, 2, tx);
        for entry in 0..5 {
            wheel.start(entry, TimerKind::Active, Duration::from_secs(1));
        }
        assert_eq!(wheel.advance(SECOND), 2);
        assert_eq!(wheel.advance(SECOND), 2);
        assert_eq!(wheel.advance(SECOND), 1);
        assert_eq!(rx.len(), 5);
        assert!(wheel.is_empty());
    }

    #[test]
    fn sub_tick_intervals_round_up() {
        let (wheel, _rx) = wheel();
        assert_eq!(wheel.ticks_for(Duration::from_millis(1)), 1);
        assert_eq!(wheel.ticks_for(Duration::from_millis(1500)), 2);
        assert_eq!(wheel.ticks_for(Duration::ZERO), 1);
    }
}
