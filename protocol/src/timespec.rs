//! Monotonic time for the poll loops: wall-clock jumps must never move a
//! relay deadline.

use std::time::Duration;

use nix::time::{clock_gettime, ClockId};

/// A point on the monotonic clock, normalised so `0 <= nsec < 1_000_000_000`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Stamp {
    sec: i64,
    nsec: i32,
}

const NSEC_PER_SEC: i64 = 1_000_000_000;

impl Stamp {
    pub fn now() -> Stamp {
        let ts = clock_gettime(ClockId::CLOCK_MONOTONIC).expect("monotonic clock unavailable");
        Stamp {
            sec: ts.tv_sec(),
            nsec: ts.tv_nsec() as i32,
        }
    }

    pub const fn new(sec: i64, nsec: i32) -> Stamp {
        Stamp { sec, nsec }
    }

    pub fn add(self, d: Duration) -> Stamp {
        let mut sec = self.sec + d.as_secs() as i64;
        let mut nsec = self.nsec as i64 + d.subsec_nanos() as i64;
        if nsec >= NSEC_PER_SEC {
            sec += 1;
            nsec -= NSEC_PER_SEC;
        }
        Stamp {
            sec,
            nsec: nsec as i32,
        }
    }

    pub fn add_ms(self, ms: u64) -> Stamp {
        self.add(Duration::from_millis(ms))
    }

    /// Time elapsed since `earlier`, zero if `earlier` is in the future.
    pub fn since(self, earlier: Stamp) -> Duration {
        if self <= earlier {
            return Duration::ZERO;
        }
        let mut sec = self.sec - earlier.sec;
        let mut nsec = self.nsec as i64 - earlier.nsec as i64;
        if nsec < 0 {
            sec -= 1;
            nsec += NSEC_PER_SEC;
        }
        Duration::new(sec as u64, nsec as u32)
    }
}

/// A cancellable deadline. Cleared timers never fire and never shorten a
/// poll timeout.
#[derive(Debug, Clone, Copy, Default)]
pub struct Timer(Option<Stamp>);

impl Timer {
    pub const fn unset() -> Timer {
        Timer(None)
    }

    pub fn set(&mut self, at: Stamp) {
        self.0 = Some(at);
    }

    pub fn clear(&mut self) {
        self.0 = None;
    }

    pub fn is_set(&self) -> bool {
        self.0.is_some()
    }

    pub fn at(&self) -> Option<Stamp> {
        self.0
    }

    /// True when the timer is set and behind `now`. Otherwise lowers
    /// `deadline` toward the pending expiry so the poll wakes in time.
    pub fn passed(&self, now: Stamp, deadline: &mut Deadline) -> bool {
        match self.0 {
            None => false,
            Some(at) if at < now => true,
            Some(at) => {
                deadline.lower(at);
                false
            }
        }
    }
}

/// The nearest wakeup across all pending timers in one loop iteration.
#[derive(Debug, Clone, Copy, Default)]
pub struct Deadline(Option<Stamp>);

impl Deadline {
    pub const fn unset() -> Deadline {
        Deadline(None)
    }

    pub fn lower(&mut self, at: Stamp) {
        match self.0 {
            Some(cur) if cur <= at => {}
            _ => self.0 = Some(at),
        }
    }

    /// Poll timeout in milliseconds: -1 blocks forever, elapsed deadlines
    /// clamp to an immediate return.
    pub fn to_poll_ms(&self, now: Stamp) -> i64 {
        match self.0 {
            None => -1,
            Some(at) => {
                let left = at.since(now);
                left.as_millis().min(i64::MAX as u128) as i64
            }
        }
    }
}
