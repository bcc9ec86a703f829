//! A single scheduled callback plus its ABA-safe handle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::timestamp::Timestamp;

use super::event_loop::EventLoop;

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Opaque handle returned by `EventLoop::run_at`/`run_after`/`run_every`.
/// Carries the timer's monotonically increasing sequence number, which is
/// never reused for the lifetime of the process, so a handle can never be
/// confused with a later, unrelated timer even if the queue slot it
/// occupied is reused (see invariant 5 / scenario S6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId {
    pub(crate) sequence: u64,
}

pub type TimerCallback = Box<dyn FnMut(&mut EventLoop) + Send>;

pub struct Timer {
    pub(crate) expiration: Timestamp,
    pub(crate) interval: Option<Duration>,
    pub(crate) sequence: u64,
    pub(crate) callback: TimerCallback,
}

impl Timer {
    pub fn new(expiration: Timestamp, interval: Option<Duration>, callback: TimerCallback) -> Self {
        Timer {
            expiration,
            interval,
            sequence: NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed),
            callback,
        }
    }

    pub fn id(&self) -> TimerId {
        TimerId {
            sequence: self.sequence,
        }
    }

    pub fn restart(&mut self, now: Timestamp) {
        if let Some(interval) = self.interval {
            self.expiration = now.add(interval.as_secs_f64());
        } else {
            self.expiration = Timestamp::invalid();
        }
    }
}
