//! Per-loop ordered timer set, armed through a `timerfd`.
//!
//! Entries are keyed by `(expiration, sequence)` so earliest-expiring
//! timers sort first and equal-expiration ties break on registration
//! order. `canceling` absorbs cancellations that happen while a batch of
//! expired timers is being dispatched, so a periodic timer that cancels
//! itself from its own callback is not re-armed.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::timestamp::Timestamp;

use super::event_loop::EventLoop;
use super::timer::{Timer, TimerId};

pub struct TimerQueue {
    timerfd: RawFd,
    timers: BTreeMap<(Timestamp, u64), Timer>,
    active: HashMap<u64, Timestamp>,
    canceling: HashSet<u64>,
    dispatching: bool,
}

impl TimerQueue {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(TimerQueue {
            timerfd: fd,
            timers: BTreeMap::new(),
            active: HashMap::new(),
            canceling: HashSet::new(),
            dispatching: false,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.timerfd
    }

    /// Must be called on the owning loop's thread.
    pub fn add_timer(&mut self, timer: Timer) -> TimerId {
        let id = timer.id();
        self.insert(timer);
        self.reset_timerfd_if_earliest();
        id
    }

    /// Must be called on the owning loop's thread.
    pub fn cancel(&mut self, id: TimerId) {
        if self.dispatching {
            self.canceling.insert(id.sequence);
        }
        if let Some(expiration) = self.active.remove(&id.sequence) {
            self.timers.remove(&(expiration, id.sequence));
        }
    }

    fn insert(&mut self, timer: Timer) {
        let expiration = timer.expiration;
        let sequence = timer.sequence;
        self.active.insert(sequence, expiration);
        self.timers.insert((expiration, sequence), timer);
    }

    /// Drains the timerfd and runs every timer whose expiration is `<=` now,
    /// re-arming periodic ones that were not canceled from within their own
    /// callback. `loop_` is threaded through to each callback so a timer
    /// (e.g. an idle-connection timeout) can remove channels or queue
    /// further work on the loop it fired on.
    pub fn handle_read(&mut self, loop_: &mut EventLoop) {
        self.drain_timerfd();
        let now = Timestamp::now();
        let mut expired = self.pop_expired(now);

        self.dispatching = true;
        self.canceling.clear();
        for timer in expired.iter_mut() {
            (timer.callback)(loop_);
        }
        self.dispatching = false;

        for mut timer in expired.drain(..) {
            if timer.interval.is_some() && !self.canceling.contains(&timer.sequence) {
                timer.restart(now);
                self.insert(timer);
            }
        }
        self.reset_timerfd_if_earliest();
    }

    fn pop_expired(&mut self, now: Timestamp) -> Vec<Timer> {
        let mut expired = Vec::new();
        loop {
            let key = match self.timers.keys().next().copied() {
                Some(k) if k.0 <= now => k,
                _ => break,
            };
            let timer = self.timers.remove(&key).unwrap();
            self.active.remove(&key.1);
            expired.push(timer);
        }
        expired
    }

    fn earliest_expiration(&self) -> Option<Timestamp> {
        self.timers.keys().next().map(|k| k.0)
    }

    fn reset_timerfd_if_earliest(&self) {
        if let Some(expiration) = self.earliest_expiration() {
            let now = Timestamp::now();
            let micros = (expiration.micros_since_epoch() - now.micros_since_epoch()).max(100);
            let delay = Duration::from_micros(micros as u64);
            arm_timerfd(self.timerfd, delay);
        }
    }

    fn drain_timerfd(&self) {
        let mut buf = [0u8; 8];
        unsafe {
            libc::read(self.timerfd, buf.as_mut_ptr() as *mut libc::c_void, 8);
        }
    }
}

fn arm_timerfd(fd: RawFd, delay: Duration) {
    let spec = libc::itimerspec {
        it_interval: libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        },
        it_value: libc::timespec {
            tv_sec: delay.as_secs() as libc::time_t,
            tv_nsec: delay.subsec_nanos() as libc::c_long,
        },
    };
    unsafe {
        libc::timerfd_settime(fd, 0, &spec, std::ptr::null_mut());
    }
}

impl Drop for TimerQueue {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.timerfd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn test_loop() -> EventLoop {
        EventLoop::new(false, false).unwrap()
    }

    #[test]
    fn one_shot_fires_once() {
        let mut q = TimerQueue::new().unwrap();
        let mut loop_ = test_loop();
        let fired = Arc::new(AtomicU32::new(0));
        let fired2 = fired.clone();
        let now = Timestamp::now();
        q.add_timer(Timer::new(now, None, Box::new(move |_| { fired2.fetch_add(1, Ordering::SeqCst); })));
        std::thread::sleep(Duration::from_millis(5));
        q.handle_read(&mut loop_);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(q.timers.is_empty());
    }

    #[test]
    fn canceled_timer_never_fires_even_with_slot_reuse() {
        let mut q = TimerQueue::new().unwrap();
        let mut loop_ = test_loop();
        let fired_a = Arc::new(AtomicU32::new(0));
        let fired_a2 = fired_a.clone();
        let now = Timestamp::now();
        let id_a = q.add_timer(Timer::new(now, None, Box::new(move |_| { fired_a2.fetch_add(1, Ordering::SeqCst); })));
        q.cancel(id_a);

        let fired_b = Arc::new(AtomicU32::new(0));
        let fired_b2 = fired_b.clone();
        q.add_timer(Timer::new(now, None, Box::new(move |_| { fired_b2.fetch_add(1, Ordering::SeqCst); })));

        std::thread::sleep(Duration::from_millis(5));
        q.handle_read(&mut loop_);
        assert_eq!(fired_a.load(Ordering::SeqCst), 0);
        assert_eq!(fired_b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn self_canceling_periodic_timer_not_rearmed() {
        let mut q = TimerQueue::new().unwrap();
        let now = Timestamp::now();
        let id = q.add_timer(Timer::new(now, Some(Duration::from_millis(1)), Box::new(move |_| {})));

        std::thread::sleep(Duration::from_millis(5));
        q.dispatching = true;
        q.canceling.insert(id.sequence);
        q.dispatching = false;
        let expired = q.pop_expired(Timestamp::now());
        assert_eq!(expired.len(), 1);
        assert!(q.canceling.contains(&id.sequence));
    }
}
