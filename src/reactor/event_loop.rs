//! The reactor's core run loop: one `EventLoop` per thread, owning an
//! epoll [`Poller`], a [`TimerQueue`], a wakeup [`Waker`], and the slab of
//! registered [`Channel`]s.
//!
//! A loop may only be driven and mutated from the thread that created it;
//! [`EventLoop::assert_in_loop_thread`] enforces this everywhere a public
//! method requires it. Work from other threads crosses over through an
//! [`EventLoopHandle`], which is `Send + Sync` and holds only a shared
//! pending-functor queue and a clone of the loop's waker.

use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::thread::ThreadId;
use std::time::Duration;

use log::{debug, trace};

use crate::timestamp::Timestamp;

use super::channel::{Channel, ChannelHandle, EventCallback, ReadCallback};
use super::interest::{Interest, Readiness};
use super::poller::Poller;
use super::timer::{Timer, TimerCallback, TimerId};
use super::timer_queue::TimerQueue;
use super::token::Token;
use super::waker::Waker;

/// Upper bound on how long a single `epoll_wait` blocks when nothing else
/// is pending. Bounds the staleness of anything that only the loop itself
/// notices (e.g. a future `run_at` added by a thread that forgets to wake
/// the loop — which `EventLoopHandle` never does, but this is the
/// backstop).
const POLL_TIMEOUT: Duration = Duration::from_secs(10);

type PendingTask = Box<dyn FnOnce(&mut EventLoop) + Send>;

/// A `Send + Sync` capability to affect an `EventLoop` from any thread.
/// Cheap to clone; every clone shares the same pending-functor queue and
/// wakeup descriptor as the loop it was taken from.
#[derive(Clone)]
pub struct EventLoopHandle {
    pending: Arc<Mutex<VecDeque<PendingTask>>>,
    waker: Arc<Waker>,
    owner_thread: ThreadId,
}

impl EventLoopHandle {
    pub fn is_loop_thread(&self) -> bool {
        std::thread::current().id() == self.owner_thread
    }

    /// Appends `f` to the loop's pending-functor queue and wakes it. Never
    /// runs `f` inline, even when called from the loop's own thread — used
    /// when a callback wants to defer work rather than risk reentering
    /// whatever it's in the middle of.
    pub fn queue_in_loop(&self, f: impl FnOnce(&mut EventLoop) + Send + 'static) {
        self.pending.lock().unwrap().push_back(Box::new(f));
        let _ = self.waker.wake();
    }
}

pub struct EventLoop {
    poller: Poller,
    channels: Vec<Option<Channel>>,
    free_slots: Vec<usize>,
    timer_queue: Option<TimerQueue>,
    waker: Arc<Waker>,
    waker_token: Token,
    timer_token: Token,
    pending: Arc<Mutex<VecDeque<PendingTask>>>,
    calling_pending_functors: bool,
    looping: bool,
    quitting: bool,
    owner_thread: ThreadId,
    is_main: bool,
    /// `EventLoop` holds nothing that's actually thread-unsafe to move,
    /// but it must never end up `&mut`-accessible from a thread other
    /// than the one that created it — this marker makes that a compile
    /// error instead of a runtime assertion everywhere.
    _not_send: std::marker::PhantomData<*const ()>,
}

static SIGNAL_HOOKED: Once = Once::new();
static MAIN_LOOP_WAKER_FD: AtomicI32 = AtomicI32::new(-1);
static QUIT_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_termination_signal(_sig: libc::c_int) {
    QUIT_REQUESTED.store(true, Ordering::SeqCst);
    let fd = MAIN_LOOP_WAKER_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        let one: u64 = 1;
        unsafe {
            libc::write(fd, &one as *const u64 as *const libc::c_void, 8);
        }
    }
}

impl EventLoop {
    /// `edge_triggered` selects the epoll trigger mode; `is_main` marks
    /// the loop that SIGINT/SIGTERM should stop (normally the acceptor's
    /// loop, not a worker's).
    pub fn new(edge_triggered: bool, is_main: bool) -> io::Result<Self> {
        let mut poller = Poller::new(edge_triggered)?;
        let waker = Arc::new(Waker::new()?);
        let timer_queue = TimerQueue::new()?;

        let mut channels = Vec::new();
        let waker_fd = waker.fd();
        let timer_fd = timer_queue.fd();

        let mut waker_channel = Channel::new(waker_fd);
        waker_channel.set_interest(Interest::READABLE);
        let waker_channel_read: ReadCallback = Box::new(|loop_: &mut EventLoop, _ts| {
            let _ = loop_.waker.reset();
            loop_.do_pending_functors();
        });
        waker_channel.read_cb = Some(waker_channel_read);
        poller.add(waker_fd, Token(0), Interest::READABLE)?;
        channels.push(Some(waker_channel));

        let mut timer_channel = Channel::new(timer_fd);
        timer_channel.set_interest(Interest::READABLE);
        let timer_channel_read: ReadCallback = Box::new(|loop_: &mut EventLoop, _ts| {
            let mut tq = loop_.timer_queue.take().expect("timer queue missing during dispatch");
            tq.handle_read(loop_);
            loop_.timer_queue = Some(tq);
        });
        timer_channel.read_cb = Some(timer_channel_read);
        poller.add(timer_fd, Token(1), Interest::READABLE)?;
        channels.push(Some(timer_channel));

        Ok(EventLoop {
            poller,
            channels,
            free_slots: Vec::new(),
            timer_queue: Some(timer_queue),
            waker,
            waker_token: Token(0),
            timer_token: Token(1),
            pending: Arc::new(Mutex::new(VecDeque::new())),
            calling_pending_functors: false,
            looping: false,
            quitting: false,
            owner_thread: std::thread::current().id(),
            is_main,
            _not_send: std::marker::PhantomData,
        })
    }

    pub fn handle(&self) -> EventLoopHandle {
        EventLoopHandle {
            pending: self.pending.clone(),
            waker: self.waker.clone(),
            owner_thread: self.owner_thread,
        }
    }

    pub fn is_in_loop_thread(&self) -> bool {
        std::thread::current().id() == self.owner_thread
    }

    pub fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            panic!("EventLoop method called from a thread other than its owner");
        }
    }

    /// If the caller that hooks `SIGINT`/`SIGTERM` intends this loop to be
    /// the one that stops on those signals, register it. Safe to call more
    /// than once across the process; only the first registration installs
    /// the `signal(2)` handlers, later calls just repoint the target fd.
    pub fn register_for_termination_signals(&self) {
        MAIN_LOOP_WAKER_FD.store(self.waker.fd(), Ordering::SeqCst);
        SIGNAL_HOOKED.call_once(|| unsafe {
            libc::signal(libc::SIGINT, handle_termination_signal as usize);
            libc::signal(libc::SIGTERM, handle_termination_signal as usize);
        });
    }

    /// Allocates a channel slab entry for `fd` with the given initial
    /// interest and registers it with the poller. The fd is not owned by
    /// the channel; the caller closes it.
    pub fn add_channel(&mut self, fd: RawFd, interest: Interest) -> io::Result<ChannelHandle> {
        self.assert_in_loop_thread();
        let token = match self.free_slots.pop() {
            Some(idx) => Token(idx),
            None => {
                let idx = self.channels.len();
                self.channels.push(None);
                Token(idx)
            }
        };
        let mut channel = Channel::new(fd);
        channel.set_interest(interest);
        self.poller.add(fd, token, interest)?;
        self.channels[token.0] = Some(channel);
        Ok(ChannelHandle { token, fd })
    }

    pub fn set_read_callback(&mut self, handle: ChannelHandle, cb: ReadCallback) {
        if let Some(channel) = self.channels.get_mut(handle.token.0).and_then(|c| c.as_mut()) {
            channel.read_cb = Some(cb);
        }
    }

    pub fn set_write_callback(&mut self, handle: ChannelHandle, cb: EventCallback) {
        if let Some(channel) = self.channels.get_mut(handle.token.0).and_then(|c| c.as_mut()) {
            channel.write_cb = Some(cb);
        }
    }

    pub fn set_close_callback(&mut self, handle: ChannelHandle, cb: EventCallback) {
        if let Some(channel) = self.channels.get_mut(handle.token.0).and_then(|c| c.as_mut()) {
            channel.close_cb = Some(cb);
        }
    }

    pub fn set_error_callback(&mut self, handle: ChannelHandle, cb: EventCallback) {
        if let Some(channel) = self.channels.get_mut(handle.token.0).and_then(|c| c.as_mut()) {
            channel.error_cb = Some(cb);
        }
    }

    pub fn update_channel(&mut self, handle: ChannelHandle, interest: Interest) -> io::Result<()> {
        self.poller.modify(handle.fd, handle.token, interest)?;
        if let Some(channel) = self.channels.get_mut(handle.token.0).and_then(|c| c.as_mut()) {
            channel.set_interest(interest);
        }
        Ok(())
    }

    pub fn remove_channel(&mut self, handle: ChannelHandle) -> io::Result<()> {
        self.poller.delete(handle.fd)?;
        self.channels[handle.token.0] = None;
        self.free_slots.push(handle.token.0);
        Ok(())
    }

    /// Schedules `callback` to fire once at `when`.
    pub fn run_at(&mut self, when: Timestamp, callback: TimerCallback) -> TimerId {
        self.schedule_timer(Timer::new(when, None, callback))
    }

    /// Schedules `callback` to fire once after `delay`.
    pub fn run_after(&mut self, delay: Duration, callback: TimerCallback) -> TimerId {
        let when = Timestamp::now().add(delay.as_secs_f64());
        self.schedule_timer(Timer::new(when, None, callback))
    }

    /// Schedules `callback` to fire every `interval`, starting after one
    /// interval has elapsed.
    pub fn run_every(&mut self, interval: Duration, callback: TimerCallback) -> TimerId {
        let when = Timestamp::now().add(interval.as_secs_f64());
        self.schedule_timer(Timer::new(when, Some(interval), callback))
    }

    pub fn cancel_timer(&mut self, id: TimerId) {
        self.assert_in_loop_thread();
        if let Some(tq) = self.timer_queue.as_mut() {
            tq.cancel(id);
        }
    }

    fn schedule_timer(&mut self, timer: Timer) -> TimerId {
        self.assert_in_loop_thread();
        let id = timer.id();
        match self.timer_queue.as_mut() {
            Some(tq) => {
                tq.add_timer(timer);
            }
            None => {
                // Called reentrantly from within the timer queue's own
                // dispatch (i.e. a timer callback scheduling another
                // timer). The queue is briefly taken out of `self` while
                // it dispatches; defer insertion to the next pending-
                // functor drain, by which point it's been put back.
                self.queue_in_loop(move |loop_| {
                    loop_.schedule_timer(timer);
                });
            }
        }
        id
    }

    /// Runs `f` immediately — valid to call only while already holding
    /// `&mut EventLoop`, which by construction means the calling thread is
    /// the loop's owner.
    pub fn run_in_loop(&mut self, f: impl FnOnce(&mut EventLoop) + 'static) {
        f(self);
    }

    /// Defers `f` to the next pending-functor drain, even on the loop's
    /// own thread. Wakes the loop if it isn't already mid-drain.
    pub fn queue_in_loop(&mut self, f: impl FnOnce(&mut EventLoop) + Send + 'static) {
        self.pending.lock().unwrap().push_back(Box::new(f));
        if !self.calling_pending_functors {
            let _ = self.waker.wake();
        }
    }

    pub fn quit(&mut self) {
        self.quitting = true;
        if !self.is_in_loop_thread() {
            let _ = self.waker.wake();
        }
    }

    /// Blocks, dispatching readiness and pending cross-thread work, until
    /// `quit()` is called (directly, or via a registered termination
    /// signal on the designated main loop).
    pub fn run(&mut self) -> io::Result<()> {
        self.assert_in_loop_thread();
        self.looping = true;
        self.quitting = false;
        debug!("event loop starting");

        while !self.quitting {
            let active = self.poller.poll(Some(POLL_TIMEOUT))?;
            let now = Timestamp::now();
            for (token, readiness) in active {
                self.handle_active(token, readiness, now);
            }
            self.do_pending_functors();

            if self.is_main && QUIT_REQUESTED.load(Ordering::SeqCst) {
                trace!("main loop observed termination signal");
                self.quitting = true;
            }
        }

        self.looping = false;
        debug!("event loop stopped");
        Ok(())
    }

    /// Dispatches one channel's readiness. The channel's four callback
    /// slots are emptied first so callback bodies can take `&mut self`
    /// (the loop) without aliasing the channel they were called from;
    /// they're restored afterward unless the callback removed the channel
    /// entirely (e.g. on close).
    fn handle_active(&mut self, token: Token, readiness: Readiness, now: Timestamp) {
        let channel = match self.channels.get_mut(token.0).and_then(|c| c.as_mut()) {
            Some(c) => c,
            None => return,
        };
        channel.revents = readiness;
        let mut read_cb = channel.read_cb.take();
        let mut write_cb = channel.write_cb.take();
        let mut close_cb = channel.close_cb.take();
        let mut error_cb = channel.error_cb.take();

        if readiness.read_closed && !readiness.readable {
            if let Some(cb) = close_cb.as_mut() {
                cb(self);
            }
        }
        if readiness.error {
            if let Some(cb) = error_cb.as_mut() {
                cb(self);
            }
        }
        if readiness.readable {
            if let Some(cb) = read_cb.as_mut() {
                cb(self, now);
            }
        }
        if readiness.writable {
            if let Some(cb) = write_cb.as_mut() {
                cb(self);
            }
        }

        if let Some(channel) = self.channels.get_mut(token.0).and_then(|c| c.as_mut()) {
            channel.read_cb = read_cb;
            channel.write_cb = write_cb;
            channel.close_cb = close_cb;
            channel.error_cb = error_cb;
        }
    }

    /// Swaps the pending queue out before running it so functors queued
    /// by a functor that's currently running land in the *next* drain,
    /// not this one, and don't starve readiness dispatch. If the swap
    /// left something behind (because one did exactly that), wakes
    /// itself so the next `poll()` returns promptly instead of waiting
    /// out the full timeout.
    fn do_pending_functors(&mut self) {
        let mut batch: VecDeque<PendingTask> = {
            let mut guard = self.pending.lock().unwrap();
            std::mem::take(&mut *guard)
        };
        if batch.is_empty() {
            return;
        }
        self.calling_pending_functors = true;
        for task in batch.drain(..) {
            task(self);
        }
        self.calling_pending_functors = false;

        if !self.pending.lock().unwrap().is_empty() {
            let _ = self.waker.wake();
        }
    }

    pub fn waker_token(&self) -> Token {
        self.waker_token
    }

    pub fn timer_token(&self) -> Token {
        self.timer_token
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        if MAIN_LOOP_WAKER_FD.load(Ordering::SeqCst) == self.waker.fd() {
            MAIN_LOOP_WAKER_FD.store(-1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

    #[test]
    fn new_loop_has_waker_and_timer_channels_registered() {
        let loop_ = EventLoop::new(false, false).unwrap();
        assert_eq!(loop_.channels.len(), 2);
        assert!(loop_.channels[0].is_some());
        assert!(loop_.channels[1].is_some());
    }

    #[test]
    fn queue_in_loop_runs_on_next_drain() {
        let mut loop_ = EventLoop::new(false, false).unwrap();
        let count = Arc::new(AtomicU32::new(0));
        let count2 = count.clone();
        loop_.queue_in_loop(move |_| {
            count2.fetch_add(1, AtomicOrdering::SeqCst);
        });
        loop_.do_pending_functors();
        assert_eq!(count.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn handle_cross_thread_queue_wakes_loop() {
        let loop_ = EventLoop::new(false, false).unwrap();
        let handle = loop_.handle();
        let count = Arc::new(AtomicU32::new(0));
        let count2 = count.clone();
        let join = std::thread::spawn(move || {
            handle.queue_in_loop(move |_| {
                count2.fetch_add(1, AtomicOrdering::SeqCst);
            });
        });
        join.join().unwrap();
        assert_eq!(count.load(AtomicOrdering::SeqCst), 0);
    }

    #[test]
    fn add_and_remove_channel_reuses_freed_slot() {
        let mut loop_ = EventLoop::new(false, false).unwrap();
        let (r, w) = unsafe {
            let mut fds = [0i32; 2];
            libc::pipe(fds.as_mut_ptr());
            (fds[0], fds[1])
        };
        let handle = loop_.add_channel(r, Interest::READABLE).unwrap();
        let slot = handle.token().0;
        loop_.remove_channel(handle).unwrap();
        assert!(loop_.channels[slot].is_none());
        let handle2 = loop_.add_channel(r, Interest::READABLE).unwrap();
        assert_eq!(handle2.token().0, slot);
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn run_at_cancel_before_dispatch_never_fires() {
        let mut loop_ = EventLoop::new(false, false).unwrap();
        let fired = Arc::new(AtomicU32::new(0));
        let fired2 = fired.clone();
        let when = Timestamp::now();
        let id = loop_.run_at(when, Box::new(move |_| {
            fired2.fetch_add(1, AtomicOrdering::SeqCst);
        }));
        loop_.cancel_timer(id);
        std::thread::sleep(Duration::from_millis(5));
        let active = loop_.poller.poll(Some(Duration::from_millis(50))).unwrap();
        for (token, readiness) in active {
            loop_.handle_active(token, readiness, Timestamp::now());
        }
        assert_eq!(fired.load(AtomicOrdering::SeqCst), 0);
    }
}
