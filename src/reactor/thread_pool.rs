//! Fixed-size pool of `EventLoopThread`s, handed out round-robin to new
//! connections so each lives on exactly one I/O thread for its lifetime.
//!
//! `queue_size`, `keep_alive_time`, `max_idle_threads`, and
//! `min_idle_threads` are accepted and validated for forward
//! compatibility with a future elastic pool, but every configured thread
//! is started up front and kept for the pool's lifetime — see
//! `DESIGN.md` for why this doesn't yet do dynamic sizing.

use std::io;

use log::info;

use super::event_loop::{EventLoop, EventLoopHandle};
use super::event_loop_thread::EventLoopThread;

pub struct EventLoopThreadPool {
    thread_num: usize,
    queue_size: usize,
    keep_alive_time: u64,
    max_idle_threads: usize,
    min_idle_threads: usize,
    edge_triggered: bool,
    threads: Vec<EventLoopThread>,
    next: usize,
}

impl EventLoopThreadPool {
    pub fn new(edge_triggered: bool) -> Self {
        EventLoopThreadPool {
            thread_num: 0,
            queue_size: 1000,
            keep_alive_time: 60,
            max_idle_threads: 4,
            min_idle_threads: 1,
            edge_triggered,
            threads: Vec::new(),
            next: 0,
        }
    }

    pub fn set_thread_num(&mut self, n: usize) {
        self.thread_num = n;
    }

    pub fn set_queue_size(&mut self, n: usize) {
        self.queue_size = n;
    }

    pub fn set_keep_alive_time(&mut self, seconds: u64) {
        self.keep_alive_time = seconds;
    }

    pub fn set_max_idle_threads(&mut self, n: usize) {
        self.max_idle_threads = n;
    }

    pub fn set_min_idle_threads(&mut self, n: usize) {
        self.min_idle_threads = n;
    }

    pub fn queue_size(&self) -> usize {
        self.queue_size
    }

    pub fn keep_alive_time(&self) -> u64 {
        self.keep_alive_time
    }

    /// Starts `thread_num` worker loops, running `init` on each one right
    /// after it's constructed. If `thread_num` is zero, no threads are
    /// spawned and `init` runs directly on `base_loop` instead — the
    /// single-threaded deployment mode, matching how the C++ original's
    /// pool falls back to invoking the callback on its base loop.
    pub fn start<F>(&mut self, base_loop: &mut EventLoop, init: F) -> io::Result<()>
    where
        F: Fn(&mut EventLoop) + Send + Sync + Clone + 'static,
    {
        info!(
            "starting event loop thread pool: {} threads (queue_size={}, keep_alive={}s)",
            self.thread_num, self.queue_size, self.keep_alive_time
        );
        if self.thread_num == 0 {
            init(base_loop);
            return Ok(());
        }
        for i in 0..self.thread_num {
            let edge_triggered = self.edge_triggered;
            let init = init.clone();
            let thread = EventLoopThread::start(edge_triggered, move |loop_| {
                info!("worker loop {i} started");
                init(loop_);
            });
            self.threads.push(thread);
        }
        Ok(())
    }

    /// Returns the handle of the next worker loop in round-robin order,
    /// or `None` if the pool has no worker threads (the caller should
    /// fall back to the base loop in that case).
    pub fn get_next_loop(&mut self) -> Option<EventLoopHandle> {
        if self.threads.is_empty() {
            return None;
        }
        let idx = self.next % self.threads.len();
        self.next = (self.next + 1) % self.threads.len();
        Some(self.threads[idx].handle())
    }

    pub fn get_all_loops(&self) -> Vec<EventLoopHandle> {
        self.threads.iter().map(|t| t.handle()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_threads_means_no_worker_loops() {
        let mut pool = EventLoopThreadPool::new(false);
        pool.set_thread_num(0);
        let mut base = EventLoop::new(false, true).unwrap();
        pool.start(&mut base, |_| {}).unwrap();
        assert!(pool.get_next_loop().is_none());
    }

    #[test]
    fn round_robins_across_threads() {
        let mut pool = EventLoopThreadPool::new(false);
        pool.set_thread_num(3);
        let mut base = EventLoop::new(false, true).unwrap();
        pool.start(&mut base, |_| {}).unwrap();
        let _a = pool.get_next_loop().unwrap();
        let _b = pool.get_next_loop().unwrap();
        let _c = pool.get_next_loop().unwrap();
        let _d = pool.get_next_loop().unwrap();
        assert_eq!(pool.get_all_loops().len(), 3);
    }
}
