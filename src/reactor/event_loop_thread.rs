//! Spawns a dedicated OS thread running exactly one `EventLoop::run()`.
//!
//! The constructor blocks until the spawned thread has actually created
//! its loop and published a handle to it, so callers never observe a
//! partially-started thread.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use log::error;

use super::event_loop::{EventLoop, EventLoopHandle};

struct Shared {
    handle: Mutex<Option<EventLoopHandle>>,
    ready: Condvar,
}

pub struct EventLoopThread {
    join: Option<JoinHandle<()>>,
    handle: EventLoopHandle,
}

impl EventLoopThread {
    /// `init` runs once on the new thread immediately after the loop is
    /// constructed but before `run()` is entered, e.g. to register
    /// acceptor channels for loops that double as the main loop.
    pub fn start(edge_triggered: bool, init: impl FnOnce(&mut EventLoop) + Send + 'static) -> Self {
        let shared = Arc::new(Shared {
            handle: Mutex::new(None),
            ready: Condvar::new(),
        });
        let shared_for_thread = shared.clone();

        let join = std::thread::spawn(move || {
            let mut loop_ = match EventLoop::new(edge_triggered, false) {
                Ok(l) => l,
                Err(e) => {
                    error!("event loop thread failed to create its loop: {e}");
                    return;
                }
            };
            init(&mut loop_);

            {
                let mut guard = shared_for_thread.handle.lock().unwrap();
                *guard = Some(loop_.handle());
                shared_for_thread.ready.notify_all();
            }

            if let Err(e) = loop_.run() {
                error!("event loop thread exited with error: {e}");
            }
        });

        let mut guard = shared.handle.lock().unwrap();
        while guard.is_none() {
            guard = shared.ready.wait(guard).unwrap();
        }
        let handle = guard.clone().expect("loop handle published");
        drop(guard);

        EventLoopThread {
            join: Some(join),
            handle,
        }
    }

    pub fn handle(&self) -> EventLoopHandle {
        self.handle.clone()
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        self.handle.queue_in_loop(|loop_| loop_.quit());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}
