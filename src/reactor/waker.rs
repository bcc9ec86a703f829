//! Cross-thread wakeup descriptor. A loop blocked in `poll()` is woken by
//! any thread writing a single 8-byte value to this `eventfd`.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

pub struct Waker {
    file: File,
}

impl Waker {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Waker {
            file: unsafe { File::from_raw_fd(fd) },
        })
    }

    pub fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Writes `1u64` to the eventfd counter. Safe to call from any thread,
    /// any number of times before the target loop drains it — the kernel
    /// coalesces writes into the counter.
    pub fn wake(&self) -> io::Result<()> {
        match (&self.file).write(&1u64.to_ne_bytes()) {
            Ok(_) => Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                // Counter is saturated; reset then retry once.
                self.reset()?;
                (&self.file).write(&1u64.to_ne_bytes()).map(|_| ())
            }
            Err(e) => Err(e),
        }
    }

    /// Drains the eventfd counter. Called by the loop after waking from
    /// `poll()` on the waker's fd.
    pub fn reset(&self) -> io::Result<()> {
        let mut buf = [0u8; 8];
        match (&self.file).read(&mut buf) {
            Ok(_) => Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_then_reset_does_not_block() {
        let waker = Waker::new().unwrap();
        waker.wake().unwrap();
        waker.reset().unwrap();
    }
}
