//! `epoll(7)`-backed multiplexer. One per loop; mutated only by the owning
//! loop's thread.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use super::interest::{Interest, Readiness};
use super::token::Token;

pub struct Poller {
    epoll_fd: RawFd,
    events: Vec<libc::epoll_event>,
    edge_triggered: bool,
}

fn interests_to_epoll(interest: Interest, edge_triggered: bool) -> u32 {
    let mut bits = libc::EPOLLPRI as u32;
    if interest.is_readable() {
        bits |= (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
    }
    if interest.is_writable() {
        bits |= libc::EPOLLOUT as u32;
    }
    if edge_triggered {
        bits |= libc::EPOLLET as u32;
    }
    bits
}

impl Poller {
    pub fn new(edge_triggered: bool) -> io::Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Poller {
            epoll_fd,
            events: vec![unsafe { std::mem::zeroed() }; 16],
            edge_triggered,
        })
    }

    pub fn add(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, interest)
    }

    pub fn modify(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, interest)
    }

    pub fn delete(&mut self, fd: RawFd) -> io::Result<()> {
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn ctl(&mut self, op: libc::c_int, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interests_to_epoll(interest, self.edge_triggered),
            u64: token.0 as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut event) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Blocks for at most `timeout` (rounded up to whole milliseconds,
    /// `None` meaning wait forever), returning the tokens that became
    /// ready together with their decoded readiness.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<(Token, Readiness)>> {
        if self.events.len() < 16 {
            self.events.resize(16, unsafe { std::mem::zeroed() });
        }
        let timeout_ms: libc::c_int = match timeout {
            None => -1,
            Some(d) => {
                let rounded = d.checked_add(Duration::from_nanos(999_999)).unwrap_or(d);
                rounded.as_millis().min(libc::c_int::MAX as u128) as libc::c_int
            }
        };

        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }
        let n = n as usize;

        let mut ready = Vec::with_capacity(n);
        for ev in &self.events[..n] {
            let token = Token(ev.u64 as usize);
            let bits = ev.events as i32;
            let readiness = Readiness {
                readable: bits & (libc::EPOLLIN | libc::EPOLLPRI) != 0,
                writable: bits & libc::EPOLLOUT != 0,
                read_closed: bits & libc::EPOLLHUP != 0
                    || (bits & libc::EPOLLIN != 0 && bits & libc::EPOLLRDHUP != 0),
                error: bits & libc::EPOLLERR != 0,
            };
            ready.push((token, readiness));
        }
        if n == self.events.len() {
            let new_len = self.events.len() * 2;
            self.events.resize(new_len, unsafe { std::mem::zeroed() });
        }
        Ok(ready)
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn readable_pipe_reports_readable() {
        let mut poller = Poller::new(false).unwrap();
        let (r, w) = unix_pipe();
        poller.add(r.as_raw_fd(), Token(1), Interest::READABLE).unwrap();
        unsafe {
            libc::write(w.as_raw_fd(), b"x".as_ptr() as *const _, 1);
        }
        let ready = poller.poll(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].0, Token(1));
        assert!(ready[0].1.readable);
    }

    fn unix_pipe() -> (std::fs::File, std::fs::File) {
        use std::os::unix::io::FromRawFd;
        let mut fds = [0i32; 2];
        unsafe {
            libc::pipe(fds.as_mut_ptr());
            (std::fs::File::from_raw_fd(fds[0]), std::fs::File::from_raw_fd(fds[1]))
        }
    }
}
