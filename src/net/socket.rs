//! Thin RAII wrapper around a raw socket fd: the handful of `setsockopt`
//! knobs and lifecycle calls the server needs, nothing else.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use super::inet_addr::InetAddress;

pub struct Socket {
    fd: RawFd,
}

impl Socket {
    /// Takes ownership of an already-created fd (e.g. from `accept4`).
    pub fn from_raw(fd: RawFd) -> Self {
        Socket { fd }
    }

    pub fn new_tcp() -> io::Result<Self> {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Socket { fd })
    }

    pub fn set_reuse_addr(&self, on: bool) -> io::Result<()> {
        self.set_int_opt(libc::SOL_SOCKET, libc::SO_REUSEADDR, on as libc::c_int)
    }

    pub fn set_reuse_port(&self, on: bool) -> io::Result<()> {
        self.set_int_opt(libc::SOL_SOCKET, libc::SO_REUSEPORT, on as libc::c_int)
    }

    pub fn set_tcp_nodelay(&self, on: bool) -> io::Result<()> {
        self.set_int_opt(libc::IPPROTO_TCP, libc::TCP_NODELAY, on as libc::c_int)
    }

    pub fn set_keep_alive(&self, on: bool) -> io::Result<()> {
        self.set_int_opt(libc::SOL_SOCKET, libc::SO_KEEPALIVE, on as libc::c_int)
    }

    fn set_int_opt(&self, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> io::Result<()> {
        let ret = unsafe {
            libc::setsockopt(
                self.fd,
                level,
                name,
                &value as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn bind(&self, addr: &InetAddress) -> io::Result<()> {
        let (sockaddr, len) = addr.as_sockaddr();
        let ret = unsafe { libc::bind(self.fd, &sockaddr as *const _ as *const libc::sockaddr, len) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn listen(&self, backlog: i32) -> io::Result<()> {
        let ret = unsafe { libc::listen(self.fd, backlog) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Accepts one connection with the listener's own non-blocking,
    /// close-on-exec flags applied atomically via `accept4`, returning
    /// `None` on `EAGAIN`/`EWOULDBLOCK` (no connection pending).
    pub fn accept(&self) -> io::Result<Option<(Socket, InetAddress)>> {
        let mut storage: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let fd = unsafe {
            libc::accept4(
                self.fd,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(err);
        }
        Ok(Some((Socket::from_raw(fd), InetAddress::from_sockaddr(&storage))))
    }

    pub fn shutdown_write(&self) -> io::Result<()> {
        let ret = unsafe { libc::shutdown(self.fd, libc::SHUT_WR) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl io::Read for Socket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

impl io::Read for &Socket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

impl io::Write for Socket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = unsafe { libc::write(self.fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Write for &Socket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = unsafe { libc::write(self.fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}
