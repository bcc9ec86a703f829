//! Listens on one address and hands accepted sockets to a callback.
//!
//! The listening [`Socket`] is moved into the channel's read callback
//! rather than kept on `Acceptor` itself — it's the only thing that ever
//! touches it again, and it gets closed for free when the channel is
//! deregistered and its callback (and everything it captured) is dropped.

use std::io;
use std::os::unix::io::AsRawFd;

use log::{info, warn};

use crate::reactor::{ChannelHandle, EventLoop, Interest, ReadCallback};

use super::inet_addr::InetAddress;
use super::socket::Socket;

pub struct Acceptor {
    handle: ChannelHandle,
}

impl Acceptor {
    pub fn new(
        loop_: &mut EventLoop,
        addr: &InetAddress,
        reuse_port: bool,
        mut on_new_connection: impl FnMut(&mut EventLoop, Socket, InetAddress) + Send + 'static,
    ) -> io::Result<Self> {
        let socket = Socket::new_tcp()?;
        socket.set_reuse_addr(true)?;
        if reuse_port {
            socket.set_reuse_port(true)?;
        }
        socket.bind(addr)?;
        socket.listen(1024)?;
        info!("acceptor listening on {addr}");

        let fd = socket.as_raw_fd();
        let handle = loop_.add_channel(fd, Interest::READABLE)?;

        let read_cb: ReadCallback = Box::new(move |loop_, _ts| loop {
            match socket.accept() {
                Ok(Some((conn_socket, peer))) => on_new_connection(loop_, conn_socket, peer),
                Ok(None) => break,
                Err(e) => {
                    // EMFILE/ENFILE show up here under fd exhaustion; the
                    // listening socket itself stays healthy, so just log
                    // and keep accepting on the next readiness.
                    warn!("accept failed: {e}");
                    break;
                }
            }
        });
        loop_.set_read_callback(handle, read_cb);

        Ok(Acceptor { handle })
    }

    pub fn stop(&self, loop_: &mut EventLoop) -> io::Result<()> {
        loop_.remove_channel(self.handle)
    }
}
