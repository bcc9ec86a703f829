//! One accepted TCP connection: its buffers, optional TLS session, idle
//! timer, and the state machine that ties reads/writes/close together.
//!
//! A `Connection` is always reached through `Arc<Mutex<Connection>>`. The
//! mutex is a deliberate simplification over the original's raw pointer
//! plus `shared_from_this`/weak "tie": only the owning loop's thread ever
//! locks it in practice (loop affinity is enforced the same way
//! `EventLoop` enforces it elsewhere), so contention is not a concern —
//! what the `Arc` buys is a connection that can be handed to
//! `EventLoop::add_channel`'s callbacks without them racing the
//! connection's own destruction. The one spot that does keep a `Weak`
//! back-reference to its own `Arc<Mutex<_>>` (`self_handle`, set by
//! `Server::start` right after wrapping a freshly accepted connection) is
//! the idle timer: it needs to re-arm itself from inside a callback that
//! runs later, on the same loop, against the very connection it watches.
//! See `DESIGN.md`.

use std::any::Any;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{debug, warn};

use crate::buffer::Buffer;
use crate::reactor::{ChannelHandle, EventLoop, EventLoopHandle, Interest, TimerId};
use crate::timestamp::Timestamp;
use crate::tls::{IoDemand, TlsContext, TlsSession};

use super::inet_addr::InetAddress;
use super::socket::Socket;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Handshaking,
    Connected,
    Disconnecting,
    Disconnected,
}

pub type MessageCallback = Box<dyn FnMut(&mut EventLoop, &mut Connection, Timestamp) + Send>;
pub type ConnectionCallback = Box<dyn FnMut(&mut EventLoop, &mut Connection) + Send>;

/// An in-flight `send_file` transfer that couldn't finish in one go
/// because the socket's send buffer filled up; resumed from
/// `handle_write` once the channel reports writable again.
struct PendingSendFile {
    file: File,
    offset: libc::off_t,
    remaining: usize,
    close_after_send: bool,
    via_read_loop: bool,
}

pub struct Connection {
    name: String,
    socket: Socket,
    handle: Option<ChannelHandle>,
    loop_handle: EventLoopHandle,
    state: ConnState,
    local_addr: InetAddress,
    peer_addr: InetAddress,
    input: Buffer,
    output: Buffer,
    writing: bool,
    pending_file: Option<PendingSendFile>,
    tls: Option<TlsSession>,
    high_water_mark: usize,
    above_high_water_mark: bool,
    idle_timer: Option<TimerId>,
    idle_timeout: Duration,
    /// Set once by the caller that wraps this connection in `Arc<Mutex<_>>`
    /// (see `Server::start`), so the idle timer can re-arm itself on
    /// activity without the caller re-threading an `Arc` through every
    /// `handle_read`.
    self_handle: Option<Weak<Mutex<Connection>>>,
    /// App-level protocol state (HTTP parser, WebSocket parser/handler) —
    /// the idiomatic stand-in for the original `SocketContext` slot.
    context: Option<Box<dyn Any + Send>>,
    connection_cb: Option<ConnectionCallback>,
    message_cb: Option<MessageCallback>,
    write_complete_cb: Option<ConnectionCallback>,
    high_water_mark_cb: Option<ConnectionCallback>,
    close_cb: Option<ConnectionCallback>,
}

impl Connection {
    pub fn new(
        name: String,
        socket: Socket,
        local_addr: InetAddress,
        peer_addr: InetAddress,
        loop_handle: EventLoopHandle,
        tls_context: Option<&TlsContext>,
    ) -> Result<Self, crate::error::TlsError> {
        let tls = match tls_context {
            Some(ctx) => Some(ctx.new_session()?),
            None => None,
        };
        let state = if tls.is_some() { ConnState::Handshaking } else { ConnState::Connecting };
        Ok(Connection {
            name,
            socket,
            handle: None,
            loop_handle,
            state,
            local_addr,
            peer_addr,
            input: Buffer::new(),
            output: Buffer::new(),
            writing: false,
            pending_file: None,
            tls,
            high_water_mark: 64 * 1024 * 1024,
            above_high_water_mark: false,
            idle_timer: None,
            idle_timeout: Duration::ZERO,
            self_handle: None,
            context: None,
            connection_cb: None,
            message_cb: None,
            write_complete_cb: None,
            high_water_mark_cb: None,
            close_cb: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn peer_addr(&self) -> InetAddress {
        self.peer_addr
    }

    pub fn local_addr(&self) -> InetAddress {
        self.local_addr
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnState::Connected
    }

    pub fn set_connection_callback(&mut self, cb: ConnectionCallback) {
        self.connection_cb = Some(cb);
    }

    pub fn set_message_callback(&mut self, cb: MessageCallback) {
        self.message_cb = Some(cb);
    }

    pub fn set_write_complete_callback(&mut self, cb: ConnectionCallback) {
        self.write_complete_cb = Some(cb);
    }

    pub fn set_high_water_mark_callback(&mut self, cb: ConnectionCallback, mark: usize) {
        self.high_water_mark_cb = Some(cb);
        self.high_water_mark = mark;
    }

    pub fn set_close_callback(&mut self, cb: ConnectionCallback) {
        self.close_cb = Some(cb);
    }

    pub fn context(&self) -> Option<&(dyn Any + Send)> {
        self.context.as_deref()
    }

    pub fn context_mut(&mut self) -> Option<&mut (dyn Any + Send)> {
        self.context.as_deref_mut()
    }

    pub fn set_context(&mut self, ctx: Box<dyn Any + Send>) {
        self.context = Some(ctx);
    }

    pub fn input(&mut self) -> &mut Buffer {
        &mut self.input
    }

    /// Splits the borrow of `self` so a caller can hold the input buffer
    /// and the app-level context mutably at the same time, e.g. to feed
    /// bytes straight into a parser that lives in the context.
    pub fn input_and_context(&mut self) -> (&mut Buffer, Option<&mut (dyn Any + Send)>) {
        (&mut self.input, self.context.as_deref_mut())
    }

    pub fn loop_handle(&self) -> EventLoopHandle {
        self.loop_handle.clone()
    }

    /// Registers the connection's fd with `loop_` and fires the
    /// connection-established callback. Must run on `loop_`'s own thread
    /// (the acceptor marshals this there via `EventLoopHandle`).
    pub fn connect_established(loop_: &mut EventLoop, conn: Arc<Mutex<Connection>>) -> io::Result<()> {
        let fd = conn.lock().unwrap().socket.as_raw_fd();
        let handle = loop_.add_channel(fd, Interest::READABLE)?;

        let c1 = conn.clone();
        loop_.set_read_callback(handle, Box::new(move |loop_, ts| {
            let mut guard = c1.lock().unwrap();
            guard.handle_read(loop_, ts);
        }));
        let c2 = conn.clone();
        loop_.set_write_callback(handle, Box::new(move |loop_| {
            let mut guard = c2.lock().unwrap();
            guard.handle_write(loop_);
        }));
        let c3 = conn.clone();
        loop_.set_close_callback(handle, Box::new(move |loop_| {
            let mut guard = c3.lock().unwrap();
            guard.handle_close(loop_);
        }));
        let c4 = conn.clone();
        loop_.set_error_callback(handle, Box::new(move |_loop_| {
            let guard = c4.lock().unwrap();
            warn!("connection {} reported a socket error", guard.name);
        }));

        let mut guard = conn.lock().unwrap();
        guard.handle = Some(handle);
        if guard.tls.is_none() {
            guard.state = ConnState::Connected;
        }
        debug!("connection {} established ({} -> {})", guard.name, guard.peer_addr, guard.local_addr);
        guard.call_connection_callback(loop_);
        Ok(())
    }

    fn call_connection_callback(&mut self, loop_: &mut EventLoop) {
        if let Some(mut cb) = self.connection_cb.take() {
            cb(loop_, self);
            self.connection_cb = Some(cb);
        }
    }

    fn handle_read(&mut self, loop_: &mut EventLoop, ts: Timestamp) {
        match self.read_into_input() {
            Ok(Some(0)) => self.handle_close(loop_),
            Ok(Some(_)) => {
                self.renew_idle_timer(loop_);
                self.call_message_callback(loop_, ts);
            }
            Ok(None) => {}
            Err(e) => {
                warn!("connection {} read error: {e}", self.name);
                self.handle_error();
                self.handle_close(loop_);
            }
        }
    }

    /// `Ok(None)` means "nothing new, try again later" (`WouldBlock`);
    /// `Ok(Some(0))` means the peer closed its write side.
    fn read_into_input(&mut self) -> io::Result<Option<usize>> {
        if let Some(tls) = self.tls.as_mut() {
            let was_handshaking = tls.is_handshaking();
            let mut plain = Vec::new();
            let (n, demand) = match tls.read_plaintext(&mut self.socket, &mut plain) {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(e),
            };
            if was_handshaking && !tls.is_handshaking() {
                self.state = ConnState::Connected;
            }
            if demand == IoDemand::WantWrite {
                tls.flush_ciphertext(&mut self.socket)?;
            }
            if n > 0 {
                self.input.append(&plain);
            }
            if n == 0 && plain.is_empty() && demand == IoDemand::Satisfied && !self.tls.as_ref().unwrap().is_handshaking() {
                // rustls reported no plaintext and nothing pending: either
                // a handshake-only record or a clean close_notify.
                return Ok(None);
            }
            Ok(Some(n))
        } else {
            match self.input.read_fd(self.socket.as_raw_fd()) {
                Ok(n) => Ok(Some(n)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
                Err(e) => Err(e),
            }
        }
    }

    fn call_message_callback(&mut self, loop_: &mut EventLoop, ts: Timestamp) {
        if let Some(mut cb) = self.message_cb.take() {
            cb(loop_, self, ts);
            self.message_cb = Some(cb);
        }
    }

    /// Queues `data` for sending. Writes immediately if the output buffer
    /// is empty and no write interest is currently registered (the common
    /// case); otherwise appends and relies on write-readiness to drain it.
    pub fn send(&mut self, loop_: &mut EventLoop, data: &[u8]) {
        if self.state != ConnState::Connected {
            return;
        }
        if self.output.readable_bytes() == 0 && !self.writing {
            match self.write_direct(data) {
                Ok(n) if n == data.len() => {
                    self.maybe_call_write_complete(loop_);
                    return;
                }
                Ok(n) => {
                    self.output.append(&data[n..]);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.output.append(data);
                }
                Err(e) => {
                    warn!("connection {} write error: {e}", self.name);
                    return;
                }
            }
        } else {
            self.output.append(data);
        }

        self.update_high_water_mark(loop_);

        if !self.writing {
            self.writing = true;
            if let Some(handle) = self.handle {
                let _ = loop_.update_channel(handle, Interest::READABLE | Interest::WRITABLE);
            }
        }
    }

    fn write_direct(&mut self, data: &[u8]) -> io::Result<usize> {
        if let Some(tls) = self.tls.as_mut() {
            tls.write_plaintext(data, &mut self.socket)
        } else {
            self.socket.write(data)
        }
    }

    fn handle_write(&mut self, loop_: &mut EventLoop) {
        if self.output.readable_bytes() == 0 && self.pending_file.is_none() {
            return;
        }

        if self.output.readable_bytes() > 0 {
            let result = if let Some(tls) = self.tls.as_mut() {
                let peek = self.output.peek().to_vec();
                match tls.write_plaintext(&peek, &mut self.socket) {
                    Ok(n) => {
                        self.output.retrieve(n);
                        Ok(n)
                    }
                    Err(e) => Err(e),
                }
            } else {
                self.output.write_fd(self.socket.as_raw_fd())
            };

            match result {
                Ok(_) => self.update_high_water_mark(loop_),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    warn!("connection {} write error: {e}", self.name);
                    return;
                }
            }
        }

        if self.output.readable_bytes() != 0 {
            return;
        }

        if let Some(pf) = self.pending_file.take() {
            self.continue_send_file(loop_, pf);
            return;
        }

        self.writing = false;
        if let Some(handle) = self.handle {
            let _ = loop_.update_channel(handle, Interest::READABLE);
        }
        self.maybe_call_write_complete(loop_);
        if self.state == ConnState::Disconnecting {
            self.shutdown_write();
        }
    }

    fn update_high_water_mark(&mut self, loop_: &mut EventLoop) {
        let now_above = self.output.readable_bytes() >= self.high_water_mark;
        if now_above && !self.above_high_water_mark {
            self.above_high_water_mark = true;
            if let Some(mut cb) = self.high_water_mark_cb.take() {
                cb(loop_, self);
                self.high_water_mark_cb = Some(cb);
            }
        } else if !now_above {
            self.above_high_water_mark = false;
        }
    }

    fn maybe_call_write_complete(&mut self, loop_: &mut EventLoop) {
        if let Some(mut cb) = self.write_complete_cb.take() {
            cb(loop_, self);
            self.write_complete_cb = Some(cb);
        }
    }

    /// Half-closes once pending output has drained; if nothing is
    /// pending, half-closes immediately.
    pub fn shutdown(&mut self) {
        if self.state != ConnState::Connected {
            return;
        }
        self.state = ConnState::Disconnecting;
        if self.output.readable_bytes() == 0 {
            self.shutdown_write();
        }
    }

    fn shutdown_write(&mut self) {
        let _ = self.socket.shutdown_write();
    }

    fn handle_close(&mut self, loop_: &mut EventLoop) {
        if self.state == ConnState::Disconnected {
            return;
        }
        self.state = ConnState::Disconnected;
        if let Some(handle) = self.handle.take() {
            let _ = loop_.remove_channel(handle);
        }
        if let Some(id) = self.idle_timer.take() {
            loop_.cancel_timer(id);
        }
        if let Some(mut cb) = self.close_cb.take() {
            cb(loop_, self);
        }
    }

    fn handle_error(&mut self) {
        debug!("connection {} socket error", self.name);
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// A zero duration disables the idle timer entirely.
    pub fn set_idle_timeout(&mut self, timeout: Duration) {
        self.idle_timeout = timeout;
    }

    /// Must be called once, right after the connection is wrapped in
    /// `Arc<Mutex<_>>`, so `renew_idle_timer` can re-arm itself on every
    /// read without the owner re-threading an `Arc` through each call.
    pub fn set_self_handle(&mut self, handle: Weak<Mutex<Connection>>) {
        self.self_handle = Some(handle);
    }

    /// Cancels the current idle timer (if any) and arms a fresh one,
    /// so a connection that keeps seeing traffic never times out.
    pub fn renew_idle_timer(&mut self, loop_: &mut EventLoop) {
        if self.idle_timeout.is_zero() {
            return;
        }
        let Some(weak) = self.self_handle.clone() else { return };
        if let Some(old) = self.idle_timer.take() {
            loop_.cancel_timer(old);
        }
        let id = loop_.run_after(
            self.idle_timeout,
            Box::new(move |_loop_| {
                if let Some(conn) = weak.upgrade() {
                    let mut guard = conn.lock().unwrap();
                    if guard.is_connected() {
                        guard.shutdown();
                    }
                }
            }),
        );
        self.idle_timer = Some(id);
    }

    /// Starts (or resumes) a zero-copy file transfer: `libc::sendfile`
    /// directly on the raw socket over plaintext, a chunked read into the
    /// existing output buffer over TLS (rustls has no sendfile hook, so
    /// the ciphertext still has to pass through userspace).
    pub fn send_file(&mut self, loop_: &mut EventLoop, path: &str, close_after_send: bool) -> io::Result<()> {
        if self.state != ConnState::Connected {
            return Ok(());
        }
        let file = File::open(path)?;
        let len = file.metadata()?.len() as usize;
        let mut pf = PendingSendFile {
            file,
            offset: 0,
            remaining: len,
            close_after_send,
            via_read_loop: self.tls.is_some(),
        };

        let done = if pf.via_read_loop {
            self.drain_send_file_read_loop(&mut pf)?
        } else {
            self.drain_send_file_sendfile(&mut pf)?
        };

        if done {
            self.maybe_call_write_complete(loop_);
            if close_after_send {
                self.shutdown();
            }
        } else {
            self.pending_file = Some(pf);
            if !self.writing {
                self.writing = true;
                if let Some(handle) = self.handle {
                    let _ = loop_.update_channel(handle, Interest::READABLE | Interest::WRITABLE);
                }
            }
        }
        Ok(())
    }

    fn continue_send_file(&mut self, loop_: &mut EventLoop, mut pf: PendingSendFile) {
        let result = if pf.via_read_loop {
            self.drain_send_file_read_loop(&mut pf)
        } else {
            self.drain_send_file_sendfile(&mut pf)
        };

        match result {
            Ok(true) => {
                self.writing = false;
                if let Some(handle) = self.handle {
                    let _ = loop_.update_channel(handle, Interest::READABLE);
                }
                self.maybe_call_write_complete(loop_);
                if pf.close_after_send {
                    self.shutdown();
                }
            }
            Ok(false) => {
                self.pending_file = Some(pf);
            }
            Err(e) => {
                warn!("connection {} send_file error: {e}", self.name);
            }
        }
    }

    /// Zero-copy path: `sendfile(2)` straight from the file's fd to the
    /// socket's fd, advancing `pf.offset`/`pf.remaining` as it goes.
    /// Returns `Ok(true)` once the whole file has been sent.
    fn drain_send_file_sendfile(&mut self, pf: &mut PendingSendFile) -> io::Result<bool> {
        let out_fd = self.socket.as_raw_fd();
        let in_fd = pf.file.as_raw_fd();
        while pf.remaining > 0 {
            let n = unsafe { libc::sendfile(out_fd, in_fd, &mut pf.offset, pf.remaining) };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    return Ok(false);
                }
                return Err(err);
            }
            if n == 0 {
                break;
            }
            pf.remaining -= n as usize;
        }
        Ok(true)
    }

    /// TLS path: read a chunk from the file into the output buffer, then
    /// drive the existing encrypted-write machinery until either the
    /// socket blocks or the chunk (and file) is exhausted.
    fn drain_send_file_read_loop(&mut self, pf: &mut PendingSendFile) -> io::Result<bool> {
        const CHUNK: usize = 64 * 1024;
        loop {
            if self.output.readable_bytes() == 0 && pf.remaining > 0 {
                let to_read = CHUNK.min(pf.remaining);
                let mut chunk = vec![0u8; to_read];
                pf.file.read_exact(&mut chunk)?;
                self.output.append(&chunk);
                pf.remaining -= to_read;
            }

            if self.output.readable_bytes() == 0 {
                return Ok(true);
            }

            let result = if let Some(tls) = self.tls.as_mut() {
                let peek = self.output.peek().to_vec();
                tls.write_plaintext(&peek, &mut self.socket).map(|n| {
                    self.output.retrieve(n);
                    n
                })
            } else {
                self.output.write_fd(self.socket.as_raw_fd())
            };

            match result {
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e),
            }
        }
    }
}
