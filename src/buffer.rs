//! Growable read/write byte buffer with a reserved prepend region, backed
//! by the process [`MemoryPool`] while small and by the heap once it has
//! outgrown the pool's largest size class.

use std::io;
use std::os::unix::io::RawFd;

use crate::mempool::MemoryPool;

pub const K_CHEAP_PREPEND: usize = 8;
const INITIAL_SIZE: usize = 1024;

/// Where a Buffer's backing storage came from, so `ensure_writable` and
/// `Drop` use the matching allocate/free path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Pool,
    Heap,
}

#[derive(Debug)]
pub struct Buffer {
    data: Vec<u8>,
    reader_index: usize,
    writer_index: usize,
    source: Source,
}

impl Buffer {
    pub fn new() -> Self {
        Self::with_size(INITIAL_SIZE)
    }

    pub fn with_size(initial_size: usize) -> Self {
        let total = initial_size + K_CHEAP_PREPEND;
        let (data, source) = match MemoryPool::global().allocate(total) {
            Some(mut v) => {
                v.resize(v.capacity(), 0);
                (v, Source::Pool)
            }
            None => (vec![0u8; total], Source::Heap),
        };
        stats::note_created();
        Buffer {
            data,
            reader_index: K_CHEAP_PREPEND,
            writer_index: K_CHEAP_PREPEND,
            source,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn readable_bytes(&self) -> usize {
        self.writer_index - self.reader_index
    }

    pub fn writable_bytes(&self) -> usize {
        self.capacity() - self.writer_index
    }

    pub fn prependable_bytes(&self) -> usize {
        self.reader_index
    }

    pub fn peek(&self) -> &[u8] {
        &self.data[self.reader_index..self.writer_index]
    }

    /// Consume `n` readable bytes. Resets both indices to the prepend
    /// boundary once the buffer has been fully drained, so a connection
    /// that alternates full reads and full consumes never grows its
    /// prependable region unboundedly.
    pub fn retrieve(&mut self, n: usize) {
        let n = n.min(self.readable_bytes());
        if n < self.readable_bytes() {
            self.reader_index += n;
        } else {
            self.retrieve_all();
        }
    }

    pub fn retrieve_all(&mut self) {
        self.reader_index = K_CHEAP_PREPEND;
        self.writer_index = K_CHEAP_PREPEND;
    }

    pub fn retrieve_as_string(&mut self, n: usize) -> String {
        let n = n.min(self.readable_bytes());
        let s = String::from_utf8_lossy(&self.data[self.reader_index..self.reader_index + n]).into_owned();
        self.retrieve(n);
        s
    }

    pub fn retrieve_all_as_string(&mut self) -> String {
        let n = self.readable_bytes();
        self.retrieve_as_string(n)
    }

    /// Ensure at least `n` writable bytes, compacting in place when the
    /// existing prependable + writable space suffices, otherwise growing
    /// to an exact fit. Never discards unread bytes.
    pub fn ensure_writable(&mut self, n: usize) {
        if self.writable_bytes() >= n {
            return;
        }
        if self.prependable_bytes() + self.writable_bytes() >= n + K_CHEAP_PREPEND {
            self.compact();
        } else {
            self.grow(n);
        }
    }

    fn compact(&mut self) {
        let readable = self.readable_bytes();
        self.data.copy_within(self.reader_index..self.writer_index, K_CHEAP_PREPEND);
        self.reader_index = K_CHEAP_PREPEND;
        self.writer_index = K_CHEAP_PREPEND + readable;
    }

    fn grow(&mut self, n: usize) {
        let readable = self.readable_bytes();
        let new_capacity = self.writer_index + n;
        let mut new_data = vec![0u8; new_capacity];
        new_data[K_CHEAP_PREPEND..K_CHEAP_PREPEND + readable]
            .copy_from_slice(&self.data[self.reader_index..self.writer_index]);
        if self.source == Source::Pool {
            let old = std::mem::replace(&mut self.data, Vec::new());
            MemoryPool::global().deallocate(old.len(), old);
        }
        self.data = new_data;
        self.reader_index = K_CHEAP_PREPEND;
        self.writer_index = K_CHEAP_PREPEND + readable;
        self.source = Source::Heap;
        stats::note_resize();
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.ensure_writable(bytes.len());
        let start = self.writer_index;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
        self.writer_index += bytes.len();
    }

    /// Finds `"\r\n"` within the readable region, returning its offset
    /// from the start of `peek()` (i.e. `peek()[..offset]` is the line,
    /// `offset + 2` is where the next token starts).
    pub fn find_crlf(&self) -> Option<usize> {
        let readable = self.peek();
        readable.windows(2).position(|w| w == b"\r\n")
    }

    pub fn prepend(&mut self, bytes: &[u8]) {
        assert!(bytes.len() <= self.prependable_bytes());
        self.reader_index -= bytes.len();
        self.data[self.reader_index..self.reader_index + bytes.len()].copy_from_slice(bytes);
    }

    /// Scatter-gather read: a second, ≥64 KiB stack buffer catches
    /// anything past the primary buffer's writable tail in a single
    /// `readv` call, avoiding a grow-then-read round trip for large
    /// datagrams. Data landing in the extra buffer is appended afterward.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra_buf = [0u8; 65536];
        let writable = self.writable_bytes();

        let mut iov = [
            libc::iovec {
                iov_base: unsafe { self.data.as_mut_ptr().add(self.writer_index) as *mut libc::c_void },
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extra_buf.as_mut_ptr() as *mut libc::c_void,
                iov_len: extra_buf.len(),
            },
        ];
        let iov_count = if writable < extra_buf.len() { 2 } else { 1 };

        let n = unsafe { libc::readv(fd, iov.as_mut_ptr(), iov_count as libc::c_int) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = n as usize;
        if n <= writable {
            self.writer_index += n;
        } else {
            self.writer_index = self.capacity();
            let extra = n - writable;
            self.append(&extra_buf[..extra]);
        }
        Ok(n)
    }

    pub fn write_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let data = self.peek();
        let n = unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = n as usize;
        self.retrieve(n);
        Ok(n)
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Buffer::new()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if self.source == Source::Pool {
            let data = std::mem::take(&mut self.data);
            let len = data.len();
            MemoryPool::global().deallocate(len, data);
        }
        stats::note_dropped();
    }
}

/// Debug-only aggregate counters mirroring what `/debug/stats` reports.
pub mod stats {
    use std::sync::atomic::{AtomicUsize, Ordering};

    static ACTIVE_BUFFERS: AtomicUsize = AtomicUsize::new(0);
    static RESIZE_COUNT: AtomicUsize = AtomicUsize::new(0);

    pub fn note_created() {
        ACTIVE_BUFFERS.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_dropped() {
        ACTIVE_BUFFERS.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn note_resize() {
        RESIZE_COUNT.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active_buffers() -> usize {
        ACTIVE_BUFFERS.load(Ordering::Relaxed)
    }

    pub fn resize_count() -> usize {
        RESIZE_COUNT.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_retrieve_all_round_trip() {
        let mut buf = Buffer::new();
        buf.append(b"hello world");
        assert_eq!(buf.retrieve_all_as_string(), "hello world");
    }

    #[test]
    fn indices_stay_ordered() {
        let mut buf = Buffer::new();
        buf.append(b"abc");
        buf.retrieve(1);
        assert!(buf.reader_index <= buf.writer_index);
        assert!(buf.writer_index <= buf.capacity());
    }

    #[test]
    fn ensure_writable_preserves_content() {
        let mut buf = Buffer::with_size(16);
        buf.append(b"0123456789");
        buf.retrieve(8);
        // Triggers compaction, not growth, since prependable+writable is
        // large enough.
        buf.ensure_writable(20);
        assert_eq!(buf.peek(), b"89");
    }

    #[test]
    fn grows_when_compaction_is_insufficient() {
        let mut buf = Buffer::with_size(16);
        buf.append(b"0123456789abcdef");
        buf.ensure_writable(100);
        assert!(buf.writable_bytes() >= 100);
        assert_eq!(buf.peek(), b"0123456789abcdef");
    }

    #[test]
    fn prepend_writes_before_reader_index() {
        let mut buf = Buffer::new();
        buf.append(b"world");
        buf.prepend(b"hello ");
        assert_eq!(buf.retrieve_all_as_string(), "hello world");
    }

    #[test]
    fn find_crlf_locates_line_boundary() {
        let mut buf = Buffer::new();
        buf.append(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        let pos = buf.find_crlf().unwrap();
        assert_eq!(&buf.peek()[..pos], b"GET / HTTP/1.1");
    }

    #[test]
    fn find_crlf_none_without_terminator() {
        let mut buf = Buffer::new();
        buf.append(b"partial line");
        assert!(buf.find_crlf().is_none());
    }
}
