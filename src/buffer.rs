use std::io;
use std::os::unix::io::RawFd;

use libc::{c_void, iovec};

const INITIAL_SIZE: usize = 1024;

/// Stack spill used by the scatter read when the writable tail is short.
const SPILL_SIZE: usize = 64 * 1024;

/// Growable contiguous byte buffer with a read cursor and a write cursor.
///
/// The readable extent is `[read_pos, write_pos)`, the writable extent is
/// `[write_pos, storage.len())`, and `[0, read_pos)` is reclaimable by
/// compaction. One buffer per direction per connection.
pub struct Buffer {
    storage: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl Buffer {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }

    pub fn with_capacity(size: usize) -> Self {
        Self {
            storage: vec![0; size],
            read_pos: 0,
            write_pos: 0,
        }
    }

    pub fn readable_len(&self) -> usize {
        self.write_pos - self.read_pos
    }

    pub fn writable_len(&self) -> usize {
        self.storage.len() - self.write_pos
    }

    pub fn prependable_len(&self) -> usize {
        self.read_pos
    }

    /// The readable extent, starting at the read cursor.
    pub fn peek(&self) -> &[u8] {
        &self.storage[self.read_pos..self.write_pos]
    }

    /// Advance the read cursor past `n` consumed bytes.
    ///
    /// `n` must not exceed `readable_len`; exceeding it is a programming
    /// error.
    pub fn consume(&mut self, n: usize) {
        assert!(n <= self.readable_len(), "consume past readable extent");
        self.read_pos += n;
    }

    /// Drop everything and rewind both cursors.
    pub fn reset(&mut self) {
        self.storage.iter_mut().for_each(|b| *b = 0);
        self.read_pos = 0;
        self.write_pos = 0;
    }

    /// Take the readable extent as a `String` (lossy) and reset.
    pub fn drain_to_string(&mut self) -> String {
        let s = String::from_utf8_lossy(self.peek()).into_owned();
        self.reset();
        s
    }

    /// The writable extent, starting at the write cursor.
    pub fn begin_write(&mut self) -> &mut [u8] {
        let w = self.write_pos;
        &mut self.storage[w..]
    }

    /// Commit `n` bytes written into the writable extent.
    pub fn has_written(&mut self, n: usize) {
        debug_assert!(n <= self.writable_len());
        self.write_pos += n;
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        let w = self.write_pos;
        self.storage[w..w + data.len()].copy_from_slice(data);
        self.has_written(data.len());
    }

    pub fn append_str(&mut self, s: &str) {
        self.append(s.as_bytes());
    }

    /// Guarantee at least `n` writable bytes, compacting the consumed
    /// prefix first and growing the backing storage only when compaction
    /// cannot make room.
    pub fn ensure_writable(&mut self, n: usize) {
        if self.writable_len() >= n {
            return;
        }
        if self.writable_len() + self.prependable_len() >= n {
            let readable = self.readable_len();
            self.storage.copy_within(self.read_pos..self.write_pos, 0);
            self.read_pos = 0;
            self.write_pos = readable;
        } else {
            self.storage.resize(self.write_pos + n + 1, 0);
        }
        debug_assert!(self.writable_len() >= n);
    }

    /// Single scatter read from `fd` into the writable tail plus a 64 KiB
    /// stack spill; overflow beyond the tail is appended (growing the
    /// buffer). Returns the byte count from `readv`, zero meaning EOF; the
    /// errno of a failed read is carried in the `io::Error`.
    pub fn read_from_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut spill = [0u8; SPILL_SIZE];
        let writable = self.writable_len();
        let iov = [
            iovec {
                iov_base: unsafe { self.storage.as_mut_ptr().add(self.write_pos) } as *mut c_void,
                iov_len: writable,
            },
            iovec {
                iov_base: spill.as_mut_ptr() as *mut c_void,
                iov_len: SPILL_SIZE,
            },
        ];
        let n = unsafe { libc::readv(fd, iov.as_ptr(), 2) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = n as usize;
        if n <= writable {
            self.write_pos += n;
        } else {
            self.write_pos = self.storage.len();
            self.append(&spill[..n - writable]);
        }
        Ok(n)
    }

    /// Single write of the readable extent to `fd`, advancing the read
    /// cursor by the count actually written.
    pub fn write_to_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let readable = self.readable_len();
        let n = unsafe {
            libc::write(
                fd,
                self.storage.as_ptr().add(self.read_pos) as *const c_void,
                readable,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        self.read_pos += n as usize;
        Ok(n as usize)
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}
