use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info};

use crate::buffer::Buffer;
use crate::metrics::ServerMetrics;
use crate::request::{HttpRequest, ParseOutcome};
use crate::response::HttpResponse;
use crate::syscalls;

/// Server-wide state every connection needs: the resource root, the
/// trigger mode, and the shared counters.
pub struct ConnShared {
    pub src_dir: PathBuf,
    pub edge_triggered: bool,
    pub metrics: Arc<ServerMetrics>,
}

/// One accepted connection: socket, per-direction buffers, parser and
/// responder, plus the gather-write cursor into the mapped body.
///
/// A connection is driven by at most one worker task at a time (one-shot
/// registration), so its interior needs no further synchronization.
pub struct Conn {
    fd: RawFd,
    peer: SocketAddr,
    closed: bool,
    keep_alive: bool,
    read_buf: Buffer,
    write_buf: Buffer,
    request: HttpRequest,
    response: HttpResponse,
    /// Bytes of the mapped file already pushed to the socket.
    file_written: usize,
    shared: Arc<ConnShared>,
}

impl Conn {
    pub fn init(fd: RawFd, peer: SocketAddr, shared: Arc<ConnShared>) -> Self {
        assert!(fd >= 0);
        let live = shared.metrics.conn_opened();
        info!("client[{fd}]({peer}) in, live connections: {live}");
        Self {
            fd,
            peer,
            closed: false,
            keep_alive: false,
            read_buf: Buffer::new(),
            write_buf: Buffer::new(),
            request: HttpRequest::new(),
            response: HttpResponse::new(),
            file_written: 0,
            shared,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Fill the in-buffer from the socket. `Ok(0)` is EOF; an edge-triggered
    /// connection drains until it would block, reporting the last count
    /// read. `Err(WouldBlock)` means no byte was available at all.
    pub fn read(&mut self) -> io::Result<usize> {
        let mut last = 0;
        loop {
            match self.read_buf.read_from_fd(self.fd) {
                Ok(0) => return Ok(0),
                Ok(n) => {
                    last = n;
                    if !self.shared.edge_triggered {
                        return Ok(n);
                    }
                }
                Err(e) => {
                    if e.kind() == io::ErrorKind::WouldBlock && last > 0 {
                        return Ok(last);
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Parse whatever is buffered; once a request is complete (or broken),
    /// build the response into the out-buffer and publish the mapped body.
    /// Returns true when there is a response to write.
    pub fn process(&mut self) -> bool {
        if self.read_buf.readable_len() == 0 {
            return false;
        }
        match self.request.parse(&mut self.read_buf) {
            Ok(ParseOutcome::Complete) => {
                debug!("client[{}] request for {}", self.fd, self.request.path());
                self.keep_alive = self.request.is_keep_alive();
                let (src_dir, path) = (self.shared.src_dir.clone(), self.request.path().to_owned());
                self.response.init(&src_dir, &path, self.keep_alive, 0);
            }
            Ok(ParseOutcome::Incomplete) => return false,
            Err(e) => {
                debug!("client[{}] parse error: {e:?}", self.fd);
                self.keep_alive = false;
                let (src_dir, path) = (self.shared.src_dir.clone(), self.request.path().to_owned());
                self.response.init(&src_dir, &path, false, 400);
            }
        }
        self.request.reset();
        self.response.build(&mut self.write_buf);
        self.file_written = 0;
        self.shared.metrics.request_served();
        true
    }

    /// Gather-write the header bytes and the mapped body. Drains until
    /// everything is flushed or the socket would block; the advance
    /// contract is "exactly n bytes across the logical header+body stream"
    /// per call.
    pub fn write(&mut self) -> io::Result<usize> {
        let mut total = 0;
        loop {
            let head_len = self.write_buf.readable_len();
            let n = {
                let head = self.write_buf.peek();
                let file = match self.response.file() {
                    Some(f) if self.file_written < f.len() => &f[self.file_written..],
                    _ => &[][..],
                };
                if head.is_empty() && file.is_empty() {
                    return Ok(total);
                }
                syscalls::writev(self.fd, &[head, file])?
            };
            self.shared.metrics.add_bytes(n);
            total += n;
            if n > head_len {
                self.file_written += n - head_len;
                if head_len > 0 {
                    self.write_buf.consume(head_len);
                }
            } else {
                self.write_buf.consume(n);
            }
            if self.bytes_pending_write() == 0 {
                return Ok(total);
            }
        }
    }

    /// Header bytes plus unsent body bytes still owed to the peer.
    pub fn bytes_pending_write(&self) -> usize {
        self.write_buf.readable_len() + self.response.file_len().saturating_sub(self.file_written)
    }

    /// Release the mapping, close the socket, and drop the live count.
    /// Safe to call more than once.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.response.unmap();
        syscalls::close_fd(self.fd);
        let live = self.shared.metrics.conn_closed();
        info!("client[{}]({}) quit, live connections: {live}", self.fd, self.peer);
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        self.close();
    }
}
