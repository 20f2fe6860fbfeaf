//! Thin safe wrappers over the raw socket and epoll syscalls the reactor
//! drives. Failures are reported as `io::Error` carrying the errno; nothing
//! in here panics on I/O.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::unix::io::RawFd;
use std::ptr;

use libc::{c_int, c_void, socklen_t};

pub const EV_IN: u32 = libc::EPOLLIN as u32;
pub const EV_OUT: u32 = libc::EPOLLOUT as u32;
pub const EV_RDHUP: u32 = libc::EPOLLRDHUP as u32;
pub const EV_HUP: u32 = libc::EPOLLHUP as u32;
pub const EV_ERR: u32 = libc::EPOLLERR as u32;
pub const EV_ONESHOT: u32 = libc::EPOLLONESHOT as u32;
pub const EV_ET: u32 = libc::EPOLLET as u32;

/// Readiness multiplexer over an epoll instance.
///
/// Every method takes `&self` (epoll_ctl and epoll_wait are thread-safe),
/// so workers can re-arm fds through a shared handle while the reactor
/// waits. The event array lives with the reactor, which passes it to
/// `wait` and reads the entries back through `event_fd`/`event_mask`.
pub struct Epoller {
    fd: RawFd,
}

/// A zeroed event array for `Epoller::wait`.
pub fn event_list(max_events: usize) -> Vec<libc::epoll_event> {
    assert!(max_events > 0);
    vec![libc::epoll_event { events: 0, u64: 0 }; max_events]
}

pub fn event_fd(event: &libc::epoll_event) -> RawFd {
    event.u64 as RawFd
}

pub fn event_mask(event: &libc::epoll_event) -> u32 {
    event.events
}

impl Epoller {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::epoll_create1(0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd })
    }

    pub fn add(&self, fd: RawFd, mask: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, mask)
    }

    pub fn modify(&self, fd: RawFd, mask: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, mask)
    }

    pub fn remove(&self, fd: RawFd) -> io::Result<()> {
        let rc = unsafe { libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            // Removing twice, or after the fd closed, is not an error.
            if err.raw_os_error() != Some(libc::ENOENT) && err.raw_os_error() != Some(libc::EBADF) {
                return Err(err);
            }
        }
        Ok(())
    }

    fn ctl(&self, op: c_int, fd: RawFd, mask: u32) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: mask,
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.fd, op, fd, &mut event) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Block for up to `timeout_ms` (−1 blocks indefinitely) and return the
    /// number of ready events filled into `events`. EINTR reads as zero
    /// events.
    pub fn wait(&self, events: &mut [libc::epoll_event], timeout_ms: i32) -> io::Result<usize> {
        let rc = unsafe {
            libc::epoll_wait(
                self.fd,
                events.as_mut_ptr(),
                events.len() as c_int,
                timeout_ms,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(0);
            }
            return Err(err);
        }
        Ok(rc as usize)
    }
}

impl Drop for Epoller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Create the non-blocking listening socket: SO_REUSEADDR always, and an
/// optional one-second SO_LINGER for draining close.
pub fn create_listen_socket(port: u16, linger: bool) -> io::Result<RawFd> {
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        if linger {
            let opt = libc::linger {
                l_onoff: 1,
                l_linger: 1,
            };
            if libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_LINGER,
                &opt as *const _ as *const c_void,
                mem::size_of_val(&opt) as socklen_t,
            ) < 0
            {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(err);
            }
        }

        let one: c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        let addr = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: port.to_be(),
            sin_addr: libc::in_addr {
                s_addr: libc::INADDR_ANY.to_be(),
            },
            sin_zero: [0; 8],
        };
        if libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            mem::size_of_val(&addr) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        if libc::listen(fd, libc::SOMAXCONN) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        Ok(fd)
    }
}

/// Accept one pending connection, already non-blocking, with its peer
/// address. `Ok(None)` means the accept queue is drained.
pub fn accept_connection(listen_fd: RawFd) -> io::Result<Option<(RawFd, SocketAddr)>> {
    unsafe {
        let mut addr: libc::sockaddr_in = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_in>() as socklen_t;
        let fd = libc::accept4(
            listen_fd,
            &mut addr as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK,
        );
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(err);
        }
        let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
        let port = u16::from_be(addr.sin_port);
        Ok(Some((fd, SocketAddr::V4(SocketAddrV4::new(ip, port)))))
    }
}

/// Vectored write of up to eight slices in a single syscall.
pub fn writev(fd: RawFd, bufs: &[&[u8]]) -> io::Result<usize> {
    if bufs.is_empty() {
        return Ok(0);
    }
    let mut iovecs: [libc::iovec; 8] = unsafe { mem::zeroed() };
    let iov_count = bufs.len().min(8);
    for (slot, buf) in iovecs.iter_mut().zip(bufs.iter()) {
        slot.iov_base = buf.as_ptr() as *mut c_void;
        slot.iov_len = buf.len();
    }
    let n = unsafe { libc::writev(fd, iovecs.as_ptr(), iov_count as c_int) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Best-effort plain write, for the inline overload reply.
pub fn write_fd(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd, buf.as_ptr() as *const c_void, buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

pub fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpStream;

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn readiness_is_reported_for_registered_fds() {
        let epoll = Epoller::new().unwrap();
        let mut events = event_list(16);
        let (rd, wr) = pipe();
        epoll.add(rd, EV_IN).unwrap();

        assert_eq!(epoll.wait(&mut events, 0).unwrap(), 0);

        unsafe { libc::write(wr, b"x".as_ptr() as *const c_void, 1) };
        let n = epoll.wait(&mut events, 100).unwrap();
        assert_eq!(n, 1);
        assert_eq!(event_fd(&events[0]), rd);
        assert!(event_mask(&events[0]) & EV_IN != 0);

        epoll.remove(rd).unwrap();
        epoll.remove(rd).unwrap(); // idempotent
        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }

    #[test]
    fn one_shot_registration_reports_once_until_rearmed() {
        let epoll = Epoller::new().unwrap();
        let mut events = event_list(16);
        let (rd, wr) = pipe();
        epoll.add(rd, EV_IN | EV_ONESHOT).unwrap();

        unsafe { libc::write(wr, b"x".as_ptr() as *const c_void, 1) };
        assert_eq!(epoll.wait(&mut events, 100).unwrap(), 1);
        // Data still pending, but the one-shot registration is spent.
        assert_eq!(epoll.wait(&mut events, 50).unwrap(), 0);

        epoll.modify(rd, EV_IN | EV_ONESHOT).unwrap();
        assert_eq!(epoll.wait(&mut events, 100).unwrap(), 1);

        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }

    #[test]
    fn listen_socket_accepts_a_client() {
        let listen_fd = create_listen_socket(0, false).unwrap();
        // Recover the kernel-chosen port.
        let port = unsafe {
            let mut addr: libc::sockaddr_in = mem::zeroed();
            let mut len = mem::size_of::<libc::sockaddr_in>() as socklen_t;
            assert_eq!(
                libc::getsockname(listen_fd, &mut addr as *mut _ as *mut libc::sockaddr, &mut len),
                0
            );
            u16::from_be(addr.sin_port)
        };

        assert!(accept_connection(listen_fd).unwrap().is_none());

        let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        client.write_all(b"ping").unwrap();

        // Accept can lag the connect slightly on a loopback socket.
        let mut accepted = None;
        for _ in 0..50 {
            if let Some(pair) = accept_connection(listen_fd).unwrap() {
                accepted = Some(pair);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        let (fd, peer) = accepted.expect("no connection accepted");
        assert!(peer.ip().is_loopback());

        close_fd(fd);
        close_fd(listen_fd);
    }

    #[test]
    fn writev_crosses_slice_boundaries() {
        let (rd, wr) = pipe();
        let n = writev(wr, &[b"HTTP/1.1 200 OK\r\n\r\n".as_slice(), b"HELLO".as_slice()]).unwrap();
        assert_eq!(n, 24);
        let mut out = [0u8; 64];
        let got = unsafe { libc::read(rd, out.as_mut_ptr() as *mut c_void, out.len()) };
        assert_eq!(&out[..got as usize], b"HTTP/1.1 200 OK\r\n\r\nHELLO");
        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }
}
