use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::conn::{Conn, ConnShared};
use crate::db::SqlConnPool;
use crate::error::StokerResult;
use crate::metrics::ServerMetrics;
use crate::syscalls::{
    self, Epoller, EV_ERR, EV_ET, EV_HUP, EV_IN, EV_ONESHOT, EV_OUT, EV_RDHUP,
};
use crate::threadpool::ThreadPool;
use crate::timer::HeapTimer;

/// Hard ceiling on concurrent connections; past it, new clients get the
/// inline overload reply.
const MAX_FD: usize = 65_536;

/// Events drained per `wait`.
const MAX_EVENTS: usize = 1024;

/// Ceiling on a single multiplexer wait when no deadline is armed, so the
/// shutdown flag is observed promptly.
const IDLE_WAIT_MS: i32 = 500;

type ConnMap = Rc<RefCell<HashMap<RawFd, Arc<Mutex<Conn>>>>>;

/// The reactor: owns the listening socket, the timer heap, and the
/// fd → connection map; dispatches readiness events to worker tasks.
///
/// Single-threaded by construction (the map is `Rc`); the pieces workers
/// touch — connections, the epoll handle, the metrics — are shared
/// explicitly.
pub struct Server {
    config: ServerConfig,
    listen_fd: RawFd,
    listen_mask: u32,
    conn_mask: u32,
    epoll: Arc<Epoller>,
    timer: HeapTimer,
    /// Taken (and thereby joined) during drop, before the DB pool drains.
    pool: Option<ThreadPool>,
    users: ConnMap,
    shared: Arc<ConnShared>,
    metrics: Arc<ServerMetrics>,
    shutdown: Arc<AtomicBool>,
}

impl Server {
    pub fn new(config: ServerConfig) -> StokerResult<Self> {
        config.validate()?;

        let mut listen_mask = EV_RDHUP;
        let mut conn_mask = EV_ONESHOT | EV_RDHUP;
        if config.listen_edge_triggered() {
            listen_mask |= EV_ET;
        }
        if config.conn_edge_triggered() {
            conn_mask |= EV_ET;
        }

        if config.db_pool_size > 0 {
            SqlConnPool::init(
                &config.db_host,
                config.db_port,
                &config.db_user,
                &config.db_password,
                &config.db_name,
                config.db_pool_size,
            )?;
        }

        let metrics = Arc::new(ServerMetrics::new());
        let shared = Arc::new(ConnShared {
            src_dir: config.src_dir.clone(),
            edge_triggered: config.conn_edge_triggered(),
            metrics: Arc::clone(&metrics),
        });

        let listen_fd = syscalls::create_listen_socket(config.port, config.linger)?;
        let epoll = match Epoller::new().and_then(|ep| {
            ep.add(listen_fd, listen_mask | EV_IN)?;
            Ok(ep)
        }) {
            Ok(ep) => Arc::new(ep),
            Err(e) => {
                syscalls::close_fd(listen_fd);
                return Err(e.into());
            }
        };

        let pool = ThreadPool::new(config.effective_workers());

        info!("========== server init ==========");
        info!("port: {}, linger: {}", config.port, config.linger);
        info!(
            "listen mode: {}, conn mode: {}",
            if config.listen_edge_triggered() { "ET" } else { "LT" },
            if config.conn_edge_triggered() { "ET" } else { "LT" },
        );
        info!("resource root: {}", config.src_dir.display());
        info!(
            "db pool: {}, workers: {}",
            config.db_pool_size,
            config.effective_workers()
        );

        Ok(Self {
            config,
            listen_fd,
            listen_mask,
            conn_mask,
            epoll,
            timer: HeapTimer::new(),
            pool: Some(pool),
            users: Rc::new(RefCell::new(HashMap::new())),
            shared,
            metrics,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Flag handle for signal handlers and tests; setting it makes `start`
    /// return within one wait interval.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn metrics(&self) -> Arc<ServerMetrics> {
        Arc::clone(&self.metrics)
    }

    fn idle_timeout(&self) -> Option<Duration> {
        (self.config.timeout_ms > 0).then(|| Duration::from_millis(self.config.timeout_ms))
    }

    /// The event loop. Exits only via the shutdown flag.
    pub fn start(&mut self) {
        let mut events = syscalls::event_list(MAX_EVENTS);
        info!("========== server start ==========");
        while !self.shutdown.load(Ordering::Acquire) {
            // Waking early is harmless (the loop recomputes); waking late
            // would stall both eviction and shutdown, so cap the wait.
            let timeout_ms = match self.timer.next_tick_ms() {
                -1 => IDLE_WAIT_MS,
                ms => ms.min(IDLE_WAIT_MS),
            };
            let n = match self.epoll.wait(&mut events, timeout_ms) {
                Ok(n) => n,
                Err(e) => {
                    error!("epoll wait failed: {e}");
                    continue;
                }
            };
            for event in &events[..n] {
                let fd = syscalls::event_fd(event);
                let mask = syscalls::event_mask(event);
                if fd == self.listen_fd {
                    self.deal_listen();
                } else if mask & (EV_RDHUP | EV_HUP | EV_ERR) != 0 {
                    self.close_conn(fd);
                } else if mask & EV_IN != 0 {
                    self.deal_read(fd);
                } else if mask & EV_OUT != 0 {
                    self.deal_write(fd);
                } else {
                    error!("unexpected event mask {mask:#x} on fd {fd}");
                }
            }
        }
        info!("========== server stop ==========");
    }

    /// Accept pending clients; in edge-triggered listen mode the queue must
    /// be drained before the next event arrives.
    fn deal_listen(&mut self) {
        loop {
            match syscalls::accept_connection(self.listen_fd) {
                Ok(Some((fd, peer))) => {
                    if self.metrics.live_connections() >= MAX_FD {
                        self.send_busy(fd);
                        warn!("clients full, rejected {peer}");
                    } else {
                        self.add_client(fd, peer);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!("accept failed: {e}");
                    break;
                }
            }
            if self.listen_mask & EV_ET == 0 {
                break;
            }
        }
    }

    fn send_busy(&self, fd: RawFd) {
        if syscalls::write_fd(fd, b"Server busy!").is_err() {
            warn!("busy reply to client[{fd}] failed");
        }
        syscalls::close_fd(fd);
    }

    fn add_client(&mut self, fd: RawFd, peer: SocketAddr) {
        let conn = Arc::new(Mutex::new(Conn::init(fd, peer, Arc::clone(&self.shared))));
        self.users.borrow_mut().insert(fd, Arc::clone(&conn));

        if let Some(ttl) = self.idle_timeout() {
            // The callback runs on the reactor thread inside tick(); it
            // looks the fd up at fire time instead of capturing the
            // connection's storage.
            let users = Rc::clone(&self.users);
            let epoll = Arc::clone(&self.epoll);
            self.timer.add(fd, ttl, move || {
                if let Some(conn) = users.borrow_mut().remove(&fd) {
                    let mut conn = conn.lock().unwrap();
                    if !conn.is_closed() {
                        debug!("client[{fd}] idle timeout");
                    }
                    let _ = epoll.remove(fd);
                    conn.close();
                }
            });
        }

        if let Err(e) = self.epoll.add(fd, self.conn_mask | EV_IN) {
            error!("register client[{fd}] failed: {e}");
            self.users.borrow_mut().remove(&fd);
        }
    }

    /// Hangup or error from the multiplexer: close on the reactor thread.
    fn close_conn(&mut self, fd: RawFd) {
        let Some(conn) = self.users.borrow_mut().remove(&fd) else {
            return;
        };
        let _ = self.epoll.remove(fd);
        conn.lock().unwrap().close();
    }

    fn extend_time(&mut self, fd: RawFd) {
        if let Some(ttl) = self.idle_timeout() {
            self.timer.adjust(fd, ttl);
        }
    }

    fn deal_read(&mut self, fd: RawFd) {
        let Some(conn) = self.users.borrow().get(&fd).cloned() else {
            warn!("read event for unknown fd {fd}");
            return;
        };
        self.extend_time(fd);
        let epoll = Arc::clone(&self.epoll);
        let conn_mask = self.conn_mask;
        if self.pool().submit(move || on_read(conn, epoll, conn_mask)).is_err() {
            error!("worker pool rejected read task for client[{fd}]");
            self.close_conn(fd);
        }
    }

    fn pool(&self) -> &ThreadPool {
        self.pool.as_ref().expect("worker pool is gone")
    }

    fn deal_write(&mut self, fd: RawFd) {
        let Some(conn) = self.users.borrow().get(&fd).cloned() else {
            warn!("write event for unknown fd {fd}");
            return;
        };
        self.extend_time(fd);
        let epoll = Arc::clone(&self.epoll);
        let conn_mask = self.conn_mask;
        if self.pool().submit(move || on_write(conn, epoll, conn_mask)).is_err() {
            error!("worker pool rejected write task for client[{fd}]");
            self.close_conn(fd);
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        syscalls::close_fd(self.listen_fd);
        self.timer.clear();
        // Dropping the map closes every remaining connection.
        self.users.borrow_mut().clear();
        // Workers must be joined before the DB pool drains: a task still
        // holding or awaiting a handle would otherwise never finish.
        drop(self.pool.take());
        if let Some(pool) = SqlConnPool::instance() {
            pool.close();
        }
        info!("server shut down");
    }
}

/// Worker half of a read event: fill the in-buffer, drive the parser, and
/// re-arm the fd for the next step.
fn on_read(conn: Arc<Mutex<Conn>>, epoll: Arc<Epoller>, conn_mask: u32) {
    let mut conn = conn.lock().unwrap();
    match conn.read() {
        Ok(0) => {
            info!("client[{}] closed by peer", conn.fd());
            close_from_worker(&mut conn, &epoll);
            return;
        }
        Err(e) if e.kind() != io::ErrorKind::WouldBlock => {
            info!("client[{}] read error: {e}", conn.fd());
            close_from_worker(&mut conn, &epoll);
            return;
        }
        _ => {}
    }
    on_process(&mut conn, &epoll, conn_mask);
}

/// Worker half of a write event: drain the gather buffers; when the
/// response is out either recycle the connection (keep-alive) or close it.
fn on_write(conn: Arc<Mutex<Conn>>, epoll: Arc<Epoller>, conn_mask: u32) {
    let mut conn = conn.lock().unwrap();
    match conn.write() {
        Ok(_) if conn.bytes_pending_write() == 0 => {
            if conn.keep_alive() {
                on_process(&mut conn, &epoll, conn_mask);
            } else {
                close_from_worker(&mut conn, &epoll);
            }
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            rearm(&conn, &epoll, conn_mask | EV_OUT);
        }
        Ok(_) => close_from_worker(&mut conn, &epoll),
        Err(e) => {
            info!("client[{}] write error: {e}", conn.fd());
            close_from_worker(&mut conn, &epoll);
        }
    }
}

fn on_process(conn: &mut Conn, epoll: &Epoller, conn_mask: u32) {
    if conn.process() {
        rearm(conn, epoll, conn_mask | EV_OUT);
    } else {
        rearm(conn, epoll, conn_mask | EV_IN);
    }
}

fn rearm(conn: &Conn, epoll: &Epoller, mask: u32) {
    if let Err(e) = epoll.modify(conn.fd(), mask) {
        debug!("re-arm client[{}] failed: {e}", conn.fd());
    }
}

/// Unregister before closing so a concurrently accepted reuse of the fd
/// cannot lose its registration.
fn close_from_worker(conn: &mut Conn, epoll: &Epoller) {
    let _ = epoll.remove(conn.fd());
    conn.close();
}
