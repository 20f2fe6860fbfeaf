//! Bounded pool of database handles plus the form-auth query path.
//!
//! The pool is process-wide: `SqlConnPool::init` opens the handles once at
//! server startup and `checkout` blocks until one is free, so callers never
//! observe an empty pool. Handles are opaque `postgres::Client`s.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex, OnceLock};

use postgres::{Client, NoTls};
use tracing::{debug, error, info, warn};

use crate::error::StokerResult;

/// FIFO queue of handles gated by a counting semaphore realized as a
/// mutex + condvar pair. `queued + checked_out == capacity` holds at every
/// quiescent point.
pub struct BoundedPool<T> {
    queue: Mutex<VecDeque<T>>,
    available: Condvar,
    capacity: usize,
}

impl<T> BoundedPool<T> {
    pub fn new(handles: Vec<T>) -> Self {
        let capacity = handles.len();
        Self {
            queue: Mutex::new(handles.into_iter().collect()),
            available: Condvar::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn idle(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// Take a handle, blocking while none are queued. The guard returns it
    /// on every exit path.
    pub fn checkout(&self) -> PoolGuard<'_, T> {
        let mut queue = self.queue.lock().unwrap();
        loop {
            if let Some(handle) = queue.pop_front() {
                return PoolGuard {
                    pool: self,
                    handle: Some(handle),
                };
            }
            queue = self.available.wait(queue).unwrap();
        }
    }

    fn release(&self, handle: T) {
        self.queue.lock().unwrap().push_back(handle);
        self.available.notify_one();
    }

    /// Remove every queued handle so the caller can free them exactly once.
    pub fn drain(&self) -> Vec<T> {
        self.queue.lock().unwrap().drain(..).collect()
    }
}

/// Scoped acquisition: deref to the handle, release on drop.
pub struct PoolGuard<'a, T> {
    pool: &'a BoundedPool<T>,
    handle: Option<T>,
}

impl<T> Deref for PoolGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.handle.as_ref().expect("guard already released")
    }
}

impl<T> DerefMut for PoolGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.handle.as_mut().expect("guard already released")
    }
}

impl<T> Drop for PoolGuard<'_, T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.release(handle);
        }
    }
}

static INSTANCE: OnceLock<SqlConnPool> = OnceLock::new();

/// Process-wide pool of PostgreSQL clients.
pub struct SqlConnPool {
    inner: BoundedPool<Client>,
}

impl SqlConnPool {
    /// Open up to `size` connections and install the singleton. A handle
    /// that fails to connect is logged and its slot omitted.
    pub fn init(
        host: &str,
        port: u16,
        user: &str,
        password: &str,
        db_name: &str,
        size: usize,
    ) -> StokerResult<()> {
        assert!(size > 0);
        if INSTANCE.get().is_some() {
            warn!("sql pool already initialized");
            return Ok(());
        }

        let mut handles = Vec::with_capacity(size);
        for i in 0..size {
            let result = postgres::Config::new()
                .host(host)
                .port(port)
                .user(user)
                .password(password)
                .dbname(db_name)
                .connect(NoTls);
            match result {
                Ok(client) => handles.push(client),
                Err(e) => error!("sql connection {i} failed: {e}"),
            }
        }

        info!("sql pool open: {}/{} handles", handles.len(), size);
        let _ = INSTANCE.set(SqlConnPool {
            inner: BoundedPool::new(handles),
        });
        Ok(())
    }

    pub fn instance() -> Option<&'static SqlConnPool> {
        INSTANCE.get()
    }

    pub fn checkout(&self) -> PoolGuard<'_, Client> {
        self.inner.checkout()
    }

    pub fn free_count(&self) -> usize {
        self.inner.idle()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    /// Drain the queue and drop every handle (dropping a client closes it).
    pub fn close(&self) {
        let drained = self.inner.drain();
        info!("sql pool closed, {} handles freed", drained.len());
        drop(drained);
    }
}

/// Verify a login or register a new account against `"user"(username,
/// password)`. Any query failure reads as authentication failure.
pub fn user_verify(name: &str, password: &str, is_login: bool) -> bool {
    if name.is_empty() || password.is_empty() {
        return false;
    }
    let Some(pool) = SqlConnPool::instance() else {
        error!("user_verify with no sql pool configured");
        return false;
    };
    if pool.capacity() == 0 {
        error!("user_verify with an empty sql pool");
        return false;
    }
    debug!("verify user {name:?}, login={is_login}");

    let mut client = pool.checkout();
    let row = match client.query(
        "SELECT username, password FROM \"user\" WHERE username = $1 LIMIT 1",
        &[&name],
    ) {
        Ok(rows) => rows.into_iter().next(),
        Err(e) => {
            error!("user lookup failed: {e}");
            return false;
        }
    };

    if is_login {
        match row {
            Some(row) => {
                let stored: String = row.get(1);
                if stored == password {
                    true
                } else {
                    debug!("password mismatch for {name:?}");
                    false
                }
            }
            None => false,
        }
    } else {
        if row.is_some() {
            debug!("username {name:?} already taken");
            return false;
        }
        match client.execute(
            "INSERT INTO \"user\" (username, password) VALUES ($1, $2)",
            &[&name, &password],
        ) {
            Ok(_) => {
                info!("registered user {name:?}");
                true
            }
            Err(e) => {
                error!("insert failed for {name:?}: {e}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn queued_plus_checked_out_equals_capacity() {
        let pool = BoundedPool::new(vec![1, 2, 3]);
        assert_eq!(pool.capacity(), 3);
        assert_eq!(pool.idle(), 3);

        let a = pool.checkout();
        let b = pool.checkout();
        assert_eq!(pool.idle(), 1);
        drop(a);
        assert_eq!(pool.idle(), 2);
        drop(b);
        assert_eq!(pool.idle(), pool.capacity());
    }

    #[test]
    fn checkout_hands_handles_out_in_fifo_order() {
        let pool = BoundedPool::new(vec![10, 20, 30]);
        let a = pool.checkout();
        let b = pool.checkout();
        assert_eq!(*a, 10);
        assert_eq!(*b, 20);
        drop(a);
        drop(b);
        let c = pool.checkout();
        assert_eq!(*c, 30);
    }

    #[test]
    fn blocked_checkout_proceeds_after_release() {
        let pool = Arc::new(BoundedPool::new(vec![7]));
        let held = pool.checkout();

        let done = Arc::new(AtomicUsize::new(0));
        let waiter = {
            let pool = Arc::clone(&pool);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let guard = pool.checkout();
                assert_eq!(*guard, 7);
                done.store(1, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert_eq!(done.load(Ordering::SeqCst), 0, "checkout must block");

        drop(held);
        waiter.join().unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn drain_removes_every_queued_handle() {
        let pool = BoundedPool::new(vec![1, 2, 3]);
        let drained = pool.drain();
        assert_eq!(drained, vec![1, 2, 3]);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn verify_without_pool_rejects() {
        // No singleton configured in unit tests: auth must fail closed.
        assert!(!user_verify("alice", "wonder", true));
        assert!(!user_verify("", "pwd", true));
        assert!(!user_verify("alice", "", false));
    }
}
