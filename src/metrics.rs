use std::sync::atomic::{AtomicUsize, Ordering};

/// Process-wide server counters, shared by reference between the reactor,
/// the connections, and the workers.
#[repr(C, align(64))]
pub struct ServerMetrics {
    pub active_conns: AtomicUsize,
    pub total_requests: AtomicUsize,
    pub bytes_sent: AtomicUsize,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            active_conns: AtomicUsize::new(0),
            total_requests: AtomicUsize::new(0),
            bytes_sent: AtomicUsize::new(0),
        }
    }

    pub fn conn_opened(&self) -> usize {
        self.active_conns.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn conn_closed(&self) -> usize {
        self.active_conns.fetch_sub(1, Ordering::Relaxed) - 1
    }

    pub fn live_connections(&self) -> usize {
        self.active_conns.load(Ordering::Relaxed)
    }

    pub fn request_served(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}
