use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use tracing::debug;

use crate::error::{StokerError, StokerResult};

type Task = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    tasks: VecDeque<Task>,
    shutting_down: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    available: Condvar,
}

/// Fixed-size worker pool over a FIFO task queue.
///
/// Tasks submitted before shutdown run exactly once; workers exit only when
/// the shutdown flag is set and the queue has drained. Cross-task ordering
/// is unspecified; per-connection ordering is the reactor's job (one-shot
/// registration keeps at most one task in flight per connection).
pub struct ThreadPool {
    shared: Arc<PoolShared>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    pub fn new(thread_count: usize) -> Self {
        assert!(thread_count > 0);
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                tasks: VecDeque::new(),
                shutting_down: false,
            }),
            available: Condvar::new(),
        });

        let core_ids = core_affinity::get_core_ids().unwrap_or_default();
        let mut workers = Vec::with_capacity(thread_count);
        for i in 0..thread_count {
            let shared = Arc::clone(&shared);
            let core_id = core_ids.get(i % core_ids.len().max(1)).copied();
            let handle = thread::Builder::new()
                .name(format!("stoker-worker-{i}"))
                .spawn(move || {
                    if let Some(id) = core_id {
                        if core_affinity::set_for_current(id) {
                            debug!("worker {} pinned to cpu {}", i, id.id);
                        }
                    }
                    worker_loop(&shared);
                })
                .expect("failed to spawn pool worker");
            workers.push(handle);
        }

        Self { shared, workers }
    }

    /// Queue a task and wake one worker. Fails once shutdown has begun.
    pub fn submit<F: FnOnce() + Send + 'static>(&self, task: F) -> StokerResult<()> {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.shutting_down {
                return Err(StokerError::PoolClosed);
            }
            state.tasks.push_back(Box::new(task));
        }
        self.shared.available.notify_one();
        Ok(())
    }
}

fn worker_loop(shared: &PoolShared) {
    loop {
        let task = {
            let mut state = shared.state.lock().unwrap();
            loop {
                if let Some(task) = state.tasks.pop_front() {
                    break task;
                }
                if state.shutting_down {
                    return;
                }
                state = shared.available.wait(state).unwrap();
            }
        };
        task();
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.shutting_down = true;
        }
        self.shared.available.notify_all();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}
