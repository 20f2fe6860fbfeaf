use std::collections::HashMap;
use std::time::{Duration, Instant};

type ExpireCallback = Box<dyn FnOnce()>;

struct TimerNode {
    id: i32,
    deadline: Instant,
    on_expire: Option<ExpireCallback>,
}

impl TimerNode {
    /// Total order: earliest deadline first, ties broken by id so that
    /// expiry order is deterministic.
    fn sorts_before(&self, other: &TimerNode) -> bool {
        (self.deadline, self.id) < (other.deadline, other.id)
    }
}

/// Array-backed binary min-heap of per-connection deadlines, keyed by fd,
/// with an `id -> index` map kept consistent across every swap.
///
/// Owned by the reactor thread; never shared.
pub struct HeapTimer {
    heap: Vec<TimerNode>,
    index_of: HashMap<i32, usize>,
}

impl HeapTimer {
    pub fn new() -> Self {
        Self {
            heap: Vec::with_capacity(64),
            index_of: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Arm (or re-arm) the deadline for `id`. A known id gets its deadline
    /// and callback replaced in place and re-heapified; a new id is pushed
    /// at the tail and sifted up.
    pub fn add<F: FnOnce() + 'static>(&mut self, id: i32, ttl: Duration, on_expire: F) {
        let deadline = Instant::now() + ttl;
        match self.index_of.get(&id).copied() {
            Some(i) => {
                self.heap[i].deadline = deadline;
                self.heap[i].on_expire = Some(Box::new(on_expire));
                if !self.sift_down(i, self.heap.len()) {
                    self.sift_up(i);
                }
            }
            None => {
                let i = self.heap.len();
                self.index_of.insert(id, i);
                self.heap.push(TimerNode {
                    id,
                    deadline,
                    on_expire: Some(Box::new(on_expire)),
                });
                self.sift_up(i);
            }
        }
    }

    /// Push the deadline for `id` out by `ttl` from now. Unknown ids are
    /// ignored: a worker may have closed the connection between event
    /// delivery and this call.
    pub fn adjust(&mut self, id: i32, ttl: Duration) {
        let Some(i) = self.index_of.get(&id).copied() else {
            return;
        };
        self.heap[i].deadline = Instant::now() + ttl;
        if !self.sift_down(i, self.heap.len()) {
            self.sift_up(i);
        }
    }

    /// Fire `id`'s callback immediately, then drop the node.
    pub fn do_work(&mut self, id: i32) {
        let Some(i) = self.index_of.get(&id).copied() else {
            return;
        };
        if let Some(cb) = self.heap[i].on_expire.take() {
            cb();
        }
        self.delete(i);
    }

    /// Fire and remove every node whose deadline has passed, in deadline
    /// order.
    pub fn tick(&mut self) {
        let now = Instant::now();
        while let Some(front) = self.heap.first_mut() {
            if front.deadline > now {
                break;
            }
            let cb = front.on_expire.take();
            if let Some(cb) = cb {
                cb();
            }
            self.pop();
        }
    }

    pub fn pop(&mut self) {
        assert!(!self.heap.is_empty());
        self.delete(0);
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.index_of.clear();
    }

    /// Milliseconds until the earliest deadline after expired nodes have
    /// fired; `-1` when no deadline is armed. Feeds the multiplexer wait.
    pub fn next_tick_ms(&mut self) -> i32 {
        self.tick();
        match self.heap.first() {
            Some(front) => front
                .deadline
                .saturating_duration_since(Instant::now())
                .as_millis()
                .min(i32::MAX as u128) as i32,
            None => -1,
        }
    }

    fn delete(&mut self, i: usize) {
        assert!(i < self.heap.len());
        let last = self.heap.len() - 1;
        if i < last {
            self.swap_nodes(i, last);
            let node = self.heap.pop().unwrap();
            self.index_of.remove(&node.id);
            if !self.sift_down(i, self.heap.len()) {
                self.sift_up(i);
            }
        } else {
            let node = self.heap.pop().unwrap();
            self.index_of.remove(&node.id);
        }
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap[parent].sorts_before(&self.heap[i]) {
                break;
            }
            self.swap_nodes(i, parent);
            i = parent;
        }
    }

    /// Returns true when the node actually moved down.
    fn sift_down(&mut self, start: usize, n: usize) -> bool {
        let mut i = start;
        let mut child = i * 2 + 1;
        while child < n {
            if child + 1 < n && self.heap[child + 1].sorts_before(&self.heap[child]) {
                child += 1;
            }
            if self.heap[i].sorts_before(&self.heap[child]) {
                break;
            }
            self.swap_nodes(i, child);
            i = child;
            child = i * 2 + 1;
        }
        i > start
    }

    fn swap_nodes(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
        self.index_of.insert(self.heap[i].id, i);
        self.index_of.insert(self.heap[j].id, j);
    }

    #[cfg(test)]
    fn assert_heap_consistent(&self) {
        for i in 1..self.heap.len() {
            let parent = (i - 1) / 2;
            assert!(
                !self.heap[i].sorts_before(&self.heap[parent]),
                "heap order violated at index {i}"
            );
        }
        assert_eq!(self.index_of.len(), self.heap.len());
        for (i, node) in self.heap.iter().enumerate() {
            assert_eq!(self.index_of[&node.id], i, "stale index for id {}", node.id);
        }
    }
}

impl Default for HeapTimer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn recorder() -> (Rc<RefCell<Vec<i32>>>, impl Fn(i32) -> Box<dyn FnOnce()>) {
        let fired = Rc::new(RefCell::new(Vec::new()));
        let fired2 = Rc::clone(&fired);
        let make = move |id: i32| -> Box<dyn FnOnce()> {
            let fired = Rc::clone(&fired2);
            Box::new(move || fired.borrow_mut().push(id))
        };
        (fired, make)
    }

    #[test]
    fn heap_and_index_stay_consistent() {
        let mut timer = HeapTimer::new();
        for id in [9, 3, 7, 1, 5, 8, 2, 6, 4] {
            timer.add(id, Duration::from_millis(id as u64 * 10), || {});
            timer.assert_heap_consistent();
        }
        timer.adjust(7, Duration::from_millis(500));
        timer.assert_heap_consistent();
        timer.do_work(3);
        timer.assert_heap_consistent();
        assert_eq!(timer.len(), 8);
    }

    #[test]
    fn expired_nodes_fire_in_deadline_order() {
        let (fired, make) = recorder();
        let mut timer = HeapTimer::new();
        timer.add(3, Duration::from_millis(30), make(3));
        timer.add(1, Duration::from_millis(0), make(1));
        timer.add(2, Duration::from_millis(15), make(2));
        std::thread::sleep(Duration::from_millis(60));
        timer.tick();
        assert_eq!(*fired.borrow(), vec![1, 2, 3]);
        assert!(timer.is_empty());
    }

    #[test]
    fn unexpired_nodes_do_not_fire() {
        let (fired, make) = recorder();
        let mut timer = HeapTimer::new();
        timer.add(1, Duration::from_secs(60), make(1));
        timer.tick();
        assert!(fired.borrow().is_empty());
        assert_eq!(timer.len(), 1);
    }

    #[test]
    fn add_on_known_id_replaces_deadline_and_callback() {
        let (fired, make) = recorder();
        let mut timer = HeapTimer::new();
        timer.add(1, Duration::from_millis(0), make(-1));
        timer.add(1, Duration::from_secs(60), make(1));
        assert_eq!(timer.len(), 1);
        timer.tick();
        assert!(fired.borrow().is_empty());

        timer.adjust(1, Duration::from_millis(0));
        timer.tick();
        assert_eq!(*fired.borrow(), vec![1]);
    }

    #[test]
    fn do_work_fires_and_removes() {
        let (fired, make) = recorder();
        let mut timer = HeapTimer::new();
        timer.add(1, Duration::from_secs(60), make(1));
        timer.add(2, Duration::from_secs(60), make(2));
        timer.do_work(1);
        assert_eq!(*fired.borrow(), vec![1]);
        assert_eq!(timer.len(), 1);
        timer.assert_heap_consistent();
    }

    #[test]
    fn next_tick_ms_reports_front_deadline() {
        let mut timer = HeapTimer::new();
        assert_eq!(timer.next_tick_ms(), -1);

        timer.add(1, Duration::from_millis(200), || {});
        let ms = timer.next_tick_ms();
        assert!(ms > 0 && ms <= 200, "got {ms}");

        timer.adjust(1, Duration::from_millis(0));
        // The elapsed deadline fires inside next_tick_ms and leaves nothing armed.
        assert_eq!(timer.next_tick_ms(), -1);
        assert!(timer.is_empty());
    }

    #[test]
    fn adjust_on_unknown_id_is_a_no_op() {
        let mut timer = HeapTimer::new();
        timer.adjust(42, Duration::from_millis(1));
        assert!(timer.is_empty());
    }

    #[test]
    fn clear_empties_everything() {
        let mut timer = HeapTimer::new();
        timer.add(1, Duration::from_secs(1), || {});
        timer.add(2, Duration::from_secs(2), || {});
        timer.clear();
        assert!(timer.is_empty());
        assert_eq!(timer.next_tick_ms(), -1);
    }
}
