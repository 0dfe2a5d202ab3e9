//! Blocking FIFO used to hand items over between pipeline stages.
//!
//! A `FrameQueue` is either initialized, in which case it accepts new items
//! and `get()` blocks until one is available, or deinitialized, in which case
//! `add()` refuses items and blocked `get()` callers return `None`. This lets
//! a stage waiting for work be woken up and told to exit with a single call
//! to `deinit()`.
//!
//! Items are delivered in arrival order, each to exactly one caller of
//! `get()`.
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use log::trace;

struct QueueState<T> {
    initialized: bool,
    items: VecDeque<T>,
}

pub struct FrameQueue<T> {
    name: &'static str,
    capacity: usize,
    state: Mutex<QueueState<T>>,
    cond: Condvar,
}

impl<T> FrameQueue<T> {
    /// Create a new, deinitialized queue holding at most `capacity` items.
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity,
            state: Mutex::new(QueueState {
                initialized: false,
                items: VecDeque::with_capacity(capacity),
            }),
            cond: Condvar::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Mark the queue as accepting items. Anything left over from a previous
    /// use is discarded.
    pub fn init(&self) {
        let mut state = self.state.lock().unwrap();
        state.items.clear();
        state.initialized = true;
        trace!("{} queue initialized", self.name);
    }

    /// Stop accepting items and wake up every blocked `get()` caller. Items
    /// still in the queue can be retrieved with `flush()`.
    pub fn deinit(&self) {
        let mut state = self.state.lock().unwrap();
        state.initialized = false;
        self.cond.notify_all();
        trace!("{} queue deinitialized", self.name);
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().unwrap().initialized
    }

    /// Append `item` to the queue and wake up one waiter.
    ///
    /// If the queue is not initialized or is full, the item is given back to
    /// the caller, who is responsible for disposing of it.
    pub fn add(&self, item: T) -> Result<(), T> {
        let mut state = self.state.lock().unwrap();
        if !state.initialized || state.items.len() >= self.capacity {
            trace!(
                "{} queue refused item (initialized: {}, len: {})",
                self.name,
                state.initialized,
                state.items.len()
            );
            return Err(item);
        }

        state.items.push_back(item);
        self.cond.notify_one();
        Ok(())
    }

    /// Take the oldest item, blocking until one is available. Returns `None`
    /// once the queue is deinitialized and empty.
    pub fn get(&self) -> Option<T> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            if !state.initialized {
                return None;
            }
            state = self.cond.wait(state).unwrap();
        }
    }

    /// Like `get()`, but gives up after `timeout`.
    pub fn get_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            let now = Instant::now();
            if !state.initialized || now >= deadline {
                return None;
            }
            state = self.cond.wait_timeout(state, deadline - now).unwrap().0;
        }
    }

    /// Take the oldest item if there is one, without blocking.
    pub fn try_get(&self) -> Option<T> {
        self.state.lock().unwrap().items.pop_front()
    }

    /// Remove every item from the queue and return them, oldest first.
    pub fn flush(&self) -> Vec<T> {
        let items: Vec<T> = self.state.lock().unwrap().items.drain(..).collect();
        if !items.is_empty() {
            trace!("{} queue flushed {} items", self.name, items.len());
        }
        items
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let queue = FrameQueue::new("test", 8);
        queue.init();
        queue.add('a').unwrap();
        queue.add('b').unwrap();
        queue.add('c').unwrap();
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.get(), Some('a'));
        assert_eq!(queue.get(), Some('b'));
        assert_eq!(queue.get(), Some('c'));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_add_refused_when_not_initialized() {
        let queue = FrameQueue::new("test", 8);
        assert_eq!(queue.add(1), Err(1));
        queue.init();
        assert_eq!(queue.add(2), Ok(()));
        queue.deinit();
        assert_eq!(queue.add(3), Err(3));
        // Items added before deinit are still there until flushed.
        assert_eq!(queue.flush(), vec![2]);
        assert_eq!(queue.get(), None);
    }

    #[test]
    fn test_add_refused_when_full() {
        let queue = FrameQueue::new("test", 2);
        queue.init();
        queue.add(1).unwrap();
        queue.add(2).unwrap();
        assert_eq!(queue.add(3), Err(3));
        assert_eq!(queue.get(), Some(1));
        assert_eq!(queue.add(3), Ok(()));
    }

    #[test]
    fn test_init_discards_leftovers() {
        let queue = FrameQueue::new("test", 4);
        queue.init();
        queue.add(1).unwrap();
        queue.deinit();
        queue.init();
        assert!(queue.is_empty());
        assert_eq!(queue.try_get(), None);
    }

    #[test]
    fn test_deinit_wakes_blocked_getter() {
        let queue = Arc::new(FrameQueue::<u32>::new("test", 4));
        queue.init();

        let getter = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.get())
        };

        thread::sleep(Duration::from_millis(50));
        let start = Instant::now();
        queue.deinit();
        assert_eq!(getter.join().unwrap(), None);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_item_delivered_once() {
        const ITEMS: u32 = 1000;

        let queue = Arc::new(FrameQueue::new("test", ITEMS as usize));
        queue.init();

        let getters: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    let mut received = Vec::new();
                    while let Some(item) = queue.get() {
                        received.push(item);
                    }
                    received
                })
            })
            .collect();

        for i in 0..ITEMS {
            while queue.add(i).is_err() {
                thread::yield_now();
            }
        }
        while !queue.is_empty() {
            thread::sleep(Duration::from_millis(1));
        }
        queue.deinit();

        let mut all: Vec<u32> = Vec::new();
        for getter in getters {
            let received = getter.join().unwrap();
            // Each consumer sees items in production order.
            assert!(received.windows(2).all(|w| w[0] < w[1]));
            all.extend(received);
        }
        all.sort_unstable();
        assert_eq!(all, (0..ITEMS).collect::<Vec<_>>());
    }

    #[test]
    fn test_get_timeout() {
        let queue = FrameQueue::<u32>::new("test", 4);
        queue.init();
        let start = Instant::now();
        assert_eq!(queue.get_timeout(Duration::from_millis(20)), None);
        assert!(start.elapsed() >= Duration::from_millis(20));
        queue.add(7).unwrap();
        assert_eq!(queue.get_timeout(Duration::from_millis(20)), Some(7));
    }
}
