//! Blocking double-ended queue shared between threads.
//!
//! Used as the server's inbound mailbox (many connection tasks produce, the
//! dispatch thread consumes) and as each connection's outbound mailbox (the
//! dispatch thread produces, the write chain consumes).
//!
//! Every push notifies all waiters; waiters re-check emptiness under the lock,
//! so racing consumers cannot lose a wakeup and `wait` never returns on an
//! empty queue.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Mutex-guarded `VecDeque` with condition-variable notification.
pub struct TsQueue<T> {
    items: Mutex<VecDeque<T>>,
    ready: Condvar,
}

impl<T> Default for TsQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TsQueue<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
        }
    }

    /// Append an item and wake every waiter.
    pub fn push_back(&self, item: T) {
        let mut items = self.items.lock();
        items.push_back(item);
        self.ready.notify_all();
    }

    /// Prepend an item and wake every waiter.
    pub fn push_front(&self, item: T) {
        let mut items = self.items.lock();
        items.push_front(item);
        self.ready.notify_all();
    }

    /// Remove the oldest item.
    ///
    /// Returns `None` on an empty queue. Callers are expected to have
    /// checked [`is_empty`](Self::is_empty) or waited first.
    pub fn pop_front(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    /// Remove the newest item. Returns `None` on an empty queue.
    pub fn pop_back(&self) -> Option<T> {
        self.items.lock().pop_back()
    }

    /// Take every queued item in FIFO order, in one critical section.
    pub fn drain(&self) -> Vec<T> {
        self.items.lock().drain(..).collect()
    }

    /// Check if the queue holds no items.
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Discard every queued item.
    pub fn clear(&self) {
        self.items.lock().clear();
    }

    /// Block until the queue is non-empty.
    pub fn wait(&self) {
        let mut items = self.items.lock();
        while items.is_empty() {
            self.ready.wait(&mut items);
        }
    }

    /// Block until the queue is non-empty or `timeout` elapses.
    ///
    /// Returns `true` if the queue was non-empty when the wait ended.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut items = self.items.lock();
        while items.is_empty() {
            if self.ready.wait_until(&mut items, deadline).timed_out() {
                return !items.is_empty();
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo_and_lifo_ends() {
        let queue = TsQueue::new();
        queue.push_back(2);
        queue.push_back(3);
        queue.push_front(1);

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop_back(), Some(3));
        assert_eq!(queue.pop_front(), Some(1));
        assert_eq!(queue.pop_front(), Some(2));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_pop_empty_returns_none() {
        let queue: TsQueue<u32> = TsQueue::new();
        assert_eq!(queue.pop_front(), None);
        assert_eq!(queue.pop_back(), None);
    }

    #[test]
    fn test_clear_and_drain() {
        let queue = TsQueue::new();
        for i in 0..5 {
            queue.push_back(i);
        }
        assert_eq!(queue.drain(), vec![0, 1, 2, 3, 4]);
        assert!(queue.is_empty());

        queue.push_back(9);
        queue.clear();
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_wait_timeout_on_empty() {
        let queue: TsQueue<u8> = TsQueue::new();
        let start = Instant::now();
        assert!(!queue.wait_timeout(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));

        queue.push_back(1);
        assert!(queue.wait_timeout(Duration::from_millis(20)));
    }

    #[test]
    fn test_wait_wakes_on_push() {
        let queue = Arc::new(TsQueue::new());

        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                queue.push_back("ready");
            })
        };

        queue.wait();
        assert_eq!(queue.pop_front(), Some("ready"));
        producer.join().unwrap();
    }

    #[test]
    fn test_concurrent_producers_no_loss_no_duplication() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 1000;

        let queue = Arc::new(TsQueue::new());
        let mut handles = Vec::new();

        for p in 0..PRODUCERS {
            let queue = Arc::clone(&queue);
            handles.push(thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    queue.push_back((p, i));
                }
            }));
        }

        // Two consumers racing on the same queue
        let consumers: Vec<_> = (0..2)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    let mut seen = Vec::new();
                    while queue.wait_timeout(Duration::from_millis(200)) {
                        // The other consumer may win the race to drain
                        seen.extend(queue.drain());
                    }
                    seen
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let mut all = Vec::new();
        let mut per_consumer = Vec::new();
        for consumer in consumers {
            let seen = consumer.join().unwrap();
            per_consumer.push(seen.clone());
            all.extend(seen);
        }

        assert_eq!(all.len(), PRODUCERS * PER_PRODUCER);
        let unique: HashSet<_> = all.iter().copied().collect();
        assert_eq!(unique.len(), all.len());

        // Each consumer observes every producer's items in submission order
        for seen in per_consumer {
            for p in 0..PRODUCERS {
                let order: Vec<usize> = seen
                    .iter()
                    .filter(|(q, _)| *q == p)
                    .map(|(_, i)| *i)
                    .collect();
                assert!(order.windows(2).all(|w| w[0] < w[1]));
            }
        }
    }

    /// Spawn `count` pushers that each enqueue `per_pusher` tagged items.
    fn spawn_pushers(
        queue: &Arc<TsQueue<Option<(usize, usize)>>>,
        count: usize,
        per_pusher: usize,
    ) -> Vec<thread::JoinHandle<()>> {
        (0..count)
            .map(|p| {
                let queue = Arc::clone(queue);
                thread::spawn(move || {
                    for i in 0..per_pusher {
                        queue.push_back(Some((p, i)));
                        if i % 64 == 0 {
                            thread::yield_now();
                        }
                    }
                })
            })
            .collect()
    }

    /// Loop `wait` then `pop_front` until a `None` sentinel is popped.
    ///
    /// Returns the items taken and how many pops found the queue empty.
    fn wait_and_pop(queue: &TsQueue<Option<(usize, usize)>>) -> (Vec<(usize, usize)>, usize) {
        let mut taken = Vec::new();
        let mut empty_pops = 0;
        loop {
            queue.wait();
            match queue.pop_front() {
                Some(Some(item)) => taken.push(item),
                Some(None) => return (taken, empty_pops),
                None => empty_pops += 1,
            }
        }
    }

    #[test]
    fn test_wait_never_returns_empty_under_concurrent_pushers() {
        const PUSHERS: usize = 4;
        const PER_PUSHER: usize = 2000;

        let queue = Arc::new(TsQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || wait_and_pop(&queue))
        };

        for handle in spawn_pushers(&queue, PUSHERS, PER_PUSHER) {
            handle.join().unwrap();
        }
        queue.push_back(None);

        // Sole consumer: every wake must find an item
        let (taken, empty_pops) = waiter.join().unwrap();
        assert_eq!(empty_pops, 0);
        assert_eq!(taken.len(), PUSHERS * PER_PUSHER);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_many_waiters_many_pushers() {
        const PUSHERS: usize = 4;
        const WAITERS: usize = 4;
        const PER_PUSHER: usize = 2000;

        let queue = Arc::new(TsQueue::new());
        let waiters: Vec<_> = (0..WAITERS)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || wait_and_pop(&queue))
            })
            .collect();

        for handle in spawn_pushers(&queue, PUSHERS, PER_PUSHER) {
            handle.join().unwrap();
        }
        // Sentinels queue behind every real item, one per waiter
        for _ in 0..WAITERS {
            queue.push_back(None);
        }

        let mut all = Vec::new();
        for waiter in waiters {
            let (taken, _) = waiter.join().unwrap();
            for p in 0..PUSHERS {
                let order: Vec<usize> = taken
                    .iter()
                    .filter(|(q, _)| *q == p)
                    .map(|(_, i)| *i)
                    .collect();
                assert!(order.windows(2).all(|w| w[0] < w[1]));
            }
            all.extend(taken);
        }

        // Empty pops only ever lose to another waiter; no item goes missing
        assert_eq!(all.len(), PUSHERS * PER_PUSHER);
        let unique: HashSet<_> = all.iter().copied().collect();
        assert_eq!(unique.len(), all.len());
        assert!(queue.is_empty());
    }
}
