//! Bounded blocking MPMC queue for event records
//!
//! One mutex, two condition variables (not-empty / not-full). Producers on
//! the storage-engine hot path normally use [`RingBuffer::try_enqueue`] and
//! drop on overflow; the blocking enqueue exists for deployments that prefer
//! backpressure over loss.
//!
//! Shutdown wakes every waiter. Items already accepted stay dequeueable
//! after shutdown; only an empty shut-down queue reports
//! [`DequeueError::Shutdown`], so consumers drain accepted work before
//! exiting.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Rejected non-blocking enqueue, giving the item back to the caller.
#[derive(Debug, PartialEq, Eq)]
pub enum TryEnqueueError<T> {
    /// The queue was at capacity.
    Full(T),
    /// The queue was shut down.
    Shutdown(T),
}

/// Rejected blocking enqueue, giving the item back to the caller.
#[derive(Debug, PartialEq, Eq)]
pub enum EnqueueError<T> {
    /// No capacity became available within the timeout.
    Timeout(T),
    /// The queue was shut down while waiting.
    Shutdown(T),
}

/// Rejected blocking dequeue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DequeueError {
    /// No item arrived within the timeout.
    Timeout,
    /// The queue is shut down and fully drained.
    Shutdown,
}

struct Inner<T> {
    queue: VecDeque<T>,
    shutdown: bool,
}

/// Bounded FIFO of `T` with blocking operations and millisecond-scale
/// timeouts.
///
/// FIFO order is preserved per producer; across producers the order is the
/// order in which the queue accepted the items.
pub struct RingBuffer<T> {
    capacity: usize,
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> RingBuffer<T> {
    /// Create a queue holding at most `capacity` items. A zero capacity is
    /// rounded up to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(Inner {
                queue: VecDeque::with_capacity(capacity),
                shutdown: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Maximum number of items the queue holds.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current number of queued items.
    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Whether the queue is currently empty.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }

    /// Whether [`RingBuffer::shutdown`] has been called.
    pub fn is_shutdown(&self) -> bool {
        self.inner.lock().shutdown
    }

    /// Enqueue without blocking.
    pub fn try_enqueue(&self, item: T) -> Result<(), TryEnqueueError<T>> {
        let mut inner = self.inner.lock();
        if inner.shutdown {
            return Err(TryEnqueueError::Shutdown(item));
        }
        if inner.queue.len() == self.capacity {
            return Err(TryEnqueueError::Full(item));
        }
        inner.queue.push_back(item);
        drop(inner);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Enqueue, waiting up to `timeout` for capacity.
    pub fn enqueue_blocking(&self, item: T, timeout: Duration) -> Result<(), EnqueueError<T>> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if inner.shutdown {
                return Err(EnqueueError::Shutdown(item));
            }
            if inner.queue.len() < self.capacity {
                inner.queue.push_back(item);
                drop(inner);
                self.not_empty.notify_one();
                return Ok(());
            }
            if self.not_full.wait_until(&mut inner, deadline).timed_out() {
                return if inner.shutdown {
                    Err(EnqueueError::Shutdown(item))
                } else if inner.queue.len() < self.capacity {
                    inner.queue.push_back(item);
                    drop(inner);
                    self.not_empty.notify_one();
                    Ok(())
                } else {
                    Err(EnqueueError::Timeout(item))
                };
            }
        }
    }

    /// Dequeue, waiting up to `timeout` for an item.
    pub fn dequeue_blocking(&self, timeout: Duration) -> Result<T, DequeueError> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if let Some(item) = inner.queue.pop_front() {
                drop(inner);
                self.not_full.notify_one();
                return Ok(item);
            }
            if inner.shutdown {
                return Err(DequeueError::Shutdown);
            }
            if self.not_empty.wait_until(&mut inner, deadline).timed_out() {
                return match inner.queue.pop_front() {
                    Some(item) => {
                        drop(inner);
                        self.not_full.notify_one();
                        Ok(item)
                    }
                    None if inner.shutdown => Err(DequeueError::Shutdown),
                    None => Err(DequeueError::Timeout),
                };
            }
        }
    }

    /// Shut the queue down and wake every waiter. Idempotent.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        inner.shutdown = true;
        drop(inner);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Remove and return everything still queued. Used by owners tearing
    /// the queue down after consumers have exited.
    pub fn drain(&self) -> Vec<T> {
        let mut inner = self.inner.lock();
        let drained: Vec<T> = inner.queue.drain(..).collect();
        drop(inner);
        self.not_full.notify_all();
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    const SHORT: Duration = Duration::from_millis(20);

    #[test]
    fn fifo_within_a_producer() {
        let rb = RingBuffer::new(8);
        for i in 0..5 {
            rb.try_enqueue(i).unwrap();
        }
        for i in 0..5 {
            assert_eq!(rb.dequeue_blocking(SHORT), Ok(i));
        }
    }

    #[test]
    fn try_enqueue_reports_full_and_returns_item() {
        let rb = RingBuffer::new(2);
        rb.try_enqueue(1).unwrap();
        rb.try_enqueue(2).unwrap();
        assert_eq!(rb.try_enqueue(3), Err(TryEnqueueError::Full(3)));
        assert_eq!(rb.len(), 2);
    }

    #[test]
    fn dequeue_times_out_when_empty() {
        let rb: RingBuffer<u32> = RingBuffer::new(4);
        let start = Instant::now();
        assert_eq!(rb.dequeue_blocking(SHORT), Err(DequeueError::Timeout));
        assert!(start.elapsed() >= SHORT);
    }

    #[test]
    fn enqueue_blocking_times_out_when_full() {
        let rb = RingBuffer::new(1);
        rb.try_enqueue(1).unwrap();
        assert_eq!(
            rb.enqueue_blocking(2, SHORT),
            Err(EnqueueError::Timeout(2))
        );
    }

    #[test]
    fn enqueue_blocking_proceeds_when_capacity_frees() {
        let rb = Arc::new(RingBuffer::new(1));
        rb.try_enqueue(1).unwrap();
        let producer = {
            let rb = Arc::clone(&rb);
            thread::spawn(move || rb.enqueue_blocking(2, Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(10));
        assert_eq!(rb.dequeue_blocking(SHORT), Ok(1));
        assert!(producer.join().unwrap().is_ok());
        assert_eq!(rb.dequeue_blocking(SHORT), Ok(2));
    }

    #[test]
    fn shutdown_wakes_blocked_dequeuers() {
        let rb: Arc<RingBuffer<u32>> = Arc::new(RingBuffer::new(4));
        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let rb = Arc::clone(&rb);
                thread::spawn(move || rb.dequeue_blocking(Duration::from_secs(30)))
            })
            .collect();
        thread::sleep(Duration::from_millis(20));
        rb.shutdown();
        for c in consumers {
            assert_eq!(c.join().unwrap(), Err(DequeueError::Shutdown));
        }
    }

    #[test]
    fn accepted_items_survive_shutdown() {
        let rb = RingBuffer::new(4);
        rb.try_enqueue(1).unwrap();
        rb.try_enqueue(2).unwrap();
        rb.shutdown();
        assert_eq!(
            rb.try_enqueue(3),
            Err(TryEnqueueError::Shutdown(3))
        );
        // Drain-before-exit: queued items still come out.
        assert_eq!(rb.dequeue_blocking(SHORT), Ok(1));
        assert_eq!(rb.dequeue_blocking(SHORT), Ok(2));
        assert_eq!(rb.dequeue_blocking(SHORT), Err(DequeueError::Shutdown));
    }

    #[test]
    fn drain_empties_queue() {
        let rb = RingBuffer::new(8);
        for i in 0..5 {
            rb.try_enqueue(i).unwrap();
        }
        assert_eq!(rb.drain(), vec![0, 1, 2, 3, 4]);
        assert!(rb.is_empty());
    }

    #[test]
    fn contended_producers_and_consumers_lose_nothing() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 1000;
        let rb = Arc::new(RingBuffer::new(16));
        let mut handles = Vec::new();
        for p in 0..PRODUCERS {
            let rb = Arc::clone(&rb);
            handles.push(thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    rb.enqueue_blocking((p, i), Duration::from_secs(30))
                        .unwrap_or_else(|_| panic!("producer {p} stalled"));
                }
            }));
        }
        let consumer = {
            let rb = Arc::clone(&rb);
            thread::spawn(move || {
                let mut last_seen = [None::<usize>; PRODUCERS];
                let mut total = 0;
                while total < PRODUCERS * PER_PRODUCER {
                    let (p, i) = rb.dequeue_blocking(Duration::from_secs(30)).unwrap();
                    // Per-producer FIFO: sequence numbers arrive in order.
                    assert!(last_seen[p].map_or(true, |prev| prev < i));
                    last_seen[p] = Some(i);
                    total += 1;
                }
                total
            })
        };
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(consumer.join().unwrap(), PRODUCERS * PER_PRODUCER);
    }
}
