//! Event intake pipeline between the storage engine and the bitmap engine
//!
//! The storage engine's write path must never block on index maintenance,
//! so submissions only touch the ring buffer: on overflow the event is
//! dropped and counted (a deliberate backpressure choice — storage latency
//! must not grow with backup lag; a bounded-blocking variant sits behind
//! [`QueuePolicy::Block`]). Worker threads drain the buffer and apply each
//! event to the engine, so engine mutations are serialized through its
//! write lock.
//!
//! The user callback runs after the engine apply, once the engine lock is
//! released; callback code can therefore re-enter the engine freely.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::config::{FlushPolicy, InterceptorConfig, QueuePolicy};
use crate::engine::BitmapEngine;
use crate::event::{BlockEvent, EventKind};
use crate::ring_buffer::{DequeueError, RingBuffer};
use crate::status::{Error, ErrorCode, Result};

/// Callback invoked by worker threads for every dequeued event.
pub type EventCallback = dyn Fn(&BlockEvent) + Send + Sync;

/// How long a worker blocks on the queue before re-checking for shutdown.
const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(1);

const STATE_IDLE: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPED: u8 = 2;

/// Intake counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterceptorStats {
    /// Events successfully applied to the engine.
    pub events_processed: u64,
    /// Events dropped at submission because the buffer was full.
    pub events_dropped: u64,
    /// Events the engine refused (state-transition or lookup failures).
    pub events_rejected: u64,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    dropped: AtomicU64,
    rejected: AtomicU64,
}

/// Receives block-mutation events and drives the worker pool that applies
/// them to a [`BitmapEngine`].
pub struct EventInterceptor {
    config: InterceptorConfig,
    engine: Arc<BitmapEngine>,
    queue: Arc<RingBuffer<BlockEvent>>,
    counters: Arc<Counters>,
    callback: Mutex<Option<Arc<EventCallback>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    state: AtomicU8,
}

impl std::fmt::Debug for EventInterceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventInterceptor")
            .field("config", &self.config)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl EventInterceptor {
    /// Allocate the queue and worker descriptors. No threads run until
    /// [`EventInterceptor::start`].
    pub fn new(config: InterceptorConfig, engine: Arc<BitmapEngine>) -> Result<Self> {
        if config.enabled {
            if config.event_buffer_size == 0 {
                return Err(Error::new(
                    ErrorCode::InvalidParam,
                    "event buffer capacity must be positive",
                ));
            }
            if config.callback_threads == 0 {
                return Err(Error::new(
                    ErrorCode::InvalidParam,
                    "at least one worker thread is required",
                ));
            }
        }
        let queue = Arc::new(RingBuffer::new(config.event_buffer_size));
        Ok(Self {
            config,
            engine,
            queue,
            counters: Arc::new(Counters::default()),
            callback: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            state: AtomicU8::new(STATE_IDLE),
        })
    }

    /// The interceptor's configuration.
    pub fn config(&self) -> &InterceptorConfig {
        &self.config
    }

    /// Install the per-event callback. Takes effect for workers spawned
    /// after the call, so install before [`EventInterceptor::start`].
    pub fn set_callback(&self, callback: impl Fn(&BlockEvent) + Send + Sync + 'static) {
        *self.callback.lock() = Some(Arc::new(callback));
    }

    /// Spawn the worker pool. Idempotent while running; an interceptor
    /// that was stopped cannot be restarted.
    pub fn start(&self) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        match self.state.compare_exchange(
            STATE_IDLE,
            STATE_RUNNING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(STATE_RUNNING) => return Ok(()),
            Err(_) => {
                return Err(Error::new(
                    ErrorCode::InitFailed,
                    "interceptor cannot restart after stop",
                ));
            }
        }

        let callback = self.callback.lock().clone();
        let mut workers = self.workers.lock();
        for worker_id in 0..self.config.callback_threads {
            let engine = Arc::clone(&self.engine);
            let queue = Arc::clone(&self.queue);
            let counters = Arc::clone(&self.counters);
            let callback = callback.clone();
            let flush_policy = self.config.flush_policy;
            workers.push(
                thread::Builder::new()
                    .name(format!("blk-event-{worker_id}"))
                    .spawn(move || worker_loop(engine, queue, counters, callback, flush_policy))
                    .map_err(|e| Error::new(ErrorCode::InitFailed, e.to_string()))?,
            );
        }
        Ok(())
    }

    /// Signal shutdown and join the workers. Queued events are applied
    /// before the workers exit. Idempotent.
    pub fn stop(&self) {
        let prev = self.state.swap(STATE_STOPPED, Ordering::AcqRel);
        if prev != STATE_RUNNING {
            return;
        }
        self.queue.shutdown();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let _ = worker.join();
        }
    }

    /// Whether the worker pool is running.
    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_RUNNING
    }

    /// Submit a block-creation event. Returns whether it was accepted.
    pub fn on_block_create(&self, block_id: u64, wal_offset: u64, timestamp: i64) -> bool {
        self.submit(BlockEvent::new(EventKind::Create, block_id, wal_offset, timestamp))
    }

    /// Submit a block-update event. Returns whether it was accepted.
    pub fn on_block_update(&self, block_id: u64, wal_offset: u64, timestamp: i64) -> bool {
        self.submit(BlockEvent::new(EventKind::Update, block_id, wal_offset, timestamp))
    }

    /// Submit a block-flush event. Returns whether it was accepted.
    pub fn on_block_flush(&self, block_id: u64, wal_offset: u64, timestamp: i64) -> bool {
        self.submit(BlockEvent::new(EventKind::Flush, block_id, wal_offset, timestamp))
    }

    /// Submit a block-deletion event. Returns whether it was accepted.
    pub fn on_block_delete(&self, block_id: u64, wal_offset: u64, timestamp: i64) -> bool {
        self.submit(BlockEvent::new(EventKind::Delete, block_id, wal_offset, timestamp))
    }

    fn submit(&self, event: BlockEvent) -> bool {
        if !self.config.enabled {
            return false;
        }
        let accepted = match self.config.queue_policy {
            QueuePolicy::DropOnFull => self.queue.try_enqueue(event).is_ok(),
            QueuePolicy::Block { timeout_ms } => self
                .queue
                .enqueue_blocking(event, Duration::from_millis(timeout_ms))
                .is_ok(),
        };
        if !accepted {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        }
        accepted
    }

    /// Intake counters.
    pub fn stats(&self) -> InterceptorStats {
        InterceptorStats {
            events_processed: self.counters.processed.load(Ordering::Relaxed),
            events_dropped: self.counters.dropped.load(Ordering::Relaxed),
            events_rejected: self.counters.rejected.load(Ordering::Relaxed),
        }
    }

    /// Number of events waiting in the buffer.
    pub fn backlog(&self) -> usize {
        self.queue.len()
    }
}

impl Drop for EventInterceptor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(
    engine: Arc<BitmapEngine>,
    queue: Arc<RingBuffer<BlockEvent>>,
    counters: Arc<Counters>,
    callback: Option<Arc<EventCallback>>,
    flush_policy: FlushPolicy,
) {
    loop {
        match queue.dequeue_blocking(DEQUEUE_TIMEOUT) {
            Ok(event) => {
                apply_event(&engine, &counters, flush_policy, &event);
                // Engine lock is released by now; user code may re-enter.
                if let Some(cb) = &callback {
                    cb(&event);
                }
            }
            Err(DequeueError::Timeout) => continue,
            // Shutdown is only reported once the queue is drained.
            Err(DequeueError::Shutdown) => break,
        }
    }
}

fn apply_event(
    engine: &BitmapEngine,
    counters: &Counters,
    flush_policy: FlushPolicy,
    event: &BlockEvent,
) {
    let outcome = match event.kind {
        EventKind::Create => engine.mark_new(event.block_id, event.wal_offset, event.timestamp),
        EventKind::Update => engine.mark_dirty(event.block_id, event.wal_offset, event.timestamp),
        EventKind::Flush => match flush_policy {
            FlushPolicy::ClearBlock => engine.clear_block(event.block_id),
            FlushPolicy::Ignore => Ok(()),
        },
        EventKind::Delete => engine.mark_deleted(event.block_id, event.wal_offset, event.timestamp),
    };
    match outcome {
        Ok(()) => {
            counters.processed.fetch_add(1, Ordering::Relaxed);
        }
        Err(err) => {
            counters.rejected.fetch_add(1, Ordering::Relaxed);
            debug!(
                block_id = event.block_id,
                kind = %event.kind,
                error = %err,
                "event rejected by engine"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interceptor(config: InterceptorConfig) -> EventInterceptor {
        EventInterceptor::new(config, Arc::new(BitmapEngine::new())).unwrap()
    }

    #[test]
    fn disabled_interceptor_ignores_submissions() {
        let it = interceptor(InterceptorConfig::default().with_enabled(false));
        assert!(!it.on_block_update(1, 1, 1));
        assert_eq!(it.stats(), InterceptorStats::default());
        assert_eq!(it.backlog(), 0);
        // start is a no-op when disabled
        it.start().unwrap();
        assert!(!it.is_running());
    }

    #[test]
    fn submissions_queue_before_start() {
        let it = interceptor(InterceptorConfig::default().with_event_buffer_size(4));
        assert!(it.on_block_update(1, 1, 1));
        assert!(it.on_block_update(2, 2, 2));
        assert_eq!(it.backlog(), 2);
    }

    #[test]
    fn zero_workers_is_rejected() {
        let err = EventInterceptor::new(
            InterceptorConfig::default().with_callback_threads(0),
            Arc::new(BitmapEngine::new()),
        )
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidParam);
    }

    #[test]
    fn stop_is_idempotent_and_start_after_stop_fails() {
        let it = interceptor(InterceptorConfig::default());
        it.start().unwrap();
        assert!(it.is_running());
        it.stop();
        it.stop();
        assert!(!it.is_running());
        assert_eq!(it.start().unwrap_err().code(), ErrorCode::InitFailed);
    }
}
