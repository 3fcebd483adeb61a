//! Simulated storage engine
//!
//! Stands in for a host database in tests and embedding demos: events are
//! delivered by calling [`StorageEngineHook::trigger_event`] directly
//! instead of observing real file or WAL changes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use super::{StorageEngineConfig, StorageEngineHook};
use crate::event::{BlockEvent, EventKind};
use crate::interceptor::EventInterceptor;
use crate::status::{Error, ErrorCode, Result};

/// In-process stand-in for a host storage engine.
pub struct SimStorageEngine {
    interceptor: Arc<EventInterceptor>,
    initialized: AtomicBool,
    installed: AtomicBool,
    processed: AtomicU64,
    dropped: AtomicU64,
}

impl SimStorageEngine {
    /// Create a simulated engine feeding `interceptor`.
    pub fn new(interceptor: Arc<EventInterceptor>) -> Self {
        Self {
            interceptor,
            initialized: AtomicBool::new(false),
            installed: AtomicBool::new(false),
            processed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }
}

impl StorageEngineHook for SimStorageEngine {
    fn init(&self, _config: &StorageEngineConfig) -> Result<()> {
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    fn shutdown(&self) {
        self.installed.store(false, Ordering::Release);
        self.initialized.store(false, Ordering::Release);
    }

    fn install_interception(&self) -> Result<()> {
        if !self.initialized.load(Ordering::Acquire) {
            return Err(Error::new(
                ErrorCode::NotInitialized,
                "install before init",
            ));
        }
        self.installed.store(true, Ordering::Release);
        Ok(())
    }

    fn uninstall_interception(&self) -> Result<()> {
        self.installed.store(false, Ordering::Release);
        Ok(())
    }

    fn trigger_event(&self, event: &BlockEvent) -> Result<()> {
        if !self.installed.load(Ordering::Acquire) {
            return Err(Error::new(
                ErrorCode::NotInitialized,
                "interception not installed",
            ));
        }
        let accepted = match event.kind {
            EventKind::Create => {
                self.interceptor
                    .on_block_create(event.block_id, event.wal_offset, event.timestamp)
            }
            EventKind::Update => {
                self.interceptor
                    .on_block_update(event.block_id, event.wal_offset, event.timestamp)
            }
            EventKind::Flush => {
                self.interceptor
                    .on_block_flush(event.block_id, event.wal_offset, event.timestamp)
            }
            EventKind::Delete => {
                self.interceptor
                    .on_block_delete(event.block_id, event.wal_offset, event.timestamp)
            }
        };
        if accepted {
            self.processed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn stats(&self) -> (u64, u64) {
        (
            self.processed.load(Ordering::Relaxed),
            self.dropped.load(Ordering::Relaxed),
        )
    }

    fn is_supported(&self) -> bool {
        true
    }

    fn engine_name(&self) -> &'static str {
        "simulated"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InterceptorConfig;
    use crate::engine::BitmapEngine;

    fn sim() -> SimStorageEngine {
        let engine = Arc::new(BitmapEngine::new());
        let interceptor =
            Arc::new(EventInterceptor::new(InterceptorConfig::default(), engine).unwrap());
        SimStorageEngine::new(interceptor)
    }

    #[test]
    fn trigger_requires_installation() {
        let sim = sim();
        let event = BlockEvent::new(EventKind::Update, 1, 1, 1);
        assert_eq!(
            sim.trigger_event(&event).unwrap_err().code(),
            ErrorCode::NotInitialized
        );
        assert_eq!(
            sim.install_interception().unwrap_err().code(),
            ErrorCode::NotInitialized
        );

        sim.init(&StorageEngineConfig::default()).unwrap();
        sim.install_interception().unwrap();
        sim.trigger_event(&event).unwrap();
        assert_eq!(sim.stats(), (1, 0));
    }

    #[test]
    fn uninstall_stops_delivery() {
        let sim = sim();
        sim.init(&StorageEngineConfig::default()).unwrap();
        sim.install_interception().unwrap();
        sim.uninstall_interception().unwrap();
        let event = BlockEvent::new(EventKind::Create, 2, 2, 2);
        assert!(sim.trigger_event(&event).is_err());
        assert_eq!(sim.stats(), (0, 0));
    }
}
