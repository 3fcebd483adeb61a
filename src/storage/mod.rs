//! Storage-engine integration seam
//!
//! The host database is an external collaborator: it emits block-mutation
//! events and serves raw block bytes. [`StorageEngineHook`] is the trait a
//! host integration implements, and a process-wide registry maps engine
//! names to factories so deployments pick an integration by name.
//! Unknown names resolve to a no-op default whose `is_supported` returns
//! false, so callers can probe without special cases.

mod registry;
mod sim;

pub use registry::{register_storage_engine, registered_engines, storage_engine};
pub use sim::SimStorageEngine;

use std::path::PathBuf;

use crate::event::BlockEvent;
use crate::status::Result;

/// Host-side configuration handed to [`StorageEngineHook::init`].
#[derive(Debug, Clone, Default)]
pub struct StorageEngineConfig {
    /// Data directory of the host database.
    pub data_dir: Option<PathBuf>,
    /// WAL directory of the host database.
    pub wal_dir: Option<PathBuf>,
}

/// Interface a host storage engine exposes to the backup plugin.
pub trait StorageEngineHook: Send + Sync {
    /// Prepare the integration.
    fn init(&self, config: &StorageEngineConfig) -> Result<()>;

    /// Tear the integration down.
    fn shutdown(&self);

    /// Start delivering block events.
    fn install_interception(&self) -> Result<()>;

    /// Stop delivering block events.
    fn uninstall_interception(&self) -> Result<()>;

    /// Deliver one event. Real integrations call this from whatever
    /// observes file or WAL changes; tests call it directly.
    fn trigger_event(&self, event: &BlockEvent) -> Result<()>;

    /// `(events_processed, events_dropped)` counters.
    fn stats(&self) -> (u64, u64);

    /// Whether this integration can actually deliver events.
    fn is_supported(&self) -> bool;

    /// Name the integration registers under.
    fn engine_name(&self) -> &'static str;
}
