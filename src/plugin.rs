//! Process-wide plugin facade
//!
//! The host loads the backup plugin through a flat entry-point set, so all
//! plugin state funnels through exactly one process-scope singleton guarded
//! by one mutex; every exported function acquires it. Failures crossing
//! this boundary are recorded on the coordinator so the host can read them
//! back through [`get_last_error`].

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::config::PluginConfig;
use crate::coordinator::{
    BackupCoordinator, BackupStats, CursorId, CursorType, IncrementalBlock,
};
use crate::engine::BitmapEngine;
use crate::interceptor::EventInterceptor;
use crate::status::{Error, ErrorCode, Result};

/// Plugin name reported to the host.
pub const PLUGIN_NAME: &str = "incremental_bitmap_backup";

/// Plugin version reported to the host.
pub const PLUGIN_VERSION: &str = "1.0.0";

struct PluginState {
    interceptor: Arc<EventInterceptor>,
    coordinator: Arc<BackupCoordinator>,
}

static PLUGIN: Mutex<Option<PluginState>> = Mutex::new(None);

/// Plugin name entry point.
pub fn plugin_name() -> &'static str {
    PLUGIN_NAME
}

/// Plugin version entry point.
pub fn plugin_version() -> &'static str {
    PLUGIN_VERSION
}

/// Initialize the plugin from a JSON config blob (empty blob = defaults).
/// Fails with `InitFailed` if already initialized.
pub fn init(config_blob: &[u8]) -> Result<()> {
    let mut slot = PLUGIN.lock();
    if slot.is_some() {
        return Err(Error::new(ErrorCode::InitFailed, "plugin already initialized"));
    }
    let config: PluginConfig = if config_blob.is_empty() {
        PluginConfig::default()
    } else {
        serde_json::from_slice(config_blob)
            .map_err(|e| Error::new(ErrorCode::InvalidParam, format!("bad config blob: {e}")))?
    };

    let engine = Arc::new(BitmapEngine::with_config(config.engine));
    let interceptor = Arc::new(EventInterceptor::new(config.interceptor, engine.clone())?);
    let coordinator = Arc::new(BackupCoordinator::new(
        config.coordinator,
        engine,
        interceptor.clone(),
    )?);
    interceptor.start()?;
    info!(name = PLUGIN_NAME, version = PLUGIN_VERSION, "backup plugin initialized");

    *slot = Some(PluginState {
        interceptor,
        coordinator,
    });
    Ok(())
}

/// Stop the worker pool and drop all plugin state. Idempotent.
pub fn cleanup() {
    let mut slot = PLUGIN.lock();
    if let Some(state) = slot.take() {
        state.interceptor.stop();
    }
}

/// Run `f` against the live plugin state, recording any failure on the
/// coordinator for [`get_last_error`].
fn with_state<T>(f: impl FnOnce(&PluginState) -> Result<T>) -> Result<T> {
    let slot = PLUGIN.lock();
    let state = slot
        .as_ref()
        .ok_or_else(|| Error::from_code(ErrorCode::NotInitialized))?;
    let result = f(state);
    if let Err(err) = &result {
        state.coordinator.record_error(err);
    }
    result
}

/// Dirty block ids in a WAL range, ascending, at most `max`.
pub fn get_dirty_blocks(start_wal: u64, end_wal: u64, max: usize) -> Result<Vec<u64>> {
    with_state(|s| Ok(s.coordinator.dirty_blocks(start_wal, end_wal, max)))
}

/// Open an incremental cursor; the returned handle is opaque to the host.
pub fn create_incremental_cursor(
    cursor_type: CursorType,
    start_time: i64,
    end_time: i64,
    start_wal: u64,
    end_wal: u64,
) -> Result<CursorId> {
    with_state(|s| {
        s.coordinator
            .create_cursor(cursor_type, start_time, end_time, start_wal, end_wal)
    })
}

/// Release a cursor handle.
pub fn destroy_cursor(cursor: CursorId) -> Result<bool> {
    with_state(|s| Ok(s.coordinator.destroy_cursor(cursor)))
}

/// Pull the next batch from a cursor.
pub fn get_next_batch(cursor: CursorId, max: usize) -> Result<Vec<IncrementalBlock>> {
    with_state(|s| s.coordinator.next_batch(cursor, max))
}

/// Estimate `(blocks, bytes)` for a WAL range.
pub fn estimate_backup_size(start_wal: u64, end_wal: u64) -> Result<(u64, u64)> {
    with_state(|s| Ok(s.coordinator.estimate_size(start_wal, end_wal)))
}

/// Produce the JSON backup manifest for a WAL range.
pub fn generate_metadata(start_wal: u64, end_wal: u64) -> Result<Vec<u8>> {
    with_state(|s| s.coordinator.generate_metadata(start_wal, end_wal))
}

/// Validate a completed backup against the engine's metadata.
pub fn validate_backup(
    start_wal: u64,
    end_wal: u64,
    blocks: &[IncrementalBlock],
) -> Result<()> {
    with_state(|s| s.coordinator.validate_backup(start_wal, end_wal, blocks))
}

/// Cumulative backup statistics; zeros before init.
pub fn get_stats() -> BackupStats {
    PLUGIN
        .lock()
        .as_ref()
        .map(|s| s.coordinator.stats())
        .unwrap_or_default()
}

/// Message of the most recent error.
pub fn get_last_error() -> String {
    PLUGIN
        .lock()
        .as_ref()
        .map(|s| s.coordinator.last_error())
        .unwrap_or_else(|| "Plugin not initialized".to_string())
}

/// `(error_count, retry_count)`; zeros before init.
pub fn get_error_stats() -> (u64, u64) {
    PLUGIN
        .lock()
        .as_ref()
        .map(|s| s.coordinator.error_stats())
        .unwrap_or((0, 0))
}

/// Forget the most recent error.
pub fn clear_error() {
    if let Some(s) = PLUGIN.lock().as_ref() {
        s.coordinator.clear_error();
    }
}

/// Intake counters of the plugin's interceptor; zeros before init.
pub fn get_interceptor_stats() -> crate::interceptor::InterceptorStats {
    PLUGIN
        .lock()
        .as_ref()
        .map(|s| s.interceptor.stats())
        .unwrap_or_default()
}

/// Submit block events to the plugin's interceptor. Returns whether the
/// event was accepted; `Err` before init.
pub fn on_block_event(event: &crate::event::BlockEvent) -> Result<bool> {
    use crate::event::EventKind;
    with_state(|s| {
        let accepted = match event.kind {
            EventKind::Create => {
                s.interceptor
                    .on_block_create(event.block_id, event.wal_offset, event.timestamp)
            }
            EventKind::Update => {
                s.interceptor
                    .on_block_update(event.block_id, event.wal_offset, event.timestamp)
            }
            EventKind::Flush => {
                s.interceptor
                    .on_block_flush(event.block_id, event.wal_offset, event.timestamp)
            }
            EventKind::Delete => {
                s.interceptor
                    .on_block_delete(event.block_id, event.wal_offset, event.timestamp)
            }
        };
        Ok(accepted)
    })
}
