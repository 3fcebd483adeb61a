//! Backup coordinator: cursors, estimation, validation, retry and archives
//!
//! The coordinator is the backup driver's single point of contact. It owns
//! incremental cursors over the engine's change set, estimates backup
//! sizes, validates completed backups, wraps flaky I/O in the retry loop
//! and writes the on-disk archive format.
//!
//! Cursors never snapshot: each batch re-queries the live engine and pages
//! through it with an ascending block-id watermark, so a block is emitted
//! at most once per cursor even as concurrent marks land. A cursor carries
//! only range bounds and scalar progress — no references into the engine.

mod retry;

pub use retry::{RetryContext, RetryPolicy, RetryState};

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::archive::{ArchiveBlock, ArchiveHeader, ArchiveWriter};
use crate::config::CoordinatorConfig;
use crate::engine::{BitmapEngine, BlockState};
use crate::interceptor::EventInterceptor;
use crate::status::{Error, ErrorCode, Result};

/// Body block type carrying one incremental block record.
pub const BLOCK_TYPE_DATA: u8 = 1;
/// Body block type carrying the JSON manifest.
pub const BLOCK_TYPE_MANIFEST: u8 = 2;

/// Which dimension(s) a cursor ranges over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorType {
    /// Timestamp range only.
    Time,
    /// WAL-offset range only.
    Wal,
    /// Intersection of both ranges.
    Hybrid,
}

/// Opaque cursor handle.
pub type CursorId = Uuid;

/// One change record handed to the backup driver.
///
/// `data` is absent in cursor batches; the driver loads block bytes lazily
/// from the storage engine when it actually copies them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncrementalBlock {
    /// Block id.
    pub block_id: u64,
    /// WAL offset of the latest mutation.
    pub wal_offset: u64,
    /// Timestamp of the latest mutation, nanoseconds.
    pub timestamp: i64,
    /// Tracking state at read time.
    pub state: BlockState,
    /// Block bytes, if loaded.
    pub data: Option<Vec<u8>>,
    /// Size of the block bytes.
    pub data_size: u32,
}

/// Scalar cursor progress, for monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorProgress {
    /// Blocks emitted so far.
    pub consumed: u64,
    /// Whether another batch may yield records.
    pub has_more: bool,
}

#[derive(Debug)]
struct IncrementalCursor {
    cursor_type: CursorType,
    time_range: (i64, i64),
    wal_range: (u64, u64),
    /// Next block id the cursor may emit; ids below are already consumed.
    next_id: u64,
    consumed: u64,
    has_more: bool,
}

/// JSON manifest describing one incremental backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    /// Start of the WAL range.
    pub start_wal: u64,
    /// End of the WAL range.
    pub end_wal: u64,
    /// Estimated block count.
    pub block_count: u64,
    /// Estimated total bytes.
    pub total_size: u64,
    /// Creation time, milliseconds since the epoch.
    pub created_ms: u64,
    /// Manifest schema version.
    pub version: u32,
}

/// Cumulative backup statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackupStats {
    /// Blocks handed out through cursors.
    pub total_blocks: u64,
    /// Bytes written to archives and retried files.
    pub total_bytes: u64,
    /// Time spent producing batches and archives, milliseconds.
    pub duration_ms: u64,
}

/// Coordinates incremental backups over one engine/interceptor pair.
#[derive(Debug)]
pub struct BackupCoordinator {
    config: CoordinatorConfig,
    engine: Arc<BitmapEngine>,
    interceptor: Arc<EventInterceptor>,
    cursors: Mutex<HashMap<CursorId, IncrementalCursor>>,
    retry: Mutex<RetryContext>,
    last_error: Mutex<Option<Error>>,
    error_count: AtomicU64,
    retry_count: AtomicU64,
    total_blocks: AtomicU64,
    total_bytes: AtomicU64,
    duration_ms: AtomicU64,
}

impl BackupCoordinator {
    /// Create a coordinator.
    pub fn new(
        config: CoordinatorConfig,
        engine: Arc<BitmapEngine>,
        interceptor: Arc<EventInterceptor>,
    ) -> Result<Self> {
        if config.enable_encryption && config.encryption_key.is_none() {
            return Err(Error::new(
                ErrorCode::InvalidParam,
                "encryption enabled without a key",
            ));
        }
        let policy = RetryPolicy::new(config.error_retry_max, config.retry_interval());
        Ok(Self {
            config,
            engine,
            interceptor,
            cursors: Mutex::new(HashMap::new()),
            retry: Mutex::new(RetryContext::new(policy)),
            last_error: Mutex::new(None),
            error_count: AtomicU64::new(0),
            retry_count: AtomicU64::new(0),
            total_blocks: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            duration_ms: AtomicU64::new(0),
        })
    }

    /// The coordinator's configuration.
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Intake statistics of the paired interceptor.
    pub fn interceptor_stats(&self) -> crate::interceptor::InterceptorStats {
        self.interceptor.stats()
    }

    /// Dirty block ids in a WAL range, ascending, at most `max`.
    pub fn dirty_blocks(&self, start_wal: u64, end_wal: u64, max: usize) -> Vec<u64> {
        self.engine.dirty_blocks_by_wal(start_wal, end_wal, max)
    }

    /// Open a cursor over `[start_time, end_time]` and/or
    /// `[start_wal, end_wal]` depending on `cursor_type`.
    pub fn create_cursor(
        &self,
        cursor_type: CursorType,
        start_time: i64,
        end_time: i64,
        start_wal: u64,
        end_wal: u64,
    ) -> Result<CursorId> {
        let uses_time = matches!(cursor_type, CursorType::Time | CursorType::Hybrid);
        let uses_wal = matches!(cursor_type, CursorType::Wal | CursorType::Hybrid);
        if uses_time && start_time > end_time {
            return Err(Error::new(
                ErrorCode::InvalidParam,
                format!("empty time range [{start_time}, {end_time}]"),
            ));
        }
        if uses_wal && start_wal > end_wal {
            return Err(Error::new(
                ErrorCode::InvalidParam,
                format!("empty wal range [{start_wal}, {end_wal}]"),
            ));
        }
        let id = Uuid::new_v4();
        self.cursors.lock().insert(
            id,
            IncrementalCursor {
                cursor_type,
                time_range: (start_time, end_time),
                wal_range: (start_wal, end_wal),
                next_id: 0,
                consumed: 0,
                has_more: true,
            },
        );
        Ok(id)
    }

    /// Release a cursor. Returns whether it existed.
    pub fn destroy_cursor(&self, cursor: CursorId) -> bool {
        self.cursors.lock().remove(&cursor).is_some()
    }

    /// Progress of an open cursor.
    pub fn cursor_progress(&self, cursor: CursorId) -> Option<CursorProgress> {
        self.cursors.lock().get(&cursor).map(|c| CursorProgress {
            consumed: c.consumed,
            has_more: c.has_more,
        })
    }

    /// Pull the next batch from a cursor, at most `max` records (further
    /// capped by `max_blocks_per_batch`). Records carry metadata only.
    pub fn next_batch(&self, cursor: CursorId, max: usize) -> Result<Vec<IncrementalBlock>> {
        let max = max.min(self.config.max_blocks_per_batch as usize);
        let started = Instant::now();

        let mut cursors = self.cursors.lock();
        let cursor = cursors
            .get_mut(&cursor)
            .ok_or_else(|| Error::new(ErrorCode::InvalidParam, "unknown cursor"))?;
        if !cursor.has_more || max == 0 {
            return Ok(Vec::new());
        }

        let (time_range, wal_range) = match cursor.cursor_type {
            CursorType::Time => (Some(cursor.time_range), None),
            CursorType::Wal => (None, Some(cursor.wal_range)),
            CursorType::Hybrid => (Some(cursor.time_range), Some(cursor.wal_range)),
        };
        let matched = self.engine.collect_dirty(time_range, wal_range);

        let mut out = Vec::new();
        let mut visited = 0usize;
        let mut last_visited = None;
        for block_id in matched.iter_from(cursor.next_id).take(max) {
            visited += 1;
            last_visited = Some(block_id);
            // A concurrent clear may have raced the query; skip silently,
            // the block is no longer part of the change set.
            let Some(meta) = self.engine.block_metadata(block_id) else {
                continue;
            };
            out.push(IncrementalBlock {
                block_id,
                wal_offset: meta.wal_offset,
                timestamp: meta.timestamp,
                state: meta.state,
                data: None,
                data_size: 0,
            });
        }
        match last_visited {
            Some(u64::MAX) => cursor.has_more = false,
            Some(last) => cursor.next_id = last + 1,
            None => {}
        }
        cursor.consumed += out.len() as u64;
        if visited < max {
            cursor.has_more = false;
        }
        drop(cursors);

        self.total_blocks.fetch_add(out.len() as u64, Ordering::Relaxed);
        self.duration_ms
            .fetch_add(started.elapsed().as_millis() as u64, Ordering::Relaxed);
        Ok(out)
    }

    /// Estimate `(blocks, bytes)` for a WAL range using the configured
    /// average block size.
    pub fn estimate_size(&self, start_wal: u64, end_wal: u64) -> (u64, u64) {
        let blocks = self.engine.count_dirty_blocks_by_wal(start_wal, end_wal);
        (blocks, blocks.saturating_mul(self.config.average_block_size))
    }

    /// Produce the JSON manifest for a WAL range.
    pub fn generate_metadata(&self, start_wal: u64, end_wal: u64) -> Result<Vec<u8>> {
        let (block_count, total_size) = self.estimate_size(start_wal, end_wal);
        let manifest = BackupManifest {
            start_wal,
            end_wal,
            block_count,
            total_size,
            created_ms: now_ms(),
            version: 1,
        };
        serde_json::to_vec(&manifest)
            .map_err(|e| Error::new(ErrorCode::Unknown, format!("manifest encoding failed: {e}")))
    }

    /// Check that every block of a completed backup is tracked by the
    /// engine with a WAL offset inside `[start_wal, end_wal]`.
    pub fn validate_backup(
        &self,
        start_wal: u64,
        end_wal: u64,
        blocks: &[IncrementalBlock],
    ) -> Result<()> {
        for block in blocks {
            let meta = self.engine.block_metadata(block.block_id).ok_or_else(|| {
                Error::new(
                    ErrorCode::BlockNotFound,
                    format!("backup holds untracked block {}", block.block_id),
                )
            })?;
            if !(start_wal..=end_wal).contains(&meta.wal_offset) {
                return Err(Error::new(
                    ErrorCode::InvalidParam,
                    format!(
                        "block {} wal offset {} outside [{start_wal}, {end_wal}]",
                        block.block_id, meta.wal_offset
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Write an archive holding `blocks` plus a trailing manifest into the
    /// configured backup directory. Returns the file path.
    pub fn write_backup_archive(
        &self,
        obj_name: &str,
        file_seq: u32,
        start_wal: u64,
        end_wal: u64,
        blocks: &[IncrementalBlock],
    ) -> Result<PathBuf> {
        let dir = self.config.backup_path.as_ref().ok_or_else(|| {
            Error::new(ErrorCode::InvalidParam, "no backup path configured")
        })?;
        let started = Instant::now();

        let header = ArchiveHeader {
            obj_name: obj_name.to_string(),
            timestamp_ms: now_ms() as i64,
            file_seq,
            ..Default::default()
        };
        let mut writer = ArchiveWriter::new(Vec::new());
        writer.write_header(&header)?;
        for block in blocks {
            writer.write_block(&ArchiveBlock::new(
                BLOCK_TYPE_DATA,
                0,
                encode_block_record(block),
            )?)?;
        }
        writer.write_block(&ArchiveBlock::new(
            BLOCK_TYPE_MANIFEST,
            0,
            self.generate_metadata(start_wal, end_wal)?,
        )?)?;

        if writer.bytes_written() > self.config.backup_max_size {
            let err = Error::new(
                ErrorCode::DiskFull,
                format!(
                    "archive of {} bytes exceeds backup_max_size {}",
                    writer.bytes_written(),
                    self.config.backup_max_size
                ),
            );
            self.record_error(&err);
            return Err(err);
        }

        let path = dir.join(format!("backup_{obj_name}_{file_seq}.taosz"));
        let bytes = writer.into_inner()?;
        self.write_file_with_retry(&path, &bytes)?;

        self.duration_ms
            .fetch_add(started.elapsed().as_millis() as u64, Ordering::Relaxed);
        info!(path = %path.display(), blocks = blocks.len(), "wrote backup archive");
        Ok(path)
    }

    /// Run `op` under the coordinator's retry policy, recording failures.
    pub fn execute_with_retry<T>(&self, op: impl FnMut() -> Result<T>) -> Result<T> {
        let mut retry = self.retry.lock();
        let result = retry.run(op);
        self.retry_count
            .fetch_add(u64::from(retry.retries()), Ordering::Relaxed);
        drop(retry);
        if let Err(err) = &result {
            self.record_error(err);
        }
        result
    }

    /// Write `data` to `path`, retrying transient I/O failures.
    pub fn write_file_with_retry(&self, path: &Path, data: &[u8]) -> Result<()> {
        self.execute_with_retry(|| {
            std::fs::write(path, data)?;
            Ok(())
        })?;
        self.total_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Record an error: bump counters, remember it, and append it to the
    /// error store when logging is enabled.
    pub fn record_error(&self, err: &Error) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock() = Some(err.clone());

        if !self.config.enable_error_logging {
            return;
        }
        let Some(dir) = &self.config.error_store_path else {
            return;
        };
        let now = now_ms();
        let file = dir.join(format!("backup_error_{now}.log"));
        let line = format!("[{now}] Error {}: {}\n", err.code().code(), err.message());
        let appended = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&file)
            .and_then(|mut f| f.write_all(line.as_bytes()));
        if let Err(io_err) = appended {
            warn!(path = %file.display(), error = %io_err, "failed to persist error record");
        }
    }

    /// Message of the most recent error, or "Success".
    pub fn last_error(&self) -> String {
        self.last_error
            .lock()
            .as_ref()
            .map(|e| e.message().to_string())
            .unwrap_or_else(|| ErrorCode::Ok.message().to_string())
    }

    /// Forget the most recent error and reset the retry context.
    pub fn clear_error(&self) {
        *self.last_error.lock() = None;
        self.retry.lock().reset();
    }

    /// `(error_count, retry_count)` since creation.
    pub fn error_stats(&self) -> (u64, u64) {
        (
            self.error_count.load(Ordering::Relaxed),
            self.retry_count.load(Ordering::Relaxed),
        )
    }

    /// Cumulative backup statistics.
    pub fn stats(&self) -> BackupStats {
        BackupStats {
            total_blocks: self.total_blocks.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            duration_ms: self.duration_ms.load(Ordering::Relaxed),
        }
    }
}

/// Encode one block record as a data-block payload: id, wal offset,
/// timestamp, state, then the optional block bytes.
fn encode_block_record(block: &IncrementalBlock) -> Vec<u8> {
    let data = block.data.as_deref().unwrap_or_default();
    let mut out = Vec::with_capacity(8 + 8 + 8 + 1 + 4 + data.len());
    out.extend_from_slice(&block.block_id.to_le_bytes());
    out.extend_from_slice(&block.wal_offset.to_le_bytes());
    out.extend_from_slice(&block.timestamp.to_le_bytes());
    out.push(block.state as u8);
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(data);
    out
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InterceptorConfig;

    fn coordinator(config: CoordinatorConfig) -> BackupCoordinator {
        let engine = Arc::new(BitmapEngine::new());
        let interceptor = Arc::new(
            EventInterceptor::new(InterceptorConfig::default(), Arc::clone(&engine)).unwrap(),
        );
        BackupCoordinator::new(config, engine, interceptor).unwrap()
    }

    #[test]
    fn encryption_without_key_is_rejected() {
        let engine = Arc::new(BitmapEngine::new());
        let interceptor = Arc::new(
            EventInterceptor::new(InterceptorConfig::default(), Arc::clone(&engine)).unwrap(),
        );
        let mut config = CoordinatorConfig::default();
        config.enable_encryption = true;
        let err = BackupCoordinator::new(config, engine, interceptor).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidParam);
    }

    #[test]
    fn estimate_uses_configured_factor() {
        let c = coordinator(CoordinatorConfig::default().with_average_block_size(4096));
        for id in 0..5u64 {
            c.engine.mark_dirty(id, 100 + id, 1000).unwrap();
        }
        let (blocks, bytes) = c.estimate_size(0, 1000);
        assert_eq!(blocks, 5);
        assert_eq!(bytes, 5 * 4096);
    }

    #[test]
    fn manifest_roundtrips_as_json() {
        let c = coordinator(CoordinatorConfig::default());
        c.engine.mark_dirty(9, 50, 500).unwrap();
        let bytes = c.generate_metadata(0, 100).unwrap();
        let manifest: BackupManifest = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(manifest.start_wal, 0);
        assert_eq!(manifest.end_wal, 100);
        assert_eq!(manifest.block_count, 1);
        assert_eq!(manifest.version, 1);
    }

    #[test]
    fn empty_range_cursor_is_rejected() {
        let c = coordinator(CoordinatorConfig::default());
        assert!(c.create_cursor(CursorType::Wal, 0, 0, 10, 5).is_err());
        assert!(c.create_cursor(CursorType::Time, 10, 5, 0, 0).is_err());
        // Time cursors ignore the WAL bounds and vice versa.
        assert!(c.create_cursor(CursorType::Time, 0, 10, 10, 5).is_ok());
    }
}
