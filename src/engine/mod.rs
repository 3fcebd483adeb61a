//! Bitmap engine: the block-state index
//!
//! Tracks, for every block the storage engine has touched since the last
//! backup checkpoint, whether it is dirty, new or deleted, and answers
//! range queries over two dimensions (wall-clock timestamp and WAL offset).
//!
//! All state lives behind one read-write lock: marks take it exclusively,
//! queries take it shared. The bitmaps and skip lists carry no locks of
//! their own, which keeps the invariants easy to audit:
//!
//! - an id is a member of at most one of the three state bitmaps, the one
//!   matching its metadata state
//! - `|metadata| == |dirty| + |new| + |deleted|`
//! - every metadata record is posted under its timestamp in the time index
//!   and under its WAL offset in the WAL index
//!
//! Re-marking a block does *not* purge its older index postings; queries
//! intersect posting bitmaps with the live state bitmap instead. That keeps
//! a mark O(1) per index at the price of some index bloat between
//! checkpoints.

mod state;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::bitmap::Bitmap64;
use crate::config::EngineConfig;
use crate::index::SkipIndex;
use crate::status::{Error, ErrorCode, Result};
use crate::wire::SliceReader;

pub use state::{BlockMetadata, BlockState};
use state::transition_error;

/// Snapshot file magic, little-endian `"IBSN"`.
const SNAPSHOT_MAGIC: u32 = u32::from_le_bytes(*b"IBSN");
const SNAPSHOT_VERSION: u16 = 1;

/// Live counters of the engine, equal to the bitmap cardinalities at the
/// instant the engine lock was released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EngineStats {
    /// Number of tracked (non-clean) blocks.
    pub total_blocks: u64,
    /// Cardinality of the dirty bitmap.
    pub dirty_blocks: u64,
    /// Cardinality of the new bitmap.
    pub new_blocks: u64,
    /// Cardinality of the deleted bitmap.
    pub deleted_blocks: u64,
}

#[derive(Debug)]
struct EngineInner {
    dirty: Bitmap64,
    new_blocks: Bitmap64,
    deleted: Bitmap64,
    metadata: HashMap<u64, BlockMetadata>,
    time_index: SkipIndex<i64, Bitmap64>,
    wal_index: SkipIndex<u64, Bitmap64>,
}

impl EngineInner {
    fn empty() -> Self {
        Self {
            dirty: Bitmap64::new(),
            new_blocks: Bitmap64::new(),
            deleted: Bitmap64::new(),
            metadata: HashMap::new(),
            time_index: SkipIndex::new(),
            wal_index: SkipIndex::new(),
        }
    }

    fn bitmap_for(&mut self, state: BlockState) -> &mut Bitmap64 {
        match state {
            BlockState::Dirty => &mut self.dirty,
            BlockState::New => &mut self.new_blocks,
            BlockState::Deleted => &mut self.deleted,
            BlockState::Clean => unreachable!("clean blocks have no bitmap"),
        }
    }

    fn heap_bytes(&self) -> u64 {
        let metadata_bytes =
            self.metadata.len() * (std::mem::size_of::<BlockMetadata>() + std::mem::size_of::<u64>());
        (self.dirty.memory_bytes()
            + self.new_blocks.memory_bytes()
            + self.deleted.memory_bytes()
            + metadata_bytes) as u64
    }
}

/// The block-state index. See the module docs for the locking and
/// invariant story.
#[derive(Debug)]
pub struct BitmapEngine {
    config: EngineConfig,
    inner: RwLock<EngineInner>,
    memory_warned: AtomicBool,
}

impl Default for BitmapEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl BitmapEngine {
    /// Create an engine with default configuration.
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// Create an engine with explicit configuration.
    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(EngineInner::empty()),
            memory_warned: AtomicBool::new(false),
        }
    }

    /// The engine's configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Record a block modification at `(wal_offset, timestamp)`.
    pub fn mark_dirty(&self, block_id: u64, wal_offset: u64, timestamp: i64) -> Result<()> {
        self.mark(block_id, wal_offset, timestamp, BlockState::Dirty)
    }

    /// Record a block creation at `(wal_offset, timestamp)`.
    pub fn mark_new(&self, block_id: u64, wal_offset: u64, timestamp: i64) -> Result<()> {
        self.mark(block_id, wal_offset, timestamp, BlockState::New)
    }

    /// Record a block deletion at `(wal_offset, timestamp)`.
    pub fn mark_deleted(&self, block_id: u64, wal_offset: u64, timestamp: i64) -> Result<()> {
        self.mark(block_id, wal_offset, timestamp, BlockState::Deleted)
    }

    fn mark(&self, block_id: u64, wal_offset: u64, timestamp: i64, target: BlockState) -> Result<()> {
        if target == BlockState::Clean {
            return Err(Error::new(
                ErrorCode::InvalidParam,
                "mark target must be DIRTY, NEW or DELETED",
            ));
        }
        let mut inner = self.inner.write();

        // Validate everything before touching any structure: a failed mark
        // leaves no partial mutation behind.
        let current = inner
            .metadata
            .get(&block_id)
            .map(|m| m.state)
            .unwrap_or_default();
        if !current.can_transition_to(target) {
            debug!(block_id, from = %current, to = %target, "rejected state transition");
            return Err(transition_error(current, target));
        }
        if self.config.max_blocks > 0
            && !inner.metadata.contains_key(&block_id)
            && inner.metadata.len() as u64 >= self.config.max_blocks
        {
            return Err(Error::new(
                ErrorCode::OutOfMemory,
                format!("tracked-block capacity {} reached", self.config.max_blocks),
            ));
        }

        inner.metadata.insert(
            block_id,
            BlockMetadata {
                block_id,
                wal_offset,
                timestamp,
                state: target,
            },
        );
        inner.dirty.remove(block_id);
        inner.new_blocks.remove(block_id);
        inner.deleted.remove(block_id);
        inner.bitmap_for(target).add(block_id);
        inner
            .time_index
            .get_or_insert_with(timestamp, Bitmap64::new)
            .add(block_id);
        inner
            .wal_index
            .get_or_insert_with(wal_offset, Bitmap64::new)
            .add(block_id);

        self.check_memory(&inner);
        Ok(())
    }

    /// Purge a block back to clean: remove it from every state bitmap and
    /// erase its metadata. Permitted from any non-deleted state.
    pub fn clear_block(&self, block_id: u64) -> Result<()> {
        let mut inner = self.inner.write();
        let Some(meta) = inner.metadata.get(&block_id) else {
            return Err(Error::new(
                ErrorCode::BlockNotFound,
                format!("block {block_id} is not tracked"),
            ));
        };
        if meta.state == BlockState::Deleted {
            return Err(transition_error(BlockState::Deleted, BlockState::Clean));
        }
        inner.dirty.remove(block_id);
        inner.new_blocks.remove(block_id);
        inner.deleted.remove(block_id);
        inner.metadata.remove(&block_id);
        Ok(())
    }

    /// Metadata for a block, if tracked.
    pub fn block_metadata(&self, block_id: u64) -> Option<BlockMetadata> {
        self.inner.read().metadata.get(&block_id).copied()
    }

    /// Current state of a block. Untracked blocks are clean.
    pub fn block_state(&self, block_id: u64) -> BlockState {
        self.inner
            .read()
            .metadata
            .get(&block_id)
            .map(|m| m.state)
            .unwrap_or_default()
    }

    /// Ids of currently dirty blocks whose latest timestamp posting falls in
    /// `[t_lo, t_hi]`, ascending, at most `max`.
    pub fn dirty_blocks_by_time(&self, t_lo: i64, t_hi: i64, max: usize) -> Vec<u64> {
        self.collect_dirty(Some((t_lo, t_hi)), None).to_array(max)
    }

    /// Ids of currently dirty blocks whose latest WAL posting falls in
    /// `[w_lo, w_hi]`, ascending, at most `max`.
    pub fn dirty_blocks_by_wal(&self, w_lo: u64, w_hi: u64, max: usize) -> Vec<u64> {
        self.collect_dirty(None, Some((w_lo, w_hi))).to_array(max)
    }

    /// Number of dirty blocks posted in the timestamp range.
    pub fn count_dirty_blocks_by_time(&self, t_lo: i64, t_hi: i64) -> u64 {
        self.collect_dirty(Some((t_lo, t_hi)), None).len()
    }

    /// Number of dirty blocks posted in the WAL range.
    pub fn count_dirty_blocks_by_wal(&self, w_lo: u64, w_hi: u64) -> u64 {
        self.collect_dirty(None, Some((w_lo, w_hi))).len()
    }

    /// Dirty blocks constrained by either or both dimensions, as a bitmap.
    /// With both ranges present the result is the intersection.
    pub(crate) fn collect_dirty(
        &self,
        time_range: Option<(i64, i64)>,
        wal_range: Option<(u64, u64)>,
    ) -> Bitmap64 {
        let inner = self.inner.read();
        let mut result = match time_range {
            Some((t_lo, t_hi)) => {
                let mut acc = Bitmap64::new();
                inner.time_index.for_each_range(t_lo, t_hi, false, |_, posted| {
                    let mut hit = posted.clone();
                    hit.intersect_with(&inner.dirty);
                    acc.union_with(&hit);
                });
                acc
            }
            None => inner.dirty.clone(),
        };
        if let Some((w_lo, w_hi)) = wal_range {
            let mut wal_acc = Bitmap64::new();
            inner.wal_index.for_each_range(w_lo, w_hi, false, |_, posted| {
                let mut hit = posted.clone();
                hit.intersect_with(&inner.dirty);
                wal_acc.union_with(&hit);
            });
            result.intersect_with(&wal_acc);
        }
        result
    }

    /// Live counters; always consistent with the bitmaps because they are
    /// read under the same lock acquisition.
    pub fn stats(&self) -> EngineStats {
        let inner = self.inner.read();
        EngineStats {
            total_blocks: inner.metadata.len() as u64,
            dirty_blocks: inner.dirty.len(),
            new_blocks: inner.new_blocks.len(),
            deleted_blocks: inner.deleted.len(),
        }
    }

    /// Approximate heap footprint of the index state, in bytes.
    pub fn memory_usage(&self) -> u64 {
        self.inner.read().heap_bytes()
    }

    /// Drop all tracked state. Used after a completed backup checkpoint.
    pub fn reset(&self) {
        let mut inner = self.inner.write();
        *inner = EngineInner::empty();
        self.memory_warned.store(false, Ordering::Relaxed);
    }

    fn check_memory(&self, inner: &EngineInner) {
        if !self.config.memory_monitor_enabled || self.config.memory_limit_mb == 0 {
            return;
        }
        let limit = self.config.memory_limit_mb * crate::size::MIB;
        let threshold = limit / 100 * u64::from(self.config.lru_cleanup_threshold_pct);
        let usage = inner.heap_bytes();
        if usage >= threshold && !self.memory_warned.swap(true, Ordering::Relaxed) {
            warn!(usage, limit, "engine memory above cleanup threshold");
        }
    }

    /// Persist the engine state to the configured persistence path.
    pub fn save_snapshot(&self) -> Result<PathBuf> {
        let path = self.persistence_path()?;
        self.save_snapshot_to(&path)?;
        Ok(path)
    }

    /// Persist the engine state to `path`.
    ///
    /// The snapshot holds every metadata record plus the three state
    /// bitmaps, CRC-guarded; index postings are rebuilt on load, so stale
    /// postings do not survive a restore.
    pub fn save_snapshot_to(&self, path: &Path) -> Result<()> {
        let inner = self.inner.read();
        let mut buf = Vec::with_capacity(64 + inner.metadata.len() * 25);
        buf.extend_from_slice(&SNAPSHOT_MAGIC.to_le_bytes());
        buf.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
        buf.extend_from_slice(&(inner.metadata.len() as u64).to_le_bytes());

        let mut records: Vec<&BlockMetadata> = inner.metadata.values().collect();
        records.sort_by_key(|m| m.block_id);
        for meta in records {
            buf.extend_from_slice(&meta.block_id.to_le_bytes());
            buf.extend_from_slice(&meta.wal_offset.to_le_bytes());
            buf.extend_from_slice(&meta.timestamp.to_le_bytes());
            buf.push(meta.state as u8);
        }
        for bitmap in [&inner.dirty, &inner.new_blocks, &inner.deleted] {
            buf.extend_from_slice(&(bitmap.serialized_size() as u32).to_le_bytes());
            bitmap.serialize_into(&mut buf);
        }
        drop(inner);

        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        std::fs::write(path, buf)?;
        Ok(())
    }

    /// Restore engine state from the configured persistence path.
    pub fn load_snapshot(&self) -> Result<PathBuf> {
        let path = self.persistence_path()?;
        self.load_snapshot_from(&path)?;
        Ok(path)
    }

    /// Restore engine state from `path`, replacing all current state.
    pub fn load_snapshot_from(&self, path: &Path) -> Result<()> {
        let data = std::fs::read(path)?;
        if data.len() < 4 {
            return Err(Error::new(ErrorCode::DataCorruption, "snapshot too short"));
        }
        let (body, crc_bytes) = data.split_at(data.len() - 4);
        let stored = u32::from_le_bytes(crc_bytes.try_into().unwrap());
        if crc32fast::hash(body) != stored {
            return Err(Error::new(
                ErrorCode::DataCorruption,
                "snapshot checksum mismatch",
            ));
        }

        let mut r = SliceReader::new(body);
        if r.read_u32()? != SNAPSHOT_MAGIC {
            return Err(Error::new(ErrorCode::DataCorruption, "snapshot magic mismatch"));
        }
        let version = r.read_u16()?;
        if version != SNAPSHOT_VERSION {
            return Err(Error::new(
                ErrorCode::DataCorruption,
                format!("unsupported snapshot version {version}"),
            ));
        }
        let count = r.read_u64()?;

        let mut restored = EngineInner::empty();
        for _ in 0..count {
            let block_id = r.read_u64()?;
            let wal_offset = r.read_u64()?;
            let timestamp = r.read_i64()?;
            let state = BlockState::from_u8(r.read_u8()?).ok_or_else(|| {
                Error::new(ErrorCode::DataCorruption, "snapshot holds unknown block state")
            })?;
            restored.metadata.insert(
                block_id,
                BlockMetadata {
                    block_id,
                    wal_offset,
                    timestamp,
                    state,
                },
            );
            restored
                .time_index
                .get_or_insert_with(timestamp, Bitmap64::new)
                .add(block_id);
            restored
                .wal_index
                .get_or_insert_with(wal_offset, Bitmap64::new)
                .add(block_id);
        }
        for bitmap in [
            &mut restored.dirty,
            &mut restored.new_blocks,
            &mut restored.deleted,
        ] {
            let len = r.read_u32()? as usize;
            *bitmap = Bitmap64::deserialize(r.take(len)?)?;
        }
        if !r.is_exhausted() {
            return Err(Error::new(
                ErrorCode::DataCorruption,
                "trailing bytes after snapshot",
            ));
        }
        let tracked =
            restored.dirty.len() + restored.new_blocks.len() + restored.deleted.len();
        if tracked != restored.metadata.len() as u64 {
            return Err(Error::new(
                ErrorCode::DataCorruption,
                "snapshot bitmaps disagree with metadata",
            ));
        }

        *self.inner.write() = restored;
        Ok(())
    }

    fn persistence_path(&self) -> Result<PathBuf> {
        if !self.config.persistence_enabled {
            return Err(Error::new(
                ErrorCode::InvalidParam,
                "engine persistence is disabled",
            ));
        }
        self.config
            .persistence_path
            .clone()
            .ok_or_else(|| Error::new(ErrorCode::InvalidParam, "no persistence path configured"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hybrid_collect_intersects_dimensions() {
        let engine = BitmapEngine::new();
        engine.mark_dirty(1, 100, 1000).unwrap();
        engine.mark_dirty(2, 200, 2000).unwrap();
        engine.mark_dirty(3, 300, 3000).unwrap();

        // Time range covers blocks 1-2, WAL range covers blocks 2-3.
        let both = engine.collect_dirty(Some((1000, 2000)), Some((200, 300)));
        assert_eq!(both.iter().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn stale_postings_are_filtered_by_state() {
        let engine = BitmapEngine::new();
        engine.mark_dirty(7, 100, 1000).unwrap();
        engine.mark_deleted(7, 200, 2000).unwrap();
        // The old time posting still exists, but the block is no longer dirty.
        assert!(engine.dirty_blocks_by_time(0, 5000, 10).is_empty());
    }

    #[test]
    fn snapshot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.snapshot");

        let engine = BitmapEngine::new();
        engine.mark_dirty(1, 100, 1000).unwrap();
        engine.mark_new(2, 200, 2000).unwrap();
        engine.mark_dirty(3, 300, 3000).unwrap();
        engine.mark_deleted(3, 400, 4000).unwrap();
        engine.save_snapshot_to(&path).unwrap();

        let restored = BitmapEngine::new();
        restored.load_snapshot_from(&path).unwrap();
        assert_eq!(restored.stats(), engine.stats());
        assert_eq!(restored.block_state(1), BlockState::Dirty);
        assert_eq!(restored.block_state(2), BlockState::New);
        assert_eq!(restored.block_state(3), BlockState::Deleted);
        assert_eq!(restored.dirty_blocks_by_wal(0, 500, 10), vec![1]);
    }

    #[test]
    fn snapshot_detects_tampering() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.snapshot");

        let engine = BitmapEngine::new();
        engine.mark_dirty(42, 1, 1).unwrap();
        engine.save_snapshot_to(&path).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        let err = BitmapEngine::new().load_snapshot_from(&path).unwrap_err();
        assert_eq!(err.code(), ErrorCode::DataCorruption);
    }

    #[test]
    fn max_blocks_is_enforced() {
        let config = EngineConfig::default().with_max_blocks(2);
        let engine = BitmapEngine::with_config(config);
        engine.mark_dirty(1, 1, 1).unwrap();
        engine.mark_dirty(2, 2, 2).unwrap();
        let err = engine.mark_dirty(3, 3, 3).unwrap_err();
        assert_eq!(err.code(), ErrorCode::OutOfMemory);
        // Clearing a block frees its capacity slot.
        engine.clear_block(1).unwrap();
        engine.mark_dirty(1, 4, 4).unwrap();
    }
}
