//! incremental-bitmap - Block-level change tracking for incremental backups
//!
//! This crate accelerates incremental backups of a time-series database by
//! continuously recording which on-disk blocks were created, modified or
//! deleted since the last backup checkpoint, and by answering range queries
//! over those changes so a backup driver copies only the affected blocks:
//!
//! - **Bitmap engine**: dirty/new/deleted block sets as compressed bitmaps,
//!   a block-id -> metadata map, and two skip-list range indices (by
//!   timestamp and by WAL offset) behind a single read-write lock
//! - **Event interceptor**: absorbs block-mutation events from the storage
//!   engine through a bounded ring buffer so the database hot path never
//!   blocks on index maintenance
//! - **Backup coordinator**: cursors over the change set, size estimation,
//!   integrity validation, retry with backoff, and the backup archive format
//!
//! # Quick start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use incremental_bitmap::config::InterceptorConfig;
//! use incremental_bitmap::engine::BitmapEngine;
//! use incremental_bitmap::interceptor::EventInterceptor;
//!
//! let engine = Arc::new(BitmapEngine::new());
//! let interceptor = Arc::new(EventInterceptor::new(
//!     InterceptorConfig::default(),
//!     Arc::clone(&engine),
//! )?);
//! interceptor.start()?;
//!
//! // storage engine hot path
//! interceptor.on_block_update(1001, 4096, 1_000_000);
//!
//! // backup driver
//! let dirty = engine.dirty_blocks_by_wal(0, u64::MAX, 1024);
//! ```
//!
//! Range queries are eventually consistent with respect to events still
//! sitting in the intake queue: a reader that needs its own submissions
//! visible must stop (or drain) the interceptor first.

#![warn(missing_docs)]

pub mod archive;
pub mod bitmap;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod event;
pub mod index;
pub mod interceptor;
pub mod plugin;
pub mod ring_buffer;
pub mod status;
pub mod storage;
mod wire;

// Re-exports for convenience
pub use bitmap::Bitmap64;
pub use engine::{BitmapEngine, BlockMetadata, BlockState, EngineStats};
pub use event::{BlockEvent, EventKind};
pub use status::{Error, ErrorCode, Result};

/// Utility for size literals (e.g. 1 GiB file caps)
pub mod size {
    /// 1 KiB in bytes
    pub const KIB: u64 = 1024;
    /// 1 MiB in bytes
    pub const MIB: u64 = 1024 * KIB;
    /// 1 GiB in bytes
    pub const GIB: u64 = 1024 * MIB;
}
