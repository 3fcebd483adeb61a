//! Block mutation events emitted by the storage engine

use serde::{Deserialize, Serialize};
use std::fmt;

/// What happened to a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    /// The block was created.
    Create,
    /// The block was modified.
    Update,
    /// The block was made durable by the storage engine.
    Flush,
    /// The block was removed.
    Delete,
}

impl EventKind {
    /// Get the kind as a string.
    pub const fn as_str(&self) -> &'static str {
        match self {
            EventKind::Create => "CREATE",
            EventKind::Update => "UPDATE",
            EventKind::Flush => "FLUSH",
            EventKind::Delete => "DELETE",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One block-mutation notification.
///
/// Owned by the ring buffer from enqueue to dequeue; producers keep no
/// reference after submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEvent {
    /// Mutation kind.
    pub kind: EventKind,
    /// 64-bit block id.
    pub block_id: u64,
    /// Byte position in the write-ahead log for this mutation.
    pub wal_offset: u64,
    /// Wall-clock timestamp, nanoseconds.
    pub timestamp: i64,
}

impl BlockEvent {
    /// Create an event record.
    pub fn new(kind: EventKind, block_id: u64, wal_offset: u64, timestamp: i64) -> Self {
        Self {
            kind,
            block_id,
            wal_offset,
            timestamp,
        }
    }
}
