//! Ordered range indices for the bitmap engine
//!
//! The engine keeps two of these: timestamp -> block-id bitmap and
//! WAL offset -> block-id bitmap. Both need ordered insertion, point
//! lookup and inclusive range iteration, which [`SkipIndex`] provides
//! with expected O(log n) operations.

mod skiplist;

pub use skiplist::SkipIndex;
