//! Bitmap engine behavior tests
//!
//! Covers the block lifecycle, the transition matrix, range queries and
//! the engine's structural invariants.

use std::collections::HashMap;

use incremental_bitmap::engine::{BitmapEngine, BlockState};
use incremental_bitmap::status::ErrorCode;
use rand::prelude::*;

#[test]
fn basic_lifecycle() {
    let engine = BitmapEngine::new();

    engine.mark_dirty(1001, 1000, 1_000_000).unwrap();
    assert_eq!(engine.block_state(1001), BlockState::Dirty);

    engine.mark_deleted(1001, 1001, 2_000_000).unwrap();
    assert_eq!(engine.block_state(1001), BlockState::Deleted);

    let err = engine.mark_dirty(1001, 1002, 3_000_000).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidStateTransition);
    assert!(err.message().contains("DELETED is terminal"));
    // The failed mark changed nothing.
    assert_eq!(engine.block_state(1001), BlockState::Deleted);
    let meta = engine.block_metadata(1001).unwrap();
    assert_eq!(meta.wal_offset, 1001);
    assert_eq!(meta.timestamp, 2_000_000);
}

#[test]
fn untracked_blocks_are_clean() {
    let engine = BitmapEngine::new();
    assert_eq!(engine.block_state(42), BlockState::Clean);
    assert_eq!(engine.block_metadata(42), None);
    assert_eq!(
        engine.clear_block(42).unwrap_err().code(),
        ErrorCode::BlockNotFound
    );
}

#[test]
fn wal_range_query_returns_ascending_hits() {
    let engine = BitmapEngine::new();
    engine.mark_dirty(1001, 1000, 10).unwrap();
    engine.mark_dirty(1002, 2000, 20).unwrap();
    engine.mark_dirty(1003, 3000, 30).unwrap();
    engine.mark_dirty(1004, 4000, 40).unwrap();

    let hits = engine.dirty_blocks_by_wal(1500, 3500, 10);
    assert_eq!(hits, vec![1002, 1003]);

    // Bounds are inclusive.
    assert_eq!(engine.dirty_blocks_by_wal(2000, 3000, 10), vec![1002, 1003]);
    // Truncation keeps ascending order.
    assert_eq!(engine.dirty_blocks_by_wal(0, 5000, 2), vec![1001, 1002]);
    assert_eq!(engine.count_dirty_blocks_by_wal(0, 5000), 4);
}

#[test]
fn time_range_query_filters_by_live_state() {
    let engine = BitmapEngine::new();
    engine.mark_dirty(1, 100, 1000).unwrap();
    engine.mark_dirty(2, 200, 2000).unwrap();
    engine.mark_deleted(2, 300, 3000).unwrap();

    // Block 2 still has a posting at t=2000 but is no longer dirty.
    assert_eq!(engine.dirty_blocks_by_time(0, 5000, 10), vec![1]);
    assert_eq!(engine.count_dirty_blocks_by_time(0, 5000), 1);
}

#[test]
fn remark_after_transition_overwrites_position() {
    let engine = BitmapEngine::new();
    engine.mark_new(7, 100, 1000).unwrap();
    engine.mark_dirty(7, 900, 9000).unwrap();

    let meta = engine.block_metadata(7).unwrap();
    assert_eq!(meta.wal_offset, 900);
    assert_eq!(meta.timestamp, 9000);
    assert_eq!(meta.state, BlockState::Dirty);

    // Queries find the block through either posting, old or new, because
    // postings are not purged; the state bitmap does the filtering.
    assert_eq!(engine.dirty_blocks_by_wal(50, 150, 10), vec![7]);
    assert_eq!(engine.dirty_blocks_by_wal(850, 950, 10), vec![7]);
}

#[test]
fn clear_is_a_purge_from_any_non_deleted_state() {
    let engine = BitmapEngine::new();

    engine.mark_dirty(1, 10, 100).unwrap();
    engine.clear_block(1).unwrap();
    assert_eq!(engine.block_state(1), BlockState::Clean);
    assert_eq!(engine.block_metadata(1), None);

    // NEW blocks purge too, even though NEW cannot be *marked* clean.
    engine.mark_new(2, 20, 200).unwrap();
    engine.clear_block(2).unwrap();
    assert_eq!(engine.block_metadata(2), None);

    engine.mark_dirty(3, 30, 300).unwrap();
    engine.mark_deleted(3, 31, 301).unwrap();
    let err = engine.clear_block(3).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidStateTransition);

    let stats = engine.stats();
    assert_eq!(stats.total_blocks, 1);
    assert_eq!(stats.deleted_blocks, 1);
}

#[test]
fn mark_attempts_agree_with_the_matrix() {
    use BlockState::*;
    let targets = [Dirty, New, Deleted];
    let mut next_id = 0u64;

    for from in [Clean, Dirty, New, Deleted] {
        for to in targets {
            next_id += 1;
            let engine = BitmapEngine::new();
            // Drive a fresh block into `from`.
            match from {
                Clean => {}
                Dirty => engine.mark_dirty(next_id, 1, 1).unwrap(),
                New => engine.mark_new(next_id, 1, 1).unwrap(),
                Deleted => engine.mark_deleted(next_id, 1, 1).unwrap(),
            }
            let result = match to {
                Dirty => engine.mark_dirty(next_id, 2, 2),
                New => engine.mark_new(next_id, 2, 2),
                Deleted => engine.mark_deleted(next_id, 2, 2),
                Clean => unreachable!(),
            };
            assert_eq!(
                result.is_ok(),
                from.can_transition_to(to),
                "{from} -> {to}"
            );
        }
    }
}

#[test]
fn random_walk_preserves_invariants() {
    let mut rng = StdRng::seed_from_u64(0x5EED);
    let engine = BitmapEngine::new();
    let mut model: HashMap<u64, BlockState> = HashMap::new();

    for step in 0..10_000u64 {
        let id = rng.gen_range(0..200);
        let wal = step;
        let ts = step as i64;
        let current = model.get(&id).copied().unwrap_or_default();
        match rng.gen_range(0..4) {
            0 => {
                let ok = engine.mark_dirty(id, wal, ts).is_ok();
                assert_eq!(ok, current.can_transition_to(BlockState::Dirty));
                if ok {
                    model.insert(id, BlockState::Dirty);
                }
            }
            1 => {
                let ok = engine.mark_new(id, wal, ts).is_ok();
                assert_eq!(ok, current.can_transition_to(BlockState::New));
                if ok {
                    model.insert(id, BlockState::New);
                }
            }
            2 => {
                let ok = engine.mark_deleted(id, wal, ts).is_ok();
                assert_eq!(ok, current.can_transition_to(BlockState::Deleted));
                if ok {
                    model.insert(id, BlockState::Deleted);
                }
            }
            _ => {
                let ok = engine.clear_block(id).is_ok();
                let expected = model.contains_key(&id) && current != BlockState::Deleted;
                assert_eq!(ok, expected, "clear of {id} in {current}");
                if ok {
                    model.remove(&id);
                }
            }
        }
    }

    // Engine state agrees with the model.
    for id in 0..200u64 {
        let expected = model.get(&id).copied().unwrap_or_default();
        assert_eq!(engine.block_state(id), expected, "block {id}");
    }

    // Counter invariant: total equals the sum of the per-state bitmaps and
    // the model's tracked population.
    let stats = engine.stats();
    assert_eq!(
        stats.total_blocks,
        stats.dirty_blocks + stats.new_blocks + stats.deleted_blocks
    );
    assert_eq!(stats.total_blocks, model.len() as u64);
    let dirty_in_model = model.values().filter(|s| **s == BlockState::Dirty).count() as u64;
    assert_eq!(stats.dirty_blocks, dirty_in_model);
}

#[test]
fn reset_drops_everything() {
    let engine = BitmapEngine::new();
    engine.mark_dirty(1, 1, 1).unwrap();
    engine.mark_new(2, 2, 2).unwrap();
    engine.reset();
    assert_eq!(engine.stats().total_blocks, 0);
    assert_eq!(engine.block_state(1), BlockState::Clean);
    assert!(engine.dirty_blocks_by_wal(0, u64::MAX, 10).is_empty());
}

#[test]
fn memory_usage_is_reported() {
    let engine = BitmapEngine::new();
    let before = engine.memory_usage();
    for id in 0..1000u64 {
        engine.mark_dirty(id, id, id as i64).unwrap();
    }
    assert!(engine.memory_usage() > before);
}
