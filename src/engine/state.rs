//! Block states and the transition matrix

use std::fmt;

use crate::status::{Error, ErrorCode};

/// Tracking state of a block relative to the last backup checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum BlockState {
    /// Unchanged since the last checkpoint. Blocks without metadata are
    /// implicitly clean.
    #[default]
    Clean = 0,
    /// Exists and was modified.
    Dirty = 1,
    /// Created since the last checkpoint.
    New = 2,
    /// Removed since the last checkpoint. Terminal.
    Deleted = 3,
}

/// Allowed transitions; rows are the current state, columns the target,
/// in `Clean, Dirty, New, Deleted` order.
const TRANSITIONS: [[bool; 4]; 4] = [
    [false, true, true, true],    // Clean
    [true, false, false, true],   // Dirty
    [false, true, false, true],   // New
    [false, false, false, false], // Deleted
];

impl BlockState {
    /// Whether a transition from `self` to `target` is allowed.
    #[inline]
    pub const fn can_transition_to(&self, target: BlockState) -> bool {
        TRANSITIONS[*self as usize][target as usize]
    }

    /// Get the state as a string.
    pub const fn as_str(&self) -> &'static str {
        match self {
            BlockState::Clean => "CLEAN",
            BlockState::Dirty => "DIRTY",
            BlockState::New => "NEW",
            BlockState::Deleted => "DELETED",
        }
    }

    /// Decode a state from its wire value.
    pub const fn from_u8(value: u8) -> Option<BlockState> {
        match value {
            0 => Some(BlockState::Clean),
            1 => Some(BlockState::Dirty),
            2 => Some(BlockState::New),
            3 => Some(BlockState::Deleted),
            _ => None,
        }
    }
}

impl fmt::Display for BlockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Build the error for a forbidden transition, naming the edge.
pub(crate) fn transition_error(from: BlockState, to: BlockState) -> Error {
    let message = if from == to {
        format!("block is already {from}")
    } else if from == BlockState::Deleted {
        format!("cannot transition from DELETED to {to}: DELETED is terminal")
    } else if from == BlockState::New && to == BlockState::Clean {
        "NEW block cannot be marked CLEAN: it must become DIRTY or DELETED first".to_string()
    } else {
        format!("transition {from} -> {to} is not allowed")
    };
    Error::new(ErrorCode::InvalidStateTransition, message)
}

/// Per-block tracking record. Exists only for non-clean blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockMetadata {
    /// 64-bit block id.
    pub block_id: u64,
    /// WAL offset of the most recent mutation.
    pub wal_offset: u64,
    /// Timestamp of the most recent mutation, nanoseconds.
    pub timestamp: i64,
    /// Current tracking state.
    pub state: BlockState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matrix_matches_the_contract() {
        use BlockState::*;
        let allowed = [
            (Clean, Dirty),
            (Clean, New),
            (Clean, Deleted),
            (Dirty, Clean),
            (Dirty, Deleted),
            (New, Dirty),
            (New, Deleted),
        ];
        for from in [Clean, Dirty, New, Deleted] {
            for to in [Clean, Dirty, New, Deleted] {
                let expected = allowed.contains(&(from, to));
                assert_eq!(from.can_transition_to(to), expected, "{from} -> {to}");
            }
        }
    }

    #[test]
    fn deleted_is_terminal_in_messages() {
        let err = transition_error(BlockState::Deleted, BlockState::Dirty);
        assert!(err.message().contains("DELETED is terminal"));
    }

    #[test]
    fn state_wire_roundtrip() {
        for state in [
            BlockState::Clean,
            BlockState::Dirty,
            BlockState::New,
            BlockState::Deleted,
        ] {
            assert_eq!(BlockState::from_u8(state as u8), Some(state));
        }
        assert_eq!(BlockState::from_u8(4), None);
    }
}
