//! Log coordinates

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Total-order coordinate of one entry: segment first, then index
///
/// Field order matters: the derived `Ord` compares `segment_id` before
/// `entry_index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    pub segment_id: u64,
    pub entry_index: u64,
}

impl Position {
    pub const EARLIEST: Position = Position {
        segment_id: 0,
        entry_index: 0,
    };

    pub const fn new(segment_id: u64, entry_index: u64) -> Self {
        Position {
            segment_id,
            entry_index,
        }
    }

    pub const fn first_of(segment_id: u64) -> Self {
        Position::new(segment_id, 0)
    }

    /// Position directly after this one within the same segment
    pub const fn next(&self) -> Self {
        Position::new(self.segment_id, self.entry_index + 1)
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.segment_id, self.entry_index)
    }
}

/// One stored record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub position: Position,
    pub payload: Bytes,
}

impl Entry {
    pub fn new(position: Position, payload: Bytes) -> Self {
        Entry { position, payload }
    }
}
