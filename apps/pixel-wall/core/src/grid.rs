use std::collections::BTreeMap;

use parking_lot::Mutex;
use thiserror::Error;

/// Shared pixel grid with a round-robin write cursor.
///
/// Every paint lands on the slot under the cursor, after which the cursor
/// advances and wraps back to zero once it reaches `slot_count`. Both the
/// colors and the cursor live behind one lock so a snapshot always pairs a
/// grid with the cursor that produced it.
pub struct GridState {
    slot_count: usize,
    inner: Mutex<GridInner>,
}

struct GridInner {
    colors: BTreeMap<usize, String>,
    cursor: usize,
}

/// Point-in-time copy of the grid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridSnapshot {
    pub colors: BTreeMap<usize, String>,
    pub cursor: usize,
    pub slot_count: usize,
}

impl GridSnapshot {
    /// 1-based position of the slot the next paint will land on.
    pub fn next_pixel(&self) -> usize {
        self.cursor % self.slot_count + 1
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GridError {
    #[error("grid must have at least one slot")]
    ZeroCapacity,
}

impl GridState {
    pub fn new(slot_count: usize) -> Result<Self, GridError> {
        if slot_count == 0 {
            return Err(GridError::ZeroCapacity);
        }
        Ok(Self {
            slot_count,
            inner: Mutex::new(GridInner {
                colors: BTreeMap::new(),
                cursor: 0,
            }),
        })
    }

    /// Writes `color` into the slot under the cursor and advances it.
    ///
    /// Surrounding quote characters are stripped (clients commonly send a
    /// JSON-encoded string); anything else is stored verbatim. Returns the
    /// slot that was written.
    pub fn paint(&self, color: &str) -> usize {
        let color = normalize_color(color);
        let mut inner = self.inner.lock();
        let slot = inner.cursor;
        inner.colors.insert(slot, color.to_owned());
        inner.cursor = (slot + 1) % self.slot_count;
        slot
    }

    pub fn snapshot(&self) -> GridSnapshot {
        let inner = self.inner.lock();
        GridSnapshot {
            colors: inner.colors.clone(),
            cursor: inner.cursor,
            slot_count: self.slot_count,
        }
    }
}

fn normalize_color(raw: &str) -> &str {
    raw.trim_matches('"')
}
