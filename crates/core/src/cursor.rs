//! Page/offset addressing over a bounded, append-only list.
//!
//! A [`Cursor`] names a window of `page_size` items; [`Position`] is the
//! zero-based inclusive index range of that window in the backing list.
//! A `page_size` of zero is a caller bug and is not checked.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub page: u64,
    pub offset: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub start: u64,
    pub end: u64,
}

impl Position {
    /// Intersect with a list of `total` items. `None` when nothing is left.
    pub fn within(self, total: u64) -> Option<Position> {
        if total == 0 || self.start >= total {
            return None;
        }
        Some(Position { start: self.start, end: self.end.min(total - 1) })
    }

    pub fn len(&self) -> u64 { self.end.saturating_sub(self.start) + 1 }

    pub fn is_empty(&self) -> bool { self.end < self.start }
}

/// Cursor for the most recent page of a list holding `total` items.
///
/// When `total` is a non-zero exact multiple of `page_size` the offset comes
/// out as `page_size`, not 0. Callers depend on this exact value; do not
/// normalize it.
pub fn latest_cursor(total: u64, page_size: u64) -> Cursor {
    if total < page_size {
        return Cursor { page: 1, offset: 0 };
    }
    let page = total.div_ceil(page_size);
    let offset = page_size - (total % page_size);
    Cursor { page, offset }
}

/// Inclusive index range addressed by `cursor`. `start` is clamped at zero,
/// `end` is not clamped to the list length (see [`Position::within`]).
pub fn position_from_cursor(cursor: Cursor, page_size: u64) -> Position {
    let start = (cursor.page.saturating_sub(1) * page_size).saturating_sub(cursor.offset);
    Position { start, end: start + page_size - 1 }
}
