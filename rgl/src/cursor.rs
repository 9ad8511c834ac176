//! Sequential element cursors over mapped or host-side byte regions.
//!
//! Every access is checked twice: the element position against the
//! declared element count of the owning buffer, then the resulting byte
//! range against the physical length of the region. The two checks guard
//! different invariants and neither is skipped when the other passes.

use std::cell::Cell;
use std::ops::Range;

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CursorError {
    #[error("Element {index} is out of bounds (element count {count})")]
    OutOfBounds { index: u64, count: u64 },

    #[error(
        "Bytes {offset}..{end} lie outside the {len}-byte mapped region"
    )]
    RegionOutOfBounds { offset: u64, end: u64, len: u64 },
}

/// Position state shared by the attribute and index cursors.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ElementCursor {
    base: u64,
    stride: u64,
    width: u64,
    count: u64,
    position: u64,
}

impl ElementCursor {
    /// A cursor over `count` elements of `width` bytes, the first at byte
    /// `base` and each subsequent one `stride` bytes further.
    pub(crate) fn new(base: u64, stride: u64, width: u64, count: u64) -> Self {
        Self {
            base,
            stride,
            width,
            count,
            position: 0,
        }
    }

    pub(crate) fn position(&self) -> u64 {
        self.position
    }

    pub(crate) fn count(&self) -> u64 {
        self.count
    }

    pub(crate) fn has_next(&self) -> bool {
        self.position < self.count
    }

    pub(crate) fn seek_to(&mut self, index: u64) -> Result<(), CursorError> {
        if index >= self.count {
            return Err(CursorError::OutOfBounds {
                index,
                count: self.count,
            });
        }
        self.position = index;
        Ok(())
    }

    /// Byte range of the element at the current position.
    pub(crate) fn current_range(
        &self,
        region_len: usize,
    ) -> Result<Range<usize>, CursorError> {
        if self.position >= self.count {
            return Err(CursorError::OutOfBounds {
                index: self.position,
                count: self.count,
            });
        }
        let offset = self
            .position
            .saturating_mul(self.stride)
            .saturating_add(self.base);
        let end = offset.saturating_add(self.width);
        let len = region_len as u64;
        if end > len {
            return Err(CursorError::RegionOutOfBounds { offset, end, len });
        }
        Ok(offset as usize..end as usize)
    }

    pub(crate) fn advance(&mut self) {
        self.position += 1;
    }
}

pub(crate) fn write_cells(cells: &[Cell<u8>], bytes: &[u8]) {
    debug_assert_eq!(cells.len(), bytes.len());
    for (cell, byte) in cells.iter().zip(bytes) {
        cell.set(*byte);
    }
}

pub(crate) fn read_cells(cells: &[Cell<u8>]) -> Vec<u8> {
    cells.iter().map(Cell::get).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seek_rejects_positions_past_the_declared_count() {
        let mut cursor = ElementCursor::new(0, 4, 4, 3);

        assert!(cursor.seek_to(2).is_ok());
        assert_eq!(
            cursor.seek_to(3),
            Err(CursorError::OutOfBounds { index: 3, count: 3 })
        );
        assert_eq!(cursor.position(), 2);
    }

    #[test]
    fn byte_bounds_are_checked_independently_of_element_count() {
        // Claims 4 elements but the region only holds 3.
        let mut cursor = ElementCursor::new(0, 4, 4, 4);
        cursor.seek_to(3).unwrap();

        assert_eq!(
            cursor.current_range(12),
            Err(CursorError::RegionOutOfBounds {
                offset: 12,
                end: 16,
                len: 12
            })
        );
    }

    #[test]
    fn ranges_follow_base_and_stride() {
        let mut cursor = ElementCursor::new(12, 20, 8, 2);
        assert_eq!(cursor.current_range(40), Ok(12..20));
        cursor.advance();
        assert_eq!(cursor.current_range(40), Ok(32..40));
        cursor.advance();
        assert!(!cursor.has_next());
        assert_eq!(
            cursor.current_range(40),
            Err(CursorError::OutOfBounds { index: 2, count: 2 })
        );
    }
}
