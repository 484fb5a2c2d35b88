use std::mem;

use crate::align_to;

/// Metadata stored immediately before every region the heap hands out.
///
/// The data bytes start at the header address plus [`HEADER_SIZE`], so the
/// `align(16)` representation is what makes every returned address 16-byte
/// aligned.
#[repr(C, align(16))]
pub struct BlockHeader {
  /// Usable byte count requested by the caller, header excluded.
  pub size: usize,
  /// Whether the region is currently available for reuse.
  pub is_free: bool,
  /// Next header in allocation order, null for the last block.
  pub next: *mut BlockHeader,
}

/// Bytes occupied by a header. A multiple of [`ALIGNMENT`] by construction.
pub const HEADER_SIZE: usize = mem::size_of::<BlockHeader>();

/// Alignment of every block start, and therefore of every data address.
pub const ALIGNMENT: usize = mem::align_of::<BlockHeader>();

impl BlockHeader {
  pub fn new(
    size: usize,
    is_free: bool,
    next: *mut BlockHeader,
  ) -> Self {
    Self { size, is_free, next }
  }
}

/// Bytes a block with `size` usable bytes occupies in the data segment:
/// header plus data, rounded up so the block that follows starts aligned.
///
/// A block's growth request and its matching end-of-heap shrink both
/// resolve to this value, which keeps the break position consistent over
/// the block's lifetime. Only call this with a recorded block size; for
/// caller-supplied sizes use [`checked_footprint`].
pub fn footprint(size: usize) -> usize {
  align_to!(HEADER_SIZE + size, ALIGNMENT)
}

/// Overflow-checked [`footprint`] for caller-supplied sizes: `None` when
/// header plus data plus rounding padding does not fit in `usize`. No
/// segment could satisfy such a request, so allocation treats it like any
/// other denied growth.
pub fn checked_footprint(size: usize) -> Option<usize> {
  let padded = HEADER_SIZE.checked_add(size)?.checked_add(ALIGNMENT - 1)?;

  Some(padded & !(ALIGNMENT - 1))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_header_layout() {
    assert_eq!(16, ALIGNMENT);
    assert_eq!(0, HEADER_SIZE % ALIGNMENT);
    assert!(HEADER_SIZE >= mem::size_of::<usize>() * 2 + mem::size_of::<bool>());
  }

  #[test]
  fn test_footprint() {
    for size in 1..=128 {
      let total = footprint(size);

      assert!(total >= HEADER_SIZE + size);
      assert_eq!(0, total % ALIGNMENT);
      assert!(total < HEADER_SIZE + size + ALIGNMENT);
    }
  }

  #[test]
  fn test_checked_footprint() {
    assert_eq!(Some(footprint(64)), checked_footprint(64));

    // Largest size whose padded total still fits in usize.
    assert!(checked_footprint(usize::MAX - HEADER_SIZE - (ALIGNMENT - 1)).is_some());

    assert_eq!(None, checked_footprint(usize::MAX - HEADER_SIZE));
    assert_eq!(None, checked_footprint(usize::MAX));
  }
}
