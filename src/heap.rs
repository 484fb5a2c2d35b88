use std::alloc::{GlobalAlloc, Layout};
use std::fmt;
use std::ptr::{self, NonNull};

use log::trace;
use spin::Mutex;

use crate::block::{ALIGNMENT, BlockHeader, HEADER_SIZE, checked_footprint, footprint};
use crate::segment::{DataSegment, Sbrk};

/// A first-fit free-list allocator over a [`DataSegment`].
///
/// One heap owns one segment plus the chain of block headers carved out of
/// it, all behind a single lock. Each of the four primitives takes the lock
/// once for its entire critical section, segment calls included, so every
/// operation on the shared state is totally ordered by lock acquisition.
pub struct Heap<S: DataSegment = Sbrk> {
  inner: Mutex<Inner<S>>,
}

struct Inner<S> {
  segment: S,
  head: *mut BlockHeader,
  tail: *mut BlockHeader,
}

// Block pointers are created from segment memory and only ever dereferenced
// while the lock above them is held.
unsafe impl<S: Send> Send for Inner<S> {}

/// Address of a block's usable bytes: header address plus header size.
unsafe fn data_address(block: *mut BlockHeader) -> NonNull<u8> {
  unsafe { NonNull::new_unchecked((block as *mut u8).add(HEADER_SIZE)) }
}

/// Recovers the header sitting immediately before a data address.
unsafe fn header_of(address: *mut u8) -> *mut BlockHeader {
  unsafe { address.sub(HEADER_SIZE) as *mut BlockHeader }
}

impl Heap<Sbrk> {
  /// Creates a heap over the process data segment.
  ///
  /// Const, so a heap can live in a `static` and serve as the process-wide
  /// allocator.
  pub const fn new() -> Self {
    Self {
      inner: Mutex::new(Inner {
        segment: Sbrk,
        head: ptr::null_mut(),
        tail: ptr::null_mut(),
      }),
    }
  }
}

impl<S: DataSegment> Heap<S> {
  /// Creates a heap over the given segment.
  pub fn with_segment(segment: S) -> Self {
    Self {
      inner: Mutex::new(Inner {
        segment,
        head: ptr::null_mut(),
        tail: ptr::null_mut(),
      }),
    }
  }

  /// Allocates `size` usable bytes and returns their address.
  ///
  /// The first sufficiently large free block is reused; otherwise the
  /// segment grows by one block. Returns `None` for a zero-size request,
  /// for a size so large its block would not fit in the address space, or
  /// when the segment denies growth; the heap is left unchanged in every
  /// failure case. A returned address is writable for exactly `size` bytes
  /// and aligned to 16.
  ///
  /// # Safety
  ///
  /// The returned region must only be written up to `size` bytes and must
  /// not be used again after it is released.
  pub unsafe fn allocate(
    &self,
    size: usize,
  ) -> Option<NonNull<u8>> {
    if size == 0 {
      return None;
    }

    let mut inner = self.inner.lock();

    unsafe { inner.allocate(size) }
  }

  /// Releases a region previously obtained from this heap. Null is a no-op.
  ///
  /// A block at the very end of the segment is unlinked and its bytes are
  /// given back; any other block stays in the chain, marked free for
  /// reuse. Free neighbours are never merged.
  ///
  /// # Safety
  ///
  /// `address` must be null or an address obtained from this heap that has
  /// not been released since. Double releases and foreign pointers are
  /// undefined behavior; the heap does not detect them.
  pub unsafe fn release(
    &self,
    address: *mut u8,
  ) {
    if address.is_null() {
      return;
    }

    let mut inner = self.inner.lock();

    unsafe { inner.release(address) }
  }

  /// Allocates a zero-filled region for `count` elements of `element_size`
  /// bytes each.
  ///
  /// Returns `None` when either argument is zero, or when the element
  /// product or the block footprint overflows, so an oversized request can
  /// never come back as an undersized region.
  ///
  /// # Safety
  ///
  /// Same contract as [`allocate`](Self::allocate).
  pub unsafe fn zero_allocate(
    &self,
    count: usize,
    element_size: usize,
  ) -> Option<NonNull<u8>> {
    if count == 0 || element_size == 0 {
      return None;
    }

    let total = count.checked_mul(element_size)?;

    let address = {
      let mut inner = self.inner.lock();
      unsafe { inner.allocate(total) }
    }?;

    // The region is exclusively ours once allocated, so the fill can
    // happen outside the critical section.
    unsafe { ptr::write_bytes(address.as_ptr(), 0, total) };

    Some(address)
  }

  /// Moves a region to `new_size` usable bytes, preserving its contents.
  ///
  /// A null `address` or a zero `new_size` delegates to
  /// [`allocate`](Self::allocate), so a null resize is a fresh allocation
  /// and a zero-size resize returns `None` with the old region still owned
  /// by the caller. A block that already holds `new_size` bytes is
  /// returned as is; its recorded size is kept, never trimmed. Otherwise
  /// the contents move to a fresh block and the old one is released. When
  /// the fresh allocation fails, `None` is returned and the original
  /// region is untouched and still owned by the caller.
  ///
  /// # Safety
  ///
  /// `address` must be null or an address obtained from this heap that has
  /// not been released since.
  pub unsafe fn resize(
    &self,
    address: *mut u8,
    new_size: usize,
  ) -> Option<NonNull<u8>> {
    if address.is_null() || new_size == 0 {
      return unsafe { self.allocate(new_size) };
    }

    let mut inner = self.inner.lock();

    unsafe { inner.resize(address, new_size) }
  }

  /// Bytes recorded in blocks currently handed out to callers.
  pub fn used(&self) -> usize {
    let inner = self.inner.lock();
    let mut bytes = 0;

    inner.for_each_block(|block| {
      if !block.is_free {
        bytes += block.size;
      }
    });

    bytes
  }

  /// Bytes recorded in blocks available for reuse.
  pub fn free(&self) -> usize {
    let inner = self.inner.lock();
    let mut bytes = 0;

    inner.for_each_block(|block| {
      if block.is_free {
        bytes += block.size;
      }
    });

    bytes
  }

  /// Number of blocks in the chain, free and in use.
  pub fn block_count(&self) -> usize {
    let inner = self.inner.lock();
    let mut count = 0;

    inner.for_each_block(|_| count += 1);

    count
  }
}

impl<S: DataSegment> fmt::Debug for Heap<S> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Heap")
      .field("used", &self.used())
      .field("free", &self.free())
      .field("blocks", &self.block_count())
      .finish()
  }
}

impl<S> Inner<S> {
  /// Runs `f` over every header in the chain. Sound because an `Inner` is
  /// only reachable through the heap's lock.
  fn for_each_block(
    &self,
    mut f: impl FnMut(&BlockHeader),
  ) {
    let mut current = self.head;

    while !current.is_null() {
      let block = unsafe { &*current };
      f(block);
      current = block.next;
    }
  }
}

impl<S: DataSegment> Inner<S> {
  /// First-fit search: the first free block with at least `size` usable
  /// bytes, scanning the whole chain from `head`. Read-only; the caller
  /// flips `is_free` on reuse.
  unsafe fn find_free_block(
    &self,
    size: usize,
  ) -> Option<NonNull<BlockHeader>> {
    unsafe {
      let mut current = self.head;

      while !current.is_null() {
        if (*current).is_free && (*current).size >= size {
          return NonNull::new(current);
        }
        current = (*current).next;
      }

      None
    }
  }

  unsafe fn allocate(
    &mut self,
    size: usize,
  ) -> Option<NonNull<u8>> {
    unsafe {
      if let Some(block) = self.find_free_block(size) {
        let block = block.as_ptr();
        (*block).is_free = false;

        trace!("reusing block at {block:?} for {size} bytes");

        return Some(data_address(block));
      }

      let total = checked_footprint(size)?;
      let address = self.segment.grow(total).ok()?;

      let block = address.as_ptr() as *mut BlockHeader;
      block.write(BlockHeader::new(size, false, ptr::null_mut()));

      if self.head.is_null() {
        self.head = block;
        self.tail = block;
      } else {
        (*self.tail).next = block;
        self.tail = block;
      }

      trace!("grew block at {block:?} for {size} bytes ({total} from the segment)");

      Some(data_address(block))
    }
  }

  unsafe fn release(
    &mut self,
    address: *mut u8,
  ) {
    unsafe {
      let block = header_of(address);
      let total = footprint((*block).size);

      // The block is the heap end exactly when the bytes grown for it
      // reach the segment's current break.
      if (block as *mut u8).add(total) == self.segment.current() {
        if self.head == self.tail {
          self.head = ptr::null_mut();
          self.tail = ptr::null_mut();
        } else {
          let mut current = self.head;

          while !(*current).next.is_null() && (*current).next != self.tail {
            current = (*current).next;
          }
          (*current).next = ptr::null_mut();
          self.tail = current;
        }

        self.segment.shrink(total);

        trace!("returned block at {block:?} to the segment ({total} bytes)");

        return;
      }

      (*block).is_free = true;

      trace!("marked block at {block:?} free");
    }
  }

  unsafe fn resize(
    &mut self,
    address: *mut u8,
    new_size: usize,
  ) -> Option<NonNull<u8>> {
    unsafe {
      let block = header_of(address);
      let old_size = (*block).size;

      if old_size >= new_size {
        // Shrinking in place is a no-op: the recorded size is kept.
        return NonNull::new(address);
      }

      let fresh = self.allocate(new_size)?;

      ptr::copy_nonoverlapping(address, fresh.as_ptr(), old_size);
      self.release(address);

      Some(fresh)
    }
  }
}

unsafe impl<S: DataSegment + Send> GlobalAlloc for Heap<S> {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    if layout.align() > ALIGNMENT {
      return ptr::null_mut();
    }

    match unsafe { self.allocate(layout.size()) } {
      Some(address) => address.as_ptr(),
      None => ptr::null_mut(),
    }
  }

  unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
    unsafe { self.release(ptr) }
  }

  unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
    if layout.align() > ALIGNMENT {
      return ptr::null_mut();
    }

    match unsafe { self.zero_allocate(layout.size(), 1) } {
      Some(address) => address.as_ptr(),
      None => ptr::null_mut(),
    }
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    if layout.align() > ALIGNMENT {
      return ptr::null_mut();
    }

    match unsafe { self.resize(ptr, new_size) } {
      Some(address) => address.as_ptr(),
      None => ptr::null_mut(),
    }
  }
}

#[cfg(test)]
mod tests {
  use std::mem;
  use std::sync::Arc;
  use std::thread;

  use super::*;
  use crate::segment::FixedSegment;

  fn test_heap(capacity: usize) -> Heap<FixedSegment> {
    Heap::with_segment(FixedSegment::new(capacity))
  }

  #[test]
  fn test_allocate_zero_returns_none() {
    let heap = test_heap(256);

    assert!(unsafe { heap.allocate(0) }.is_none());
    assert_eq!(0, heap.block_count());
  }

  #[test]
  fn test_allocate_write_read_round_trip() {
    let heap = test_heap(1024);

    let address = unsafe { heap.allocate(64) }.unwrap();

    unsafe {
      for i in 0..64 {
        address.as_ptr().add(i).write((i * 3) as u8);
      }
      for i in 0..64 {
        assert_eq!((i * 3) as u8, address.as_ptr().add(i).read());
      }
    }
  }

  #[test]
  fn test_returned_addresses_are_aligned() {
    let heap = test_heap(4096);

    for size in [1, 3, 8, 17, 40, 100] {
      let address = unsafe { heap.allocate(size) }.unwrap();
      assert_eq!(0, address.as_ptr() as usize % ALIGNMENT);
    }
  }

  #[test]
  fn test_first_fit_reuses_released_block() {
    let heap = test_heap(1024);

    let a = unsafe { heap.allocate(4) }.unwrap();
    let b = unsafe { heap.allocate(4) }.unwrap();

    unsafe { heap.release(a.as_ptr()) };

    // Not the heap end, so the block stays in the chain.
    assert_eq!(2, heap.block_count());

    let grown = heap.inner.lock().segment.used();
    let c = unsafe { heap.allocate(4) }.unwrap();

    assert_eq!(a, c);
    assert_eq!(grown, heap.inner.lock().segment.used());
    let _ = b;
  }

  #[test]
  fn test_release_of_sole_block_restores_initial_state() {
    let heap = test_heap(1024);

    let address = unsafe { heap.allocate(100) }.unwrap();
    assert_eq!(footprint(100), heap.inner.lock().segment.used());

    unsafe { heap.release(address.as_ptr()) };

    assert!(heap.inner.lock().head.is_null());
    assert!(heap.inner.lock().tail.is_null());
    assert_eq!(0, heap.inner.lock().segment.used());

    // Indistinguishable from a fresh heap: the next request grows from the
    // segment start again.
    let again = unsafe { heap.allocate(100) }.unwrap();
    assert_eq!(address, again);
  }

  #[test]
  fn test_release_of_last_block_retargets_tail() {
    let heap = test_heap(1024);

    let a = unsafe { heap.allocate(16) }.unwrap();
    let b = unsafe { heap.allocate(16) }.unwrap();
    assert_eq!(2 * footprint(16), heap.inner.lock().segment.used());

    unsafe { heap.release(b.as_ptr()) };

    assert_eq!(1, heap.block_count());
    assert_eq!(footprint(16), heap.inner.lock().segment.used());

    {
      let inner = heap.inner.lock();
      assert_eq!(inner.head, inner.tail);
      assert!(unsafe { (*inner.tail).next.is_null() });
      assert!(!unsafe { (*inner.tail).is_free });
    }

    // The next growth reoccupies the reclaimed bytes.
    let c = unsafe { heap.allocate(16) }.unwrap();
    assert_eq!(b, c);
    let _ = a;
  }

  #[test]
  fn test_release_null_is_noop() {
    let heap = test_heap(64);

    unsafe { heap.release(ptr::null_mut()) };

    assert_eq!(0, heap.block_count());
  }

  #[test]
  fn test_zero_allocate_rejects_invalid_requests() {
    let heap = test_heap(256);

    unsafe {
      assert!(heap.zero_allocate(0, 8).is_none());
      assert!(heap.zero_allocate(8, 0).is_none());
      assert!(heap.zero_allocate(usize::MAX, 2).is_none());
      assert!(heap.zero_allocate(2, usize::MAX).is_none());
    }
    assert_eq!(0, heap.block_count());
  }

  #[test]
  fn test_zero_allocate_rejects_total_past_the_address_space() {
    let heap = test_heap(256);

    // The element product fits in usize; adding the header would not.
    assert!(unsafe { heap.zero_allocate(1, usize::MAX) }.is_none());
    assert_eq!(0, heap.block_count());
  }

  #[test]
  fn test_zero_allocate_zero_fills_a_reused_block() {
    let heap = test_heap(1024);

    let a = unsafe { heap.allocate(32) }.unwrap();
    // Pins the first block away from the segment end.
    let b = unsafe { heap.allocate(8) }.unwrap();

    unsafe {
      ptr::write_bytes(a.as_ptr(), 0xAB, 32);
      heap.release(a.as_ptr());
    }

    let zeroed = unsafe { heap.zero_allocate(8, 4) }.unwrap();
    assert_eq!(a, zeroed);

    unsafe {
      for i in 0..32 {
        assert_eq!(0, zeroed.as_ptr().add(i).read());
      }
    }
    let _ = b;
  }

  #[test]
  fn test_allocate_when_growth_is_denied() {
    let heap = test_heap(64);

    assert!(unsafe { heap.allocate(512) }.is_none());
    assert_eq!(0, heap.block_count());

    assert!(unsafe { heap.allocate(16) }.is_some());

    // No free block fits and the capacity is exhausted; the chain keeps
    // its single block.
    assert!(unsafe { heap.allocate(16) }.is_none());
    assert_eq!(1, heap.block_count());
  }

  #[test]
  fn test_allocate_rejects_sizes_past_the_address_space() {
    let heap = test_heap(256);

    // Adding the header (or the rounding padding) to these would wrap.
    assert!(unsafe { heap.allocate(usize::MAX) }.is_none());
    assert!(unsafe { heap.allocate(usize::MAX - HEADER_SIZE) }.is_none());
    assert_eq!(0, heap.block_count());
  }

  #[test]
  fn test_resize_within_recorded_size_returns_same_pointer() {
    let heap = test_heap(1024);

    let address = unsafe { heap.allocate(32) }.unwrap();

    unsafe {
      for i in 0..32 {
        address.as_ptr().add(i).write(i as u8);
      }
    }

    let same = unsafe { heap.resize(address.as_ptr(), 16) }.unwrap();
    assert_eq!(address, same);

    let still_same = unsafe { heap.resize(address.as_ptr(), 32) }.unwrap();
    assert_eq!(address, still_same);

    unsafe {
      for i in 0..32 {
        assert_eq!(i as u8, address.as_ptr().add(i).read());
      }
    }
    assert_eq!(1, heap.block_count());
  }

  #[test]
  fn test_resize_grows_by_copy_and_releases_the_old_block() {
    let heap = test_heap(4096);

    let old = unsafe { heap.allocate(16) }.unwrap();

    unsafe {
      for i in 0..16 {
        old.as_ptr().add(i).write(0xC0 + i as u8);
      }
    }

    // Keeps the old block off the segment end.
    let pin = unsafe { heap.allocate(8) }.unwrap();

    let new = unsafe { heap.resize(old.as_ptr(), 64) }.unwrap();
    assert_ne!(old, new);

    unsafe {
      for i in 0..16 {
        assert_eq!(0xC0 + i as u8, new.as_ptr().add(i).read());
      }
    }

    // The old block went back on the free list.
    let reused = unsafe { heap.allocate(16) }.unwrap();
    assert_eq!(old, reused);
    let _ = pin;
  }

  #[test]
  fn test_resize_failure_leaves_the_original_block() {
    let heap = test_heap(64);

    let address = unsafe { heap.allocate(16) }.unwrap();

    unsafe {
      ptr::write_bytes(address.as_ptr(), 0x5A, 16);
    }

    assert!(unsafe { heap.resize(address.as_ptr(), 400) }.is_none());

    unsafe {
      for i in 0..16 {
        assert_eq!(0x5A, address.as_ptr().add(i).read());
      }
    }
    assert_eq!(1, heap.block_count());

    // Still owned by the caller; releasing it rewinds the segment.
    unsafe { heap.release(address.as_ptr()) };
    assert_eq!(0, heap.inner.lock().segment.used());
  }

  #[test]
  fn test_resize_with_null_or_zero_delegates_to_allocate() {
    let heap = test_heap(1024);

    let fresh = unsafe { heap.resize(ptr::null_mut(), 24) }.unwrap();
    assert_eq!(1, heap.block_count());

    assert!(unsafe { heap.resize(fresh.as_ptr(), 0) }.is_none());
    assert_eq!(1, heap.block_count());

    unsafe {
      fresh.as_ptr().write(7);
      assert_eq!(7, fresh.as_ptr().read());
    }
  }

  #[test]
  fn test_used_free_and_block_count() {
    let heap = test_heap(4096);
    assert_eq!((0, 0, 0), (heap.used(), heap.free(), heap.block_count()));

    let a = unsafe { heap.allocate(40) }.unwrap();
    let _b = unsafe { heap.allocate(24) }.unwrap();
    assert_eq!((64, 0, 2), (heap.used(), heap.free(), heap.block_count()));

    unsafe { heap.release(a.as_ptr()) };
    assert_eq!((24, 40, 2), (heap.used(), heap.free(), heap.block_count()));
  }

  #[test]
  fn test_debug_reports_the_chain() {
    let heap = test_heap(256);

    unsafe { heap.allocate(16) }.unwrap();

    let rendered = format!("{heap:?}");
    assert!(rendered.contains("used: 16"));
    assert!(rendered.contains("blocks: 1"));
  }

  #[test]
  fn test_heaps_are_independent() {
    let first = test_heap(256);
    let second = test_heap(256);

    let a = unsafe { first.allocate(16) }.unwrap();
    let b = unsafe { second.allocate(16) }.unwrap();
    assert_ne!(a, b);

    unsafe { first.release(a.as_ptr()) };

    assert_eq!(0, first.block_count());
    assert_eq!(1, second.block_count());
    let _ = b;
  }

  #[test]
  fn test_concurrent_callers_serialize() {
    let heap = Arc::new(Heap::with_segment(FixedSegment::new(1 << 20)));
    let mut handles = Vec::new();

    for thread_id in 0..4u8 {
      let heap = Arc::clone(&heap);

      handles.push(thread::spawn(move || {
        let size = 16 * (thread_id as usize + 1);

        for _ in 0..64 {
          let address = unsafe { heap.allocate(size) }.expect("segment capacity exceeded");

          unsafe {
            ptr::write_bytes(address.as_ptr(), thread_id, size);
            for i in 0..size {
              assert_eq!(thread_id, address.as_ptr().add(i).read());
            }
            heap.release(address.as_ptr());
          }
        }
      }));
    }

    for handle in handles {
      handle.join().unwrap();
    }

    // No header was lost or duplicated past the lock: everything the
    // threads released is free again and the chain still works.
    assert_eq!(0, heap.used());
    assert!(heap.block_count() <= 4 * 64);

    let address = unsafe { heap.allocate(64) }.unwrap();
    unsafe { heap.release(address.as_ptr()) };
  }

  #[test]
  fn test_global_alloc_adapter() {
    let heap = test_heap(4096);

    unsafe {
      let layout = Layout::from_size_align(64, 8).unwrap();
      let address = GlobalAlloc::alloc(&heap, layout);
      assert!(!address.is_null());

      let zeroed = GlobalAlloc::alloc_zeroed(&heap, layout);
      for i in 0..64 {
        assert_eq!(0, zeroed.add(i).read());
      }

      let grown = GlobalAlloc::realloc(&heap, address, layout, 128);
      assert!(!grown.is_null());

      GlobalAlloc::dealloc(&heap, grown, Layout::from_size_align(128, 8).unwrap());
      GlobalAlloc::dealloc(&heap, zeroed, layout);

      // Alignments beyond the header's are refused.
      let over_aligned = Layout::from_size_align(64, 64).unwrap();
      assert!(GlobalAlloc::alloc(&heap, over_aligned).is_null());
    }
  }

  #[test]
  fn test_alloc_over_the_program_break() {
    let heap = Heap::new();

    unsafe {
      let first = heap.allocate(mem::size_of::<u64>()).unwrap();
      (first.as_ptr() as *mut u64).write(3);
      assert_eq!(3, (first.as_ptr() as *mut u64).read());

      let count = 6;
      let second = heap.allocate(count * mem::size_of::<u16>()).unwrap();
      let second = second.as_ptr() as *mut u16;
      for i in 0..count {
        second.add(i).write((i + 1) as u16);
      }

      assert_eq!(3, (first.as_ptr() as *mut u64).read());
      for i in 0..count {
        assert_eq!((i + 1) as u16, second.add(i).read());
      }

      heap.release(first.as_ptr());

      // First fit hands the released block back out.
      let third = heap.allocate(mem::size_of::<u32>()).unwrap();
      assert_eq!(first, third);

      heap.release(third.as_ptr());

      // Too large for the freed block, so the heap grows instead.
      let fourth = heap.allocate(mem::size_of::<u128>()).unwrap();
      assert!(fourth.as_ptr() > third.as_ptr());
      (fourth.as_ptr() as *mut u128).write(25);
      assert_eq!(25, (fourth.as_ptr() as *mut u128).read());
    }
  }
}
