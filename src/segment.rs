use std::mem;
use std::ptr::NonNull;

use libc::{c_void, intptr_t, sbrk};
use log::debug;
use thiserror::Error;

use crate::align_to;
use crate::block::ALIGNMENT;

/// Returned by [`DataSegment::grow`] when the underlying primitive denies
/// the extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("data segment could not be extended by {requested} bytes")]
pub struct OutOfMemory {
  /// Byte count of the denied extension request.
  pub requested: usize,
}

/// A contiguous region of memory with a movable end, the allocator's only
/// source of storage.
///
/// Implementations track a single end position ("break"): [`grow`] moves it
/// forward and hands back the previous end, [`shrink`] moves it backward.
/// Callers must only ever retract bytes they obtained from the most recent
/// extensions, and the heap serializes every call through its lock, so no
/// two grow/shrink calls race on the break.
///
/// [`grow`]: Self::grow
/// [`shrink`]: Self::shrink
pub trait DataSegment {
  /// Extends the segment by exactly `bytes` and returns the address of the
  /// newly available region, writable for `bytes` bytes.
  fn grow(
    &mut self,
    bytes: usize,
  ) -> Result<NonNull<u8>, OutOfMemory>;

  /// Contracts the segment by exactly `bytes`, giving the memory back to
  /// its source. Assumed to succeed once the caller has validated that the
  /// bytes sit at the end of the segment.
  fn shrink(
    &mut self,
    bytes: usize,
  );

  /// Current end of the segment. A pure query: never fails, never moves
  /// the end.
  fn current(&mut self) -> *mut u8;
}

/// The process data segment, extended and retracted with `sbrk(2)`.
///
/// This is the production segment: one per process, shared with anything
/// else that moves the program break. Growth fails when the kernel denies
/// the extension, which `sbrk` reports with a `(void*)-1` sentinel.
pub struct Sbrk;

impl DataSegment for Sbrk {
  fn grow(
    &mut self,
    bytes: usize,
  ) -> Result<NonNull<u8>, OutOfMemory> {
    let address = unsafe { sbrk(bytes as intptr_t) };

    if address == usize::MAX as *mut c_void {
      return Err(OutOfMemory { requested: bytes });
    }

    debug!("program break extended by {} bytes at {:?}", bytes, address);

    // The break is never at the null page.
    Ok(unsafe { NonNull::new_unchecked(address as *mut u8) })
  }

  fn shrink(
    &mut self,
    bytes: usize,
  ) {
    unsafe { sbrk(-(bytes as intptr_t)) };

    debug!("program break retracted by {} bytes", bytes);
  }

  fn current(&mut self) -> *mut u8 {
    unsafe { sbrk(0) as *mut u8 }
  }
}

#[derive(Clone, Copy)]
#[repr(C, align(16))]
struct Chunk([u8; 16]);

const CHUNK: usize = mem::size_of::<Chunk>();

const _: () = assert!(mem::align_of::<Chunk>() == ALIGNMENT);

/// A fixed-capacity segment over owned memory instead of the program break.
///
/// Growth past the capacity is denied with [`OutOfMemory`], which makes the
/// allocation failure paths reachable on demand, and every instance is
/// independent, so multiple heaps can coexist without touching the process
/// break. Storage is chunked to the block alignment, so block starts are
/// as aligned as they are on the real segment.
///
/// # Examples
///
/// ```rust
/// use rmalloc::{FixedSegment, Heap};
///
/// let heap = Heap::with_segment(FixedSegment::new(4096));
///
/// let address = unsafe { heap.allocate(64) }.unwrap();
/// unsafe { heap.release(address.as_ptr()) };
/// ```
pub struct FixedSegment {
  storage: Box<[Chunk]>,
  used: usize,
}

impl FixedSegment {
  /// Creates a segment backed by at least `capacity` bytes, rounded up to
  /// a whole chunk.
  pub fn new(capacity: usize) -> Self {
    let chunks = align_to!(capacity, CHUNK) / CHUNK;

    Self {
      storage: vec![Chunk([0; CHUNK]); chunks].into_boxed_slice(),
      used: 0,
    }
  }

  /// Bytes currently handed out to the allocator.
  pub fn used(&self) -> usize {
    self.used
  }

  /// Total backing capacity in bytes.
  pub fn capacity(&self) -> usize {
    self.storage.len() * CHUNK
  }
}

impl DataSegment for FixedSegment {
  fn grow(
    &mut self,
    bytes: usize,
  ) -> Result<NonNull<u8>, OutOfMemory> {
    if bytes > self.capacity() - self.used {
      return Err(OutOfMemory { requested: bytes });
    }

    let address = unsafe { self.storage.as_mut_ptr().cast::<u8>().add(self.used) };
    self.used += bytes;

    // Box storage is never null.
    Ok(unsafe { NonNull::new_unchecked(address) })
  }

  fn shrink(
    &mut self,
    bytes: usize,
  ) {
    debug_assert!(bytes <= self.used);

    self.used -= bytes;
  }

  fn current(&mut self) -> *mut u8 {
    unsafe { self.storage.as_mut_ptr().cast::<u8>().add(self.used) }
  }
}
