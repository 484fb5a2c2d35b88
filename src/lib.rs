//! # rmalloc - A First-Fit Free-List Memory Allocator
//!
//! This crate provides a classic **first-fit free-list allocator** in Rust
//! that manages memory using the `sbrk` system call, in the style of a
//! minimal `malloc`/`free`/`calloc`/`realloc`.
//!
//! ## Overview
//!
//! Every allocation is prefixed by a header and linked into one chain in
//! allocation order. Released blocks stay in the chain, marked free, and
//! are handed out again to the first request they can hold:
//!
//! ```text
//!   Free-List Concept:
//!
//!   ┌──────────────────────────────────────────────────────────────────────┐
//!   │                         HEAP MEMORY                                  │
//!   │                                                                      │
//!   │   ┌────┬─────┬────┬──────┬────┬─────┬────┬──────┐                    │
//!   │   │ H  │ A1  │ H  │ free │ H  │ A3  │ H  │ free │ ◄── Program Break  │
//!   │   └──┬─┴─────┴─▲┬─┴──────┴─▲┬─┴─────┴─▲──┴──────┘                    │
//!   │      │         ││          ││         │                              │
//!   │      └─ next ──┘└── next ──┘└─ next ──┘                              │
//!   │                                                                      │
//!   │   allocate(n): scan from the head, reuse the first free block        │
//!   │   with size >= n; grow the heap at the break when none fits.         │
//!   └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Releasing the block at the very end of the heap returns its bytes to the
//! operating system by moving the program break back down; releasing any
//! other block only marks it free for reuse.
//!
//! ## Crate Structure
//!
//! ```text
//!   rmalloc
//!   ├── align      - Alignment macros (align!, align_to!)
//!   ├── block      - Block header structure (internal)
//!   ├── segment    - Data segment backends (Sbrk, FixedSegment)
//!   └── heap       - Heap implementation and the four primitives
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::mem;
//! use rmalloc::Heap;
//!
//! fn main() {
//!     let heap = Heap::new();
//!
//!     unsafe {
//!         // Allocate memory for a u64
//!         let ptr = heap.allocate(mem::size_of::<u64>()).unwrap();
//!         let ptr = ptr.as_ptr() as *mut u64;
//!
//!         // Use the memory
//!         *ptr = 42;
//!         println!("Value: {}", *ptr);
//!
//!         // Free the memory
//!         heap.release(ptr as *mut u8);
//!     }
//! }
//! ```
//!
//! ## How It Works
//!
//! The allocator uses `sbrk(2)` to extend the program's data segment:
//!
//! ```text
//!   Program Memory Layout:
//!
//!   High Address ┌─────────────────────┐
//!                │       Stack         │ ↓ grows down
//!                │         │           │
//!                │         ▼           │
//!                │                     │
//!                │         ▲           │
//!                │         │           │
//!                │       Heap          │ ↑ grows up (sbrk)
//!                ├─────────────────────┤ ← Program Break
//!                │   Uninitialized     │
//!                │       Data          │
//!                ├─────────────────────┤
//!                │   Initialized       │
//!                │       Data          │
//!                ├─────────────────────┤
//!                │       Text          │
//!   Low Address  └─────────────────────┘
//! ```
//!
//! Each allocation creates a block with metadata:
//!
//! ```text
//!   Single Allocation:
//!   ┌───────────────────────┬────────────────────────────────┐
//!   │    Block Header       │         User Data              │
//!   │  ┌─────────────────┐  │                                │
//!   │  │ size: N         │  │  ┌──────────────────────────┐  │
//!   │  │ is_free: false  │  │  │                          │  │
//!   │  │ next: null/ptr  │  │  │     N bytes usable       │  │
//!   │  └─────────────────┘  │  │                          │  │
//!   │      32 bytes         │  └──────────────────────────┘  │
//!   └───────────────────────┴────────────────────────────────┘
//!                           ▲
//!                           └── Pointer returned to user (16-byte aligned)
//! ```
//!
//! The heap grows by the header plus the usable size, rounded up to the
//! header alignment, and shrinks by the same amount when the last block is
//! released, so the break only ever sits on a block boundary.
//!
//! ## Features
//!
//! - **First-fit reuse**: Freed blocks are recycled for later requests
//! - **Returns memory to the OS**: The break recedes when the last block is freed
//! - **Thread-safe**: One lock serializes all heap operations
//! - **Direct OS interaction**: Uses `sbrk` for memory management
//! - **Pluggable segment**: An in-memory segment backs deterministic tests
//!
//! ## Limitations
//!
//! - **No coalescing**: Adjacent free blocks are never merged
//! - **No splitting**: A reused block keeps its original size, wasting the tail
//! - **Linear search**: Allocation cost grows with the number of blocks
//! - **Unix-only**: The default segment requires `libc` and `sbrk` (POSIX systems)
//!
//! ## Safety
//!
//! This crate is inherently unsafe as it deals with raw memory management.
//! All allocation and release operations require `unsafe` blocks, and
//! releasing a foreign pointer or releasing the same region twice is
//! undefined behavior the heap cannot detect.

pub mod align;
mod block;
mod heap;
mod segment;

pub use heap::Heap;
pub use segment::{DataSegment, FixedSegment, OutOfMemory, Sbrk};
