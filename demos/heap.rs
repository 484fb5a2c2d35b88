use std::mem;

use libc::sbrk;
use rmalloc::Heap;

/// Prints the current program break using `sbrk(0)`.
/// The program break is the upper boundary of the heap managed via brk/sbrk.
unsafe fn print_program_break(label: &str) {
  println!(
    "[{}] PID = {}, program break (sbrk(0)) = {:?}",
    label,
    std::process::id(),
    unsafe { sbrk(0) },
  );
}

fn main() {
  // One heap over the process data segment. It keeps:
  // - a `head` pointer to the first block
  // - a `tail` pointer to the last block
  // and threads every allocation into that chain, reusing freed blocks
  // first-fit before growing at the break.
  let heap = Heap::new();

  unsafe {
    // Initial heap state
    print_program_break("start");

    // --------------------------------------------------------------------
    // 1) Allocate space for an i32 and write to it.
    // --------------------------------------------------------------------
    let first_block = heap.allocate(mem::size_of::<i32>()).unwrap();
    println!("\n[1] Allocate i32 -> {:?}", first_block);

    let first_ptr = first_block.as_ptr() as *mut i32;
    first_ptr.write(10);
    println!("[1] Value written to first_block = {}", first_ptr.read());
    println!("[1] Heap state: {:?}", heap);

    // --------------------------------------------------------------------
    // 2) Zero-allocate an array of 6 i32s, calloc style.
    //    Every element must read back as 0 before we touch it.
    // --------------------------------------------------------------------
    let array_block = heap.zero_allocate(6, mem::size_of::<i32>()).unwrap();
    println!("\n[2] Zero-allocate [i32; 6] -> {:?}", array_block);

    let array_ptr = array_block.as_ptr() as *mut i32;
    println!(
      "[2] First three elements: {} {} {}",
      array_ptr.read(),
      array_ptr.add(1).read(),
      array_ptr.add(2).read(),
    );

    for i in 0..6 {
      array_ptr.add(i).write(i as i32 + 1);
    }
    println!("[2] Wrote 1..=6 into the array");

    // --------------------------------------------------------------------
    // 3) Resize the array to 12 elements, realloc style.
    //    The first 6 values must survive the move to the bigger block.
    // --------------------------------------------------------------------
    let resized_block = heap
      .resize(array_block.as_ptr(), 12 * mem::size_of::<i32>())
      .unwrap();
    println!("\n[3] Resize array to [i32; 12] -> {:?}", resized_block);
    println!(
      "[3] Moved? {}",
      if resized_block == array_block {
        "No, the block already had room"
      } else {
        "Yes, copied to a new block"
      }
    );

    let resized_ptr = resized_block.as_ptr() as *mut i32;
    println!(
      "[3] Values after the move: {} {} ... {}",
      resized_ptr.read(),
      resized_ptr.add(1).read(),
      resized_ptr.add(5).read(),
    );

    for i in 6..12 {
      resized_ptr.add(i).write(i as i32 + 1);
    }
    println!("[3] Wrote 7..=12 into the tail");
    println!("[3] Heap state: {:?}", heap);

    // --------------------------------------------------------------------
    // 4) Release the first block and allocate something small.
    //    First fit should hand the freed block straight back.
    // --------------------------------------------------------------------
    heap.release(first_block.as_ptr());
    println!("\n[4] Released first_block at {:?}", first_block);

    let small_block = heap.allocate(2).unwrap();
    println!(
      "[4] Allocate 2 bytes -> {:?} ({})",
      small_block,
      if small_block == first_block {
        "reused the freed block"
      } else {
        "allocated somewhere else"
      }
    );

    // --------------------------------------------------------------------
    // 5) Release the block at the end of the heap.
    //    This is the only case where memory goes back to the OS, so the
    //    program break recedes.
    // --------------------------------------------------------------------
    print_program_break("before end release");
    heap.release(resized_block.as_ptr());
    print_program_break("after end release");
    println!("[5] Heap state: {:?}", heap);

    // --------------------------------------------------------------------
    // 6) End of demo.
    //
    //    The remaining blocks stay on the free list and their bytes stay
    //    in the heap. The OS reclaims everything when the process exits.
    // --------------------------------------------------------------------
    heap.release(small_block.as_ptr());
    println!("\n[6] Released the rest. Final heap state: {:?}", heap);
    print_program_break("end");
  }
}
