//! Property-based tests for aligned and plain allocation.

use std::sync::Arc;

use proptest::prelude::*;
use tieralloc::{AllocError, AllocatorConfig, AllocatorContext, DeviceTag, HeapBackend, MIN_ALIGNMENT, TracingReporter};

fn context(fast_capacity: usize) -> AllocatorContext<HeapBackend> {
  let backend = HeapBackend::with_devices([(DeviceTag::HighBandwidth, fast_capacity), (DeviceTag::Dram, usize::MAX)]);
  AllocatorContext::with_backend(backend, &AllocatorConfig::default(), Arc::new(TracingReporter)).unwrap()
}

/// Powers of two from 1 to 64KB.
fn alignment() -> impl Strategy<Value = usize> {
  (0u32..=16).prop_map(|shift| 1usize << shift)
}

/// Anything that is not a power of two.
fn bad_alignment() -> impl Strategy<Value = usize> {
  prop_oneof![Just(0usize), (2usize..1 << 20).prop_filter("not a power of two", |a| !a.is_power_of_two())]
}

proptest! {
  /// Every aligned block honours the effective alignment and is writable end to end
  #[test]
  fn aligned_blocks_are_aligned(size in 1usize..16 << 10, align in alignment()) {
    let ctx = context(64 << 10);
    let block = ctx.allocate_aligned(size, align).unwrap().unwrap();
    let effective = align.max(MIN_ALIGNMENT);
    prop_assert_eq!(block.as_ptr() as usize % effective, 0);

    unsafe {
      block.as_ptr().write_bytes(0xC3, size);
      prop_assert_eq!(block.as_ptr().add(size - 1).read(), 0xC3);
      ctx.free_aligned(block);
    }

    // The raw block went back exactly once.
    prop_assert_eq!(ctx.backend().device_stats(0).unwrap().bytes_in_use, 0);
    prop_assert_eq!(ctx.backend().device_stats(1).unwrap().bytes_in_use, 0);
  }

  /// Invalid alignments are rejected before the zero-size shortcut
  #[test]
  fn bad_alignment_rejected(size in 0usize..4096, align in bad_alignment()) {
    let ctx = context(64 << 10);
    prop_assert_eq!(ctx.allocate_aligned(size, align), Err(AllocError::InvalidAlignment { align }));
    prop_assert_eq!(ctx.stats().allocations, 0);
  }

  /// Zero-byte requests never reach the backend
  #[test]
  fn zero_size_is_free(align in alignment()) {
    let ctx = context(64 << 10);
    prop_assert_eq!(ctx.allocate(0), Ok(None));
    prop_assert_eq!(ctx.allocate_aligned(0, align), Ok(None));
    prop_assert_eq!(ctx.backend().device_stats(0).unwrap().alloc_attempts, 0);
    prop_assert_eq!(ctx.backend().device_stats(1).unwrap().alloc_attempts, 0);
  }

  /// Mixed plain and aligned blocks stay disjoint across a tier switch
  #[test]
  fn mixed_blocks_are_disjoint(requests in prop::collection::vec((1usize..2048, alignment(), any::<bool>()), 1..64)) {
    let ctx = context(8 << 10);
    let mut plain = Vec::new();
    let mut aligned = Vec::new();
    let mut ranges = Vec::new();

    for (size, align, is_aligned) in requests {
      if is_aligned {
        let block = ctx.allocate_aligned(size, align).unwrap().unwrap();
        ranges.push((block.as_ptr() as usize, size));
        aligned.push(block);
      } else {
        let block = ctx.allocate(size).unwrap().unwrap();
        ranges.push((block.as_ptr() as usize, size));
        plain.push(block);
      }
    }

    ranges.sort_unstable();
    for pair in ranges.windows(2) {
      prop_assert!(pair[0].0 + pair[0].1 <= pair[1].0);
    }

    unsafe {
      for block in plain {
        ctx.free(block);
      }
      for block in aligned {
        ctx.free_aligned(block);
      }
    }
    prop_assert!(ctx.stats().fallbacks <= 1);
  }
}

#[test]
fn odd_alignment_is_invalid() {
  let ctx = context(64 << 10);
  assert_eq!(ctx.allocate_aligned(100, 7), Err(AllocError::InvalidAlignment { align: 7 }));
  assert!(AllocError::InvalidAlignment { align: 7 }.is_misuse());
}
