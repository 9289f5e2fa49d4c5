//! Sticky fallback scenarios over emulated tiers.

use std::{
  fmt,
  sync::{Arc, Barrier},
  thread,
};

use parking_lot::Mutex;
use tieralloc::{
  AllocError, AllocatorConfig, AllocatorContext, DeviceTag, HeapBackend, Reporter, TieredAllocator,
};

/// Keeps every line so assertions can inspect them.
#[derive(Default)]
struct RecordingReporter {
  warnings: Mutex<Vec<String>>,
  messages: Mutex<Vec<String>>,
}

impl Reporter for RecordingReporter {
  fn warn(&self, args: fmt::Arguments<'_>) {
    self.warnings.lock().push(args.to_string());
  }

  fn message(&self, args: fmt::Arguments<'_>) {
    self.messages.lock().push(args.to_string());
  }

  fn fatal(&self, args: fmt::Arguments<'_>) -> ! {
    panic!("fatal: {args}")
  }
}

fn tiered(devices: &[(DeviceTag, usize)], reporter: Arc<RecordingReporter>) -> TieredAllocator<HeapBackend> {
  let backend = HeapBackend::with_devices(devices.iter().copied());
  TieredAllocator::new(backend, &[DeviceTag::HighBandwidth, DeviceTag::Dram], reporter).unwrap()
}

#[test]
fn failed_device_is_never_probed_again() {
  let reporter = Arc::new(RecordingReporter::default());
  let alloc = tiered(
    &[
      (DeviceTag::HighBandwidth, 0),
      (DeviceTag::Dram, usize::MAX),
      (DeviceTag::Dram, usize::MAX),
    ],
    reporter.clone(),
  );

  let a = alloc.allocate(64).unwrap();
  assert_eq!(alloc.current_device().unwrap().id, 1);

  let hbm = alloc.backend().device_stats(0).unwrap();
  let dram = alloc.backend().device_stats(1).unwrap();

  let b = alloc.allocate(64).unwrap();
  let hbm_after = alloc.backend().device_stats(0).unwrap();
  assert_eq!(hbm_after.arenas_created, hbm.arenas_created);
  assert_eq!(hbm_after.alloc_attempts, hbm.alloc_attempts);
  assert_eq!(alloc.backend().device_stats(1).unwrap().alloc_attempts, dram.alloc_attempts + 1);
  assert_eq!(alloc.backend().device_stats(2).unwrap().arenas_created, 0);

  let stats = alloc.stats();
  assert_eq!(stats.fallbacks, 1);
  assert_eq!(stats.current_index, 1);

  unsafe {
    alloc.free(a);
    alloc.free(b);
  }
}

#[test]
fn warning_names_failed_device() {
  let reporter = Arc::new(RecordingReporter::default());
  let alloc = tiered(&[(DeviceTag::HighBandwidth, 512), (DeviceTag::Dram, usize::MAX)], reporter.clone());

  let a = alloc.allocate(400).unwrap();
  assert!(reporter.warnings.lock().is_empty());

  let b = alloc.allocate(400).unwrap();
  let warnings = reporter.warnings.lock().clone();
  assert_eq!(warnings.len(), 1);
  assert!(warnings[0].contains("400 bytes"));
  assert!(warnings[0].contains("device index 0 (hbm)"));

  let messages = reporter.messages.lock().clone();
  assert_eq!(messages.len(), 1);
  assert!(messages[0].contains("device index 1"));
  assert!(messages[0].contains("dram"));

  unsafe {
    alloc.free(a);
    alloc.free(b);
  }
}

#[test]
fn exhaustion_stops_probing() {
  let reporter = Arc::new(RecordingReporter::default());
  let alloc = tiered(&[(DeviceTag::HighBandwidth, 256), (DeviceTag::Dram, 256)], reporter.clone());

  assert_eq!(alloc.allocate(1024), Err(AllocError::Exhausted { size: 1024 }));
  assert!(alloc.is_exhausted());
  assert!(reporter.warnings.lock().last().unwrap().contains("all 2 devices exhausted"));

  let creations = alloc.stats().arena_creations;
  let attempts: Vec<_> = (0..2)
    .map(|id| alloc.backend().device_stats(id).unwrap().alloc_attempts)
    .collect();

  // Even a request that would fit now fails without touching a device.
  assert_eq!(alloc.allocate(8), Err(AllocError::Exhausted { size: 8 }));
  assert_eq!(alloc.stats().arena_creations, creations);
  for (id, before) in attempts.into_iter().enumerate() {
    assert_eq!(alloc.backend().device_stats(id).unwrap().alloc_attempts, before);
  }
  assert_eq!(reporter.warnings.lock().len(), 2);
}

#[test]
fn oversized_request_moves_selection_forward() {
  let alloc = tiered(&[(DeviceTag::HighBandwidth, 1024), (DeviceTag::Dram, usize::MAX)], Arc::default());

  // The fast tier is retried with a fresh arena, then abandoned.
  let big = alloc.allocate(2048).unwrap();
  assert_eq!(alloc.current_device().unwrap().tag, DeviceTag::Dram);
  assert_eq!(alloc.backend().device_stats(0).unwrap().arenas_created, 2);

  // Small requests stay on dram even though the fast tier has room again.
  let small = alloc.allocate(16).unwrap();
  assert_eq!(alloc.backend().device_stats(0).unwrap().bytes_in_use, 0);
  assert_eq!(alloc.backend().device_stats(1).unwrap().bytes_in_use, 2048 + 16 + 16 + 16);

  unsafe {
    alloc.free(big);
    alloc.free(small);
  }
}

#[test]
fn concurrent_allocation_across_fallback() {
  const THREADS: usize = 8;
  const PER_THREAD: usize = 200;
  const SIZE: usize = 256;
  // Heap blocks carry a 16-byte header; an exact multiple keeps the fast tier
  // from ever accepting a fresh arena once it is full.
  const HBM_BLOCKS: usize = 64;
  const HBM_CAPACITY: usize = HBM_BLOCKS * (SIZE + 16);

  let reporter = Arc::new(RecordingReporter::default());
  let alloc = Arc::new(tiered(
    &[(DeviceTag::HighBandwidth, HBM_CAPACITY), (DeviceTag::Dram, usize::MAX)],
    reporter.clone(),
  ));
  let barrier = Arc::new(Barrier::new(THREADS));

  let handles: Vec<_> = (0..THREADS)
    .map(|t| {
      let alloc = Arc::clone(&alloc);
      let barrier = Arc::clone(&barrier);
      thread::spawn(move || {
        barrier.wait();
        (0..PER_THREAD)
          .map(|i| {
            let ptr = alloc.allocate(SIZE).unwrap();
            unsafe { ptr.as_ptr().write_bytes((t * 31 + i) as u8, SIZE) };
            ptr.as_ptr() as usize
          })
          .collect::<Vec<_>>()
      })
    })
    .collect();

  let mut blocks: Vec<(usize, u8)> = Vec::new();
  for (t, handle) in handles.into_iter().enumerate() {
    for (i, addr) in handle.join().unwrap().into_iter().enumerate() {
      blocks.push((addr, (t * 31 + i) as u8));
    }
  }

  // Live blocks never overlap and keep their contents.
  blocks.sort_unstable();
  for pair in blocks.windows(2) {
    assert!(pair[0].0 + SIZE <= pair[1].0);
  }
  for &(addr, fill) in &blocks {
    let bytes = unsafe { std::slice::from_raw_parts(addr as *const u8, SIZE) };
    assert!(bytes.iter().all(|&b| b == fill));
  }

  let stats = alloc.stats();
  assert_eq!(stats.allocations, (THREADS * PER_THREAD) as u64);
  assert_eq!(stats.fallbacks, 1);
  assert_eq!(stats.current_index, 1);
  assert!(!stats.exhausted);
  assert_eq!(alloc.backend().device_stats(0).unwrap().bytes_in_use, HBM_CAPACITY);
  assert_eq!(reporter.messages.lock().len(), 1);

  for (addr, _) in blocks {
    unsafe { alloc.free(std::ptr::NonNull::new(addr as *mut u8).unwrap()) };
  }
  assert_eq!(alloc.backend().device_stats(0).unwrap().bytes_in_use, 0);
  assert_eq!(alloc.backend().device_stats(1).unwrap().bytes_in_use, 0);
}

#[test]
fn context_keeps_plain_and_aligned_apart() {
  let backend = HeapBackend::with_devices([(DeviceTag::HighBandwidth, 2048), (DeviceTag::Dram, usize::MAX)]);
  let ctx = AllocatorContext::with_backend(backend, &AllocatorConfig::default(), Arc::new(RecordingReporter::default()))
    .unwrap();

  let plain = ctx.allocate(1000).unwrap().unwrap();
  let aligned = ctx.allocate_aligned(1000, 512).unwrap().unwrap();
  assert_eq!(aligned.as_ptr() as usize % 512, 0);

  // The fast tier could not fit both; the aligned block went to dram.
  assert_eq!(ctx.current_device().unwrap().tag, DeviceTag::Dram);

  unsafe {
    ctx.free_aligned(aligned);
    ctx.free(plain);
  }
  assert_eq!(ctx.backend().device_stats(0).unwrap().bytes_in_use, 0);
  assert_eq!(ctx.backend().device_stats(1).unwrap().bytes_in_use, 0);

  let stats = ctx.shutdown();
  assert_eq!(stats.allocations, 2);
  assert_eq!(stats.fallbacks, 1);
}
