//! Heap backend: emulated tiers with byte budgets over `libc::malloc`.
//!
//! Used where no NUMA topology is available, and to reproduce tier
//! exhaustion deterministically.

use core::{
  mem::size_of,
  ptr::NonNull,
  sync::atomic::{AtomicU64, AtomicUsize, Ordering},
};

use super::TierBackend;
use crate::device::{Device, DeviceTag};

/// Prefix of every heap block, so `free` needs no size.
#[repr(C, align(16))]
#[derive(Clone, Copy)]
struct BlockHeader {
  device: usize,
  /// Bytes charged against the device budget, header included.
  charged: usize,
}

const BLOCK_HEADER_SIZE: usize = size_of::<BlockHeader>();

const _: () = assert!(BLOCK_HEADER_SIZE == 16);

struct HeapDevice {
  tag: DeviceTag,
  capacity: usize,
  in_use: AtomicUsize,
  arenas_created: AtomicU64,
  alloc_attempts: AtomicU64,
}

/// Snapshot of one emulated device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeapDeviceStats {
  pub tag: DeviceTag,
  /// `None` = unbounded.
  pub capacity: Option<usize>,
  /// Calls to `create_arena` on this device, successful or not.
  pub arenas_created: u64,
  /// Calls to `arena_alloc` on this device, successful or not.
  pub alloc_attempts: u64,
  pub bytes_in_use: usize,
}

/// Arena on an emulated device. Holds no memory of its own.
#[derive(Debug)]
pub struct HeapArena {
  device: usize,
}

/// Emulated tiers over the process heap.
pub struct HeapBackend {
  devices: Vec<HeapDevice>,
}

impl Default for HeapBackend {
  fn default() -> Self {
    Self::new()
  }
}

impl HeapBackend {
  /// A single unbounded DRAM device.
  #[must_use]
  pub fn new() -> Self {
    Self::with_devices([(DeviceTag::Dram, usize::MAX)])
  }

  /// One device per `(tag, capacity)`, in discovery order.
  /// `usize::MAX` means unbounded.
  #[must_use]
  pub fn with_devices<I>(devices: I) -> Self
  where
    I: IntoIterator<Item = (DeviceTag, usize)>,
  {
    Self {
      devices: devices
        .into_iter()
        .map(|(tag, capacity)| HeapDevice {
          tag,
          capacity,
          in_use: AtomicUsize::new(0),
          arenas_created: AtomicU64::new(0),
          alloc_attempts: AtomicU64::new(0),
        })
        .collect(),
    }
  }

  #[must_use]
  pub fn device_stats(&self, id: usize) -> Option<HeapDeviceStats> {
    self.devices.get(id).map(|d| HeapDeviceStats {
      tag: d.tag,
      capacity: (d.capacity != usize::MAX).then_some(d.capacity),
      arenas_created: d.arenas_created.load(Ordering::Relaxed),
      alloc_attempts: d.alloc_attempts.load(Ordering::Relaxed),
      bytes_in_use: d.in_use.load(Ordering::Relaxed),
    })
  }

  fn reserve(device: &HeapDevice, bytes: usize) -> bool {
    device
      .in_use
      .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |used| {
        used.checked_add(bytes).filter(|&total| total <= device.capacity)
      })
      .is_ok()
  }
}

impl TierBackend for HeapBackend {
  type Arena = HeapArena;

  fn name(&self) -> &'static str {
    "heap"
  }

  fn devices(&self) -> Vec<Device> {
    self
      .devices
      .iter()
      .enumerate()
      .map(|(id, d)| Device {
        id,
        tag: d.tag,
        node: None,
        capacity: (d.capacity != usize::MAX).then_some(d.capacity as u64),
      })
      .collect()
  }

  fn create_arena(&self, device: &Device) -> Option<HeapArena> {
    let dev = self.devices.get(device.id)?;
    dev.arenas_created.fetch_add(1, Ordering::Relaxed);

    // Nothing could ever be carved from a full device.
    if dev.in_use.load(Ordering::Relaxed) >= dev.capacity {
      return None;
    }
    Some(HeapArena { device: device.id })
  }

  fn arena_alloc(&self, arena: &HeapArena, size: usize) -> Option<NonNull<u8>> {
    let dev = self.devices.get(arena.device)?;
    dev.alloc_attempts.fetch_add(1, Ordering::Relaxed);

    let charged = size.checked_add(BLOCK_HEADER_SIZE)?;
    if !Self::reserve(dev, charged) {
      return None;
    }

    let raw = unsafe { libc::malloc(charged) } as *mut BlockHeader;
    if raw.is_null() {
      dev.in_use.fetch_sub(charged, Ordering::AcqRel);
      return None;
    }

    unsafe {
      raw.write_unaligned(BlockHeader {
        device: arena.device,
        charged,
      });
      NonNull::new(raw.add(1).cast::<u8>())
    }
  }

  unsafe fn free(&self, ptr: NonNull<u8>) {
    let header = unsafe { ptr.as_ptr().cast::<BlockHeader>().sub(1) };
    let BlockHeader { device, charged } = unsafe { header.read_unaligned() };

    if let Some(dev) = self.devices.get(device) {
      dev.in_use.fetch_sub(charged, Ordering::AcqRel);
    }
    unsafe { libc::free(header.cast()) };
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_budget_is_charged_and_released() {
    let backend = HeapBackend::with_devices([(DeviceTag::Dram, 1024)]);
    let device = &backend.devices()[0];
    let arena = backend.create_arena(device).unwrap();

    let ptr = backend.arena_alloc(&arena, 100).unwrap();
    unsafe { ptr.as_ptr().write_bytes(0xAB, 100) };
    assert_eq!(backend.device_stats(0).unwrap().bytes_in_use, 100 + BLOCK_HEADER_SIZE);

    unsafe { backend.free(ptr) };
    assert_eq!(backend.device_stats(0).unwrap().bytes_in_use, 0);
  }

  #[test]
  fn test_over_budget_fails() {
    let backend = HeapBackend::with_devices([(DeviceTag::HighBandwidth, 64)]);
    let device = &backend.devices()[0];
    let arena = backend.create_arena(device).unwrap();

    assert!(backend.arena_alloc(&arena, 64).is_none());
    let ptr = backend.arena_alloc(&arena, 48).unwrap();
    assert!(backend.arena_alloc(&arena, 1).is_none());

    let stats = backend.device_stats(0).unwrap();
    assert_eq!(stats.alloc_attempts, 3);
    assert_eq!(stats.capacity, Some(64));
    unsafe { backend.free(ptr) };
  }

  #[test]
  fn test_full_device_refuses_arena() {
    let backend = HeapBackend::with_devices([(DeviceTag::HighBandwidth, 0), (DeviceTag::Dram, usize::MAX)]);
    let devices = backend.devices();
    assert!(backend.create_arena(&devices[0]).is_none());
    assert!(backend.create_arena(&devices[1]).is_some());
    assert_eq!(backend.device_stats(0).unwrap().arenas_created, 1);
    assert_eq!(devices[1].capacity, None);
  }

  #[test]
  fn test_blocks_are_distinct() {
    let backend = HeapBackend::new();
    let arena = backend.create_arena(&backend.devices()[0]).unwrap();
    let a = backend.arena_alloc(&arena, 32).unwrap();
    let b = backend.arena_alloc(&arena, 32).unwrap();
    assert_ne!(a, b);
    unsafe {
      backend.free(a);
      backend.free(b);
    }
  }
}
