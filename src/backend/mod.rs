//! Memory-tiering backends.
//!
//! A backend enumerates devices, creates arenas bound to one device and
//! carves raw blocks from them. Deallocation is size-free: each backend keeps
//! enough per-block bookkeeping to release a block from its address alone.

use core::ptr::NonNull;

use crate::device::Device;

mod heap;
#[cfg(target_os = "linux")]
mod numa;

pub use heap::{HeapArena, HeapBackend, HeapDeviceStats};
#[cfg(target_os = "linux")]
pub use numa::{NumaArena, NumaBackend};

/// Backend used by the process-wide allocator.
#[cfg(target_os = "linux")]
pub type DefaultBackend = NumaBackend;
#[cfg(not(target_os = "linux"))]
pub type DefaultBackend = HeapBackend;

/// Primitives of an underlying memory-tiering library.
pub trait TierBackend: Send + Sync {
  /// Allocation context bound to one device.
  type Arena: Send + Sync;

  /// Short backend name for logs.
  fn name(&self) -> &'static str;

  /// All devices the platform exposes, in discovery order.
  fn devices(&self) -> Vec<Device>;

  /// Creates an arena on `device`. `None` is a non-fatal failure.
  fn create_arena(&self, device: &Device) -> Option<Self::Arena>;

  /// Allocates `size` bytes from `arena`. `None` when the arena or its device
  /// cannot satisfy the request.
  fn arena_alloc(&self, arena: &Self::Arena, size: usize) -> Option<NonNull<u8>>;

  /// Releases a block returned by [`TierBackend::arena_alloc`].
  ///
  /// # Safety
  ///
  /// `ptr` must come from `arena_alloc` on this backend and must not have
  /// been freed already.
  unsafe fn free(&self, ptr: NonNull<u8>);

  /// NUMA node the page holding `ptr` currently lives on. Diagnostics only.
  fn node_of(&self, _ptr: NonNull<u8>) -> Option<usize> {
    None
  }
}
