//! Ownership wrapper binding one backend arena to one catalog device.

use core::{fmt, ptr::NonNull};

use crate::{
  backend::TierBackend,
  device::{Device, DeviceTag},
};

/// An arena bound to the device at `index` in the catalog.
///
/// Dropping it hands the arena back to the backend; blocks it produced stay
/// valid.
pub struct ArenaAllocator<A> {
  arena: A,
  device: Device,
  index: usize,
}

impl<A> ArenaAllocator<A> {
  #[inline]
  #[must_use]
  pub fn device(&self) -> &Device {
    &self.device
  }

  /// Catalog index of the device.
  #[inline]
  #[must_use]
  pub fn index(&self) -> usize {
    self.index
  }

  #[inline]
  #[must_use]
  pub fn tag(&self) -> DeviceTag {
    self.device.tag
  }
}

impl<A> fmt::Debug for ArenaAllocator<A> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ArenaAllocator")
      .field("device", &self.device)
      .field("index", &self.index)
      .finish_non_exhaustive()
  }
}

impl<A: Send + Sync> ArenaAllocator<A> {
  /// Creates an arena on `device`. `None` if the backend refuses.
  pub fn create<B>(backend: &B, device: &Device, index: usize) -> Option<Self>
  where
    B: TierBackend<Arena = A>,
  {
    let arena = backend.create_arena(device)?;
    tracing::debug!(target: "tieralloc", "created {} arena on device index {index} ({device})", backend.name());
    Some(Self {
      arena,
      device: device.clone(),
      index,
    })
  }

  /// Allocates `size` raw bytes. `None` if the arena cannot satisfy it.
  #[inline]
  pub fn allocate<B>(&self, backend: &B, size: usize) -> Option<NonNull<u8>>
  where
    B: TierBackend<Arena = A>,
  {
    let ptr = backend.arena_alloc(&self.arena, size)?;
    if tracing::enabled!(target: "tieralloc", tracing::Level::TRACE) {
      self.trace_placement(backend, ptr, size);
    }
    Some(ptr)
  }

  /// Logs which NUMA node `ptr` landed on. Diagnostics only.
  #[cold]
  fn trace_placement<B>(&self, backend: &B, ptr: NonNull<u8>, size: usize)
  where
    B: TierBackend<Arena = A>,
  {
    match backend.node_of(ptr) {
      Some(node) => tracing::trace!(
        target: "tieralloc",
        "allocated {size} bytes on numa node {node} ({})",
        self.device.tag
      ),
      None => tracing::trace!(
        target: "tieralloc",
        "allocated {size} bytes on {} (node unknown)",
        self.device
      ),
    }
  }
}
