//! Sticky device selection with forward fallback.
//!
//! The allocator remembers the device that last satisfied a request and
//! goes to it first. When that device fails, it scans forward through the
//! catalog (starting with a fresh arena on the same device) and commits the
//! first device that succeeds. Earlier devices are never probed again: once
//! a tier is exhausted it is assumed to stay exhausted, so the total cost of
//! fallback over the process lifetime is bounded by the catalog length.

use core::{
  fmt,
  ptr::NonNull,
  sync::atomic::{AtomicU64, Ordering},
};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::{
  arena::ArenaAllocator,
  backend::TierBackend,
  device::{Device, DeviceCatalog, DeviceTag},
  error::AllocError,
  report::Reporter,
};

/// Sticky selection. `index == catalog.len()` is the exhaustion sentinel,
/// in which case `arena` is `None`.
struct Sticky<A> {
  index: usize,
  arena: Option<ArenaAllocator<A>>,
  /// Bumped on every commit so a worker that lost the race to the write
  /// lock can tell the selection moved.
  generation: u64,
}

#[derive(Default)]
struct Counters {
  allocations: AtomicU64,
  misses: AtomicU64,
  fallbacks: AtomicU64,
  arena_creations: AtomicU64,
}

/// Point-in-time allocator statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TierStats {
  /// Successful raw allocations.
  pub allocations: u64,
  /// Requests the sticky arena could not satisfy.
  pub fast_path_misses: u64,
  /// Committed moves to a new arena.
  pub fallbacks: u64,
  /// Calls to the backend's arena creation primitive.
  pub arena_creations: u64,
  /// Sticky catalog index (equals the catalog length once exhausted).
  pub current_index: usize,
  pub exhausted: bool,
}

impl fmt::Display for TierStats {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{} allocations, {} misses, {} fallbacks, {} arenas created, device index {}{}",
      self.allocations,
      self.fast_path_misses,
      self.fallbacks,
      self.arena_creations,
      self.current_index,
      if self.exhausted { " (exhausted)" } else { "" }
    )
  }
}

/// Allocator over a ranked device catalog.
pub struct TieredAllocator<B: TierBackend> {
  backend: B,
  catalog: DeviceCatalog,
  sticky: RwLock<Sticky<B::Arena>>,
  reporter: Arc<dyn Reporter>,
  counters: Counters,
}

impl<B: TierBackend> TieredAllocator<B> {
  /// Builds the catalog and creates the initial arena on `catalog[0]`.
  ///
  /// Failure to create that first arena is ignored; the first allocation
  /// retries it.
  ///
  /// # Errors
  ///
  /// Propagates catalog construction errors (`NoUsableDevice`,
  /// `CatalogAllocation`).
  pub fn new(backend: B, preferences: &[DeviceTag], reporter: Arc<dyn Reporter>) -> Result<Self, AllocError> {
    let catalog = DeviceCatalog::discover(&backend, preferences)?;
    let counters = Counters::default();

    let arena = catalog.get(0).and_then(|device| {
      counters.arena_creations.fetch_add(1, Ordering::Relaxed);
      ArenaAllocator::create(&backend, device, 0)
    });
    if arena.is_none() {
      tracing::debug!(target: "tieralloc", "initial arena creation failed, deferring to first allocation");
    }

    tracing::debug!(
      target: "tieralloc",
      "{} backend: {} usable devices [{}]",
      backend.name(),
      catalog.len(),
      catalog.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
    );

    Ok(Self {
      backend,
      catalog,
      sticky: RwLock::new(Sticky {
        index: 0,
        arena,
        generation: 0,
      }),
      reporter,
      counters,
    })
  }

  /// Allocates `size` raw bytes from the sticky device, falling back to later
  /// devices when it fails.
  ///
  /// # Errors
  ///
  /// `Exhausted` once every device from the sticky index forward has failed.
  /// From then on every call fails without probing any device.
  pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
    let observed = {
      let sticky = self.sticky.read();
      match &sticky.arena {
        Some(arena) => {
          if let Some(ptr) = arena.allocate(&self.backend, size) {
            self.counters.allocations.fetch_add(1, Ordering::Relaxed);
            return Ok(ptr);
          }
        }
        None if sticky.index == self.catalog.len() => {
          return Err(AllocError::Exhausted { size });
        }
        None => {}
      }
      sticky.generation
    };

    self.counters.misses.fetch_add(1, Ordering::Relaxed);
    self.fallback(size, observed)
  }

  /// Scan-create-retry-commit. Runs entirely under the write lock.
  #[cold]
  #[inline(never)]
  fn fallback(&self, size: usize, observed: u64) -> Result<NonNull<u8>, AllocError> {
    let mut sticky = self.sticky.write();

    // Another worker already committed a new selection: try it first.
    if sticky.generation != observed
      && let Some(ptr) = sticky
        .arena
        .as_ref()
        .and_then(|arena| arena.allocate(&self.backend, size))
    {
      self.counters.allocations.fetch_add(1, Ordering::Relaxed);
      return Ok(ptr);
    }

    let count = self.catalog.len();
    if sticky.index == count {
      return Err(AllocError::Exhausted { size });
    }

    if let Some(device) = self.catalog.get(sticky.index) {
      self.reporter.warn(format_args!(
        "failed to allocate {size} bytes using old arena in device index {} ({})",
        sticky.index, device.tag
      ));
    }

    // The current device is retried with a fresh arena before moving on.
    for index in sticky.index..count {
      let Some(device) = self.catalog.get(index) else {
        break;
      };

      self.counters.arena_creations.fetch_add(1, Ordering::Relaxed);
      let Some(arena) = ArenaAllocator::create(&self.backend, device, index) else {
        continue;
      };

      if let Some(ptr) = arena.allocate(&self.backend, size) {
        sticky.index = index;
        sticky.arena = Some(arena);
        sticky.generation += 1;
        self.counters.allocations.fetch_add(1, Ordering::Relaxed);
        self.counters.fallbacks.fetch_add(1, Ordering::Relaxed);
        self.reporter.message(format_args!(
          "allocated {size} bytes in new arena on device index {index} ({device})"
        ));
        return Ok(ptr);
      }
    }

    sticky.index = count;
    sticky.arena = None;
    sticky.generation += 1;
    self.reporter.warn(format_args!(
      "failed to allocate {size} bytes: all {count} devices exhausted"
    ));
    Err(AllocError::Exhausted { size })
  }

  /// Releases a raw block.
  ///
  /// # Safety
  ///
  /// `ptr` must come from [`TieredAllocator::allocate`] on this allocator and
  /// must not have been freed already.
  #[inline]
  pub unsafe fn free(&self, ptr: NonNull<u8>) {
    unsafe { self.backend.free(ptr) };
  }

  #[must_use]
  pub fn catalog(&self) -> &DeviceCatalog {
    &self.catalog
  }

  #[must_use]
  pub fn backend(&self) -> &B {
    &self.backend
  }

  /// Device currently holding the sticky selection. `None` once exhausted.
  #[must_use]
  pub fn current_device(&self) -> Option<Device> {
    let index = self.sticky.read().index;
    self.catalog.get(index).cloned()
  }

  #[must_use]
  pub fn is_exhausted(&self) -> bool {
    self.sticky.read().index == self.catalog.len()
  }

  #[must_use]
  pub fn stats(&self) -> TierStats {
    let current_index = self.sticky.read().index;
    TierStats {
      allocations: self.counters.allocations.load(Ordering::Relaxed),
      fast_path_misses: self.counters.misses.load(Ordering::Relaxed),
      fallbacks: self.counters.fallbacks.load(Ordering::Relaxed),
      arena_creations: self.counters.arena_creations.load(Ordering::Relaxed),
      current_index,
      exhausted: current_index == self.catalog.len(),
    }
  }

  /// Hands the current arena back to the backend and returns the final
  /// statistics. Outstanding blocks stay valid.
  pub fn shutdown(self) -> TierStats {
    let stats = self.stats();
    drop(self.sticky.write().arena.take());
    tracing::debug!(target: "tieralloc", "shutdown: {stats}");
    stats
  }
}
