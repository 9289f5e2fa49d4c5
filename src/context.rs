//! Explicit allocator lifecycle.
//!
//! [`AllocatorContext`] owns one [`TieredAllocator`] and is passed by
//! reference to every call. Errors are returned; deciding whether they are
//! fatal is left to the caller.

use core::ptr::NonNull;
use std::sync::Arc;

use crate::{
  aligned::{AlignedAllocator, AlignedBlock},
  backend::{DefaultBackend, TierBackend},
  config::AllocatorConfig,
  device::{Device, DeviceCatalog},
  error::AllocError,
  report::{Reporter, TracingReporter},
  tiered::{TierStats, TieredAllocator},
};

/// An owned plain allocation. Release it with [`AllocatorContext::free`].
#[derive(Debug, PartialEq, Eq)]
pub struct Block {
  ptr: NonNull<u8>,
}

// The block is uniquely owned memory.
unsafe impl Send for Block {}

impl Block {
  #[inline]
  #[must_use]
  pub fn as_ptr(&self) -> *mut u8 {
    self.ptr.as_ptr()
  }

  #[inline]
  #[must_use]
  pub fn cast<T>(&self) -> NonNull<T> {
    self.ptr.cast()
  }

  /// Gives up ownership without freeing.
  #[inline]
  #[must_use]
  pub fn into_raw(self) -> NonNull<u8> {
    self.ptr
  }

  /// # Safety
  ///
  /// `ptr` must come from [`Block::into_raw`] and not have been freed.
  #[inline]
  #[must_use]
  pub unsafe fn from_raw(ptr: NonNull<u8>) -> Self {
    Self { ptr }
  }
}

/// Allocator instance with an explicit `init` / `shutdown` lifecycle.
pub struct AllocatorContext<B: TierBackend = DefaultBackend> {
  tiered: TieredAllocator<B>,
}

impl AllocatorContext<DefaultBackend> {
  /// Discovers devices with the platform backend and logs through
  /// [`TracingReporter`].
  ///
  /// # Errors
  ///
  /// `NoUsableDevice` when nothing matches `config.preferences`.
  pub fn init(config: AllocatorConfig) -> Result<Self, AllocError> {
    #[cfg(target_os = "linux")]
    let backend = crate::backend::NumaBackend::new(&config);
    #[cfg(not(target_os = "linux"))]
    let backend = crate::backend::HeapBackend::new();

    Self::with_backend(backend, &config, Arc::new(TracingReporter))
  }
}

impl<B: TierBackend> AllocatorContext<B> {
  /// Builds a context over an already constructed backend.
  ///
  /// # Errors
  ///
  /// As [`TieredAllocator::new`].
  pub fn with_backend(backend: B, config: &AllocatorConfig, reporter: Arc<dyn Reporter>) -> Result<Self, AllocError> {
    let tiered = TieredAllocator::new(backend, &config.preferences, reporter)?;
    tracing::info!(
      target: "tieralloc",
      "initialized {} context with {} devices",
      tiered.backend().name(),
      tiered.catalog().len()
    );
    Ok(Self { tiered })
  }

  /// Allocates `size` bytes. Zero bytes is `Ok(None)` and touches nothing.
  ///
  /// # Errors
  ///
  /// `Exhausted` once every preferred device has failed.
  #[inline]
  pub fn allocate(&self, size: usize) -> Result<Option<Block>, AllocError> {
    if size == 0 {
      return Ok(None);
    }
    self.tiered.allocate(size).map(|ptr| Some(Block { ptr }))
  }

  /// # Safety
  ///
  /// `block` must come from [`AllocatorContext::allocate`] on this context.
  #[inline]
  pub unsafe fn free(&self, block: Block) {
    unsafe { self.tiered.free(block.ptr) };
  }

  /// Allocates `size` bytes aligned to `max(align, 16)`.
  ///
  /// # Errors
  ///
  /// See [`AlignedAllocator::allocate`].
  #[inline]
  pub fn allocate_aligned(&self, size: usize, align: usize) -> Result<Option<AlignedBlock>, AllocError> {
    AlignedAllocator::new(&self.tiered).allocate(size, align)
  }

  /// # Safety
  ///
  /// `block` must come from [`AllocatorContext::allocate_aligned`] or
  /// [`AllocatorContext::allocate_array`] on this context.
  #[inline]
  pub unsafe fn free_aligned(&self, block: AlignedBlock) {
    unsafe { AlignedAllocator::new(&self.tiered).free(block) };
  }

  /// Aligned room for `count` values of `T`. Free with
  /// [`AllocatorContext::free_aligned`].
  ///
  /// # Errors
  ///
  /// See [`AlignedAllocator::allocate_array`].
  #[inline]
  pub fn allocate_array<T>(&self, count: usize, align: usize) -> Result<Option<AlignedBlock>, AllocError> {
    AlignedAllocator::new(&self.tiered).allocate_array::<T>(count, align)
  }

  #[must_use]
  pub fn stats(&self) -> TierStats {
    self.tiered.stats()
  }

  #[must_use]
  pub fn catalog(&self) -> &DeviceCatalog {
    self.tiered.catalog()
  }

  #[must_use]
  pub fn current_device(&self) -> Option<Device> {
    self.tiered.current_device()
  }

  #[must_use]
  pub fn tiered(&self) -> &TieredAllocator<B> {
    &self.tiered
  }

  #[must_use]
  pub fn backend(&self) -> &B {
    self.tiered.backend()
  }

  /// Releases the current arena and the catalog. Outstanding blocks stay
  /// valid but can no longer be freed through this context.
  pub fn shutdown(self) -> TierStats {
    let stats = self.tiered.shutdown();
    tracing::info!(target: "tieralloc", "context shut down: {stats}");
    stats
  }
}
