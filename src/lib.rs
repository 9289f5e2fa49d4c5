#![allow(clippy::missing_safety_doc)]
//! Tiered allocator for heterogeneous memory.
//!
//! Requests go to the highest ranked memory device (high-bandwidth first,
//! then DRAM by default). When a device runs out, the allocator falls back to
//! the next one and stays there. Aligned requests are served by
//! over-allocating and storing the raw pointer in front of the aligned block.
//!
//! Two surfaces are provided:
//!
//! - [`AllocatorContext`]: explicit lifecycle, `Result` returns.
//! - [`allocate`] / [`free`] / [`allocate_aligned`] / [`free_aligned`]: a
//!   lazily initialized process-wide context configured from `TIERALLOC_*`
//!   environment variables. Every error terminates the process through the
//!   reporter. With the `c_api` feature they are also exported as C symbols.

mod aligned;
mod arena;
pub mod backend;
mod config;
mod context;
mod device;
mod error;
mod report;
mod tiered;

use core::ptr::{NonNull, null_mut};
use std::sync::OnceLock;

pub use aligned::{AlignedAllocator, AlignedBlock, HEADER_SIZE, MIN_ALIGNMENT};
pub use arena::ArenaAllocator;
pub use backend::{DefaultBackend, HeapBackend, TierBackend};
pub use config::{AllocatorConfig, DEFAULT_CHUNK_SIZE, MIN_CHUNK_SIZE, parse_size};
pub use context::{AllocatorContext, Block};
pub use device::{DEFAULT_PREFERENCES, Device, DeviceCatalog, DeviceTag};
pub use error::AllocError;
pub use report::{Reporter, TracingReporter};
pub use tiered::{TierStats, TieredAllocator};

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(MIN_ALIGNMENT >= HEADER_SIZE);
const _: () = assert!(MIN_CHUNK_SIZE <= DEFAULT_CHUNK_SIZE);
const _: () = assert!(DEFAULT_CHUNK_SIZE.is_power_of_two());

// =============================================================================
// Process-wide context
// =============================================================================

static CONTEXT: OnceLock<AllocatorContext> = OnceLock::new();

#[cold]
#[inline(never)]
fn init_context() -> AllocatorContext {
  let config = AllocatorConfig::from_env()
    .unwrap_or_else(|err| TracingReporter.fatal(format_args!("cannot read allocator configuration: {err}")));
  AllocatorContext::init(config)
    .unwrap_or_else(|err| TracingReporter.fatal(format_args!("cannot initialize tiered allocator: {err}")))
}

#[inline]
fn context() -> &'static AllocatorContext {
  CONTEXT.get_or_init(init_context)
}

/// The process-wide context, if any allocation has created it yet.
#[must_use]
pub fn global_context() -> Option<&'static AllocatorContext> {
  CONTEXT.get()
}

#[cold]
fn fail_plain(size: usize, err: &AllocError) -> ! {
  TracingReporter.fatal(format_args!("malloc failed (n={size}): {err}"))
}

#[cold]
fn fail_aligned(size: usize, align: usize, err: &AllocError) -> ! {
  TracingReporter.fatal(format_args!("malloc aligned failed (n={size}, a={align}): {err}"))
}

/// Allocates `size` bytes from the process-wide context.
///
/// Zero bytes returns null without initializing anything. Any failure is
/// fatal.
#[must_use]
pub fn allocate(size: usize) -> *mut u8 {
  if size == 0 {
    return null_mut();
  }
  match context().allocate(size) {
    Ok(Some(block)) => block.into_raw().as_ptr(),
    Ok(None) => null_mut(),
    Err(err) => fail_plain(size, &err),
  }
}

/// Releases memory from [`allocate`]. Null is a no-op.
///
/// # Safety
///
/// `ptr` must be null or come from [`allocate`] and not have been freed.
pub unsafe fn free(ptr: *mut u8) {
  let Some(ptr) = NonNull::new(ptr) else {
    return;
  };
  if let Some(ctx) = CONTEXT.get() {
    unsafe { ctx.free(Block::from_raw(ptr)) };
  }
}

/// Allocates `size` bytes aligned to `max(align, 16)` from the process-wide
/// context.
///
/// An invalid `align` is fatal even when `size` is zero.
#[must_use]
pub fn allocate_aligned(size: usize, align: usize) -> *mut u8 {
  if size == 0 {
    if let Err(err) = aligned::alignment_mask(align) {
      fail_aligned(size, align, &err);
    }
    return null_mut();
  }
  match context().allocate_aligned(size, align) {
    Ok(Some(block)) => block.into_raw().as_ptr(),
    Ok(None) => null_mut(),
    Err(err) => fail_aligned(size, align, &err),
  }
}

/// Releases memory from [`allocate_aligned`]. Null is a no-op.
///
/// # Safety
///
/// `ptr` must be null or come from [`allocate_aligned`] and not have been
/// freed. Pointers from [`allocate`] are not accepted.
pub unsafe fn free_aligned(ptr: *mut u8) {
  let Some(ptr) = NonNull::new(ptr) else {
    return;
  };
  if let Some(ctx) = CONTEXT.get() {
    unsafe { ctx.free_aligned(AlignedBlock::from_raw(ptr)) };
  }
}

// =============================================================================
// C API (enabled with --features c_api)
// =============================================================================

/// Stores an allocation of `n` bytes in `*mem_ref`; null for `n == 0`.
#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tieralloc_malloc(mem_ref: *mut *mut u8, n: usize) {
  if mem_ref.is_null() {
    fail_plain(n, &AllocError::NullOutput);
  }
  let mem = allocate(n);
  unsafe { mem_ref.write(mem) };
}

/// Frees `*mem_ref` and nulls it. Null `mem_ref` or `*mem_ref` is a no-op.
#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tieralloc_free(mem_ref: *mut *mut u8) {
  if mem_ref.is_null() {
    return;
  }
  unsafe {
    free(mem_ref.read());
    mem_ref.write(null_mut());
  }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tieralloc_malloc_aligned(mem_ref: *mut *mut u8, n: usize, a: usize) {
  if mem_ref.is_null() {
    fail_aligned(n, a, &AllocError::NullOutput);
  }
  let mem = allocate_aligned(n, a);
  unsafe { mem_ref.write(mem) };
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tieralloc_free_aligned(mem_ref: *mut *mut u8) {
  if mem_ref.is_null() {
    return;
  }
  unsafe {
    free_aligned(mem_ref.read());
    mem_ref.write(null_mut());
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_zero_size_returns_null() {
    assert!(allocate(0).is_null());
    assert!(allocate_aligned(0, 64).is_null());
    unsafe {
      free(null_mut());
      free_aligned(null_mut());
    }
  }

  #[test]
  fn test_global_round_trip() {
    let p = allocate(256);
    assert!(!p.is_null());
    unsafe { p.write_bytes(0x11, 256) };
    assert!(global_context().is_some());

    let q = allocate_aligned(100, 256);
    assert_eq!(q as usize % 256, 0);
    unsafe { q.write_bytes(0x22, 100) };

    unsafe {
      free_aligned(q);
      free(p);
    }
  }

  #[cfg(feature = "c_api")]
  #[test]
  fn test_c_api_out_references() {
    let mut mem: *mut u8 = null_mut();
    unsafe {
      tieralloc_malloc_aligned(&mut mem, 48, 32);
      assert!(!mem.is_null());
      assert_eq!(mem as usize % 32, 0);
      tieralloc_free_aligned(&mut mem);
      assert!(mem.is_null());

      tieralloc_malloc(&mut mem, 0);
      assert!(mem.is_null());
      tieralloc_malloc(&mut mem, 10);
      assert!(!mem.is_null());
      tieralloc_free(&mut mem);
      assert!(mem.is_null());
    }
  }
}
