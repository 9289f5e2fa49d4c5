//! Arbitrary power-of-two alignment on top of the tiered allocator.
//!
//! A request for `n` bytes at alignment `a` over-allocates `n + (a - 1) +
//! HEADER_SIZE` raw bytes, returns the first `a`-aligned address that leaves
//! room for an `AlignedHeader` in front of it, and stores the raw block
//! pointer in that header. Freeing reads the header back; no size is needed.
//!
//! ```text
//!  raw                         aligned
//!   │                             │
//!   ▼                             ▼
//!   ┌──────── padding ───┬────────┬───────────── n bytes ─────────────┐
//!   │                    │ header │                                   │
//!   └────────────────────┴────────┴───────────────────────────────────┘
//!                         └─ raw ─┘
//! ```

use core::{
  mem::{align_of, size_of},
  ptr::NonNull,
};

use crate::{backend::TierBackend, error::AllocError, tiered::TieredAllocator};

/// Smallest effective alignment; smaller requests are raised to it.
pub const MIN_ALIGNMENT: usize = 16;

/// Back-pointer stored immediately before every aligned block.
#[repr(C)]
struct AlignedHeader {
  raw: NonNull<u8>,
}

/// Bytes reserved in front of every aligned block.
pub const HEADER_SIZE: usize = size_of::<AlignedHeader>();

const _: () = assert!(MIN_ALIGNMENT.is_power_of_two());
const _: () = assert!(HEADER_SIZE == size_of::<*mut u8>());
const _: () = assert!(MIN_ALIGNMENT % align_of::<AlignedHeader>() == 0);

// =============================================================================
// Handle
// =============================================================================

/// An owned aligned allocation. Release it with the aligned free path only.
#[derive(Debug, PartialEq, Eq)]
pub struct AlignedBlock {
  ptr: NonNull<u8>,
}

// The block is uniquely owned memory.
unsafe impl Send for AlignedBlock {}

impl AlignedBlock {
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

  /// Takes back ownership of a pointer from [`AlignedBlock::into_raw`].
  ///
  /// # Safety
  ///
  /// `ptr` must have been produced by an aligned allocation and not freed.
  #[inline]
  #[must_use]
  pub unsafe fn from_raw(ptr: NonNull<u8>) -> Self {
    Self { ptr }
  }
}

// =============================================================================
// Address arithmetic
// =============================================================================

/// Validates `align` and returns the effective alignment mask.
#[inline]
pub(crate) fn alignment_mask(align: usize) -> Result<usize, AllocError> {
  if align == 0 || align & (align - 1) != 0 {
    return Err(AllocError::InvalidAlignment { align });
  }
  Ok(align.max(MIN_ALIGNMENT) - 1)
}

/// Raw bytes needed to fit `size` aligned bytes plus the header.
#[inline]
fn padded_size(size: usize, mask: usize) -> Option<usize> {
  size.checked_add(mask)?.checked_add(HEADER_SIZE)
}

/// Computes the aligned address inside `raw` and writes the header.
///
/// # Safety
///
/// `raw` must be valid for writes of `padded_size(_, mask)` bytes.
#[inline]
unsafe fn place(raw: NonNull<u8>, mask: usize) -> NonNull<u8> {
  let aligned = raw.as_ptr().map_addr(|addr| (addr + mask + HEADER_SIZE) & !mask);
  unsafe {
    aligned.cast::<AlignedHeader>().sub(1).write(AlignedHeader { raw });
    NonNull::new_unchecked(aligned)
  }
}

/// Reads the raw block pointer stored in front of `aligned`.
///
/// # Safety
///
/// `aligned` must have been returned by [`place`] and its block not freed.
#[inline]
unsafe fn recover(aligned: NonNull<u8>) -> NonNull<u8> {
  unsafe { aligned.cast::<AlignedHeader>().sub(1).read().raw }
}

// =============================================================================
// Allocator
// =============================================================================

/// Aligned allocation view over a [`TieredAllocator`].
pub struct AlignedAllocator<'a, B: TierBackend> {
  tiered: &'a TieredAllocator<B>,
}

impl<'a, B: TierBackend> AlignedAllocator<'a, B> {
  #[must_use]
  pub fn new(tiered: &'a TieredAllocator<B>) -> Self {
    Self { tiered }
  }

  /// Allocates `size` bytes aligned to `max(align, MIN_ALIGNMENT)`.
  ///
  /// A zero-byte request returns `Ok(None)` without allocating.
  ///
  /// # Errors
  ///
  /// `InvalidAlignment` if `align` is zero or not a power of two (checked
  /// before the zero-size shortcut), `SizeOverflow` if padding overflows,
  /// and whatever the tiered allocator reports.
  pub fn allocate(&self, size: usize, align: usize) -> Result<Option<AlignedBlock>, AllocError> {
    let mask = alignment_mask(align)?;
    if size == 0 {
      return Ok(None);
    }

    let total = padded_size(size, mask).ok_or(AllocError::SizeOverflow { size, align })?;
    let raw = self.tiered.allocate(total)?;
    Ok(Some(AlignedBlock {
      ptr: unsafe { place(raw, mask) },
    }))
  }

  /// Allocates room for `count` values of `T`, aligned to at least
  /// `max(align, align_of::<T>())`.
  ///
  /// # Errors
  ///
  /// As [`AlignedAllocator::allocate`]; `SizeOverflow` if the byte count
  /// overflows.
  pub fn allocate_array<T>(&self, count: usize, align: usize) -> Result<Option<AlignedBlock>, AllocError> {
    alignment_mask(align)?;
    let size = count
      .checked_mul(size_of::<T>())
      .ok_or(AllocError::SizeOverflow { size: count, align })?;
    self.allocate(size, align.max(align_of::<T>()))
  }

  /// Releases an aligned block through its raw allocation.
  ///
  /// # Safety
  ///
  /// `block` must come from this allocator's tiered allocator.
  pub unsafe fn free(&self, block: AlignedBlock) {
    unsafe {
      let raw = recover(block.ptr);
      self.tiered.free(raw);
    }
  }
}
