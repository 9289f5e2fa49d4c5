//! Error types for tiered allocation.

use crate::device::DeviceTag;

/// Errors surfaced by the allocator.
///
/// Transient per-device failures never show up here: the fallback scan
/// recovers them and only reports an advisory warning.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
  /// Alignment is zero or not a power of two.
  #[error("invalid alignment {align}: must be a non-zero power of two")]
  InvalidAlignment {
    /// The requested alignment.
    align: usize,
  },

  /// A null output reference was passed to the C interface.
  #[error("output reference is null")]
  NullOutput,

  /// No discovered device matches the preference list.
  #[error("unable to find any devices with the given preferences {preferences:?}")]
  NoUsableDevice {
    /// Tags that were searched for, in rank order.
    preferences: Vec<DeviceTag>,
  },

  /// The catalog could not reserve space for its device descriptors.
  #[error("unable to allocate space for keeping track of {count} usable devices")]
  CatalogAllocation {
    /// Number of descriptors that were requested.
    count: usize,
  },

  /// Every device from the sticky index forward failed.
  #[error("failed to allocate {size} bytes: all memory devices exhausted")]
  Exhausted {
    /// Raw request size in bytes.
    size: usize,
  },

  /// The padded request size does not fit in `usize`.
  #[error("allocation size overflow (n={size}, a={align})")]
  SizeOverflow {
    /// Requested payload size.
    size: usize,
    /// Requested alignment.
    align: usize,
  },

  /// Runtime configuration could not be parsed.
  #[error("invalid configuration: {0}")]
  Config(String),
}

impl AllocError {
  /// True for caller programming errors rather than resource exhaustion.
  #[must_use]
  pub fn is_misuse(&self) -> bool {
    matches!(
      self,
      Self::InvalidAlignment { .. } | Self::NullOutput | Self::SizeOverflow { .. }
    )
  }
}
