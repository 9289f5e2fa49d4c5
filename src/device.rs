//! Memory devices and the ranked device catalog.

use core::{fmt, str::FromStr};

use crate::{backend::TierBackend, error::AllocError};

// =============================================================================
// Device Tag
// =============================================================================

/// Kind of memory tier a device belongs to.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum DeviceTag {
  /// Fast on-package memory (MCDRAM, HBM).
  HighBandwidth,
  /// General system memory.
  Dram,
  /// Large, slow persistent memory.
  Persistent,
}

impl DeviceTag {
  /// Short lowercase name used in logs and configuration.
  #[must_use]
  pub const fn as_str(self) -> &'static str {
    match self {
      Self::HighBandwidth => "hbm",
      Self::Dram => "dram",
      Self::Persistent => "pmem",
    }
  }
}

impl fmt::Display for DeviceTag {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for DeviceTag {
  type Err = AllocError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_lowercase().as_str() {
      "hbm" | "fast" | "mcdram" | "high-bandwidth" => Ok(Self::HighBandwidth),
      "dram" | "general" | "ddr" => Ok(Self::Dram),
      "pmem" | "persistent" | "nvdimm" => Ok(Self::Persistent),
      other => Err(AllocError::Config(format!("unknown device tag '{other}'"))),
    }
  }
}

/// Default ranking: fast tier before general tier.
pub const DEFAULT_PREFERENCES: [DeviceTag; 2] = [DeviceTag::HighBandwidth, DeviceTag::Dram];

// =============================================================================
// Device
// =============================================================================

/// A discovered memory device. Immutable after discovery.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Device {
  /// Backend handle, the device's position in discovery order.
  pub id: usize,
  pub tag: DeviceTag,
  /// NUMA node backing the device, when the backend knows it.
  pub node: Option<usize>,
  /// Total bytes the device may hand out. `None` = unbounded.
  pub capacity: Option<u64>,
}

impl fmt::Display for Device {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.node {
      Some(node) => write!(f, "{} node {}", self.tag, node),
      None => write!(f, "{} device {}", self.tag, self.id),
    }
  }
}

// =============================================================================
// Catalog
// =============================================================================

/// Devices that match the preference list, in rank order.
///
/// All devices of the first preferred tag come before any device of the
/// second, and so on. Within a tag, discovery order is preserved.
#[derive(Clone, Debug)]
pub struct DeviceCatalog {
  devices: Vec<Device>,
}

impl DeviceCatalog {
  /// Queries `backend` for its devices and keeps the preferred ones.
  ///
  /// # Errors
  ///
  /// `NoUsableDevice` if nothing matches, `CatalogAllocation` if the
  /// descriptor buffer cannot be reserved.
  pub fn discover<B: TierBackend>(
    backend: &B,
    preferences: &[DeviceTag],
  ) -> Result<Self, AllocError> {
    Self::from_devices(backend.devices(), preferences)
  }

  /// Builds a catalog from an already enumerated device list.
  ///
  /// # Errors
  ///
  /// Same as [`DeviceCatalog::discover`].
  pub fn from_devices(discovered: Vec<Device>, preferences: &[DeviceTag]) -> Result<Self, AllocError> {
    let mut devices = Vec::new();
    devices
      .try_reserve_exact(discovered.len())
      .map_err(|_| AllocError::CatalogAllocation {
        count: discovered.len(),
      })?;

    for (rank, tag) in preferences.iter().enumerate() {
      // A tag listed twice only counts at its first rank.
      if preferences[..rank].contains(tag) {
        continue;
      }
      devices.extend(discovered.iter().filter(|d| d.tag == *tag).cloned());
    }

    if devices.is_empty() {
      return Err(AllocError::NoUsableDevice {
        preferences: preferences.to_vec(),
      });
    }

    Ok(Self { devices })
  }

  #[inline]
  #[must_use]
  pub fn len(&self) -> usize {
    self.devices.len()
  }

  #[inline]
  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.devices.is_empty()
  }

  #[inline]
  #[must_use]
  pub fn get(&self, index: usize) -> Option<&Device> {
    self.devices.get(index)
  }

  pub fn iter(&self) -> impl Iterator<Item = &Device> {
    self.devices.iter()
  }

  /// Index of the first device carrying `tag`.
  #[must_use]
  pub fn position(&self, tag: DeviceTag) -> Option<usize> {
    self.devices.iter().position(|d| d.tag == tag)
  }

  #[must_use]
  pub fn devices(&self) -> &[Device] {
    &self.devices
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn dev(id: usize, tag: DeviceTag) -> Device {
    Device {
      id,
      tag,
      node: Some(id),
      capacity: None,
    }
  }

  #[test]
  fn test_rank_order_preserves_discovery_order() {
    let discovered = vec![
      dev(0, DeviceTag::Dram),
      dev(1, DeviceTag::HighBandwidth),
      dev(2, DeviceTag::Dram),
      dev(3, DeviceTag::HighBandwidth),
    ];
    let catalog = DeviceCatalog::from_devices(discovered, &DEFAULT_PREFERENCES).unwrap();
    let ids: Vec<usize> = catalog.iter().map(|d| d.id).collect();
    assert_eq!(ids, vec![1, 3, 0, 2]);
  }

  #[test]
  fn test_unpreferred_tags_are_dropped() {
    let discovered = vec![
      dev(0, DeviceTag::Persistent),
      dev(1, DeviceTag::Dram),
    ];
    let catalog = DeviceCatalog::from_devices(discovered, &DEFAULT_PREFERENCES).unwrap();
    assert_eq!(catalog.len(), 1);
    assert_eq!(catalog.get(0).unwrap().tag, DeviceTag::Dram);
    assert_eq!(catalog.position(DeviceTag::Persistent), None);
  }

  #[test]
  fn test_no_usable_device() {
    let discovered = vec![dev(0, DeviceTag::Persistent)];
    let err = DeviceCatalog::from_devices(discovered, &DEFAULT_PREFERENCES).unwrap_err();
    assert_eq!(
      err,
      AllocError::NoUsableDevice {
        preferences: DEFAULT_PREFERENCES.to_vec()
      }
    );
  }

  #[test]
  fn test_duplicate_preference_does_not_duplicate_devices() {
    let discovered = vec![dev(0, DeviceTag::Dram)];
    let prefs = [DeviceTag::Dram, DeviceTag::Dram];
    let catalog = DeviceCatalog::from_devices(discovered, &prefs).unwrap();
    assert_eq!(catalog.len(), 1);
  }

  #[test]
  fn test_tag_parsing() {
    assert_eq!("hbm".parse::<DeviceTag>().unwrap(), DeviceTag::HighBandwidth);
    assert_eq!(" General ".parse::<DeviceTag>().unwrap(), DeviceTag::Dram);
    assert_eq!("pmem".parse::<DeviceTag>().unwrap(), DeviceTag::Persistent);
    assert!("gpu".parse::<DeviceTag>().is_err());
  }

  #[test]
  fn test_display() {
    assert_eq!(dev(1, DeviceTag::HighBandwidth).to_string(), "hbm node 1");
    let heap = Device {
      id: 2,
      tag: DeviceTag::Dram,
      node: None,
      capacity: None,
    };
    assert_eq!(heap.to_string(), "dram device 2");
  }
}
