//! Runtime configuration.
//!
//! Defaults suit a single-socket machine with or without on-package memory.
//! Every field can be overridden from the environment:
//!
//! | Variable | Example | Meaning |
//! |----------|---------|---------|
//! | `TIERALLOC_PREFERENCES` | `hbm,dram` | Ranked device tags |
//! | `TIERALLOC_CHUNK_SIZE` | `64M` | Bytes mapped per arena chunk |
//! | `TIERALLOC_DEVICE_LIMITS` | `1=16G,0=96G` | Per-node byte budget |
//! | `TIERALLOC_TAGS` | `2=pmem` | Per-node tag override |
//! | `TIERALLOC_STRICT_BIND` | `1` | Fail chunks whose `mbind` fails |

use crate::{
  device::{DEFAULT_PREFERENCES, DeviceTag},
  error::AllocError,
};

/// Default bytes mapped per arena chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 64 << 20; // 64MB

/// Smallest accepted chunk size.
pub const MIN_CHUNK_SIZE: usize = 64 << 10; // 64KB

pub const ENV_PREFERENCES: &str = "TIERALLOC_PREFERENCES";
pub const ENV_CHUNK_SIZE: &str = "TIERALLOC_CHUNK_SIZE";
pub const ENV_DEVICE_LIMITS: &str = "TIERALLOC_DEVICE_LIMITS";
pub const ENV_TAGS: &str = "TIERALLOC_TAGS";
pub const ENV_STRICT_BIND: &str = "TIERALLOC_STRICT_BIND";

/// Allocator configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllocatorConfig {
  /// Device tags in rank order. Devices with other tags are ignored.
  pub preferences: Vec<DeviceTag>,
  /// Bytes mapped per arena chunk. Larger requests get a dedicated chunk.
  pub chunk_size: usize,
  /// Byte budget per NUMA node, lowering the discovered capacity.
  pub device_limits: Vec<(usize, u64)>,
  /// Tag per NUMA node, replacing the inferred tag.
  pub tag_overrides: Vec<(usize, DeviceTag)>,
  /// Treat a failed `mbind` as a failed allocation instead of a warning.
  pub strict_binding: bool,
}

impl Default for AllocatorConfig {
  fn default() -> Self {
    Self {
      preferences: DEFAULT_PREFERENCES.to_vec(),
      chunk_size: DEFAULT_CHUNK_SIZE,
      device_limits: Vec::new(),
      tag_overrides: Vec::new(),
      strict_binding: false,
    }
  }
}

impl AllocatorConfig {
  #[must_use]
  pub fn preferences(mut self, preferences: impl Into<Vec<DeviceTag>>) -> Self {
    self.preferences = preferences.into();
    self
  }

  #[must_use]
  pub fn chunk_size(mut self, bytes: usize) -> Self {
    self.chunk_size = bytes.max(MIN_CHUNK_SIZE);
    self
  }

  #[must_use]
  pub fn device_limit(mut self, node: usize, bytes: u64) -> Self {
    self.device_limits.retain(|&(n, _)| n != node);
    self.device_limits.push((node, bytes));
    self
  }

  #[must_use]
  pub fn tag_override(mut self, node: usize, tag: DeviceTag) -> Self {
    self.tag_overrides.retain(|&(n, _)| n != node);
    self.tag_overrides.push((node, tag));
    self
  }

  #[must_use]
  pub fn strict_binding(mut self, strict: bool) -> Self {
    self.strict_binding = strict;
    self
  }

  /// Byte budget configured for `node`, if any.
  #[must_use]
  pub fn limit_for(&self, node: usize) -> Option<u64> {
    self
      .device_limits
      .iter()
      .find(|&&(n, _)| n == node)
      .map(|&(_, b)| b)
  }

  /// Tag override configured for `node`, if any.
  #[must_use]
  pub fn tag_for(&self, node: usize) -> Option<DeviceTag> {
    self
      .tag_overrides
      .iter()
      .find(|&&(n, _)| n == node)
      .map(|&(_, t)| t)
  }

  /// Defaults overridden by `TIERALLOC_*` environment variables.
  ///
  /// # Errors
  ///
  /// Returns `AllocError::Config` if a variable is set but malformed.
  pub fn from_env() -> Result<Self, AllocError> {
    Self::from_lookup(|key| std::env::var(key).ok())
  }

  /// Same as [`AllocatorConfig::from_env`] with a custom variable source.
  ///
  /// # Errors
  ///
  /// Returns `AllocError::Config` if a variable is set but malformed.
  pub fn from_lookup<F>(lookup: F) -> Result<Self, AllocError>
  where
    F: Fn(&str) -> Option<String>,
  {
    let mut config = Self::default();

    if let Some(raw) = lookup(ENV_PREFERENCES) {
      let preferences = raw
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(str::parse)
        .collect::<Result<Vec<DeviceTag>, _>>()?;
      if preferences.is_empty() {
        return Err(AllocError::Config(format!("{ENV_PREFERENCES} is empty")));
      }
      config.preferences = preferences;
    }

    if let Some(raw) = lookup(ENV_CHUNK_SIZE) {
      let bytes = parse_size(&raw)?;
      let bytes = usize::try_from(bytes)
        .map_err(|_| AllocError::Config(format!("{ENV_CHUNK_SIZE} too large: {raw}")))?;
      config = config.chunk_size(bytes);
    }

    if let Some(raw) = lookup(ENV_DEVICE_LIMITS) {
      for (node, value) in parse_node_pairs(ENV_DEVICE_LIMITS, &raw)? {
        config = config.device_limit(node, parse_size(value)?);
      }
    }

    if let Some(raw) = lookup(ENV_TAGS) {
      for (node, value) in parse_node_pairs(ENV_TAGS, &raw)? {
        config = config.tag_override(node, value.parse()?);
      }
    }

    if let Some(raw) = lookup(ENV_STRICT_BIND) {
      config.strict_binding = match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" | "" => false,
        other => {
          return Err(AllocError::Config(format!(
            "{ENV_STRICT_BIND} expects a boolean, got '{other}'"
          )));
        }
      };
    }

    Ok(config)
  }
}

/// Parses a byte count with an optional binary suffix (`K`, `M`, `G`, `T`).
///
/// # Errors
///
/// Returns `AllocError::Config` on malformed input or overflow.
pub fn parse_size(s: &str) -> Result<u64, AllocError> {
  let s = s.trim();
  let bad = || AllocError::Config(format!("invalid size '{s}'"));

  let upper = s.to_ascii_uppercase();
  let trimmed = upper.strip_suffix("IB").or_else(|| upper.strip_suffix('B')).unwrap_or(&upper);
  let (digits, shift) = match trimmed.as_bytes().last() {
    Some(b'K') => (&trimmed[..trimmed.len() - 1], 10),
    Some(b'M') => (&trimmed[..trimmed.len() - 1], 20),
    Some(b'G') => (&trimmed[..trimmed.len() - 1], 30),
    Some(b'T') => (&trimmed[..trimmed.len() - 1], 40),
    _ => (trimmed, 0),
  };

  let value: u64 = digits.trim().parse().map_err(|_| bad())?;
  value.checked_mul(1u64 << shift).ok_or_else(bad)
}

/// Splits `node=value,node=value`.
fn parse_node_pairs<'a>(var: &str, raw: &'a str) -> Result<Vec<(usize, &'a str)>, AllocError> {
  raw
    .split(',')
    .map(str::trim)
    .filter(|part| !part.is_empty())
    .map(|part| {
      let (node, value) = part
        .split_once('=')
        .ok_or_else(|| AllocError::Config(format!("{var}: expected node=value, got '{part}'")))?;
      let node = node
        .trim()
        .parse::<usize>()
        .map_err(|_| AllocError::Config(format!("{var}: invalid node id '{node}'")))?;
      Ok((node, value.trim()))
    })
    .collect()
}
