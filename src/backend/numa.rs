//! NUMA backend: one device per NUMA node, arenas carved from `mmap`ed chunks
//! bound to their node with `mbind`.
//!
//! Each chunk starts with a [`ChunkHeader`]; each block is preceded by a
//! [`BlockHeader`] pointing back at its chunk, so `free` needs no size.
//! A chunk is unmapped once it is retired (its arena moved on or was dropped)
//! and its last block is freed.

use core::{
  mem::size_of,
  ptr::{self, NonNull, null_mut},
  sync::atomic::{AtomicU64, AtomicUsize, Ordering},
};
use std::{fs, io, path::Path, sync::Arc};

use parking_lot::Mutex;

use super::TierBackend;
use crate::{
  config::AllocatorConfig,
  device::{Device, DeviceTag},
};

// =============================================================================
// Constants
// =============================================================================

const SYSFS_NODE_PATH: &str = "/sys/devices/system/node";

/// Magic number to identify valid ChunkHeaders
const CHUNK_MAGIC: u64 = 0x5449_4552_4348_4E4B; // "TIERCHNK"
const BLOCK_MAGIC: usize = 0x7469_6572; // "tier"

const CHUNK_HEADER_SIZE: usize = size_of::<ChunkHeader>();
const BLOCK_HEADER_SIZE: usize = size_of::<BlockHeader>();

/// Payload granularity inside a chunk.
const BLOCK_ALIGN: usize = 16;

/// Set in `ChunkHeader::state` once no further blocks will be carved.
const RETIRED: usize = 1 << (usize::BITS - 1);

/// Nodes addressable by the `mbind` mask.
const MAX_NODES: usize = 1024;

// MPOL_BIND = 2 - strictly bind to the specified nodes
const MPOL_BIND: i32 = 2;
// MPOL_MF_MOVE = 2 - move pages to the node if they're already faulted
const MPOL_MF_MOVE: u32 = 2;

const _: () = assert!(CHUNK_HEADER_SIZE == 64);
const _: () = assert!(BLOCK_HEADER_SIZE == BLOCK_ALIGN);
const _: () = assert!(CHUNK_HEADER_SIZE % BLOCK_ALIGN == 0);
const _: () = assert!(MAX_NODES % 64 == 0);

// =============================================================================
// Types
// =============================================================================

/// Chunk metadata. Sits at offset 0 of each mapping.
#[repr(C, align(64))]
struct ChunkHeader {
  magic: u64,
  /// Mapping length (for munmap and budget release).
  len: usize,
  /// Live blocks, plus `RETIRED` once the owning arena moved on.
  state: AtomicUsize,
  /// Budget the mapping is charged against. Owned (`Arc::into_raw`).
  budget: *const DeviceBudget,
}

#[repr(C, align(16))]
struct BlockHeader {
  chunk: *mut ChunkHeader,
  magic: usize,
}

/// Byte budget of one device, shared by every arena and chunk on it.
#[derive(Debug)]
struct DeviceBudget {
  node: usize,
  capacity: u64,
  reserved: AtomicU64,
}

impl DeviceBudget {
  fn try_reserve(&self, bytes: u64) -> bool {
    self
      .reserved
      .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |r| {
        r.checked_add(bytes).filter(|&total| total <= self.capacity)
      })
      .is_ok()
  }

  fn release(&self, bytes: u64) {
    self.reserved.fetch_sub(bytes, Ordering::AcqRel);
  }

  fn remaining(&self) -> u64 {
    self.capacity.saturating_sub(self.reserved.load(Ordering::Relaxed))
  }
}

/// A NUMA node as read from sysfs.
#[derive(Clone, Debug, PartialEq, Eq)]
struct NodeInfo {
  id: usize,
  has_cpus: bool,
  /// Bytes, 0 if unknown.
  mem_total: u64,
  /// MB/s from the HMAT `access0` attributes, when the firmware reports them.
  read_bandwidth: Option<u64>,
}

/// Bump cursor over the arena's current chunk.
struct Cursor {
  chunk: *mut ChunkHeader,
  bump: *mut u8,
  end: *mut u8,
}

/// Arena bound to one NUMA node.
pub struct NumaArena {
  budget: Arc<DeviceBudget>,
  chunk_size: usize,
  strict: bool,
  cursor: Mutex<Cursor>,
}

// The cursor's raw pointers are only touched under the mutex.
unsafe impl Send for NumaArena {}
unsafe impl Sync for NumaArena {}

impl NumaArena {
  #[must_use]
  pub fn node(&self) -> usize {
    self.budget.node
  }
}

impl Drop for NumaArena {
  fn drop(&mut self) {
    let cursor = self.cursor.get_mut();
    if !cursor.chunk.is_null() {
      unsafe { retire_chunk(cursor.chunk) };
      cursor.chunk = null_mut();
    }
  }
}

/// NUMA-node backed tiering backend.
pub struct NumaBackend {
  devices: Vec<Device>,
  /// Indexed by device id.
  budgets: Vec<Arc<DeviceBudget>>,
  chunk_size: usize,
  strict_binding: bool,
  page_size: usize,
}

// =============================================================================
// Platform
// =============================================================================

unsafe fn os_mmap(size: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  unsafe { libc::munmap(ptr.cast(), size) };
}

fn page_size() -> usize {
  let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
  if size > 0 { size as usize } else { 4096 }
}

/// Binds `[ptr, ptr+len)` to `node`. Returns false if the kernel refused.
fn bind_to_node(ptr: *mut u8, len: usize, node: usize) -> bool {
  if node >= MAX_NODES {
    tracing::warn!(target: "tieralloc", "node {node} is beyond the mbind mask, leaving unbound");
    return false;
  }

  let mut nodemask = [0u64; MAX_NODES / 64];
  nodemask[node / 64] = 1u64 << (node % 64);

  // The kernel reads maxnode - 1 bits.
  let maxnode = MAX_NODES + 1;
  let result = unsafe {
    libc::syscall(
      libc::SYS_mbind,
      ptr,
      len,
      MPOL_BIND,
      nodemask.as_ptr(),
      maxnode,
      MPOL_MF_MOVE,
    )
  };

  if result < 0 {
    let err = io::Error::last_os_error();
    // Kernels without NUMA support have nothing to bind to.
    if err.raw_os_error() == Some(libc::ENOSYS) {
      return true;
    }
    tracing::warn!(target: "tieralloc", "mbind to node {node} failed: {err}");
    return false;
  }
  true
}

// =============================================================================
// Chunks
// =============================================================================

/// Marks `chunk` retired; unmaps it right away if no block is live.
unsafe fn retire_chunk(chunk: *mut ChunkHeader) {
  let prev = unsafe { (*chunk).state.fetch_or(RETIRED, Ordering::AcqRel) };
  if prev == 0 {
    unsafe { release_chunk(chunk) };
  }
}

/// Unmaps `chunk` and returns its bytes to the device budget.
/// Exactly one thread reaches this per chunk.
unsafe fn release_chunk(chunk: *mut ChunkHeader) {
  let (len, budget) = unsafe {
    debug_assert_eq!((*chunk).magic, CHUNK_MAGIC, "release_chunk: bad magic at {chunk:p}");
    ((*chunk).len, Arc::from_raw((*chunk).budget))
  };
  unsafe { os_munmap(chunk.cast(), len) };
  budget.release(len as u64);
}

/// Writes a block header at `at` and returns the payload pointer.
unsafe fn carve(chunk: *mut ChunkHeader, at: *mut u8) -> NonNull<u8> {
  let header = at.cast::<BlockHeader>();
  unsafe {
    header.write(BlockHeader {
      chunk,
      magic: BLOCK_MAGIC,
    });
    NonNull::new_unchecked(at.add(BLOCK_HEADER_SIZE))
  }
}

impl NumaBackend {
  /// Discovers NUMA nodes and applies tag overrides and device limits.
  #[must_use]
  pub fn new(config: &AllocatorConfig) -> Self {
    Self::from_nodes(discover_nodes(), config)
  }

  fn from_nodes(nodes: Vec<NodeInfo>, config: &AllocatorConfig) -> Self {
    let mut devices = Vec::with_capacity(nodes.len());
    let mut budgets = Vec::with_capacity(nodes.len());

    let dram_bandwidth = nodes
      .iter()
      .filter(|n| n.has_cpus)
      .filter_map(|n| n.read_bandwidth)
      .max();

    for (id, node) in nodes.iter().enumerate() {
      let tag = config.tag_for(node.id).unwrap_or_else(|| infer_tag(node, dram_bandwidth));

      let discovered = (node.mem_total > 0).then_some(node.mem_total);
      let capacity = match (discovered, config.limit_for(node.id)) {
        (Some(total), Some(limit)) => Some(total.min(limit)),
        (None, limit) => limit,
        (total, None) => total,
      };

      tracing::debug!(
        target: "tieralloc",
        "node {}: {} ({} bytes{})",
        node.id,
        tag,
        capacity.map_or_else(|| "unbounded".to_string(), |c| c.to_string()),
        if node.has_cpus { "" } else { ", memory only" }
      );

      devices.push(Device {
        id,
        tag,
        node: Some(node.id),
        capacity,
      });
      budgets.push(Arc::new(DeviceBudget {
        node: node.id,
        capacity: capacity.unwrap_or(u64::MAX),
        reserved: AtomicU64::new(0),
      }));
    }

    Self {
      devices,
      budgets,
      chunk_size: config.chunk_size,
      strict_binding: config.strict_binding,
      page_size: page_size(),
    }
  }

  /// Bytes still available on device `id`.
  #[must_use]
  pub fn remaining(&self, id: usize) -> Option<u64> {
    self.budgets.get(id).map(|b| b.remaining())
  }

  /// Maps, binds and initializes a chunk of `len` bytes charged to `arena`.
  fn map_chunk(&self, arena: &NumaArena, len: usize, state: usize) -> Option<*mut ChunkHeader> {
    let budget = &arena.budget;
    if !budget.try_reserve(len as u64) {
      tracing::debug!(
        target: "tieralloc",
        "node {} budget exhausted ({} bytes requested, {} left)",
        budget.node,
        len,
        budget.remaining()
      );
      return None;
    }

    let base = unsafe { os_mmap(len) };
    if base.is_null() {
      budget.release(len as u64);
      return None;
    }

    if !bind_to_node(base, len, budget.node) && arena.strict {
      unsafe { os_munmap(base, len) };
      budget.release(len as u64);
      return None;
    }

    let chunk = base.cast::<ChunkHeader>();
    unsafe {
      chunk.write(ChunkHeader {
        magic: CHUNK_MAGIC,
        len,
        state: AtomicUsize::new(state),
        budget: Arc::into_raw(Arc::clone(budget)),
      });
    }
    Some(chunk)
  }

  /// Maps whatever page-rounded budget is left on the device, if it is less
  /// than a full chunk but still fits `need`.
  #[cold]
  fn map_partial_chunk(&self, arena: &NumaArena, need: usize) -> Option<*mut ChunkHeader> {
    let remaining = usize::try_from(arena.budget.remaining()).unwrap_or(usize::MAX);
    let len = remaining.min(arena.chunk_size) / self.page_size * self.page_size;
    if len >= arena.chunk_size || len < CHUNK_HEADER_SIZE + need {
      return None;
    }

    tracing::debug!(
      target: "tieralloc",
      "node {}: mapping a {len} byte tail chunk from the remaining budget",
      arena.node()
    );
    self.map_chunk(arena, len, 0)
  }

  /// Requests larger than half a chunk get a mapping of their own, retired
  /// from the start so the single free unmaps it.
  #[inline(never)]
  fn alloc_dedicated(&self, arena: &NumaArena, need: usize) -> Option<NonNull<u8>> {
    let len = CHUNK_HEADER_SIZE
      .checked_add(need)?
      .checked_next_multiple_of(self.page_size)?;
    let chunk = self.map_chunk(arena, len, RETIRED | 1)?;
    Some(unsafe { carve(chunk, chunk.cast::<u8>().add(CHUNK_HEADER_SIZE)) })
  }
}

impl TierBackend for NumaBackend {
  type Arena = NumaArena;

  fn name(&self) -> &'static str {
    "numa"
  }

  fn devices(&self) -> Vec<Device> {
    self.devices.clone()
  }

  fn create_arena(&self, device: &Device) -> Option<NumaArena> {
    let budget = self.budgets.get(device.id)?;
    if budget.remaining() < self.page_size as u64 {
      return None;
    }

    Some(NumaArena {
      budget: Arc::clone(budget),
      chunk_size: self.chunk_size,
      strict: self.strict_binding,
      cursor: Mutex::new(Cursor {
        chunk: null_mut(),
        bump: null_mut(),
        end: null_mut(),
      }),
    })
  }

  fn arena_alloc(&self, arena: &NumaArena, size: usize) -> Option<NonNull<u8>> {
    let need = size
      .checked_next_multiple_of(BLOCK_ALIGN)?
      .checked_add(BLOCK_HEADER_SIZE)?;

    if need > arena.chunk_size.saturating_sub(CHUNK_HEADER_SIZE) / 2 {
      return self.alloc_dedicated(arena, need);
    }

    let mut cursor = arena.cursor.lock();
    if cursor.chunk.is_null() || (cursor.end as usize - cursor.bump as usize) < need {
      // Keep the old chunk current if no new one can be mapped.
      let chunk = self
        .map_chunk(arena, arena.chunk_size, 0)
        .or_else(|| self.map_partial_chunk(arena, need))?;
      let old = cursor.chunk;
      let base = chunk.cast::<u8>();
      let len = unsafe { (*chunk).len };
      *cursor = Cursor {
        chunk,
        bump: unsafe { base.add(CHUNK_HEADER_SIZE) },
        end: unsafe { base.add(len) },
      };
      if !old.is_null() {
        unsafe { retire_chunk(old) };
      }
    }

    let at = cursor.bump;
    cursor.bump = unsafe { at.add(need) };
    unsafe {
      (*cursor.chunk).state.fetch_add(1, Ordering::Relaxed);
      Some(carve(cursor.chunk, at))
    }
  }

  unsafe fn free(&self, ptr: NonNull<u8>) {
    let header = unsafe { ptr.as_ptr().sub(BLOCK_HEADER_SIZE).cast::<BlockHeader>() };
    let chunk = unsafe {
      debug_assert_eq!((*header).magic, BLOCK_MAGIC, "free: {ptr:p} is not a tieralloc block");
      (*header).chunk
    };

    let prev = unsafe { (*chunk).state.fetch_sub(1, Ordering::AcqRel) };
    debug_assert!(prev & !RETIRED != 0, "free: live count underflow");
    if prev == RETIRED | 1 {
      unsafe { release_chunk(chunk) };
    }
  }

  fn node_of(&self, ptr: NonNull<u8>) -> Option<usize> {
    let mut status: i32 = -1;
    let page_ptr = ptr.as_ptr() as *mut libc::c_void;

    // Null target nodes: query placement without moving.
    let result = unsafe {
      libc::syscall(
        libc::SYS_move_pages,
        0i32, // self
        1usize,
        &raw const page_ptr,
        ptr::null::<i32>(),
        &raw mut status,
        0i32, // flags
      )
    };

    if result == 0 && status >= 0 {
      Some(status as usize)
    } else {
      None
    }
  }
}

// =============================================================================
// Discovery
// =============================================================================

fn discover_nodes() -> Vec<NodeInfo> {
  match read_sysfs_nodes(Path::new(SYSFS_NODE_PATH)) {
    Ok(nodes) if !nodes.is_empty() => nodes,
    Ok(_) => single_node_fallback(),
    Err(err) => {
      tracing::debug!(target: "tieralloc", "sysfs node discovery failed: {err}");
      single_node_fallback()
    }
  }
}

fn read_sysfs_nodes(root: &Path) -> io::Result<Vec<NodeInfo>> {
  let mut nodes = Vec::new();

  for entry in fs::read_dir(root)? {
    let entry = entry?;
    let name = entry.file_name();
    let Some(id) = name
      .to_str()
      .and_then(|n| n.strip_prefix("node"))
      .and_then(|n| n.parse::<usize>().ok())
    else {
      continue;
    };

    let dir = entry.path();
    let has_cpus = fs::read_to_string(dir.join("cpulist"))
      .map(|s| !parse_cpulist(s.trim()).is_empty())
      .unwrap_or(false);
    let mem_total = fs::read_to_string(dir.join("meminfo"))
      .map(|s| parse_meminfo(&s))
      .unwrap_or(0);
    let read_bandwidth = fs::read_to_string(dir.join("access0/initiators/read_bandwidth"))
      .ok()
      .and_then(|s| s.trim().parse::<u64>().ok())
      .filter(|&bw| bw > 0);

    nodes.push(NodeInfo {
      id,
      has_cpus,
      mem_total,
      read_bandwidth,
    });
  }

  nodes.sort_unstable_by_key(|n| n.id);
  Ok(nodes)
}

fn single_node_fallback() -> Vec<NodeInfo> {
  let mem_total = fs::read_to_string("/proc/meminfo")
    .map(|s| parse_meminfo(&s))
    .unwrap_or(0);
  vec![NodeInfo {
    id: 0,
    has_cpus: true,
    mem_total,
    read_bandwidth: None,
  }]
}

/// Tier of a node from its topology.
///
/// Nodes with CPUs are `Dram`. A memory-only node is the on-package fast
/// tier (e.g. MCDRAM in flat mode) unless HMAT reports it no faster than the
/// best CPU node, as with CXL expanders or persistent memory onlined as
/// system RAM; those are the slow tier. Without HMAT data a memory-only node
/// is assumed fast, so such machines need `TIERALLOC_TAGS`.
fn infer_tag(node: &NodeInfo, dram_bandwidth: Option<u64>) -> DeviceTag {
  if node.has_cpus {
    return DeviceTag::Dram;
  }
  match (node.read_bandwidth, dram_bandwidth) {
    (Some(own), Some(dram)) if own <= dram => DeviceTag::Persistent,
    _ => DeviceTag::HighBandwidth,
  }
}

/// Parse a CPU list string like "0-7,16-23".
fn parse_cpulist(s: &str) -> Vec<usize> {
  let mut cpus = Vec::new();

  for part in s.split(',') {
    let part = part.trim();
    if part.is_empty() {
      continue;
    }

    if let Some((start, end)) = part.split_once('-') {
      if let (Ok(start), Ok(end)) = (start.parse::<usize>(), end.parse::<usize>()) {
        cpus.extend(start..=end);
      }
    } else if let Ok(cpu) = part.parse::<usize>() {
      cpus.push(cpu);
    }
  }

  cpus
}

/// Total bytes from a meminfo file. Handles both the per-node
/// ("Node 0 MemTotal: N kB") and the global ("MemTotal: N kB") layout.
fn parse_meminfo(s: &str) -> u64 {
  for line in s.lines() {
    let Some((key, rest)) = line.split_once(':') else {
      continue;
    };
    if !key.trim_end().ends_with("MemTotal") {
      continue;
    }

    let mut parts = rest.split_whitespace();
    let Some(value) = parts.next().and_then(|v| v.parse::<u64>().ok()) else {
      continue;
    };
    return match parts.next() {
      Some("kB") => value * 1024,
      _ => value,
    };
  }
  0
}
