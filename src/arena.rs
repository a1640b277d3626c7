use core::{mem, ptr::NonNull};
use std::io;

use crate::{
  chunk::{CHUNK_ALIGN, CHUNK_SIZE, Chunk, ChunkFlags, ChunkIter, LockdownIter, LockdownList, ReleaseReport, TeardownList},
  config::{ALLOC_ALIGN, ArenaConfig, Placement},
  error::ArenaError,
  index::RangeIndex,
  os::{OsMapper, PageMapper},
  persistent::{self, PersistentRegions},
};

// =============================================================================
// Types
// =============================================================================

/// Lifetime class of a small allocation.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Lifetime {
  /// Reclaimed by `ThreadArena::release_all` when the owning thread ends.
  Transient,
  /// Survives the owning thread; reclaimed at engine shutdown.
  Persistent,
}

/// Where the descriptor of a freshly mapped small-arena region goes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DescriptorSlot {
  /// Aligned address inside the leftover of the previous region.
  Leftover(usize),
  /// Start of the new region, caller's block right after it.
  NewRegion,
}

/// Per-arena diagnostic counters. Only the owning thread writes them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ArenaStats {
  pub regions_mapped: usize,
  pub bytes_mapped: usize,
  pub map_failures: usize,
  pub transient_allocs: usize,
  pub persistent_allocs: usize,
  pub page_allocs: usize,
}

/// Bump state plus the bookkeeping of every region backing it.
struct Lane {
  cursor: usize,
  free: usize,
  chunks: TeardownList,
  index: RangeIndex,
}

impl Lane {
  fn new() -> Self {
    Self {
      cursor: 0,
      free: 0,
      chunks: TeardownList::new(),
      index: RangeIndex::new(),
    }
  }

  /// Fast path: carve `bytes` at `align` out of the current region. No system call.
  #[inline]
  fn try_bump(&mut self, bytes: usize, align: usize) -> Option<usize> {
    let start = align_up(self.cursor, align);
    let need = (start - self.cursor).checked_add(bytes)?;
    if need > self.free {
      return None;
    }
    self.cursor = start + bytes;
    self.free -= need;
    Some(start)
  }

  fn reset_bump(&mut self) {
    self.cursor = 0;
    self.free = 0;
  }
}

// =============================================================================
// ThreadArena
// =============================================================================

/// Allocation state of one thread.
///
/// Owned and mutated by a single thread only, so nothing here takes a lock. Every region the
/// arena maps gets a `Chunk` that is pushed on a teardown list and inserted in a range index of
/// the matching lifetime.
pub struct ThreadArena<M: PageMapper = OsMapper> {
  transient: Lane,
  persistent: Lane,
  /// Placement hint for the next region; only ever decreases.
  next_map_hint: usize,
  lockdown: LockdownList,
  stats: ArenaStats,
  config: ArenaConfig,
  mapper: M,
}

impl ThreadArena<OsMapper> {
  /// Arena with the default configuration, laying regions out downward from `next_map_hint`.
  pub fn new(next_map_hint: usize) -> Self {
    let mapper = OsMapper::new();
    Self::build(ArenaConfig::default(), next_map_hint, mapper)
  }

  pub fn with_config(config: ArenaConfig, next_map_hint: usize) -> Result<Self, ArenaError> {
    Self::with_mapper(config, next_map_hint, OsMapper::new())
  }
}

impl<M: PageMapper> ThreadArena<M> {
  pub fn with_mapper(config: ArenaConfig, next_map_hint: usize, mapper: M) -> Result<Self, ArenaError> {
    config.validate()?;
    if !mapper.page_size().is_power_of_two() {
      return Err(ArenaError::InvalidArgument("page size must be a power of two"));
    }
    Ok(Self::build(config, next_map_hint, mapper))
  }

  fn build(config: ArenaConfig, next_map_hint: usize, mapper: M) -> Self {
    let page_mask = mapper.page_size() - 1;
    Self {
      transient: Lane::new(),
      persistent: Lane::new(),
      next_map_hint: next_map_hint & !page_mask,
      lockdown: LockdownList::new(),
      stats: ArenaStats::default(),
      config,
      mapper,
    }
  }

  // ---------------------------------------------------------------------------
  // Entry points
  // ---------------------------------------------------------------------------

  /// Allocate `bytes` that stay valid until `release_all`.
  ///
  /// The size is rounded up to `ALLOC_ALIGN`. Consecutive calls served from the same region
  /// return adjacent blocks.
  pub fn alloc_transient(&mut self, bytes: usize) -> Result<NonNull<u8>, ArenaError> {
    let bytes = round_request(bytes)?;
    let addr = self.reserve(Lifetime::Transient, bytes, ALLOC_ALIGN)?;
    self.stats.transient_allocs += 1;
    Ok(block_ptr(addr))
  }

  /// Allocate `bytes` that outlive the owning thread.
  ///
  /// Backing regions and their descriptors live on the persistent lane only, so
  /// `release_all` never reclaims them.
  pub fn alloc_persistent(&mut self, bytes: usize) -> Result<NonNull<u8>, ArenaError> {
    let bytes = round_request(bytes)?;
    let addr = self.reserve(Lifetime::Persistent, bytes, ALLOC_ALIGN)?;
    self.stats.persistent_allocs += 1;
    Ok(block_ptr(addr))
  }

  /// Map a fresh, page-aligned region of `pages` pages.
  ///
  /// The region is never shared with other requests. Its descriptor comes from the transient
  /// arena and it is reclaimed by `release_all`.
  pub fn alloc_pages(&mut self, pages: usize) -> Result<NonNull<u8>, ArenaError> {
    if pages == 0 {
      return Err(ArenaError::InvalidArgument("page count must be positive"));
    }
    let len = pages
      .checked_mul(self.mapper.page_size())
      .ok_or(ArenaError::InvalidArgument("page count overflows the address space"))?;

    let saved_hint = self.next_map_hint;
    let region = self.map_region(len)?;

    let slot = match self.reserve(Lifetime::Transient, CHUNK_SIZE, CHUNK_ALIGN) {
      Ok(slot) => slot,
      Err(err) => {
        // Nothing may reference a region we could not describe.
        if let Err(unmap_err) = unsafe { self.mapper.unmap(block_ptr(region), len) } {
          tracing::warn!(region = ?block_ptr(region), len, error = %unmap_err, "failed to unmap undescribed region");
        }
        self.next_map_hint = saved_hint;
        self.stats.regions_mapped -= 1;
        self.stats.bytes_mapped -= len;
        return Err(err);
      }
    };

    let chunk = unsafe { Chunk::init(slot, region, len, ChunkFlags::REGION.union(ChunkFlags::PAGES)) };
    unsafe {
      self.transient.chunks.push(chunk);
      self.transient.index.insert(chunk);
    }
    self.stats.page_allocs += 1;
    tracing::debug!(region = ?block_ptr(region), pages, "mapped page region");
    Ok(block_ptr(region))
  }

  /// Unmap every transient region and page region of this arena.
  ///
  /// Pointers handed out by `alloc_transient` and `alloc_pages` dangle afterwards. Persistent
  /// regions are untouched. Calling it again without new allocations is a no-op.
  pub fn release_all(&mut self) -> ReleaseReport {
    if self.transient.chunks.is_empty() {
      return ReleaseReport::default();
    }

    // Both only point into memory that is about to be unmapped.
    self.transient.index.forget();
    self.lockdown.forget();
    let report = self.transient.chunks.release(&self.mapper);
    self.transient.reset_bump();

    tracing::info!(
      kib_freed = report.kib(),
      regions = report.regions,
      failures = report.failures,
      "released transient regions"
    );
    report
  }

  /// Detach the persistent regions mapped so far.
  ///
  /// The arena starts a new persistent region on its next persistent allocation.
  pub fn take_persistent(&mut self) -> PersistentRegions {
    let chunks = self.persistent.chunks.take();
    let index = mem::take(&mut self.persistent.index);
    self.persistent.reset_bump();
    PersistentRegions::from_parts(chunks, index)
  }

  // ---------------------------------------------------------------------------
  // Lookup
  // ---------------------------------------------------------------------------

  /// Chunk of this arena whose range contains `addr`.
  pub fn find_chunk(&self, addr: usize) -> Option<&Chunk> {
    self
      .transient
      .index
      .find_containing(addr)
      .or_else(|| self.persistent.index.find_containing(addr))
  }

  #[inline]
  pub fn owns(&self, addr: usize) -> bool {
    self.find_chunk(addr).is_some()
  }

  /// Transient and page regions, newest first.
  pub fn chunks(&self) -> ChunkIter<'_> {
    self.transient.chunks.iter()
  }

  /// Persistent regions still attached to this arena, newest first.
  pub fn persistent_chunks(&self) -> ChunkIter<'_> {
    self.persistent.chunks.iter()
  }

  pub fn index(&self) -> &RangeIndex {
    &self.transient.index
  }

  pub fn persistent_index(&self) -> &RangeIndex {
    &self.persistent.index
  }

  // ---------------------------------------------------------------------------
  // Lockdown
  // ---------------------------------------------------------------------------

  /// Link the transient chunk containing `addr` into the lockdown list.
  ///
  /// Returns false if no transient chunk contains `addr` or it is already linked.
  pub fn mark_lockdown(&mut self, addr: usize) -> bool {
    let Some(chunk) = self.transient.index.find_containing(addr).map(NonNull::from) else {
      return false;
    };
    unsafe { self.lockdown.link(chunk) }
  }

  pub fn lockdown_chunks(&self) -> LockdownIter<'_> {
    self.lockdown.iter()
  }

  // ---------------------------------------------------------------------------
  // Accessors
  // ---------------------------------------------------------------------------

  #[inline]
  pub fn transient_cursor(&self) -> usize {
    self.transient.cursor
  }

  #[inline]
  pub fn transient_free(&self) -> usize {
    self.transient.free
  }

  #[inline]
  pub fn persistent_cursor(&self) -> usize {
    self.persistent.cursor
  }

  #[inline]
  pub fn persistent_free(&self) -> usize {
    self.persistent.free
  }

  #[inline]
  pub fn next_map_hint(&self) -> usize {
    self.next_map_hint
  }

  #[inline]
  pub fn stats(&self) -> ArenaStats {
    self.stats
  }

  #[inline]
  pub fn config(&self) -> &ArenaConfig {
    &self.config
  }

  #[inline]
  pub fn mapper(&self) -> &M {
    &self.mapper
  }

  #[inline]
  pub fn page_size(&self) -> usize {
    self.mapper.page_size()
  }

  // ---------------------------------------------------------------------------
  // Growth
  // ---------------------------------------------------------------------------

  fn lane_mut(&mut self, lifetime: Lifetime) -> &mut Lane {
    match lifetime {
      Lifetime::Transient => &mut self.transient,
      Lifetime::Persistent => &mut self.persistent,
    }
  }

  fn reserve(&mut self, lifetime: Lifetime, bytes: usize, align: usize) -> Result<usize, ArenaError> {
    debug_assert!(align.is_power_of_two() && align <= CHUNK_ALIGN);
    match self.lane_mut(lifetime).try_bump(bytes, align) {
      Some(addr) => Ok(addr),
      None => self.grow(lifetime, bytes),
    }
  }

  /// Slow path: map a new region for `lifetime` and serve `bytes` from it.
  ///
  /// Nothing is committed unless the mapping succeeds.
  #[inline(never)]
  fn grow(&mut self, lifetime: Lifetime, bytes: usize) -> Result<usize, ArenaError> {
    let region_len = region_len_for(bytes, self.mapper.page_size(), self.config.region_pages())?;
    let region = self.map_region(region_len)?;

    let lane = self.lane_mut(lifetime);
    let placement = place_descriptor(lane.cursor, lane.free);
    let (slot, block) = match placement {
      DescriptorSlot::Leftover(slot) => (slot, region),
      DescriptorSlot::NewRegion => (region, region + CHUNK_SIZE),
    };
    lane.cursor = block + bytes;
    lane.free = region + region_len - lane.cursor;

    let flags = match lifetime {
      Lifetime::Transient => ChunkFlags::REGION,
      Lifetime::Persistent => ChunkFlags::REGION.union(ChunkFlags::PERSISTENT),
    };
    let chunk = unsafe { Chunk::init(slot, region, region_len, flags) };
    unsafe {
      lane.chunks.push(chunk);
      lane.index.insert(chunk);
    }

    #[cfg(feature = "lockdown")]
    if lifetime == Lifetime::Transient {
      unsafe { self.lockdown.link(chunk) };
    }

    tracing::debug!(
      ?lifetime,
      region = ?block_ptr(region),
      len = region_len,
      ?placement,
      "mapped arena region"
    );
    Ok(block)
  }

  /// Map `len` bytes just below the current hint. The hint only moves on success.
  fn map_region(&mut self, len: usize) -> Result<usize, ArenaError> {
    let placement = self.config.placement();
    let current = self.next_map_hint;

    let mapped = match placement {
      // A zero hint lets the OS choose once the window is used up.
      Placement::Hint => {
        let hint = current.saturating_sub(len);
        self.mapper.map(hint, len, placement).map(|ptr| (hint, ptr))
      }
      Placement::Fixed => match current.checked_sub(len) {
        Some(hint) if hint != 0 => self.mapper.map(hint, len, placement).map(|ptr| (hint, ptr)),
        _ => Err(io::Error::new(io::ErrorKind::AddrNotAvailable, "map hint exhausted")),
      },
    };

    match mapped {
      Ok((hint, ptr)) => {
        self.next_map_hint = hint;
        self.stats.regions_mapped += 1;
        self.stats.bytes_mapped += len;
        Ok(ptr.as_ptr() as usize)
      }
      Err(source) => {
        self.stats.map_failures += 1;
        let hint = current.saturating_sub(len);
        tracing::error!(len, hint = ?(hint as *const u8), error = %source, "failed to map arena region");
        Err(ArenaError::OutOfMemory { len, hint, source })
      }
    }
  }
}

impl<M: PageMapper> Drop for ThreadArena<M> {
  fn drop(&mut self) {
    self.release_all();

    let regions = self.take_persistent();
    if !regions.is_empty() {
      persistent::adopt(regions);
    }
  }
}

// =============================================================================
// Sizing and placement
// =============================================================================

/// Decide where the descriptor of a new region is stored, given the bump state of the lane
/// before growth.
///
/// The leftover of the previous region is used when an aligned descriptor still fits in it;
/// that space would be wasted otherwise.
pub fn place_descriptor(cursor: usize, free: usize) -> DescriptorSlot {
  let slot = align_up(cursor, CHUNK_ALIGN);
  match (slot - cursor).checked_add(CHUNK_SIZE) {
    Some(need) if need <= free => DescriptorSlot::Leftover(slot),
    _ => DescriptorSlot::NewRegion,
  }
}

/// Size of a new small-arena region: the preferred size, or the smallest page multiple that
/// fits `bytes` plus one descriptor.
pub fn region_len_for(bytes: usize, page_size: usize, region_pages: usize) -> Result<usize, ArenaError> {
  const OVERFLOW: ArenaError = ArenaError::InvalidArgument("allocation size overflows the address space");
  let preferred = region_pages.checked_mul(page_size).ok_or(OVERFLOW)?;
  let needed = bytes.checked_add(CHUNK_SIZE).ok_or(OVERFLOW)?;
  if needed <= preferred {
    return Ok(preferred);
  }
  needed.div_ceil(page_size).checked_mul(page_size).ok_or(OVERFLOW)
}

fn round_request(bytes: usize) -> Result<usize, ArenaError> {
  if bytes == 0 {
    return Err(ArenaError::InvalidArgument("allocation size must be positive"));
  }
  bytes
    .checked_add(ALLOC_ALIGN - 1)
    .map(|b| b & !(ALLOC_ALIGN - 1))
    .ok_or(ArenaError::InvalidArgument("allocation size overflows the address space"))
}

#[inline(always)]
fn block_ptr(addr: usize) -> NonNull<u8> {
  debug_assert!(addr != 0);
  // SAFETY: every block lies inside a region returned by a successful mapping.
  unsafe { NonNull::new_unchecked(addr as *mut u8) }
}

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::next_thread_hint;

  fn arena(region_pages: usize) -> ThreadArena {
    let config = ArenaConfig::new().with_region_pages(region_pages);
    ThreadArena::with_config(config, next_thread_hint()).unwrap()
  }

  #[test]
  fn descriptor_goes_to_leftover_when_it_fits() {
    assert_eq!(place_descriptor(0x1000, CHUNK_SIZE), DescriptorSlot::Leftover(0x1000));
    assert_eq!(place_descriptor(0x1000, CHUNK_SIZE + 100), DescriptorSlot::Leftover(0x1000));
  }

  #[test]
  fn descriptor_goes_to_new_region_when_leftover_is_short() {
    assert_eq!(place_descriptor(0, 0), DescriptorSlot::NewRegion);
    assert_eq!(place_descriptor(0x1000, CHUNK_SIZE - 1), DescriptorSlot::NewRegion);
  }

  #[test]
  fn descriptor_slot_is_aligned() {
    let cursor = 0x1000 + ALLOC_ALIGN;
    let expected = align_up(cursor, CHUNK_ALIGN);
    let padding = expected - cursor;
    assert_eq!(
      place_descriptor(cursor, padding + CHUNK_SIZE),
      DescriptorSlot::Leftover(expected)
    );
    if padding > 0 {
      assert_eq!(place_descriptor(cursor, CHUNK_SIZE), DescriptorSlot::NewRegion);
    }
  }

  #[test]
  fn region_len_prefers_configured_size() {
    assert_eq!(region_len_for(10, 4096, 4).unwrap(), 4 * 4096);
    assert_eq!(region_len_for(4 * 4096 - CHUNK_SIZE, 4096, 4).unwrap(), 4 * 4096);
  }

  #[test]
  fn region_len_grows_to_smallest_page_multiple() {
    assert_eq!(region_len_for(4 * 4096 - CHUNK_SIZE + 1, 4096, 4).unwrap(), 5 * 4096);
    assert_eq!(region_len_for(4 * 4096 + 4, 4096, 4).unwrap(), 5 * 4096);
    assert_eq!(region_len_for(8 * 4096 - CHUNK_SIZE, 4096, 1).unwrap(), 8 * 4096);
  }

  #[test]
  fn region_len_rejects_overflow() {
    assert!(region_len_for(usize::MAX, 4096, 4).unwrap_err().is_invalid_argument());
    assert!(region_len_for(1, 4096, usize::MAX).unwrap_err().is_invalid_argument());
  }

  #[test]
  fn requests_round_to_alloc_align() {
    assert_eq!(round_request(1).unwrap(), 4);
    assert_eq!(round_request(10).unwrap(), 12);
    assert_eq!(round_request(12).unwrap(), 12);
    assert!(round_request(0).unwrap_err().is_invalid_argument());
    assert!(round_request(usize::MAX).unwrap_err().is_invalid_argument());
  }

  #[test]
  fn bump_path_does_not_map() {
    let mut arena = arena(1);
    let a = arena.alloc_transient(10).unwrap();
    let cursor = arena.transient_cursor();
    let b = arena.alloc_transient(10).unwrap();
    assert_eq!(b.as_ptr() as usize, cursor);
    assert_eq!(b.as_ptr() as usize, a.as_ptr() as usize + 12);
    assert_eq!(arena.stats().regions_mapped, 1);
    assert_eq!(arena.stats().transient_allocs, 2);
  }

  #[test]
  fn blocks_are_writable() {
    let mut arena = arena(1);
    let ptr = arena.alloc_transient(100).unwrap();
    unsafe {
      ptr.as_ptr().write_bytes(0x5A, 100);
      assert_eq!(*ptr.as_ptr().add(99), 0x5A);
    }
    let pages = arena.alloc_pages(2).unwrap();
    unsafe {
      pages.as_ptr().write_bytes(0xA5, 2 * arena.page_size());
    }
    let pers = arena.alloc_persistent(64).unwrap();
    unsafe { pers.as_ptr().write_bytes(0x11, 64) };
  }

  #[test]
  fn page_regions_are_aligned_and_tracked() {
    let mut arena = arena(1);
    let ptr = arena.alloc_pages(3).unwrap();
    let addr = ptr.as_ptr() as usize;
    assert_eq!(addr % arena.page_size(), 0);

    let chunk = arena.find_chunk(addr).unwrap();
    assert_eq!(chunk.begin(), addr);
    assert_eq!(chunk.len(), 3 * arena.page_size());
    assert!(chunk.flags().contains(ChunkFlags::PAGES));
    // Descriptor came from a transient region.
    let desc = arena.find_chunk(chunk.descriptor_addr()).unwrap();
    assert!(!desc.flags().contains(ChunkFlags::PAGES));
    assert_eq!(arena.stats().page_allocs, 1);
  }

  #[test]
  fn hint_moves_downward() {
    let mut arena = arena(1);
    let ps = arena.page_size();
    let start = arena.next_map_hint();
    arena.alloc_transient(8).unwrap();
    assert_eq!(arena.next_map_hint(), start - ps);
    // Descriptor for the page region is carved from the existing transient region.
    arena.alloc_pages(2).unwrap();
    assert_eq!(arena.next_map_hint(), start - 3 * ps);
    assert_eq!(arena.stats().regions_mapped, 2);
  }

  #[test]
  fn release_all_is_idempotent() {
    let mut arena = arena(1);
    arena.alloc_transient(16).unwrap();
    arena.alloc_pages(2).unwrap();
    let report = arena.release_all();
    assert_eq!(report.regions, 2);
    assert_eq!(report.failures, 0);
    assert!(arena.chunks().next().is_none());
    assert!(arena.index().is_empty());
    assert_eq!(arena.transient_free(), 0);
    assert_eq!(arena.release_all(), ReleaseReport::default());

    // The arena stays usable.
    arena.alloc_transient(16).unwrap();
    assert_eq!(arena.chunks().count(), 1);
  }

  #[test]
  fn persistent_regions_survive_release_all() {
    let mut arena = arena(1);
    let p = arena.alloc_persistent(32).unwrap().as_ptr() as usize;
    arena.alloc_transient(32).unwrap();
    arena.release_all();

    let chunk = arena.find_chunk(p).unwrap();
    assert!(chunk.flags().contains(ChunkFlags::PERSISTENT));
    assert!(arena.persistent_index().contains(chunk.descriptor_addr()));

    let mut regions = arena.take_persistent();
    assert!(!arena.owns(p));
    assert!(regions.contains(p));
    let report = unsafe { regions.release(arena.mapper()) };
    assert_eq!(report.regions, 1);
  }

  #[test]
  fn mark_lockdown_links_transient_chunks_once() {
    let mut arena = arena(1);
    let addr = arena.alloc_transient(8).unwrap().as_ptr() as usize;
    #[cfg(not(feature = "lockdown"))]
    {
      assert!(arena.lockdown_chunks().next().is_none());
      assert!(arena.mark_lockdown(addr));
    }
    assert!(!arena.mark_lockdown(addr));
    assert_eq!(arena.lockdown_chunks().count(), 1);
    assert!(!arena.mark_lockdown(0x10));

    arena.release_all();
    assert!(arena.lockdown_chunks().next().is_none());
  }
}
