//! Process-scoped tracking of persistent regions.
//!
//! A thread's persistent regions move here when its arena is dropped, so they stay mapped and
//! classifiable after the thread is gone. They are unmapped only by `release_persistent`.

use core::{
  cell::UnsafeCell,
  hint,
  ptr::NonNull,
  sync::atomic::{AtomicBool, Ordering},
};

use crate::{
  chunk::{Chunk, ChunkIter, ReleaseReport, TeardownList},
  index::RangeIndex,
  os::{OsMapper, PageMapper},
};

// =============================================================================
// PersistentRegions
// =============================================================================

/// Persistent regions detached from their arena, with their own teardown list and index.
pub struct PersistentRegions {
  chunks: TeardownList,
  index: RangeIndex,
}

// Descriptors live inside the persistent regions themselves; nothing thread-local is referenced.
unsafe impl Send for PersistentRegions {}

impl PersistentRegions {
  pub fn new() -> Self {
    Self {
      chunks: TeardownList::new(),
      index: RangeIndex::new(),
    }
  }

  pub(crate) fn from_parts(chunks: TeardownList, index: RangeIndex) -> Self {
    debug_assert_eq!(chunks.len(), index.len());
    Self { chunks, index }
  }

  #[inline]
  pub fn len(&self) -> usize {
    self.chunks.len()
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.chunks.is_empty()
  }

  pub fn bytes(&self) -> usize {
    self.chunks.iter().map(Chunk::len).sum()
  }

  pub fn find_containing(&self, addr: usize) -> Option<&Chunk> {
    self.index.find_containing(addr)
  }

  #[inline]
  pub fn contains(&self, addr: usize) -> bool {
    self.index.contains(addr)
  }

  pub fn iter(&self) -> ChunkIter<'_> {
    self.chunks.iter()
  }

  /// Take over every region of `other`.
  pub fn absorb(&mut self, mut other: PersistentRegions) {
    other.index.clear();
    let chunks = other.chunks.take();
    for chunk in chunks.iter() {
      unsafe { self.index.insert(NonNull::from(chunk)) };
    }
    self.chunks.splice_front(chunks);
  }

  /// Unmap every region.
  ///
  /// # Safety
  /// No allocation served from these regions may be used afterwards, and `mapper` must be able
  /// to unmap what the owning arena's mapper mapped.
  pub unsafe fn release<M: PageMapper + ?Sized>(&mut self, mapper: &M) -> ReleaseReport {
    self.index.forget();
    self.chunks.release(mapper)
  }
}

impl Default for PersistentRegions {
  fn default() -> Self {
    Self::new()
  }
}

// =============================================================================
// Lock
// =============================================================================

struct SpinLock {
  locked: AtomicBool,
}

impl SpinLock {
  const fn new() -> Self {
    Self {
      locked: AtomicBool::new(false),
    }
  }

  #[inline]
  fn lock(&self) -> SpinGuard<'_> {
    while self
      .locked
      .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_err()
    {
      while self.locked.load(Ordering::Relaxed) {
        hint::spin_loop();
      }
    }
    SpinGuard { lock: self }
  }
}

struct SpinGuard<'a> {
  lock: &'a SpinLock,
}

impl Drop for SpinGuard<'_> {
  #[inline]
  fn drop(&mut self) {
    self.lock.locked.store(false, Ordering::Release);
  }
}

// =============================================================================
// Registry
// =============================================================================

struct Registry {
  lock: SpinLock,
  regions: UnsafeCell<Option<PersistentRegions>>,
}

unsafe impl Sync for Registry {}

impl Registry {
  const fn new() -> Self {
    Self {
      lock: SpinLock::new(),
      regions: UnsafeCell::new(None),
    }
  }

  fn with<R>(&self, f: impl FnOnce(&mut PersistentRegions) -> R) -> R {
    let _guard = self.lock.lock();
    let regions = unsafe { &mut *self.regions.get() };
    f(regions.get_or_insert_with(PersistentRegions::new))
  }
}

static REGISTRY: Registry = Registry::new();

/// Hand persistent regions over to the process.
///
/// `release_persistent` unmaps adopted regions with `OsMapper`, so they must have been mapped
/// by a mapper whose regions `munmap` can release.
pub fn adopt(regions: PersistentRegions) {
  if regions.is_empty() {
    return;
  }
  let (count, bytes) = (regions.len(), regions.bytes());
  REGISTRY.with(|all| all.absorb(regions));
  tracing::debug!(regions = count, bytes, "adopted persistent regions");
}

/// Whether `addr` lies in a persistent region owned by the process.
pub fn persistent_contains(addr: usize) -> bool {
  REGISTRY.with(|all| all.contains(addr))
}

pub fn persistent_region_count() -> usize {
  REGISTRY.with(|all| all.len())
}

/// Unmap every adopted persistent region. Meant for engine shutdown.
///
/// # Safety
/// No persistent allocation of any thread may be used afterwards.
pub unsafe fn release_persistent() -> ReleaseReport {
  let mut regions = REGISTRY.with(|all| core::mem::take(all));
  let report = unsafe { regions.release(&OsMapper::new()) };
  tracing::info!(
    kib_freed = report.kib(),
    regions = report.regions,
    failures = report.failures,
    "released persistent regions"
  );
  report
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::arena::ThreadArena;
  use crate::config::{ArenaConfig, next_thread_hint};

  fn arena() -> ThreadArena {
    ThreadArena::with_config(ArenaConfig::new().with_region_pages(1), next_thread_hint()).unwrap()
  }

  #[test]
  fn absorb_reindexes_and_keeps_order() {
    let mut a = arena();
    let mut b = arena();
    let pa = a.alloc_persistent(16).unwrap().as_ptr() as usize;
    let ps = a.page_size();
    let pb1 = b.alloc_persistent(16).unwrap().as_ptr() as usize;
    let pb2 = b.alloc_persistent(2 * ps).unwrap().as_ptr() as usize;

    let mut all = a.take_persistent();
    let from_b = b.take_persistent();
    let order: Vec<usize> = from_b.iter().map(Chunk::begin).collect();
    all.absorb(from_b);

    assert_eq!(all.len(), 3);
    assert!(all.contains(pa) && all.contains(pb1) && all.contains(pb2));
    let merged: Vec<usize> = all.iter().take(2).map(Chunk::begin).collect();
    assert_eq!(merged, order);

    let report = unsafe { all.release(a.mapper()) };
    assert_eq!(report.regions, 3);
    assert_eq!(report.failures, 0);
    assert!(all.is_empty());
    assert!(!all.contains(pa));
  }

  #[test]
  fn dropped_arena_hands_regions_to_process() {
    let mut arena = arena();
    let p = arena.alloc_persistent(24).unwrap();
    unsafe { p.as_ptr().write_bytes(7, 24) };
    drop(arena);

    let addr = p.as_ptr() as usize;
    assert!(persistent_contains(addr));
    assert!(persistent_region_count() >= 1);
    assert_eq!(unsafe { *p.as_ptr().add(23) }, 7);
  }
}
