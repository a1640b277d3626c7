use core::{
  fmt,
  mem::{align_of, size_of},
  ptr::NonNull,
};

use intrusive_collections::{
  SinglyLinkedList, SinglyLinkedListLink, UnsafeRef, intrusive_adapter, rbtree, singly_linked_list,
};

use crate::os::PageMapper;

/// Bytes needed to embed one descriptor.
pub const CHUNK_SIZE: usize = size_of::<Chunk>();
pub const CHUNK_ALIGN: usize = align_of::<Chunk>();

const _: () = assert!(CHUNK_SIZE % CHUNK_ALIGN == 0);
const _: () = assert!(CHUNK_ALIGN >= crate::config::ALLOC_ALIGN);

// =============================================================================
// Flags
// =============================================================================

#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct ChunkFlags(u8);

impl ChunkFlags {
  pub const NONE: Self = Self(0);
  /// Describes a whole mapped region.
  pub const REGION: Self = Self(1 << 0);
  /// Backs the persistent arena.
  pub const PERSISTENT: Self = Self(1 << 1);
  /// Multi-page region handed out as a whole.
  pub const PAGES: Self = Self(1 << 2);

  #[inline]
  pub const fn union(self, other: Self) -> Self {
    Self(self.0 | other.0)
  }

  #[inline]
  pub const fn contains(self, other: Self) -> bool {
    self.0 & other.0 == other.0
  }

  #[inline]
  pub const fn bits(self) -> u8 {
    self.0
  }
}

impl fmt::Debug for ChunkFlags {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut set = f.debug_set();
    if self.contains(Self::REGION) {
      set.entry(&"REGION");
    }
    if self.contains(Self::PERSISTENT) {
      set.entry(&"PERSISTENT");
    }
    if self.contains(Self::PAGES) {
      set.entry(&"PAGES");
    }
    set.finish()
  }
}

// =============================================================================
// Chunk
// =============================================================================

/// Descriptor of one mapped range `[begin, end)`.
///
/// A chunk lives either inside the region it describes or inside older arena memory. It is
/// written once when the region is mapped; afterwards only its links change. The teardown
/// list, the lockdown list and the range index all thread through the same record and hold
/// only `UnsafeRef`s to it.
#[repr(C)]
pub struct Chunk {
  begin: usize,
  end: usize,
  flags: ChunkFlags,
  teardown_link: SinglyLinkedListLink,
  lockdown_link: SinglyLinkedListLink,
  pub(crate) tree_link: rbtree::Link,
}

intrusive_adapter!(pub TeardownAdapter = UnsafeRef<Chunk>: Chunk { teardown_link: SinglyLinkedListLink });
intrusive_adapter!(pub LockdownAdapter = UnsafeRef<Chunk>: Chunk { lockdown_link: SinglyLinkedListLink });

pub type ChunkIter<'a> = singly_linked_list::Iter<'a, TeardownAdapter>;
pub type LockdownIter<'a> = singly_linked_list::Iter<'a, LockdownAdapter>;

impl Chunk {
  /// Write a fresh, unlinked descriptor for `[begin, begin + len)` at `slot`.
  ///
  /// # Safety
  /// `slot` must be writable for `CHUNK_SIZE` bytes, aligned to `CHUNK_ALIGN`, and stay mapped
  /// for as long as the chunk is linked anywhere.
  pub(crate) unsafe fn init(slot: usize, begin: usize, len: usize, flags: ChunkFlags) -> NonNull<Chunk> {
    debug_assert!(len > 0);
    debug_assert!(slot % CHUNK_ALIGN == 0);
    let chunk = slot as *mut Chunk;
    unsafe {
      chunk.write(Chunk {
        begin,
        end: begin + len,
        flags,
        teardown_link: SinglyLinkedListLink::new(),
        lockdown_link: SinglyLinkedListLink::new(),
        tree_link: rbtree::Link::new(),
      });
      NonNull::new_unchecked(chunk)
    }
  }

  #[inline]
  pub fn begin(&self) -> usize {
    self.begin
  }

  #[inline]
  pub fn end(&self) -> usize {
    self.end
  }

  // Never empty: every chunk covers at least one page.
  #[allow(clippy::len_without_is_empty)]
  #[inline]
  pub fn len(&self) -> usize {
    self.end - self.begin
  }

  #[inline]
  pub fn flags(&self) -> ChunkFlags {
    self.flags
  }

  #[inline]
  pub fn contains(&self, addr: usize) -> bool {
    addr >= self.begin && addr < self.end
  }

  #[inline]
  pub fn overlaps(&self, other: &Chunk) -> bool {
    self.begin < other.end && other.begin < self.end
  }

  /// Address of the descriptor itself.
  #[inline]
  pub fn descriptor_addr(&self) -> usize {
    self as *const Chunk as usize
  }
}

impl fmt::Debug for Chunk {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Chunk")
      .field("begin", &format_args!("{:#x}", self.begin))
      .field("end", &format_args!("{:#x}", self.end))
      .field("flags", &self.flags)
      .finish()
  }
}

// =============================================================================
// Release report
// =============================================================================

/// Outcome of unmapping a teardown list.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReleaseReport {
  pub regions: usize,
  pub bytes: usize,
  pub failures: usize,
}

impl ReleaseReport {
  #[inline]
  pub fn kib(&self) -> usize {
    self.bytes >> 10
  }

  pub fn merge(&mut self, other: ReleaseReport) {
    self.regions += other.regions;
    self.bytes += other.bytes;
    self.failures += other.failures;
  }
}

// =============================================================================
// Teardown list
// =============================================================================

/// Every chunk owned by one arena lifetime, newest first.
///
/// A descriptor always lives in its own region or in a region pushed before it, so popping
/// from the front releases every region after all descriptors stored in it were read.
pub struct TeardownList {
  list: SinglyLinkedList<TeardownAdapter>,
  len: usize,
}

impl TeardownList {
  pub fn new() -> Self {
    Self {
      list: SinglyLinkedList::new(TeardownAdapter::new()),
      len: 0,
    }
  }

  #[inline]
  pub fn len(&self) -> usize {
    self.len
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.list.is_empty()
  }

  /// # Safety
  /// `chunk` must be a live descriptor that is on no teardown list.
  pub(crate) unsafe fn push(&mut self, chunk: NonNull<Chunk>) {
    self.list.push_front(unsafe { UnsafeRef::from_raw(chunk.as_ptr()) });
    self.len += 1;
  }

  /// Detach the whole list, leaving this one empty.
  pub(crate) fn take(&mut self) -> TeardownList {
    core::mem::take(self)
  }

  /// Put `other` in front of this list, keeping its internal order.
  pub(crate) fn splice_front(&mut self, other: TeardownList) {
    let TeardownList { list, len } = other;
    if list.is_empty() {
      return;
    }
    // A cursor on the null object splices at the start.
    self.list.cursor_mut().splice_after(list);
    self.len += len;
  }

  pub fn iter(&self) -> ChunkIter<'_> {
    self.list.iter()
  }

  /// Unmap every region on the list, emptying it.
  ///
  /// Each chunk is popped, and so the next one located, before its region goes away, since
  /// the descriptor may live inside the memory being unmapped. Unmap failures are counted and
  /// the walk continues.
  pub(crate) fn release<M: PageMapper + ?Sized>(&mut self, mapper: &M) -> ReleaseReport {
    let mut report = ReleaseReport::default();
    self.len = 0;

    while let Some(chunk) = self.list.pop_front() {
      let (addr, len) = (chunk.begin, chunk.len());
      // SAFETY: `begin` is the non-null address the region was mapped at.
      let region = unsafe { NonNull::new_unchecked(addr as *mut u8) };
      match unsafe { mapper.unmap(region, len) } {
        Ok(()) => {
          report.regions += 1;
          report.bytes += len;
        }
        Err(err) => {
          report.failures += 1;
          tracing::warn!(?region, len, error = %err, "failed to unmap region");
        }
      }
    }
    report
  }
}

impl Default for TeardownList {
  fn default() -> Self {
    Self::new()
  }
}

// =============================================================================
// Lockdown list
// =============================================================================

/// Chunks whose memory a hardening layer may later mark read-only.
pub struct LockdownList {
  list: SinglyLinkedList<LockdownAdapter>,
  len: usize,
}

impl LockdownList {
  pub fn new() -> Self {
    Self {
      list: SinglyLinkedList::new(LockdownAdapter::new()),
      len: 0,
    }
  }

  #[inline]
  pub fn len(&self) -> usize {
    self.len
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.list.is_empty()
  }

  pub fn contains(&self, chunk: &Chunk) -> bool {
    self.iter().any(|c| core::ptr::eq(c, chunk))
  }

  /// Link `chunk` unless it is already on a lockdown list. Returns whether it was linked.
  ///
  /// # Safety
  /// `chunk` must stay live for as long as the list is.
  pub(crate) unsafe fn link(&mut self, chunk: NonNull<Chunk>) -> bool {
    if unsafe { chunk.as_ref() }.lockdown_link.is_linked() {
      return false;
    }
    self.list.push_front(unsafe { UnsafeRef::from_raw(chunk.as_ptr()) });
    self.len += 1;
    true
  }

  /// Drop every entry without touching the chunks, whose memory may already be gone.
  pub(crate) fn forget(&mut self) {
    self.list.fast_clear();
    self.len = 0;
  }

  pub fn iter(&self) -> LockdownIter<'_> {
    self.list.iter()
  }
}

impl Default for LockdownList {
  fn default() -> Self {
    Self::new()
  }
}
