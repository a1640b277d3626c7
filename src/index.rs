//! Ordered index over chunk ranges.
//!
//! A red-black tree keyed by `Chunk::begin`, threaded through the chunks themselves. Ranges
//! within one index are pairwise disjoint, so ordering by start address is enough to answer
//! containment queries. Nodes are never removed one by one; the whole index is dropped at once
//! together with the memory it points into.

use core::ptr::NonNull;

use intrusive_collections::{Bound, KeyAdapter, PointerOps, RBTree, UnsafeRef, intrusive_adapter, rbtree};

use crate::chunk::Chunk;

intrusive_adapter!(pub ChunkTreeAdapter = UnsafeRef<Chunk>: Chunk { tree_link: rbtree::Link });

impl<'a> KeyAdapter<'a> for ChunkTreeAdapter {
  type Key = usize;

  fn get_key(&self, chunk: &'a <Self::PointerOps as PointerOps>::Value) -> usize {
    chunk.begin()
  }
}

pub type IndexIter<'a> = rbtree::Iter<'a, ChunkTreeAdapter>;

pub struct RangeIndex {
  tree: RBTree<ChunkTreeAdapter>,
  len: usize,
}

impl RangeIndex {
  pub fn new() -> Self {
    Self {
      tree: RBTree::new(ChunkTreeAdapter::new()),
      len: 0,
    }
  }

  #[inline]
  pub fn len(&self) -> usize {
    self.len
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.tree.is_empty()
  }

  /// Insert a freshly initialized chunk.
  ///
  /// # Safety
  /// `chunk` must be live, not yet part of any index, and must not overlap a chunk already in
  /// this index.
  pub(crate) unsafe fn insert(&mut self, chunk: NonNull<Chunk>) {
    debug_assert!(
      {
        let new = unsafe { chunk.as_ref() };
        self.find_containing(new.begin()).is_none()
          && self
            .tree
            .lower_bound(Bound::Included(&new.begin()))
            .get()
            .is_none_or(|next| next.begin() >= new.end())
      },
      "RangeIndex::insert: {:?} overlaps a tracked range",
      unsafe { chunk.as_ref() }
    );
    self.tree.insert(unsafe { UnsafeRef::from_raw(chunk.as_ptr()) });
    self.len += 1;
  }

  /// Chunk whose range contains `addr`, if any.
  pub fn find_containing(&self, addr: usize) -> Option<&Chunk> {
    // Last chunk starting at or below `addr`; it is the only candidate.
    self
      .tree
      .upper_bound(Bound::Included(&addr))
      .get()
      .filter(|chunk| addr < chunk.end())
  }

  #[inline]
  pub fn contains(&self, addr: usize) -> bool {
    self.find_containing(addr).is_some()
  }

  /// Chunks in ascending address order.
  pub fn iter(&self) -> IndexIter<'_> {
    self.tree.iter()
  }

  /// Unlink every chunk. They must all still be mapped.
  pub(crate) fn clear(&mut self) {
    self.tree.clear();
    self.len = 0;
  }

  /// Drop every entry without touching the chunks, whose memory may already be gone.
  pub(crate) fn forget(&mut self) {
    self.tree.fast_clear();
    self.len = 0;
  }
}

impl Default for RangeIndex {
  fn default() -> Self {
    Self::new()
  }
}
