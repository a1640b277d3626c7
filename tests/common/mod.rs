#![allow(dead_code)]

use std::{
  cell::{Cell, RefCell},
  io,
  ptr::NonNull,
  rc::Rc,
};

use arcula::{ArenaConfig, OsMapper, PageMapper, Placement, ThreadArena, next_thread_hint};

#[derive(Default)]
pub struct Journal {
  /// Successful maps left before every further map fails. `None` = unlimited.
  maps_left: Cell<Option<usize>>,
  /// Unmaps of this address report an error (the range stays mapped).
  fail_unmap_at: Cell<Option<usize>>,
  pub mapped: RefCell<Vec<(usize, usize)>>,
  pub unmapped: RefCell<Vec<(usize, usize)>>,
  pub failed_maps: Cell<usize>,
}

/// `OsMapper` wrapper that records traffic and injects failures.
#[derive(Clone, Default)]
pub struct TestMapper {
  inner: OsMapper,
  pub journal: Rc<Journal>,
}

impl TestMapper {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn fail_after(&self, maps: usize) {
    self.journal.maps_left.set(Some(maps));
  }

  pub fn fail_unmap_at(&self, addr: usize) {
    self.journal.fail_unmap_at.set(Some(addr));
  }

  pub fn map_count(&self) -> usize {
    self.journal.mapped.borrow().len()
  }

  pub fn unmap_count(&self) -> usize {
    self.journal.unmapped.borrow().len()
  }
}

impl PageMapper for TestMapper {
  fn page_size(&self) -> usize {
    self.inner.page_size()
  }

  fn map(&self, hint: usize, len: usize, placement: Placement) -> io::Result<NonNull<u8>> {
    if let Some(left) = self.journal.maps_left.get() {
      if left == 0 {
        self.journal.failed_maps.set(self.journal.failed_maps.get() + 1);
        return Err(io::Error::from_raw_os_error(libc::ENOMEM));
      }
      self.journal.maps_left.set(Some(left - 1));
    }
    let ptr = self.inner.map(hint, len, placement)?;
    self.journal.mapped.borrow_mut().push((ptr.as_ptr() as usize, len));
    Ok(ptr)
  }

  unsafe fn unmap(&self, addr: NonNull<u8>, len: usize) -> io::Result<()> {
    if self.journal.fail_unmap_at.get() == Some(addr.as_ptr() as usize) {
      return Err(io::Error::from_raw_os_error(libc::EINVAL));
    }
    unsafe { self.inner.unmap(addr, len)? };
    self.journal.unmapped.borrow_mut().push((addr.as_ptr() as usize, len));
    Ok(())
  }
}

pub fn test_arena(region_pages: usize) -> (ThreadArena<TestMapper>, TestMapper) {
  let mapper = TestMapper::new();
  let config = ArenaConfig::new().with_region_pages(region_pages);
  let arena = ThreadArena::with_mapper(config, next_thread_hint(), mapper.clone()).unwrap();
  (arena, mapper)
}
