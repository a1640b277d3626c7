use core::ptr::NonNull;
use std::io;

use crate::config::Placement;

/// Fallback when `sysconf` cannot report a page size.
const FALLBACK_PAGE_SIZE: usize = 4096;

/// Operating-system memory-mapping service used by the arenas.
///
/// Regions are anonymous, private and read-write. Both calls work at page granularity: `len`
/// is always a non-zero multiple of `page_size()`.
pub trait PageMapper {
  fn page_size(&self) -> usize;

  /// Map `len` bytes, preferably at `hint`. A zero hint lets the OS choose.
  fn map(&self, hint: usize, len: usize, placement: Placement) -> io::Result<NonNull<u8>>;

  /// Release a range previously returned by `map`.
  ///
  /// # Safety
  /// `[addr, addr + len)` must have been mapped by this mapper and nothing may access it
  /// afterwards.
  unsafe fn unmap(&self, addr: NonNull<u8>, len: usize) -> io::Result<()>;
}

// =============================================================================
// Platform
// =============================================================================

/// `PageMapper` backed by `mmap`/`munmap`.
#[derive(Clone, Copy, Debug)]
pub struct OsMapper {
  page_size: usize,
}

impl OsMapper {
  pub fn new() -> Self {
    Self {
      page_size: os_page_size(),
    }
  }
}

impl Default for OsMapper {
  fn default() -> Self {
    Self::new()
  }
}

impl PageMapper for OsMapper {
  #[inline]
  fn page_size(&self) -> usize {
    self.page_size
  }

  fn map(&self, hint: usize, len: usize, placement: Placement) -> io::Result<NonNull<u8>> {
    debug_assert!(len > 0 && len % self.page_size == 0);
    match placement {
      Placement::Hint => unsafe { os_mmap(hint, len, 0) },
      Placement::Fixed => unsafe { os_mmap_fixed(hint, len) },
    }
  }

  unsafe fn unmap(&self, addr: NonNull<u8>, len: usize) -> io::Result<()> {
    unsafe { os_munmap(addr.as_ptr(), len) }
  }
}

fn os_page_size() -> usize {
  let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
  if size <= 0 {
    FALLBACK_PAGE_SIZE
  } else {
    size as usize
  }
}

unsafe fn os_mmap(hint: usize, len: usize, extra_flags: libc::c_int) -> io::Result<NonNull<u8>> {
  let ptr = unsafe {
    libc::mmap(
      hint as *mut libc::c_void,
      len,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | extra_flags,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    return Err(io::Error::last_os_error());
  }
  NonNull::new(ptr as *mut u8)
    .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))
}

#[cfg(any(target_os = "linux", target_os = "android"))]
const FIXED_FLAGS: libc::c_int = libc::MAP_FIXED_NOREPLACE;

// Without MAP_FIXED_NOREPLACE a plain hint is requested and the result checked below.
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const FIXED_FLAGS: libc::c_int = 0;

unsafe fn os_mmap_fixed(hint: usize, len: usize) -> io::Result<NonNull<u8>> {
  if hint == 0 {
    return Err(io::Error::new(
      io::ErrorKind::InvalidInput,
      "fixed placement needs a non-null address",
    ));
  }

  let mapped = unsafe { os_mmap(hint, len, FIXED_FLAGS)? };

  // Kernels older than 4.17 treat MAP_FIXED_NOREPLACE as a hint.
  if mapped.as_ptr() as usize != hint {
    if let Err(err) = unsafe { os_munmap(mapped.as_ptr(), len) } {
      tracing::warn!(region = ?mapped, len, error = %err, "failed to unmap misplaced region");
    }
    return Err(io::Error::new(
      io::ErrorKind::AddrInUse,
      format!("region placed at {:p} instead of {hint:#x}", mapped.as_ptr()),
    ));
  }
  Ok(mapped)
}

unsafe fn os_munmap(ptr: *mut u8, len: usize) -> io::Result<()> {
  if unsafe { libc::munmap(ptr.cast(), len) } != 0 {
    return Err(io::Error::last_os_error());
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn page_size_is_power_of_two() {
    let mapper = OsMapper::new();
    assert!(mapper.page_size().is_power_of_two());
  }

  #[test]
  fn map_write_unmap() {
    let mapper = OsMapper::new();
    let len = mapper.page_size() * 2;
    let ptr = mapper.map(0, len, Placement::Hint).unwrap();
    assert_eq!(ptr.as_ptr() as usize % mapper.page_size(), 0);
    unsafe {
      ptr.as_ptr().write_bytes(0xAB, len);
      assert_eq!(*ptr.as_ptr().add(len - 1), 0xAB);
      mapper.unmap(ptr, len).unwrap();
    }
  }

  #[test]
  fn fixed_placement_without_address_fails() {
    let mapper = OsMapper::new();
    let err = mapper.map(0, mapper.page_size(), Placement::Fixed).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
  }

  #[test]
  fn fixed_placement_refuses_occupied_range() {
    let mapper = OsMapper::new();
    let len = mapper.page_size();
    let first = mapper.map(0, len, Placement::Hint).unwrap();
    let second = mapper.map(first.as_ptr() as usize, len, Placement::Fixed);
    assert!(second.is_err());
    unsafe { mapper.unmap(first, len).unwrap() };
  }
}
