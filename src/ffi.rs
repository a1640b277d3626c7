//! C ABI over the thread-local arena (enabled with `--features c_api`).
//!
//! Counts are signed so that negative values from C callers are rejected instead of wrapping.
//! Every failure returns null.

use core::ptr::null_mut;

use crate::{error::ArenaError, thread};

fn to_count(n: isize) -> Result<usize, ArenaError> {
  match usize::try_from(n) {
    Ok(n) if n > 0 => Ok(n),
    _ => Err(ArenaError::InvalidArgument("count must be positive")),
  }
}

fn into_raw(result: Result<core::ptr::NonNull<u8>, ArenaError>) -> *mut u8 {
  match result {
    Ok(ptr) => ptr.as_ptr(),
    Err(err) => {
      tracing::error!(error = %err, "arena request failed");
      null_mut()
    }
  }
}

#[unsafe(no_mangle)]
pub extern "C" fn arcula_smalloc(bytes: isize) -> *mut u8 {
  into_raw(to_count(bytes).and_then(thread::smalloc))
}

#[unsafe(no_mangle)]
pub extern "C" fn arcula_smalloc_persistent(bytes: isize) -> *mut u8 {
  into_raw(to_count(bytes).and_then(thread::smalloc_persistent))
}

#[unsafe(no_mangle)]
pub extern "C" fn arcula_lalloc(pages: isize) -> *mut u8 {
  into_raw(to_count(pages).and_then(thread::lalloc))
}

/// Returns the KiB released, 0 if the thread has no arena.
#[unsafe(no_mangle)]
pub extern "C" fn arcula_free_all() -> usize {
  thread::free_all().map_or(0, |report| report.kib())
}

#[unsafe(no_mangle)]
pub extern "C" fn arcula_owns(addr: *const u8) -> bool {
  thread::owns(addr as usize)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn negative_and_zero_counts_return_null() {
    std::thread::spawn(|| {
      assert!(arcula_smalloc(-4).is_null());
      assert!(arcula_smalloc(0).is_null());
      assert!(arcula_lalloc(-1).is_null());
      assert!(arcula_smalloc_persistent(isize::MIN).is_null());
      assert!(!crate::thread::is_attached());
    })
    .join()
    .unwrap();
  }

  #[test]
  fn round_trip_through_c_abi() {
    std::thread::spawn(|| {
      let p = arcula_smalloc(10);
      assert!(!p.is_null());
      assert!(arcula_owns(p));
      let pages = arcula_lalloc(2);
      assert!(!pages.is_null());
      assert!(arcula_free_all() >= 8);
      assert!(!arcula_owns(pages));
    })
    .join()
    .unwrap();
  }
}
