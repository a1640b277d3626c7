//! Thread-local arena for the calling thread.
//!
//! The arena is created on first use with `next_thread_hint()` and the default configuration,
//! unless `attach` chose otherwise. When the thread exits the arena is dropped: transient and
//! page regions are unmapped and persistent regions are handed to the process registry.

use core::{cell::RefCell, ptr::NonNull};

use crate::{
  arena::ThreadArena,
  chunk::ReleaseReport,
  config::{ArenaConfig, next_thread_hint},
  error::ArenaError,
  persistent,
};

thread_local! {
  static ARENA: RefCell<Option<ThreadArena>> = const { RefCell::new(None) };
}

const TLS_DESTROYED: &str = "thread-local storage already destroyed";
const IN_USE: &str = "arena already in use on this thread";

/// Run `f` on this thread's arena slot.
///
/// Fails instead of panicking once the thread's TLS is torn down (e.g. from another
/// thread-local's destructor) or when called from inside another arena call.
fn with_slot<R>(f: impl FnOnce(&mut Option<ThreadArena>) -> R) -> Result<R, ArenaError> {
  ARENA
    .try_with(|cell| {
      let mut slot = cell.try_borrow_mut().map_err(|_| ArenaError::Unavailable(IN_USE))?;
      Ok(f(&mut slot))
    })
    .map_err(|_| ArenaError::Unavailable(TLS_DESTROYED))?
}

/// Set up this thread's arena explicitly.
///
/// Returns `Ok(false)` and changes nothing if the thread already has one.
pub fn attach(config: ArenaConfig, next_map_hint: usize) -> Result<bool, ArenaError> {
  with_slot(|slot| -> Result<bool, ArenaError> {
    if slot.is_some() {
      return Ok(false);
    }
    *slot = Some(ThreadArena::with_config(config, next_map_hint)?);
    Ok(true)
  })?
}

pub fn is_attached() -> bool {
  // The slot is only borrowed while a call runs against an existing arena.
  ARENA
    .try_with(|cell| cell.try_borrow().map_or(true, |slot| slot.is_some()))
    .unwrap_or(false)
}

/// Run `f` against this thread's arena, creating it if needed.
pub fn with_thread_arena<R>(f: impl FnOnce(&mut ThreadArena) -> R) -> Result<R, ArenaError> {
  with_slot(|slot| f(slot.get_or_insert_with(|| ThreadArena::new(next_thread_hint()))))
}

/// Transient allocation from this thread's arena.
pub fn smalloc(bytes: usize) -> Result<NonNull<u8>, ArenaError> {
  with_thread_arena(|arena| arena.alloc_transient(bytes))?
}

/// Persistent allocation from this thread's arena.
pub fn smalloc_persistent(bytes: usize) -> Result<NonNull<u8>, ArenaError> {
  with_thread_arena(|arena| arena.alloc_persistent(bytes))?
}

/// Fresh page region from this thread's arena.
pub fn lalloc(pages: usize) -> Result<NonNull<u8>, ArenaError> {
  with_thread_arena(|arena| arena.alloc_pages(pages))?
}

/// Bulk release of this thread's transient memory.
///
/// `None` if the thread has no arena, including once its TLS has been torn down.
pub fn free_all() -> Option<ReleaseReport> {
  with_slot(|slot| slot.as_mut().map(ThreadArena::release_all)).ok().flatten()
}

/// Whether `addr` belongs to this thread's arena or to an adopted persistent region.
pub fn owns(addr: usize) -> bool {
  let local = with_slot(|slot| slot.as_ref().is_some_and(|arena| arena.owns(addr))).unwrap_or(false);
  local || persistent::persistent_contains(addr)
}

/// Drop this thread's arena now instead of at thread exit.
pub fn detach() -> Option<ReleaseReport> {
  let arena = with_slot(Option::take).ok().flatten();
  arena.map(|mut arena| {
    let report = arena.release_all();
    drop(arena);
    report
  })
}
