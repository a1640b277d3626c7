use core::sync::atomic::{AtomicUsize, Ordering};

use crate::error::ArenaError;

// =============================================================================
// Constants
// =============================================================================

/// Preferred size of a small-arena backing region, in pages.
pub const DEFAULT_REGION_PAGES: usize = 4;

/// Granularity of small allocations. Keeps metadata carved from the arenas naturally aligned.
pub const ALLOC_ALIGN: usize = 4;

/// Top of the address window handed to the first thread.
#[cfg(target_pointer_width = "64")]
pub const HINT_BASE: usize = 0x5000_0000_0000;
/// Address space reserved for each thread below `HINT_BASE` (64GB).
#[cfg(target_pointer_width = "64")]
pub const HINT_WINDOW: usize = 1 << 36;

#[cfg(not(target_pointer_width = "64"))]
pub const HINT_BASE: usize = 0xB000_0000;
#[cfg(not(target_pointer_width = "64"))]
pub const HINT_WINDOW: usize = 1 << 24; // 16MB

const _: () = assert!(ALLOC_ALIGN.is_power_of_two());
const _: () = assert!(HINT_WINDOW.is_power_of_two());
const _: () = assert!(DEFAULT_REGION_PAGES >= 1);

// =============================================================================
// Placement
// =============================================================================

/// How strictly a mapping request must honor the address hint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Placement {
  /// Best effort. The OS may place the region anywhere; the range index stays authoritative.
  #[default]
  Hint,
  /// The region must land exactly at the hint. Anything else is reported as out of memory.
  Fixed,
}

// =============================================================================
// ArenaConfig
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArenaConfig {
  region_pages: usize,
  placement: Placement,
}

impl Default for ArenaConfig {
  fn default() -> Self {
    Self {
      region_pages: DEFAULT_REGION_PAGES,
      placement: Placement::Hint,
    }
  }
}

impl ArenaConfig {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_region_pages(mut self, pages: usize) -> Self {
    self.region_pages = pages;
    self
  }

  pub fn with_placement(mut self, placement: Placement) -> Self {
    self.placement = placement;
    self
  }

  pub fn region_pages(&self) -> usize {
    self.region_pages
  }

  pub fn placement(&self) -> Placement {
    self.placement
  }

  pub fn validate(&self) -> Result<(), ArenaError> {
    if self.region_pages == 0 {
      return Err(ArenaError::InvalidArgument("region_pages must be at least 1"));
    }
    Ok(())
  }
}

// =============================================================================
// Per-thread map hints
// =============================================================================

/// Returns the initial map hint for a new thread.
///
/// Every call claims the next window below `HINT_BASE`, so regions laid out downward by
/// different threads start from disjoint parts of the address space. Once the windows are
/// exhausted the hint wraps to the top again; with `Placement::Hint` the OS resolves any
/// overlap by placing the region elsewhere.
pub fn next_thread_hint() -> usize {
  static SLOT: AtomicUsize = AtomicUsize::new(0);
  const SLOTS: usize = HINT_BASE / HINT_WINDOW;
  let slot = SLOT.fetch_add(1, Ordering::Relaxed) % SLOTS; // uniqueness only
  HINT_BASE - slot * HINT_WINDOW
}
