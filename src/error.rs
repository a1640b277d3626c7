use std::io;

use thiserror::Error;

/// Failure of an arena entry point.
///
/// `InvalidArgument` is raised before any state is touched. `OutOfMemory` leaves cursors,
/// free counts, the map hint and all bookkeeping exactly as they were before the call, apart
/// from the map failure counter. `Unavailable` only comes from the thread-local entry points.
#[derive(Debug, Error)]
pub enum ArenaError {
  #[error("invalid argument: {0}")]
  InvalidArgument(&'static str),

  #[error("out of memory: mapping {len} bytes near {hint:#x} failed: {source}")]
  OutOfMemory {
    len: usize,
    hint: usize,
    #[source]
    source: io::Error,
  },

  #[error("thread arena unavailable: {0}")]
  Unavailable(&'static str),
}

impl ArenaError {
  pub fn is_out_of_memory(&self) -> bool {
    matches!(self, ArenaError::OutOfMemory { .. })
  }

  pub fn is_invalid_argument(&self) -> bool {
    matches!(self, ArenaError::InvalidArgument(_))
  }

  pub fn is_unavailable(&self) -> bool {
    matches!(self, ArenaError::Unavailable(_))
  }
}
