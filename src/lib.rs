#![allow(clippy::missing_safety_doc)]

//! Per-thread memory arenas for runtime metadata.
//!
//! Each thread owns a [`ThreadArena`] with three entry points:
//! - [`ThreadArena::alloc_transient`]: small blocks reclaimed when the thread ends,
//! - [`ThreadArena::alloc_persistent`]: small blocks that outlive the thread,
//! - [`ThreadArena::alloc_pages`]: whole page-aligned regions.
//!
//! Every mapped region is described by a [`Chunk`] that sits on a teardown list and in a
//! [`RangeIndex`], so any address can later be classified as arena-owned or not.
//! [`ThreadArena::release_all`] unmaps all transient regions at once; individual blocks are
//! never freed.

pub mod arena;
pub mod chunk;
pub mod config;
pub mod error;
pub mod index;
pub mod os;
pub mod persistent;
pub mod thread;

#[cfg(feature = "c_api")]
pub mod ffi;

pub use arena::{ArenaStats, DescriptorSlot, Lifetime, ThreadArena, place_descriptor, region_len_for};
pub use chunk::{CHUNK_ALIGN, CHUNK_SIZE, Chunk, ChunkFlags, ReleaseReport};
pub use config::{ALLOC_ALIGN, ArenaConfig, DEFAULT_REGION_PAGES, Placement, next_thread_hint};
pub use error::ArenaError;
pub use index::RangeIndex;
pub use os::{OsMapper, PageMapper};
pub use persistent::{PersistentRegions, persistent_contains, persistent_region_count, release_persistent};
