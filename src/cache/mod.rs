//! Entity cache: last-known-good state of posts, comments and relationships.
//!
//! The cache is the single source of truth every view reads through. Views
//! hold only ids and order; a field update is one cache write.
//!
//! Writes are guarded two ways:
//! - Push events carry a server-implied version; a patch whose version is
//!   not newer than the cached one is dropped (out-of-order delivery).
//! - Removal is terminal. Removed ids are remembered in a bounded tombstone
//!   set and any later write referencing them is ignored.
//!
//! Fields with a local write in flight are pinned: a full entity arriving
//! from a page fetch keeps the speculative value of a pinned field.

mod entities;

pub use entities::{CacheConfig, CacheOutcome, EntityCache, PinnedField};
