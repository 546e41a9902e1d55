//! Incremental feed loading merged with live inserts.
//!
//! A feed holds ids and order only; entity fields live in the cache. Live
//! items arriving while the viewer is scrolled away from the top wait in a
//! pending buffer until revealed.

mod paginator;

pub use paginator::{FeedPaginator, PageRequest, PaginatorConfig, PaginatorState};
