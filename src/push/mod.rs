//! Push channel: decoding server events and routing them into the
//! subscription registry.
//!
//! Frames arrive as JSON or MessagePack, both shaped as
//! `{"event": "<name>", "data": {...}}`. The router turns each event into
//! one or more registry publishes; version guards in the cache drop
//! anything stale.

mod router;
mod types;

pub use router::{PushRouter, RoomTracker};
pub use types::{FrameEncoding, PushEvent};
