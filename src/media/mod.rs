//! Single-active media playback arbitration.
//!
//! Mounted media elements register with an autoplay intent and report
//! viewport visibility. The coordinator picks at most one element to play
//! and returns the start/stop transitions for the presentation layer to
//! apply. It never touches the media itself.
//!
//! Selection order among visible candidates:
//! 1. an element the user explicitly played,
//! 2. the most recently visible element with autoplay intent,
//! 3. on ties, the earlier registration.

mod coordinator;

pub use coordinator::{ElementId, MediaRegistration, PlaybackChange, PlaybackCoordinator};
