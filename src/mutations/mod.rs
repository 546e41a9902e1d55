//! Optimistic mutations.
//!
//! Every user action runs as three phases:
//!
//! 1. **Speculate** (`begin`): reject if the same `(target, field)` already
//!    has a live overlay, otherwise record the previous value in an overlay
//!    and publish the speculative value so every view updates at once.
//! 2. **Commit**: the caller issues the remote request. This is the only
//!    suspension point.
//! 3. **Reconcile** (`complete`): publish the confirmed value, or restore
//!    the previous one and raise a notice.
//!
//! A request that outlives the commit window is rolled back by
//! `expire_overdue`; its late response finds no overlay and is discarded.

mod controller;
mod types;

pub use controller::{MutationConfig, MutationController};
pub use types::{
    Confirmation, Field, FieldValue, Intent, MutationOutcome, Notice, NoticeSink, OriginId,
    Overlay, PendingMutation, RecordingNotices, Target,
};
