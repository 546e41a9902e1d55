//! # feedsync
//!
//! Optimistic mutations and real-time reconciliation for a social feed
//! client.
//!
//! ## Core Concepts
//!
//! - **Cache**: last-known-good entity state; every view reads through it
//! - **Registry**: per-`(topic, entity)` publish/subscribe that merges each
//!   delta into the cache before delivery
//! - **Mutations**: speculate, commit, reconcile; rollback on failure
//! - **Views**: feed paginators and comment trees holding ids and order
//! - **Media**: at most one playing element at a time
//!
//! ## Example
//!
//! ```ignore
//! use feedsync::{Engine, EngineConfig, Intent, RecordingNotices};
//!
//! let notices = Arc::new(RecordingNotices::new());
//! let engine = Engine::new(EngineConfig::default(), notices.clone());
//!
//! let feed = engine.home_feed();
//! feed.load_more(&page_source)?;
//!
//! // Likes show up in every view at once, then confirm or roll back.
//! engine.mutations().execute(Intent::ToggleLike("p1".into()), None, api)?;
//!
//! // Push traffic goes through the same path.
//! engine.handle_frame(&frame, FrameEncoding::Json)?;
//! ```

pub mod api;
pub mod cache;
pub mod comments;
pub mod engine;
pub mod error;
pub mod feed;
pub mod media;
pub mod mutations;
pub mod push;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use api::{
    BlockResponse, CommandApi, FollowResponse, LikeResponse, Page, PageSource, RepostResponse,
    Resource,
};
pub use cache::{CacheConfig, CacheOutcome, EntityCache, PinnedField};
pub use comments::{CommentConfig, CommentNode, CommentTree, NodeState};
pub use engine::{Engine, EngineConfig};
pub use error::{FailureKind, FeedError, RemoteError, Result};
pub use feed::{FeedPaginator, PageRequest, PaginatorConfig, PaginatorState};
pub use media::{ElementId, MediaRegistration, PlaybackChange, PlaybackCoordinator};
pub use mutations::{
    Confirmation, Field, FieldValue, Intent, MutationConfig, MutationController, MutationOutcome,
    Notice, NoticeSink, OriginId, Overlay, PendingMutation, RecordingNotices, Target,
};
pub use push::{FrameEncoding, PushEvent, PushRouter, RoomTracker};
pub use subscriptions::{
    Callback, ChannelKey, ChannelMessage, Delta, DropReason, EntityEvent, PublishOutcome,
    SubscriptionGuard, SubscriptionHandle, SubscriptionRegistry, SubscriptionToken, Topic,
};
pub use types::*;
