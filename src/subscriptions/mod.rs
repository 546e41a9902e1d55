//! Scoped publish/subscribe for entity changes.
//!
//! Events are routed by `(topic, entity_id)` channel:
//! - `Post`: updates of one post (counters, content, deletion)
//! - `PostComments`: comments and replies under one post
//! - `Feed`: new items for a feed scope
//! - `User`: viewer relationship with one user
//!
//! Every publish applies its delta to the [`EntityCache`](crate::cache::EntityCache)
//! first, then hands the post-merge value to subscribers. Subscribers are
//! either callbacks (push model) or bounded channels (pull model).
//!
//! # Example
//!
//! ```ignore
//! let registry = Arc::new(SubscriptionRegistry::new(cache));
//!
//! let token = registry.subscribe(Topic::Post, "p1".into(), Arc::new(|_, event| {
//!     println!("post changed: {:?}", event);
//! }));
//! let _guard = registry.guard(token);
//!
//! registry.publish(Topic::Post, "p1".into(), Delta::patch("p1".into(), EntityPatch::like_count(5)));
//! ```

mod registry;
mod types;

pub use registry::SubscriptionRegistry;
pub use types::{
    Callback, ChannelKey, ChannelMessage, Delta, DropReason, EntityEvent, PublishOutcome,
    SubscriptionGuard, SubscriptionHandle, SubscriptionToken, Topic,
};
