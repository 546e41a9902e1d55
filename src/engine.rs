//! Engine struct tying all components together.

use crate::cache::{CacheConfig, EntityCache};
use crate::comments::{CommentConfig, CommentTree};
use crate::error::Result;
use crate::feed::{FeedPaginator, PaginatorConfig};
use crate::media::PlaybackCoordinator;
use crate::mutations::{MutationConfig, MutationController, NoticeSink};
use crate::push::{FrameEncoding, PushEvent, PushRouter, RoomTracker};
use crate::subscriptions::{PublishOutcome, SubscriptionHandle, SubscriptionRegistry, Topic};
use crate::types::EntityId;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Engine configuration.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// How long a mutation's remote call may take before rollback.
    pub commit_timeout: Duration,

    /// Feed items and top-level comments per page.
    pub page_size: usize,

    /// Replies fetched when a comment is first expanded.
    pub reply_page_size: usize,

    /// Number of removed ids remembered.
    pub tombstone_capacity: usize,

    /// Buffer of pull-model subscriptions.
    pub channel_buffer_size: usize,

    /// Feed scope receiving new posts that name no scope.
    pub home_feed: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            commit_timeout: Duration::from_secs(10),
            page_size: 20,
            reply_page_size: 50,
            tombstone_capacity: 10_000,
            channel_buffer_size: 1000,
            home_feed: "home".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn cache(&self) -> CacheConfig {
        CacheConfig {
            tombstone_capacity: self.tombstone_capacity,
        }
    }

    pub fn mutations(&self) -> MutationConfig {
        MutationConfig {
            commit_timeout: self.commit_timeout,
        }
    }

    pub fn paginator(&self) -> PaginatorConfig {
        PaginatorConfig {
            page_size: self.page_size,
        }
    }

    pub fn comments(&self) -> CommentConfig {
        CommentConfig {
            page_size: self.page_size,
            reply_page_size: self.reply_page_size,
        }
    }
}

/// The reconciliation engine.
///
/// Owns the shared cache and registry and hands out views wired to them:
/// - [`feed`](Self::feed) and [`comment_tree`](Self::comment_tree) build
///   attached views
/// - [`mutations`](Self::mutations) runs user actions
/// - [`handle_frame`](Self::handle_frame) feeds push traffic in
pub struct Engine {
    config: EngineConfig,
    cache: Arc<EntityCache>,
    registry: Arc<SubscriptionRegistry>,
    mutations: Arc<MutationController>,
    router: PushRouter,
    rooms: RoomTracker,
    media: Arc<PlaybackCoordinator>,
}

impl Engine {
    pub fn new(config: EngineConfig, notices: Arc<dyn NoticeSink>) -> Self {
        let cache = Arc::new(EntityCache::new(config.cache()));
        let registry = Arc::new(SubscriptionRegistry::new(Arc::clone(&cache)));
        let mutations = Arc::new(MutationController::new(
            Arc::clone(&registry),
            notices,
            config.mutations(),
        ));
        let router = PushRouter::new(Arc::clone(&registry), config.home_feed.clone());

        debug!(home_feed = %config.home_feed, "engine ready");

        Self {
            config,
            cache,
            registry,
            mutations,
            router,
            rooms: RoomTracker::new(),
            media: Arc::new(PlaybackCoordinator::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<EntityCache> {
        &self.cache
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn mutations(&self) -> &Arc<MutationController> {
        &self.mutations
    }

    pub fn media(&self) -> &Arc<PlaybackCoordinator> {
        &self.media
    }

    pub fn rooms(&self) -> &RoomTracker {
        &self.rooms
    }

    pub fn router(&self) -> &PushRouter {
        &self.router
    }

    // --- Views ---

    /// A paginator for `scope`, subscribed to live events.
    pub fn feed(&self, scope: impl Into<String>) -> Arc<FeedPaginator> {
        let feed = FeedPaginator::new(scope, Arc::clone(&self.cache), self.config.paginator());
        feed.attach(&self.registry);
        feed
    }

    /// The home feed paginator.
    pub fn home_feed(&self) -> Arc<FeedPaginator> {
        self.feed(self.config.home_feed.clone())
    }

    /// A comment tree for `post`, subscribed to live events.
    pub fn comment_tree(&self, post: EntityId) -> Arc<CommentTree> {
        let tree = CommentTree::new(post, Arc::clone(&self.cache), self.config.comments());
        tree.attach(&self.registry);
        tree
    }

    /// Pull-model subscription with the configured buffer size.
    pub fn subscribe_channel(&self, topic: Topic, entity_id: EntityId) -> SubscriptionHandle {
        self.registry
            .subscribe_channel(topic, entity_id, self.config.channel_buffer_size)
    }

    // --- Push ---

    /// Decode and apply one push frame.
    pub fn handle_frame(&self, bytes: &[u8], encoding: FrameEncoding) -> Result<Vec<PublishOutcome>> {
        let event = PushEvent::decode(bytes, encoding)?;
        Ok(self.router.dispatch(event))
    }

    /// Apply an already decoded push event.
    pub fn handle_event(&self, event: PushEvent) -> Vec<PublishOutcome> {
        self.router.dispatch(event)
    }
}
