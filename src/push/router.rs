//! Routing of push events into the registry.

use super::types::PushEvent;
use crate::subscriptions::{Delta, PublishOutcome, SubscriptionRegistry, Topic};
use crate::types::{EntityId, EntityPatch};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// Maps push events onto registry publishes.
pub struct PushRouter {
    registry: Arc<SubscriptionRegistry>,
    home_feed: String,
}

impl PushRouter {
    /// `home_feed` is the scope for new posts that name no feed.
    pub fn new(registry: Arc<SubscriptionRegistry>, home_feed: impl Into<String>) -> Self {
        Self {
            registry,
            home_feed: home_feed.into(),
        }
    }

    /// Apply one event. Returns the outcome of every publish it caused.
    pub fn dispatch(&self, event: PushEvent) -> Vec<PublishOutcome> {
        trace!(event = event.name(), "push event");

        match event {
            PushEvent::NewPost { post, feed } => {
                let scope = feed.unwrap_or_else(|| self.home_feed.clone());
                vec![self.publish(Topic::Feed, EntityId::new(scope), Delta::Upsert(post))]
            }
            PushEvent::PostUpdated {
                post_id,
                content,
                version,
            } => vec![self.patch_post(post_id, EntityPatch::content(content), version)],
            PushEvent::PostDeleted { post_id } => {
                vec![self.publish(Topic::Post, post_id.clone(), Delta::Remove(post_id))]
            }
            PushEvent::NewRepost {
                repost,
                original_id,
                repost_count,
            } => vec![
                self.publish(
                    Topic::Feed,
                    EntityId::new(self.home_feed.clone()),
                    Delta::Upsert(repost),
                ),
                self.patch_post(original_id, EntityPatch::repost_count(repost_count), None),
            ],
            PushEvent::RepostDeleted {
                repost_id,
                original_id,
                repost_count,
            } => vec![
                self.publish(Topic::Post, repost_id.clone(), Delta::Remove(repost_id)),
                self.patch_post(original_id, EntityPatch::repost_count(repost_count), None),
            ],
            PushEvent::RepostCountUpdate {
                post_id,
                count,
                version,
            } => vec![self.patch_post(post_id, EntityPatch::repost_count(count), version)],
            PushEvent::LikeCountUpdate {
                post_id,
                count,
                version,
            } => vec![self.patch_post(post_id, EntityPatch::like_count(count), version)],
            PushEvent::CommentCountUpdate {
                post_id,
                count,
                version,
            } => vec![self.patch_post(post_id, EntityPatch::comment_count(count), version)],
            PushEvent::NewComment { comment: entity } | PushEvent::NewReply { reply: entity } => {
                match entity.post_id.clone() {
                    Some(post_id) => {
                        vec![self.publish(Topic::PostComments, post_id, Delta::Upsert(entity))]
                    }
                    None => {
                        debug!(entity = %entity.id, "comment without post, dropping");
                        Vec::new()
                    }
                }
            }
            PushEvent::CommentLiked {
                comment_id,
                post_id,
                like_count,
                version,
            } => vec![self.publish(
                Topic::PostComments,
                post_id,
                Delta::remote_patch(comment_id, EntityPatch::like_count(like_count), version),
            )],
            PushEvent::CommentDeleted {
                comment_id,
                post_id,
            } => vec![self.publish(Topic::PostComments, post_id, Delta::Remove(comment_id))],
            PushEvent::CommentUpdated {
                comment_id,
                post_id,
                content,
                version,
            } => vec![self.publish(
                Topic::PostComments,
                post_id,
                Delta::remote_patch(comment_id, EntityPatch::content(content), version),
            )],
        }
    }

    fn patch_post(&self, post_id: EntityId, patch: EntityPatch, version: Option<u64>) -> PublishOutcome {
        self.publish(
            Topic::Post,
            post_id.clone(),
            Delta::remote_patch(post_id, patch, version),
        )
    }

    fn publish(&self, topic: Topic, entity_id: EntityId, delta: Delta) -> PublishOutcome {
        let outcome = self.registry.publish(topic, entity_id, delta);
        if let Some(kind) = outcome.failure_kind() {
            debug!(topic = ?topic, outcome = ?outcome, kind = %kind, "push event dropped");
        }
        outcome
    }
}

/// Reference-counted push room membership.
///
/// Several views may watch the same post; the transport joins a room once
/// for the first and leaves once after the last.
#[derive(Default)]
pub struct RoomTracker {
    rooms: Mutex<HashMap<String, usize>>,
}

impl RoomTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Room name for a post's comment stream.
    pub fn post_room(post_id: &EntityId) -> String {
        format!("post:{}", post_id)
    }

    /// Register interest. Returns true if the transport must join.
    pub fn join(&self, room: &str) -> bool {
        let mut rooms = self.rooms.lock();
        let count = rooms.entry(room.to_string()).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Drop interest. Returns true if the transport must leave.
    pub fn leave(&self, room: &str) -> bool {
        let mut rooms = self.rooms.lock();
        match rooms.get_mut(room) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                rooms.remove(room);
                true
            }
            None => false,
        }
    }

    pub fn is_joined(&self, room: &str) -> bool {
        self.rooms.lock().contains_key(room)
    }

    /// Rooms currently joined, sorted.
    pub fn rooms(&self) -> Vec<String> {
        let mut rooms: Vec<_> = self.rooms.lock().keys().cloned().collect();
        rooms.sort();
        rooms
    }
}
