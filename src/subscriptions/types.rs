//! Subscription types for entity change events.

use super::registry::SubscriptionRegistry;
use crate::error::FailureKind;
use crate::types::{
    Entity, EntityId, EntityKind, EntityPatch, Relationship, RelationshipPatch, UserId, Version,
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};

/// Event routing namespace.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    /// Updates of a single post.
    Post,
    /// Comments and replies under a post.
    PostComments,
    /// New items of a feed scope.
    Feed,
    /// Viewer relationship with a user.
    User,
}

/// A `(topic, entity_id)` channel.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelKey {
    pub topic: Topic,
    pub entity_id: EntityId,
}

impl ChannelKey {
    pub fn new(topic: Topic, entity_id: EntityId) -> Self {
        Self { topic, entity_id }
    }

    /// Channel that carries updates of `entity`: the post's own channel,
    /// or the comment channel of the post a comment belongs to.
    pub fn for_entity(entity: &Entity) -> Self {
        match (entity.kind, &entity.post_id) {
            (EntityKind::Comment, Some(post)) => Self::new(Topic::PostComments, post.clone()),
            _ => Self::new(Topic::Post, entity.id.clone()),
        }
    }

    /// Channel that carries relationship changes for `user`.
    pub fn for_user(user: &UserId) -> Self {
        Self::new(Topic::User, EntityId(user.0.clone()))
    }
}

/// A change to publish. Applied to the cache before delivery.
#[derive(Clone, Debug, PartialEq)]
pub enum Delta {
    /// Insert or fully replace an entity.
    Upsert(Entity),

    /// Partial update; `version` is the server-implied version if any.
    Patch {
        id: EntityId,
        patch: EntityPatch,
        version: Option<Version>,
    },

    /// Speculative delete.
    Hide(EntityId),

    /// Rollback of a speculative delete.
    Restore(EntityId),

    /// Confirmed delete.
    Remove(EntityId),

    /// Relationship flag change.
    Relationship {
        user: UserId,
        patch: RelationshipPatch,
        version: Option<Version>,
    },
}

impl Delta {
    /// Local patch without an implied version.
    pub fn patch(id: EntityId, patch: EntityPatch) -> Self {
        Delta::Patch {
            id,
            patch,
            version: None,
        }
    }

    /// Remote patch carrying the server-implied version.
    pub fn remote_patch(id: EntityId, patch: EntityPatch, version: Option<u64>) -> Self {
        Delta::Patch {
            id,
            patch,
            version: version.map(Version),
        }
    }
}

/// What subscribers observe after a delta was merged.
#[derive(Clone, Debug, PartialEq)]
pub enum EntityEvent {
    /// An entity was inserted or replaced on this channel.
    Upserted { entity: Entity, created: bool },

    /// Fields of an entity changed.
    Updated(Entity),

    /// An entity is speculatively deleted.
    Hidden(Entity),

    /// A speculative delete was rolled back.
    Restored(Entity),

    /// An entity is gone for good. Carries the last cached value if known.
    Removed { id: EntityId, last: Option<Entity> },

    /// Viewer relationship with a user changed.
    RelationshipChanged {
        user: UserId,
        relationship: Relationship,
    },
}

impl EntityEvent {
    /// Id of the entity this event is about, if any.
    pub fn entity_id(&self) -> Option<&EntityId> {
        match self {
            EntityEvent::Upserted { entity, .. }
            | EntityEvent::Updated(entity)
            | EntityEvent::Hidden(entity)
            | EntityEvent::Restored(entity) => Some(&entity.id),
            EntityEvent::Removed { id, .. } => Some(id),
            EntityEvent::RelationshipChanged { .. } => None,
        }
    }
}

/// Result of a publish.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Applied and handed to this many subscribers.
    Delivered { subscribers: usize },
    /// The channel is mid-dispatch; the delta will be delivered after the
    /// events already in flight on it.
    Queued,
    /// Nothing changed; no delivery.
    Unchanged,
    /// Dropped: implied version not newer than cached.
    Stale,
    /// Dropped: entity already removed.
    Orphaned,
    /// Dropped: partial update for an entity never seen.
    Missing,
}

impl PublishOutcome {
    /// Failure class of a dropped delta; `None` when nothing was dropped.
    pub fn failure_kind(self) -> Option<FailureKind> {
        match self {
            PublishOutcome::Stale => Some(FailureKind::StaleEvent),
            PublishOutcome::Orphaned | PublishOutcome::Missing => {
                Some(FailureKind::OrphanedReference)
            }
            _ => None,
        }
    }
}

/// Callback invoked for each event on a subscribed channel.
pub type Callback = Arc<dyn Fn(&ChannelKey, &EntityEvent) + Send + Sync>;

/// Token returned by `subscribe`; pass to `unsubscribe`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionToken(pub u64);

/// Unsubscribes when dropped.
///
/// Holds the registry weakly so a guard outliving the registry is harmless.
pub struct SubscriptionGuard {
    registry: Weak<SubscriptionRegistry>,
    token: SubscriptionToken,
}

impl SubscriptionGuard {
    pub(crate) fn new(registry: &Arc<SubscriptionRegistry>, token: SubscriptionToken) -> Self {
        Self {
            registry: Arc::downgrade(registry),
            token,
        }
    }

    pub fn token(&self) -> SubscriptionToken {
        self.token
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unsubscribe(self.token);
        }
    }
}

impl std::fmt::Debug for SubscriptionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionGuard")
            .field("token", &self.token)
            .finish()
    }
}

/// Why a pull-model subscription was dropped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Send buffer overflowed (slow consumer).
    BufferOverflow,
    /// Explicitly unsubscribed.
    Unsubscribed,
}

/// Message delivered to a pull-model subscription.
#[derive(Clone, Debug, PartialEq)]
pub enum ChannelMessage {
    Event {
        channel: ChannelKey,
        event: EntityEvent,
    },
    Dropped {
        reason: DropReason,
    },
}

/// Handle to a pull-model subscription.
pub struct SubscriptionHandle {
    pub token: SubscriptionToken,
    /// Channel to receive events.
    pub receiver: crossbeam_channel::Receiver<ChannelMessage>,
}

impl SubscriptionHandle {
    /// Receive the next message (blocking).
    pub fn recv(&self) -> Result<ChannelMessage, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message (non-blocking).
    pub fn try_recv(&self) -> Result<ChannelMessage, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<ChannelMessage, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}
