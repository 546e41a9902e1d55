//! Core types for the feed engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Identifier of a post or comment.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        EntityId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({})", self.0)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        EntityId(s.to_string())
    }
}

/// Identifier of a user (author, follow/block target).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        UserId(id.into())
    }
}

impl fmt::Debug for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserId({})", self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        UserId(s.to_string())
    }
}

/// Monotonic version counter.
///
/// Used both for the local write counter of a cached value and for the
/// server-implied version carried by push events.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Version(pub u64);

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl Version {
    pub fn next(self) -> Self {
        Version(self.0 + 1)
    }
}

/// Identifies one in-flight remote request.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Req({})", self.0)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }

    /// This timestamp shifted forward by `duration`.
    pub fn after(self, duration: Duration) -> Self {
        Timestamp(self.0.saturating_add(duration.as_micros() as i64))
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// What kind of entity a cache slot holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Post,
    Comment,
}

/// Engagement counters of a post or comment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    #[serde(default)]
    pub like: u64,
    #[serde(default)]
    pub comment: u64,
    #[serde(default)]
    pub repost: u64,
}

/// Viewer-relative flags of a post or comment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flags {
    #[serde(default)]
    pub is_liked: bool,
    #[serde(default)]
    pub is_reposted: bool,
}

/// A post or a comment as rendered by the client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: EntityId,
    pub kind: EntityKind,
    pub author_id: UserId,
    pub content: String,
    #[serde(default)]
    pub counters: Counters,
    #[serde(default)]
    pub flags: Flags,

    /// Number of replies (comments only).
    #[serde(default)]
    pub reply_count: u64,

    /// Post a comment belongs to.
    #[serde(default)]
    pub post_id: Option<EntityId>,

    /// Parent comment of a reply.
    #[serde(default)]
    pub parent_id: Option<EntityId>,

    /// Original post of a repost.
    #[serde(default)]
    pub repost_of: Option<EntityId>,

    /// Local write counter, bumped by the cache on every write.
    #[serde(default)]
    pub version: Version,

    /// Highest server-implied version applied to this entity.
    #[serde(default)]
    pub remote_version: Version,
}

impl Entity {
    /// A new post.
    pub fn post(id: impl Into<String>, author: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: EntityId(id.into()),
            kind: EntityKind::Post,
            author_id: UserId(author.into()),
            content: content.into(),
            counters: Counters::default(),
            flags: Flags::default(),
            reply_count: 0,
            post_id: None,
            parent_id: None,
            repost_of: None,
            version: Version::default(),
            remote_version: Version::default(),
        }
    }

    /// A new top-level comment on `post`.
    pub fn comment(
        id: impl Into<String>,
        post: impl Into<String>,
        author: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            kind: EntityKind::Comment,
            post_id: Some(EntityId(post.into())),
            ..Self::post(id, author, content)
        }
    }

    /// A new reply to `parent` under `post`.
    pub fn reply(
        id: impl Into<String>,
        post: impl Into<String>,
        parent: impl Into<String>,
        author: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            parent_id: Some(EntityId(parent.into())),
            ..Self::comment(id, post, author, content)
        }
    }

    pub fn with_counters(mut self, like: u64, comment: u64, repost: u64) -> Self {
        self.counters = Counters { like, comment, repost };
        self
    }

    pub fn with_flags(mut self, is_liked: bool, is_reposted: bool) -> Self {
        self.flags = Flags { is_liked, is_reposted };
        self
    }

    pub fn with_reply_count(mut self, count: u64) -> Self {
        self.reply_count = count;
        self
    }

    pub fn with_repost_of(mut self, original: impl Into<String>) -> Self {
        self.repost_of = Some(EntityId(original.into()));
        self
    }

    pub fn with_remote_version(mut self, version: u64) -> Self {
        self.remote_version = Version(version);
        self
    }

    pub fn is_reply(&self) -> bool {
        self.parent_id.is_some()
    }
}

/// Partial update of an entity. Counter values are absolute.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub like_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repost_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_liked: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_reposted: Option<bool>,
}

impl EntityPatch {
    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Default::default()
        }
    }

    pub fn like(is_liked: bool, count: u64) -> Self {
        Self {
            is_liked: Some(is_liked),
            like_count: Some(count),
            ..Default::default()
        }
    }

    pub fn repost(is_reposted: bool, count: u64) -> Self {
        Self {
            is_reposted: Some(is_reposted),
            repost_count: Some(count),
            ..Default::default()
        }
    }

    pub fn like_count(count: u64) -> Self {
        Self {
            like_count: Some(count),
            ..Default::default()
        }
    }

    pub fn comment_count(count: u64) -> Self {
        Self {
            comment_count: Some(count),
            ..Default::default()
        }
    }

    pub fn repost_count(count: u64) -> Self {
        Self {
            repost_count: Some(count),
            ..Default::default()
        }
    }

    pub fn reply_count(count: u64) -> Self {
        Self {
            reply_count: Some(count),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Apply to an entity. Returns true if any field changed.
    pub fn apply(&self, entity: &mut Entity) -> bool {
        let before = entity.clone();
        if let Some(ref content) = self.content {
            entity.content = content.clone();
        }
        if let Some(n) = self.like_count {
            entity.counters.like = n;
        }
        if let Some(n) = self.comment_count {
            entity.counters.comment = n;
        }
        if let Some(n) = self.repost_count {
            entity.counters.repost = n;
        }
        if let Some(n) = self.reply_count {
            entity.reply_count = n;
        }
        if let Some(b) = self.is_liked {
            entity.flags.is_liked = b;
        }
        if let Some(b) = self.is_reposted {
            entity.flags.is_reposted = b;
        }
        *entity != before
    }
}

/// Viewer's relationship to another user.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relationship {
    pub is_following: bool,
    pub is_blocked: bool,
    #[serde(default)]
    pub version: Version,
    #[serde(default)]
    pub remote_version: Version,
}

/// Partial update of a relationship.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_following: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_blocked: Option<bool>,
}

impl RelationshipPatch {
    pub fn following(value: bool) -> Self {
        Self {
            is_following: Some(value),
            ..Default::default()
        }
    }

    pub fn blocked(value: bool) -> Self {
        Self {
            is_blocked: Some(value),
            ..Default::default()
        }
    }

    pub fn apply(&self, relationship: &mut Relationship) -> bool {
        let before = *relationship;
        if let Some(b) = self.is_following {
            relationship.is_following = b;
        }
        if let Some(b) = self.is_blocked {
            relationship.is_blocked = b;
        }
        *relationship != before
    }
}
