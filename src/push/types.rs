//! Push event types.

use crate::error::Result;
use crate::types::{Entity, EntityId};
use serde::{Deserialize, Serialize};

/// Wire encoding of a push frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FrameEncoding {
    #[default]
    Json,
    MessagePack,
}

/// A named server event. Versions are server-implied and optional.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum PushEvent {
    NewPost {
        post: Entity,
        /// Feed scope the post belongs to; the home feed when absent.
        #[serde(default)]
        feed: Option<String>,
    },
    PostUpdated {
        post_id: EntityId,
        content: String,
        #[serde(default)]
        version: Option<u64>,
    },
    PostDeleted {
        post_id: EntityId,
    },
    NewRepost {
        repost: Entity,
        original_id: EntityId,
        repost_count: u64,
    },
    RepostDeleted {
        repost_id: EntityId,
        original_id: EntityId,
        repost_count: u64,
    },
    RepostCountUpdate {
        post_id: EntityId,
        count: u64,
        #[serde(default)]
        version: Option<u64>,
    },
    LikeCountUpdate {
        post_id: EntityId,
        count: u64,
        #[serde(default)]
        version: Option<u64>,
    },
    CommentCountUpdate {
        post_id: EntityId,
        count: u64,
        #[serde(default)]
        version: Option<u64>,
    },
    NewComment {
        comment: Entity,
    },
    NewReply {
        reply: Entity,
    },
    CommentLiked {
        comment_id: EntityId,
        post_id: EntityId,
        like_count: u64,
        #[serde(default)]
        version: Option<u64>,
    },
    CommentDeleted {
        comment_id: EntityId,
        post_id: EntityId,
    },
    CommentUpdated {
        comment_id: EntityId,
        post_id: EntityId,
        content: String,
        #[serde(default)]
        version: Option<u64>,
    },
}

impl PushEvent {
    /// Decode a frame.
    pub fn decode(bytes: &[u8], encoding: FrameEncoding) -> Result<Self> {
        let event = match encoding {
            FrameEncoding::Json => serde_json::from_slice(bytes)?,
            FrameEncoding::MessagePack => rmp_serde::from_slice(bytes)?,
        };
        Ok(event)
    }

    /// Encode a frame.
    pub fn encode(&self, encoding: FrameEncoding) -> Result<Vec<u8>> {
        let bytes = match encoding {
            FrameEncoding::Json => serde_json::to_vec(self)?,
            FrameEncoding::MessagePack => rmp_serde::to_vec_named(self)?,
        };
        Ok(bytes)
    }

    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            PushEvent::NewPost { .. } => "newPost",
            PushEvent::PostUpdated { .. } => "postUpdated",
            PushEvent::PostDeleted { .. } => "postDeleted",
            PushEvent::NewRepost { .. } => "newRepost",
            PushEvent::RepostDeleted { .. } => "repostDeleted",
            PushEvent::RepostCountUpdate { .. } => "repostCountUpdate",
            PushEvent::LikeCountUpdate { .. } => "likeCountUpdate",
            PushEvent::CommentCountUpdate { .. } => "commentCountUpdate",
            PushEvent::NewComment { .. } => "newComment",
            PushEvent::NewReply { .. } => "newReply",
            PushEvent::CommentLiked { .. } => "commentLiked",
            PushEvent::CommentDeleted { .. } => "commentDeleted",
            PushEvent::CommentUpdated { .. } => "commentUpdated",
        }
    }
}
