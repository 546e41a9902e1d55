//! Remote command surface consumed by the engine.
//!
//! Implementations wrap the HTTP client; the engine only relies on the
//! shapes below. Failures are reported as [`RemoteError`], with a
//! machine-readable reason string for server-side rejections.

use crate::error::RemoteError;
use crate::types::{Entity, EntityId, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Response to a like toggle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LikeResponse {
    pub liked: bool,
    /// Authoritative count, when the server reports one.
    #[serde(default)]
    pub like_count: Option<u64>,
}

/// Response to a repost toggle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepostResponse {
    pub reposted: bool,
    #[serde(default)]
    pub repost_count: Option<u64>,
}

/// Response to a follow toggle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowResponse {
    pub is_following: bool,
}

/// Response to a block toggle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockResponse {
    pub is_blocked: bool,
}

/// One page of a paged resource.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub items: Vec<Entity>,
    pub has_more: bool,
}

/// A paged resource.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Resource {
    /// Posts of a feed scope ("home", a profile, ...).
    Feed(String),
    /// Top-level comments of a post.
    Comments(EntityId),
    /// Replies to a comment.
    Replies(EntityId),
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Feed(scope) => write!(f, "feed/{}", scope),
            Resource::Comments(post) => write!(f, "posts/{}/comments", post),
            Resource::Replies(comment) => write!(f, "comments/{}/replies", comment),
        }
    }
}

/// Authoritative commands.
pub trait CommandApi: Send + Sync {
    fn toggle_like(&self, entity: &EntityId) -> Result<LikeResponse, RemoteError>;

    fn toggle_repost(&self, post: &EntityId) -> Result<RepostResponse, RemoteError>;

    fn toggle_follow(&self, user: &UserId) -> Result<FollowResponse, RemoteError>;

    fn toggle_block(&self, user: &UserId) -> Result<BlockResponse, RemoteError>;

    /// Replace the content of a post or comment; returns the stored entity.
    fn edit(&self, entity: &EntityId, content: &str) -> Result<Entity, RemoteError>;

    fn delete_post(&self, post: &EntityId) -> Result<(), RemoteError>;

    fn delete_comment(&self, comment: &EntityId) -> Result<(), RemoteError>;

    /// Create a comment, or a reply when `parent` is set.
    fn create_comment(
        &self,
        post: &EntityId,
        parent: Option<&EntityId>,
        text: &str,
    ) -> Result<Entity, RemoteError>;
}

/// Paged reads.
pub trait PageSource: Send + Sync {
    /// Fetch page `page` (1-based) of `resource`.
    fn get_page(&self, resource: &Resource, page: u32, page_size: usize) -> Result<Page, RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_paths() {
        assert_eq!(Resource::Feed("home".into()).to_string(), "feed/home");
        assert_eq!(
            Resource::Replies(EntityId::from("c1")).to_string(),
            "comments/c1/replies"
        );
    }

    #[test]
    fn test_like_response_without_count() {
        let response: LikeResponse = serde_json::from_str(r#"{"liked":true}"#).unwrap();
        assert!(response.liked);
        assert_eq!(response.like_count, None);
    }
}
