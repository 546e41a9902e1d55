//! Shared fakes for integration tests.

#![allow(dead_code)]

use feedsync::{
    BlockResponse, CommandApi, Entity, EntityId, FollowResponse, LikeResponse, Page, PageSource,
    RemoteError, RepostResponse, Resource, UserId,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Once;
use std::thread;
use std::time::Duration;

static TRACING: Once = Once::new();

/// Route engine logs to the test harness output.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    });
}

/// Command surface that records calls and answers from a script.
#[derive(Default)]
pub struct FakeApi {
    calls: Mutex<Vec<String>>,
    failure: Mutex<Option<RemoteError>>,
    delay: Mutex<Option<Duration>>,
    next_comment: Mutex<u64>,
}

impl FakeApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following call fail with `error`.
    pub fn fail_with(&self, error: RemoteError) {
        *self.failure.lock() = Some(error);
    }

    /// Make every following call take `delay`.
    pub fn delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn call(&self, name: String) -> Result<(), RemoteError> {
        self.calls.lock().push(name);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
        match self.failure.lock().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl CommandApi for FakeApi {
    fn toggle_like(&self, entity: &EntityId) -> Result<LikeResponse, RemoteError> {
        self.call(format!("like:{}", entity))?;
        Ok(LikeResponse {
            liked: true,
            like_count: None,
        })
    }

    fn toggle_repost(&self, post: &EntityId) -> Result<RepostResponse, RemoteError> {
        self.call(format!("repost:{}", post))?;
        Ok(RepostResponse {
            reposted: true,
            repost_count: None,
        })
    }

    fn toggle_follow(&self, user: &UserId) -> Result<FollowResponse, RemoteError> {
        self.call(format!("follow:{}", user))?;
        Ok(FollowResponse { is_following: true })
    }

    fn toggle_block(&self, user: &UserId) -> Result<BlockResponse, RemoteError> {
        self.call(format!("block:{}", user))?;
        Ok(BlockResponse { is_blocked: true })
    }

    fn edit(&self, entity: &EntityId, content: &str) -> Result<Entity, RemoteError> {
        self.call(format!("edit:{}", entity))?;
        Ok(Entity::post(entity.as_str(), "alice", content))
    }

    fn delete_post(&self, post: &EntityId) -> Result<(), RemoteError> {
        self.call(format!("delete_post:{}", post))
    }

    fn delete_comment(&self, comment: &EntityId) -> Result<(), RemoteError> {
        self.call(format!("delete_comment:{}", comment))
    }

    fn create_comment(
        &self,
        post: &EntityId,
        parent: Option<&EntityId>,
        text: &str,
    ) -> Result<Entity, RemoteError> {
        self.call(format!("comment:{}", post))?;
        let mut next = self.next_comment.lock();
        *next += 1;
        let id = format!("new-{}", *next);
        Ok(match parent {
            Some(parent) => Entity::reply(id, post.as_str(), parent.as_str(), "me", text),
            None => Entity::comment(id, post.as_str(), "me", text),
        })
    }
}

/// Page source serving canned pages per resource.
#[derive(Default)]
pub struct FakePages {
    pages: Mutex<HashMap<Resource, Vec<Page>>>,
    requests: Mutex<Vec<(Resource, u32)>>,
}

impl FakePages {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `pages` for `resource`, page 1 first.
    pub fn serve(&self, resource: Resource, pages: Vec<Page>) {
        self.pages.lock().insert(resource, pages);
    }

    pub fn requests(&self) -> Vec<(Resource, u32)> {
        self.requests.lock().clone()
    }
}

impl PageSource for FakePages {
    fn get_page(&self, resource: &Resource, page: u32, _page_size: usize) -> Result<Page, RemoteError> {
        self.requests.lock().push((resource.clone(), page));
        self.pages
            .lock()
            .get(resource)
            .and_then(|pages| pages.get(page as usize - 1))
            .cloned()
            .ok_or_else(|| RemoteError::rejected("no such page"))
    }
}

pub fn posts(ids: &[&str], author: &str, has_more: bool) -> Page {
    Page {
        items: ids.iter().map(|id| Entity::post(*id, author, "text")).collect(),
        has_more,
    }
}
