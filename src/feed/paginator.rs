//! Feed paginator implementation.

use crate::api::{Page, PageSource, Resource};
use crate::cache::{CacheOutcome, EntityCache};
use crate::error::{FeedError, RemoteError, Result};
use crate::subscriptions::{EntityEvent, SubscriptionGuard, SubscriptionRegistry, Topic};
use crate::types::{Entity, EntityId, UserId};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

/// Paginator configuration.
#[derive(Clone, Debug)]
pub struct PaginatorConfig {
    /// Items requested per page.
    pub page_size: usize,
}

impl Default for PaginatorConfig {
    fn default() -> Self {
        Self { page_size: 20 }
    }
}

/// Loading state of a feed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PaginatorState {
    /// Nothing loaded yet.
    Empty,
    /// First page in flight.
    Loading,
    /// Idle with more pages available.
    Ready,
    /// A further page in flight.
    LoadingMore,
    /// The server reported no more pages.
    Exhausted,
}

impl PaginatorState {
    pub fn is_loading(self) -> bool {
        matches!(self, PaginatorState::Loading | PaginatorState::LoadingMore)
    }
}

/// A page fetch issued by the paginator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageRequest {
    pub resource: Resource,
    /// 1-based page number.
    pub page: u32,
    pub page_size: usize,
}

/// Where an id sat before it left the feed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Placement {
    Visible(usize),
    Pending(usize),
}

#[derive(Debug)]
struct FeedState {
    state: PaginatorState,
    /// Visible ids, top first.
    items: Vec<EntityId>,
    /// Live ids not yet revealed, in arrival order.
    pending: Vec<EntityId>,
    next_page: u32,
    at_top: bool,
    blocked: HashSet<UserId>,
    /// Speculatively deleted ids and where they were.
    hidden: HashMap<EntityId, Placement>,
    /// Ids purged because their author got blocked.
    purged: HashMap<UserId, Vec<(EntityId, Placement)>>,
}

impl FeedState {
    fn new() -> Self {
        Self {
            state: PaginatorState::Empty,
            items: Vec::new(),
            pending: Vec::new(),
            next_page: 1,
            at_top: true,
            blocked: HashSet::new(),
            hidden: HashMap::new(),
            purged: HashMap::new(),
        }
    }

    fn contains(&self, id: &EntityId) -> bool {
        self.items.contains(id) || self.pending.contains(id)
    }

    /// Take `id` out of the feed, returning where it was.
    fn take(&mut self, id: &EntityId) -> Option<Placement> {
        if let Some(index) = self.items.iter().position(|i| i == id) {
            self.items.remove(index);
            return Some(Placement::Visible(index));
        }
        if let Some(index) = self.pending.iter().position(|i| i == id) {
            self.pending.remove(index);
            return Some(Placement::Pending(index));
        }
        None
    }

    /// Put `id` back where it was, clamped to the current length.
    fn put_back(&mut self, id: EntityId, placement: Placement) {
        if self.contains(&id) {
            return;
        }
        match placement {
            Placement::Visible(index) => {
                let index = index.min(self.items.len());
                self.items.insert(index, id);
            }
            Placement::Pending(index) => {
                let index = index.min(self.pending.len());
                self.pending.insert(index, id);
            }
        }
    }

    /// Move pending ids to the top, newest first.
    fn reveal(&mut self) -> usize {
        let pending = std::mem::take(&mut self.pending);
        let mut revealed = 0;
        for id in pending {
            if !self.items.contains(&id) {
                self.items.insert(0, id);
                revealed += 1;
            }
        }
        revealed
    }
}

/// Cursor-style loader for one feed scope.
///
/// Loading is split in two phases so the caller owns the network round
/// trip: [`begin_load`](Self::begin_load) claims the next page and
/// [`complete_load`](Self::complete_load) merges the response. Only one
/// page request can be in flight.
pub struct FeedPaginator {
    scope: String,
    cache: Arc<EntityCache>,
    config: PaginatorConfig,
    state: Mutex<FeedState>,
    guards: Mutex<Vec<SubscriptionGuard>>,
}

impl FeedPaginator {
    /// Create a detached paginator for `scope`.
    ///
    /// The block list starts from the users already blocked in `cache`.
    pub fn new(scope: impl Into<String>, cache: Arc<EntityCache>, config: PaginatorConfig) -> Arc<Self> {
        let mut state = FeedState::new();
        state.blocked.extend(cache.blocked_users());

        Arc::new(Self {
            scope: scope.into(),
            cache,
            config,
            state: Mutex::new(state),
            guards: Mutex::new(Vec::new()),
        })
    }

    /// Start receiving live events: new items of this scope, post
    /// deletions, and block-list changes.
    ///
    /// Callbacks hold the paginator weakly; dropping it (or calling
    /// [`detach`](Self::detach)) ends every subscription.
    pub fn attach(self: &Arc<Self>, registry: &Arc<SubscriptionRegistry>) {
        let mut guards = self.guards.lock();

        let feed = Arc::downgrade(self);
        guards.push(registry.guard(registry.subscribe(
            Topic::Feed,
            EntityId::new(self.scope.clone()),
            Arc::new(move |_, event| with(&feed, |f| f.on_feed_event(event))),
        )));

        let feed = Arc::downgrade(self);
        guards.push(registry.guard(registry.subscribe_topic(
            Topic::Post,
            Arc::new(move |_, event| with(&feed, |f| f.on_post_event(event))),
        )));

        let feed = Arc::downgrade(self);
        guards.push(registry.guard(registry.subscribe_topic(
            Topic::User,
            Arc::new(move |_, event| with(&feed, |f| f.on_user_event(event))),
        )));
    }

    /// Stop receiving live events.
    pub fn detach(&self) {
        self.guards.lock().clear();
    }

    // --- Accessors ---

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn state(&self) -> PaginatorState {
        self.state.lock().state
    }

    /// Visible ids, top first.
    pub fn items(&self) -> Vec<EntityId> {
        self.state.lock().items.clone()
    }

    /// Visible entities resolved through the cache.
    pub fn entities(&self) -> Vec<Entity> {
        let items = self.items();
        items.iter().filter_map(|id| self.cache.get(id)).collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Live items waiting behind the "new posts" affordance.
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn has_more(&self) -> bool {
        !matches!(self.state(), PaginatorState::Exhausted)
    }

    pub fn is_blocked(&self, user: &UserId) -> bool {
        self.state.lock().blocked.contains(user)
    }

    // --- Loading ---

    /// Claim the next page.
    ///
    /// Fails with [`FeedError::PaginatorBusy`] while a page is in flight and
    /// with [`FeedError::PaginatorExhausted`] once the last page was merged.
    pub fn begin_load(&self) -> Result<PageRequest> {
        let mut state = self.state.lock();
        let next = match state.state {
            PaginatorState::Loading | PaginatorState::LoadingMore => {
                debug!(scope = %self.scope, "load rejected: request in flight");
                return Err(FeedError::PaginatorBusy);
            }
            PaginatorState::Exhausted => {
                debug!(scope = %self.scope, "load rejected: exhausted");
                return Err(FeedError::PaginatorExhausted);
            }
            PaginatorState::Empty => PaginatorState::Loading,
            PaginatorState::Ready => PaginatorState::LoadingMore,
        };
        state.state = next;

        Ok(PageRequest {
            resource: Resource::Feed(self.scope.clone()),
            page: state.next_page,
            page_size: self.config.page_size,
        })
    }

    /// Merge the response to a request from [`begin_load`](Self::begin_load).
    ///
    /// Returns the number of ids added to the visible list.
    pub fn complete_load(
        &self,
        request: &PageRequest,
        result: std::result::Result<Page, RemoteError>,
    ) -> Result<usize> {
        let mut state = self.state.lock();

        if !state.state.is_loading() {
            return Err(FeedError::InvalidTransition(format!(
                "page response while {:?}",
                state.state
            )));
        }
        if request.page != state.next_page {
            return Err(FeedError::PageMismatch {
                expected: state.next_page,
                got: request.page,
            });
        }

        let page = match result {
            Ok(page) => page,
            Err(error) => {
                state.state = match state.state {
                    PaginatorState::Loading => PaginatorState::Empty,
                    _ => PaginatorState::Ready,
                };
                debug!(scope = %self.scope, page = request.page, reason = %error, "page load failed");
                return Err(error.into());
            }
        };

        let mut added = 0;
        for entity in page.items {
            if state.blocked.contains(&entity.author_id) {
                continue;
            }
            let id = entity.id.clone();
            if let CacheOutcome::Orphaned = self.cache.put(entity) {
                continue;
            }
            // Pushed before the page arrived: already placed.
            if state.contains(&id) || state.hidden.contains_key(&id) {
                continue;
            }
            state.items.push(id);
            added += 1;
        }

        state.next_page += 1;
        state.state = if page.has_more {
            PaginatorState::Ready
        } else {
            PaginatorState::Exhausted
        };

        trace!(scope = %self.scope, page = request.page, added, "merged page");
        Ok(added)
    }

    /// Fetch and merge the next page, blocking on `source`.
    pub fn load_more(&self, source: &dyn PageSource) -> Result<usize> {
        let request = self.begin_load()?;
        let result = source.get_page(&request.resource, request.page, request.page_size);
        self.complete_load(&request, result)
    }

    /// Forget everything loaded and start over from the first page.
    ///
    /// The block list survives. A response to a request issued before the
    /// refresh is rejected.
    pub fn refresh(&self) {
        let mut state = self.state.lock();
        let blocked = std::mem::take(&mut state.blocked);
        let at_top = state.at_top;
        *state = FeedState::new();
        state.blocked = blocked;
        state.at_top = at_top;
    }

    // --- Viewport ---

    /// Report whether the viewport is at the top. Returning to the top
    /// reveals pending items.
    pub fn set_at_top(&self, at_top: bool) {
        let mut state = self.state.lock();
        state.at_top = at_top;
        if at_top && !state.pending.is_empty() {
            let revealed = state.reveal();
            trace!(scope = %self.scope, revealed, "revealed pending on return to top");
        }
    }

    /// Explicit click-to-reveal. Returns the number of items revealed.
    pub fn reveal_pending(&self) -> usize {
        self.state.lock().reveal()
    }

    // --- Block list ---

    /// Hide `user`'s items from this feed.
    pub fn block_author(&self, user: &UserId) {
        let mut state = self.state.lock();
        if !state.blocked.insert(user.clone()) {
            return;
        }

        let mut purged = Vec::new();
        let ids: Vec<EntityId> = state
            .items
            .iter()
            .chain(state.pending.iter())
            .filter(|id| {
                self.cache
                    .get_any(id)
                    .map(|e| &e.author_id == user)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        for id in ids {
            if let Some(placement) = state.take(&id) {
                purged.push((id, placement));
            }
        }

        debug!(scope = %self.scope, user = %user, purged = purged.len(), "author blocked");
        if !purged.is_empty() {
            state.purged.insert(user.clone(), purged);
        }
    }

    /// Undo [`block_author`](Self::block_author), restoring purged items.
    pub fn unblock_author(&self, user: &UserId) {
        let mut state = self.state.lock();
        if !state.blocked.remove(user) {
            return;
        }

        // Indices were taken top to bottom as items shifted up; reinsert in
        // reverse to rebuild the original order.
        for (id, placement) in state.purged.remove(user).unwrap_or_default().into_iter().rev() {
            if self.cache.contains(&id) {
                state.put_back(id, placement);
            }
        }
        debug!(scope = %self.scope, user = %user, "author unblocked");
    }

    // --- Live events ---

    fn on_feed_event(&self, event: &EntityEvent) {
        let EntityEvent::Upserted { entity, .. } = event else {
            return;
        };

        let mut state = self.state.lock();
        if state.blocked.contains(&entity.author_id) {
            debug!(scope = %self.scope, entity = %entity.id, "dropping item from blocked author");
            return;
        }
        if state.contains(&entity.id) || state.hidden.contains_key(&entity.id) {
            return;
        }

        if state.at_top {
            state.items.insert(0, entity.id.clone());
        } else {
            state.pending.push(entity.id.clone());
        }
    }

    fn on_post_event(&self, event: &EntityEvent) {
        let mut state = self.state.lock();
        match event {
            EntityEvent::Hidden(entity) => {
                if let Some(placement) = state.take(&entity.id) {
                    state.hidden.insert(entity.id.clone(), placement);
                }
            }
            EntityEvent::Restored(entity) => {
                if let Some(placement) = state.hidden.remove(&entity.id) {
                    state.put_back(entity.id.clone(), placement);
                }
            }
            EntityEvent::Removed { id, .. } => {
                state.hidden.remove(id);
                state.take(id);
            }
            _ => {}
        }
    }

    fn on_user_event(&self, event: &EntityEvent) {
        let EntityEvent::RelationshipChanged { user, relationship } = event else {
            return;
        };
        if relationship.is_blocked {
            self.block_author(user);
        } else {
            self.unblock_author(user);
        }
    }
}

fn with(feed: &Weak<FeedPaginator>, f: impl FnOnce(&FeedPaginator)) {
    if let Some(feed) = feed.upgrade() {
        f(&feed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriptions::Delta;

    fn setup() -> (Arc<FeedPaginator>, Arc<SubscriptionRegistry>) {
        let cache = Arc::new(EntityCache::default());
        let registry = Arc::new(SubscriptionRegistry::new(Arc::clone(&cache)));
        let feed = FeedPaginator::new("home", cache, PaginatorConfig::default());
        feed.attach(&registry);
        (feed, registry)
    }

    fn page(ids: &[&str], has_more: bool) -> Page {
        Page {
            items: ids.iter().map(|id| Entity::post(*id, "alice", "x")).collect(),
            has_more,
        }
    }

    fn push_new(registry: &SubscriptionRegistry, id: &str, author: &str) {
        registry.publish(
            Topic::Feed,
            "home".into(),
            Delta::Upsert(Entity::post(id, author, "new")),
        );
    }

    fn ids(feed: &FeedPaginator) -> Vec<String> {
        feed.items().into_iter().map(|id| id.0).collect()
    }

    #[test]
    fn test_state_machine() {
        let (feed, _) = setup();
        assert_eq!(feed.state(), PaginatorState::Empty);

        let first = feed.begin_load().unwrap();
        assert_eq!(first.page, 1);
        assert_eq!(feed.state(), PaginatorState::Loading);
        feed.complete_load(&first, Ok(page(&["a", "b"], true))).unwrap();
        assert_eq!(feed.state(), PaginatorState::Ready);

        let second = feed.begin_load().unwrap();
        assert_eq!(second.page, 2);
        assert_eq!(feed.state(), PaginatorState::LoadingMore);
        feed.complete_load(&second, Ok(page(&["c"], false))).unwrap();
        assert_eq!(feed.state(), PaginatorState::Exhausted);

        assert!(matches!(feed.begin_load(), Err(FeedError::PaginatorExhausted)));
        assert_eq!(ids(&feed), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_concurrent_load_rejected() {
        let (feed, _) = setup();
        let request = feed.begin_load().unwrap();
        assert!(matches!(feed.begin_load(), Err(FeedError::PaginatorBusy)));
        feed.complete_load(&request, Ok(page(&["a"], true))).unwrap();
        assert!(feed.begin_load().is_ok());
    }

    #[test]
    fn test_failed_load_returns_to_previous_state() {
        let (feed, _) = setup();
        let request = feed.begin_load().unwrap();
        let result = feed.complete_load(&request, Err(RemoteError::Network("offline".into())));
        assert!(matches!(result, Err(FeedError::Network(_))));
        assert_eq!(feed.state(), PaginatorState::Empty);

        let retry = feed.begin_load().unwrap();
        assert_eq!(retry.page, 1);
    }

    #[test]
    fn test_push_at_top_inserts_immediately() {
        let (feed, registry) = setup();
        let request = feed.begin_load().unwrap();
        feed.complete_load(&request, Ok(page(&["a", "b"], true))).unwrap();

        push_new(&registry, "n1", "bob");

        assert_eq!(ids(&feed), vec!["n1", "a", "b"]);
        assert_eq!(feed.pending_count(), 0);
    }

    #[test]
    fn test_push_scrolled_down_is_pending() {
        let (feed, registry) = setup();
        let request = feed.begin_load().unwrap();
        feed.complete_load(&request, Ok(page(&["a", "b"], true))).unwrap();
        feed.set_at_top(false);

        push_new(&registry, "n1", "bob");
        push_new(&registry, "n2", "bob");

        assert_eq!(ids(&feed), vec!["a", "b"]);
        assert_eq!(feed.pending_count(), 2);

        assert_eq!(feed.reveal_pending(), 2);
        assert_eq!(ids(&feed), vec!["n2", "n1", "a", "b"]);
        assert_eq!(feed.pending_count(), 0);
    }

    #[test]
    fn test_return_to_top_reveals() {
        let (feed, registry) = setup();
        feed.set_at_top(false);
        push_new(&registry, "n1", "bob");
        assert!(feed.is_empty());

        feed.set_at_top(true);
        assert_eq!(ids(&feed), vec!["n1"]);
    }

    #[test]
    fn test_push_before_page_not_duplicated() {
        let (feed, registry) = setup();
        let request = feed.begin_load().unwrap();

        push_new(&registry, "a", "alice");
        feed.complete_load(&request, Ok(page(&["a", "b"], true))).unwrap();

        assert_eq!(ids(&feed), vec!["a", "b"]);
    }

    #[test]
    fn test_blocked_author_dropped() {
        let (feed, registry) = setup();
        feed.block_author(&"mallory".into());

        push_new(&registry, "n1", "mallory");
        assert!(feed.is_empty());
        assert_eq!(feed.pending_count(), 0);
    }

    #[test]
    fn test_hidden_item_restored_at_position() {
        let (feed, registry) = setup();
        let request = feed.begin_load().unwrap();
        feed.complete_load(&request, Ok(page(&["a", "b", "c"], true))).unwrap();

        registry.publish(Topic::Post, "b".into(), Delta::Hide("b".into()));
        assert_eq!(ids(&feed), vec!["a", "c"]);

        registry.publish(Topic::Post, "b".into(), Delta::Restore("b".into()));
        assert_eq!(ids(&feed), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_push_for_hidden_item_keeps_position() {
        let (feed, registry) = setup();
        let request = feed.begin_load().unwrap();
        feed.complete_load(&request, Ok(page(&["a", "b", "c"], true))).unwrap();

        registry.publish(Topic::Post, "b".into(), Delta::Hide("b".into()));
        push_new(&registry, "b", "alice");
        assert_eq!(ids(&feed), vec!["a", "c"]);
        assert_eq!(feed.entities().len(), feed.len());

        registry.publish(Topic::Post, "b".into(), Delta::Restore("b".into()));
        assert_eq!(ids(&feed), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_block_list_seeded_from_cache() {
        let cache = Arc::new(EntityCache::default());
        let mallory = UserId::from("mallory");
        cache.patch_relationship(&mallory, &crate::types::RelationshipPatch::blocked(true), None);
        let registry = Arc::new(SubscriptionRegistry::new(Arc::clone(&cache)));
        let feed = FeedPaginator::new("home", cache, PaginatorConfig::default());
        feed.attach(&registry);
        assert!(feed.is_blocked(&mallory));

        let request = feed.begin_load().unwrap();
        let items = vec![Entity::post("m1", "mallory", "x"), Entity::post("a", "alice", "x")];
        feed.complete_load(&request, Ok(Page { items, has_more: true }))
            .unwrap();
        push_new(&registry, "m2", "mallory");

        assert_eq!(ids(&feed), vec!["a"]);
    }

    #[test]
    fn test_removed_item_dropped() {
        let (feed, registry) = setup();
        let request = feed.begin_load().unwrap();
        feed.complete_load(&request, Ok(page(&["a", "b"], true))).unwrap();

        registry.publish(Topic::Post, "a".into(), Delta::Remove("a".into()));
        assert_eq!(ids(&feed), vec!["b"]);

        // Removed ids never come back through a later page.
        let next = feed.begin_load().unwrap();
        feed.complete_load(&next, Ok(page(&["a", "c"], false))).unwrap();
        assert_eq!(ids(&feed), vec!["b", "c"]);
    }

    #[test]
    fn test_refresh_rejects_stale_response() {
        let (feed, _) = setup();
        let request = feed.begin_load().unwrap();
        feed.refresh();

        let result = feed.complete_load(&request, Ok(page(&["a"], true)));
        assert!(matches!(result, Err(FeedError::InvalidTransition(_))));
        assert!(feed.is_empty());
    }

    #[test]
    fn test_detach_stops_events() {
        let (feed, registry) = setup();
        feed.detach();
        push_new(&registry, "n1", "bob");
        assert!(feed.is_empty());
        assert_eq!(registry.subscription_count(), 0);
    }
}
