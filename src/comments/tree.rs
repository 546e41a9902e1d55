//! Comment tree implementation.

use crate::api::{Page, PageSource, Resource};
use crate::cache::{CacheOutcome, EntityCache};
use crate::error::{FeedError, RemoteError, Result};
use crate::feed::{PageRequest, PaginatorState};
use crate::subscriptions::{EntityEvent, SubscriptionGuard, SubscriptionRegistry, Topic};
use crate::types::{Entity, EntityId, EntityKind};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace};

/// Comment tree configuration.
#[derive(Clone, Debug)]
pub struct CommentConfig {
    /// Top-level comments per page.
    pub page_size: usize,
    /// Replies fetched on first expansion.
    pub reply_page_size: usize,
}

impl Default for CommentConfig {
    fn default() -> Self {
        Self {
            page_size: 20,
            reply_page_size: 50,
        }
    }
}

/// Expansion state of a comment node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    Collapsed,
    Loading,
    Expanded,
}

/// A top-level comment and its replies.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommentNode {
    pub comment_id: EntityId,
    pub reply_count: u64,
    /// Flips once, on the first successful expansion.
    pub replies_loaded: bool,
    /// Replies in display order.
    pub reply_ids: Vec<EntityId>,
    pub state: NodeState,
    /// Replies pushed while not expanded, oldest first.
    queued: Vec<EntityId>,
}

impl CommentNode {
    fn new(comment_id: EntityId, reply_count: u64) -> Self {
        Self {
            comment_id,
            reply_count,
            replies_loaded: false,
            reply_ids: Vec::new(),
            state: NodeState::Collapsed,
            queued: Vec::new(),
        }
    }

    /// Replies waiting to be merged on the next expansion.
    pub fn queued_count(&self) -> usize {
        self.queued.len()
    }

    fn holds(&self, id: &EntityId) -> bool {
        self.reply_ids.contains(id) || self.queued.contains(id)
    }

    /// Move queued replies into the list, skipping ones already present.
    fn drain_queue(&mut self) {
        for id in std::mem::take(&mut self.queued) {
            if !self.reply_ids.contains(&id) {
                self.reply_ids.push(id);
            }
        }
    }

    fn take_reply(&mut self, id: &EntityId) -> Option<ReplySlot> {
        if let Some(index) = self.reply_ids.iter().position(|i| i == id) {
            self.reply_ids.remove(index);
            return Some(ReplySlot::Listed(index));
        }
        if let Some(index) = self.queued.iter().position(|i| i == id) {
            self.queued.remove(index);
            return Some(ReplySlot::Queued(index));
        }
        None
    }
}

/// Where a reply sat inside its node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReplySlot {
    Listed(usize),
    Queued(usize),
}

/// Where a speculatively deleted comment sat.
#[derive(Clone, Debug, PartialEq, Eq)]
enum HiddenAt {
    Comment(usize),
    Reply {
        parent: EntityId,
        slot: Option<ReplySlot>,
    },
}

struct TreeState {
    load: PaginatorState,
    next_page: u32,
    /// Top-level comment ids in display order.
    comments: Vec<EntityId>,
    nodes: HashMap<EntityId, CommentNode>,
    hidden: HashMap<EntityId, HiddenAt>,
}

/// Comments and replies of one post.
pub struct CommentTree {
    post_id: EntityId,
    cache: Arc<EntityCache>,
    config: CommentConfig,
    state: Mutex<TreeState>,
    guards: Mutex<Vec<SubscriptionGuard>>,
}

impl CommentTree {
    /// Create a detached tree for `post_id`.
    pub fn new(post_id: EntityId, cache: Arc<EntityCache>, config: CommentConfig) -> Arc<Self> {
        Arc::new(Self {
            post_id,
            cache,
            config,
            state: Mutex::new(TreeState {
                load: PaginatorState::Empty,
                next_page: 1,
                comments: Vec::new(),
                nodes: HashMap::new(),
                hidden: HashMap::new(),
            }),
            guards: Mutex::new(Vec::new()),
        })
    }

    /// Start receiving comment events of this post.
    pub fn attach(self: &Arc<Self>, registry: &Arc<SubscriptionRegistry>) {
        let tree = Arc::downgrade(self);
        let token = registry.subscribe(
            Topic::PostComments,
            self.post_id.clone(),
            Arc::new(move |_, event| {
                if let Some(tree) = tree.upgrade() {
                    tree.on_event(event);
                }
            }),
        );
        self.guards.lock().push(registry.guard(token));
    }

    /// Stop receiving events.
    pub fn detach(&self) {
        self.guards.lock().clear();
    }

    // --- Accessors ---

    pub fn post_id(&self) -> &EntityId {
        &self.post_id
    }

    /// Loading state of the top-level list.
    pub fn load_state(&self) -> PaginatorState {
        self.state.lock().load
    }

    /// Top-level comment ids in display order.
    pub fn comments(&self) -> Vec<EntityId> {
        self.state.lock().comments.clone()
    }

    /// Top-level comments resolved through the cache.
    pub fn comment_entities(&self) -> Vec<Entity> {
        self.comments()
            .iter()
            .filter_map(|id| self.cache.get(id))
            .collect()
    }

    /// Snapshot of a node.
    pub fn node(&self, comment_id: &EntityId) -> Option<CommentNode> {
        self.state.lock().nodes.get(comment_id).cloned()
    }

    /// Replies currently shown under a comment (none while collapsed).
    pub fn visible_replies(&self, comment_id: &EntityId) -> Vec<EntityId> {
        self.state
            .lock()
            .nodes
            .get(comment_id)
            .filter(|node| node.state == NodeState::Expanded)
            .map(|node| node.reply_ids.clone())
            .unwrap_or_default()
    }

    // --- Top-level loading ---

    /// Claim the next page of top-level comments.
    pub fn begin_load_comments(&self) -> Result<PageRequest> {
        let mut state = self.state.lock();
        let next = match state.load {
            PaginatorState::Loading | PaginatorState::LoadingMore => {
                return Err(FeedError::PaginatorBusy)
            }
            PaginatorState::Exhausted => return Err(FeedError::PaginatorExhausted),
            PaginatorState::Empty => PaginatorState::Loading,
            PaginatorState::Ready => PaginatorState::LoadingMore,
        };
        state.load = next;

        Ok(PageRequest {
            resource: Resource::Comments(self.post_id.clone()),
            page: state.next_page,
            page_size: self.config.page_size,
        })
    }

    /// Merge a page of top-level comments.
    pub fn complete_load_comments(
        &self,
        request: &PageRequest,
        result: std::result::Result<Page, RemoteError>,
    ) -> Result<usize> {
        let mut state = self.state.lock();

        if !state.load.is_loading() {
            return Err(FeedError::InvalidTransition(format!(
                "comment page response while {:?}",
                state.load
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
                state.load = match state.load {
                    PaginatorState::Loading => PaginatorState::Empty,
                    _ => PaginatorState::Ready,
                };
                return Err(error.into());
            }
        };

        let mut added = 0;
        for comment in page.items {
            let id = comment.id.clone();
            let reply_count = comment.reply_count;
            if let CacheOutcome::Orphaned = self.cache.put(comment) {
                continue;
            }
            if state.comments.contains(&id) || state.hidden.contains_key(&id) {
                continue;
            }
            state.comments.push(id.clone());
            state
                .nodes
                .entry(id.clone())
                .or_insert_with(|| CommentNode::new(id, reply_count));
            added += 1;
        }

        state.next_page += 1;
        state.load = if page.has_more {
            PaginatorState::Ready
        } else {
            PaginatorState::Exhausted
        };
        Ok(added)
    }

    /// Fetch and merge the next page of top-level comments.
    pub fn load_comments(&self, source: &dyn PageSource) -> Result<usize> {
        let request = self.begin_load_comments()?;
        let result = source.get_page(&request.resource, request.page, request.page_size);
        self.complete_load_comments(&request, result)
    }

    // --- Expansion ---

    /// Expand a node.
    ///
    /// Returns the reply fetch to issue on first expansion, or `None` when
    /// the replies are already loaded and the node expanded immediately.
    pub fn begin_expand(&self, comment_id: &EntityId) -> Result<Option<PageRequest>> {
        let mut state = self.state.lock();
        let node = state
            .nodes
            .get_mut(comment_id)
            .ok_or_else(|| FeedError::CommentNotFound(comment_id.clone()))?;

        match node.state {
            NodeState::Loading => Err(FeedError::CommentBusy(comment_id.clone())),
            NodeState::Expanded => Ok(None),
            NodeState::Collapsed if node.replies_loaded => {
                node.drain_queue();
                node.state = NodeState::Expanded;
                Ok(None)
            }
            NodeState::Collapsed => {
                node.state = NodeState::Loading;
                debug!(comment = %comment_id, "fetching replies");
                Ok(Some(PageRequest {
                    resource: Resource::Replies(comment_id.clone()),
                    page: 1,
                    page_size: self.config.reply_page_size,
                }))
            }
        }
    }

    /// Merge fetched replies with replies pushed meanwhile.
    ///
    /// Pushed replies win for freshness: their cached value is kept over the
    /// fetched one. Returns the number of visible replies.
    pub fn complete_expand(
        &self,
        comment_id: &EntityId,
        result: std::result::Result<Page, RemoteError>,
    ) -> Result<usize> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let node = state
            .nodes
            .get_mut(comment_id)
            .ok_or_else(|| FeedError::CommentNotFound(comment_id.clone()))?;

        if node.state != NodeState::Loading {
            return Err(FeedError::InvalidTransition(format!(
                "reply response for {} while {:?}",
                comment_id, node.state
            )));
        }

        let page = match result {
            Ok(page) => page,
            Err(error) => {
                // Latch stays open so the next expansion retries.
                node.state = NodeState::Collapsed;
                return Err(error.into());
            }
        };

        let queued: HashSet<EntityId> = node.queued.iter().cloned().collect();
        let mut replies = Vec::with_capacity(page.items.len() + node.queued.len());
        for reply in page.items {
            let id = reply.id.clone();
            if state.hidden.contains_key(&id) || replies.contains(&id) {
                continue;
            }
            if !queued.contains(&id) {
                if let CacheOutcome::Orphaned = self.cache.put(reply) {
                    continue;
                }
            }
            replies.push(id);
        }

        node.reply_ids = replies;
        node.drain_queue();
        node.replies_loaded = true;
        node.state = NodeState::Expanded;
        node.reply_count = node.reply_count.max(node.reply_ids.len() as u64);

        trace!(comment = %comment_id, replies = node.reply_ids.len(), "expanded");
        Ok(node.reply_ids.len())
    }

    /// Expand a node, fetching replies from `source` on first expansion.
    pub fn expand(&self, comment_id: &EntityId, source: &dyn PageSource) -> Result<usize> {
        match self.begin_expand(comment_id)? {
            Some(request) => {
                let result = source.get_page(&request.resource, request.page, request.page_size);
                self.complete_expand(comment_id, result)
            }
            None => Ok(self.visible_replies(comment_id).len()),
        }
    }

    /// Collapse an expanded node. Loaded replies are kept.
    pub fn collapse(&self, comment_id: &EntityId) -> Result<()> {
        let mut state = self.state.lock();
        let node = state
            .nodes
            .get_mut(comment_id)
            .ok_or_else(|| FeedError::CommentNotFound(comment_id.clone()))?;

        match node.state {
            NodeState::Loading => Err(FeedError::CommentBusy(comment_id.clone())),
            _ => {
                node.state = NodeState::Collapsed;
                Ok(())
            }
        }
    }

    // --- Live events ---

    fn on_event(&self, event: &EntityEvent) {
        let mut state = self.state.lock();
        match event {
            EntityEvent::Upserted { entity, .. } if entity.kind == EntityKind::Comment => {
                match &entity.parent_id {
                    Some(parent) => state.add_reply(parent, &entity.id),
                    None => state.add_comment(entity),
                }
            }
            EntityEvent::Hidden(entity) => state.hide(entity),
            EntityEvent::Restored(entity) => state.restore(entity),
            EntityEvent::Removed { id, last } => state.remove(id, last.as_ref()),
            _ => {}
        }
    }
}

impl TreeState {
    fn add_comment(&mut self, comment: &Entity) {
        if self.comments.contains(&comment.id) || self.hidden.contains_key(&comment.id) {
            return;
        }
        self.comments.insert(0, comment.id.clone());
        self.nodes
            .entry(comment.id.clone())
            .or_insert_with(|| CommentNode::new(comment.id.clone(), comment.reply_count));
    }

    fn add_reply(&mut self, parent: &EntityId, reply: &EntityId) {
        if self.hidden.contains_key(reply) {
            return;
        }
        let Some(node) = self.nodes.get_mut(parent) else {
            trace!(parent = %parent, "reply for comment not in tree");
            return;
        };
        if node.holds(reply) {
            return;
        }

        node.reply_count += 1;
        match node.state {
            NodeState::Expanded => node.reply_ids.push(reply.clone()),
            NodeState::Collapsed | NodeState::Loading => node.queued.push(reply.clone()),
        }
    }

    fn hide(&mut self, comment: &Entity) {
        match &comment.parent_id {
            None => {
                if let Some(index) = self.comments.iter().position(|i| i == &comment.id) {
                    self.comments.remove(index);
                    self.hidden
                        .insert(comment.id.clone(), HiddenAt::Comment(index));
                }
            }
            Some(parent) => {
                let Some(node) = self.nodes.get_mut(parent) else {
                    return;
                };
                let slot = node.take_reply(&comment.id);
                node.reply_count = node.reply_count.saturating_sub(1);
                self.hidden.insert(
                    comment.id.clone(),
                    HiddenAt::Reply {
                        parent: parent.clone(),
                        slot,
                    },
                );
            }
        }
    }

    fn restore(&mut self, comment: &Entity) {
        let Some(hidden) = self.hidden.remove(&comment.id) else {
            return;
        };

        match hidden {
            HiddenAt::Comment(index) => {
                let index = index.min(self.comments.len());
                self.comments.insert(index, comment.id.clone());
            }
            HiddenAt::Reply { parent, slot } => {
                let Some(node) = self.nodes.get_mut(&parent) else {
                    return;
                };
                node.reply_count += 1;
                match slot {
                    Some(ReplySlot::Listed(index)) => {
                        let index = index.min(node.reply_ids.len());
                        node.reply_ids.insert(index, comment.id.clone());
                    }
                    Some(ReplySlot::Queued(index)) => {
                        let index = index.min(node.queued.len());
                        node.queued.insert(index, comment.id.clone());
                    }
                    None => {}
                }
            }
        }
    }

    fn remove(&mut self, id: &EntityId, last: Option<&Entity>) {
        // Already taken out (and counted) when it was hidden.
        if let Some(hidden) = self.hidden.remove(id) {
            if let HiddenAt::Comment(_) = hidden {
                self.nodes.remove(id);
            }
            return;
        }

        if let Some(index) = self.comments.iter().position(|i| i == id) {
            self.comments.remove(index);
            self.nodes.remove(id);
            return;
        }

        let parent = last.and_then(|e| e.parent_id.clone()).or_else(|| {
            self.nodes
                .iter()
                .find(|(_, node)| node.holds(id))
                .map(|(parent, _)| parent.clone())
        });
        let Some(parent) = parent else {
            return;
        };
        if let Some(node) = self.nodes.get_mut(&parent) {
            node.take_reply(id);
            node.reply_count = node.reply_count.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriptions::Delta;

    fn setup() -> (Arc<CommentTree>, Arc<SubscriptionRegistry>) {
        let cache = Arc::new(EntityCache::default());
        let registry = Arc::new(SubscriptionRegistry::new(Arc::clone(&cache)));
        let tree = CommentTree::new("p1".into(), cache, CommentConfig::default());
        tree.attach(&registry);

        let request = tree.begin_load_comments().unwrap();
        tree.complete_load_comments(
            &request,
            Ok(Page {
                items: vec![Entity::comment("c1", "p1", "alice", "first").with_reply_count(2)],
                has_more: false,
            }),
        )
        .unwrap();
        (tree, registry)
    }

    fn reply(id: &str) -> Entity {
        Entity::reply(id, "p1", "c1", "bob", "re")
    }

    fn replies(ids: &[&str]) -> Page {
        Page {
            items: ids.iter().map(|id| reply(id)).collect(),
            has_more: false,
        }
    }

    fn push_reply(registry: &SubscriptionRegistry, id: &str) {
        registry.publish(Topic::PostComments, "p1".into(), Delta::Upsert(reply(id)));
    }

    #[test]
    fn test_collapsed_push_updates_count_only() {
        let (tree, registry) = setup();
        push_reply(&registry, "r3");

        let node = tree.node(&"c1".into()).unwrap();
        assert_eq!(node.reply_count, 3);
        assert!(node.reply_ids.is_empty());
        assert_eq!(node.queued_count(), 1);
        assert!(!node.replies_loaded);
    }

    #[test]
    fn test_expand_merges_without_duplicates() {
        let (tree, registry) = setup();
        push_reply(&registry, "r3");

        let request = tree.begin_expand(&"c1".into()).unwrap();
        assert!(request.is_some());
        let visible = tree
            .complete_expand(&"c1".into(), Ok(replies(&["r1", "r2", "r3"])))
            .unwrap();

        assert_eq!(visible, 3);
        let node = tree.node(&"c1".into()).unwrap();
        assert_eq!(node.reply_ids, vec![EntityId::from("r1"), "r2".into(), "r3".into()]);
        assert_eq!(node.reply_count, 3);
        assert!(node.replies_loaded);
    }

    #[test]
    fn test_reexpand_does_not_refetch() {
        let (tree, _) = setup();
        tree.begin_expand(&"c1".into()).unwrap();
        tree.complete_expand(&"c1".into(), Ok(replies(&["r1", "r2"]))).unwrap();

        tree.collapse(&"c1".into()).unwrap();
        assert!(tree.visible_replies(&"c1".into()).is_empty());

        assert_eq!(tree.begin_expand(&"c1".into()).unwrap(), None);
        assert_eq!(tree.visible_replies(&"c1".into()).len(), 2);
    }

    #[test]
    fn test_expand_while_loading_rejected() {
        let (tree, _) = setup();
        tree.begin_expand(&"c1".into()).unwrap();
        assert!(matches!(
            tree.begin_expand(&"c1".into()),
            Err(FeedError::CommentBusy(_))
        ));
    }

    #[test]
    fn test_failed_expand_can_retry() {
        let (tree, _) = setup();
        tree.begin_expand(&"c1".into()).unwrap();
        let result = tree.complete_expand(&"c1".into(), Err(RemoteError::Network("offline".into())));
        assert!(result.is_err());

        let node = tree.node(&"c1".into()).unwrap();
        assert_eq!(node.state, NodeState::Collapsed);
        assert!(!node.replies_loaded);
        assert!(tree.begin_expand(&"c1".into()).unwrap().is_some());
    }

    #[test]
    fn test_expanded_push_is_spliced() {
        let (tree, registry) = setup();
        tree.begin_expand(&"c1".into()).unwrap();
        tree.complete_expand(&"c1".into(), Ok(replies(&["r1", "r2"]))).unwrap();

        push_reply(&registry, "r3");
        push_reply(&registry, "r3");

        assert_eq!(tree.visible_replies(&"c1".into()).len(), 3);
        assert_eq!(tree.node(&"c1".into()).unwrap().reply_count, 3);
    }

    #[test]
    fn test_push_during_loading_is_merged() {
        let (tree, registry) = setup();
        tree.begin_expand(&"c1".into()).unwrap();
        push_reply(&registry, "r3");
        tree.complete_expand(&"c1".into(), Ok(replies(&["r1", "r2"]))).unwrap();

        let visible = tree.visible_replies(&"c1".into());
        assert_eq!(visible, vec![EntityId::from("r1"), "r2".into(), "r3".into()]);
    }

    #[test]
    fn test_new_top_level_comment_prepends() {
        let (tree, registry) = setup();
        registry.publish(
            Topic::PostComments,
            "p1".into(),
            Delta::Upsert(Entity::comment("c2", "p1", "bob", "second")),
        );

        assert_eq!(tree.comments(), vec![EntityId::from("c2"), "c1".into()]);
        assert!(tree.node(&"c2".into()).is_some());
    }

    #[test]
    fn test_hidden_reply_restored() {
        let (tree, registry) = setup();
        tree.begin_expand(&"c1".into()).unwrap();
        tree.complete_expand(&"c1".into(), Ok(replies(&["r1", "r2"]))).unwrap();

        registry.publish(Topic::PostComments, "p1".into(), Delta::Hide("r1".into()));
        assert_eq!(tree.visible_replies(&"c1".into()), vec![EntityId::from("r2")]);
        assert_eq!(tree.node(&"c1".into()).unwrap().reply_count, 1);

        registry.publish(Topic::PostComments, "p1".into(), Delta::Restore("r1".into()));
        assert_eq!(tree.visible_replies(&"c1".into()), vec![EntityId::from("r1"), "r2".into()]);
        assert_eq!(tree.node(&"c1".into()).unwrap().reply_count, 2);
    }

    #[test]
    fn test_removed_comment_drops_node() {
        let (tree, registry) = setup();
        registry.publish(Topic::PostComments, "p1".into(), Delta::Remove("c1".into()));

        assert!(tree.comments().is_empty());
        assert!(tree.node(&"c1".into()).is_none());
    }

    #[test]
    fn test_removed_reply_by_others() {
        let (tree, registry) = setup();
        tree.begin_expand(&"c1".into()).unwrap();
        tree.complete_expand(&"c1".into(), Ok(replies(&["r1", "r2"]))).unwrap();

        registry.publish(Topic::PostComments, "p1".into(), Delta::Remove("r2".into()));
        assert_eq!(tree.visible_replies(&"c1".into()), vec![EntityId::from("r1")]);
        assert_eq!(tree.node(&"c1".into()).unwrap().reply_count, 1);
    }
}
