//! End-to-end scenarios through the engine.

mod common;

use common::{init_tracing, posts, FakeApi, FakePages};
use feedsync::{
    Confirmation, Engine, EngineConfig, Entity, EntityId, FailureKind, FieldValue,
    Intent, MutationOutcome, Page, PaginatorState, PushEvent, RecordingNotices, RemoteError,
    Resource, UserId,
};
use std::sync::Arc;
use std::time::Duration;

fn engine() -> (Engine, Arc<RecordingNotices>) {
    init_tracing();
    let notices = Arc::new(RecordingNotices::new());
    let engine = Engine::new(EngineConfig::default(), notices.clone());
    (engine, notices)
}

fn like_state(engine: &Engine, id: &str) -> (u64, bool) {
    let entity = engine.cache().get(&id.into()).unwrap();
    (entity.counters.like, entity.flags.is_liked)
}

fn ids(items: Vec<EntityId>) -> Vec<String> {
    items.into_iter().map(|id| id.0).collect()
}

// =============================================================================
// OPTIMISTIC LIKE
// =============================================================================

#[test]
fn test_like_confirmed_keeps_speculative_state() {
    let (engine, notices) = engine();
    engine
        .cache()
        .put(Entity::post("p1", "alice", "hello").with_counters(4, 0, 0));

    let pending = engine
        .mutations()
        .begin(Intent::ToggleLike("p1".into()), None)
        .unwrap();
    assert_eq!(like_state(&engine, "p1"), (5, true));

    let outcome = engine.mutations().complete(
        &pending,
        Ok(Confirmation::Toggle {
            on: true,
            count: None,
        }),
    );

    assert!(outcome.is_confirmed());
    assert_eq!(like_state(&engine, "p1"), (5, true));
    assert!(notices.is_empty());
    assert_eq!(engine.mutations().in_flight(), 0);
}

#[test]
fn test_like_failure_reverts_and_notifies_once() {
    let (engine, notices) = engine();
    engine
        .cache()
        .put(Entity::post("p1", "alice", "hello").with_counters(4, 0, 0));

    let pending = engine
        .mutations()
        .begin(Intent::ToggleLike("p1".into()), None)
        .unwrap();
    assert_eq!(like_state(&engine, "p1"), (5, true));

    let outcome = engine
        .mutations()
        .complete(&pending, Err(RemoteError::Network("connection reset".into())));

    assert!(matches!(
        outcome,
        MutationOutcome::RolledBack {
            kind: FailureKind::NetworkFailure,
            ..
        }
    ));
    assert_eq!(like_state(&engine, "p1"), (4, false));

    let notices = notices.drain();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].kind, FailureKind::NetworkFailure);
}

#[test]
fn test_execute_against_api() {
    let (engine, notices) = engine();
    engine
        .cache()
        .put(Entity::post("p1", "alice", "hello").with_counters(4, 0, 0));
    let api = Arc::new(FakeApi::new());

    let outcome = engine
        .mutations()
        .execute(Intent::ToggleLike("p1".into()), None, api.clone())
        .unwrap();

    assert!(outcome.is_confirmed());
    assert_eq!(api.calls(), vec!["like:p1".to_string()]);
    assert_eq!(like_state(&engine, "p1"), (5, true));
    assert!(notices.is_empty());
}

#[test]
fn test_execute_timeout_rolls_back() {
    init_tracing();
    let notices = Arc::new(RecordingNotices::new());
    let engine = Engine::new(
        EngineConfig {
            commit_timeout: Duration::from_millis(50),
            ..Default::default()
        },
        notices.clone(),
    );
    engine
        .cache()
        .put(Entity::post("p1", "alice", "hello").with_counters(4, 0, 0));

    let api = Arc::new(FakeApi::new());
    api.delay(Duration::from_millis(500));

    let outcome = engine
        .mutations()
        .execute(Intent::ToggleLike("p1".into()), None, api.clone())
        .unwrap();

    assert!(matches!(
        outcome,
        MutationOutcome::RolledBack {
            kind: FailureKind::NetworkFailure,
            ..
        }
    ));
    assert_eq!(like_state(&engine, "p1"), (4, false));
    assert_eq!(notices.len(), 1);

    // The field is free again even though the slow call is still running.
    assert!(engine
        .mutations()
        .begin(Intent::ToggleLike("p1".into()), None)
        .is_ok());
}

fn like_with_page_in_flight(
    result: Result<Confirmation, RemoteError>,
) -> (Engine, Arc<RecordingNotices>) {
    let (engine, notices) = engine();
    engine
        .cache()
        .put(Entity::post("p1", "alice", "hello").with_counters(4, 0, 0));
    let pages = FakePages::new();
    pages.serve(
        Resource::Feed("home".into()),
        vec![Page {
            items: vec![Entity::post("p1", "alice", "hello").with_counters(4, 1, 0)],
            has_more: false,
        }],
    );

    let pending = engine
        .mutations()
        .begin(Intent::ToggleLike("p1".into()), None)
        .unwrap();
    let feed = engine.home_feed();
    feed.load_more(&pages).unwrap();

    // The page carries the pre-tap like state; the tap still shows.
    assert_eq!(like_state(&engine, "p1"), (5, true));
    assert_eq!(engine.cache().get(&"p1".into()).unwrap().counters.comment, 1);

    engine.mutations().complete(&pending, result);
    (engine, notices)
}

#[test]
fn test_page_during_like_then_failure_restores() {
    let (engine, notices) =
        like_with_page_in_flight(Err(RemoteError::Network("connection reset".into())));
    assert_eq!(like_state(&engine, "p1"), (4, false));
    assert_eq!(notices.len(), 1);
}

#[test]
fn test_page_during_like_then_confirm_counts_once() {
    let (engine, notices) = like_with_page_in_flight(Ok(Confirmation::Toggle {
        on: true,
        count: None,
    }));
    assert_eq!(like_state(&engine, "p1"), (5, true));
    assert!(notices.is_empty());
}

#[test]
fn test_like_visible_in_every_view() {
    let (engine, _) = engine();
    let pages = FakePages::new();
    pages.serve(Resource::Feed("home".into()), vec![posts(&["p1", "p2"], "alice", false)]);
    pages.serve(Resource::Feed("alice".into()), vec![posts(&["p1"], "alice", false)]);

    let home = engine.home_feed();
    let profile = engine.feed("alice");
    home.load_more(&pages).unwrap();
    profile.load_more(&pages).unwrap();

    engine
        .mutations()
        .begin(Intent::ToggleLike("p1".into()), None)
        .unwrap();

    let from_home = home.entities().into_iter().find(|e| e.id.0 == "p1").unwrap();
    let from_profile = profile.entities().into_iter().find(|e| e.id.0 == "p1").unwrap();
    assert_eq!(from_home.counters.like, 1);
    assert_eq!(from_home, from_profile);
}

// =============================================================================
// COMMENT TREE
// =============================================================================

#[test]
fn test_reply_pushed_while_collapsed_then_expanded() {
    let (engine, _) = engine();
    let pages = FakePages::new();
    pages.serve(
        Resource::Comments("p1".into()),
        vec![Page {
            items: vec![Entity::comment("c1", "p1", "alice", "first").with_reply_count(2)],
            has_more: false,
        }],
    );

    let tree = engine.comment_tree("p1".into());
    tree.load_comments(&pages).unwrap();

    engine.handle_event(PushEvent::NewReply {
        reply: Entity::reply("r3", "p1", "c1", "carol", "late"),
    });

    let node = tree.node(&"c1".into()).unwrap();
    assert_eq!(node.reply_count, 3);
    assert!(node.reply_ids.is_empty());
    assert!(!node.replies_loaded);

    pages.serve(
        Resource::Replies("c1".into()),
        vec![Page {
            items: vec![
                Entity::reply("r1", "p1", "c1", "bob", "one"),
                Entity::reply("r2", "p1", "c1", "bob", "two"),
                Entity::reply("r3", "p1", "c1", "carol", "late"),
            ],
            has_more: false,
        }],
    );
    assert_eq!(tree.expand(&"c1".into(), &pages).unwrap(), 3);

    assert_eq!(ids(tree.visible_replies(&"c1".into())), vec!["r1", "r2", "r3"]);

    // Collapse and expand again without another fetch.
    tree.collapse(&"c1".into()).unwrap();
    tree.expand(&"c1".into(), &pages).unwrap();
    let reply_fetches = pages
        .requests()
        .into_iter()
        .filter(|(resource, _)| matches!(resource, Resource::Replies(_)))
        .count();
    assert_eq!(reply_fetches, 1);
}

#[test]
fn test_submitted_reply_reaches_tree() {
    let (engine, _) = engine();
    let pages = FakePages::new();
    pages.serve(
        Resource::Comments("p1".into()),
        vec![Page {
            items: vec![Entity::comment("c1", "p1", "alice", "first")],
            has_more: false,
        }],
    );
    pages.serve(Resource::Replies("c1".into()), vec![Page::default()]);

    let tree = engine.comment_tree("p1".into());
    tree.load_comments(&pages).unwrap();
    tree.expand(&"c1".into(), &pages).unwrap();

    let api = FakeApi::new();
    let reply = engine
        .mutations()
        .submit_comment(&"p1".into(), Some(&"c1".into()), "thanks", None, &api)
        .unwrap();

    assert_eq!(tree.visible_replies(&"c1".into()), vec![reply.id]);
    assert_eq!(tree.node(&"c1".into()).unwrap().reply_count, 1);
}

#[test]
fn test_failed_comment_delete_reinserts() {
    let (engine, notices) = engine();
    let pages = FakePages::new();
    pages.serve(
        Resource::Comments("p1".into()),
        vec![Page {
            items: vec![
                Entity::comment("c1", "p1", "alice", "one"),
                Entity::comment("c2", "p1", "alice", "two"),
                Entity::comment("c3", "p1", "alice", "three"),
            ],
            has_more: false,
        }],
    );
    let tree = engine.comment_tree("p1".into());
    tree.load_comments(&pages).unwrap();

    let pending = engine
        .mutations()
        .begin(Intent::Delete("c2".into()), None)
        .unwrap();
    assert_eq!(ids(tree.comments()), vec!["c1", "c3"]);

    let api = FakeApi::new();
    api.fail_with(RemoteError::rejected("not_authorized"));
    let result = pending.send(&api);
    assert_eq!(api.calls(), vec!["delete_comment:c2".to_string()]);

    engine.mutations().complete(&pending, result);
    assert_eq!(ids(tree.comments()), vec!["c1", "c2", "c3"]);
    assert_eq!(notices.drain()[0].message, "Action failed: not_authorized");
}

// =============================================================================
// FEED
// =============================================================================

#[test]
fn test_new_post_at_top_and_scrolled_down() {
    let (engine, _) = engine();
    let pages = FakePages::new();
    pages.serve(Resource::Feed("home".into()), vec![posts(&["a", "b"], "alice", true)]);

    let feed = engine.home_feed();
    feed.load_more(&pages).unwrap();
    assert_eq!(feed.state(), PaginatorState::Ready);

    engine.handle_event(PushEvent::NewPost {
        post: Entity::post("n1", "bob", "fresh"),
        feed: None,
    });
    assert_eq!(ids(feed.items()), vec!["n1", "a", "b"]);
    assert_eq!(feed.pending_count(), 0);

    feed.set_at_top(false);
    engine.handle_event(PushEvent::NewPost {
        post: Entity::post("n2", "bob", "fresher"),
        feed: None,
    });
    assert_eq!(ids(feed.items()), vec!["n1", "a", "b"]);
    assert_eq!(feed.pending_count(), 1);

    assert_eq!(feed.reveal_pending(), 1);
    assert_eq!(ids(feed.items()), vec!["n2", "n1", "a", "b"]);
}

#[test]
fn test_failed_post_delete_restores_position() {
    let (engine, _) = engine();
    let pages = FakePages::new();
    pages.serve(Resource::Feed("home".into()), vec![posts(&["a", "b", "c"], "alice", false)]);
    let feed = engine.home_feed();
    feed.load_more(&pages).unwrap();

    let pending = engine
        .mutations()
        .begin(Intent::Delete("b".into()), None)
        .unwrap();
    assert_eq!(ids(feed.items()), vec!["a", "c"]);

    let outcome = engine
        .mutations()
        .complete(&pending, Err(RemoteError::Network("offline".into())));
    assert!(matches!(
        outcome,
        MutationOutcome::RolledBack {
            previous: FieldValue::Present(true),
            ..
        }
    ));
    assert_eq!(ids(feed.items()), vec!["a", "b", "c"]);
}

#[test]
fn test_confirmed_delete_is_final() {
    let (engine, _) = engine();
    let pages = FakePages::new();
    pages.serve(Resource::Feed("home".into()), vec![posts(&["a", "b"], "alice", false)]);
    let feed = engine.home_feed();
    feed.load_more(&pages).unwrap();

    let api = Arc::new(FakeApi::new());
    engine
        .mutations()
        .execute(Intent::Delete("a".into()), None, api)
        .unwrap();
    assert_eq!(ids(feed.items()), vec!["b"]);
    assert!(engine.cache().is_removed(&"a".into()));

    // A late count update for the deleted post is ignored.
    engine.handle_event(PushEvent::LikeCountUpdate {
        post_id: "a".into(),
        count: 10,
        version: Some(5),
    });
    assert!(engine.cache().get(&"a".into()).is_none());
}

#[test]
fn test_block_purges_and_rollback_restores() {
    let (engine, _) = engine();
    let pages = FakePages::new();
    pages.serve(
        Resource::Feed("home".into()),
        vec![Page {
            items: vec![
                Entity::post("a", "alice", "x"),
                Entity::post("b", "mallory", "x"),
                Entity::post("c", "alice", "x"),
            ],
            has_more: false,
        }],
    );
    let feed = engine.home_feed();
    feed.load_more(&pages).unwrap();

    let mallory = UserId::from("mallory");
    let pending = engine
        .mutations()
        .begin(Intent::ToggleBlock(mallory.clone()), None)
        .unwrap();
    assert_eq!(ids(feed.items()), vec!["a", "c"]);
    assert!(feed.is_blocked(&mallory));

    engine
        .mutations()
        .complete(&pending, Err(RemoteError::rejected("already_blocked")));
    assert_eq!(ids(feed.items()), vec!["a", "b", "c"]);
    assert!(!feed.is_blocked(&mallory));
}

#[test]
fn test_feed_mounted_after_block_hides_author() {
    let (engine, _) = engine();
    let api = Arc::new(FakeApi::new());
    let mallory = UserId::from("mallory");
    let outcome = engine
        .mutations()
        .execute(Intent::ToggleBlock(mallory.clone()), None, api)
        .unwrap();
    assert!(outcome.is_confirmed());
    assert!(engine.cache().relationship(&mallory).is_blocked);

    let pages = FakePages::new();
    pages.serve(
        Resource::Feed("home".into()),
        vec![posts(&["m1"], "mallory", false)],
    );
    let feed = engine.home_feed();
    feed.load_more(&pages).unwrap();
    engine.handle_event(PushEvent::NewPost {
        post: Entity::post("m2", "mallory", "again"),
        feed: None,
    });

    assert!(feed.items().is_empty());
    assert!(feed.is_blocked(&mallory));
}

#[test]
fn test_new_repost_enters_feed() {
    let (engine, _) = engine();
    let pages = FakePages::new();
    pages.serve(Resource::Feed("home".into()), vec![posts(&["p1"], "alice", false)]);
    let feed = engine.home_feed();
    feed.load_more(&pages).unwrap();

    engine.handle_event(PushEvent::NewRepost {
        repost: Entity::post("rp1", "bob", "").with_repost_of("p1"),
        original_id: "p1".into(),
        repost_count: 1,
    });

    assert_eq!(ids(feed.items()), vec!["rp1", "p1"]);
    assert_eq!(engine.cache().get(&"p1".into()).unwrap().counters.repost, 1);
}

// =============================================================================
// LIFECYCLE
// =============================================================================

#[test]
fn test_unmounted_origin_reconciles_without_notice() {
    let (engine, notices) = engine();
    engine
        .cache()
        .put(Entity::post("p1", "alice", "hello").with_counters(4, 0, 0));

    let origin = engine.mutations().register_origin();
    let pending = engine
        .mutations()
        .begin(Intent::ToggleLike("p1".into()), Some(origin))
        .unwrap();
    engine.mutations().detach_origin(origin);

    engine
        .mutations()
        .complete(&pending, Err(RemoteError::Timeout));

    assert_eq!(like_state(&engine, "p1"), (4, false));
    assert!(notices.is_empty());
}

#[test]
fn test_rooms_and_media_follow_mounts() {
    let (engine, _) = engine();
    let room = feedsync::RoomTracker::post_room(&"p1".into());

    assert!(engine.rooms().join(&room));
    assert!(!engine.rooms().join(&room));
    assert!(!engine.rooms().leave(&room));
    assert!(engine.rooms().leave(&room));

    let media = engine.media();
    media.register("v1".into(), true);
    media.register("v2".into(), true);
    media.set_visible(&"v1".into(), true);
    media.set_visible(&"v2".into(), true);
    assert!(media.is_playing(&"v2".into()));

    media.unregister(&"v2".into());
    assert!(media.is_playing(&"v1".into()));
}
