//! Mutation controller: speculate, commit, reconcile.

use crate::api::CommandApi;
use crate::cache::PinnedField;
use crate::error::{FeedError, RemoteError, Result};
use crate::subscriptions::{ChannelKey, Delta, SubscriptionRegistry, Topic};
use crate::types::{
    Entity, EntityId, EntityKind, EntityPatch, RelationshipPatch, RequestId, Timestamp, Version,
};
use crossbeam_channel::{bounded, RecvTimeoutError};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

use super::types::{
    Confirmation, Field, FieldValue, Intent, MutationOutcome, Notice, NoticeSink, OriginId,
    Overlay, PendingMutation, Target,
};

/// Mutation controller configuration.
#[derive(Clone, Debug)]
pub struct MutationConfig {
    /// How long a commit may take before it is rolled back.
    pub commit_timeout: Duration,
}

impl Default for MutationConfig {
    fn default() -> Self {
        Self {
            commit_timeout: Duration::from_secs(10),
        }
    }
}

type OverlayKey = (Target, Field);

/// Result of the speculate phase, before it is published.
struct Speculation {
    previous: FieldValue,
    speculative: FieldValue,
    channel: ChannelKey,
    delta: Delta,
    kind: Option<EntityKind>,
}

/// Runs user actions as optimistic mutations.
///
/// At most one overlay is live per `(target, field)`; a second action on
/// the same field while one is in flight is rejected, which is what keeps
/// repeated taps from double-submitting.
pub struct MutationController {
    registry: Arc<SubscriptionRegistry>,
    notices: Arc<dyn NoticeSink>,
    config: MutationConfig,
    /// Live overlays.
    overlays: Mutex<HashMap<OverlayKey, Overlay>>,
    /// Origins whose component is gone.
    detached: RwLock<HashSet<OriginId>>,
    next_request: AtomicU64,
    next_origin: AtomicU64,
}

impl MutationController {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        notices: Arc<dyn NoticeSink>,
        config: MutationConfig,
    ) -> Self {
        Self {
            registry,
            notices,
            config,
            overlays: Mutex::new(HashMap::new()),
            detached: RwLock::new(HashSet::new()),
            next_request: AtomicU64::new(1),
            next_origin: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &MutationConfig {
        &self.config
    }

    // --- Origins ---

    /// Allocate an origin id for a mounting component.
    pub fn register_origin(&self) -> OriginId {
        OriginId(self.next_origin.fetch_add(1, Ordering::SeqCst))
    }

    /// The component behind `origin` unmounted.
    ///
    /// Its in-flight mutations still reconcile against the cache, but their
    /// failures no longer raise notices.
    pub fn detach_origin(&self, origin: OriginId) {
        self.detached.write().insert(origin);
    }

    // --- Introspection ---

    /// Number of live overlays.
    pub fn in_flight(&self) -> usize {
        self.overlays.lock().len()
    }

    /// The live overlay for a field, if any.
    pub fn overlay(&self, target: &Target, field: Field) -> Option<Overlay> {
        self.overlays.lock().get(&(target.clone(), field)).cloned()
    }

    // --- Phases ---

    /// Guard and speculate.
    pub fn begin(&self, intent: Intent, origin: Option<OriginId>) -> Result<PendingMutation> {
        self.begin_at(intent, origin, Timestamp::now())
    }

    /// Guard and speculate, with an explicit clock for the commit deadline.
    pub fn begin_at(
        &self,
        intent: Intent,
        origin: Option<OriginId>,
        now: Timestamp,
    ) -> Result<PendingMutation> {
        let target = intent.target();
        let field = intent.field();
        let key = (target.clone(), field);
        let deadline = now.after(self.config.commit_timeout);

        let (request, channel, delta, kind) = {
            let mut overlays = self.overlays.lock();
            if overlays.contains_key(&key) {
                debug!(target = %target, field = ?field, "mutation already in flight, rejecting");
                return Err(FeedError::MutationInFlight {
                    target: target.to_string(),
                    field,
                });
            }

            let speculation = self.speculate(&intent)?;
            let request = RequestId(self.next_request.fetch_add(1, Ordering::SeqCst));

            overlays.insert(
                key.clone(),
                Overlay {
                    target: target.clone(),
                    field,
                    previous: speculation.previous,
                    speculative: speculation.speculative,
                    request,
                    channel: speculation.channel.clone(),
                    version_after: None,
                    origin,
                    deadline,
                },
            );
            if let Some((id, pinned)) = pinned_field(&target, field) {
                self.registry.cache().pin(id, pinned);
            }
            (request, speculation.channel, speculation.delta, speculation.kind)
        };

        self.registry.publish(channel.topic, channel.entity_id, delta);

        let version_after = self.target_version(&target);
        if let Some(overlay) = self.overlays.lock().get_mut(&key) {
            if overlay.request == request {
                overlay.version_after = version_after;
            }
        }

        debug!(request = %request, target = %target, field = ?field, "speculated");

        Ok(PendingMutation {
            request,
            intent,
            origin,
            kind,
            deadline,
        })
    }

    /// Reconcile a remote result.
    pub fn complete(
        &self,
        pending: &PendingMutation,
        result: std::result::Result<Confirmation, RemoteError>,
    ) -> MutationOutcome {
        let key = (pending.intent.target(), pending.intent.field());

        let overlay = {
            let mut overlays = self.overlays.lock();
            match overlays.get(&key) {
                Some(overlay) if overlay.request == pending.request => overlays.remove(&key),
                _ => None,
            }
        };

        let Some(overlay) = overlay else {
            debug!(request = %pending.request, "response for expired mutation, discarding");
            return MutationOutcome::Discarded {
                request: pending.request,
            };
        };

        match result {
            Ok(confirmation) => self.confirm(overlay, confirmation),
            Err(error) => self.rollback(overlay, error),
        }
    }

    /// Roll back every mutation whose commit deadline is at or before `now`.
    pub fn expire_overdue(&self, now: Timestamp) -> Vec<MutationOutcome> {
        let expired: Vec<Overlay> = {
            let mut overlays = self.overlays.lock();
            let keys: Vec<OverlayKey> = overlays
                .iter()
                .filter(|(_, overlay)| overlay.deadline <= now)
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter().filter_map(|key| overlays.remove(&key)).collect()
        };

        expired
            .into_iter()
            .map(|overlay| self.rollback(overlay, RemoteError::Timeout))
            .collect()
    }

    /// Run all three phases, blocking on the remote call for at most the
    /// commit timeout.
    ///
    /// The remote call runs on a worker thread. If it misses the window the
    /// mutation is rolled back and the eventual response is dropped.
    pub fn execute(
        &self,
        intent: Intent,
        origin: Option<OriginId>,
        api: Arc<dyn CommandApi>,
    ) -> Result<MutationOutcome> {
        let pending = self.begin(intent, origin)?;

        let (sender, receiver) = bounded(1);
        let call = pending.clone();
        let spawned = thread::Builder::new()
            .name("feedsync-commit".to_string())
            .spawn(move || {
                let _ = sender.send(call.send(api.as_ref()));
            });

        let result = match spawned {
            Ok(_) => match receiver.recv_timeout(self.config.commit_timeout) {
                Ok(result) => result,
                Err(RecvTimeoutError::Timeout) => Err(RemoteError::Timeout),
                Err(RecvTimeoutError::Disconnected) => {
                    Err(RemoteError::Network("commit worker exited".to_string()))
                }
            },
            Err(e) => Err(RemoteError::Network(e.to_string())),
        };

        Ok(self.complete(&pending, result))
    }

    /// Create a comment (or a reply when `parent` is set).
    ///
    /// Creation is not speculative: the comment only appears once the
    /// server returns it, at which point it is published to every view of
    /// the post.
    pub fn submit_comment(
        &self,
        post: &EntityId,
        parent: Option<&EntityId>,
        text: &str,
        origin: Option<OriginId>,
        api: &dyn CommandApi,
    ) -> Result<Entity> {
        let request = RequestId(self.next_request.fetch_add(1, Ordering::SeqCst));

        let mut comment = match api.create_comment(post, parent, text) {
            Ok(comment) => comment,
            Err(error) => {
                warn!(request = %request, post = %post, reason = %error, "comment creation failed");
                self.notify(origin, request, &error);
                return Err(error.into());
            }
        };

        comment.kind = EntityKind::Comment;
        comment.post_id.get_or_insert_with(|| post.clone());
        if comment.parent_id.is_none() {
            comment.parent_id = parent.cloned();
        }

        self.registry
            .publish(Topic::PostComments, post.clone(), Delta::Upsert(comment.clone()));

        if parent.is_none() {
            if let Some(current) = self.registry.cache().get(post) {
                self.registry.publish(
                    Topic::Post,
                    post.clone(),
                    Delta::patch(
                        post.clone(),
                        EntityPatch::comment_count(current.counters.comment + 1),
                    ),
                );
            }
        }

        debug!(request = %request, comment = %comment.id, "comment created");
        Ok(comment)
    }

    // --- Internals ---

    fn entity(&self, id: &EntityId) -> Result<Entity> {
        let cache = self.registry.cache();
        cache.get(id).ok_or_else(|| {
            if cache.is_removed(id) {
                FeedError::EntityRemoved(id.clone())
            } else {
                FeedError::EntityNotFound(id.clone())
            }
        })
    }

    fn speculate(&self, intent: &Intent) -> Result<Speculation> {
        let cache = self.registry.cache();

        let speculation = match intent {
            Intent::ToggleLike(id) => {
                let entity = self.entity(id)?;
                let on = entity.flags.is_liked;
                let count = entity.counters.like;
                let next = step(count, !on);
                Speculation {
                    previous: FieldValue::Toggle { on, count: Some(count) },
                    speculative: FieldValue::Toggle { on: !on, count: Some(next) },
                    channel: ChannelKey::for_entity(&entity),
                    delta: Delta::patch(id.clone(), EntityPatch::like(!on, next)),
                    kind: Some(entity.kind),
                }
            }

            Intent::ToggleRepost(id) => {
                let entity = self.entity(id)?;
                let on = entity.flags.is_reposted;
                let count = entity.counters.repost;
                let next = step(count, !on);
                Speculation {
                    previous: FieldValue::Toggle { on, count: Some(count) },
                    speculative: FieldValue::Toggle { on: !on, count: Some(next) },
                    channel: ChannelKey::for_entity(&entity),
                    delta: Delta::patch(id.clone(), EntityPatch::repost(!on, next)),
                    kind: Some(entity.kind),
                }
            }

            Intent::ToggleFollow(user) => {
                let on = cache.relationship(user).is_following;
                Speculation {
                    previous: FieldValue::Toggle { on, count: None },
                    speculative: FieldValue::Toggle { on: !on, count: None },
                    channel: ChannelKey::for_user(user),
                    delta: Delta::Relationship {
                        user: user.clone(),
                        patch: RelationshipPatch::following(!on),
                        version: None,
                    },
                    kind: None,
                }
            }

            Intent::ToggleBlock(user) => {
                let on = cache.relationship(user).is_blocked;
                Speculation {
                    previous: FieldValue::Toggle { on, count: None },
                    speculative: FieldValue::Toggle { on: !on, count: None },
                    channel: ChannelKey::for_user(user),
                    delta: Delta::Relationship {
                        user: user.clone(),
                        patch: RelationshipPatch::blocked(!on),
                        version: None,
                    },
                    kind: None,
                }
            }

            Intent::Edit { id, content } => {
                let entity = self.entity(id)?;
                Speculation {
                    previous: FieldValue::Content(entity.content.clone()),
                    speculative: FieldValue::Content(content.clone()),
                    channel: ChannelKey::for_entity(&entity),
                    delta: Delta::patch(id.clone(), EntityPatch::content(content.clone())),
                    kind: Some(entity.kind),
                }
            }

            Intent::Delete(id) => {
                let entity = self.entity(id)?;
                Speculation {
                    previous: FieldValue::Present(true),
                    speculative: FieldValue::Present(false),
                    channel: ChannelKey::for_entity(&entity),
                    delta: Delta::Hide(id.clone()),
                    kind: Some(entity.kind),
                }
            }
        };

        Ok(speculation)
    }

    fn confirm(&self, overlay: Overlay, confirmation: Confirmation) -> MutationOutcome {
        self.release(&overlay);
        let value = match (&overlay.speculative, confirmation) {
            (FieldValue::Toggle { .. }, Confirmation::Toggle { on, count }) => FieldValue::Toggle {
                on,
                count: self.confirmed_count(&overlay, on, count),
            },
            (FieldValue::Content(_), Confirmation::Edited { content }) => FieldValue::Content(content),
            (_, Confirmation::Accepted) | (FieldValue::Present(_), Confirmation::Deleted) => {
                overlay.speculative.clone()
            }
            (speculative, other) => {
                warn!(
                    request = %overlay.request,
                    confirmation = ?other,
                    "confirmation does not match mutation, keeping speculative value"
                );
                speculative.clone()
            }
        };

        if let Some(delta) = delta_for(&overlay, &value) {
            self.registry
                .publish(overlay.channel.topic, overlay.channel.entity_id.clone(), delta);
        }

        debug!(request = %overlay.request, target = %overlay.target, "mutation confirmed");
        MutationOutcome::Confirmed {
            request: overlay.request,
            value,
        }
    }

    fn rollback(&self, overlay: Overlay, error: RemoteError) -> MutationOutcome {
        self.release(&overlay);
        let restored = match (&overlay.previous, &overlay.speculative) {
            // Other writes landed in flight: undo only our own step.
            (
                FieldValue::Toggle { on, count: Some(previous) },
                FieldValue::Toggle { count: Some(speculative), .. },
            ) if self.target_version(&overlay.target) != overlay.version_after => {
                let current = self.current_count(&overlay).unwrap_or(*speculative);
                FieldValue::Toggle {
                    on: *on,
                    count: Some(shift(current, *previous, *speculative)),
                }
            }
            (previous, _) => previous.clone(),
        };

        if let Some(delta) = delta_for(&overlay, &restored) {
            self.registry
                .publish(overlay.channel.topic, overlay.channel.entity_id.clone(), delta);
        }

        warn!(
            request = %overlay.request,
            target = %overlay.target,
            field = ?overlay.field,
            reason = %error,
            "mutation rolled back"
        );
        self.notify(overlay.origin, overlay.request, &error);

        MutationOutcome::RolledBack {
            request: overlay.request,
            kind: error.kind(),
            reason: error.to_string(),
            previous: restored,
        }
    }

    /// Count to publish on success when the server reported none: the
    /// current count with our speculative step swapped for the confirmed one.
    fn confirmed_count(&self, overlay: &Overlay, on: bool, reported: Option<u64>) -> Option<u64> {
        if reported.is_some() {
            return reported;
        }

        let (
            FieldValue::Toggle { on: was_on, count: Some(previous) },
            FieldValue::Toggle { count: Some(speculative), .. },
        ) = (&overlay.previous, &overlay.speculative)
        else {
            return None;
        };

        let current = self.current_count(overlay).unwrap_or(*speculative);
        let without_step = shift(current, *previous, *speculative);
        let confirmed = if on == *was_on {
            without_step
        } else {
            step(without_step, on)
        };
        Some(confirmed)
    }

    /// Drop the cache pin held by a finished overlay.
    fn release(&self, overlay: &Overlay) {
        if let Some((id, pinned)) = pinned_field(&overlay.target, overlay.field) {
            self.registry.cache().unpin(id, pinned);
        }
    }

    fn current_count(&self, overlay: &Overlay) -> Option<u64> {
        let Target::Entity(id) = &overlay.target else {
            return None;
        };
        let entity = self.registry.cache().get_any(id)?;
        match overlay.field {
            Field::Liked => Some(entity.counters.like),
            Field::Reposted => Some(entity.counters.repost),
            _ => None,
        }
    }

    fn target_version(&self, target: &Target) -> Option<Version> {
        let cache = self.registry.cache();
        match target {
            Target::Entity(id) => cache.version(id),
            Target::User(user) => Some(cache.relationship(user).version),
        }
    }

    fn notify(&self, origin: Option<OriginId>, request: RequestId, error: &RemoteError) {
        if let Some(origin) = origin {
            if self.detached.read().contains(&origin) {
                debug!(request = %request, origin = origin.0, "origin detached, notice suppressed");
                return;
            }
        }

        let message = match error {
            RemoteError::Rejected { reason } => format!("Action failed: {}", reason),
            RemoteError::Network(_) => "Network error, please try again".to_string(),
            RemoteError::Timeout => "Request timed out, please try again".to_string(),
        };

        self.notices.notify(Notice {
            origin,
            request,
            kind: error.kind(),
            message,
        });
    }
}

impl PendingMutation {
    /// Issue the remote request for this mutation.
    pub fn send(&self, api: &dyn CommandApi) -> std::result::Result<Confirmation, RemoteError> {
        match &self.intent {
            Intent::ToggleLike(id) => api.toggle_like(id).map(|r| Confirmation::Toggle {
                on: r.liked,
                count: r.like_count,
            }),
            Intent::ToggleRepost(id) => api.toggle_repost(id).map(|r| Confirmation::Toggle {
                on: r.reposted,
                count: r.repost_count,
            }),
            Intent::ToggleFollow(user) => api.toggle_follow(user).map(|r| Confirmation::Toggle {
                on: r.is_following,
                count: None,
            }),
            Intent::ToggleBlock(user) => api.toggle_block(user).map(|r| Confirmation::Toggle {
                on: r.is_blocked,
                count: None,
            }),
            Intent::Edit { id, content } => api
                .edit(id, content)
                .map(|stored| Confirmation::Edited {
                    content: stored.content,
                }),
            Intent::Delete(id) => {
                let result = match self.kind {
                    Some(EntityKind::Comment) => api.delete_comment(id),
                    _ => api.delete_post(id),
                };
                result.map(|_| Confirmation::Deleted)
            }
        }
    }
}

/// Counter after toggling to `on`.
fn step(count: u64, on: bool) -> u64 {
    if on {
        count.saturating_add(1)
    } else {
        count.saturating_sub(1)
    }
}

/// `current` with the `previous -> speculative` step undone.
fn shift(current: u64, previous: u64, speculative: u64) -> u64 {
    let shifted = i128::from(current) - (i128::from(speculative) - i128::from(previous));
    u64::try_from(shifted.max(0)).unwrap_or(u64::MAX)
}

/// Cache field an overlay holds while in flight.
fn pinned_field(target: &Target, field: Field) -> Option<(&EntityId, PinnedField)> {
    let Target::Entity(id) = target else {
        return None;
    };
    let pinned = match field {
        Field::Liked => PinnedField::Like,
        Field::Reposted => PinnedField::Repost,
        Field::Content => PinnedField::Content,
        _ => return None,
    };
    Some((id, pinned))
}

/// Delta that writes `value` into the overlay's field.
fn delta_for(overlay: &Overlay, value: &FieldValue) -> Option<Delta> {
    match (&overlay.target, overlay.field, value) {
        (Target::Entity(id), Field::Liked, FieldValue::Toggle { on, count }) => Some(Delta::patch(
            id.clone(),
            EntityPatch {
                is_liked: Some(*on),
                like_count: *count,
                ..Default::default()
            },
        )),
        (Target::Entity(id), Field::Reposted, FieldValue::Toggle { on, count }) => {
            Some(Delta::patch(
                id.clone(),
                EntityPatch {
                    is_reposted: Some(*on),
                    repost_count: *count,
                    ..Default::default()
                },
            ))
        }
        (Target::User(user), Field::Following, FieldValue::Toggle { on, .. }) => {
            Some(Delta::Relationship {
                user: user.clone(),
                patch: RelationshipPatch::following(*on),
                version: None,
            })
        }
        (Target::User(user), Field::Blocked, FieldValue::Toggle { on, .. }) => {
            Some(Delta::Relationship {
                user: user.clone(),
                patch: RelationshipPatch::blocked(*on),
                version: None,
            })
        }
        (Target::Entity(id), Field::Content, FieldValue::Content(content)) => Some(Delta::patch(
            id.clone(),
            EntityPatch::content(content.clone()),
        )),
        (Target::Entity(id), Field::Existence, FieldValue::Present(true)) => {
            Some(Delta::Restore(id.clone()))
        }
        (Target::Entity(id), Field::Existence, FieldValue::Present(false)) => {
            Some(Delta::Remove(id.clone()))
        }
        _ => None,
    }
}
