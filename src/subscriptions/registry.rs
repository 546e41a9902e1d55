//! Subscription registry: applies deltas to the cache and fans them out.

use crate::cache::{CacheOutcome, EntityCache};
use crate::types::EntityId;
use crossbeam_channel::{bounded, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

use super::types::{
    Callback, ChannelKey, ChannelMessage, Delta, DropReason, EntityEvent, PublishOutcome,
    SubscriptionGuard, SubscriptionHandle, SubscriptionToken, Topic,
};

/// Where a subscription listens.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum Target {
    Channel(ChannelKey),
    /// Every channel of a topic.
    Topic(Topic),
}

/// How a subscription receives events.
#[derive(Clone)]
enum Sink {
    Callback(Callback),
    Queue(Sender<ChannelMessage>),
}

/// Internal subscription state.
struct Subscriber {
    target: Target,
    sink: Sink,
}

/// Subscribers plus routing indexes.
#[derive(Default)]
struct Subscribers {
    /// Ordered by token, which is registration order.
    by_token: BTreeMap<SubscriptionToken, Subscriber>,
    by_channel: HashMap<ChannelKey, Vec<SubscriptionToken>>,
    by_topic: HashMap<Topic, Vec<SubscriptionToken>>,
}

impl Subscribers {
    fn insert(&mut self, token: SubscriptionToken, subscriber: Subscriber) {
        match &subscriber.target {
            Target::Channel(key) => self.by_channel.entry(key.clone()).or_default().push(token),
            Target::Topic(topic) => self.by_topic.entry(*topic).or_default().push(token),
        }
        self.by_token.insert(token, subscriber);
    }

    fn remove(&mut self, token: SubscriptionToken) -> Option<Subscriber> {
        let subscriber = self.by_token.remove(&token)?;
        match &subscriber.target {
            Target::Channel(key) => {
                if let Some(tokens) = self.by_channel.get_mut(key) {
                    tokens.retain(|t| *t != token);
                    if tokens.is_empty() {
                        self.by_channel.remove(key);
                    }
                }
            }
            Target::Topic(topic) => {
                if let Some(tokens) = self.by_topic.get_mut(topic) {
                    tokens.retain(|t| *t != token);
                    if tokens.is_empty() {
                        self.by_topic.remove(topic);
                    }
                }
            }
        }
        Some(subscriber)
    }

    /// Sinks listening on `key`, in registration order.
    fn matching(&self, key: &ChannelKey) -> Vec<(SubscriptionToken, Sink)> {
        let mut tokens: Vec<SubscriptionToken> = self
            .by_channel
            .get(key)
            .into_iter()
            .chain(self.by_topic.get(&key.topic))
            .flatten()
            .copied()
            .collect();
        tokens.sort();

        tokens
            .into_iter()
            .filter_map(|t| self.by_token.get(&t).map(|s| (t, s.sink.clone())))
            .collect()
    }
}

/// Per-channel dispatch bookkeeping.
#[derive(Default)]
struct DispatchState {
    /// Channels with a dispatch loop running.
    active: HashSet<ChannelKey>,
    /// Deltas published while their channel was active.
    queued: HashMap<ChannelKey, VecDeque<Delta>>,
}

/// Scoped publish/subscribe over the entity cache.
///
/// Per channel, events reach every subscriber in publish order. A publish
/// issued while the same channel is dispatching (from a callback, or from
/// another thread) is queued and drained by the running dispatch loop.
/// No lock is held while a callback runs, so callbacks may subscribe,
/// unsubscribe or publish freely.
pub struct SubscriptionRegistry {
    cache: Arc<EntityCache>,
    subscribers: RwLock<Subscribers>,
    dispatch: Mutex<DispatchState>,
    next_token: AtomicU64,
}

impl SubscriptionRegistry {
    /// Create a registry publishing into `cache`.
    pub fn new(cache: Arc<EntityCache>) -> Self {
        Self {
            cache,
            subscribers: RwLock::new(Subscribers::default()),
            dispatch: Mutex::new(DispatchState::default()),
            next_token: AtomicU64::new(1),
        }
    }

    /// The cache deltas are applied to.
    pub fn cache(&self) -> &Arc<EntityCache> {
        &self.cache
    }

    // --- Subscribing ---

    /// Subscribe a callback to one channel.
    pub fn subscribe(&self, topic: Topic, entity_id: EntityId, callback: Callback) -> SubscriptionToken {
        self.add(Target::Channel(ChannelKey::new(topic, entity_id)), Sink::Callback(callback))
    }

    /// Subscribe a callback to every channel of a topic.
    pub fn subscribe_topic(&self, topic: Topic, callback: Callback) -> SubscriptionToken {
        self.add(Target::Topic(topic), Sink::Callback(callback))
    }

    /// Subscribe a bounded queue to one channel.
    ///
    /// A subscriber whose queue is full when an event arrives is dropped.
    pub fn subscribe_channel(
        &self,
        topic: Topic,
        entity_id: EntityId,
        buffer_size: usize,
    ) -> SubscriptionHandle {
        let (sender, receiver) = bounded(buffer_size.max(1));
        let token = self.add(
            Target::Channel(ChannelKey::new(topic, entity_id)),
            Sink::Queue(sender),
        );
        SubscriptionHandle { token, receiver }
    }

    /// Wrap a token in a guard that unsubscribes on drop.
    pub fn guard(self: &Arc<Self>, token: SubscriptionToken) -> SubscriptionGuard {
        SubscriptionGuard::new(self, token)
    }

    fn add(&self, target: Target, sink: Sink) -> SubscriptionToken {
        let token = SubscriptionToken(self.next_token.fetch_add(1, Ordering::SeqCst));
        trace!(token = token.0, target = ?target, "subscribe");
        self.subscribers
            .write()
            .insert(token, Subscriber { target, sink });
        token
    }

    /// Remove a subscription. Safe to call repeatedly and from callbacks.
    ///
    /// Returns true if the subscription existed.
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        let removed = self.subscribers.write().remove(token);
        match removed {
            Some(subscriber) => {
                trace!(token = token.0, "unsubscribe");
                if let Sink::Queue(sender) = subscriber.sink {
                    let _ = sender.try_send(ChannelMessage::Dropped {
                        reason: DropReason::Unsubscribed,
                    });
                }
                true
            }
            None => false,
        }
    }

    /// Whether a subscription is live.
    pub fn is_subscribed(&self, token: SubscriptionToken) -> bool {
        self.subscribers.read().by_token.contains_key(&token)
    }

    /// Total live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscribers.read().by_token.len()
    }

    /// Subscriptions that would receive an event on this channel.
    pub fn subscriber_count(&self, topic: Topic, entity_id: &EntityId) -> usize {
        self.subscribers
            .read()
            .matching(&ChannelKey::new(topic, entity_id.clone()))
            .len()
    }

    // --- Publishing ---

    /// Apply `delta` to the cache and deliver the merged value to every
    /// subscriber of `(topic, entity_id)`.
    pub fn publish(&self, topic: Topic, entity_id: EntityId, delta: Delta) -> PublishOutcome {
        let key = ChannelKey::new(topic, entity_id);

        {
            let mut dispatch = self.dispatch.lock();
            if dispatch.active.contains(&key) {
                trace!(channel = ?key, "queueing delta behind running dispatch");
                dispatch.queued.entry(key).or_default().push_back(delta);
                return PublishOutcome::Queued;
            }
            dispatch.active.insert(key.clone());
        }

        let outcome = self.deliver(&key, delta);

        loop {
            let next = {
                let mut dispatch = self.dispatch.lock();
                match dispatch.queued.get_mut(&key).and_then(VecDeque::pop_front) {
                    Some(delta) => delta,
                    None => {
                        dispatch.queued.remove(&key);
                        dispatch.active.remove(&key);
                        break;
                    }
                }
            };
            self.deliver(&key, next);
        }

        outcome
    }

    /// Apply one delta and hand the result to subscribers.
    fn deliver(&self, key: &ChannelKey, delta: Delta) -> PublishOutcome {
        let event = match self.apply(delta) {
            Ok(event) => event,
            Err(outcome) => {
                debug!(channel = ?key, outcome = ?outcome, "delta not delivered");
                return outcome;
            }
        };

        let sinks = self.subscribers.read().matching(key);
        let mut delivered = 0;
        let mut overflowed = Vec::new();

        for (token, sink) in sinks {
            // An earlier callback may have unsubscribed this one.
            if !self.is_subscribed(token) {
                continue;
            }

            match sink {
                Sink::Callback(callback) => {
                    callback(key, &event);
                    delivered += 1;
                }
                Sink::Queue(sender) => {
                    let message = ChannelMessage::Event {
                        channel: key.clone(),
                        event: event.clone(),
                    };
                    match sender.try_send(message) {
                        Ok(()) => delivered += 1,
                        Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                            overflowed.push((token, sender));
                        }
                    }
                }
            }
        }

        if !overflowed.is_empty() {
            let mut subscribers = self.subscribers.write();
            for (token, sender) in overflowed {
                if subscribers.remove(token).is_some() {
                    debug!(token = token.0, "dropping slow subscriber");
                    let _ = sender.try_send(ChannelMessage::Dropped {
                        reason: DropReason::BufferOverflow,
                    });
                }
            }
        }

        PublishOutcome::Delivered {
            subscribers: delivered,
        }
    }

    /// Merge a delta into the cache, producing the event to deliver.
    fn apply(&self, delta: Delta) -> Result<EntityEvent, PublishOutcome> {
        match delta {
            Delta::Upsert(entity) => match self.cache.put(entity) {
                CacheOutcome::Applied(entity) => Ok(EntityEvent::Upserted {
                    created: entity.version.0 == 1,
                    entity,
                }),
                // Already cached, but this channel may not have seen it yet.
                CacheOutcome::Unchanged(entity) => Ok(EntityEvent::Upserted {
                    entity,
                    created: false,
                }),
                other => Err(rejected(&other)),
            },

            Delta::Patch { id, patch, version } => {
                match self.cache.patch(&id, &patch, version) {
                    // Hidden entities take the write silently until restored.
                    CacheOutcome::Applied(_) if self.cache.is_hidden(&id) => {
                        trace!(entity = %id, "patched hidden entity");
                        Err(PublishOutcome::Unchanged)
                    }
                    CacheOutcome::Applied(entity) => Ok(EntityEvent::Updated(entity)),
                    other => Err(rejected(&other)),
                }
            }

            Delta::Hide(id) => match self.cache.hide(&id) {
                CacheOutcome::Applied(entity) => Ok(EntityEvent::Hidden(entity)),
                other => Err(rejected(&other)),
            },

            Delta::Restore(id) => match self.cache.unhide(&id) {
                CacheOutcome::Applied(entity) => Ok(EntityEvent::Restored(entity)),
                other => Err(rejected(&other)),
            },

            Delta::Remove(id) => match self.cache.remove(&id) {
                CacheOutcome::Applied(entity) => Ok(EntityEvent::Removed {
                    id,
                    last: Some(entity),
                }),
                // Never cached, but views may still hold the id.
                CacheOutcome::Missing => Ok(EntityEvent::Removed { id, last: None }),
                other => Err(rejected(&other)),
            },

            Delta::Relationship {
                user,
                patch,
                version,
            } => match self.cache.patch_relationship(&user, &patch, version) {
                CacheOutcome::Applied(relationship) => Ok(EntityEvent::RelationshipChanged {
                    user,
                    relationship,
                }),
                other => Err(rejected(&other)),
            },
        }
    }
}

fn rejected<T>(outcome: &CacheOutcome<T>) -> PublishOutcome {
    match outcome {
        CacheOutcome::Stale => PublishOutcome::Stale,
        CacheOutcome::Orphaned => PublishOutcome::Orphaned,
        CacheOutcome::Missing => PublishOutcome::Missing,
        CacheOutcome::Applied(_) | CacheOutcome::Unchanged(_) => PublishOutcome::Unchanged,
    }
}
