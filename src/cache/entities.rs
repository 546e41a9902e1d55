//! Entity cache implementation.

use crate::types::{Entity, EntityId, EntityPatch, Relationship, RelationshipPatch, UserId, Version};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use tracing::{debug, trace};

/// Cache configuration.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// How many removed ids to remember.
    pub tombstone_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            tombstone_capacity: 10_000,
        }
    }
}

/// Result of a cache write.
#[derive(Clone, Debug, PartialEq)]
pub enum CacheOutcome<T> {
    /// The write was applied; carries the post-merge value.
    Applied(T),
    /// The write carried nothing new; carries the current value.
    Unchanged(T),
    /// The write's implied version was not newer than the cached one.
    Stale,
    /// The write referenced a removed entity.
    Orphaned,
    /// The write targeted an id the cache has never seen.
    Missing,
}

impl<T> CacheOutcome<T> {
    /// The post-write value, if the target exists.
    pub fn value(&self) -> Option<&T> {
        match self {
            CacheOutcome::Applied(v) | CacheOutcome::Unchanged(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            CacheOutcome::Applied(v) | CacheOutcome::Unchanged(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, CacheOutcome::Applied(_))
    }
}

/// Entity field owned by an in-flight local write.
///
/// While pinned, full-entity writes ([`EntityCache::put`]) keep the cached
/// value of the field instead of the incoming one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PinnedField {
    /// `is_liked` and the like counter.
    Like,
    /// `is_reposted` and the repost counter.
    Repost,
    Content,
}

impl PinnedField {
    fn keep(self, incoming: &mut Entity, cached: &Entity) {
        match self {
            PinnedField::Like => {
                incoming.flags.is_liked = cached.flags.is_liked;
                incoming.counters.like = cached.counters.like;
            }
            PinnedField::Repost => {
                incoming.flags.is_reposted = cached.flags.is_reposted;
                incoming.counters.repost = cached.counters.repost;
            }
            PinnedField::Content => incoming.content = cached.content.clone(),
        }
    }
}

/// A cached entity plus its visibility.
#[derive(Clone, Debug)]
struct Slot {
    entity: Entity,
    /// Speculatively deleted; invisible to reads until restored or removed.
    hidden: bool,
}

/// In-memory map from id to the last-known-good entity.
pub struct EntityCache {
    /// Posts and comments by id.
    entities: RwLock<HashMap<EntityId, Slot>>,

    /// Viewer relationships by user.
    relationships: RwLock<HashMap<UserId, Relationship>>,

    /// Ids removed for good.
    tombstones: Mutex<LruCache<EntityId, ()>>,

    /// Fields held by in-flight local writes.
    pins: RwLock<HashMap<EntityId, HashSet<PinnedField>>>,
}

impl EntityCache {
    /// Create an empty cache.
    pub fn new(config: CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.tombstone_capacity).unwrap_or(NonZeroUsize::MIN);

        Self {
            entities: RwLock::new(HashMap::new()),
            relationships: RwLock::new(HashMap::new()),
            tombstones: Mutex::new(LruCache::new(capacity)),
            pins: RwLock::new(HashMap::new()),
        }
    }

    // --- Reads ---

    /// Get a visible entity.
    pub fn get(&self, id: &EntityId) -> Option<Entity> {
        self.entities
            .read()
            .get(id)
            .filter(|slot| !slot.hidden)
            .map(|slot| slot.entity.clone())
    }

    /// Get an entity even if it is speculatively hidden.
    pub fn get_any(&self, id: &EntityId) -> Option<Entity> {
        self.entities.read().get(id).map(|slot| slot.entity.clone())
    }

    /// Whether a visible entity exists for `id`.
    pub fn contains(&self, id: &EntityId) -> bool {
        self.entities
            .read()
            .get(id)
            .map(|slot| !slot.hidden)
            .unwrap_or(false)
    }

    /// Whether `id` is speculatively hidden.
    pub fn is_hidden(&self, id: &EntityId) -> bool {
        self.entities
            .read()
            .get(id)
            .map(|slot| slot.hidden)
            .unwrap_or(false)
    }

    /// Whether `id` has been removed.
    pub fn is_removed(&self, id: &EntityId) -> bool {
        self.tombstones.lock().contains(id)
    }

    /// Local version of an entity.
    pub fn version(&self, id: &EntityId) -> Option<Version> {
        self.entities.read().get(id).map(|slot| slot.entity.version)
    }

    /// Number of cached entities (hidden included).
    pub fn len(&self) -> usize {
        self.entities.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.read().is_empty()
    }

    /// Viewer relationship with `user` (default if never seen).
    pub fn relationship(&self, user: &UserId) -> Relationship {
        self.relationships.read().get(user).copied().unwrap_or_default()
    }

    /// Users the viewer has blocked.
    pub fn blocked_users(&self) -> Vec<UserId> {
        self.relationships
            .read()
            .iter()
            .filter(|(_, relationship)| relationship.is_blocked)
            .map(|(user, _)| user.clone())
            .collect()
    }

    /// Whether `field` of `id` is held by an in-flight write.
    pub fn is_pinned(&self, id: &EntityId, field: PinnedField) -> bool {
        self.pins
            .read()
            .get(id)
            .map(|fields| fields.contains(&field))
            .unwrap_or(false)
    }

    // --- Pins ---

    /// Hold `field` of `id` against full-entity writes.
    pub fn pin(&self, id: &EntityId, field: PinnedField) {
        self.pins.write().entry(id.clone()).or_default().insert(field);
    }

    /// Release a pin taken with [`pin`](Self::pin).
    pub fn unpin(&self, id: &EntityId, field: PinnedField) {
        let mut pins = self.pins.write();
        if let Some(fields) = pins.get_mut(id) {
            fields.remove(&field);
            if fields.is_empty() {
                pins.remove(id);
            }
        }
    }

    // --- Writes ---

    /// Insert or merge a full entity.
    ///
    /// Every field of `entity` replaces the cached one, except pinned fields,
    /// which keep their cached value; the local version is bumped past the
    /// cached version. An entity whose remote version is older than the
    /// cached one is rejected as stale.
    pub fn put(&self, mut entity: Entity) -> CacheOutcome<Entity> {
        if self.is_removed(&entity.id) {
            debug!(entity = %entity.id, "dropping write for removed entity");
            return CacheOutcome::Orphaned;
        }

        let mut entities = self.entities.write();
        match entities.get_mut(&entity.id) {
            Some(slot) => {
                if entity.remote_version < slot.entity.remote_version {
                    debug!(
                        entity = %entity.id,
                        cached = ?slot.entity.remote_version,
                        incoming = ?entity.remote_version,
                        "dropping stale entity"
                    );
                    return CacheOutcome::Stale;
                }

                if let Some(fields) = self.pins.read().get(&entity.id) {
                    for field in fields {
                        field.keep(&mut entity, &slot.entity);
                    }
                }

                entity.version = slot.entity.version;
                if entity == slot.entity {
                    return CacheOutcome::Unchanged(entity);
                }

                entity.version = slot.entity.version.next();
                slot.entity = entity.clone();
                trace!(entity = %entity.id, version = ?entity.version, "merged entity");
                CacheOutcome::Applied(entity)
            }
            None => {
                entity.version = Version(1);
                entities.insert(
                    entity.id.clone(),
                    Slot {
                        entity: entity.clone(),
                        hidden: false,
                    },
                );
                trace!(entity = %entity.id, "cached new entity");
                CacheOutcome::Applied(entity)
            }
        }
    }

    /// Apply a partial update.
    ///
    /// With an implied version, the patch is a no-op unless that version is
    /// newer than the cached remote version. Local (speculative) writes pass
    /// `None` and always apply.
    pub fn patch(
        &self,
        id: &EntityId,
        patch: &EntityPatch,
        implied: Option<Version>,
    ) -> CacheOutcome<Entity> {
        if self.is_removed(id) {
            debug!(entity = %id, "dropping patch for removed entity");
            return CacheOutcome::Orphaned;
        }

        let mut entities = self.entities.write();
        let Some(slot) = entities.get_mut(id) else {
            return CacheOutcome::Missing;
        };

        if let Some(version) = implied {
            if version <= slot.entity.remote_version {
                debug!(
                    entity = %id,
                    cached = ?slot.entity.remote_version,
                    incoming = ?version,
                    "dropping stale patch"
                );
                return CacheOutcome::Stale;
            }
            slot.entity.remote_version = version;
        }

        let changed = patch.apply(&mut slot.entity);
        if changed || implied.is_some() {
            slot.entity.version = slot.entity.version.next();
            CacheOutcome::Applied(slot.entity.clone())
        } else {
            CacheOutcome::Unchanged(slot.entity.clone())
        }
    }

    /// Hide an entity pending a delete confirmation.
    pub fn hide(&self, id: &EntityId) -> CacheOutcome<Entity> {
        self.set_hidden(id, true)
    }

    /// Undo [`hide`](Self::hide).
    pub fn unhide(&self, id: &EntityId) -> CacheOutcome<Entity> {
        self.set_hidden(id, false)
    }

    fn set_hidden(&self, id: &EntityId, hidden: bool) -> CacheOutcome<Entity> {
        if self.is_removed(id) {
            return CacheOutcome::Orphaned;
        }

        let mut entities = self.entities.write();
        match entities.get_mut(id) {
            Some(slot) if slot.hidden == hidden => CacheOutcome::Unchanged(slot.entity.clone()),
            Some(slot) => {
                slot.hidden = hidden;
                slot.entity.version = slot.entity.version.next();
                CacheOutcome::Applied(slot.entity.clone())
            }
            None => CacheOutcome::Missing,
        }
    }

    /// Remove an entity for good.
    ///
    /// Returns the removed entity if it was cached. The id is tombstoned
    /// either way so that later events never resurrect it.
    pub fn remove(&self, id: &EntityId) -> CacheOutcome<Entity> {
        let mut tombstones = self.tombstones.lock();
        if tombstones.contains(id) {
            return CacheOutcome::Orphaned;
        }
        tombstones.put(id.clone(), ());
        drop(tombstones);

        match self.entities.write().remove(id) {
            Some(slot) => {
                debug!(entity = %id, "removed entity");
                CacheOutcome::Applied(slot.entity)
            }
            None => CacheOutcome::Missing,
        }
    }

    /// Apply a partial relationship update.
    pub fn patch_relationship(
        &self,
        user: &UserId,
        patch: &RelationshipPatch,
        implied: Option<Version>,
    ) -> CacheOutcome<Relationship> {
        let mut relationships = self.relationships.write();
        let relationship = relationships.entry(user.clone()).or_default();

        if let Some(version) = implied {
            if version <= relationship.remote_version {
                debug!(user = %user, "dropping stale relationship patch");
                return CacheOutcome::Stale;
            }
            relationship.remote_version = version;
        }

        let changed = patch.apply(relationship);
        if changed || implied.is_some() {
            relationship.version = relationship.version.next();
            CacheOutcome::Applied(*relationship)
        } else {
            CacheOutcome::Unchanged(*relationship)
        }
    }
}

impl Default for EntityCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}
