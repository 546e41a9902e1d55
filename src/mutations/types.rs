//! Mutation types.

use crate::error::FailureKind;
use crate::subscriptions::ChannelKey;
use crate::types::{EntityId, EntityKind, RequestId, Timestamp, UserId, Version};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Mutable field of a target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Liked,
    Reposted,
    Following,
    Blocked,
    Content,
    /// Whether the entity exists (delete).
    Existence,
}

/// What a mutation acts on.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Target {
    Entity(EntityId),
    User(UserId),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Entity(id) => write!(f, "entity:{}", id),
            Target::User(id) => write!(f, "user:{}", id),
        }
    }
}

/// A user-initiated action.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Intent {
    ToggleLike(EntityId),
    ToggleRepost(EntityId),
    ToggleFollow(UserId),
    ToggleBlock(UserId),
    Edit { id: EntityId, content: String },
    Delete(EntityId),
}

impl Intent {
    pub fn target(&self) -> Target {
        match self {
            Intent::ToggleLike(id)
            | Intent::ToggleRepost(id)
            | Intent::Edit { id, .. }
            | Intent::Delete(id) => Target::Entity(id.clone()),
            Intent::ToggleFollow(user) | Intent::ToggleBlock(user) => Target::User(user.clone()),
        }
    }

    pub fn field(&self) -> Field {
        match self {
            Intent::ToggleLike(_) => Field::Liked,
            Intent::ToggleRepost(_) => Field::Reposted,
            Intent::ToggleFollow(_) => Field::Following,
            Intent::ToggleBlock(_) => Field::Blocked,
            Intent::Edit { .. } => Field::Content,
            Intent::Delete(_) => Field::Existence,
        }
    }
}

/// Value of a field as tracked by an overlay.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldValue {
    /// Boolean flag with its paired counter, if the field has one.
    Toggle { on: bool, count: Option<u64> },
    Content(String),
    Present(bool),
}

/// Transient record of a speculative change.
#[derive(Clone, Debug)]
pub struct Overlay {
    pub target: Target,
    pub field: Field,
    pub previous: FieldValue,
    pub speculative: FieldValue,
    pub request: RequestId,
    /// Channel the speculative value was published on.
    pub channel: ChannelKey,
    /// Target version right after speculation; a later version means other
    /// writes landed while the request was in flight.
    pub version_after: Option<Version>,
    pub origin: Option<OriginId>,
    pub deadline: Timestamp,
}

/// Identity of the component that started a mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OriginId(pub u64);

/// Ticket for a speculated mutation awaiting its remote result.
#[derive(Clone, Debug)]
pub struct PendingMutation {
    pub request: RequestId,
    pub intent: Intent,
    pub origin: Option<OriginId>,
    /// Kind of the target entity, for entity intents.
    pub kind: Option<EntityKind>,
    pub deadline: Timestamp,
}

/// Server acknowledgement of a mutation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Confirmation {
    /// Toggle result; `count` when the server reports an authoritative one.
    Toggle { on: bool, count: Option<u64> },
    /// Stored content after an edit.
    Edited { content: String },
    Deleted,
    /// Accepted without a payload; the speculative value stands.
    Accepted,
}

/// How a mutation ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MutationOutcome {
    /// The server accepted; `value` is now permanent.
    Confirmed { request: RequestId, value: FieldValue },
    /// Restored to `previous` after a failure.
    RolledBack {
        request: RequestId,
        kind: FailureKind,
        reason: String,
        previous: FieldValue,
    },
    /// Response for an overlay that no longer exists (already timed out).
    Discarded { request: RequestId },
}

impl MutationOutcome {
    pub fn request(&self) -> RequestId {
        match self {
            MutationOutcome::Confirmed { request, .. }
            | MutationOutcome::RolledBack { request, .. }
            | MutationOutcome::Discarded { request } => *request,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self, MutationOutcome::Confirmed { .. })
    }
}

/// User-visible failure notice.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notice {
    pub origin: Option<OriginId>,
    pub request: RequestId,
    pub kind: FailureKind,
    pub message: String,
}

/// Receives failure notices for display.
pub trait NoticeSink: Send + Sync {
    fn notify(&self, notice: Notice);
}

/// Sink that keeps notices until drained.
#[derive(Default)]
pub struct RecordingNotices {
    notices: Mutex<Vec<Notice>>,
}

impl RecordingNotices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take all pending notices.
    pub fn drain(&self) -> Vec<Notice> {
        std::mem::take(&mut *self.notices.lock())
    }

    pub fn len(&self) -> usize {
        self.notices.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.notices.lock().is_empty()
    }
}

impl NoticeSink for RecordingNotices {
    fn notify(&self, notice: Notice) {
        self.notices.lock().push(notice);
    }
}
