//! Error types for the feed engine.

use crate::mutations::Field;
use crate::types::EntityId;
use std::fmt;
use thiserror::Error;

/// Main error type for engine operations.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("Entity not found: {0}")]
    EntityNotFound(EntityId),

    #[error("Entity was removed: {0}")]
    EntityRemoved(EntityId),

    #[error("Mutation already in flight for {target} ({field:?})")]
    MutationInFlight { target: String, field: Field },

    #[error("Rejected by server: {reason}")]
    RemoteRejected { reason: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Paginator busy: a page request is already in flight")]
    PaginatorBusy,

    #[error("Paginator exhausted: no more pages")]
    PaginatorExhausted,

    #[error("Unexpected page response: expected page {expected}, got {got}")]
    PageMismatch { expected: u32, got: u32 },

    #[error("Comment node not found: {0}")]
    CommentNotFound(EntityId),

    #[error("Comment node busy: replies are already loading for {0}")]
    CommentBusy(EntityId),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

impl From<serde_json::Error> for FeedError {
    fn from(e: serde_json::Error) -> Self {
        if e.is_data() || e.is_syntax() || e.is_eof() {
            FeedError::Deserialization(e.to_string())
        } else {
            FeedError::Serialization(e.to_string())
        }
    }
}

impl From<rmp_serde::encode::Error> for FeedError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        FeedError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for FeedError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        FeedError::Deserialization(e.to_string())
    }
}

/// Failure reported by the remote command surface.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// Server declined the request, with a machine-readable reason.
    #[error("rejected: {reason}")]
    Rejected { reason: String },

    /// Request never reached the server.
    #[error("network: {0}")]
    Network(String),

    /// No response within the commit window.
    #[error("timed out")]
    Timeout,
}

impl RemoteError {
    pub fn rejected(reason: impl Into<String>) -> Self {
        RemoteError::Rejected {
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            RemoteError::Rejected { .. } => FailureKind::RemoteRejected,
            RemoteError::Network(_) | RemoteError::Timeout => FailureKind::NetworkFailure,
        }
    }
}

impl From<RemoteError> for FeedError {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::Rejected { reason } => FeedError::RemoteRejected { reason },
            RemoteError::Network(msg) => FeedError::Network(msg),
            RemoteError::Timeout => FeedError::Timeout,
        }
    }
}

/// Failure classes and how they propagate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// A second mutation on a field with one already in flight.
    SpeculationRejected,
    /// The server declined the request.
    RemoteRejected,
    /// The request never reached the server or timed out.
    NetworkFailure,
    /// A push event not newer than the cached value.
    StaleEvent,
    /// A push event for an entity already removed locally.
    OrphanedReference,
    /// Misuse of the engine API (busy views, unknown nodes).
    Internal,
}

impl FailureKind {
    /// Whether this failure produces a transient notice for the user.
    pub fn is_user_visible(self) -> bool {
        matches!(self, FailureKind::RemoteRejected | FailureKind::NetworkFailure)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::SpeculationRejected => "speculation-rejected",
            FailureKind::RemoteRejected => "remote-rejected",
            FailureKind::NetworkFailure => "network-failure",
            FailureKind::StaleEvent => "stale-event",
            FailureKind::OrphanedReference => "orphaned-reference",
            FailureKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

impl FeedError {
    /// Classify this error.
    pub fn kind(&self) -> FailureKind {
        match self {
            FeedError::MutationInFlight { .. } => FailureKind::SpeculationRejected,
            FeedError::RemoteRejected { .. } => FailureKind::RemoteRejected,
            FeedError::Network(_) | FeedError::Timeout => FailureKind::NetworkFailure,
            FeedError::EntityRemoved(_) => FailureKind::OrphanedReference,
            _ => FailureKind::Internal,
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, FeedError>;
