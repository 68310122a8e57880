//! Collaborator interfaces
//!
//! The core never transmits requests, renders anything or decides
//! permissions. It calls out through these traits:
//! - [`Network`]: executes a named remote operation
//! - [`PushSource`]: delivers server-pushed change notifications per topic
//! - [`ConditionProvider`]: answers whether a named condition holds
//! - [`ConflictResolver`]: asks the consumer whether a remote change may
//!   replace what it shows

use crate::error::TransportError;
use crate::reconcile::PushEvent;
use async_trait::async_trait;
use futures::stream::BoxStream;
use rescache_key::NormalizedKey;
use serde_json::Value;
use std::fmt;
use tokio::sync::watch;

/// Remote call executor
#[async_trait]
pub trait Network: Send + Sync {
    /// Execute a named remote operation
    ///
    /// # Errors
    /// `TransportError` on any network or remote failure; retry and timeout
    /// policy belong to the implementation
    async fn call(&self, operation: &str, params: Value) -> Result<Value, TransportError>;
}

/// Source of pushed change notifications
pub trait PushSource: Send + Sync {
    /// Stream of notifications for one topic; ends when the source closes
    fn subscribe(&self, topic: &str) -> BoxStream<'static, PushEvent>;
}

/// Current answer for a condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConditionState {
    /// Condition holds
    Satisfied,
    /// Not decided yet; wait for an update
    Pending,
    /// Condition is permanently false
    Denied,
}

/// Permission/condition collaborator
pub trait ConditionProvider: Send + Sync {
    /// Current state of a condition
    fn check(&self, condition: &str) -> ConditionState;

    /// Check if a condition holds right now
    fn is_satisfied(&self, condition: &str) -> bool {
        self.check(condition) == ConditionState::Satisfied
    }

    /// Receiver that changes whenever any condition may have changed
    fn updates(&self) -> watch::Receiver<u64>;
}

/// What the remote did to a key a consumer is using
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// Remote changed the entity
    Updated,
    /// Remote removed the entity
    Deleted,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Updated => f.write_str("updated"),
            Self::Deleted => f.write_str("deleted"),
        }
    }
}

/// A remote change against a key that is in use
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    /// Resource name
    pub resource: String,
    /// Affected key
    pub key: NormalizedKey,
    /// Remote change
    pub kind: ConflictKind,
    /// Active uses overlapping the key
    pub uses: usize,
}

/// Consumer decision on a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Decision {
    /// Apply the remote change
    Proceed,
    /// Keep what the consumer has; the cache is left unchanged
    KeepLocal,
}

/// Consumer handshake collaborator
#[async_trait]
pub trait ConflictResolver: Send + Sync {
    /// Decide whether the remote change may be applied
    async fn resolve(&self, conflict: &Conflict) -> Decision;
}

/// Resolver that always lets the remote change through
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysProceed;

#[async_trait]
impl ConflictResolver for AlwaysProceed {
    async fn resolve(&self, _conflict: &Conflict) -> Decision {
        Decision::Proceed
    }
}
