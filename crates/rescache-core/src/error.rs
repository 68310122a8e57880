//! Error types for rescache
//!
//! Provides error handling for:
//! - Remote calls made by loaders and mutators (transport)
//! - Requirements a resource waits on before loading (preconditions)
//! - Push-event reconciliation
//! - Dependency wiring and configuration
//!
//! Operation errors are `Clone`: one failed load completes every joined
//! waiter with the same error, and the error is also kept in the cache entry.

use rescache_key::KeyFormatError;
use std::sync::Arc;

/// Network or remote failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Remote rejected the call
    #[error("remote call '{operation}' failed: {message}")]
    Remote {
        /// Remote operation name
        operation: String,
        /// Failure message
        message: String,
    },

    /// Call did not complete in time
    #[error("remote call '{operation}' timed out after {after_ms}ms")]
    Timeout {
        /// Remote operation name
        operation: String,
        /// Elapsed time in milliseconds
        after_ms: u64,
    },

    /// Result did not decode into the entity type
    #[error("could not decode result of '{operation}': {message}")]
    Decode {
        /// Remote operation name
        operation: String,
        /// Failure message
        message: String,
    },

    /// Transport is not reachable
    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

impl TransportError {
    /// Create remote error
    pub fn remote(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Remote {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create decode error
    pub fn decode(operation: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Decode {
            operation: operation.into(),
            message: message.to_string(),
        }
    }
}

/// Unmet requirement of a resource
#[derive(Debug, Clone, thiserror::Error)]
pub enum PreconditionError {
    /// Condition resolved to permanently false
    #[error("condition '{condition}' denied")]
    Denied {
        /// Condition name
        condition: String,
    },

    /// Condition provider stopped publishing updates while pending
    #[error("condition '{condition}' can no longer be satisfied: provider closed")]
    Closed {
        /// Condition name
        condition: String,
    },

    /// Waited longer than the configured bound
    #[error("condition '{condition}' still pending after {after_ms}ms")]
    TimedOut {
        /// Condition name
        condition: String,
        /// Elapsed time in milliseconds
        after_ms: u64,
    },

    /// Required upstream resource failed to load
    #[error("required resource '{resource}' failed: {source}")]
    Upstream {
        /// Upstream resource name
        resource: String,
        /// Why the upstream load failed
        #[source]
        source: Box<ResourceError>,
    },
}

/// Failure of a resource operation
#[derive(Debug, Clone, thiserror::Error)]
pub enum ResourceError {
    /// Malformed or ill-shaped key
    #[error("key error: {0}")]
    Key(#[from] KeyFormatError),

    /// Network failure while loading or mutating
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Requirement not met
    #[error("precondition failed: {0}")]
    Precondition(#[from] PreconditionError),

    /// Move target invalid (root, or inside its own subtree)
    #[error("cannot move '{from}' to '{to}': {reason}")]
    InvalidMove {
        /// Path being moved
        from: String,
        /// Requested destination
        to: String,
        /// Why it failed
        reason: String,
    },

    /// Operation not supported by this resource flavor
    #[error("operation '{operation}' not supported by resource '{resource}'")]
    Unsupported {
        /// Operation name
        operation: String,
        /// Resource name
        resource: String,
    },

    /// Scheduled task panicked or was aborted before completing
    #[error("operation on '{key}' aborted: {reason}")]
    Aborted {
        /// Affected key, in canonical form
        key: String,
        /// Why it failed
        reason: String,
    },

    /// Resource has no loader configured
    #[error("resource '{0}' has no loader")]
    NoLoader(String),

    /// Arbitrary failure from a caller-supplied mutation
    #[error("mutation failed: {0}")]
    Mutation(Arc<dyn std::error::Error + Send + Sync>),
}

impl ResourceError {
    /// Check if retrying the same operation could succeed
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_)
                | Self::Aborted { .. }
                | Self::Precondition(PreconditionError::TimedOut { .. })
        )
    }

    /// Create unsupported-operation error
    pub fn unsupported(operation: impl Into<String>, resource: impl Into<String>) -> Self {
        Self::Unsupported {
            operation: operation.into(),
            resource: resource.into(),
        }
    }

    /// Wrap an arbitrary error raised by a mutation body
    pub fn mutation(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Mutation(Arc::new(err))
    }
}

/// Failure while applying a push notification
///
/// Never reaches a caller: the reconciler logs it and degrades to marking
/// the key outdated.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ReconciliationError {
    /// No resource registered for the topic
    #[error("no resource registered for topic '{0}'")]
    UnknownTopic(String),

    /// Scope key of the notification did not parse
    #[error("bad scope key '{raw}': {source}")]
    BadKey {
        /// Key as received
        raw: String,
        /// Parse failure
        #[source]
        source: KeyFormatError,
    },

    /// Eager reload of an in-use key did not finish in time
    #[error("reload of '{key}' did not finish within {after_ms}ms")]
    ReloadTimedOut {
        /// Affected key, in canonical form
        key: String,
        /// Configured bound in milliseconds
        after_ms: u64,
    },

    /// Resource operation failed while reconciling
    #[error("reconciliation of '{key}' failed: {source}")]
    Resource {
        /// Affected key, in canonical form
        key: String,
        /// Operation failure
        #[source]
        source: ResourceError,
    },
}

/// Misuse of the use tracker
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UseError {
    /// Use id was never issued for this key, or already freed
    #[error("no active use {id} on '{key}'")]
    UnknownUse {
        /// Key the use was registered on
        key: String,
        /// Use id
        id: String,
    },
}

/// Wiring or configuration error, raised at construction time
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Edge would close a dependency cycle
    #[error("dependency {from} -> {to} would create a cycle")]
    Cycle {
        /// Dependent resource
        from: String,
        /// Upstream resource
        to: String,
    },

    /// Resource declared a dependency on itself
    #[error("resource '{0}' cannot depend on itself")]
    SelfDependency(String),

    /// Resource referenced before registration
    #[error("resource '{0}' is not registered")]
    UnknownResource(String),

    /// Two resources registered under one name
    #[error("resource '{0}' registered twice")]
    DuplicateResource(String),

    /// Invalid alias or key in configuration
    #[error("key error: {0}")]
    Key(#[from] KeyFormatError),

    /// Configuration file could not be read
    #[error("io error reading {path}: {source}")]
    Io {
        /// File that was read
        path: std::path::PathBuf,
        /// Read failure
        #[source]
        source: std::io::Error,
    },

    /// Configuration text did not parse
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// Logging subscriber could not be installed
    #[error("logging setup failed: {0}")]
    Logging(String),
}

/// Result type alias for resource operations
pub type ResourceResult<T> = Result<T, ResourceError>;
