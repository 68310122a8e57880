//! rescache core - reactive cached resources
//!
//! A generic caching layer for remote-backed entities that:
//! - Tracks per-key freshness (fresh, outdated, loading, errored)
//! - Runs at most one load per key and serializes writes with loads
//! - Cascades outdates across dependent resources without cycles
//! - Reconciles server-pushed changes, eagerly for keys in use
//!
//! # Example
//!
//! ```rust,ignore
//! use rescache_core::prelude::*;
//!
//! # async fn example(network: std::sync::Arc<dyn Network>) -> Result<(), Box<dyn std::error::Error>> {
//! let projects = MapResource::<Project>::builder("projects")
//!     .loader(RemoteLoader::new(network, "getProject", "listProjects"))
//!     .build();
//!
//! let all = projects.load("@all").await?;
//! projects.mark_outdated("@all")?;
//! let fresh = projects.load("@all").await?;
//! # Ok(())
//! # }
//! ```

// Core modules
pub mod collab;
pub mod config;
pub mod error;
pub mod executor;
pub mod graph;
pub mod logging;
pub mod reconcile;
pub mod resource;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod usage;

// Re-exports for convenience
pub use collab::{
    AlwaysProceed, ConditionProvider, ConditionState, Conflict, ConflictKind, ConflictResolver, Decision, Network,
    PushSource,
};
pub use config::{LoggingConfig, ReconcilerConfig, RequirementConfig, RescacheConfig};
pub use error::{
    ConfigError, PreconditionError, ReconciliationError, ResourceError, ResourceResult, TransportError, UseError,
};
pub use executor::{Executor, ItemUpdate, KeyEvent, Lifecycle, MoveEvent, OutdateEvent, SubscriptionId};
pub use graph::{
    CascadeEntry, CascadeReport, ChangeKind, ChangeNotice, DependencyGraph, DependencyGraphBuilder, ManagedResource,
    Requirement, SyncMapping,
};
pub use reconcile::{PushEvent, PushOperation, ReconcileOutcome, Reconciler, ReconcilerHandle};
pub use resource::{
    params_for, Entity, IntoCacheKey, Loader, MapResource, MutationOutcome, RemoteLoader, Resource, ResourceBuilder,
    ResourceId, ResourceKind, TreeResource,
};
pub use scheduler::{LoadScheduler, OpKind, Scheduled};
pub use session::{Session, SessionBuilder};
pub use store::{EntityStore, EntryState, StoreChanges};
pub use usage::{UseGuard, UseId, UseTracker};

pub use rescache_key::{
    Alias, CacheKey, EntityId, KeyFlavor, KeyFormatError, KeyModel, ListKey, NormalizedKey, TreePath,
};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with rescache
    pub use crate::{
        CacheKey, Entity, EntryState, KeyFlavor, ListKey, Loader, MapResource, MutationOutcome, Network, PushEvent,
        PushOperation, RemoteLoader, RescacheConfig, Resource, ResourceError, ResourceResult, Session, SyncMapping,
        TreePath, TreeResource,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
