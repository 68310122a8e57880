//! Dependency graph
//!
//! Wires resources together at construction time:
//! - `sync`: the downstream resource is outdated when the upstream one
//!   updates or deletes data
//! - `require`: the downstream resource waits on a condition or an upstream
//!   key before every load
//!
//! Both relations share one directed graph that must stay acyclic. Each
//! edge is checked as it is added and rolled back if it closes a cycle, and
//! `build()` validates the whole graph with a topological sort.
//!
//! Cascades run synchronously inside the upstream's lifecycle event, depth
//! first, and visit each resource at most once per cascade.

use crate::collab::{ConditionProvider, ConditionState};
use crate::config::RequirementConfig;
use crate::error::{ConfigError, PreconditionError, ResourceError, ResourceResult};
use crate::executor::{KeyEvent, SubscriptionId};
use crate::resource::{Entity, Resource, ResourceId};
use async_trait::async_trait;
use parking_lot::Mutex;
use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graphmap::DiGraphMap;
use petgraph::Direction;
use rescache_key::{CacheKey, KeyFlavor, KeyFormatError, ListKey, NormalizedKey};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// What happened upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Data loaded or written
    Updated,
    /// Item removed
    Deleted,
}

/// Change observed on an upstream resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotice {
    /// Affected key
    pub key: NormalizedKey,
    /// What happened
    pub kind: ChangeKind,
}

/// Handler for upstream changes
pub type ChangeHandler = Arc<dyn Fn(&ChangeNotice) + Send + Sync>;

/// Type-erased view of a resource used by the graph and the reconciler
#[async_trait]
pub trait ManagedResource: Send + Sync {
    /// Resource id
    fn id(&self) -> ResourceId;

    /// Resource name
    fn name(&self) -> &str;

    /// Key flavor
    fn flavor(&self) -> KeyFlavor;

    /// Parse and normalize a canonical key string
    ///
    /// # Errors
    /// `KeyFormatError` if the string is not a key of this resource
    fn parse_key(&self, raw: &str) -> Result<NormalizedKey, KeyFormatError>;

    /// Normalize a typed key
    ///
    /// # Errors
    /// `KeyFormatError` if the key does not fit this resource
    fn normalize_key(&self, key: &CacheKey) -> Result<NormalizedKey, KeyFormatError>;

    /// Mark a key outdated; returns the keys marked
    fn outdate(&self, key: &NormalizedKey) -> Vec<NormalizedKey>;

    /// Check if a consumer uses a key overlapping `key`
    fn is_in_use(&self, key: &NormalizedKey) -> bool;

    /// Number of uses overlapping `key`
    fn use_count(&self, key: &NormalizedKey) -> usize;

    /// Make a key fresh
    async fn ensure_loaded(&self, key: &NormalizedKey) -> ResourceResult<()>;

    /// Outdate a key and load it again
    async fn refresh_key(&self, key: &NormalizedKey) -> ResourceResult<()>;

    /// Remove an item from the cache
    async fn remove(&self, key: &NormalizedKey) -> ResourceResult<()>;

    /// Relabel a tree subtree
    async fn relocate(&self, from: &NormalizedKey, to: &NormalizedKey) -> ResourceResult<()>;

    /// Keys whose next load would list an entity created at `key`
    fn creation_scopes(&self, key: &NormalizedKey) -> Vec<NormalizedKey>;

    /// Observe data updates and item deletions
    fn subscribe_changes(&self, handler: ChangeHandler) -> Vec<SubscriptionId>;

    /// Remove a lifecycle subscription
    fn unsubscribe(&self, id: SubscriptionId) -> bool;

    /// Add a requirement waited on before loads
    fn attach_requirement(&self, requirement: Requirement);

    /// Bound requirement waits
    fn set_requirement_timeout(&self, timeout: Option<Duration>);
}

#[async_trait]
impl<V: Entity> ManagedResource for Resource<V> {
    fn id(&self) -> ResourceId {
        Resource::id(self)
    }

    fn name(&self) -> &str {
        Resource::name(self)
    }

    fn flavor(&self) -> KeyFlavor {
        Resource::flavor(self)
    }

    fn parse_key(&self, raw: &str) -> Result<NormalizedKey, KeyFormatError> {
        self.model().normalize_str(raw)
    }

    fn normalize_key(&self, key: &CacheKey) -> Result<NormalizedKey, KeyFormatError> {
        self.model().normalize(key)
    }

    fn outdate(&self, key: &NormalizedKey) -> Vec<NormalizedKey> {
        Resource::outdate(self, key)
    }

    fn is_in_use(&self, key: &NormalizedKey) -> bool {
        self.uses().is_in_use(key)
    }

    fn use_count(&self, key: &NormalizedKey) -> usize {
        self.uses().overlapping(key)
    }

    async fn ensure_loaded(&self, key: &NormalizedKey) -> ResourceResult<()> {
        Resource::ensure_loaded(self, key).await
    }

    async fn refresh_key(&self, key: &NormalizedKey) -> ResourceResult<()> {
        Resource::outdate(self, key);
        Resource::ensure_loaded(self, key).await
    }

    async fn remove(&self, key: &NormalizedKey) -> ResourceResult<()> {
        self.delete(key).await
    }

    async fn relocate(&self, from: &NormalizedKey, to: &NormalizedKey) -> ResourceResult<()> {
        match (from.as_path(), to.as_path()) {
            (Some(from), Some(to)) => Resource::relocate(self, from.clone(), to.clone()).await,
            _ => Err(ResourceError::unsupported("move", Resource::name(self))),
        }
    }

    fn creation_scopes(&self, key: &NormalizedKey) -> Vec<NormalizedKey> {
        Resource::creation_scopes(self, key)
    }

    fn subscribe_changes(&self, handler: ChangeHandler) -> Vec<SubscriptionId> {
        let lifecycle = self.lifecycle();
        let on_update = Arc::clone(&handler);
        let update = lifecycle.data_update.subscribe(move |e: &KeyEvent| {
            on_update(&ChangeNotice {
                key: e.key.clone(),
                kind: ChangeKind::Updated,
            });
        });
        let delete = lifecycle.item_delete.subscribe(move |e: &KeyEvent| {
            handler(&ChangeNotice {
                key: e.key.clone(),
                kind: ChangeKind::Deleted,
            });
        });
        vec![update, delete]
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        Resource::unsubscribe(self, id)
    }

    fn attach_requirement(&self, requirement: Requirement) {
        self.require(requirement);
    }

    fn set_requirement_timeout(&self, timeout: Option<Duration>) {
        Resource::set_requirement_timeout(self, timeout);
    }
}

impl<V: Entity> Resource<V> {
    /// Type-erased handle for graph and reconciler wiring
    #[must_use]
    pub fn managed(&self) -> Arc<dyn ManagedResource> {
        Arc::new(self.clone())
    }
}

/// Something a resource waits on before loading
#[derive(Clone)]
pub enum Requirement {
    /// A condition of the permission collaborator must hold
    Condition {
        /// Condition collaborator
        provider: Arc<dyn ConditionProvider>,
        /// Condition name
        condition: String,
    },
    /// An upstream key must load successfully
    Resource {
        /// Upstream resource
        upstream: Arc<dyn ManagedResource>,
        /// Key normalized for the upstream
        key: NormalizedKey,
    },
}

impl Requirement {
    /// Require a condition
    pub fn condition(provider: Arc<dyn ConditionProvider>, condition: impl Into<String>) -> Self {
        Self::Condition {
            provider,
            condition: condition.into(),
        }
    }

    /// Require an upstream key to be loaded
    ///
    /// # Errors
    /// `ConfigError::Key` if the key does not fit the upstream
    pub fn resource(upstream: Arc<dyn ManagedResource>, key: &CacheKey) -> Result<Self, ConfigError> {
        let key = upstream.normalize_key(key)?;
        Ok(Self::Resource { upstream, key })
    }

    /// Upstream resource, if any
    #[must_use]
    pub fn upstream_id(&self) -> Option<ResourceId> {
        match self {
            Self::Condition { .. } => None,
            Self::Resource { upstream, .. } => Some(upstream.id()),
        }
    }

    /// Wait until the requirement holds
    ///
    /// # Errors
    /// - `PreconditionError::Denied` if the condition is permanently false
    /// - `PreconditionError::Closed` if the provider stops publishing while
    ///   the condition is pending
    /// - `PreconditionError::TimedOut` if `timeout` elapses first
    /// - `PreconditionError::Upstream` if the upstream load fails
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<(), PreconditionError> {
        match self {
            Self::Condition { provider, condition } => {
                let waiting = wait_condition(provider.as_ref(), condition);
                match timeout {
                    Some(limit) => tokio::time::timeout(limit, waiting).await.map_err(|_| {
                        PreconditionError::TimedOut {
                            condition: condition.clone(),
                            after_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                        }
                    })?,
                    None => waiting.await,
                }
            }
            Self::Resource { upstream, key } => {
                upstream
                    .ensure_loaded(key)
                    .await
                    .map_err(|source| PreconditionError::Upstream {
                        resource: upstream.name().to_string(),
                        source: Box::new(source),
                    })
            }
        }
    }
}

async fn wait_condition(provider: &dyn ConditionProvider, condition: &str) -> Result<(), PreconditionError> {
    let mut updates = provider.updates();
    loop {
        match provider.check(condition) {
            ConditionState::Satisfied => return Ok(()),
            ConditionState::Denied => {
                return Err(PreconditionError::Denied {
                    condition: condition.to_string(),
                })
            }
            ConditionState::Pending => {}
        }
        debug!(condition, "waiting on pending condition");
        if updates.changed().await.is_err() {
            return match provider.check(condition) {
                ConditionState::Satisfied => Ok(()),
                ConditionState::Denied => Err(PreconditionError::Denied {
                    condition: condition.to_string(),
                }),
                ConditionState::Pending => Err(PreconditionError::Closed {
                    condition: condition.to_string(),
                }),
            };
        }
    }
}

impl fmt::Debug for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Condition { condition, .. } => f.debug_struct("Condition").field("condition", condition).finish(),
            Self::Resource { upstream, key } => f
                .debug_struct("Resource")
                .field("upstream", &upstream.name())
                .field("key", key)
                .finish(),
        }
    }
}

/// Key mapping from an upstream change to downstream outdates
#[derive(Clone)]
pub enum SyncMapping {
    /// Outdate everything downstream (`@all`)
    All,
    /// Outdate the same key downstream; falls back to `@all` when the key
    /// does not exist in the downstream key space
    SameKey,
    /// Compute downstream keys from the upstream key
    Custom(Arc<dyn Fn(&NormalizedKey) -> Vec<CacheKey> + Send + Sync>),
}

impl SyncMapping {
    /// Custom mapping from a closure
    pub fn custom(f: impl Fn(&NormalizedKey) -> Vec<CacheKey> + Send + Sync + 'static) -> Self {
        Self::Custom(Arc::new(f))
    }

    fn map(&self, keys: &[NormalizedKey], downstream: &dyn ManagedResource) -> Vec<NormalizedKey> {
        let all = NormalizedKey::from(ListKey::All);
        let mut mapped: Vec<NormalizedKey> = Vec::new();
        let mut push = |key: NormalizedKey| {
            if !mapped.contains(&key) {
                mapped.push(key);
            }
        };
        match self {
            Self::All => push(all),
            Self::SameKey => {
                for key in keys {
                    match downstream.normalize_key(key.key()) {
                        Ok(k) => push(k),
                        Err(_) => push(all.clone()),
                    }
                }
            }
            Self::Custom(f) => {
                for key in keys {
                    for target in f(key) {
                        match downstream.normalize_key(&target) {
                            Ok(k) => push(k),
                            Err(e) => warn!(resource = downstream.name(), error = %e, "sync mapping produced a bad key"),
                        }
                    }
                }
            }
        }
        mapped
    }
}

impl fmt::Debug for SyncMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("All"),
            Self::SameKey => f.write_str("SameKey"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

#[derive(Debug, Clone)]
struct SyncEdge {
    downstream: ResourceId,
    mapping: SyncMapping,
}

/// One resource outdated by a cascade
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CascadeEntry {
    /// Resource id
    pub id: ResourceId,
    /// Resource name
    pub resource: String,
    /// Keys requested to be outdated
    pub keys: Vec<NormalizedKey>,
    /// Number of cached entries marked
    pub marked: usize,
}

/// Resources a cascade outdated, in visiting order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CascadeReport {
    /// Visited resources
    pub entries: Vec<CascadeEntry>,
}

impl CascadeReport {
    /// Number of resources outdated
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if nothing was outdated
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// How often a resource was visited (0 or 1)
    #[must_use]
    pub fn visits(&self, name: &str) -> usize {
        self.entries.iter().filter(|e| e.resource == name).count()
    }
}

/// Builder for a [`DependencyGraph`]
///
/// Usage:
/// ```rust,ignore
/// let mut builder = DependencyGraphBuilder::new();
/// builder.register(user.managed())?;
/// builder.register(projects.managed())?;
/// builder.sync(projects.id(), user.id(), SyncMapping::All)?;
/// let graph = builder.build()?;
/// ```
#[derive(Default)]
pub struct DependencyGraphBuilder {
    resources: HashMap<ResourceId, Arc<dyn ManagedResource>>,
    names: HashMap<String, ResourceId>,
    graph: DiGraphMap<ResourceId, ()>,
    syncs: Vec<(ResourceId, SyncEdge)>,
    requirements: Vec<(ResourceId, Requirement)>,
    wait_timeout: Option<Duration>,
}

impl DependencyGraphBuilder {
    /// Create empty builder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply requirement settings from configuration
    pub fn with_config(&mut self, config: &RequirementConfig) -> &mut Self {
        self.wait_timeout = config.wait_timeout();
        self
    }

    /// Number of registered resources
    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Check if nothing is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Register a resource
    ///
    /// # Errors
    /// `ConfigError::DuplicateResource` if the name or id is taken
    pub fn register(&mut self, resource: Arc<dyn ManagedResource>) -> Result<ResourceId, ConfigError> {
        let id = resource.id();
        if self.resources.contains_key(&id) || self.names.contains_key(resource.name()) {
            return Err(ConfigError::DuplicateResource(resource.name().to_string()));
        }
        self.graph.add_node(id);
        self.names.insert(resource.name().to_string(), id);
        self.resources.insert(id, resource);
        Ok(id)
    }

    /// Outdate `downstream` whenever `upstream` changes
    ///
    /// # Errors
    /// `ConfigError::UnknownResource`, `ConfigError::SelfDependency` or
    /// `ConfigError::Cycle`
    pub fn sync(&mut self, downstream: ResourceId, upstream: ResourceId, mapping: SyncMapping) -> Result<(), ConfigError> {
        self.add_edge(upstream, downstream)?;
        self.syncs.push((upstream, SyncEdge { downstream, mapping }));
        Ok(())
    }

    /// Make `downstream` wait on a requirement before loading
    ///
    /// # Errors
    /// As for [`DependencyGraphBuilder::sync`] when the requirement names an
    /// upstream resource
    pub fn require(&mut self, downstream: ResourceId, requirement: Requirement) -> Result<(), ConfigError> {
        self.resource(downstream)?;
        if let Some(upstream) = requirement.upstream_id() {
            self.add_edge(upstream, downstream)?;
        }
        self.requirements.push((downstream, requirement));
        Ok(())
    }

    fn resource(&self, id: ResourceId) -> Result<&Arc<dyn ManagedResource>, ConfigError> {
        self.resources
            .get(&id)
            .ok_or_else(|| ConfigError::UnknownResource(id.to_string()))
    }

    fn name_of(&self, id: ResourceId) -> String {
        self.resources
            .get(&id)
            .map_or_else(|| id.to_string(), |r| r.name().to_string())
    }

    fn add_edge(&mut self, upstream: ResourceId, downstream: ResourceId) -> Result<(), ConfigError> {
        self.resource(upstream)?;
        self.resource(downstream)?;
        if upstream == downstream {
            return Err(ConfigError::SelfDependency(self.name_of(upstream)));
        }
        if self.graph.contains_edge(upstream, downstream) {
            return Ok(());
        }
        self.graph.add_edge(upstream, downstream, ());
        if is_cyclic_directed(&self.graph) {
            self.graph.remove_edge(upstream, downstream);
            return Err(ConfigError::Cycle {
                from: self.name_of(downstream),
                to: self.name_of(upstream),
            });
        }
        Ok(())
    }

    /// Validate and wire the graph
    ///
    /// Attaches requirements to their resources and subscribes cascades to
    /// every synced upstream.
    ///
    /// # Errors
    /// `ConfigError::Cycle` if the graph is not acyclic
    pub fn build(self) -> Result<Arc<DependencyGraph>, ConfigError> {
        let order = toposort(&self.graph, None).map_err(|cycle| {
            let node = cycle.node_id();
            ConfigError::Cycle {
                from: self.name_of(node),
                to: self.name_of(node),
            }
        })?;

        for (downstream, requirement) in self.requirements {
            if let Some(resource) = self.resources.get(&downstream) {
                resource.attach_requirement(requirement);
            }
        }
        if self.wait_timeout.is_some() {
            for resource in self.resources.values() {
                resource.set_requirement_timeout(self.wait_timeout);
            }
        }

        let mut syncs: HashMap<ResourceId, Vec<SyncEdge>> = HashMap::new();
        for (upstream, edge) in self.syncs {
            syncs.entry(upstream).or_default().push(edge);
        }

        let graph = Arc::new(DependencyGraph {
            resources: self.resources,
            names: self.names,
            graph: self.graph,
            order,
            syncs,
            subscriptions: Mutex::new(Vec::new()),
        });

        let weak: Weak<DependencyGraph> = Arc::downgrade(&graph);
        let mut subscriptions = Vec::new();
        for upstream in graph.syncs.keys().copied() {
            let Some(resource) = graph.resources.get(&upstream) else {
                continue;
            };
            let weak = Weak::clone(&weak);
            let handler: ChangeHandler = Arc::new(move |notice: &ChangeNotice| {
                if let Some(graph) = weak.upgrade() {
                    graph.cascade(upstream, &[notice.key.clone()]);
                }
            });
            for id in resource.subscribe_changes(handler) {
                subscriptions.push((upstream, id));
            }
        }
        *graph.subscriptions.lock() = subscriptions;
        info!(resources = graph.len(), "dependency graph built");
        Ok(graph)
    }
}

/// Validated, wired dependency graph
///
/// Dropping the graph unsubscribes its cascades.
pub struct DependencyGraph {
    resources: HashMap<ResourceId, Arc<dyn ManagedResource>>,
    names: HashMap<String, ResourceId>,
    graph: DiGraphMap<ResourceId, ()>,
    order: Vec<ResourceId>,
    syncs: HashMap<ResourceId, Vec<SyncEdge>>,
    subscriptions: Mutex<Vec<(ResourceId, SubscriptionId)>>,
}

impl DependencyGraph {
    /// Start building a graph
    #[must_use]
    pub fn builder() -> DependencyGraphBuilder {
        DependencyGraphBuilder::new()
    }

    /// Number of resources
    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Check if the graph is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Resources in dependency order (upstream first)
    #[must_use]
    pub fn order(&self) -> &[ResourceId] {
        &self.order
    }

    /// Look up a resource by id
    #[must_use]
    pub fn resource(&self, id: ResourceId) -> Option<&Arc<dyn ManagedResource>> {
        self.resources.get(&id)
    }

    /// Look up a resource by name
    #[must_use]
    pub fn resource_by_name(&self, name: &str) -> Option<&Arc<dyn ManagedResource>> {
        self.names.get(name).and_then(|id| self.resources.get(id))
    }

    /// Resources depending on `id` directly
    #[must_use]
    pub fn downstream_of(&self, id: ResourceId) -> Vec<ResourceId> {
        self.graph.neighbors_directed(id, Direction::Outgoing).collect()
    }

    /// Resources `id` depends on directly
    #[must_use]
    pub fn upstream_of(&self, id: ResourceId) -> Vec<ResourceId> {
        self.graph.neighbors_directed(id, Direction::Incoming).collect()
    }

    /// Outdate every resource synced from `source`, depth first
    ///
    /// Each resource is outdated at most once; in a diamond the keys mapped
    /// along the first path reached win.
    pub fn cascade(&self, source: ResourceId, keys: &[NormalizedKey]) -> CascadeReport {
        let mut report = CascadeReport::default();
        let mut visited = HashSet::from([source]);
        self.visit(source, keys, &mut visited, &mut report);
        if !report.is_empty() {
            let origin = self.resources.get(&source).map_or("?", |r| r.name());
            info!(origin, resources = report.len(), "cascade applied");
        }
        report
    }

    fn visit(&self, node: ResourceId, keys: &[NormalizedKey], visited: &mut HashSet<ResourceId>, report: &mut CascadeReport) {
        let Some(edges) = self.syncs.get(&node) else {
            return;
        };
        for edge in edges {
            if !visited.insert(edge.downstream) {
                continue;
            }
            let Some(target) = self.resources.get(&edge.downstream) else {
                continue;
            };
            let mapped = edge.mapping.map(keys, target.as_ref());
            let marked: usize = mapped.iter().map(|k| target.outdate(k).len()).sum();
            debug!(resource = target.name(), keys = mapped.len(), marked, "cascade outdate");
            report.entries.push(CascadeEntry {
                id: edge.downstream,
                resource: target.name().to_string(),
                keys: mapped.clone(),
                marked,
            });
            self.visit(edge.downstream, &mapped, visited, report);
        }
    }
}

impl Drop for DependencyGraph {
    fn drop(&mut self) {
        for (resource, id) in self.subscriptions.get_mut().drain(..) {
            if let Some(r) = self.resources.get(&resource) {
                r.unsubscribe(id);
            }
        }
    }
}

impl fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("resources", &self.resources.len())
            .field("edges", &self.graph.edge_count())
            .finish()
    }
}
