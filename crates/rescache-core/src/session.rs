//! Session container
//!
//! Owns everything wired at session start: configuration, the dependency
//! graph, the reconciler and its push tasks. Resources themselves are plain
//! handles owned by the application and registered here.

use crate::collab::{AlwaysProceed, ConflictResolver, PushSource};
use crate::config::RescacheConfig;
use crate::error::ConfigError;
use crate::graph::{DependencyGraph, DependencyGraphBuilder, ManagedResource, Requirement, SyncMapping};
use crate::logging;
use crate::reconcile::{PushEvent, ReconcileOutcome, Reconciler, ReconcilerHandle};
use crate::resource::ResourceId;
use std::sync::Arc;

/// Builder for a [`Session`]
pub struct SessionBuilder {
    config: RescacheConfig,
    graph: DependencyGraphBuilder,
    routes: Vec<(String, Arc<dyn ManagedResource>)>,
    resolver: Arc<dyn ConflictResolver>,
    push: Option<Arc<dyn PushSource>>,
    init_logging: bool,
}

impl SessionBuilder {
    /// Create builder from configuration
    #[must_use]
    pub fn new(config: RescacheConfig) -> Self {
        let mut graph = DependencyGraphBuilder::new();
        graph.with_config(&config.requirements);
        Self {
            config,
            graph,
            routes: Vec::new(),
            resolver: Arc::new(AlwaysProceed),
            push: None,
            init_logging: false,
        }
    }

    /// Install the tracing subscriber from the logging configuration
    #[must_use]
    pub fn with_logging(mut self) -> Self {
        self.init_logging = true;
        self
    }

    /// With consumer handshake collaborator
    #[must_use]
    pub fn resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// With push source; reconciliation starts when the session is built
    #[must_use]
    pub fn push_source(mut self, source: Arc<dyn PushSource>) -> Self {
        self.push = Some(source);
        self
    }

    /// Register a resource
    ///
    /// # Errors
    /// `ConfigError::DuplicateResource` if its name is taken
    pub fn register(&mut self, resource: Arc<dyn ManagedResource>) -> Result<ResourceId, ConfigError> {
        self.graph.register(resource)
    }

    /// See [`DependencyGraphBuilder::sync`]
    ///
    /// # Errors
    /// As for [`DependencyGraphBuilder::sync`]
    pub fn sync(&mut self, downstream: ResourceId, upstream: ResourceId, mapping: SyncMapping) -> Result<(), ConfigError> {
        self.graph.sync(downstream, upstream, mapping)
    }

    /// See [`DependencyGraphBuilder::require`]
    ///
    /// # Errors
    /// As for [`DependencyGraphBuilder::require`]
    pub fn require(&mut self, downstream: ResourceId, requirement: Requirement) -> Result<(), ConfigError> {
        self.graph.require(downstream, requirement)
    }

    /// Deliver a push topic to a resource
    pub fn route(&mut self, topic: impl Into<String>, resource: Arc<dyn ManagedResource>) {
        self.routes.push((topic.into(), resource));
    }

    /// Validate wiring and start the session
    ///
    /// Must run inside a tokio runtime when a push source is set.
    ///
    /// # Errors
    /// `ConfigError` from logging setup or graph validation
    pub fn build(self) -> Result<Session, ConfigError> {
        if self.init_logging {
            logging::init(&self.config.logging)?;
        }
        let graph = self.graph.build()?;

        let mut reconciler = Reconciler::new(self.resolver, self.config.reconciler.clone());
        for (topic, resource) in self.routes {
            reconciler.route(topic, resource);
        }
        let reconciler = Arc::new(reconciler);
        let handle = self.push.map(|source| Arc::clone(&reconciler).spawn(source));
        tracing::info!(
            resources = graph.len(),
            topics = reconciler.topics().len(),
            "session started"
        );

        Ok(Session {
            config: self.config,
            graph,
            reconciler,
            handle,
        })
    }
}

/// Running application session
#[derive(Debug)]
pub struct Session {
    config: RescacheConfig,
    graph: Arc<DependencyGraph>,
    reconciler: Arc<Reconciler>,
    handle: Option<ReconcilerHandle>,
}

impl Session {
    /// Start building a session
    #[must_use]
    pub fn builder(config: RescacheConfig) -> SessionBuilder {
        SessionBuilder::new(config)
    }

    /// Session configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &RescacheConfig {
        &self.config
    }

    /// Dependency graph
    #[inline]
    #[must_use]
    pub fn graph(&self) -> &Arc<DependencyGraph> {
        &self.graph
    }

    /// Push reconciler
    #[inline]
    #[must_use]
    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    /// Reconcile one event directly, bypassing the push source
    pub async fn reconcile(&self, event: &PushEvent) -> Vec<(String, ReconcileOutcome)> {
        self.reconciler.handle(event).await
    }

    /// Stop push processing and tear the session down
    pub async fn shutdown(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.shutdown().await;
        }
        tracing::info!("session stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{Entity, MapResource};
    use rescache_key::{CacheKey, EntityId};

    #[derive(Debug)]
    struct Row(String);

    impl Entity for Row {
        fn cache_key(&self) -> CacheKey {
            CacheKey::Entity(EntityId::new(self.0.clone()).unwrap())
        }
    }

    #[tokio::test]
    async fn session_wires_graph_and_routes() {
        let user = MapResource::<Row>::builder("user").build();
        let projects = MapResource::<Row>::builder("projects").build();

        let mut builder = Session::builder(RescacheConfig::default());
        let u = builder.register(user.managed()).unwrap();
        let p = builder.register(projects.managed()).unwrap();
        builder.sync(p, u, SyncMapping::All).unwrap();
        builder.route("projects", projects.managed());
        let session = builder.build().unwrap();

        assert_eq!(session.graph().order(), &[u, p]);
        assert_eq!(session.reconciler().topics(), vec!["projects"]);
        session.shutdown().await;
    }

    #[test]
    fn cycle_fails_session_build() {
        let a = MapResource::<Row>::builder("a").build();
        let b = MapResource::<Row>::builder("b").build();
        let mut builder = Session::builder(RescacheConfig::default());
        let ia = builder.register(a.managed()).unwrap();
        let ib = builder.register(b.managed()).unwrap();
        builder.sync(ib, ia, SyncMapping::All).unwrap();
        assert!(matches!(builder.sync(ia, ib, SyncMapping::All), Err(ConfigError::Cycle { .. })));
    }
}
