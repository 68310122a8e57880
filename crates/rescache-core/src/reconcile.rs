//! Remote event reconciler
//!
//! Applies server-pushed change notifications to the resources registered
//! for their topic. Keys someone is using are handled eagerly (handshake
//! with the consumer, then reload); keys nobody uses are only outdated.
//!
//! Reconciliation never fails outward. Any error for a key is logged and
//! degrades to outdating that key, so the next explicit load self-heals.
//! An eager reload is bounded by `ReconcilerConfig::reload_timeout_ms`; a
//! reload stuck on a pending requirement heals the same way instead of
//! holding up later events of its topic.

use crate::collab::{Conflict, ConflictKind, ConflictResolver, Decision, PushSource};
use crate::config::ReconcilerConfig;
use crate::error::ReconciliationError;
use crate::graph::ManagedResource;
use futures::StreamExt;
use rescache_key::NormalizedKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Operation reported by the remote
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PushOperation {
    /// An entity appeared under the scope key
    Created,
    /// The entity at the scope key changed
    Updated,
    /// The entity at the scope key was removed
    Deleted,
    /// The tree entity at the scope key moved
    Moved {
        /// New path, in canonical form
        to: String,
    },
}

/// Server-pushed change notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushEvent {
    /// Topic the notification was published on
    pub topic: String,
    /// What happened
    pub operation: PushOperation,
    /// Affected key, in canonical form
    pub scope_key: String,
    /// Opaque payload; never used to guess entity shape
    #[serde(default)]
    pub payload: Value,
}

impl PushEvent {
    /// Create event without payload
    pub fn new(topic: impl Into<String>, operation: PushOperation, scope_key: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            operation,
            scope_key: scope_key.into(),
            payload: Value::Null,
        }
    }

    /// With payload
    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

/// What reconciling one event did to one resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Key removed from the cache
    Removed,
    /// Key (or the lists that would hold it) marked outdated
    Outdated,
    /// Key outdated and reloaded because it is in use
    Reloaded,
    /// Subtree relabelled
    Moved,
    /// Consumer kept its local state; cache unchanged
    KeptLocal,
    /// Reconciliation failed and the key was outdated instead
    Healed,
}

/// Routes push events to resources and applies them
pub struct Reconciler {
    routes: HashMap<String, Vec<Arc<dyn ManagedResource>>>,
    resolver: Arc<dyn ConflictResolver>,
    config: ReconcilerConfig,
}

impl Reconciler {
    /// Create reconciler with no routes
    pub fn new(resolver: Arc<dyn ConflictResolver>, config: ReconcilerConfig) -> Self {
        Self {
            routes: HashMap::new(),
            resolver,
            config,
        }
    }

    /// Deliver a topic's events to a resource
    pub fn route(&mut self, topic: impl Into<String>, resource: Arc<dyn ManagedResource>) -> &mut Self {
        self.routes.entry(topic.into()).or_default().push(resource);
        self
    }

    /// Routed topics
    #[must_use]
    pub fn topics(&self) -> Vec<&str> {
        let mut topics: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        topics.sort_unstable();
        topics
    }

    /// Reconcile one event against every resource of its topic
    ///
    /// Returns the outcome per resource name; empty for an unknown topic.
    pub async fn handle(&self, event: &PushEvent) -> Vec<(String, ReconcileOutcome)> {
        let Some(resources) = self.routes.get(&event.topic) else {
            warn!(error = %ReconciliationError::UnknownTopic(event.topic.clone()), "dropping push event");
            return Vec::new();
        };
        let mut outcomes = Vec::with_capacity(resources.len());
        for resource in resources {
            let outcome = match self.apply(resource.as_ref(), event).await {
                Ok(outcome) => outcome,
                Err(e) => self.heal(resource.as_ref(), event, &e),
            };
            debug!(resource = resource.name(), key = %event.scope_key, ?outcome, "reconciled");
            outcomes.push((resource.name().to_string(), outcome));
        }
        outcomes
    }

    async fn apply(&self, resource: &dyn ManagedResource, event: &PushEvent) -> Result<ReconcileOutcome, ReconciliationError> {
        let key = parse(resource, &event.scope_key)?;
        let failed = |source| ReconciliationError::Resource {
            key: key.canonical().to_string(),
            source,
        };

        match &event.operation {
            PushOperation::Deleted => {
                if resource.is_in_use(&key) && self.handshake(resource, &key, ConflictKind::Deleted).await == Decision::KeepLocal {
                    return Ok(ReconcileOutcome::KeptLocal);
                }
                resource.remove(&key).await.map_err(failed)?;
                Ok(ReconcileOutcome::Removed)
            }
            PushOperation::Updated => {
                if !resource.is_in_use(&key) {
                    resource.outdate(&key);
                    return Ok(ReconcileOutcome::Outdated);
                }
                if self.handshake(resource, &key, ConflictKind::Updated).await == Decision::KeepLocal {
                    return Ok(ReconcileOutcome::KeptLocal);
                }
                resource.outdate(&key);
                if !self.config.eager_reload {
                    return Ok(ReconcileOutcome::Outdated);
                }
                self.reload(resource, &key).await?;
                Ok(ReconcileOutcome::Reloaded)
            }
            PushOperation::Created => {
                for scope in resource.creation_scopes(&key) {
                    resource.outdate(&scope);
                }
                Ok(ReconcileOutcome::Outdated)
            }
            PushOperation::Moved { to } => {
                let to = parse(resource, to)?;
                resource.relocate(&key, &to).await.map_err(failed)?;
                info!(resource = resource.name(), from = %key, to = %to, "applied remote move");
                Ok(ReconcileOutcome::Moved)
            }
        }
    }

    async fn reload(&self, resource: &dyn ManagedResource, key: &NormalizedKey) -> Result<(), ReconciliationError> {
        let failed = |source| ReconciliationError::Resource {
            key: key.canonical().to_string(),
            source,
        };
        let Some(limit) = self.config.reload_timeout() else {
            return resource.ensure_loaded(key).await.map_err(failed);
        };
        match tokio::time::timeout(limit, resource.ensure_loaded(key)).await {
            Ok(result) => result.map_err(failed),
            Err(_) => Err(ReconciliationError::ReloadTimedOut {
                key: key.canonical().to_string(),
                after_ms: self.config.reload_timeout_ms.unwrap_or_default(),
            }),
        }
    }

    async fn handshake(&self, resource: &dyn ManagedResource, key: &NormalizedKey, kind: ConflictKind) -> Decision {
        let conflict = Conflict {
            resource: resource.name().to_string(),
            key: key.clone(),
            kind,
            uses: resource.use_count(key),
        };
        let decision = self.resolver.resolve(&conflict).await;
        debug!(resource = resource.name(), key = %key, %kind, ?decision, "handshake");
        decision
    }

    fn heal(&self, resource: &dyn ManagedResource, event: &PushEvent, error: &ReconciliationError) -> ReconcileOutcome {
        if self.config.log_healed {
            warn!(resource = resource.name(), key = %event.scope_key, %error, "reconciliation failed; outdating");
        } else {
            debug!(resource = resource.name(), key = %event.scope_key, %error, "reconciliation failed; outdating");
        }
        let key = resource
            .parse_key(&event.scope_key)
            .or_else(|_| resource.parse_key("@all"));
        if let Ok(key) = key {
            resource.outdate(&key);
        }
        ReconcileOutcome::Healed
    }

    /// Process events from a push source, one task per topic
    ///
    /// Events of one topic are reconciled in arrival order.
    pub fn spawn(self: Arc<Self>, source: Arc<dyn PushSource>) -> ReconcilerHandle {
        let tasks = self
            .topics()
            .into_iter()
            .map(|topic| {
                let mut events = source.subscribe(topic);
                let reconciler = Arc::clone(&self);
                let topic = topic.to_string();
                tokio::spawn(async move {
                    debug!(topic = %topic, "reconciler listening");
                    while let Some(event) = events.next().await {
                        reconciler.handle(&event).await;
                    }
                    debug!(topic = %topic, "push source closed");
                })
            })
            .collect();
        ReconcilerHandle { tasks }
    }
}

fn parse(resource: &dyn ManagedResource, raw: &str) -> Result<NormalizedKey, ReconciliationError> {
    resource.parse_key(raw).map_err(|source| ReconciliationError::BadKey {
        raw: raw.to_string(),
        source,
    })
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("topics", &self.topics())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Running reconciler tasks
#[derive(Debug)]
pub struct ReconcilerHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl ReconcilerHandle {
    /// Number of topic tasks
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Check if no topic is processed
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Check if every task ended
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.tasks.iter().all(JoinHandle::is_finished)
    }

    /// Wait for the push source to close every topic
    pub async fn join(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }

    /// Stop processing and wait for the tasks to end
    pub async fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        self.join().await;
        info!("reconciler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::AlwaysProceed;
    use crate::resource::{Entity, MapResource};
    use rescache_key::{CacheKey, EntityId};

    #[derive(Debug)]
    struct Row(String);

    impl Entity for Row {
        fn cache_key(&self) -> CacheKey {
            CacheKey::Entity(EntityId::new(self.0.clone()).unwrap())
        }
    }

    fn reconciler(rows: &MapResource<Row>) -> Reconciler {
        let mut r = Reconciler::new(Arc::new(AlwaysProceed), ReconcilerConfig::default());
        r.route("rows", rows.managed());
        r
    }

    #[test]
    fn push_event_json_shape() {
        let event = PushEvent::new("files", PushOperation::Moved { to: "archive/docs".into() }, "docs");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["operation"]["kind"], "moved");
        assert_eq!(json["operation"]["to"], "archive/docs");
        let back: PushEvent = serde_json::from_value(serde_json::json!({
            "topic": "files",
            "operation": {"kind": "deleted"},
            "scope_key": "docs/a.txt"
        }))
        .unwrap();
        assert_eq!(back.operation, PushOperation::Deleted);
        assert_eq!(back.payload, Value::Null);
    }

    #[tokio::test]
    async fn unused_update_only_outdates() {
        let rows = MapResource::<Row>::builder("rows").build();
        rows.set("R1", Row("R1".into())).await.unwrap();
        let outcomes = reconciler(&rows)
            .handle(&PushEvent::new("rows", PushOperation::Updated, "R1"))
            .await;
        assert_eq!(outcomes, vec![("rows".to_string(), ReconcileOutcome::Outdated)]);
        assert!(rows.is_outdated("R1").unwrap());
    }

    #[tokio::test]
    async fn unknown_topic_is_dropped() {
        let rows = MapResource::<Row>::builder("rows").build();
        let outcomes = reconciler(&rows)
            .handle(&PushEvent::new("nope", PushOperation::Updated, "R1"))
            .await;
        assert!(outcomes.is_empty());
    }

    #[tokio::test]
    async fn bad_key_heals_with_all() {
        let rows = MapResource::<Row>::builder("rows").build();
        rows.set("R1", Row("R1".into())).await.unwrap();
        let outcomes = reconciler(&rows)
            .handle(&PushEvent::new("rows", PushOperation::Deleted, "has space"))
            .await;
        assert_eq!(outcomes[0].1, ReconcileOutcome::Healed);
        assert!(rows.is_outdated("R1").unwrap());
    }

    #[tokio::test]
    async fn move_on_flat_resource_heals() {
        let rows = MapResource::<Row>::builder("rows").build();
        rows.set("R1", Row("R1".into())).await.unwrap();
        let outcomes = reconciler(&rows)
            .handle(&PushEvent::new("rows", PushOperation::Moved { to: "R2".into() }, "R1"))
            .await;
        assert_eq!(outcomes[0].1, ReconcileOutcome::Healed);
        assert!(rows.is_outdated("R1").unwrap());
        assert!(rows.has("R1").unwrap());
    }

    #[tokio::test]
    async fn created_outdates_lists() {
        let rows = MapResource::<Row>::builder("rows").build();
        let outcomes = reconciler(&rows)
            .handle(&PushEvent::new("rows", PushOperation::Created, "R9"))
            .await;
        assert_eq!(outcomes[0].1, ReconcileOutcome::Outdated);
    }
}
