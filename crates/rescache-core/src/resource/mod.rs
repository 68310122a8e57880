//! Resources
//!
//! A [`Resource`] composes a key model, an entity store and a load scheduler
//! behind one cloneable handle:
//! - cache-only reads (`get`, `has`, `state`, `cached`)
//! - freshness-ensuring reads (`load`, `load_one`, `refresh`)
//! - scheduled writes (`set`, `delete`, `mutate`)
//! - lifecycle subscriptions (`on_item_update`, `on_data_outdated`, ...)
//!
//! [`MapResource`] and [`TreeResource`] fix the key flavor and add the
//! operations that only make sense for it.

mod loader;
mod map;
mod tree;

pub use loader::{params_for, Entity, Loader, RemoteLoader};
pub use map::MapResource;
pub use tree::TreeResource;

use crate::error::{ConfigError, ResourceError, ResourceResult};
use crate::executor::{ItemUpdate, KeyEvent, Lifecycle, MoveEvent, OutdateEvent, SubscriptionId};
use crate::graph::Requirement;
use crate::scheduler::LoadScheduler;
use crate::store::{EntityStore, EntryState, StoreChanges};
use crate::usage::{UseGuard, UseTracker};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use rescache_key::{Alias, CacheKey, EntityId, KeyFlavor, KeyFormatError, KeyModel, ListKey, NormalizedKey, TreePath};
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// A load retries this often when outdates keep landing while it is in flight;
/// after that it fails with `ResourceError::Aborted` and the key stays outdated
const MAX_STALE_ATTEMPTS: usize = 4;

/// Unique resource identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(Uuid);

impl ResourceId {
    /// Create new random ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ResourceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Anything a resource accepts as a key
///
/// Strings are parsed with the resource's key grammar; typed keys are
/// checked against its flavor.
pub trait IntoCacheKey {
    /// Normalize against a key model
    ///
    /// # Errors
    /// `KeyFormatError` if the key is malformed or does not fit the model
    fn normalize_in(self, model: &KeyModel) -> Result<NormalizedKey, KeyFormatError>;
}

impl IntoCacheKey for &str {
    fn normalize_in(self, model: &KeyModel) -> Result<NormalizedKey, KeyFormatError> {
        model.normalize_str(self)
    }
}

impl IntoCacheKey for &String {
    fn normalize_in(self, model: &KeyModel) -> Result<NormalizedKey, KeyFormatError> {
        model.normalize_str(self)
    }
}

impl IntoCacheKey for String {
    fn normalize_in(self, model: &KeyModel) -> Result<NormalizedKey, KeyFormatError> {
        model.normalize_str(&self)
    }
}

impl IntoCacheKey for &CacheKey {
    fn normalize_in(self, model: &KeyModel) -> Result<NormalizedKey, KeyFormatError> {
        model.normalize(self)
    }
}

impl IntoCacheKey for &NormalizedKey {
    fn normalize_in(self, model: &KeyModel) -> Result<NormalizedKey, KeyFormatError> {
        model.normalize(self.key())
    }
}

macro_rules! into_cache_key_by_value {
    ($($ty:ty),*) => {
        $(
            impl IntoCacheKey for $ty {
                fn normalize_in(self, model: &KeyModel) -> Result<NormalizedKey, KeyFormatError> {
                    model.normalize(&CacheKey::from(self))
                }
            }
        )*
    };
}

into_cache_key_by_value!(CacheKey, EntityId, TreePath, ListKey, Alias);

impl IntoCacheKey for NormalizedKey {
    fn normalize_in(self, model: &KeyModel) -> Result<NormalizedKey, KeyFormatError> {
        model.normalize(self.key())
    }
}

/// What a remote mutation did, applied to the cache once it succeeds
#[derive(Debug, Clone)]
pub enum MutationOutcome<V> {
    /// Entity created or changed; stored under its own key
    Set(V),
    /// Entity removed
    Delete,
    /// Tree entity moved to a new path
    Move(TreePath),
    /// Nothing to apply
    Unchanged,
}

/// Shared state behind a resource handle
pub(crate) struct Inner<V> {
    name: String,
    id: ResourceId,
    model: Arc<KeyModel>,
    store: Mutex<EntityStore<V>>,
    scheduler: LoadScheduler,
    loader: Option<Arc<dyn Loader<V>>>,
    lifecycle: Lifecycle<V>,
    requirements: RwLock<Vec<Requirement>>,
    uses: Arc<UseTracker>,
    wait_timeout: RwLock<Option<Duration>>,
}

impl<V: Entity> Inner<V> {
    fn publish(&self, changes: StoreChanges<V>) {
        for (key, value) in changes.updated {
            self.lifecycle.item_update.emit(&ItemUpdate { key, value });
        }
        for (from, to) in changes.moved {
            self.lifecycle.item_move.emit(&MoveEvent { from, to });
        }
        for key in changes.deleted {
            self.lifecycle.item_delete.emit(&KeyEvent { key });
        }
        if !changes.outdated.is_empty() {
            self.lifecycle.data_outdated.emit(&OutdateEvent { keys: changes.outdated });
        }
        if let Some(key) = changes.loaded {
            self.lifecycle.data_update.emit(&KeyEvent { key });
        }
    }

    async fn fetch(&self, key: &NormalizedKey) -> ResourceResult<()> {
        let loader = self
            .loader
            .clone()
            .ok_or_else(|| ResourceError::NoLoader(self.name.clone()))?;
        let issued = self.store.lock().begin_load(key);
        tracing::debug!(resource = %self.name, key = %key, issued, "fetching");

        let fetched = loader.fetch(key).await.and_then(|items| {
            items
                .into_iter()
                .map(|v| -> ResourceResult<(NormalizedKey, Arc<V>)> {
                    Ok((self.model.normalize(&v.cache_key())?, Arc::new(v)))
                })
                .collect::<ResourceResult<Vec<_>>>()
        });
        match fetched {
            Ok(items) => {
                let changes = self.store.lock().apply_fetch(key, issued, items);
                if changes.discarded {
                    tracing::debug!(resource = %self.name, key = %key, "discarding fetch outdated in flight");
                }
                self.publish(changes);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(resource = %self.name, key = %key, error = %e, "load failed");
                self.store.lock().fail_load(key, issued, e.clone());
                Err(e)
            }
        }
    }

    fn relocate(&self, from: &TreePath, to: &TreePath) {
        let changes = self.store.lock().relabel(from, to);
        let rebound = self.uses.rebind(from, to);
        tracing::info!(
            resource = %self.name,
            from = %from,
            to = %to,
            entries = changes.moved.len(),
            rebound,
            "moved subtree"
        );
        self.publish(changes);
    }

    fn apply_outcome(&self, key: &NormalizedKey, outcome: MutationOutcome<V>) -> ResourceResult<()> {
        match outcome {
            MutationOutcome::Set(value) => {
                let target = self.model.normalize(&value.cache_key())?;
                let mut changes = self.store.lock().set(&target, Arc::new(value));
                changes.loaded = Some(target);
                self.publish(changes);
            }
            MutationOutcome::Delete => {
                let changes = self.store.lock().delete(key);
                self.publish(changes);
            }
            MutationOutcome::Move(to) => {
                let from = key
                    .as_path()
                    .cloned()
                    .ok_or_else(|| ResourceError::unsupported("move", &self.name))?;
                validate_move(&from, &to)?;
                if from != to {
                    self.relocate(&from, &to);
                }
            }
            MutationOutcome::Unchanged => {}
        }
        Ok(())
    }
}

pub(crate) fn validate_move(from: &TreePath, to: &TreePath) -> ResourceResult<()> {
    let invalid = |reason: &str| ResourceError::InvalidMove {
        from: from.to_string(),
        to: to.to_string(),
        reason: reason.to_string(),
    };
    if from.is_root() || to.is_root() {
        return Err(invalid("the root cannot be moved or replaced"));
    }
    if from.is_ancestor_of(to) {
        return Err(invalid("destination is inside the moved subtree"));
    }
    if to.is_ancestor_of(from) {
        return Err(invalid("destination is an ancestor of the source"));
    }
    Ok(())
}

/// Handle to a cached resource
///
/// Cloning is cheap; all clones share one store.
pub struct Resource<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for Resource<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> fmt::Debug for Resource<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("name", &self.inner.name)
            .field("id", &self.inner.id)
            .field("flavor", &self.inner.model.flavor())
            .finish_non_exhaustive()
    }
}

impl<V: Entity> Resource<V> {
    /// Start building a resource of any flavor
    #[must_use]
    pub fn builder(name: impl Into<String>, flavor: KeyFlavor) -> ResourceBuilder<V, Self> {
        ResourceBuilder::new(name, flavor)
    }

    /// Resource name
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Resource id
    #[inline]
    #[must_use]
    pub fn id(&self) -> ResourceId {
        self.inner.id
    }

    /// Key flavor
    #[inline]
    #[must_use]
    pub fn flavor(&self) -> KeyFlavor {
        self.inner.model.flavor()
    }

    /// Key model
    #[inline]
    #[must_use]
    pub fn model(&self) -> &Arc<KeyModel> {
        &self.inner.model
    }

    /// Use tracker of this resource
    #[inline]
    #[must_use]
    pub fn uses(&self) -> &Arc<UseTracker> {
        &self.inner.uses
    }

    /// Load scheduler of this resource
    #[inline]
    #[must_use]
    pub fn scheduler(&self) -> &LoadScheduler {
        &self.inner.scheduler
    }

    /// Normalize a key against this resource's model
    ///
    /// # Errors
    /// `ResourceError::Key` if the key is malformed or of the wrong shape
    pub fn normalize(&self, key: impl IntoCacheKey) -> ResourceResult<NormalizedKey> {
        Ok(key.normalize_in(&self.inner.model)?)
    }

    /// Cached value of an item, possibly outdated
    ///
    /// # Errors
    /// `ResourceError::Key` on a malformed key
    pub fn get(&self, key: impl IntoCacheKey) -> ResourceResult<Option<Arc<V>>> {
        let key = self.normalize(key)?;
        Ok(self.inner.store.lock().get(&key))
    }

    /// Check if an item has a cached value
    ///
    /// # Errors
    /// `ResourceError::Key` on a malformed key
    pub fn has(&self, key: impl IntoCacheKey) -> ResourceResult<bool> {
        let key = self.normalize(key)?;
        Ok(self.inner.store.lock().has(&key))
    }

    /// Cache state of a key, `None` if never seen
    ///
    /// # Errors
    /// `ResourceError::Key` on a malformed key
    pub fn state(&self, key: impl IntoCacheKey) -> ResourceResult<Option<EntryState>> {
        let key = self.normalize(key)?;
        Ok(self.inner.store.lock().state(&key))
    }

    /// Check if a cached key is outdated
    ///
    /// # Errors
    /// `ResourceError::Key` on a malformed key
    pub fn is_outdated(&self, key: impl IntoCacheKey) -> ResourceResult<bool> {
        let key = self.normalize(key)?;
        Ok(self.inner.store.lock().is_outdated(&key))
    }

    /// Entries behind a key, from cache only
    ///
    /// A loaded list yields its members in order; an unloaded list yields
    /// whatever cached items it structurally contains.
    ///
    /// # Errors
    /// `ResourceError::Key` on a malformed key
    pub fn cached(&self, key: impl IntoCacheKey) -> ResourceResult<Vec<(NormalizedKey, Arc<V>)>> {
        let key = self.normalize(key)?;
        let store = self.inner.store.lock();
        if key.is_item() {
            return Ok(store.get(&key).map(|v| (key, v)).into_iter().collect());
        }
        Ok(store.member_values(&key).unwrap_or_else(|| store.items_within(&key)))
    }

    /// Ensure a key is fresh and return its values
    ///
    /// Waits on the resource's requirements, then fetches the key unless it
    /// is fresh. Lists that are fresh but have outdated members reload those
    /// members individually.
    ///
    /// # Errors
    /// - `ResourceError::Key` on a malformed key
    /// - `ResourceError::Precondition` if a requirement fails
    /// - the stored error if the key is errored; call [`Resource::refresh`]
    ///   to retry
    /// - any loader failure
    pub async fn load(&self, key: impl IntoCacheKey) -> ResourceResult<Vec<Arc<V>>> {
        let key = self.normalize(key)?;
        self.ensure_loaded(&key).await?;
        Ok(self.read(&key))
    }

    /// Load an item key, `None` if the remote does not have it
    ///
    /// # Errors
    /// See [`Resource::load`]
    pub async fn load_one(&self, key: impl IntoCacheKey) -> ResourceResult<Option<Arc<V>>> {
        Ok(self.load(key).await?.into_iter().next())
    }

    /// Mark a key outdated, then load it
    ///
    /// # Errors
    /// See [`Resource::load`]
    pub async fn refresh(&self, key: impl IntoCacheKey) -> ResourceResult<Vec<Arc<V>>> {
        let key = self.normalize(key)?;
        self.outdate(&key);
        self.load(key).await
    }

    /// Mark a key (and everything it holds) outdated
    ///
    /// Returns every key marked. Values stay readable.
    ///
    /// # Errors
    /// `ResourceError::Key` on a malformed key
    pub fn mark_outdated(&self, key: impl IntoCacheKey) -> ResourceResult<Vec<NormalizedKey>> {
        let key = self.normalize(key)?;
        Ok(self.outdate(&key))
    }

    /// Write an item after a successful remote change
    ///
    /// Runs after any pending operation on the key.
    ///
    /// # Errors
    /// `ResourceError::Key` if the key is malformed or a list
    pub async fn set(&self, key: impl IntoCacheKey, value: V) -> ResourceResult<()> {
        let key = self.item_key(key)?;
        let inner = Arc::clone(&self.inner);
        let target = key.clone();
        self.inner
            .scheduler
            .mutation(vec![key], move || async move {
                let mut changes = inner.store.lock().set(&target, Arc::new(value));
                changes.loaded = Some(target);
                inner.publish(changes);
                Ok(())
            })
            .await
    }

    /// Remove an item (for trees, its whole subtree)
    ///
    /// # Errors
    /// `ResourceError::Key` on a malformed key
    pub async fn delete(&self, key: impl IntoCacheKey) -> ResourceResult<()> {
        let key = self.normalize(key)?;
        let inner = Arc::clone(&self.inner);
        let target = key.clone();
        self.inner
            .scheduler
            .mutation(vec![key], move || async move {
                let changes = inner.store.lock().delete(&target);
                inner.publish(changes);
                Ok(())
            })
            .await
    }

    /// Run a remote mutation and apply its outcome to the cache
    ///
    /// The mutation is serialized with every operation on the key. Nothing
    /// is applied if it fails.
    ///
    /// # Errors
    /// The mutation's own error, or `ResourceError::InvalidMove` /
    /// `ResourceError::Unsupported` for a move the resource cannot apply
    pub async fn mutate<F, Fut>(&self, key: impl IntoCacheKey, mutation: F) -> ResourceResult<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ResourceResult<MutationOutcome<V>>> + Send + 'static,
    {
        let key = self.normalize(key)?;
        let inner = Arc::clone(&self.inner);
        let target = key.clone();
        self.inner
            .scheduler
            .mutation(vec![key], move || async move {
                let outcome = mutation().await?;
                inner.apply_outcome(&target, outcome)
            })
            .await
    }

    /// Start using a key; see [`UseTracker`]
    ///
    /// # Errors
    /// `ResourceError::Key` on a malformed key
    pub fn use_key(&self, key: impl IntoCacheKey) -> ResourceResult<UseGuard> {
        let key = self.normalize(key)?;
        Ok(self.inner.uses.use_key(key))
    }

    /// Subscribe to item value changes
    pub fn on_item_update(&self, handler: impl Fn(&ItemUpdate<V>) + Send + Sync + 'static) -> SubscriptionId {
        self.inner.lifecycle.item_update.subscribe(handler)
    }

    /// Subscribe to item removals
    pub fn on_item_delete(&self, handler: impl Fn(&KeyEvent) + Send + Sync + 'static) -> SubscriptionId {
        self.inner.lifecycle.item_delete.subscribe(handler)
    }

    /// Subscribe to item moves
    pub fn on_item_move(&self, handler: impl Fn(&MoveEvent) + Send + Sync + 'static) -> SubscriptionId {
        self.inner.lifecycle.item_move.subscribe(handler)
    }

    /// Subscribe to outdate markings
    pub fn on_data_outdated(&self, handler: impl Fn(&OutdateEvent) + Send + Sync + 'static) -> SubscriptionId {
        self.inner.lifecycle.data_outdated.subscribe(handler)
    }

    /// Subscribe to completed loads and writes
    pub fn on_data_update(&self, handler: impl Fn(&KeyEvent) + Send + Sync + 'static) -> SubscriptionId {
        self.inner.lifecycle.data_update.subscribe(handler)
    }

    /// Remove a lifecycle subscription
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.lifecycle.unsubscribe(id)
    }

    /// Add a requirement waited on before every load
    pub fn require(&self, requirement: Requirement) {
        self.inner.requirements.write().push(requirement);
    }

    /// Bound how long loads wait on pending requirements
    pub fn set_requirement_timeout(&self, timeout: Option<Duration>) {
        *self.inner.wait_timeout.write() = timeout;
    }

    pub(crate) fn outdate(&self, key: &NormalizedKey) -> Vec<NormalizedKey> {
        let changes = self.inner.store.lock().mark_outdated(key);
        let marked = changes.outdated.clone();
        tracing::debug!(resource = %self.inner.name, key = %key, marked = marked.len(), "marked outdated");
        self.inner.publish(changes);
        marked
    }

    pub(crate) async fn relocate(&self, from: TreePath, to: TreePath) -> ResourceResult<()> {
        validate_move(&from, &to)?;
        if from == to {
            return Ok(());
        }
        let keys = vec![NormalizedKey::from(from.clone()), NormalizedKey::from(to.clone())];
        let inner = Arc::clone(&self.inner);
        self.inner
            .scheduler
            .mutation(keys, move || async move {
                inner.relocate(&from, &to);
                Ok(())
            })
            .await
    }

    /// Keys whose next load would list a newly created entity at `key`
    pub(crate) fn creation_scopes(&self, key: &NormalizedKey) -> Vec<NormalizedKey> {
        if let Some(parent) = key.as_path().and_then(TreePath::parent) {
            return vec![NormalizedKey::from(ListKey::Children(parent))];
        }
        let all = NormalizedKey::from(ListKey::All);
        let mut scopes: Vec<NormalizedKey> = self
            .inner
            .store
            .lock()
            .keys()
            .filter(|k| k.is_scope() && **k != all)
            .cloned()
            .collect();
        scopes.push(all);
        scopes
    }

    pub(crate) fn lifecycle(&self) -> &Lifecycle<V> {
        &self.inner.lifecycle
    }

    /// Wait on requirements, then make the key and, for lists, its members
    /// fresh
    pub(crate) async fn ensure_loaded(&self, key: &NormalizedKey) -> ResourceResult<()> {
        self.await_requirements().await?;
        self.ensure_key(key).await?;
        if key.is_item() {
            return Ok(());
        }
        let stale: Vec<NormalizedKey> = {
            let store = self.inner.store.lock();
            store
                .members(key)
                .unwrap_or_default()
                .into_iter()
                .filter(|m| !store.state(m).is_some_and(|s| s.is_fresh()))
                .collect()
        };
        if !stale.is_empty() {
            tracing::debug!(resource = %self.inner.name, key = %key, members = stale.len(), "reloading outdated members");
        }
        for result in join_all(stale.iter().map(|m| self.ensure_key(m))).await {
            result?;
        }
        Ok(())
    }

    async fn ensure_key(&self, key: &NormalizedKey) -> ResourceResult<()> {
        for _ in 0..MAX_STALE_ATTEMPTS {
            let (state, generation, floor) = {
                let store = self.inner.store.lock();
                (store.state(key), store.generation(), store.outdate_generation(key))
            };
            match state {
                Some(EntryState::Fresh) => {
                    tracing::trace!(resource = %self.inner.name, key = %key, "cache hit");
                    return Ok(());
                }
                Some(EntryState::Errored(e)) => return Err(e),
                _ => {}
            }
            let inner = Arc::clone(&self.inner);
            let target = key.clone();
            let scheduled = self
                .inner
                .scheduler
                .load(key.clone(), generation, floor, move || async move { inner.fetch(&target).await })
                .await;
            if scheduled.joined {
                tracing::debug!(resource = %self.inner.name, key = %key, "joined in-flight load");
            }
            scheduled.outcome?;
        }
        tracing::warn!(resource = %self.inner.name, key = %key, attempts = MAX_STALE_ATTEMPTS, "key kept being outdated while loading");
        Err(ResourceError::Aborted {
            key: key.canonical().to_string(),
            reason: format!("outdated again during each of {MAX_STALE_ATTEMPTS} loads"),
        })
    }

    async fn await_requirements(&self) -> ResourceResult<()> {
        let requirements = self.inner.requirements.read().clone();
        if requirements.is_empty() {
            return Ok(());
        }
        let timeout = *self.inner.wait_timeout.read();
        for requirement in &requirements {
            requirement.wait(timeout).await?;
        }
        Ok(())
    }

    fn item_key(&self, key: impl IntoCacheKey) -> ResourceResult<NormalizedKey> {
        let key = self.normalize(key)?;
        if key.is_scope() {
            return Err(KeyFormatError::wrong_shape("item", &key).into());
        }
        Ok(key)
    }

    fn read(&self, key: &NormalizedKey) -> Vec<Arc<V>> {
        let store = self.inner.store.lock();
        if key.is_item() {
            return store.get(key).into_iter().collect();
        }
        store
            .member_values(key)
            .unwrap_or_else(|| store.items_within(key))
            .into_iter()
            .map(|(_, v)| v)
            .collect()
    }
}

/// Wraps a built [`Resource`] into a flavored handle
pub trait ResourceKind<V>: Sized {
    /// Build the handle
    fn from_resource(resource: Resource<V>) -> Self;
}

impl<V> ResourceKind<V> for Resource<V> {
    fn from_resource(resource: Resource<V>) -> Self {
        resource
    }
}

/// Builder for resources
///
/// Usage:
/// ```rust,ignore
/// let projects = MapResource::<Project>::builder("projects")
///     .loader(RemoteLoader::new(network, "getProject", "listProjects"))
///     .alias("mine", CacheKey::List(ListKey::filter("projects", [("owner", "me")])?))?
///     .build();
/// ```
pub struct ResourceBuilder<V, R = Resource<V>> {
    name: String,
    model: KeyModel,
    loader: Option<Arc<dyn Loader<V>>>,
    wait_timeout: Option<Duration>,
    _kind: PhantomData<fn() -> R>,
}

impl<V: Entity, R: ResourceKind<V>> ResourceBuilder<V, R> {
    /// Create builder
    #[must_use]
    pub fn new(name: impl Into<String>, flavor: KeyFlavor) -> Self {
        Self {
            name: name.into(),
            model: KeyModel::new(flavor),
            loader: None,
            wait_timeout: None,
            _kind: PhantomData,
        }
    }

    /// With loader
    #[must_use]
    pub fn loader(mut self, loader: impl Loader<V> + 'static) -> Self {
        self.loader = Some(Arc::new(loader));
        self
    }

    /// With shared loader
    #[must_use]
    pub fn loader_arc(mut self, loader: Arc<dyn Loader<V>>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// With named alias
    ///
    /// # Errors
    /// `ConfigError::Key` if the target does not fit the resource flavor
    pub fn alias(mut self, name: impl Into<String>, target: CacheKey) -> Result<Self, ConfigError> {
        self.model = self.model.with_alias(name, target)?;
        Ok(self)
    }

    /// With requirement wait timeout
    #[must_use]
    pub fn requirement_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = Some(timeout);
        self
    }

    /// Build the resource
    #[must_use]
    pub fn build(self) -> R {
        let model = Arc::new(self.model);
        let inner = Inner {
            id: ResourceId::new(),
            store: Mutex::new(EntityStore::new(Arc::clone(&model))),
            scheduler: LoadScheduler::new(Arc::clone(&model)),
            uses: Arc::new(UseTracker::new(Arc::clone(&model))),
            loader: self.loader,
            lifecycle: Lifecycle::default(),
            requirements: RwLock::new(Vec::new()),
            wait_timeout: RwLock::new(self.wait_timeout),
            name: self.name,
            model,
        };
        R::from_resource(Resource { inner: Arc::new(inner) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        id: String,
        rev: u32,
    }

    impl Entity for Item {
        fn cache_key(&self) -> CacheKey {
            CacheKey::Entity(EntityId::new(self.id.clone()).unwrap())
        }
    }

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Loader<Item> for Arc<Counting> {
        async fn fetch(&self, key: &NormalizedKey) -> Result<Vec<Item>, ResourceError> {
            let rev = self.calls.fetch_add(1, Ordering::SeqCst) as u32 + 1;
            if self.fail {
                return Err(TransportError::Unavailable("offline".to_string()).into());
            }
            Ok(match key.canonical() {
                "@all" => vec![Item { id: "A".into(), rev }, Item { id: "B".into(), rev }],
                "missing" => Vec::new(),
                id => vec![Item { id: id.to_string(), rev }],
            })
        }
    }

    fn resource(loader: Arc<Counting>) -> Resource<Item> {
        Resource::builder("items", KeyFlavor::Flat).loader(loader).build()
    }

    #[tokio::test]
    async fn load_caches_until_outdated() {
        let loader = Arc::new(Counting::default());
        let items = resource(Arc::clone(&loader));
        let first = items.load_one("A").await.unwrap().unwrap();
        let again = items.load_one("A").await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);

        items.mark_outdated("A").unwrap();
        assert!(items.is_outdated("A").unwrap());
        assert_eq!(items.get("A").unwrap().unwrap().rev, 1);
        let fresh = items.load_one("A").await.unwrap().unwrap();
        assert_eq!(fresh.rev, 2);
    }

    #[tokio::test]
    async fn list_load_returns_members() {
        let loader = Arc::new(Counting::default());
        let items = resource(Arc::clone(&loader));
        let all = items.load("@all").await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(items.has("B").unwrap());
        assert_eq!(items.cached("@all").unwrap().len(), 2);
        items.load_one("B").await.unwrap();
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn outdated_member_reloads_alone() {
        let loader = Arc::new(Counting::default());
        let items = resource(Arc::clone(&loader));
        items.load("@all").await.unwrap();
        items.mark_outdated("B").unwrap();
        let all = items.load("@all").await.unwrap();
        assert_eq!(loader.calls.load(Ordering::SeqCst), 2);
        assert_eq!(all.iter().find(|i| i.id == "B").unwrap().rev, 2);
        assert_eq!(all.iter().find(|i| i.id == "A").unwrap().rev, 1);
    }

    #[tokio::test]
    async fn missing_entity_loads_as_none() {
        let items = resource(Arc::new(Counting::default()));
        assert_eq!(items.load_one("missing").await.unwrap(), None);
        assert!(items.state("missing").unwrap().unwrap().is_fresh());
    }

    #[tokio::test]
    async fn errored_key_is_sticky_until_refresh() {
        let loader = Arc::new(Counting {
            fail: true,
            ..Counting::default()
        });
        let items = resource(Arc::clone(&loader));
        assert!(items.load("A").await.is_err());
        assert!(items.state("A").unwrap().unwrap().error().is_some());
        assert!(items.load("A").await.is_err());
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);

        assert!(items.refresh("A").await.is_err());
        assert_eq!(loader.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn no_loader_is_reported() {
        let items: Resource<Item> = Resource::builder("bare", KeyFlavor::Flat).build();
        assert!(matches!(items.load("A").await, Err(ResourceError::NoLoader(_))));
    }

    #[tokio::test]
    async fn malformed_key_fails_fast() {
        let items = resource(Arc::new(Counting::default()));
        assert!(matches!(items.get("@bogus"), Err(ResourceError::Key(_))));
        assert!(matches!(items.load("docs/a").await, Err(ResourceError::Key(_))));
    }

    #[tokio::test]
    async fn set_and_delete_fire_lifecycle() {
        let items = resource(Arc::new(Counting::default()));
        let log = Arc::new(Mutex::new(Vec::new()));
        {
            let log = Arc::clone(&log);
            items.on_item_update(move |e| log.lock().push(format!("update {}", e.key)));
        }
        {
            let log = Arc::clone(&log);
            items.on_item_delete(move |e| log.lock().push(format!("delete {}", e.key)));
        }
        {
            let log = Arc::clone(&log);
            items.on_data_update(move |e| log.lock().push(format!("data {}", e.key)));
        }
        items.set("A", Item { id: "A".into(), rev: 9 }).await.unwrap();
        items.delete("A").await.unwrap();
        assert_eq!(*log.lock(), vec!["update A", "data A", "delete A"]);
        assert!(items.set("@all", Item { id: "A".into(), rev: 1 }).await.is_err());
    }

    #[tokio::test]
    async fn mutate_applies_outcome_only_on_success() {
        let items = resource(Arc::new(Counting::default()));
        items
            .mutate("C", || async { Ok(MutationOutcome::Set(Item { id: "C".into(), rev: 5 })) })
            .await
            .unwrap();
        assert_eq!(items.get("C").unwrap().unwrap().rev, 5);

        let failed = items
            .mutate("C", || async {
                Err::<MutationOutcome<Item>, _>(TransportError::remote("deleteItem", "forbidden").into())
            })
            .await;
        assert!(failed.is_err());
        assert!(items.has("C").unwrap());

        items.mutate("C", || async { Ok(MutationOutcome::Delete) }).await.unwrap();
        assert!(!items.has("C").unwrap());

        let moved = items.mutate("A", || async { Ok(MutationOutcome::Move("x".parse().unwrap())) }).await;
        assert!(matches!(moved, Err(ResourceError::Unsupported { .. })));
    }

    #[test]
    fn move_validation() {
        let p = |s: &str| s.parse::<TreePath>().unwrap();
        assert!(validate_move(&p("docs"), &p("archive/docs")).is_ok());
        assert!(validate_move(&p(""), &p("x")).is_err());
        assert!(validate_move(&p("docs"), &p("docs/inner")).is_err());
        assert!(validate_move(&p("docs/inner"), &p("docs")).is_err());
    }
}
