//! Flat resources keyed by entity id

use super::{Entity, Resource, ResourceBuilder, ResourceKind};
use crate::error::ResourceResult;
use rescache_key::{KeyFlavor, ListKey, NormalizedKey};
use std::ops::Deref;
use std::sync::Arc;

/// Resource mapping entity ids to entities
///
/// Dereferences to [`Resource`] for the shared operations.
pub struct MapResource<V>(Resource<V>);

impl<V: Entity> MapResource<V> {
    /// Start building a flat resource
    #[must_use]
    pub fn builder(name: impl Into<String>) -> ResourceBuilder<V, Self> {
        ResourceBuilder::new(name, KeyFlavor::Flat)
    }

    /// Load every entity (`@all`)
    ///
    /// # Errors
    /// See [`Resource::load`]
    pub async fn load_all(&self) -> ResourceResult<Vec<Arc<V>>> {
        self.0.load(ListKey::All).await
    }

    /// Cached entities, in `@all` order when it is loaded
    #[must_use]
    pub fn entries(&self) -> Vec<(NormalizedKey, Arc<V>)> {
        self.0.cached(ListKey::All).unwrap_or_default()
    }

    /// Underlying resource handle
    #[inline]
    #[must_use]
    pub fn resource(&self) -> &Resource<V> {
        &self.0
    }
}

impl<V> ResourceKind<V> for MapResource<V> {
    fn from_resource(resource: Resource<V>) -> Self {
        Self(resource)
    }
}

impl<V> Deref for MapResource<V> {
    type Target = Resource<V>;

    fn deref(&self) -> &Resource<V> {
        &self.0
    }
}

impl<V> Clone for MapResource<V> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<V> std::fmt::Debug for MapResource<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("MapResource").field(&self.0).finish()
    }
}
