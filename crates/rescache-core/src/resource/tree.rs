//! Hierarchical resources keyed by tree path
//!
//! Children lists (`@children:<parent>`) are ordinary list keys in the
//! store, so the parent/children index is derived from the paths and the
//! order the loader returned them in.

use super::{validate_move, Entity, IntoCacheKey, Resource, ResourceBuilder, ResourceKind};
use crate::error::{ResourceError, ResourceResult};
use rescache_key::{KeyFlavor, ListKey, NormalizedKey, TreePath};
use std::ops::Deref;
use std::sync::Arc;

/// Resource over a tree of paths
///
/// Dereferences to [`Resource`] for the shared operations.
pub struct TreeResource<V>(Resource<V>);

impl<V: Entity> TreeResource<V> {
    /// Start building a tree resource
    #[must_use]
    pub fn builder(name: impl Into<String>) -> ResourceBuilder<V, Self> {
        ResourceBuilder::new(name, KeyFlavor::Tree)
    }

    /// Cached direct children of a path, in listed order
    ///
    /// # Errors
    /// `ResourceError::Key` if `parent` is not a path
    pub fn children(&self, parent: impl IntoCacheKey) -> ResourceResult<Vec<(NormalizedKey, Arc<V>)>> {
        let parent = self.parent_path(parent)?;
        self.0.cached(ListKey::Children(parent))
    }

    /// Load the direct children of a path
    ///
    /// # Errors
    /// See [`Resource::load`]
    pub async fn load_children(&self, parent: impl IntoCacheKey) -> ResourceResult<Vec<Arc<V>>> {
        let parent = self.parent_path(parent)?;
        self.0.load(ListKey::Children(parent)).await
    }

    /// Relabel a subtree after it moved remotely
    ///
    /// Every cached entry under `from` (children lists included) moves under
    /// `to` in one step, keeping its value and children order. Entries
    /// already cached under `to` are replaced. Consumers using a moved key
    /// are rebound.
    ///
    /// # Errors
    /// `ResourceError::InvalidMove` when moving the root, or moving a path
    /// into its own subtree or onto one of its ancestors
    pub async fn move_path(&self, from: impl IntoCacheKey, to: impl IntoCacheKey) -> ResourceResult<()> {
        let from = self.path(from)?;
        let to = self.path(to)?;
        validate_move(&from, &to)?;
        self.0.relocate(from, to).await
    }

    /// Underlying resource handle
    #[inline]
    #[must_use]
    pub fn resource(&self) -> &Resource<V> {
        &self.0
    }

    fn path(&self, key: impl IntoCacheKey) -> ResourceResult<TreePath> {
        let key = self.0.normalize(key)?;
        key.as_path().cloned().ok_or_else(|| ResourceError::InvalidMove {
            from: key.canonical().to_string(),
            to: String::new(),
            reason: "only paths can move".to_string(),
        })
    }

    fn parent_path(&self, key: impl IntoCacheKey) -> ResourceResult<TreePath> {
        let key = self.0.normalize(key)?;
        match key.as_path() {
            Some(path) => Ok(path.clone()),
            None => Err(rescache_key::KeyFormatError::wrong_shape("path", &key).into()),
        }
    }
}

impl<V> ResourceKind<V> for TreeResource<V> {
    fn from_resource(resource: Resource<V>) -> Self {
        Self(resource)
    }
}

impl<V> Deref for TreeResource<V> {
    type Target = Resource<V>;

    fn deref(&self) -> &Resource<V> {
        &self.0
    }
}

impl<V> Clone for TreeResource<V> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<V> std::fmt::Debug for TreeResource<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("TreeResource").field(&self.0).finish()
    }
}
