//! Entities and loaders
//!
//! A [`Loader`] turns a normalized key into the entities the remote holds for
//! it: zero or one for an item key, any number for a list key.
//! [`RemoteLoader`] is the stock implementation on top of the [`Network`]
//! collaborator.

use crate::collab::Network;
use crate::error::{ResourceError, TransportError};
use async_trait::async_trait;
use rescache_key::{CacheKey, ListKey, NormalizedKey};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// Value stored by a resource
///
/// Each entity knows its own key: an entity id for flat resources, a tree
/// path for tree resources.
pub trait Entity: Send + Sync + 'static {
    /// Key this entity is stored under
    fn cache_key(&self) -> CacheKey;
}

/// Source of entities for a resource
#[async_trait]
pub trait Loader<V>: Send + Sync {
    /// Fetch the entities behind a key
    ///
    /// An empty result for an item key means the entity does not exist.
    ///
    /// # Errors
    /// Any `ResourceError`; it is stored on the key and shared with every
    /// caller waiting on the load
    async fn fetch(&self, key: &NormalizedKey) -> Result<Vec<V>, ResourceError>;
}

/// Loader calling a pair of remote operations
///
/// Item keys call the `item` operation, list keys the `list` operation. The
/// result may be `null` (nothing), a single object or an array of objects.
pub struct RemoteLoader<V> {
    network: Arc<dyn Network>,
    item_operation: String,
    list_operation: String,
    _entity: PhantomData<fn() -> V>,
}

impl<V> RemoteLoader<V> {
    /// Create loader over a network collaborator
    pub fn new(network: Arc<dyn Network>, item_operation: impl Into<String>, list_operation: impl Into<String>) -> Self {
        Self {
            network,
            item_operation: item_operation.into(),
            list_operation: list_operation.into(),
            _entity: PhantomData,
        }
    }

    /// Operation name used for a key
    #[must_use]
    pub fn operation_for(&self, key: &NormalizedKey) -> &str {
        if key.is_item() {
            &self.item_operation
        } else {
            &self.list_operation
        }
    }
}

impl<V> fmt::Debug for RemoteLoader<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteLoader")
            .field("item_operation", &self.item_operation)
            .field("list_operation", &self.list_operation)
            .finish_non_exhaustive()
    }
}

/// Request parameters describing a key
#[must_use]
pub fn params_for(key: &NormalizedKey) -> Value {
    match key.key() {
        CacheKey::Entity(id) => json!({ "id": id.as_str() }),
        CacheKey::Path(path) => json!({ "path": path.to_string() }),
        CacheKey::List(ListKey::All) => json!({}),
        CacheKey::List(ListKey::Children(parent)) => json!({ "parent": parent.to_string() }),
        CacheKey::List(ListKey::Filter { name, params }) => json!({ "filter": name, "params": params }),
        CacheKey::Alias(_) => json!({ "key": key.canonical() }),
    }
}

fn decode<V: DeserializeOwned>(operation: &str, value: Value) -> Result<Vec<V>, TransportError> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => items
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<V>, _>>()
            .map_err(|e| TransportError::decode(operation, e)),
        other => serde_json::from_value(other)
            .map(|v| vec![v])
            .map_err(|e| TransportError::decode(operation, e)),
    }
}

#[async_trait]
impl<V> Loader<V> for RemoteLoader<V>
where
    V: DeserializeOwned + Send + Sync + 'static,
{
    async fn fetch(&self, key: &NormalizedKey) -> Result<Vec<V>, ResourceError> {
        let operation = self.operation_for(key);
        let result = self.network.call(operation, params_for(key)).await?;
        Ok(decode(operation, result)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rescache_key::{KeyFlavor, KeyModel};
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Row {
        id: String,
    }

    struct Echo(Value);

    #[async_trait]
    impl Network for Echo {
        async fn call(&self, operation: &str, params: Value) -> Result<Value, TransportError> {
            if operation == "fail" {
                return Err(TransportError::remote(operation, params.to_string()));
            }
            Ok(self.0.clone())
        }
    }

    fn flat(s: &str) -> NormalizedKey {
        KeyModel::new(KeyFlavor::Flat).normalize_str(s).unwrap()
    }

    #[test]
    fn params_follow_key_shape() {
        assert_eq!(params_for(&flat("P1")), json!({"id": "P1"}));
        assert_eq!(params_for(&flat("@all")), json!({}));
        assert_eq!(
            params_for(&flat("@list:mine?owner=u1")),
            json!({"filter": "mine", "params": {"owner": "u1"}})
        );
        let tree = KeyModel::new(KeyFlavor::Tree);
        assert_eq!(params_for(&tree.normalize_str("docs/a.txt").unwrap()), json!({"path": "docs/a.txt"}));
        assert_eq!(params_for(&tree.normalize_str("@children:docs").unwrap()), json!({"parent": "docs"}));
    }

    #[tokio::test]
    async fn decodes_null_object_and_array() {
        let null: RemoteLoader<Row> = RemoteLoader::new(Arc::new(Echo(Value::Null)), "get", "list");
        assert!(null.fetch(&flat("P1")).await.unwrap().is_empty());

        let one: RemoteLoader<Row> = RemoteLoader::new(Arc::new(Echo(json!({"id": "P1"}))), "get", "list");
        assert_eq!(one.fetch(&flat("P1")).await.unwrap(), vec![Row { id: "P1".into() }]);

        let many: RemoteLoader<Row> =
            RemoteLoader::new(Arc::new(Echo(json!([{"id": "P1"}, {"id": "P2"}]))), "get", "list");
        assert_eq!(many.fetch(&flat("@all")).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn decode_failure_is_transport_error() {
        let loader: RemoteLoader<Row> = RemoteLoader::new(Arc::new(Echo(json!([{"name": 3}]))), "get", "list");
        let err = loader.fetch(&flat("@all")).await.unwrap_err();
        assert!(matches!(err, ResourceError::Transport(TransportError::Decode { .. })));
    }

    #[tokio::test]
    async fn remote_failure_propagates() {
        let loader: RemoteLoader<Row> = RemoteLoader::new(Arc::new(Echo(Value::Null)), "fail", "list");
        assert!(matches!(
            loader.fetch(&flat("P1")).await,
            Err(ResourceError::Transport(TransportError::Remote { .. }))
        ));
    }
}
