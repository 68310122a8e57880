//! Key model: alias resolution, normalization and containment
//!
//! Each resource owns one [`KeyModel`]. The model decides which key shapes
//! the resource accepts, turns aliases into concrete keys, and answers the
//! containment/overlap questions the store and scheduler rely on.

use crate::error::KeyFormatError;
use crate::key::{Alias, CacheKey, EntityId, ListKey, RESERVED_PREFIX};
use crate::path::TreePath;
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

/// Which concrete item keys a resource stores
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyFlavor {
    /// Flat map of entity identifiers
    Flat,
    /// Hierarchy of tree paths
    Tree,
}

impl Display for KeyFlavor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flat => f.write_str("flat"),
            Self::Tree => f.write_str("tree"),
        }
    }
}

/// Concrete key in canonical form
///
/// Only produced by [`KeyModel::normalize`], so it never holds an alias and
/// always fits the flavor of the model that produced it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NormalizedKey {
    key: CacheKey,
    canonical: String,
}

impl NormalizedKey {
    fn new(key: CacheKey) -> Self {
        let canonical = key.canonical();
        Self { key, canonical }
    }

    /// Underlying concrete key
    #[inline]
    #[must_use]
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Canonical string used for lookup and logging
    #[inline]
    #[must_use]
    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    /// List selector, if this key addresses a set
    #[inline]
    #[must_use]
    pub fn as_list(&self) -> Option<&ListKey> {
        match &self.key {
            CacheKey::List(list) => Some(list),
            _ => None,
        }
    }

    /// Tree path, if this is a path key
    #[inline]
    #[must_use]
    pub fn as_path(&self) -> Option<&TreePath> {
        self.key.as_path()
    }

    /// Check if key addresses a set of entities
    #[inline]
    #[must_use]
    pub fn is_scope(&self) -> bool {
        matches!(self.key, CacheKey::List(_))
    }

    /// Check if key addresses one entity
    #[inline]
    #[must_use]
    pub fn is_item(&self) -> bool {
        !self.is_scope()
    }

    /// Consume into the concrete key
    #[inline]
    #[must_use]
    pub fn into_key(self) -> CacheKey {
        self.key
    }
}

impl Display for NormalizedKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

impl AsRef<CacheKey> for NormalizedKey {
    fn as_ref(&self) -> &CacheKey {
        &self.key
    }
}

/// Per-resource key model
#[derive(Debug, Clone)]
pub struct KeyModel {
    flavor: KeyFlavor,
    aliases: BTreeMap<String, CacheKey>,
}

impl KeyModel {
    /// Create model for a flavor with no named aliases
    #[inline]
    #[must_use]
    pub fn new(flavor: KeyFlavor) -> Self {
        Self {
            flavor,
            aliases: BTreeMap::new(),
        }
    }

    /// Register a named alias
    ///
    /// # Errors
    /// The target must itself normalize under this model (it may not be a
    /// named alias).
    pub fn with_alias(mut self, name: impl Into<String>, target: CacheKey) -> Result<Self, KeyFormatError> {
        let name = name.into();
        if name.is_empty() || name.contains(RESERVED_PREFIX) {
            return Err(KeyFormatError::Malformed(format!("@alias:{name}")));
        }
        if matches!(target, CacheKey::Alias(Alias::Named(_))) {
            return Err(KeyFormatError::Malformed(target.canonical()));
        }
        let normalized = self.normalize(&target)?;
        self.aliases.insert(name, normalized.into_key());
        Ok(self)
    }

    /// Resource flavor
    #[inline]
    #[must_use]
    pub fn flavor(&self) -> KeyFlavor {
        self.flavor
    }

    /// Check if a key is symbolic
    #[inline]
    #[must_use]
    pub fn is_alias(&self, key: &CacheKey) -> bool {
        key.is_alias()
    }

    /// Resolve aliases to concrete keys
    ///
    /// # Errors
    /// `KeyFormatError::UnknownAlias` for an unregistered named alias
    pub fn resolve(&self, key: &CacheKey) -> Result<CacheKey, KeyFormatError> {
        match key {
            CacheKey::Alias(Alias::All) => Ok(CacheKey::List(ListKey::All)),
            CacheKey::Alias(Alias::Children(parent)) => Ok(CacheKey::List(ListKey::Children(parent.clone()))),
            CacheKey::Alias(Alias::Named(name)) => self
                .aliases
                .get(name)
                .cloned()
                .ok_or_else(|| KeyFormatError::UnknownAlias(name.clone())),
            other => Ok(other.clone()),
        }
    }

    /// Resolve and check a key against this model
    ///
    /// # Errors
    /// - `KeyFormatError::UnknownAlias` for unregistered aliases
    /// - `KeyFormatError::WrongShape` if the key does not fit the flavor
    pub fn normalize(&self, key: &CacheKey) -> Result<NormalizedKey, KeyFormatError> {
        let resolved = self.resolve(key)?;
        let fits = match (&resolved, self.flavor) {
            (CacheKey::Entity(_), KeyFlavor::Flat) => true,
            (CacheKey::Path(_), KeyFlavor::Tree) => true,
            (CacheKey::List(ListKey::Children(_)), KeyFlavor::Tree) => true,
            (CacheKey::List(ListKey::All | ListKey::Filter { .. }), _) => true,
            _ => false,
        };
        if !fits {
            return Err(KeyFormatError::wrong_shape(self.flavor, &resolved));
        }
        Ok(NormalizedKey::new(resolved))
    }

    /// Parse a canonical string, then normalize it
    ///
    /// # Errors
    /// See [`KeyModel::parse`] and [`KeyModel::normalize`]
    pub fn normalize_str(&self, raw: &str) -> Result<NormalizedKey, KeyFormatError> {
        let key = self.parse(raw)?;
        self.normalize(&key)
    }

    /// Parse a canonical string into a key
    ///
    /// Plain strings are entity identifiers on flat resources and paths on
    /// tree resources.
    ///
    /// # Errors
    /// `KeyFormatError` if the string matches no key grammar
    pub fn parse(&self, raw: &str) -> Result<CacheKey, KeyFormatError> {
        if let Some(rest) = raw.strip_prefix(RESERVED_PREFIX) {
            return parse_reserved(raw, rest);
        }
        match self.flavor {
            KeyFlavor::Flat => CacheKey::entity(raw),
            KeyFlavor::Tree => CacheKey::path(raw),
        }
    }

    /// Check if `inner` is equal to or structurally inside `outer`
    ///
    /// Unresolvable aliases contain nothing. Membership of entities in filter
    /// lists is data, not structure, and is answered by the store.
    #[must_use]
    pub fn contains(&self, outer: &CacheKey, inner: &CacheKey) -> bool {
        let (Ok(outer), Ok(inner)) = (self.resolve(outer), self.resolve(inner)) else {
            return false;
        };
        match (&outer, &inner) {
            (CacheKey::List(ListKey::All), _) => true,
            (CacheKey::List(ListKey::Children(parent)), CacheKey::Path(path)) => parent.is_parent_of(path),
            (
                CacheKey::List(ListKey::Filter { name, params }),
                CacheKey::List(ListKey::Filter {
                    name: other_name,
                    params: other_params,
                }),
            ) => name == other_name && params.iter().all(|(k, v)| other_params.get(k) == Some(v)),
            (CacheKey::Path(prefix), CacheKey::Path(path)) => prefix.is_prefix_of(path),
            (CacheKey::Path(prefix), CacheKey::List(ListKey::Children(parent))) => prefix.is_prefix_of(parent),
            (a, b) => a == b,
        }
    }

    /// Check if either key contains the other
    #[inline]
    #[must_use]
    pub fn overlaps(&self, a: &CacheKey, b: &CacheKey) -> bool {
        self.contains(a, b) || self.contains(b, a)
    }
}

fn parse_reserved(raw: &str, rest: &str) -> Result<CacheKey, KeyFormatError> {
    if rest == "all" {
        return Ok(CacheKey::List(ListKey::All));
    }
    if let Some(parent) = rest.strip_prefix("children:") {
        return Ok(CacheKey::List(ListKey::Children(parent.parse()?)));
    }
    if let Some(name) = rest.strip_prefix("alias:") {
        if name.is_empty() {
            return Err(KeyFormatError::Malformed(raw.to_string()));
        }
        return Ok(CacheKey::alias(name));
    }
    if let Some(selector) = rest.strip_prefix("list:") {
        let (name, query) = selector.split_once('?').unwrap_or((selector, ""));
        let mut params = Vec::new();
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (k, v) = pair
                .split_once('=')
                .ok_or_else(|| KeyFormatError::Malformed(raw.to_string()))?;
            params.push((k.to_string(), v.to_string()));
        }
        return ListKey::filter(name, params).map(CacheKey::List);
    }
    Err(KeyFormatError::Malformed(raw.to_string()))
}

impl From<EntityId> for NormalizedKey {
    fn from(id: EntityId) -> Self {
        Self::new(CacheKey::Entity(id))
    }
}

impl From<TreePath> for NormalizedKey {
    fn from(path: TreePath) -> Self {
        Self::new(CacheKey::Path(path))
    }
}

impl From<ListKey> for NormalizedKey {
    fn from(list: ListKey) -> Self {
        Self::new(CacheKey::List(list))
    }
}
