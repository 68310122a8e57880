//! Key shapes
//!
//! A [`CacheKey`] is one of four shapes: a scalar entity identifier, a list
//! selector, a tree path, or a symbolic alias that a resource resolves into
//! one of the other three before touching its store.

use crate::error::KeyFormatError;
use crate::path::TreePath;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

/// Prefix reserved for list and alias keys in canonical form
pub const RESERVED_PREFIX: char = '@';

/// Opaque identifier of a single entity
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityId(String);

impl EntityId {
    /// Create identifier
    ///
    /// # Errors
    /// `KeyFormatError::InvalidIdentifier` if empty or starting with `@`
    pub fn new(id: impl Into<String>) -> Result<Self, KeyFormatError> {
        let id = id.into();
        if id.is_empty() || id.starts_with(RESERVED_PREFIX) || id.chars().any(char::is_whitespace) {
            return Err(KeyFormatError::InvalidIdentifier(id));
        }
        Ok(Self(id))
    }

    /// Get identifier string
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for EntityId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for EntityId {
    type Error = KeyFormatError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<EntityId> for String {
    fn from(id: EntityId) -> Self {
        id.0
    }
}

/// Named, parameterized selector resolving to a set of entities at load time
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ListKey {
    /// Every entity of the resource
    All,
    /// Direct children of a tree path
    Children(TreePath),
    /// Entities matching a named filter with parameters
    Filter {
        name: String,
        params: BTreeMap<String, String>,
    },
}

impl ListKey {
    /// Create a filter selector
    ///
    /// # Errors
    /// `KeyFormatError::InvalidSelector` if the name or a parameter uses a
    /// character reserved by the canonical form (`?`, `&`, `=`, `@`)
    pub fn filter<K, V>(
        name: impl Into<String>,
        params: impl IntoIterator<Item = (K, V)>,
    ) -> Result<Self, KeyFormatError>
    where
        K: Into<String>,
        V: Into<String>,
    {
        let name = name.into();
        validate_selector_part(&name, false)?;
        let mut map = BTreeMap::new();
        for (k, v) in params {
            let (k, v) = (k.into(), v.into());
            validate_selector_part(&k, false)?;
            validate_selector_part(&v, true)?;
            map.insert(k, v);
        }
        Ok(Self::Filter { name, params: map })
    }

    /// Check if this selector lists every entity
    #[inline]
    #[must_use]
    pub fn is_all(&self) -> bool {
        matches!(self, Self::All)
    }

    /// Whether a fetch of this selector is authoritative for its whole scope
    ///
    /// `All` and `Children` enumerate their scope completely; filters only
    /// describe their own membership.
    #[inline]
    #[must_use]
    pub fn is_exhaustive(&self) -> bool {
        matches!(self, Self::All | Self::Children(_))
    }
}

fn validate_selector_part(part: &str, allow_empty: bool) -> Result<(), KeyFormatError> {
    if (!allow_empty && part.is_empty())
        || part.contains(['?', '&', '='])
        || part.starts_with(RESERVED_PREFIX)
    {
        return Err(KeyFormatError::InvalidSelector(part.to_string()));
    }
    Ok(())
}

impl Display for ListKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("@all"),
            Self::Children(parent) => write!(f, "@children:{parent}"),
            Self::Filter { name, params } => {
                write!(f, "@list:{name}")?;
                for (i, (k, v)) in params.iter().enumerate() {
                    let sep = if i == 0 { '?' } else { '&' };
                    write!(f, "{sep}{k}={v}")?;
                }
                Ok(())
            }
        }
    }
}

/// Symbolic key resolved by the owning resource
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Alias {
    /// Everything the resource holds
    All,
    /// Children of a tree path
    Children(TreePath),
    /// Alias registered on the resource at construction
    Named(String),
}

impl Display for Alias {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("@all"),
            Self::Children(parent) => write!(f, "@children:{parent}"),
            Self::Named(name) => write!(f, "@alias:{name}"),
        }
    }
}

/// Any key a caller may hand to a resource
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CacheKey {
    /// Single entity
    Entity(EntityId),
    /// Set of entities selected by criteria
    List(ListKey),
    /// Node of a tree resource
    Path(TreePath),
    /// Symbolic key
    Alias(Alias),
}

impl CacheKey {
    /// Scalar key from an identifier
    ///
    /// # Errors
    /// See [`EntityId::new`]
    pub fn entity(id: impl Into<String>) -> Result<Self, KeyFormatError> {
        EntityId::new(id).map(Self::Entity)
    }

    /// Tree-path key from its slash-delimited form
    ///
    /// # Errors
    /// See [`TreePath`]'s `FromStr`
    pub fn path(path: &str) -> Result<Self, KeyFormatError> {
        path.parse().map(Self::Path)
    }

    /// The list-all alias
    #[inline]
    #[must_use]
    pub fn all() -> Self {
        Self::Alias(Alias::All)
    }

    /// The children-of alias for a tree path
    #[inline]
    #[must_use]
    pub fn children(parent: TreePath) -> Self {
        Self::Alias(Alias::Children(parent))
    }

    /// A named alias
    #[inline]
    #[must_use]
    pub fn alias(name: impl Into<String>) -> Self {
        Self::Alias(Alias::Named(name.into()))
    }

    /// Check if key is symbolic
    #[inline]
    #[must_use]
    pub fn is_alias(&self) -> bool {
        matches!(self, Self::Alias(_))
    }

    /// Check if key selects a set rather than one entity
    #[inline]
    #[must_use]
    pub fn is_scope(&self) -> bool {
        matches!(self, Self::List(_) | Self::Alias(_))
    }

    /// Tree path, if this is a path key
    #[inline]
    #[must_use]
    pub fn as_path(&self) -> Option<&TreePath> {
        match self {
            Self::Path(p) => Some(p),
            _ => None,
        }
    }

    /// Canonical string form
    ///
    /// Aliases `All` and `Children` print like the lists they resolve to.
    #[must_use]
    pub fn canonical(&self) -> String {
        self.to_string()
    }
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Entity(id) => Display::fmt(id, f),
            Self::List(list) => Display::fmt(list, f),
            Self::Path(path) => Display::fmt(path, f),
            Self::Alias(alias) => Display::fmt(alias, f),
        }
    }
}

impl From<EntityId> for CacheKey {
    fn from(id: EntityId) -> Self {
        Self::Entity(id)
    }
}

impl From<TreePath> for CacheKey {
    fn from(path: TreePath) -> Self {
        Self::Path(path)
    }
}

impl From<ListKey> for CacheKey {
    fn from(list: ListKey) -> Self {
        Self::List(list)
    }
}

impl From<Alias> for CacheKey {
    fn from(alias: Alias) -> Self {
        Self::Alias(alias)
    }
}
