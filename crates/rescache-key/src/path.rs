//! Slash-delimited tree paths
//!
//! Provides [`TreePath`] for hierarchical keys where ancestry is structural:
//! `a/b` is a child of `a`, and `ab` is unrelated to `abc`.

use crate::error::KeyFormatError;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// Path separator
pub const SEPARATOR: char = '/';

/// Path within a tree resource
///
/// Segments are validated on construction, so a `TreePath` value is always
/// well-formed. The root is the empty path.
///
/// # Examples
/// - `["docs", "a.txt"]` → `docs/a.txt`
/// - `[]` → `` (root)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TreePath(Vec<String>);

impl TreePath {
    /// Create path from segments
    ///
    /// # Errors
    /// - `KeyFormatError::EmptySegment` if a segment is empty
    /// - `KeyFormatError::EmbeddedSeparator` if a segment contains `/`
    pub fn new<S: Into<String>>(segments: impl IntoIterator<Item = S>) -> Result<Self, KeyFormatError> {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        for seg in &segments {
            validate_segment(seg, &segments)?;
        }
        Ok(Self(segments))
    }

    /// Empty path (root)
    #[inline]
    #[must_use]
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Get path segments
    #[inline]
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Number of segments
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if path is the root
    #[inline]
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Get parent path (if not root)
    #[inline]
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.0.is_empty() {
            None
        } else {
            Some(Self(self.0[..self.0.len() - 1].to_vec()))
        }
    }

    /// Get last segment (if not root)
    #[inline]
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.0.last().map(|s| s.as_str())
    }

    /// Append a segment, returning new path
    ///
    /// # Errors
    /// Same as [`TreePath::new`] for the appended segment.
    pub fn child(&self, segment: impl Into<String>) -> Result<Self, KeyFormatError> {
        let segment = segment.into();
        validate_segment(&segment, &self.0)?;
        let mut new = self.clone();
        new.0.push(segment);
        Ok(new)
    }

    /// Check if this path is a structural prefix of another (or equal)
    ///
    /// # Examples
    /// - `docs` is prefix of `docs/a.txt`
    /// - `ab` is NOT prefix of `abc`
    #[inline]
    #[must_use]
    pub fn is_prefix_of(&self, other: &Self) -> bool {
        if self.0.len() > other.0.len() {
            return false;
        }
        self.0 == other.0[..self.0.len()]
    }

    /// Check if this path is a strict ancestor of another
    #[inline]
    #[must_use]
    pub fn is_ancestor_of(&self, other: &Self) -> bool {
        self.0.len() < other.0.len() && self.is_prefix_of(other)
    }

    /// Check if `self` is the direct parent of `other`
    #[inline]
    #[must_use]
    pub fn is_parent_of(&self, other: &Self) -> bool {
        other.0.len() == self.0.len() + 1 && self.is_prefix_of(other)
    }

    /// Check if paths overlap (one is prefix of other)
    #[inline]
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.is_prefix_of(other) || other.is_prefix_of(self)
    }

    /// Get relative path from ancestor
    ///
    /// Returns `None` if `self` is not under `ancestor`.
    #[must_use]
    pub fn relative_to(&self, ancestor: &Self) -> Option<Self> {
        ancestor
            .is_prefix_of(self)
            .then(|| Self(self.0[ancestor.0.len()..].to_vec()))
    }

    /// Replace the `from` prefix with `to`
    ///
    /// Returns `None` if `self` is not under `from`.
    #[must_use]
    pub fn rebase(&self, from: &Self, to: &Self) -> Option<Self> {
        let rest = self.relative_to(from)?;
        let mut segments = to.0.clone();
        segments.extend(rest.0);
        Some(Self(segments))
    }

    /// Iterator over segments from root to leaf
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|s| s.as_str())
    }
}

fn validate_segment(segment: &str, path: &[String]) -> Result<(), KeyFormatError> {
    if segment.is_empty() {
        Err(KeyFormatError::EmptySegment {
            path: path.join("/"),
        })
    } else if segment.contains(SEPARATOR) {
        Err(KeyFormatError::EmbeddedSeparator {
            segment: segment.to_string(),
        })
    } else {
        Ok(())
    }
}

impl Display for TreePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

impl FromStr for TreePath {
    type Err = KeyFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(Self::root());
        }

        let segments = s
            .split(SEPARATOR)
            .map(|seg| {
                if seg.is_empty() {
                    Err(KeyFormatError::EmptySegment { path: s.to_string() })
                } else {
                    Ok(seg.to_string())
                }
            })
            .collect::<Result<_, _>>()?;

        Ok(Self(segments))
    }
}

impl TryFrom<String> for TreePath {
    type Error = KeyFormatError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TreePath> for String {
    fn from(path: TreePath) -> Self {
        path.to_string()
    }
}

impl Default for TreePath {
    fn default() -> Self {
        Self::root()
    }
}
