//! Error types for key construction and normalization

/// Errors raised while building, parsing or normalizing a key
///
/// Key errors are never retryable: the same input always fails the same way,
/// so callers receive them immediately instead of through a cache entry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyFormatError {
    /// Tree path contains an empty segment (`a//b`, leading or trailing `/`)
    #[error("tree path '{path}' contains an empty segment")]
    EmptySegment {
        /// Path as given
        path: String,
    },

    /// A single segment carries the path separator
    #[error("segment '{segment}' embeds the '/' separator")]
    EmbeddedSeparator {
        /// Offending segment
        segment: String,
    },

    /// Scalar identifier is empty or uses a reserved prefix
    #[error("invalid entity identifier: '{0}'")]
    InvalidIdentifier(String),

    /// List filter name or parameter is malformed
    #[error("invalid list selector: {0}")]
    InvalidSelector(String),

    /// Alias is not registered on the resource
    #[error("unknown alias: '{0}'")]
    UnknownAlias(String),

    /// Key shape does not fit the resource flavor
    #[error("{flavor} resource cannot address key '{key}'")]
    WrongShape {
        /// Resource flavor
        flavor: String,
        /// Key as given
        key: String,
    },

    /// Canonical string could not be parsed
    #[error("malformed key '{0}'")]
    Malformed(String),
}

impl KeyFormatError {
    /// Create a wrong-shape error
    pub fn wrong_shape(flavor: impl std::fmt::Display, key: impl std::fmt::Display) -> Self {
        Self::WrongShape {
            flavor: flavor.to_string(),
            key: key.to_string(),
        }
    }
}
