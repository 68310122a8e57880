//! rescache key model
//!
//! Keys address data held by a resource cache.
//!
//! # Overview
//!
//! - **CacheKey**: scalar, list, tree-path or alias key
//! - **TreePath**: slash-delimited path with structural ancestry
//! - **KeyModel**: per-resource alias resolution, normalization and
//!   containment/overlap predicates
//!
//! # Example
//!
//! ```rust
//! use rescache_key::{CacheKey, KeyFlavor, KeyModel};
//!
//! let model = KeyModel::new(KeyFlavor::Tree);
//! let docs = CacheKey::path("docs").unwrap();
//! let file = CacheKey::path("docs/a.txt").unwrap();
//!
//! assert!(model.contains(&docs, &file));
//! assert_eq!(model.normalize(&CacheKey::all()).unwrap().canonical(), "@all");
//! ```

#![warn(missing_docs)]

pub mod error;
pub mod key;
pub mod model;
pub mod path;

// Re-exports
pub use error::KeyFormatError;
pub use key::{Alias, CacheKey, EntityId, ListKey};
pub use model::{KeyFlavor, KeyModel, NormalizedKey};
pub use path::TreePath;

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
