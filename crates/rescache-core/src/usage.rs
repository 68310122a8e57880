//! Use tracker
//!
//! Reference counts of active consumers per key. The reconciler asks
//! [`UseTracker::is_in_use`] to choose between eager handling (someone is
//! looking: handshake, then reload) and lazy handling (just outdate).
//!
//! A consumer holds a [`UseGuard`]; dropping it frees the use. When a tree
//! move relabels a key, the guard's binding is updated and the consumer can
//! await [`UseGuard::changed`] to rebind its view.

use crate::error::UseError;
use dashmap::DashMap;
use rescache_key::{CacheKey, KeyModel, ListKey, NormalizedKey, TreePath};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

/// Identifier of one active use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UseId(Uuid);

impl UseId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for UseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Active uses per key
#[derive(Debug)]
pub struct UseTracker {
    model: Arc<KeyModel>,
    uses: DashMap<NormalizedKey, HashMap<UseId, watch::Sender<NormalizedKey>>>,
}

impl UseTracker {
    /// Create tracker for a resource's key model
    #[must_use]
    pub fn new(model: Arc<KeyModel>) -> Self {
        Self {
            model,
            uses: DashMap::new(),
        }
    }

    /// Start using a key; the use ends when the guard drops
    #[must_use]
    pub fn use_key(self: &Arc<Self>, key: NormalizedKey) -> UseGuard {
        let (id, binding) = self.acquire(key);
        UseGuard {
            tracker: Arc::clone(self),
            id,
            binding,
            released: false,
        }
    }

    /// Start using a key without a guard
    ///
    /// The caller must pair this with [`UseTracker::free`].
    pub fn acquire(&self, key: NormalizedKey) -> (UseId, watch::Receiver<NormalizedKey>) {
        let id = UseId::new();
        let (tx, rx) = watch::channel(key.clone());
        self.uses.entry(key).or_default().insert(id, tx);
        (id, rx)
    }

    /// End a use
    ///
    /// # Errors
    /// `UseError::UnknownUse` if `id` is not an active use of `key`
    pub fn free(&self, key: &NormalizedKey, id: UseId) -> Result<(), UseError> {
        let unknown = || UseError::UnknownUse {
            key: key.canonical().to_string(),
            id: id.to_string(),
        };
        let mut entry = self.uses.get_mut(key).ok_or_else(unknown)?;
        entry.remove(&id).ok_or_else(unknown)?;
        let empty = entry.is_empty();
        drop(entry);
        if empty {
            self.uses.remove_if(key, |_, m| m.is_empty());
        }
        Ok(())
    }

    /// Check if any active use overlaps `key`
    #[must_use]
    pub fn is_in_use(&self, key: &NormalizedKey) -> bool {
        self.overlapping(key) > 0
    }

    /// Number of active uses overlapping `key`
    #[must_use]
    pub fn overlapping(&self, key: &NormalizedKey) -> usize {
        self.uses
            .iter()
            .filter(|e| self.model.overlaps(e.key().key(), key.key()))
            .map(|e| e.value().len())
            .sum()
    }

    /// Number of active uses of exactly `key`
    #[must_use]
    pub fn refcount(&self, key: &NormalizedKey) -> usize {
        self.uses.get(key).map_or(0, |m| m.len())
    }

    /// Relabel uses under a moved path and notify their consumers
    ///
    /// Returns the number of uses rebound.
    pub fn rebind(&self, from: &TreePath, to: &TreePath) -> usize {
        let scope = CacheKey::Path(from.clone());
        let moved: Vec<NormalizedKey> = self
            .uses
            .iter()
            .filter(|e| self.model.contains(&scope, e.key().key()))
            .map(|e| e.key().clone())
            .collect();

        let mut count = 0;
        for old in moved {
            let Some(new) = rebase(&old, from, to) else {
                continue;
            };
            let Some((_, senders)) = self.uses.remove(&old) else {
                continue;
            };
            for tx in senders.values() {
                tx.send_replace(new.clone());
            }
            count += senders.len();
            self.uses.entry(new).or_default().extend(senders);
        }
        count
    }
}

fn rebase(key: &NormalizedKey, from: &TreePath, to: &TreePath) -> Option<NormalizedKey> {
    match key.key() {
        CacheKey::Path(p) => p.rebase(from, to).map(NormalizedKey::from),
        CacheKey::List(ListKey::Children(p)) => p.rebase(from, to).map(|p| ListKey::Children(p).into()),
        _ => None,
    }
}

/// Active use of a key; frees the use on drop
#[derive(Debug)]
pub struct UseGuard {
    tracker: Arc<UseTracker>,
    id: UseId,
    binding: watch::Receiver<NormalizedKey>,
    released: bool,
}

impl UseGuard {
    /// Use id
    #[inline]
    #[must_use]
    pub fn id(&self) -> UseId {
        self.id
    }

    /// Key currently used (follows moves)
    #[must_use]
    pub fn key(&self) -> NormalizedKey {
        self.binding.borrow().clone()
    }

    /// Wait until the key is relabelled by a move
    ///
    /// Returns the new key, or `None` if the tracker went away.
    pub async fn changed(&mut self) -> Option<NormalizedKey> {
        self.binding.changed().await.ok()?;
        Some(self.binding.borrow_and_update().clone())
    }

    /// Free the use now
    ///
    /// # Errors
    /// `UseError::UnknownUse` if the use was already freed through the tracker
    pub fn release(mut self) -> Result<(), UseError> {
        self.released = true;
        self.tracker.free(&self.key(), self.id)
    }
}

impl Drop for UseGuard {
    fn drop(&mut self) {
        if !self.released {
            let _ = self.tracker.free(&self.key(), self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rescache_key::KeyFlavor;

    fn flat() -> Arc<UseTracker> {
        Arc::new(UseTracker::new(Arc::new(KeyModel::new(KeyFlavor::Flat))))
    }

    fn tree() -> Arc<UseTracker> {
        Arc::new(UseTracker::new(Arc::new(KeyModel::new(KeyFlavor::Tree))))
    }

    fn key(flavor: KeyFlavor, s: &str) -> NormalizedKey {
        KeyModel::new(flavor).normalize_str(s).unwrap()
    }

    #[test]
    fn guard_counts_and_frees() {
        let tracker = flat();
        let p1 = key(KeyFlavor::Flat, "P1");
        let a = tracker.use_key(p1.clone());
        let b = tracker.use_key(p1.clone());
        assert_eq!(tracker.refcount(&p1), 2);
        drop(a);
        assert!(tracker.is_in_use(&p1));
        drop(b);
        assert!(!tracker.is_in_use(&p1));
        assert_eq!(tracker.refcount(&p1), 0);
    }

    #[test]
    fn free_unknown_use_fails() {
        let tracker = flat();
        let p1 = key(KeyFlavor::Flat, "P1");
        let (id, _rx) = tracker.acquire(p1.clone());
        assert!(tracker.free(&p1, id).is_ok());
        assert!(matches!(tracker.free(&p1, id), Err(UseError::UnknownUse { .. })));
    }

    #[test]
    fn release_then_drop_does_not_double_free() {
        let tracker = flat();
        let p1 = key(KeyFlavor::Flat, "P1");
        let keep = tracker.use_key(p1.clone());
        let guard = tracker.use_key(p1.clone());
        guard.release().unwrap();
        assert_eq!(tracker.refcount(&p1), 1);
        drop(keep);
    }

    #[test]
    fn list_use_covers_members() {
        let tracker = flat();
        let _all = tracker.use_key(key(KeyFlavor::Flat, "@all"));
        assert!(tracker.is_in_use(&key(KeyFlavor::Flat, "P9")));
    }

    #[tokio::test]
    async fn rebind_follows_move() {
        let tracker = tree();
        let mut guard = tracker.use_key(key(KeyFlavor::Tree, "docs/a.txt"));
        let _other = tracker.use_key(key(KeyFlavor::Tree, "other"));

        let n = tracker.rebind(&"docs".parse().unwrap(), &"archive/docs".parse().unwrap());
        assert_eq!(n, 1);
        let new = guard.changed().await.unwrap();
        assert_eq!(new.canonical(), "archive/docs/a.txt");
        assert!(!tracker.is_in_use(&key(KeyFlavor::Tree, "docs/a.txt")));
        assert_eq!(tracker.refcount(&key(KeyFlavor::Tree, "archive/docs/a.txt")), 1);

        drop(guard);
        assert_eq!(tracker.refcount(&key(KeyFlavor::Tree, "archive/docs/a.txt")), 0);
    }
}
