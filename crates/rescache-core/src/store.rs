//! Entity store
//!
//! Per-resource associative store mapping a [`NormalizedKey`] to a value and
//! its lifecycle state. Item keys (entities, tree paths) hold values; list
//! keys hold the ordered keys of their members.
//!
//! The store is a plain data structure: it never awaits and never calls out.
//! Every mutating method returns a [`StoreChanges`] summary that the owning
//! resource turns into lifecycle events after releasing its lock.
//!
//! # Outdate generations
//!
//! Each `mark_outdated` bumps a store-wide generation. Slots remember the
//! generation they were last outdated at, and outdated list keys are
//! remembered even when nothing is cached under them yet. A fetch records the
//! generation at which it started; if the outdate generation of its key has
//! moved past that when the result arrives, the result is discarded. This is
//! what keeps a fetch that raced an outdate signal from resurrecting stale
//! data, including for entities that were not cached when the signal came.

use crate::error::ResourceError;
use rescache_key::{CacheKey, KeyModel, ListKey, NormalizedKey, TreePath};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Lifecycle state of a cache entry
#[derive(Debug, Clone)]
pub enum EntryState {
    /// Loaded and trustworthy
    Fresh,
    /// Readable but due for refresh
    Outdated,
    /// A fetch is in flight
    Loading,
    /// Last fetch failed; kept until refreshed or outdated
    Errored(ResourceError),
}

impl EntryState {
    /// Check for `Fresh`
    #[inline]
    #[must_use]
    pub fn is_fresh(&self) -> bool {
        matches!(self, Self::Fresh)
    }

    /// Check for `Outdated`
    #[inline]
    #[must_use]
    pub fn is_outdated(&self) -> bool {
        matches!(self, Self::Outdated)
    }

    /// Check for `Loading`
    #[inline]
    #[must_use]
    pub fn is_loading(&self) -> bool {
        matches!(self, Self::Loading)
    }

    /// Stored failure, if errored
    #[inline]
    #[must_use]
    pub fn error(&self) -> Option<&ResourceError> {
        match self {
            Self::Errored(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fresh => f.write_str("fresh"),
            Self::Outdated => f.write_str("outdated"),
            Self::Loading => f.write_str("loading"),
            Self::Errored(_) => f.write_str("errored"),
        }
    }
}

#[derive(Debug, Clone)]
struct Slot<V> {
    value: Option<Arc<V>>,
    members: Option<Vec<NormalizedKey>>,
    state: EntryState,
    outdated_at: u64,
}

impl<V> Slot<V> {
    fn empty(state: EntryState) -> Self {
        Self {
            value: None,
            members: None,
            state,
            outdated_at: 0,
        }
    }

    fn mark_outdated(&mut self, generation: u64) {
        self.state = EntryState::Outdated;
        self.outdated_at = generation;
    }
}

/// Summary of what a store mutation changed
#[derive(Debug, Clone)]
pub struct StoreChanges<V> {
    /// Items written, with their new value
    pub updated: Vec<(NormalizedKey, Arc<V>)>,
    /// Keys removed
    pub deleted: Vec<NormalizedKey>,
    /// Items relabelled by a move
    pub moved: Vec<(NormalizedKey, NormalizedKey)>,
    /// Keys marked outdated
    pub outdated: Vec<NormalizedKey>,
    /// Key whose fetch landed
    pub loaded: Option<NormalizedKey>,
    /// Fetch result was dropped because its key was outdated meanwhile
    pub discarded: bool,
}

impl<V> Default for StoreChanges<V> {
    fn default() -> Self {
        Self {
            updated: Vec::new(),
            deleted: Vec::new(),
            moved: Vec::new(),
            outdated: Vec::new(),
            loaded: None,
            discarded: false,
        }
    }
}

impl<V> StoreChanges<V> {
    /// Check if nothing changed
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.updated.is_empty()
            && self.deleted.is_empty()
            && self.moved.is_empty()
            && self.outdated.is_empty()
            && self.loaded.is_none()
    }
}

/// Per-resource entity store
#[derive(Debug)]
pub struct EntityStore<V> {
    model: Arc<KeyModel>,
    slots: BTreeMap<NormalizedKey, Slot<V>>,
    outdated_scopes: BTreeMap<NormalizedKey, u64>,
    generation: u64,
}

impl<V> EntityStore<V> {
    /// Create empty store bound to a key model
    #[must_use]
    pub fn new(model: Arc<KeyModel>) -> Self {
        Self {
            model,
            slots: BTreeMap::new(),
            outdated_scopes: BTreeMap::new(),
            generation: 0,
        }
    }

    /// Key model of the owning resource
    #[inline]
    #[must_use]
    pub fn model(&self) -> &KeyModel {
        &self.model
    }

    /// Cached value of an item
    #[must_use]
    pub fn get(&self, key: &NormalizedKey) -> Option<Arc<V>> {
        self.slots.get(key).and_then(|s| s.value.clone())
    }

    /// Check if an item has a cached value (possibly outdated)
    #[must_use]
    pub fn has(&self, key: &NormalizedKey) -> bool {
        self.slots.get(key).is_some_and(|s| s.value.is_some())
    }

    /// State of an entry, `None` if absent
    #[must_use]
    pub fn state(&self, key: &NormalizedKey) -> Option<EntryState> {
        self.slots.get(key).map(|s| s.state.clone())
    }

    /// Check if an entry exists and is outdated
    ///
    /// Absent keys are not outdated: there is no entry to be stale.
    #[must_use]
    pub fn is_outdated(&self, key: &NormalizedKey) -> bool {
        self.slots.get(key).is_some_and(|s| s.state.is_outdated())
    }

    /// Number of entries, lists included
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Check if the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// All cached keys in order
    pub fn keys(&self) -> impl Iterator<Item = &NormalizedKey> {
        self.slots.keys()
    }

    /// Current outdate generation
    #[inline]
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Members of a list entry in stored order, `None` if never loaded
    #[must_use]
    pub fn members(&self, scope: &NormalizedKey) -> Option<Vec<NormalizedKey>> {
        self.slots.get(scope).and_then(|s| s.members.clone())
    }

    /// Cached members of a list entry with their values
    ///
    /// Members whose value is gone are skipped.
    #[must_use]
    pub fn member_values(&self, scope: &NormalizedKey) -> Option<Vec<(NormalizedKey, Arc<V>)>> {
        let members = self.slots.get(scope)?.members.as_ref()?;
        Some(
            members
                .iter()
                .filter_map(|k| self.get(k).map(|v| (k.clone(), v)))
                .collect(),
        )
    }

    /// Cached items structurally inside a key (or equal to it)
    #[must_use]
    pub fn items_within(&self, key: &NormalizedKey) -> Vec<(NormalizedKey, Arc<V>)> {
        self.slots
            .iter()
            .filter(|(k, _)| k.is_item() && self.model.contains(key.key(), k.key()))
            .filter_map(|(k, s)| s.value.clone().map(|v| (k.clone(), v)))
            .collect()
    }

    /// Highest generation at which `key` was outdated, directly or through a
    /// remembered list that contains it
    #[must_use]
    pub fn outdate_generation(&self, key: &NormalizedKey) -> u64 {
        let own = self.slots.get(key).map_or(0, |s| s.outdated_at);
        let scoped = self
            .outdated_scopes
            .iter()
            .filter(|(scope, _)| self.scope_holds(scope, key))
            .map(|(_, g)| *g)
            .max()
            .unwrap_or(0);
        own.max(scoped)
    }

    fn scope_holds(&self, scope: &NormalizedKey, key: &NormalizedKey) -> bool {
        scope == key
            || self.model.contains(scope.key(), key.key())
            || self
                .slots
                .get(scope)
                .and_then(|s| s.members.as_ref())
                .is_some_and(|m| m.contains(key))
    }

    /// Mark a key and everything it holds as outdated
    ///
    /// Outdating a list also remembers the list itself, so entities fetched
    /// by loads that started before this call are treated as outdated when
    /// they land, even if they were not cached yet.
    pub fn mark_outdated(&mut self, key: &NormalizedKey) -> StoreChanges<V> {
        self.generation += 1;
        let generation = self.generation;
        if key.is_scope() {
            self.outdated_scopes.insert(key.clone(), generation);
        }

        let targets: Vec<NormalizedKey> = self
            .slots
            .keys()
            .filter(|k| self.scope_holds(key, k))
            .cloned()
            .collect();

        let mut changes = StoreChanges::default();
        for k in targets {
            if let Some(slot) = self.slots.get_mut(&k) {
                slot.mark_outdated(generation);
                changes.outdated.push(k);
            }
        }
        changes
    }

    /// Record that a fetch for `key` is starting
    ///
    /// Returns the generation the fetch is issued at.
    pub fn begin_load(&mut self, key: &NormalizedKey) -> u64 {
        self.slots
            .entry(key.clone())
            .or_insert_with(|| Slot::empty(EntryState::Loading))
            .state = EntryState::Loading;
        self.generation
    }

    /// Record a failed fetch
    ///
    /// The entry keeps its last value; it becomes `Errored` unless it was
    /// outdated while the fetch was in flight.
    pub fn fail_load(&mut self, key: &NormalizedKey, issued: u64, error: ResourceError) {
        let stale = self.outdate_generation(key) > issued;
        if let Some(slot) = self.slots.get_mut(key) {
            slot.state = if stale {
                EntryState::Outdated
            } else {
                EntryState::Errored(error)
            };
        }
    }

    /// Apply the result of a fetch issued at generation `issued`
    ///
    /// Item fetches write the returned items; an item the remote no longer
    /// has is removed and remembered as known-absent. List fetches write
    /// their members, and exhaustive lists (`All`, `Children`) drop cached
    /// items in their scope that were not returned.
    pub fn apply_fetch(
        &mut self,
        target: &NormalizedKey,
        issued: u64,
        items: Vec<(NormalizedKey, Arc<V>)>,
    ) -> StoreChanges<V> {
        let mut changes = StoreChanges::default();
        if self.outdate_generation(target) > issued {
            if let Some(slot) = self.slots.get_mut(target) {
                if slot.state.is_loading() {
                    slot.state = EntryState::Outdated;
                }
            }
            changes.discarded = true;
            return changes;
        }

        let returned: HashSet<NormalizedKey> = items.iter().map(|(k, _)| k.clone()).collect();
        let mut members = Vec::new();
        for (key, value) in items {
            let state = if self.outdate_generation(&key) > issued {
                EntryState::Outdated
            } else {
                EntryState::Fresh
            };
            if target.is_scope() && (!self.is_exhaustive(target) || self.model.contains(target.key(), key.key())) {
                members.push(key.clone());
            }
            self.write_item(key, value, state, &mut changes);
        }

        if target.is_item() {
            if !returned.contains(target) {
                self.remove_item(target, &mut changes);
                self.slots.insert(target.clone(), Slot::empty(EntryState::Fresh));
            }
        } else {
            if self.is_exhaustive(target) {
                let stale: Vec<NormalizedKey> = self
                    .slots
                    .keys()
                    .filter(|k| k.is_item() && !returned.contains(*k) && self.model.contains(target.key(), k.key()))
                    .cloned()
                    .collect();
                for key in stale {
                    self.remove_item(&key, &mut changes);
                }
            }
            let slot = self
                .slots
                .entry(target.clone())
                .or_insert_with(|| Slot::empty(EntryState::Fresh));
            slot.members = Some(members);
            slot.state = EntryState::Fresh;

            let model = Arc::clone(&self.model);
            self.outdated_scopes
                .retain(|scope, g| !(*g <= issued && model.contains(target.key(), scope.key())));
        }

        changes.loaded = Some(target.clone());
        changes
    }

    /// Write an item value as fresh
    pub fn set(&mut self, key: &NormalizedKey, value: Arc<V>) -> StoreChanges<V> {
        let mut changes = StoreChanges::default();
        self.write_item(key.clone(), value, EntryState::Fresh, &mut changes);
        changes
    }

    /// Remove an item (and, for tree paths, everything below it)
    pub fn delete(&mut self, key: &NormalizedKey) -> StoreChanges<V> {
        let mut changes = StoreChanges::default();
        if key.is_scope() {
            if self.slots.remove(key).is_some() {
                changes.deleted.push(key.clone());
            }
        } else {
            self.remove_item(key, &mut changes);
        }
        changes
    }

    /// Relabel every entry under `from` to live under `to`
    ///
    /// Children lists keep their order. Entries already cached under `to` are
    /// replaced. The caller validates that the paths do not overlap.
    pub fn relabel(&mut self, from: &TreePath, to: &TreePath) -> StoreChanges<V> {
        let mut changes = StoreChanges::default();
        let from_scope = CacheKey::Path(from.clone());
        let to_scope = CacheKey::Path(to.clone());
        let from_key = NormalizedKey::from(from.clone());
        let to_key = NormalizedKey::from(to.clone());

        // Destination entries are overwritten by the moved subtree.
        if self.slots.contains_key(&to_key) || self.slots.keys().any(|k| self.model.contains(&to_scope, k.key())) {
            self.remove_item(&to_key, &mut changes);
        }

        // Detach from the old parent before rebasing member lists.
        if let Some(parent) = from.parent() {
            let parent_scope = NormalizedKey::from(ListKey::Children(parent));
            if let Some(members) = self.slots.get_mut(&parent_scope).and_then(|s| s.members.as_mut()) {
                members.retain(|m| m != &from_key);
            }
        }

        let affected: Vec<NormalizedKey> = self
            .slots
            .keys()
            .filter(|k| self.model.contains(&from_scope, k.key()))
            .cloned()
            .collect();
        let mut moved_slots = Vec::with_capacity(affected.len());
        for old in affected {
            if let Some(slot) = self.slots.remove(&old) {
                moved_slots.push((old, slot));
            }
        }
        for (old, slot) in moved_slots {
            let Some(new) = rebase_key(&old, from, to) else {
                continue;
            };
            if old.is_item() {
                changes.moved.push((old, new.clone()));
            }
            self.slots.insert(new, slot);
        }

        for slot in self.slots.values_mut() {
            if let Some(members) = slot.members.as_mut() {
                for member in members.iter_mut() {
                    if let Some(new) = rebase_key(member, from, to) {
                        *member = new;
                    }
                }
            }
        }

        let remembered: Vec<(NormalizedKey, u64)> = self
            .outdated_scopes
            .iter()
            .filter(|(k, _)| self.model.contains(&from_scope, k.key()))
            .map(|(k, g)| (k.clone(), *g))
            .collect();
        for (old, generation) in remembered {
            self.outdated_scopes.remove(&old);
            if let Some(new) = rebase_key(&old, from, to) {
                self.outdated_scopes.insert(new, generation);
            }
        }

        if self.slots.contains_key(&to_key) {
            self.link(&to_key);
        }
        changes
    }

    fn is_exhaustive(&self, scope: &NormalizedKey) -> bool {
        scope.as_list().is_some_and(ListKey::is_exhaustive)
    }

    fn write_item(&mut self, key: NormalizedKey, value: Arc<V>, state: EntryState, changes: &mut StoreChanges<V>) {
        let slot = self
            .slots
            .entry(key.clone())
            .or_insert_with(|| Slot::empty(EntryState::Fresh));
        slot.value = Some(Arc::clone(&value));
        slot.state = state;
        self.link(&key);
        changes.updated.push((key, value));
    }

    /// Append an item to the cached exhaustive list that should hold it
    fn link(&mut self, key: &NormalizedKey) {
        let scope = match key.key() {
            CacheKey::Path(path) => match path.parent() {
                Some(parent) => NormalizedKey::from(ListKey::Children(parent)),
                None => return,
            },
            _ => NormalizedKey::from(ListKey::All),
        };
        if let Some(members) = self.slots.get_mut(&scope).and_then(|s| s.members.as_mut()) {
            if !members.contains(key) {
                members.push(key.clone());
            }
        }
    }

    fn remove_item(&mut self, key: &NormalizedKey, changes: &mut StoreChanges<V>) {
        let doomed: Vec<NormalizedKey> = self
            .slots
            .keys()
            .filter(|k| *k == key || self.model.contains(key.key(), k.key()))
            .cloned()
            .collect();
        for k in &doomed {
            if let Some(slot) = self.slots.remove(k) {
                if slot.value.is_some() || k.is_scope() {
                    changes.deleted.push(k.clone());
                }
            }
        }
        if doomed.is_empty() {
            return;
        }
        let doomed: HashSet<NormalizedKey> = doomed.into_iter().collect();
        for slot in self.slots.values_mut() {
            if let Some(members) = slot.members.as_mut() {
                members.retain(|m| !doomed.contains(m));
            }
        }
    }
}

fn rebase_key(key: &NormalizedKey, from: &TreePath, to: &TreePath) -> Option<NormalizedKey> {
    match key.key() {
        CacheKey::Path(path) => path.rebase(from, to).map(NormalizedKey::from),
        CacheKey::List(ListKey::Children(parent)) => parent
            .rebase(from, to)
            .map(|p| NormalizedKey::from(ListKey::Children(p))),
        _ => None,
    }
}
