//! Lifecycle executors
//!
//! A resource publishes its lifecycle through [`Executor`]s: item updated,
//! item deleted, item moved, data outdated, data updated. Subscribers run
//! synchronously, in subscription order, on the task that caused the change,
//! so a caller that awaits an operation observes every downstream effect of
//! it once the await returns.

use parking_lot::RwLock;
use rescache_key::NormalizedKey;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Handle for removing a subscription
///
/// Unique across every executor in the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

static NEXT_SUBSCRIPTION: AtomicU64 = AtomicU64::new(1);

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Publish/subscribe point for one kind of lifecycle event
pub struct Executor<E> {
    handlers: RwLock<Vec<(SubscriptionId, Handler<E>)>>,
}

impl<E> Executor<E> {
    /// Create executor with no subscribers
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Register a handler
    pub fn subscribe(&self, handler: impl Fn(&E) + Send + Sync + 'static) -> SubscriptionId {
        self.subscribe_arc(Arc::new(handler))
    }

    /// Register a shared handler
    pub fn subscribe_arc(&self, handler: Handler<E>) -> SubscriptionId {
        let id = SubscriptionId(NEXT_SUBSCRIPTION.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().push((id, handler));
        id
    }

    /// Remove a handler; returns false if it was not registered
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|(sid, _)| *sid != id);
        handlers.len() != before
    }

    /// Number of subscribers
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    /// Check if nobody listens
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    /// Deliver an event to every subscriber
    ///
    /// The handler list is snapshotted first, so handlers may subscribe or
    /// unsubscribe while being called.
    pub fn emit(&self, event: &E) {
        let snapshot: Vec<Handler<E>> = self.handlers.read().iter().map(|(_, h)| Arc::clone(h)).collect();
        for handler in snapshot {
            handler(event);
        }
    }
}

impl<E> Default for Executor<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for Executor<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor").field("subscribers", &self.len()).finish()
    }
}

/// An item's value changed
#[derive(Debug, Clone)]
pub struct ItemUpdate<V> {
    /// Item key
    pub key: NormalizedKey,
    /// New value
    pub value: Arc<V>,
}

/// A key was deleted, or a key's data (re)loaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEvent {
    /// Affected key
    pub key: NormalizedKey,
}

/// Keys were marked outdated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutdateEvent {
    /// Every key marked, including the requested one
    pub keys: Vec<NormalizedKey>,
}

/// An item was relabelled by a move
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveEvent {
    /// Key before the move
    pub from: NormalizedKey,
    /// Key after the move
    pub to: NormalizedKey,
}

/// The executors a resource exposes
#[derive(Debug)]
pub struct Lifecycle<V> {
    pub(crate) item_update: Executor<ItemUpdate<V>>,
    pub(crate) item_delete: Executor<KeyEvent>,
    pub(crate) item_move: Executor<MoveEvent>,
    pub(crate) data_outdated: Executor<OutdateEvent>,
    pub(crate) data_update: Executor<KeyEvent>,
}

impl<V> Lifecycle<V> {
    /// Remove a subscription from whichever executor holds it
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.item_update.unsubscribe(id)
            || self.item_delete.unsubscribe(id)
            || self.item_move.unsubscribe(id)
            || self.data_outdated.unsubscribe(id)
            || self.data_update.unsubscribe(id)
    }
}

impl<V> Default for Lifecycle<V> {
    fn default() -> Self {
        Self {
            item_update: Executor::new(),
            item_delete: Executor::new(),
            item_move: Executor::new(),
            data_outdated: Executor::new(),
            data_update: Executor::new(),
        }
    }
}
